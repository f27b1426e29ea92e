//! Persisted output-mode value and the set of places it may live.

use crate::config::StoreSettings;
use crate::error::{Error, Result};
use crate::types::OutputMode;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A value as it came out of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Dword(u32),
    String(String),
}

/// How a string value spells its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringStyle {
    /// `0x00000001`
    Hex,
    /// `1`
    Decimal,
}

/// Native storage type, remembered per location so writes keep it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Dword,
    String(StringStyle),
}

impl RawValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Dword(_) => ValueKind::Dword,
            Self::String(s) if has_hex_prefix(s.trim()) => ValueKind::String(StringStyle::Hex),
            Self::String(_) => ValueKind::String(StringStyle::Decimal),
        }
    }

    pub fn encode(kind: ValueKind, raw: u32) -> Self {
        match kind {
            ValueKind::Dword => Self::Dword(raw),
            ValueKind::String(StringStyle::Hex) => Self::String(format!("0x{raw:08X}")),
            ValueKind::String(StringStyle::Decimal) => Self::String(raw.to_string()),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dword(v) => write!(f, "dword:{v}"),
            Self::String(s) => write!(f, "sz:{s:?}"),
        }
    }
}

fn has_hex_prefix(s: &str) -> bool {
    s.starts_with("0x") || s.starts_with("0X")
}

/// Accepts integer 0/1, "0"/"1" and hex strings encoding 0/1.
pub fn coerce_to_mode(raw: &RawValue) -> OutputMode {
    match raw {
        RawValue::Dword(v) => OutputMode::from_raw(*v),
        RawValue::String(s) => {
            let s = s.trim();
            let parsed = if has_hex_prefix(s) {
                let digits = &s[2..];
                // from_str_radix would also take a sign
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit()) {
                    u32::from_str_radix(digits, 16).ok()
                } else {
                    None
                }
            } else {
                match s {
                    "0" => Some(0),
                    "1" => Some(1),
                    _ => None,
                }
            };
            parsed.map_or(OutputMode::Unknown, OutputMode::from_raw)
        }
    }
}

/// Registry access the store needs. Paths are relative to HKEY_CURRENT_USER.
pub trait RegistryBackend: Send + Sync {
    fn read(&self, key: &str, name: &str) -> Result<Option<RawValue>>;
    fn write(&self, key: &str, name: &str, value: &RawValue) -> Result<()>;
    /// Creating an existing key is not an error.
    fn create_key(&self, key: &str) -> Result<()>;
    /// Missing key yields `NotFound`.
    fn subkeys(&self, key: &str) -> Result<Vec<String>>;
}

pub fn normalize_path(path: &str) -> String {
    path.replace('/', "\\")
        .trim_matches('\\')
        .split('\\')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\\")
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCandidate {
    pub path: String,
    pub priority: usize,
}

/// Ordered, deduplicated list of locations. Built once.
#[derive(Debug, Clone)]
pub struct StorageCandidates(Vec<StorageCandidate>);

impl StorageCandidates {
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for path in paths {
            let path = path.into();
            if seen.insert(normalize_path(&path)) {
                let priority = out.len();
                out.push(StorageCandidate { path, priority });
            }
        }
        Self(out)
    }

    /// Version-specific locations newest first, then the static fallbacks.
    pub fn discover(backend: &dyn RegistryBackend, settings: &StoreSettings) -> Self {
        let mut versions: Vec<(Vec<u32>, String)> = match backend.subkeys(&settings.version_root) {
            Ok(names) => names
                .into_iter()
                .filter_map(|name| parse_version(&name).map(|v| (v, name)))
                .collect(),
            Err(e) => {
                debug!("No version keys under {}: {}", settings.version_root, e);
                Vec::new()
            }
        };
        versions.sort_by(|a, b| b.0.cmp(&a.0));

        let discovered = versions
            .into_iter()
            .map(|(_, name)| format!("{}\\{}\\{}", settings.version_root, name, settings.leaf));
        let candidates = Self::from_paths(discovered.chain(settings.fallback_locations.iter().cloned()));
        info!(
            "Storage candidates: {:?}",
            candidates.iter().map(|c| c.path.as_str()).collect::<Vec<_>>()
        );
        candidates
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageCandidate> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&StorageCandidate> {
        self.0.first()
    }
}

fn parse_version(name: &str) -> Option<Vec<u32>> {
    let parts: Option<Vec<u32>> = name.split('.').map(|p| p.parse().ok()).collect();
    parts.filter(|p| !p.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedValue {
    pub location: String,
    pub raw: RawValue,
    pub kind: ValueKind,
}

impl PersistedValue {
    pub fn mode(&self) -> OutputMode {
        coerce_to_mode(&self.raw)
    }
}

pub struct ConfigStore {
    backend: Arc<dyn RegistryBackend>,
    candidates: StorageCandidates,
    value_name: String,
    /// Last native type seen per normalized location.
    observed: Mutex<HashMap<String, ValueKind>>,
}

impl ConfigStore {
    pub fn new(
        backend: Arc<dyn RegistryBackend>,
        candidates: StorageCandidates,
        value_name: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            candidates,
            value_name: value_name.into(),
            observed: Mutex::new(HashMap::new()),
        }
    }

    pub fn discover(backend: Arc<dyn RegistryBackend>, settings: &StoreSettings) -> Self {
        let candidates = StorageCandidates::discover(backend.as_ref(), settings);
        Self::new(backend, candidates, settings.value_name.clone())
    }

    /// First candidate holding the value.
    pub fn find(&self) -> Option<PersistedValue> {
        for candidate in self.candidates.iter() {
            match self.backend.read(&candidate.path, &self.value_name) {
                Ok(Some(raw)) => {
                    let kind = raw.kind();
                    self.observed
                        .lock()
                        .insert(normalize_path(&candidate.path), kind);
                    return Some(PersistedValue {
                        location: candidate.path.clone(),
                        raw,
                        kind,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("Reading {}\\{} failed: {}", candidate.path, self.value_name, e);
                    continue;
                }
            }
        }
        None
    }

    pub fn read_mode(&self) -> OutputMode {
        self.find().map_or(OutputMode::Unknown, |v| v.mode())
    }

    /// Writes `target` to the authoritative location, creating it if needed.
    pub fn write(&self, target: OutputMode) -> Result<String> {
        let raw = target
            .as_raw()
            .ok_or_else(|| Error::Config("cannot persist an unknown output mode".into()))?;

        let (location, kind) = match self.find() {
            Some(current) => (current.location, current.kind),
            None => {
                let first = self
                    .candidates
                    .first()
                    .ok_or_else(|| Error::NotFound("no storage candidates".into()))?;
                let kind = self
                    .observed
                    .lock()
                    .get(&normalize_path(&first.path))
                    .copied()
                    .unwrap_or(ValueKind::Dword);
                (first.path.clone(), kind)
            }
        };

        self.backend.create_key(&location)?;
        let value = RawValue::encode(kind, raw);
        self.backend.write(&location, &self.value_name, &value)?;
        self.observed.lock().insert(normalize_path(&location), kind);
        info!("Wrote {} ({}) to {}", target, value, location);
        Ok(location)
    }
}

/// In-process registry used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    keys: Mutex<HashMap<String, HashMap<String, RawValue>>>,
    read_only: Mutex<HashSet<String>>,
    writes: Mutex<u32>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, key: &str, name: &str, value: RawValue) -> Self {
        self.keys
            .lock()
            .entry(normalize_path(key))
            .or_default()
            .insert(name.to_string(), value);
        self
    }

    pub fn with_key(self, key: &str) -> Self {
        self.keys.lock().entry(normalize_path(key)).or_default();
        self
    }

    pub fn deny_writes(&self, key: &str) {
        self.read_only.lock().insert(normalize_path(key));
    }

    pub fn value(&self, key: &str, name: &str) -> Option<RawValue> {
        self.keys
            .lock()
            .get(&normalize_path(key))
            .and_then(|values| values.get(name).cloned())
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.lock().contains_key(&normalize_path(key))
    }

    pub fn write_count(&self) -> u32 {
        *self.writes.lock()
    }
}

impl RegistryBackend for MemoryRegistry {
    fn read(&self, key: &str, name: &str) -> Result<Option<RawValue>> {
        Ok(self.value(key, name))
    }

    fn write(&self, key: &str, name: &str, value: &RawValue) -> Result<()> {
        let norm = normalize_path(key);
        if self.read_only.lock().contains(&norm) {
            return Err(Error::PermissionDenied(key.to_string()));
        }
        let mut keys = self.keys.lock();
        let values = keys
            .get_mut(&norm)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        values.insert(name.to_string(), value.clone());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn create_key(&self, key: &str) -> Result<()> {
        self.keys.lock().entry(normalize_path(key)).or_default();
        Ok(())
    }

    fn subkeys(&self, key: &str) -> Result<Vec<String>> {
        let prefix = format!("{}\\", normalize_path(key));
        let keys = self.keys.lock();
        let mut names: Vec<String> = keys
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('\\').next())
            .map(str::to_string)
            .collect();
        if names.is_empty() && !keys.contains_key(&normalize_path(key)) {
            return Err(Error::NotFound(key.to_string()));
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALUE: &str = "Enable Simplified Chinese Output";

    fn store(registry: Arc<MemoryRegistry>) -> ConfigStore {
        ConfigStore::discover(registry, &StoreSettings::default())
    }

    #[test]
    fn coerce_accepts_every_known_spelling() {
        use OutputMode::*;
        let cases = [
            (RawValue::Dword(0), Traditional),
            (RawValue::Dword(1), Simplified),
            (RawValue::String("0".into()), Traditional),
            (RawValue::String("1".into()), Simplified),
            (RawValue::String("0x00000000".into()), Traditional),
            (RawValue::String("0x00000001".into()), Simplified),
            (RawValue::String("0X1".into()), Simplified),
        ];
        for (raw, expected) in cases {
            assert_eq!(coerce_to_mode(&raw), expected, "{raw}");
        }
    }

    #[test]
    fn coerce_rejects_everything_else() {
        let cases = [
            RawValue::Dword(2),
            RawValue::Dword(u32::MAX),
            RawValue::String(String::new()),
            RawValue::String("yes".into()),
            RawValue::String("0x".into()),
            RawValue::String("0x+1".into()),
            RawValue::String("0x-0".into()),
            RawValue::String("0x00000002".into()),
            RawValue::String("01".into()),
        ];
        for raw in cases {
            assert_eq!(coerce_to_mode(&raw), OutputMode::Unknown, "{raw}");
        }
    }

    #[test]
    fn candidates_put_newest_version_first_and_dedupe() {
        let registry = MemoryRegistry::new()
            .with_key(r"Software\Microsoft\IME\15.0\IMETC")
            .with_key(r"Software\Microsoft\IME\16.0")
            .with_key(r"Software\Microsoft\IME\9.2")
            .with_key(r"Software\Microsoft\IME\Settings");
        let candidates = StorageCandidates::discover(&registry, &StoreSettings::default());
        let paths: Vec<_> = candidates.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                r"Software\Microsoft\IME\16.0\IMETC",
                r"Software\Microsoft\IME\15.0\IMETC",
                r"Software\Microsoft\IME\9.2\IMETC",
            ]
        );
        assert_eq!(candidates.iter().map(|c| c.priority).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn normalize_ignores_case_and_separators() {
        assert_eq!(
            normalize_path(r"\Software/Microsoft\\IME\15.0\IMETC\"),
            r"software\microsoft\ime\15.0\imetc"
        );
    }

    #[test]
    fn find_returns_first_hit_in_priority_order() {
        let registry = Arc::new(
            MemoryRegistry::new()
                .with_key(r"Software\Microsoft\IME\16.0\IMETC")
                .with_value(r"Software\Microsoft\IME\15.0\IMETC", VALUE, RawValue::Dword(1)),
        );
        let store = store(registry.clone());
        let found = store.find().expect("value present");
        assert_eq!(found.location, r"Software\Microsoft\IME\15.0\IMETC");
        assert_eq!(found.mode(), OutputMode::Simplified);
    }

    #[test]
    fn write_keeps_hex_string_type() {
        let key = r"Software\Microsoft\IME\15.0\IMETC";
        let registry = Arc::new(MemoryRegistry::new().with_value(
            key,
            VALUE,
            RawValue::String("0x00000000".into()),
        ));
        let store = store(registry.clone());
        store.write(OutputMode::Simplified).unwrap();
        assert_eq!(
            registry.value(key, VALUE),
            Some(RawValue::String("0x00000001".into()))
        );
    }

    #[test]
    fn write_keeps_decimal_string_type() {
        let key = r"Software\Microsoft\IME\15.0\IMETC";
        let registry =
            Arc::new(MemoryRegistry::new().with_value(key, VALUE, RawValue::String("1".into())));
        let store = store(registry.clone());
        store.write(OutputMode::Traditional).unwrap();
        assert_eq!(registry.value(key, VALUE), Some(RawValue::String("0".into())));
    }

    #[test]
    fn write_without_value_creates_first_candidate_as_dword() {
        let registry = Arc::new(MemoryRegistry::new().with_key(r"Software\Microsoft\IME\16.0"));
        let store = store(registry.clone());
        assert!(store.find().is_none());

        let location = store.write(OutputMode::Simplified).unwrap();
        assert_eq!(location, r"Software\Microsoft\IME\16.0\IMETC");
        assert!(registry.has_key(&location));
        assert_eq!(registry.value(&location, VALUE), Some(RawValue::Dword(1)));
    }

    #[test]
    fn write_failure_is_reported_not_retried() {
        let key = r"Software\Microsoft\IME\15.0\IMETC";
        let registry = Arc::new(MemoryRegistry::new().with_value(key, VALUE, RawValue::Dword(0)));
        registry.deny_writes(key);
        let store = store(registry.clone());
        let err = store.write(OutputMode::Simplified).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(registry.write_count(), 0);
        assert_eq!(store.read_mode(), OutputMode::Traditional);
    }

    #[test]
    fn unknown_mode_is_never_written() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = store(registry.clone());
        assert!(store.write(OutputMode::Unknown).is_err());
        assert_eq!(registry.write_count(), 0);
    }
}
