use crate::error::{Error, Result};
use crate::types::{Key, LayoutId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const APP_DIR: &str = "tsswitch";
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeySettings {
    pub trigger: Key,
    pub confirm: Key,
    pub probe_modifier: Key,
    #[serde(default = "default_chord_window_ms")]
    pub chord_window_ms: u64,
    #[serde(default = "default_probe_debounce_ms")]
    pub probe_debounce_ms: u64,
}

fn default_chord_window_ms() -> u64 {
    500
}

fn default_probe_debounce_ms() -> u64 {
    200
}

impl Default for HotkeySettings {
    fn default() -> Self {
        Self {
            trigger: Key::Ctrl,
            confirm: Key::Space,
            probe_modifier: Key::Shift,
            chord_window_ms: default_chord_window_ms(),
            probe_debounce_ms: default_probe_debounce_ms(),
        }
    }
}

impl HotkeySettings {
    pub fn chord_window(&self) -> Duration {
        Duration::from_millis(self.chord_window_ms)
    }

    pub fn probe_debounce(&self) -> Duration {
        Duration::from_millis(self.probe_debounce_ms)
    }
}

/// Where the output-mode value lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Parent key whose numeric-version subkeys are scanned.
    pub version_root: String,
    /// Subkey appended to every discovered version.
    pub leaf: String,
    pub value_name: String,
    /// Tried after the discovered locations, in order.
    pub fallback_locations: Vec<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            version_root: r"Software\Microsoft\IME".to_string(),
            leaf: "IMETC".to_string(),
            value_name: "Enable Simplified Chinese Output".to_string(),
            fallback_locations: vec![r"Software\Microsoft\IME\15.0\IMETC".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToggleSettings {
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_backoff_ms")]
    pub verify_backoff_ms: u64,
}

fn default_read_retries() -> u32 {
    5
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_verify_backoff_ms() -> u64 {
    100
}

impl Default for ToggleSettings {
    fn default() -> Self {
        Self {
            read_retries: default_read_retries(),
            verify_attempts: default_verify_attempts(),
            verify_backoff_ms: default_verify_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSettings {
    pub target: LayoutId,
    /// Layout the refresher switches through.
    pub neutral: LayoutId,
    pub refresh_attempts: u32,
    pub refresh_delay_ms: u64,
    pub refresh_initial_delay_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            target: LayoutId(0x0404),
            neutral: LayoutId(0x0409),
            refresh_attempts: 4,
            refresh_delay_ms: 120,
            refresh_initial_delay_ms: 0,
            poll_interval_ms: 1000,
        }
    }
}

impl LayoutSettings {
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    pub fn refresh_initial_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_initial_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSettings {
    pub process_name: String,
    /// Full path; `None` resolves to `%SystemRoot%\System32\<process_name>`.
    pub path: Option<PathBuf>,
    /// Pause between the layout switches and the restart.
    pub settle_ms: u64,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            process_name: "ctfmon.exe".to_string(),
            path: None,
            settle_ms: 80,
        }
    }
}

impl HelperSettings {
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        let root = std::env::var_os("SystemRoot")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
        root.join("System32").join(&self.process_name)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IconPaths {
    pub default: Option<PathBuf>,
    pub simplified: Option<PathBuf>,
    pub traditional: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraySettings {
    /// Minimum time the neutral icon is shown after startup.
    pub hold_floor_ms: u64,
    pub icon_size: u32,
    pub icons: IconPaths,
}

impl Default for TraySettings {
    fn default() -> Self {
        Self {
            hold_floor_ms: 2000,
            icon_size: 32,
            icons: IconPaths::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorFixSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub cooldown_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for CursorFixSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 20,
            cooldown_ms: 100,
            join_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub hotkey: HotkeySettings,
    pub store: StoreSettings,
    pub toggle: ToggleSettings,
    pub layout: LayoutSettings,
    pub helper: HelperSettings,
    pub tray: TraySettings,
    pub cursor_fix: CursorFixSettings,
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Missing or broken files fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::load(path) {
            Ok(settings) => {
                info!("Loaded settings from {}", path.display());
                settings
            }
            Err(Error::NotFound(_)) => {
                info!("No settings at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                warn!("Ignoring settings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let hk = &self.hotkey;
        if hk.trigger == hk.confirm {
            return Err(Error::Config(format!(
                "trigger and confirmation key are both '{}'",
                hk.trigger
            )));
        }
        if hk.trigger == hk.probe_modifier {
            return Err(Error::Config(format!(
                "probe modifier must differ from the trigger '{}'",
                hk.trigger
            )));
        }
        if hk.chord_window_ms == 0 {
            return Err(Error::Config("chord_window_ms must be positive".into()));
        }
        if self.store.value_name.is_empty() {
            return Err(Error::Config("store.value_name is empty".into()));
        }
        if self.toggle.verify_attempts == 0 {
            return Err(Error::Config("toggle.verify_attempts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let json = r#"{ "hotkey": { "confirm": "f" }, "toggle": { "verify_attempts": 7 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.hotkey.trigger, Key::Ctrl);
        assert_eq!(settings.hotkey.confirm, Key::Char('f'));
        assert_eq!(settings.hotkey.chord_window_ms, 500);
        assert_eq!(settings.toggle.verify_attempts, 7);
        assert_eq!(settings.toggle.read_retries, 5);
        assert_eq!(settings.layout.target, LayoutId(0x0404));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let mut settings = Settings::default();
        settings.tray.hold_floor_ms = 750;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.tray.hold_floor_ms, 750);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(matches!(Settings::load(&path), Err(Error::NotFound(_))));
        let settings = Settings::load_or_default(Some(&path));
        assert_eq!(settings.hotkey.confirm, Key::Space);
    }

    #[test]
    fn malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Json(_))));
        assert_eq!(Settings::load_or_default(Some(&path)).toggle.read_retries, 5);
    }

    #[test]
    fn clashing_keys_are_rejected() {
        let json = r#"{ "hotkey": { "trigger": "shift", "confirm": "shift" } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }
}
