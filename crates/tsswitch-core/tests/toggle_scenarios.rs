use std::sync::Arc;
use std::time::{Duration, Instant};
use tsswitch_core::chord::{ChordConfig, ChordEffect, HotkeyChordDetector};
use tsswitch_core::clock::ManualClock;
use tsswitch_core::config::{LayoutSettings, StoreSettings, ToggleSettings};
use tsswitch_core::layout_monitor::{FixedLayout, LayoutMonitor};
use tsswitch_core::orchestrator::{ModeToggleOrchestrator, ToggleOutcome};
use tsswitch_core::refresher::{LiveRefresh, NoRefresh};
use tsswitch_core::store::{coerce_to_mode, ConfigStore, MemoryRegistry, RawValue, RegistryBackend};
use tsswitch_core::{Key, KeyEvent, LayoutId, OutputMode, Result};

const VALUE: &str = "Enable Simplified Chinese Output";
const V15: &str = r"Software\Microsoft\IME\15.0\IMETC";
const V16: &str = r"Software\Microsoft\IME\16.0\IMETC";

/// Accepts writes but never lets them show up in reads.
struct StaleRegistry(MemoryRegistry);

impl RegistryBackend for StaleRegistry {
    fn read(&self, key: &str, name: &str) -> Result<Option<RawValue>> {
        self.0.read(key, name)
    }

    fn write(&self, _key: &str, _name: &str, _value: &RawValue) -> Result<()> {
        Ok(())
    }

    fn create_key(&self, key: &str) -> Result<()> {
        self.0.create_key(key)
    }

    fn subkeys(&self, key: &str) -> Result<Vec<String>> {
        self.0.subkeys(key)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn orchestrator(registry: Arc<dyn RegistryBackend>) -> (ModeToggleOrchestrator, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(ConfigStore::discover(registry, &StoreSettings::default()));
    let monitor = Arc::new(LayoutMonitor::with_clock(
        Arc::new(FixedLayout(LayoutId(0x0404))),
        LayoutSettings::default(),
        clock.clone(),
    ));
    let orchestrator = ModeToggleOrchestrator::with_clock(
        store,
        monitor,
        Arc::new(NoRefresh),
        ToggleSettings::default(),
        clock.clone(),
    );
    (orchestrator, clock)
}

#[test]
fn coerce_accepts_every_valid_spelling() {
    let cases = [
        (RawValue::Dword(0), OutputMode::Traditional),
        (RawValue::Dword(1), OutputMode::Simplified),
        (RawValue::String("0".into()), OutputMode::Traditional),
        (RawValue::String("1".into()), OutputMode::Simplified),
        (RawValue::String("0x00000000".into()), OutputMode::Traditional),
        (RawValue::String("0x00000001".into()), OutputMode::Simplified),
        (RawValue::Dword(2), OutputMode::Unknown),
        (RawValue::String("yes".into()), OutputMode::Unknown),
        (RawValue::String("0x2".into()), OutputMode::Unknown),
        (RawValue::String(String::new()), OutputMode::Unknown),
    ];
    for (raw, expected) in cases {
        assert_eq!(coerce_to_mode(&raw), expected, "{raw}");
    }
}

#[test]
fn toggle_twice_is_identity_for_hex_strings() {
    let registry = Arc::new(
        MemoryRegistry::new().with_value(V15, VALUE, RawValue::String("0x00000001".into())),
    );
    let (orchestrator, _) = orchestrator(registry.clone());

    orchestrator.toggle().unwrap();
    assert_eq!(
        registry.value(V15, VALUE),
        Some(RawValue::String("0x00000000".into()))
    );
    orchestrator.toggle().unwrap();
    assert_eq!(
        registry.value(V15, VALUE),
        Some(RawValue::String("0x00000001".into()))
    );
}

#[test]
fn absent_store_creates_simplified_at_highest_priority() {
    // 16.0 exists as a version but has no IMETC leaf yet
    let registry = Arc::new(MemoryRegistry::new().with_key(r"Software\Microsoft\IME\16.0"));
    let (orchestrator, _) = orchestrator(registry.clone());
    assert!(!registry.has_key(V16));

    let outcome = orchestrator.toggle().unwrap();
    match outcome {
        ToggleOutcome::Confirmed { mode, location, .. } => {
            assert_eq!(mode, OutputMode::Simplified);
            assert_eq!(location, V16);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(registry.has_key(V16));
    assert_eq!(registry.value(V16, VALUE), Some(RawValue::Dword(1)));
    assert_eq!(registry.value(V15, VALUE), None);
}

#[test]
fn unverified_write_is_degraded_success() {
    let inner = MemoryRegistry::new().with_value(V15, VALUE, RawValue::Dword(0));
    let (orchestrator, clock) = orchestrator(Arc::new(StaleRegistry(inner)));

    let outcome = orchestrator.toggle().unwrap();
    assert_eq!(
        outcome,
        ToggleOutcome::Unconfirmed {
            target: OutputMode::Simplified,
            observed: OutputMode::Traditional,
            location: V15.to_string(),
            refresh: NoRefresh.refresh_active_layout(),
        }
    );
    // three verify reads, two backoffs between them
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(100); 2]);
}

#[test]
fn intervening_key_breaks_the_chord() {
    let mut detector = HotkeyChordDetector::new(ChordConfig::default());
    let t0 = Instant::now();
    let ms = Duration::from_millis;
    let mut effects = Vec::new();
    for (key, at) in [(Key::Ctrl, 0), (Key::Char('a'), 100), (Key::Ctrl, 200)] {
        effects.extend(detector.on_event(KeyEvent::down(key), t0 + ms(at), || true).effects);
        effects.extend(detector.on_event(KeyEvent::up(key), t0 + ms(at + 20), || true).effects);
    }
    let out = detector.on_event(KeyEvent::down(Key::Space), t0 + ms(300), || true);
    effects.extend(out.effects);
    assert!(!effects.contains(&ChordEffect::Toggle));
    assert!(!detector.is_awaiting());
}
