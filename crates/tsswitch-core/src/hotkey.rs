use crate::chord::{ChordConfig, ChordEffect, HotkeyChordDetector};
use crate::clock::{Clock, SystemClock, TimerHandle};
use crate::layout_monitor::LayoutMonitor;
use crate::orchestrator::{ToggleRequest, ToggleWorker};
use crate::types::{KeyAction, KeyEvent};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Receives keyboard events from the hook thread. Must return quickly.
pub trait KeyEventSink: Send + Sync {
    fn on_key(&self, event: KeyEvent) -> KeyAction;
}

/// Where a confirmed chord goes.
pub trait ToggleSink: Send + Sync {
    fn request_toggle(&self, source: &'static str) -> bool;
}

impl ToggleSink for ToggleWorker {
    fn request_toggle(&self, source: &'static str) -> bool {
        self.submit(ToggleRequest::Toggle { source })
    }
}

pub struct HotkeyService {
    detector: Mutex<HotkeyChordDetector>,
    timeout: Mutex<Option<TimerHandle>>,
    monitor: Arc<LayoutMonitor>,
    toggles: Arc<dyn ToggleSink>,
    clock: Arc<dyn Clock>,
    this: Weak<HotkeyService>,
}

impl HotkeyService {
    pub fn new(
        config: ChordConfig,
        monitor: Arc<LayoutMonitor>,
        toggles: Arc<dyn ToggleSink>,
    ) -> Arc<Self> {
        Self::with_clock(config, monitor, toggles, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ChordConfig,
        monitor: Arc<LayoutMonitor>,
        toggles: Arc<dyn ToggleSink>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            detector: Mutex::new(HotkeyChordDetector::new(config)),
            timeout: Mutex::new(None),
            monitor,
            toggles,
            clock,
            this: this.clone(),
        })
    }

    pub fn is_awaiting(&self) -> bool {
        self.detector.lock().is_awaiting()
    }

    /// Drops any pending confirmation timer.
    pub fn shutdown(&self) {
        self.timeout.lock().take();
    }

    fn apply(&self, effects: Vec<ChordEffect>) {
        for effect in effects {
            match effect {
                ChordEffect::ArmTimeout { generation, after } => {
                    let weak = self.this.clone();
                    let timer = TimerHandle::after("chord-timeout", after, move || {
                        if let Some(service) = weak.upgrade() {
                            service.expire(generation);
                        }
                    });
                    // replacing drops (and cancels) the previous timer
                    *self.timeout.lock() = Some(timer);
                }
                ChordEffect::CancelTimeout => {
                    self.timeout.lock().take();
                }
                ChordEffect::Toggle => {
                    if !self.toggles.request_toggle("hotkey") {
                        debug!("Toggle request not queued");
                    }
                }
                ChordEffect::Probe => {
                    self.monitor.schedule_default_refresh("hotkey-probe");
                }
                ChordEffect::Dropped(reason) => {
                    info!("Chord dropped: {:?}", reason);
                }
            }
        }
    }

    fn expire(&self, generation: u64) {
        if self.detector.lock().on_timeout(generation) {
            debug!("Confirmation window closed (generation {})", generation);
        }
    }
}

impl KeyEventSink for HotkeyService {
    fn on_key(&self, event: KeyEvent) -> KeyAction {
        let now = self.clock.now();
        let monitor = &self.monitor;
        let output = self
            .detector
            .lock()
            .on_event(event, now, || monitor.is_target_active());
        if !output.effects.is_empty() {
            self.apply(output.effects);
        }
        output.action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LayoutSettings;
    use crate::layout_monitor::FixedLayout;
    use crate::types::{Key, LayoutId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSink(AtomicUsize);

    impl ToggleSink for CountingSink {
        fn request_toggle(&self, _source: &'static str) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn service(layout: LayoutId) -> (Arc<HotkeyService>, Arc<CountingSink>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let monitor = Arc::new(LayoutMonitor::with_clock(
            Arc::new(FixedLayout(layout)),
            LayoutSettings::default(),
            clock.clone(),
        ));
        monitor.refresh(false, "test");
        let sink = Arc::new(CountingSink::default());
        let service = HotkeyService::with_clock(
            ChordConfig {
                window: Duration::from_millis(60),
                ..ChordConfig::default()
            },
            monitor,
            sink.clone(),
            clock.clone(),
        );
        (service, sink, clock)
    }

    fn tap(service: &HotkeyService, clock: &ManualClock, key: Key) {
        service.on_key(KeyEvent::down(key));
        clock.advance(Duration::from_millis(10));
        service.on_key(KeyEvent::up(key));
        clock.advance(Duration::from_millis(10));
    }

    #[test]
    fn confirmed_chord_requests_one_toggle_and_blocks_space() {
        let (service, sink, clock) = service(LayoutId(0x0404));
        tap(&service, &clock, Key::Ctrl);
        tap(&service, &clock, Key::Ctrl);
        assert!(service.is_awaiting());

        assert_eq!(service.on_key(KeyEvent::down(Key::Space)), KeyAction::Block);
        assert_eq!(service.on_key(KeyEvent::up(Key::Space)), KeyAction::Block);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        assert!(!service.is_awaiting());
    }

    #[test]
    fn chord_is_ignored_outside_target_layout() {
        let (service, sink, clock) = service(LayoutId(0x0409));
        tap(&service, &clock, Key::Ctrl);
        tap(&service, &clock, Key::Ctrl);
        assert!(!service.is_awaiting());
        assert_eq!(service.on_key(KeyEvent::down(Key::Space)), KeyAction::Pass);
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pending_confirmation_expires_on_its_own() {
        let (service, sink, clock) = service(LayoutId(0x0404));
        tap(&service, &clock, Key::Ctrl);
        tap(&service, &clock, Key::Ctrl);
        assert!(service.is_awaiting());

        for _ in 0..100 {
            if !service.is_awaiting() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!service.is_awaiting());
        assert_eq!(service.on_key(KeyEvent::down(Key::Space)), KeyAction::Pass);
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
    }
}
