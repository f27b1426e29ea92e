use crate::clock::{Clock, SystemClock};
use crate::config::ToggleSettings;
use crate::error::{Error, Result};
use crate::layout_monitor::{LayoutMonitor, RepaintHook};
use crate::refresher::{LiveRefresh, RefreshReport};
use crate::store::ConfigStore;
use crate::types::{LayoutId, OutputMode};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another toggle is still running.
    Busy,
    LayoutUnknown,
    LayoutNotTarget(LayoutId),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("a toggle is already in progress"),
            Self::LayoutUnknown => f.write_str("foreground layout is unknown"),
            Self::LayoutNotTarget(layout) => {
                write!(f, "foreground layout {layout} is not the target input method")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Confirmed {
        mode: OutputMode,
        location: String,
        refresh: RefreshReport,
    },
    /// Written, but the verify reads never saw it.
    Unconfirmed {
        target: OutputMode,
        observed: OutputMode,
        location: String,
        refresh: RefreshReport,
    },
    Skipped(SkipReason),
}

pub struct ModeToggleOrchestrator {
    store: Arc<ConfigStore>,
    monitor: Arc<LayoutMonitor>,
    refresher: Arc<dyn LiveRefresh>,
    clock: Arc<dyn Clock>,
    settings: ToggleSettings,
    mode: Mutex<OutputMode>,
    in_flight: Mutex<()>,
    on_repaint: Mutex<Option<RepaintHook>>,
}

/// Repaints on every exit path.
struct RepaintOnDrop<'a>(&'a Mutex<Option<RepaintHook>>);

impl Drop for RepaintOnDrop<'_> {
    fn drop(&mut self) {
        let hook = self.0.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl ModeToggleOrchestrator {
    pub fn new(
        store: Arc<ConfigStore>,
        monitor: Arc<LayoutMonitor>,
        refresher: Arc<dyn LiveRefresh>,
        settings: ToggleSettings,
    ) -> Self {
        Self::with_clock(store, monitor, refresher, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<ConfigStore>,
        monitor: Arc<LayoutMonitor>,
        refresher: Arc<dyn LiveRefresh>,
        settings: ToggleSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            monitor,
            refresher,
            clock,
            settings,
            mode: Mutex::new(OutputMode::Unknown),
            in_flight: Mutex::new(()),
            on_repaint: Mutex::new(None),
        }
    }

    pub fn set_on_repaint(&self, hook: RepaintHook) {
        *self.on_repaint.lock() = Some(hook);
    }

    /// Mode from the last store read.
    pub fn current_mode(&self) -> OutputMode {
        *self.mode.lock()
    }

    pub fn reload_mode(&self) -> OutputMode {
        self.read_mode(None)
    }

    /// Re-reads the store on every layout refresh so changes made outside
    /// this process show up. Repaints when the layout or the mode moved.
    pub fn follow_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.monitor.set_on_refresh(Arc::new(move |layout_changed| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let before = this.current_mode();
            let now = this.reload_mode();
            if now != before {
                info!("Output mode changed outside the app: {} -> {}", before, now);
            }
            if layout_changed || now != before {
                this.repaint();
            }
        }));
    }

    fn repaint(&self) {
        let hook = self.on_repaint.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Flips the persisted mode and makes it visible.
    pub fn toggle(&self) -> Result<ToggleOutcome> {
        let _repaint = RepaintOnDrop(&self.on_repaint);
        let Some(_flight) = self.in_flight.try_lock() else {
            info!("Toggle skipped: {}", SkipReason::Busy);
            return Ok(ToggleOutcome::Skipped(SkipReason::Busy));
        };

        self.monitor.refresh(false, "toggle");
        if let Some(reason) = self.gate() {
            info!("Toggle skipped: {}", reason);
            return Ok(ToggleOutcome::Skipped(reason));
        }

        let current = self.read_mode(None);
        let target = current.complement();
        info!("Toggling output mode {} -> {}", current, target);
        self.commit(target)
    }

    /// Sets an explicit mode. No layout gate.
    pub fn apply(&self, target: OutputMode) -> Result<ToggleOutcome> {
        let _repaint = RepaintOnDrop(&self.on_repaint);
        let Some(_flight) = self.in_flight.try_lock() else {
            return Ok(ToggleOutcome::Skipped(SkipReason::Busy));
        };
        info!("Setting output mode to {}", target);
        self.commit(target)
    }

    /// Reads the store. With `expected`, retries until it shows up or the
    /// retry budget runs out.
    pub fn read_mode(&self, expected: Option<OutputMode>) -> OutputMode {
        let attempts = match expected {
            Some(_) => self.settings.read_retries.max(1),
            None => 1,
        };
        let mut mode = OutputMode::Unknown;
        for attempt in 0..attempts {
            mode = self.store.read_mode();
            if expected.map_or(true, |e| e == mode) {
                break;
            }
            if attempt + 1 < attempts {
                self.clock.sleep(self.backoff());
            }
        }
        *self.mode.lock() = mode;
        mode
    }

    /// Polls until the store reads `target`.
    pub fn wait_for(&self, target: OutputMode) -> Result<OutputMode> {
        let attempts = self.settings.verify_attempts.max(1);
        let mut observed = OutputMode::Unknown;
        for attempt in 0..attempts {
            observed = self.store.read_mode();
            *self.mode.lock() = observed;
            if observed == target {
                return Ok(observed);
            }
            if attempt + 1 < attempts {
                self.clock.sleep(self.backoff());
            }
        }
        let location = self
            .store
            .find()
            .map(|v| v.location)
            .unwrap_or_else(|| "<no location>".to_string());
        Err(Error::TransientMismatch {
            location,
            expected: target,
            observed,
            attempts,
        })
    }

    fn gate(&self) -> Option<SkipReason> {
        match self.monitor.current() {
            None => Some(SkipReason::LayoutUnknown),
            Some(snapshot) if !snapshot.is_target => {
                Some(SkipReason::LayoutNotTarget(snapshot.layout))
            }
            Some(_) => None,
        }
    }

    fn commit(&self, target: OutputMode) -> Result<ToggleOutcome> {
        let location = match self.store.write(target) {
            Ok(location) => location,
            Err(e) => {
                error!("Writing {} failed: {}", target, e);
                return Err(e);
            }
        };

        let refresh = self.refresher.refresh_active_layout();

        match self.wait_for(target) {
            Ok(mode) => {
                info!("Output mode is now {}", mode);
                Ok(ToggleOutcome::Confirmed {
                    mode,
                    location,
                    refresh,
                })
            }
            Err(Error::TransientMismatch { observed, .. }) => {
                warn!(
                    "Wrote {} to {} but reads still show {}",
                    target, location, observed
                );
                Ok(ToggleOutcome::Unconfirmed {
                    target,
                    observed,
                    location,
                    refresh,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.settings.verify_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleRequest {
    Toggle { source: &'static str },
    Apply(OutputMode),
}

/// Runs toggles off the hook and message-loop threads, one at a time.
pub struct ToggleWorker {
    tx: Option<Sender<ToggleRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl ToggleWorker {
    pub fn spawn(orchestrator: Arc<ModeToggleOrchestrator>) -> Result<Self> {
        let (tx, rx) = bounded::<ToggleRequest>(1);
        let handle = thread::Builder::new()
            .name("toggle-worker".into())
            .spawn(move || {
                for request in rx {
                    let result = match request {
                        ToggleRequest::Toggle { source } => {
                            info!("Toggle requested by {}", source);
                            orchestrator.toggle()
                        }
                        ToggleRequest::Apply(mode) => orchestrator.apply(mode),
                    };
                    if let Err(e) = result {
                        error!("Toggle failed: {}", e);
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Returns false when a request is already queued.
    pub fn submit(&self, request: ToggleRequest) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                info!("Ignoring {:?}: a toggle is already pending", request);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Toggle worker is gone");
                false
            }
        }
    }

    /// Lets the current toggle finish, then stops the worker.
    pub fn shutdown(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{LayoutSettings, StoreSettings};
    use crate::layout_monitor::FixedLayout;
    use crate::refresher::NoRefresh;
    use crate::store::{MemoryRegistry, RawValue, RegistryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &str = r"Software\Microsoft\IME\15.0\IMETC";
    const VALUE: &str = "Enable Simplified Chinese Output";

    struct Harness {
        registry: Arc<MemoryRegistry>,
        orchestrator: Arc<ModeToggleOrchestrator>,
        repaints: Arc<AtomicUsize>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(
        registry: Arc<dyn RegistryBackend>,
        memory: Arc<MemoryRegistry>,
        layout: LayoutId,
    ) -> Harness {
        let store = Arc::new(ConfigStore::discover(registry, &StoreSettings::default()));
        let clock = Arc::new(ManualClock::default());
        let monitor = Arc::new(LayoutMonitor::with_clock(
            Arc::new(FixedLayout(layout)),
            LayoutSettings::default(),
            clock.clone(),
        ));
        let orchestrator = Arc::new(ModeToggleOrchestrator::with_clock(
            store,
            monitor,
            Arc::new(NoRefresh),
            ToggleSettings::default(),
            clock.clone(),
        ));
        let repaints = Arc::new(AtomicUsize::new(0));
        let counter = repaints.clone();
        orchestrator.set_on_repaint(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        Harness {
            registry: memory,
            orchestrator,
            repaints,
            clock,
        }
    }

    fn harness(registry: MemoryRegistry) -> Harness {
        let registry = Arc::new(registry);
        harness_with(registry.clone(), registry, LayoutId(0x0404))
    }

    #[test]
    fn two_toggles_return_to_start() {
        let h = harness(MemoryRegistry::new().with_value(KEY, VALUE, RawValue::Dword(0)));

        let first = h.orchestrator.toggle().unwrap();
        assert!(matches!(
            first,
            ToggleOutcome::Confirmed {
                mode: OutputMode::Simplified,
                ..
            }
        ));
        let second = h.orchestrator.toggle().unwrap();
        assert!(matches!(
            second,
            ToggleOutcome::Confirmed {
                mode: OutputMode::Traditional,
                ..
            }
        ));
        assert_eq!(h.registry.value(KEY, VALUE), Some(RawValue::Dword(0)));
        assert_eq!(h.repaints.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn external_write_is_picked_up_on_layout_refresh() {
        let h = harness(MemoryRegistry::new().with_value(KEY, VALUE, RawValue::Dword(0)));
        h.orchestrator.follow_monitor();
        let monitor = h.orchestrator.monitor.clone();

        assert!(monitor.refresh(false, "test"));
        assert_eq!(h.orchestrator.current_mode(), OutputMode::Traditional);
        assert_eq!(h.repaints.load(Ordering::SeqCst), 1);

        // flipped by the IME's own settings page, layout unchanged
        h.registry.write(KEY, VALUE, &RawValue::Dword(1)).unwrap();
        assert!(!monitor.refresh(true, "test"));
        assert_eq!(h.orchestrator.current_mode(), OutputMode::Simplified);
        assert_eq!(h.repaints.load(Ordering::SeqCst), 2);

        assert!(!monitor.refresh(false, "test"));
        assert_eq!(h.repaints.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wrong_layout_skips_but_still_repaints() {
        let registry = Arc::new(MemoryRegistry::new().with_value(KEY, VALUE, RawValue::Dword(0)));
        let h = harness_with(registry.clone(), registry, LayoutId(0x0409));

        let outcome = h.orchestrator.toggle().unwrap();
        assert_eq!(
            outcome,
            ToggleOutcome::Skipped(SkipReason::LayoutNotTarget(LayoutId(0x0409)))
        );
        assert_eq!(h.registry.write_count(), 0);
        assert_eq!(h.repaints.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_toggle_is_rejected() {
        let h = harness(MemoryRegistry::new().with_value(KEY, VALUE, RawValue::Dword(0)));
        let _held = h.orchestrator.in_flight.lock();
        assert_eq!(
            h.orchestrator.toggle().unwrap(),
            ToggleOutcome::Skipped(SkipReason::Busy)
        );
    }

    #[test]
    fn write_error_surfaces_and_keeps_mode() {
        let h = harness(MemoryRegistry::new().with_value(KEY, VALUE, RawValue::Dword(1)));
        h.registry.deny_writes(KEY);
        let err = h.orchestrator.toggle().unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(h.orchestrator.current_mode(), OutputMode::Simplified);
        assert_eq!(h.repaints.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_mode_retries_only_with_expectation() {
        let h = harness(MemoryRegistry::new().with_value(KEY, VALUE, RawValue::Dword(0)));
        assert_eq!(h.orchestrator.read_mode(None), OutputMode::Traditional);
        assert!(h.clock.sleeps().is_empty());

        assert_eq!(
            h.orchestrator.read_mode(Some(OutputMode::Simplified)),
            OutputMode::Traditional
        );
        assert_eq!(h.clock.sleeps().len(), 4);
    }

    #[test]
    fn apply_sets_explicit_mode() {
        let h = harness(MemoryRegistry::new().with_value(
            KEY,
            VALUE,
            RawValue::String("0x00000001".into()),
        ));
        let outcome = h.orchestrator.apply(OutputMode::Simplified).unwrap();
        assert!(matches!(outcome, ToggleOutcome::Confirmed { .. }));
        assert_eq!(
            h.registry.value(KEY, VALUE),
            Some(RawValue::String("0x00000001".into()))
        );
    }

    #[test]
    fn worker_runs_submitted_toggles() {
        let h = harness(MemoryRegistry::new().with_value(KEY, VALUE, RawValue::Dword(0)));
        let worker = ToggleWorker::spawn(h.orchestrator.clone()).unwrap();
        assert!(worker.submit(ToggleRequest::Toggle { source: "test" }));
        worker.shutdown();
        assert_eq!(h.registry.value(KEY, VALUE), Some(RawValue::Dword(1)));
    }
}
