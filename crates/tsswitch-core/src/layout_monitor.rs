use crate::clock::{Clock, SystemClock};
use crate::config::LayoutSettings;
use crate::types::{LayoutId, LayoutSnapshot};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Asks the OS which layout the foreground application is using.
pub trait LayoutSource: Send + Sync {
    fn query(&self) -> Option<LayoutId>;
}

/// Always reports the same layout. Used off Windows and in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedLayout(pub LayoutId);

impl LayoutSource for FixedLayout {
    fn query(&self) -> Option<LayoutId> {
        Some(self.0)
    }
}

pub type RepaintHook = Arc<dyn Fn() + Send + Sync>;

/// Runs after every successful query; the flag says whether the layout moved.
pub type RefreshHook = Arc<dyn Fn(bool) + Send + Sync>;

pub struct LayoutMonitor {
    source: Arc<dyn LayoutSource>,
    target: LayoutId,
    cache: Mutex<Option<LayoutSnapshot>>,
    on_refresh: Mutex<Option<RefreshHook>>,
    clock: Arc<dyn Clock>,
    settings: LayoutSettings,
}

impl LayoutMonitor {
    pub fn new(source: Arc<dyn LayoutSource>, settings: LayoutSettings) -> Self {
        Self::with_clock(source, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        source: Arc<dyn LayoutSource>,
        settings: LayoutSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            target: settings.target,
            cache: Mutex::new(None),
            on_refresh: Mutex::new(None),
            clock,
            settings,
        }
    }

    pub fn set_on_refresh(&self, hook: RefreshHook) {
        *self.on_refresh.lock() = Some(hook);
    }

    pub fn current(&self) -> Option<LayoutSnapshot> {
        *self.cache.lock()
    }

    pub fn is_target_active(&self) -> bool {
        self.current().is_some_and(|s| s.is_target)
    }

    /// Re-queries the foreground layout. Returns whether the cached snapshot
    /// changed. The refresh hook sees every successful query.
    pub fn refresh(&self, force_log: bool, source: &str) -> bool {
        // query without holding the cache lock
        let Some(layout) = self.source.query() else {
            trace!("[{}] layout query returned nothing", source);
            return false;
        };
        let snapshot = LayoutSnapshot {
            layout,
            is_target: layout == self.target,
        };

        let previous = {
            let mut cache = self.cache.lock();
            let previous = *cache;
            *cache = Some(snapshot);
            previous
        };
        let changed = previous != Some(snapshot);

        if changed {
            info!(
                "[{}] layout {} -> {} (target active: {})",
                source,
                previous.map_or_else(|| "none".to_string(), |p| p.layout.to_string()),
                snapshot.layout,
                snapshot.is_target
            );
        } else if force_log {
            info!("[{}] layout unchanged: {}", source, snapshot.layout);
        }

        let hook = self.on_refresh.lock().clone();
        if let Some(hook) = hook {
            hook(changed);
        }
        changed
    }

    /// Refresh burst on a background thread. The notifications that trigger
    /// this usually arrive before the OS has applied the change.
    pub fn schedule_async_refresh(
        self: &Arc<Self>,
        source: &'static str,
        attempts: u32,
        delay: Duration,
        initial_delay: Duration,
    ) {
        let monitor = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("layout-refresh-{source}"))
            .spawn(move || {
                monitor.clock.sleep(initial_delay);
                for attempt in 0..attempts {
                    if monitor.refresh(false, source) {
                        debug!("[{}] change picked up on attempt {}", source, attempt + 1);
                    }
                    if attempt + 1 < attempts {
                        monitor.clock.sleep(delay);
                    }
                }
            });
        if let Err(e) = spawned {
            error!("Failed to spawn refresh burst for {}: {}", source, e);
        }
    }

    /// Burst with the configured attempt count and spacing.
    pub fn schedule_default_refresh(self: &Arc<Self>, source: &'static str) {
        self.schedule_async_refresh(
            source,
            self.settings.refresh_attempts,
            self.settings.refresh_delay(),
            self.settings.refresh_initial_delay(),
        );
    }

    /// Polling fallback for when notifications are missed or unavailable.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> LayoutPoller {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let monitor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("layout-poller".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        monitor.refresh(false, "poll");
                    }
                    _ => break,
                }
            })
            .map_err(|e| error!("Failed to spawn layout poller: {}", e))
            .ok();
        LayoutPoller {
            stop: Some(stop_tx),
            handle,
        }
    }
}

pub struct LayoutPoller {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LayoutPoller {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LayoutPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
