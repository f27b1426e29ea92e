use crate::config::CursorFixSettings;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll/reload pair for working around frozen animated cursors.
pub trait CursorPlugin: Send + Sync {
    /// Handle of the visible cursor, `None` when hidden or unavailable.
    fn poll(&self) -> Option<usize>;
    fn force_reload(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Idle,
    Initial(usize),
    Reload { from: usize, to: usize },
    Cooldown { from: usize, to: usize },
}

/// Decides when a cursor change warrants a reload.
#[derive(Debug)]
pub struct CursorWatch {
    last: Option<usize>,
    cooldown: Duration,
    cooldown_until: Option<Instant>,
}

impl CursorWatch {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            last: None,
            cooldown,
            cooldown_until: None,
        }
    }

    pub fn observe(&mut self, handle: Option<usize>, now: Instant) -> WatchEvent {
        let Some(handle) = handle.filter(|&h| h != 0) else {
            return WatchEvent::Idle;
        };
        let Some(last) = self.last.replace(handle) else {
            return WatchEvent::Initial(handle);
        };
        if last == handle {
            return WatchEvent::Idle;
        }
        if self.cooldown_until.is_some_and(|until| now < until) {
            return WatchEvent::Cooldown {
                from: last,
                to: handle,
            };
        }
        self.cooldown_until = Some(now + self.cooldown);
        WatchEvent::Reload {
            from: last,
            to: handle,
        }
    }
}

/// Background poller driving a [`CursorPlugin`].
pub struct CursorMonitor {
    stop: Option<Sender<()>>,
    done: Receiver<()>,
    join_timeout: Duration,
}

impl CursorMonitor {
    pub fn spawn(plugin: Arc<dyn CursorPlugin>, settings: &CursorFixSettings) -> Option<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let interval = Duration::from_millis(settings.poll_interval_ms);
        let mut watch = CursorWatch::new(Duration::from_millis(settings.cooldown_ms));

        let spawned = thread::Builder::new()
            .name("cursor-monitor".into())
            .spawn(move || {
                info!("Cursor monitor started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    match watch.observe(plugin.poll(), Instant::now()) {
                        WatchEvent::Idle => {}
                        WatchEvent::Initial(h) => debug!("Initial cursor {:#010x}", h),
                        WatchEvent::Reload { from, to } => {
                            debug!("Cursor {:#010x} -> {:#010x}, reloading", from, to);
                            if !plugin.force_reload() {
                                warn!("Cursor reload failed");
                            }
                        }
                        WatchEvent::Cooldown { from, to } => {
                            debug!("Cursor {:#010x} -> {:#010x} during cooldown", from, to);
                        }
                    }
                }
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(_) => Some(Self {
                stop: Some(stop_tx),
                done: done_rx,
                join_timeout: Duration::from_millis(settings.join_timeout_ms),
            }),
            Err(e) => {
                error!("Failed to start cursor monitor: {}", e);
                None
            }
        }
    }

    /// Waits at most the join timeout; a stuck poller is left behind.
    pub fn stop(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        let Some(stop) = self.stop.take() else {
            return true;
        };
        let _ = stop.try_send(());
        match self.done.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("Cursor monitor stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Cursor monitor did not stop within {:?}", self.join_timeout);
                false
            }
        }
    }
}

impl Drop for CursorMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(windows)]
pub use win32::Win32CursorPlugin;

#[cfg(windows)]
mod win32 {
    use super::CursorPlugin;
    use tracing::warn;
    use windows::Win32::UI::WindowsAndMessaging::{
        CopyIcon, GetCursorInfo, LoadCursorW, SetSystemCursor, SystemParametersInfoW, CURSORINFO,
        CURSOR_SHOWING, HCURSOR, HICON, IDC_ARROW, SPI_SETCURSORS, SYSTEM_CURSOR_ID,
        SYSTEM_PARAMETERS_INFO_UPDATE_FLAGS,
    };

    const SYSTEM_CURSORS: [u32; 13] = [
        32512, 32513, 32514, 32515, 32516, 32642, 32643, 32644, 32645, 32646, 32648, 32649, 32650,
    ];

    #[derive(Debug, Default, Clone, Copy)]
    pub struct Win32CursorPlugin;

    impl CursorPlugin for Win32CursorPlugin {
        fn poll(&self) -> Option<usize> {
            let mut info = CURSORINFO {
                cbSize: std::mem::size_of::<CURSORINFO>() as u32,
                ..Default::default()
            };
            unsafe { GetCursorInfo(&mut info) }.ok()?;
            if info.flags.0 & CURSOR_SHOWING.0 == 0 {
                return None;
            }
            Some(info.hCursor.0 as usize)
        }

        fn force_reload(&self) -> bool {
            let arrow = match unsafe { LoadCursorW(None, IDC_ARROW) } {
                Ok(arrow) => arrow,
                Err(e) => {
                    warn!("LoadCursorW failed: {}", e);
                    return false;
                }
            };
            for id in SYSTEM_CURSORS {
                if let Ok(copy) = unsafe { CopyIcon(HICON(arrow.0)) } {
                    let _ = unsafe { SetSystemCursor(HCURSOR(copy.0), SYSTEM_CURSOR_ID(id)) };
                }
            }
            match unsafe {
                SystemParametersInfoW(
                    SPI_SETCURSORS,
                    0,
                    None,
                    SYSTEM_PARAMETERS_INFO_UPDATE_FLAGS(0),
                )
            } {
                Ok(()) => true,
                Err(e) => {
                    warn!("Reloading the cursor scheme failed: {}", e);
                    false
                }
            }
        }
    }
}
