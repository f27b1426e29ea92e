use crate::error::{Error, Result};
use crate::layout_monitor::LayoutMonitor;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, trace, warn};
use windows::Win32::Foundation::{HMODULE, HWND};
use windows::Win32::UI::Accessibility::{SetWinEventHook, UnhookWinEvent, HWINEVENTHOOK};

const EVENT_SYSTEM_FOREGROUND: u32 = 0x0003;
const EVENT_SYSTEM_SWITCHSTART: u32 = 0x0014;
const EVENT_SYSTEM_SWITCHEND: u32 = 0x0015;
const WINEVENT_OUTOFCONTEXT: u32 = 0x0000;

lazy_static::lazy_static! {
    static ref MONITOR: Mutex<Option<Arc<LayoutMonitor>>> = Mutex::new(None);
}

/// Foreground and Alt-Tab notifications. Must be created on a thread that
/// pumps messages; hooks are removed on drop.
pub struct ForegroundEvents {
    hooks: Vec<HWINEVENTHOOK>,
}

impl ForegroundEvents {
    pub fn subscribe(monitor: Arc<LayoutMonitor>) -> Result<Self> {
        *MONITOR.lock() = Some(monitor);

        let mut hooks = Vec::new();
        for (min, max) in [
            (EVENT_SYSTEM_FOREGROUND, EVENT_SYSTEM_FOREGROUND),
            (EVENT_SYSTEM_SWITCHSTART, EVENT_SYSTEM_SWITCHEND),
        ] {
            let hook = unsafe {
                SetWinEventHook(
                    min,
                    max,
                    HMODULE::default(),
                    Some(win_event_proc),
                    0,
                    0,
                    WINEVENT_OUTOFCONTEXT,
                )
            };
            if hook.is_invalid() {
                warn!("SetWinEventHook({:#x}..{:#x}) failed", min, max);
            } else {
                hooks.push(hook);
            }
        }

        if hooks.is_empty() {
            MONITOR.lock().take();
            return Err(Error::Subscription("no WinEvent hook could be set".into()));
        }
        info!("Subscribed to {} WinEvent range(s)", hooks.len());
        Ok(Self { hooks })
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        for hook in self.hooks.drain(..) {
            unsafe {
                let _ = UnhookWinEvent(hook);
            }
        }
        MONITOR.lock().take();
    }
}

impl Drop for ForegroundEvents {
    fn drop(&mut self) {
        self.release();
    }
}

fn source_of(event: u32) -> &'static str {
    match event {
        EVENT_SYSTEM_FOREGROUND => "foreground",
        EVENT_SYSTEM_SWITCHSTART => "switch-start",
        EVENT_SYSTEM_SWITCHEND => "switch-end",
        _ => "winevent",
    }
}

unsafe extern "system" fn win_event_proc(
    _hook: HWINEVENTHOOK,
    event: u32,
    _hwnd: HWND,
    _id_object: i32,
    _id_child: i32,
    _event_thread: u32,
    _event_time: u32,
) {
    let monitor = MONITOR.lock().clone();
    if let Some(monitor) = monitor {
        trace!("WinEvent {:#x}", event);
        monitor.schedule_default_refresh(source_of(event));
    }
}
