use crate::error::{Error, Result};
use crate::hotkey::KeyEventSink;
use crate::types::{Key, KeyAction, KeyEvent};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};
use windows::Win32::Foundation::{HINSTANCE, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, DispatchMessageW, GetMessageW, PeekMessageW, PostThreadMessageW,
    SetWindowsHookExW, TranslateMessage, UnhookWindowsHookEx, HHOOK, KBDLLHOOKSTRUCT,
    LLKHF_INJECTED, MSG, PEEK_MESSAGE_REMOVE_TYPE, WH_KEYBOARD_LL, WM_KEYDOWN, WM_KEYUP,
    WM_QUIT, WM_SYSKEYDOWN, WM_SYSKEYUP,
};

lazy_static::lazy_static! {
    static ref HOOK_HANDLE: Mutex<Option<HHOOK>> = Mutex::new(None);
    static ref SINK: Mutex<Option<Arc<dyn KeyEventSink>>> = Mutex::new(None);
}

/// Installs the low-level keyboard hook on the calling thread.
/// That thread must pump messages.
pub fn install_hook(sink: Arc<dyn KeyEventSink>) -> Result<()> {
    info!("Installing keyboard hook...");
    *SINK.lock() = Some(sink);

    let hook_id =
        match unsafe { SetWindowsHookExW(WH_KEYBOARD_LL, Some(hook_proc), HINSTANCE::default(), 0) } {
            Ok(hook) if !hook.is_invalid() => hook,
            Ok(_) => {
                SINK.lock().take();
                return Err(Error::Subscription("keyboard hook handle is invalid".into()));
            }
            Err(e) => {
                SINK.lock().take();
                return Err(Error::Subscription(format!("SetWindowsHookExW: {e}")));
            }
        };

    *HOOK_HANDLE.lock() = Some(hook_id);
    info!("Keyboard hook installed. Handle: {:?}", hook_id);
    Ok(())
}

pub fn uninstall_hook() {
    if let Some(h) = HOOK_HANDLE.lock().take() {
        unsafe {
            let _ = UnhookWindowsHookEx(h);
        };
        info!("Keyboard hook uninstalled.");
    }
    SINK.lock().take();
}

/// Blocking message loop for the hook thread.
pub fn run_event_loop() {
    info!("Starting hook message loop...");
    let mut msg = MSG::default();
    unsafe {
        // force message queue creation
        let _ = PeekMessageW(&mut msg, None, 0, 0, PEEK_MESSAGE_REMOVE_TYPE(0));

        while GetMessageW(&mut msg, None, 0, 0).as_bool() {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }
    info!("Hook message loop exited.");
}

/// Hook plus its message loop on a dedicated thread.
pub struct HookThread {
    thread_id: u32,
    handle: Option<JoinHandle<()>>,
}

impl HookThread {
    pub fn spawn(sink: Arc<dyn KeyEventSink>) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);
        let handle = thread::Builder::new()
            .name("keyboard-hook".into())
            .spawn(move || {
                let thread_id = unsafe { GetCurrentThreadId() };
                match install_hook(sink) {
                    Ok(()) => {
                        let _ = ready_tx.send(Ok(thread_id));
                        run_event_loop();
                        uninstall_hook();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let thread_id = ready_rx
            .recv()
            .map_err(|_| Error::Subscription("keyboard hook thread exited early".into()))??;
        Ok(Self {
            thread_id,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = unsafe { PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0)) } {
            warn!("Could not stop the hook thread: {}", e);
            return;
        }
        if handle.join().is_err() {
            error!("Keyboard hook thread panicked");
        }
    }
}

impl Drop for HookThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

unsafe extern "system" fn hook_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code < 0 {
        return CallNextHookEx(None, code, wparam, lparam);
    }

    let kbd = &*(lparam.0 as *const KBDLLHOOKSTRUCT);
    if kbd.flags.0 & LLKHF_INJECTED.0 != 0 {
        return CallNextHookEx(None, code, wparam, lparam);
    }

    let event = match wparam.0 as u32 {
        WM_KEYDOWN | WM_SYSKEYDOWN => KeyEvent::down(Key::from_vk(kbd.vkCode)),
        WM_KEYUP | WM_SYSKEYUP => KeyEvent::up(Key::from_vk(kbd.vkCode)),
        _ => return CallNextHookEx(None, code, wparam, lparam),
    };

    // clone out so the sink runs without the slot locked
    let sink = SINK.lock().clone();
    let action = match sink {
        Some(sink) => sink.on_key(event),
        None => KeyAction::Pass,
    };

    match action {
        KeyAction::Pass => CallNextHookEx(None, code, wparam, lparam),
        KeyAction::Block => LRESULT(1),
    }
}
