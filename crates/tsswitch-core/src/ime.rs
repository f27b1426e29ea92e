use crate::error::{Error, Result};
use crate::layout_monitor::LayoutSource;
use crate::refresher::LayoutSwitcher;
use crate::types::LayoutId;
use tracing::{debug, trace};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, WPARAM};
use windows::Win32::System::Threading::{AttachThreadInput, GetCurrentThreadId};
use windows::Win32::UI::Input::KeyboardAndMouse::{
    GetKeyboardLayout, LoadKeyboardLayoutW, HKL, KLF_ACTIVATE,
};
use windows::Win32::UI::WindowsAndMessaging::{
    GetForegroundWindow, GetGUIThreadInfo, GetWindowThreadProcessId, PostMessageW,
    GUITHREADINFO, WM_INPUTLANGCHANGEREQUEST,
};

fn thread_of(hwnd: HWND) -> u32 {
    unsafe { GetWindowThreadProcessId(hwnd, None) }
}

/// Thread 0 means the calling thread. The LANGID sits in the low word.
fn layout_of(thread: u32) -> Option<LayoutId> {
    let hkl: HKL = unsafe { GetKeyboardLayout(thread) };
    (hkl.0 != 0).then(|| LayoutId::from_hkl(hkl.0))
}

/// Reads the layout of whatever has keyboard focus in the foreground.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32LayoutSource;

impl Win32LayoutSource {
    /// The window with keyboard focus can belong to a different thread than
    /// the top-level foreground window (embedded editors, UWP frames).
    fn focused_thread(foreground_thread: u32) -> Option<u32> {
        let mut info = GUITHREADINFO {
            cbSize: std::mem::size_of::<GUITHREADINFO>() as u32,
            ..Default::default()
        };
        unsafe { GetGUIThreadInfo(foreground_thread, &mut info) }.ok()?;
        (info.hwndFocus.0 != 0).then(|| thread_of(info.hwndFocus))
    }

    /// Some console hosts only answer while input is attached.
    fn attached_query(thread: u32) -> Option<LayoutId> {
        let me = unsafe { GetCurrentThreadId() };
        // attaching a thread to itself fails
        if me == thread {
            return None;
        }
        // Sharing the input queue makes the target's active layout our own,
        // so a query for the calling thread returns it.
        if !unsafe { AttachThreadInput(me, thread, BOOL::from(true)) }.as_bool() {
            return None;
        }
        let layout = layout_of(0);
        // Always detach, or our input state stays tied to the other window.
        unsafe {
            let _ = AttachThreadInput(me, thread, BOOL::from(false));
        }
        layout
    }
}

impl LayoutSource for Win32LayoutSource {
    fn query(&self) -> Option<LayoutId> {
        let foreground = unsafe { GetForegroundWindow() };
        if foreground.0 == 0 {
            trace!("No foreground window");
            return None;
        }
        let thread = thread_of(foreground);
        if thread == 0 {
            return None;
        }

        // focused control first, then the foreground thread, then attached
        Self::focused_thread(thread)
            .and_then(layout_of)
            .or_else(|| layout_of(thread))
            .or_else(|| {
                debug!("Falling back to attached layout query");
                Self::attached_query(thread)
            })
    }
}

/// Asks the foreground window to switch input language.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32LayoutSwitcher;

impl LayoutSwitcher for Win32LayoutSwitcher {
    fn activate(&self, layout: LayoutId) -> Result<()> {
        let foreground = unsafe { GetForegroundWindow() };
        if foreground.0 == 0 {
            return Err(Error::NotFound("foreground window".into()));
        }

        // KLID string, e.g. "00000404"; KLF_ACTIVATE loads it if needed.
        let klid: Vec<u16> = format!("{:08X}", layout.0)
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let hkl = unsafe { LoadKeyboardLayoutW(PCWSTR(klid.as_ptr()), KLF_ACTIVATE) }
            .map_err(|e| Error::os("LoadKeyboardLayoutW", &e))?;

        // Ask the window to switch; the IME re-reads its settings on activation.
        unsafe {
            PostMessageW(
                foreground,
                WM_INPUTLANGCHANGEREQUEST,
                WPARAM(0),
                LPARAM(hkl.0),
            )
        }
        .map_err(|e| Error::os("PostMessageW", &e))?;
        debug!("Requested layout {} on the foreground window", layout);
        Ok(())
    }
}
