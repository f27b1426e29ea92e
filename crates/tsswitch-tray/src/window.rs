use crate::app::Services;
use crate::icons::Win32IconRenderer;
use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tsswitch_core::chord::ChordConfig;
use tsswitch_core::clock::TimerHandle;
use tsswitch_core::cursor_fix::{CursorMonitor, Win32CursorPlugin};
use tsswitch_core::foreground_events::ForegroundEvents;
use tsswitch_core::hotkey::HotkeyService;
use tsswitch_core::keyboard_hook::HookThread;
use tsswitch_core::layout_monitor::{LayoutPoller, RepaintHook};
use tsswitch_core::orchestrator::{ToggleRequest, ToggleWorker};
use tsswitch_core::tray_model::{IconCache, IconChoice, TrayModel};
use windows::core::w;
use windows::Win32::Foundation::{HINSTANCE, HWND, LPARAM, LRESULT, POINT, WPARAM};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::Shell::{
    Shell_NotifyIconW, NIF_ICON, NIF_MESSAGE, NIF_TIP, NIM_ADD, NIM_DELETE, NIM_MODIFY,
    NOTIFYICONDATAW, NOTIFY_ICON_MESSAGE,
};
use windows::Win32::UI::WindowsAndMessaging::{
    AppendMenuW, CreatePopupMenu, CreateWindowExW, DefWindowProcW, DeregisterShellHookWindow,
    DestroyMenu, DestroyWindow, DispatchMessageW, GetCursorPos, GetMessageW, PostMessageW,
    PostQuitMessage, RegisterClassW, RegisterShellHookWindow, RegisterWindowMessageW,
    SetForegroundWindow, TrackPopupMenu, TranslateMessage, HICON, MF_STRING, MSG,
    TPM_BOTTOMALIGN, TPM_RETURNCMD, TPM_RIGHTBUTTON, WM_APP, WM_CONTEXTMENU,
    WM_DESTROY, WM_LBUTTONUP, WM_RBUTTONUP, WNDCLASSW, WS_EX_TOOLWINDOW, WS_OVERLAPPED,
};

const WM_TRAY: u32 = WM_APP + 1;
const WM_APP_REPAINT: u32 = WM_APP + 2;
const WM_APP_GO_LIVE: u32 = WM_APP + 3;
const TRAY_ID: u32 = 1;
const IDM_EXIT: usize = 1001;

const HSHELL_WINDOWACTIVATED: usize = 4;
const HSHELL_LANGUAGE: usize = 8;
const HSHELL_RUDEAPPACTIVATED: usize = 0x8004;

/// Receives window messages for the tray window. `None` falls through to
/// the default window procedure.
pub trait WindowHandler: Send + Sync {
    fn handle(&self, hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> Option<LRESULT>;
}

lazy_static::lazy_static! {
    static ref HANDLER: Mutex<Option<Arc<dyn WindowHandler>>> = Mutex::new(None);
}

/// Window procedure for the tray window. Clones the handler out of the slot
/// so no lock is held while a message is handled; `TrackPopupMenu` and
/// `DestroyWindow` re-enter this function.
unsafe extern "system" fn wndproc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    let handler = HANDLER.lock().clone();
    if let Some(handler) = handler {
        if let Some(result) = handler.handle(hwnd, msg, wparam, lparam) {
            return result;
        }
    }
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

fn post(hwnd: isize, msg: u32) {
    if hwnd == 0 {
        return;
    }
    if let Err(e) = unsafe { PostMessageW(HWND(hwnd), msg, WPARAM(0), LPARAM(0)) } {
        debug!("PostMessageW({:#x}) failed: {}", msg, e);
    }
}

/// `szTip` is a fixed 128-unit buffer; longer tooltips are cut, keeping the NUL.
fn copy_tip(dst: &mut [u16; 128], tip: &str) {
    let units: Vec<u16> = tip.encode_utf16().take(dst.len() - 1).collect();
    dst[..units.len()].copy_from_slice(&units);
    dst[units.len()] = 0;
}

/// Background pieces that only live while the tray runs.
#[derive(Default)]
struct Subscriptions {
    hook: Option<HookThread>,
    events: Option<ForegroundEvents>,
    poller: Option<LayoutPoller>,
    cursor: Option<CursorMonitor>,
    worker: Option<Arc<ToggleWorker>>,
    hotkey: Option<Arc<HotkeyService>>,
    shell_hook: bool,
}

pub struct TrayController {
    hwnd: AtomicIsize,
    services: Services,
    model: TrayModel,
    icons: IconCache<Win32IconRenderer>,
    subs: Mutex<Subscriptions>,
    hold_timer: Mutex<Option<TimerHandle>>,
    shell_msg: u32,
    taskbar_created: u32,
}

impl TrayController {
    fn new(services: Services, started: Instant) -> Self {
        let tray = &services.settings.tray;
        let model = TrayModel::new(Duration::from_millis(tray.hold_floor_ms), started);
        let icons = IconCache::new(Win32IconRenderer, tray.icons.clone(), tray.icon_size);
        Self {
            hwnd: AtomicIsize::new(0),
            model,
            icons,
            subs: Mutex::new(Subscriptions::default()),
            hold_timer: Mutex::new(None),
            shell_msg: unsafe { RegisterWindowMessageW(w!("SHELLHOOK")) },
            taskbar_created: unsafe { RegisterWindowMessageW(w!("TaskbarCreated")) },
            services,
        }
    }

    fn hwnd(&self) -> HWND {
        HWND(self.hwnd.load(Ordering::SeqCst))
    }

    /// One `Shell_NotifyIconW` call. The shell identifies our icon by the
    /// (window, id) pair, and clicks come back as `WM_TRAY`.
    fn notify(&self, message: NOTIFY_ICON_MESSAGE, icon: HICON, tip: &str) -> bool {
        let mut nid = NOTIFYICONDATAW {
            cbSize: std::mem::size_of::<NOTIFYICONDATAW>() as u32,
            hWnd: self.hwnd(),
            uID: TRAY_ID,
            uFlags: NIF_MESSAGE | NIF_ICON | NIF_TIP,
            uCallbackMessage: WM_TRAY,
            hIcon: icon,
            ..Default::default()
        };
        copy_tip(&mut nid.szTip, tip);
        unsafe { Shell_NotifyIconW(message, &nid) }.as_bool()
    }

    fn add_icon(&self) {
        let choice = self.current_choice();
        if !self.notify(NIM_ADD, self.icons.get(choice.icon), &choice.tooltip) {
            warn!("Shell_NotifyIconW(NIM_ADD) failed");
        }
    }

    fn remove_icon(&self) {
        let nid = NOTIFYICONDATAW {
            cbSize: std::mem::size_of::<NOTIFYICONDATAW>() as u32,
            hWnd: self.hwnd(),
            uID: TRAY_ID,
            ..Default::default()
        };
        unsafe {
            let _ = Shell_NotifyIconW(NIM_DELETE, &nid);
        }
    }

    fn current_choice(&self) -> IconChoice {
        let layout = self.services.monitor.current();
        self.model
            .choice(layout.as_ref(), self.services.orchestrator.current_mode())
    }

    fn repaint(&self) {
        let choice = self.current_choice();
        debug!("Repaint: {:?} / {}", choice.icon, choice.tooltip);
        if !self.notify(NIM_MODIFY, self.icons.get(choice.icon), &choice.tooltip) {
            debug!("Shell_NotifyIconW(NIM_MODIFY) failed");
        }
    }

    fn request_toggle(&self, source: &'static str) {
        let worker = self.subs.lock().worker.clone();
        match worker {
            Some(worker) => {
                worker.submit(ToggleRequest::Toggle { source });
            }
            None => warn!("Toggle worker is not running"),
        }
    }

    /// Pops up the Exit menu at the cursor and blocks until it closes.
    fn show_menu(&self, hwnd: HWND) {
        let menu = match unsafe { CreatePopupMenu() } {
            Ok(menu) => menu,
            Err(e) => {
                warn!("CreatePopupMenu failed: {}", e);
                return;
            }
        };
        let command = unsafe {
            let _ = AppendMenuW(menu, MF_STRING, IDM_EXIT, w!("Exit"));
            // Without owning the foreground, clicking elsewhere leaves the
            // menu open.
            let _ = SetForegroundWindow(hwnd);
            // The notification message carries no coordinates; use the cursor.
            let mut pt = POINT::default();
            let _ = GetCursorPos(&mut pt);
            // TPM_RETURNCMD returns the chosen id instead of posting
            // WM_COMMAND, 0 when dismissed.
            let command = TrackPopupMenu(
                menu,
                TPM_RETURNCMD | TPM_RIGHTBUTTON | TPM_BOTTOMALIGN,
                pt.x,
                pt.y,
                0,
                hwnd,
                None,
            );
            let _ = DestroyMenu(menu);
            command.0 as usize
        };
        if command == IDM_EXIT {
            info!("Exit requested from the tray menu");
            // WM_DESTROY runs the teardown and ends the message loop
            unsafe {
                let _ = DestroyWindow(hwnd);
            }
        }
    }

    /// Shell hook codes arrive in wParam. Language and activation changes
    /// often land before the new layout is visible, so refresh now and
    /// again in a short burst.
    fn on_shell_event(&self, code: usize) {
        match code {
            HSHELL_LANGUAGE | HSHELL_WINDOWACTIVATED | HSHELL_RUDEAPPACTIVATED => {
                self.services.monitor.refresh(false, "shell-hook");
                self.services.monitor.schedule_default_refresh("shell-hook");
            }
            _ => {}
        }
    }

    fn go_live(&self) {
        self.hold_timer.lock().take();
        if self.model.go_live() {
            self.services.monitor.refresh(true, "go-live");
            self.services.orchestrator.reload_mode();
            self.repaint();
        }
    }

    /// Wires every subscription. Failures here degrade, never abort.
    fn start(self: &Arc<Self>) {
        let raw = self.hwnd.load(Ordering::SeqCst);
        let repaint: RepaintHook = Arc::new(move || post(raw, WM_APP_REPAINT));
        self.services.orchestrator.set_on_repaint(repaint);
        // every layout refresh also re-reads the stored mode
        self.services.orchestrator.follow_monitor();

        let settings = &self.services.settings;
        let mut subs = self.subs.lock();

        match ForegroundEvents::subscribe(self.services.monitor.clone()) {
            Ok(events) => subs.events = Some(events),
            Err(e) => warn!("Foreground notifications unavailable, polling only: {}", e),
        }
        subs.shell_hook = unsafe { RegisterShellHookWindow(self.hwnd()) }.as_bool();
        if !subs.shell_hook {
            warn!("RegisterShellHookWindow failed");
        }
        subs.poller = Some(
            self.services
                .monitor
                .spawn_poller(settings.layout.poll_interval()),
        );

        match ToggleWorker::spawn(self.services.orchestrator.clone()) {
            Ok(worker) => {
                let worker = Arc::new(worker);
                let hotkey = HotkeyService::new(
                    ChordConfig::from(&settings.hotkey),
                    self.services.monitor.clone(),
                    worker.clone(),
                );
                match HookThread::spawn(hotkey.clone()) {
                    Ok(hook) => subs.hook = Some(hook),
                    Err(e) => error!("Hotkey unavailable: {}", e),
                }
                subs.hotkey = Some(hotkey);
                subs.worker = Some(worker);
            }
            Err(e) => error!("Could not start the toggle worker: {}", e),
        }

        if settings.cursor_fix.enabled {
            subs.cursor = CursorMonitor::spawn(Arc::new(Win32CursorPlugin), &settings.cursor_fix);
        }
        drop(subs);

        self.services.monitor.refresh(true, "startup");
        self.model.hold();
        self.add_icon();

        // startup work so far counts as the measured init time
        let now = Instant::now();
        let measured_init = now.saturating_duration_since(self.model.started());
        let delay = self.model.release_delay(measured_init, now);
        info!("Holding the neutral icon for {:?}", delay);
        *self.hold_timer.lock() = Some(TimerHandle::after("tray-hold", delay, move || {
            post(raw, WM_APP_GO_LIVE)
        }));
    }

    /// Input sources go first so nothing new is queued; the worker goes last
    /// and finishes any toggle already running.
    fn teardown(&self, hwnd: HWND) {
        info!("Tearing down the tray");
        self.hold_timer.lock().take();
        let subs = std::mem::take(&mut *self.subs.lock());

        if let Some(hook) = subs.hook {
            hook.stop();
        }
        if let Some(hotkey) = &subs.hotkey {
            hotkey.shutdown();
        }
        if let Some(events) = subs.events {
            events.unsubscribe();
        }
        if subs.shell_hook {
            unsafe {
                let _ = DeregisterShellHookWindow(hwnd);
            }
        }
        if let Some(poller) = subs.poller {
            poller.stop();
        }
        if let Some(cursor) = subs.cursor {
            cursor.stop();
        }
        drop(subs.hotkey);
        if let Some(worker) = subs.worker.and_then(|w| Arc::try_unwrap(w).ok()) {
            worker.shutdown();
        }

        self.remove_icon();
        self.icons.release_all();
    }
}

impl WindowHandler for TrayController {
    fn handle(&self, hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> Option<LRESULT> {
        match msg {
            WM_TRAY => {
                // pre-v4 callback: the mouse message is in the low word of lParam
                match (lparam.0 as u32) & 0xFFFF {
                    WM_LBUTTONUP => self.request_toggle("tray"),
                    WM_RBUTTONUP | WM_CONTEXTMENU => self.show_menu(hwnd),
                    _ => {}
                }
                Some(LRESULT(0))
            }
            WM_APP_REPAINT => {
                self.repaint();
                Some(LRESULT(0))
            }
            WM_APP_GO_LIVE => {
                self.go_live();
                Some(LRESULT(0))
            }
            WM_DESTROY => {
                self.teardown(hwnd);
                unsafe { PostQuitMessage(0) };
                Some(LRESULT(0))
            }
            m if m != 0 && m == self.shell_msg => {
                self.on_shell_event(wparam.0);
                Some(LRESULT(0))
            }
            m if m != 0 && m == self.taskbar_created => {
                info!("Taskbar restarted, re-adding the tray icon");
                self.add_icon();
                Some(LRESULT(0))
            }
            _ => None,
        }
    }
}

fn create_window() -> anyhow::Result<HWND> {
    let module = unsafe { GetModuleHandleW(None) }.context("GetModuleHandleW")?;
    let instance: HINSTANCE = module.into();
    let class = w!("tsswitch-tray");

    let wc = WNDCLASSW {
        lpfnWndProc: Some(wndproc),
        hInstance: instance,
        lpszClassName: class,
        ..Default::default()
    };
    if unsafe { RegisterClassW(&wc) } == 0 {
        return Err(anyhow!(
            "RegisterClassW failed: {}",
            windows::core::Error::from_win32()
        ));
    }

    // hidden top-level window; message-only windows miss TaskbarCreated
    let hwnd = unsafe {
        CreateWindowExW(
            WS_EX_TOOLWINDOW,
            class,
            w!("tsswitch"),
            WS_OVERLAPPED,
            0,
            0,
            0,
            0,
            None,
            None,
            instance,
            None,
        )
    };
    if hwnd.0 == 0 {
        return Err(anyhow!(
            "CreateWindowExW failed: {}",
            windows::core::Error::from_win32()
        ));
    }
    Ok(hwnd)
}

/// Runs the tray until the user exits.
pub fn run_tray(services: Services, started: Instant) -> anyhow::Result<()> {
    let hwnd = create_window()?;
    let controller = Arc::new(TrayController::new(services, started));
    controller.hwnd.store(hwnd.0, Ordering::SeqCst);
    *HANDLER.lock() = Some(controller.clone());

    controller.start();
    info!("Tray running");

    // GetMessageW returns false on WM_QUIT, posted from WM_DESTROY
    let mut msg = MSG::default();
    unsafe {
        while GetMessageW(&mut msg, None, 0, 0).as_bool() {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    HANDLER.lock().take();
    info!("Tray stopped");
    Ok(())
}
