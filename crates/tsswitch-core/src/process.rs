use crate::error::{Error, Result};
use crate::refresher::ProcessControl;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, BOOL, E_ACCESSDENIED, HANDLE, HWND};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
use windows::Win32::UI::Shell::ShellExecuteW;
use windows::Win32::UI::WindowsAndMessaging::{SW_HIDE, SW_SHOWNORMAL};

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

struct Handle(HANDLE);

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn exe_name(entry: &PROCESSENTRY32W) -> String {
    let len = entry
        .szExeFile
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(entry.szExeFile.len());
    String::from_utf16_lossy(&entry.szExeFile[..len])
}

/// Process ids whose executable name matches, case-insensitively.
fn find_processes(name: &str) -> Result<Vec<u32>> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map_err(|e| Error::os("CreateToolhelp32Snapshot", &e))?;
    let snapshot = Handle(snapshot);

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    // Process32NextW errors with ERROR_NO_MORE_FILES at the end of the list.
    let mut pids = Vec::new();
    let mut more = unsafe { Process32FirstW(snapshot.0, &mut entry) }.is_ok();
    while more {
        if exe_name(&entry).eq_ignore_ascii_case(name) {
            pids.push(entry.th32ProcessID);
        }
        more = unsafe { Process32NextW(snapshot.0, &mut entry) }.is_ok();
    }
    Ok(pids)
}

fn shell_execute(verb: &str, file: &str, params: Option<&str>, show: bool) -> Result<()> {
    let verb = wide(verb);
    let file = wide(file);
    let params = params.map(wide);
    let result = unsafe {
        ShellExecuteW(
            HWND::default(),
            PCWSTR(verb.as_ptr()),
            PCWSTR(file.as_ptr()),
            params
                .as_ref()
                .map_or(PCWSTR::null(), |p| PCWSTR(p.as_ptr())),
            PCWSTR::null(),
            if show { SW_SHOWNORMAL } else { SW_HIDE },
        )
    };
    // values above 32 mean success
    if result.0 > 32 {
        Ok(())
    } else {
        Err(Error::Os {
            call: "ShellExecuteW",
            code: result.0 as u32,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Win32ProcessControl;

impl ProcessControl for Win32ProcessControl {
    fn terminate(&self, name: &str) -> Result<u32> {
        let pids = find_processes(name)?;
        if pids.is_empty() {
            return Err(Error::NotFound(name.to_string()));
        }

        let mut stopped = 0;
        let mut denied = false;
        for pid in pids {
            // ctfmon runs per session; other users' copies deny access
            let process = match unsafe { OpenProcess(PROCESS_TERMINATE, BOOL::from(false), pid) } {
                Ok(handle) => Handle(handle),
                Err(e) if e.code() == E_ACCESSDENIED => {
                    denied = true;
                    continue;
                }
                Err(e) => {
                    warn!("OpenProcess({}) failed: {}", pid, e);
                    continue;
                }
            };
            match unsafe { TerminateProcess(process.0, 0) } {
                Ok(()) => {
                    debug!("Terminated {} (pid {})", name, pid);
                    stopped += 1;
                }
                Err(e) if e.code() == E_ACCESSDENIED => denied = true,
                Err(e) => warn!("TerminateProcess({}) failed: {}", pid, e),
            }
        }

        if denied && stopped == 0 {
            return Err(Error::PermissionDenied(name.to_string()));
        }
        info!("Stopped {} instance(s) of {}", stopped, name);
        Ok(stopped)
    }

    /// Shows a UAC prompt. Returns once taskkill is started, not when it ends.
    fn terminate_elevated(&self, name: &str) -> Result<()> {
        let params = format!("/F /IM {name}");
        shell_execute("runas", "taskkill.exe", Some(&params), false)
    }

    fn launch(&self, path: &Path) -> Result<()> {
        Command::new(path).spawn()?;
        Ok(())
    }

    fn shell_launch(&self, path: &Path) -> Result<()> {
        shell_execute("open", &path.to_string_lossy(), None, true)
    }
}
