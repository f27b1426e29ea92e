use crate::clock::{Clock, SystemClock};
use crate::config::HelperSettings;
use crate::error::{Error, Result};
use crate::types::LayoutId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Requests a layout change on the foreground window.
pub trait LayoutSwitcher: Send + Sync {
    fn activate(&self, layout: LayoutId) -> Result<()>;
}

/// Start/stop of the input-method helper process.
pub trait ProcessControl: Send + Sync {
    /// Returns how many instances were stopped. `NotFound` when none run,
    /// `PermissionDenied` when elevation is needed.
    fn terminate(&self, name: &str) -> Result<u32>;
    fn terminate_elevated(&self, name: &str) -> Result<()>;
    fn launch(&self, path: &Path) -> Result<()>;
    fn shell_launch(&self, path: &Path) -> Result<()>;
}

/// Makes a freshly written mode visible in the focused application.
pub trait LiveRefresh: Send + Sync {
    fn refresh_active_layout(&self) -> RefreshReport;
}

/// Does nothing; for dry runs where no live session should be touched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRefresh;

impl LiveRefresh for NoRefresh {
    fn refresh_active_layout(&self) -> RefreshReport {
        RefreshReport {
            switched_away: true,
            stop: StopOutcome::Skipped,
            start: StartOutcome::Skipped,
            switched_back: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Skipped,
    Stopped(u32),
    NotRunning,
    Elevated,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Skipped,
    Direct,
    Shell,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub switched_away: bool,
    pub stop: StopOutcome,
    pub start: StartOutcome,
    pub switched_back: bool,
}

impl RefreshReport {
    /// The mode is written either way; this only says the live refresh
    /// did not fully happen.
    pub fn degraded(&self) -> bool {
        !self.switched_away
            || !self.switched_back
            || matches!(self.stop, StopOutcome::Failed(_))
            || matches!(self.start, StartOutcome::Failed(_))
    }
}

pub struct HelperProcessRefresher {
    switcher: Arc<dyn LayoutSwitcher>,
    process: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
    target: LayoutId,
    neutral: LayoutId,
    settings: HelperSettings,
    helper_path: PathBuf,
}

impl HelperProcessRefresher {
    pub fn new(
        switcher: Arc<dyn LayoutSwitcher>,
        process: Arc<dyn ProcessControl>,
        target: LayoutId,
        neutral: LayoutId,
        settings: HelperSettings,
    ) -> Self {
        Self::with_clock(switcher, process, target, neutral, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        switcher: Arc<dyn LayoutSwitcher>,
        process: Arc<dyn ProcessControl>,
        target: LayoutId,
        neutral: LayoutId,
        settings: HelperSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let helper_path = settings.resolved_path();
        Self {
            switcher,
            process,
            clock,
            target,
            neutral,
            settings,
            helper_path,
        }
    }

    /// Switch away and back so the focused app re-reads the IME settings,
    /// restarting the helper in between.
    fn run_sequence(&self) -> RefreshReport {
        let switched_away = match self.switcher.activate(self.neutral) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not switch to {}: {}", self.neutral, e);
                false
            }
        };

        let (stop, start) = if switched_away {
            self.clock.sleep(self.settings.settle());
            let stop = self.stop_helper();
            let start = self.start_helper();
            (stop, start)
        } else {
            (StopOutcome::Skipped, StartOutcome::Skipped)
        };

        self.clock.sleep(self.settings.settle());
        let switched_back = match self.switcher.activate(self.target) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not switch back to {}: {}", self.target, e);
                false
            }
        };

        let report = RefreshReport {
            switched_away,
            stop,
            start,
            switched_back,
        };
        if report.degraded() {
            warn!("Live refresh degraded: {:?}", report);
        } else {
            info!("Live refresh done: {:?}", report);
        }
        report
    }

    fn stop_helper(&self) -> StopOutcome {
        let name = &self.settings.process_name;
        match self.process.terminate(name) {
            Ok(count) => StopOutcome::Stopped(count),
            Err(Error::NotFound(_)) => StopOutcome::NotRunning,
            Err(Error::PermissionDenied(_)) => {
                info!("Stopping {} needs elevation, asking for it", name);
                match self.process.terminate_elevated(name) {
                    Ok(()) => StopOutcome::Elevated,
                    Err(e) => StopOutcome::Failed(e.to_string()),
                }
            }
            Err(e) => StopOutcome::Failed(e.to_string()),
        }
    }

    fn start_helper(&self) -> StartOutcome {
        let direct = match self.process.launch(&self.helper_path) {
            Ok(()) => return StartOutcome::Direct,
            Err(e) => e,
        };
        warn!(
            "Direct launch of {} failed ({}), trying the shell",
            self.helper_path.display(),
            direct
        );
        match self.process.shell_launch(&self.helper_path) {
            Ok(()) => StartOutcome::Shell,
            Err(e) => StartOutcome::Failed(format!("direct: {direct}; shell: {e}")),
        }
    }
}

impl LiveRefresh for HelperProcessRefresher {
    fn refresh_active_layout(&self) -> RefreshReport {
        self.run_sequence()
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingSwitcher {
        pub activated: Mutex<Vec<LayoutId>>,
        pub fail: Mutex<Vec<LayoutId>>,
    }

    impl LayoutSwitcher for RecordingSwitcher {
        fn activate(&self, layout: LayoutId) -> Result<()> {
            self.activated.lock().push(layout);
            if self.fail.lock().contains(&layout) {
                return Err(Error::Os {
                    call: "PostMessageW",
                    code: 5,
                });
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TerminateBehavior {
        Stops,
        NotRunning,
        Denied,
    }

    pub struct ScriptedProcess {
        pub terminate: TerminateBehavior,
        pub elevated_ok: bool,
        pub launch_ok: bool,
        pub shell_ok: bool,
        pub calls: Mutex<Vec<&'static str>>,
    }

    impl Default for ScriptedProcess {
        fn default() -> Self {
            Self {
                terminate: TerminateBehavior::Stops,
                elevated_ok: true,
                launch_ok: true,
                shell_ok: true,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    fn outcome(ok: bool, call: &'static str) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(Error::Os { call, code: 2 })
        }
    }

    impl ProcessControl for ScriptedProcess {
        fn terminate(&self, name: &str) -> Result<u32> {
            self.calls.lock().push("terminate");
            match self.terminate {
                TerminateBehavior::Stops => Ok(1),
                TerminateBehavior::NotRunning => Err(Error::NotFound(name.to_string())),
                TerminateBehavior::Denied => Err(Error::PermissionDenied(name.to_string())),
            }
        }

        fn terminate_elevated(&self, _name: &str) -> Result<()> {
            self.calls.lock().push("terminate_elevated");
            outcome(self.elevated_ok, "ShellExecuteW")
        }

        fn launch(&self, _path: &Path) -> Result<()> {
            self.calls.lock().push("launch");
            outcome(self.launch_ok, "CreateProcess")
        }

        fn shell_launch(&self, _path: &Path) -> Result<()> {
            self.calls.lock().push("shell_launch");
            outcome(self.shell_ok, "ShellExecuteW")
        }
    }
}
