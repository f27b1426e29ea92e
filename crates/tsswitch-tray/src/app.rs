use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tsswitch_core::config::Settings;
use tsswitch_core::layout_monitor::{FixedLayout, LayoutMonitor, LayoutSource};
use tsswitch_core::orchestrator::ModeToggleOrchestrator;
use tsswitch_core::refresher::{
    HelperProcessRefresher, LayoutSwitcher, LiveRefresh, NoRefresh, ProcessControl,
};
use tsswitch_core::store::{ConfigStore, MemoryRegistry, RegistryBackend};
use tsswitch_core::{LayoutSnapshot, OutputMode};

/// OS access the services are built on.
pub struct Backends {
    pub registry: Arc<dyn RegistryBackend>,
    pub layout: Arc<dyn LayoutSource>,
    pub refresh: Option<(Arc<dyn LayoutSwitcher>, Arc<dyn ProcessControl>)>,
}

impl Backends {
    /// In-memory registry, target layout always in front, no live refresh.
    pub fn dry_run(settings: &Settings) -> Self {
        Self {
            registry: Arc::new(MemoryRegistry::new()),
            layout: Arc::new(FixedLayout(settings.layout.target)),
            refresh: None,
        }
    }

    #[cfg(windows)]
    pub fn native() -> Self {
        use tsswitch_core::ime::{Win32LayoutSource, Win32LayoutSwitcher};
        use tsswitch_core::process::Win32ProcessControl;
        use tsswitch_core::registry::Win32Registry;

        Self {
            registry: Arc::new(Win32Registry),
            layout: Arc::new(Win32LayoutSource),
            refresh: Some((Arc::new(Win32LayoutSwitcher), Arc::new(Win32ProcessControl))),
        }
    }
}

pub struct Services {
    pub settings: Settings,
    pub store: Arc<ConfigStore>,
    pub monitor: Arc<LayoutMonitor>,
    pub orchestrator: Arc<ModeToggleOrchestrator>,
}

impl Services {
    pub fn build(settings: Settings, backends: Backends) -> Self {
        let store = Arc::new(ConfigStore::discover(backends.registry, &settings.store));
        let monitor = Arc::new(LayoutMonitor::new(backends.layout, settings.layout.clone()));

        let refresher: Arc<dyn LiveRefresh> = match backends.refresh {
            Some((switcher, process)) => Arc::new(HelperProcessRefresher::new(
                switcher,
                process,
                settings.layout.target,
                settings.layout.neutral,
                settings.helper.clone(),
            )),
            None => Arc::new(NoRefresh),
        };

        let orchestrator = Arc::new(ModeToggleOrchestrator::new(
            store.clone(),
            monitor.clone(),
            refresher,
            settings.toggle.clone(),
        ));

        Self {
            settings,
            store,
            monitor,
            orchestrator,
        }
    }

    pub fn status(&self) -> Status {
        self.monitor.refresh(false, "status");
        let persisted = self.store.find();
        Status {
            layout: self.monitor.current(),
            mode: self.orchestrator.reload_mode(),
            location: persisted.map(|v| v.location),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub layout: Option<LayoutSnapshot>,
    pub mode: OutputMode,
    pub location: Option<String>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.layout {
            Some(s) => writeln!(
                f,
                "layout:   {}{}",
                s.layout,
                if s.is_target { " (target)" } else { "" }
            )?,
            None => writeln!(f, "layout:   unknown")?,
        }
        writeln!(f, "mode:     {}", self.mode)?;
        write!(
            f,
            "location: {}",
            self.location.as_deref().unwrap_or("<not stored>")
        )
    }
}
