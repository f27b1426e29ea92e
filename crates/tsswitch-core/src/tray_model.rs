use crate::config::IconPaths;
use crate::error::Result;
use crate::types::{LayoutSnapshot, OutputMode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayPhase {
    Uninitialized,
    /// Icon is up but pinned to the neutral look until the hold ends.
    Held,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IconKind {
    Default,
    Simplified,
    Traditional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconChoice {
    pub icon: IconKind,
    pub tooltip: String,
}

impl IconChoice {
    fn new(icon: IconKind, tooltip: impl Into<String>) -> Self {
        Self {
            icon,
            tooltip: tooltip.into(),
        }
    }
}

/// First matching row wins.
pub fn resolve_icon(
    phase: TrayPhase,
    layout: Option<&LayoutSnapshot>,
    mode: OutputMode,
) -> IconChoice {
    if phase != TrayPhase::Live {
        return IconChoice::new(IconKind::Default, "Initializing…");
    }
    match layout {
        Some(snapshot) if snapshot.is_target => {}
        other => {
            let current = other.map_or_else(|| "unknown".to_string(), |s| s.layout.to_string());
            return IconChoice::new(
                IconKind::Default,
                format!("Switch to the Bopomofo input method (current: {current})"),
            );
        }
    }
    match mode {
        OutputMode::Simplified => IconChoice::new(IconKind::Simplified, "Simplified output"),
        OutputMode::Traditional => IconChoice::new(IconKind::Traditional, "Traditional output"),
        OutputMode::Unknown => IconChoice::new(IconKind::Default, "State updating…"),
    }
}

/// How long the hold still has to run: `max(floor, measured_init) - elapsed`,
/// never negative.
pub fn hold_delay(floor: Duration, measured_init: Duration, elapsed: Duration) -> Duration {
    floor.max(measured_init).saturating_sub(elapsed)
}

pub struct TrayModel {
    phase: Mutex<TrayPhase>,
    started: Instant,
    hold_floor: Duration,
}

impl TrayModel {
    pub fn new(hold_floor: Duration, started: Instant) -> Self {
        Self {
            phase: Mutex::new(TrayPhase::Uninitialized),
            started,
            hold_floor,
        }
    }

    pub fn phase(&self) -> TrayPhase {
        *self.phase.lock()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Icon registered; start holding.
    pub fn hold(&self) {
        let mut phase = self.phase.lock();
        if *phase == TrayPhase::Uninitialized {
            *phase = TrayPhase::Held;
        }
    }

    pub fn release_delay(&self, measured_init: Duration, now: Instant) -> Duration {
        hold_delay(
            self.hold_floor,
            measured_init,
            now.saturating_duration_since(self.started),
        )
    }

    /// Returns true on the Held -> Live transition only.
    pub fn go_live(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == TrayPhase::Held {
            *phase = TrayPhase::Live;
            info!("Tray is live");
            true
        } else {
            false
        }
    }

    pub fn choice(&self, layout: Option<&LayoutSnapshot>, mode: OutputMode) -> IconChoice {
        resolve_icon(self.phase(), layout, mode)
    }
}

/// Turns an image file into an OS icon.
pub trait IconRenderer: Send + Sync {
    type Icon: Copy + PartialEq + fmt::Debug + Send;

    fn render(&self, path: &Path, size: u32) -> Result<Self::Icon>;
    /// Stock icon used when rendering fails. Never released.
    fn fallback(&self) -> Self::Icon;
    fn release(&self, icon: Self::Icon);
}

/// Lazily rendered icons, kept for the life of the process.
pub struct IconCache<R: IconRenderer> {
    renderer: R,
    paths: IconPaths,
    size: u32,
    cache: Mutex<HashMap<IconKind, Option<R::Icon>>>,
}

impl<R: IconRenderer> IconCache<R> {
    pub fn new(renderer: R, paths: IconPaths, size: u32) -> Self {
        Self {
            renderer,
            paths,
            size,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, kind: IconKind) -> Option<PathBuf> {
        let specific = match kind {
            IconKind::Default => None,
            IconKind::Simplified => self.paths.simplified.clone(),
            IconKind::Traditional => self.paths.traditional.clone(),
        };
        specific.or_else(|| self.paths.default.clone())
    }

    /// Rendered once per kind; a failed render is remembered and falls back.
    pub fn get(&self, kind: IconKind) -> R::Icon {
        let cached = self.cache.lock().get(&kind).copied();
        if let Some(cached) = cached {
            return cached.unwrap_or_else(|| self.renderer.fallback());
        }

        let rendered = match self.path_for(kind) {
            Some(path) => match self.renderer.render(&path, self.size) {
                Ok(icon) => {
                    debug!("Rendered {:?} icon from {}", kind, path.display());
                    Some(icon)
                }
                Err(e) => {
                    warn!("Icon {} failed to render: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        // another thread may have raced us; keep the first entry
        let entry = *self.cache.lock().entry(kind).or_insert(rendered);
        if entry != rendered {
            if let Some(icon) = rendered {
                self.renderer.release(icon);
            }
        }
        entry.unwrap_or_else(|| self.renderer.fallback())
    }

    pub fn release_all(&self) {
        let drained: Vec<_> = self.cache.lock().drain().collect();
        for (_, icon) in drained {
            if let Some(icon) = icon {
                self.renderer.release(icon);
            }
        }
    }
}

impl<R: IconRenderer> Drop for IconCache<R> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::LayoutId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, OnceLock, Weak};

    fn zh_tw() -> LayoutSnapshot {
        LayoutSnapshot {
            layout: LayoutId(0x0404),
            is_target: true,
        }
    }

    #[test]
    fn table_rows_in_order() {
        let en = LayoutSnapshot {
            layout: LayoutId(0x0409),
            is_target: false,
        };
        let held = resolve_icon(TrayPhase::Held, Some(&zh_tw()), OutputMode::Simplified);
        assert_eq!(held, IconChoice::new(IconKind::Default, "Initializing…"));

        let other = resolve_icon(TrayPhase::Live, Some(&en), OutputMode::Simplified);
        assert_eq!(other.icon, IconKind::Default);
        assert!(other.tooltip.contains("en-US"));

        let none = resolve_icon(TrayPhase::Live, None, OutputMode::Traditional);
        assert!(none.tooltip.ends_with("(current: unknown)"));

        let live = |mode| resolve_icon(TrayPhase::Live, Some(&zh_tw()), mode);
        assert_eq!(
            live(OutputMode::Simplified),
            IconChoice::new(IconKind::Simplified, "Simplified output")
        );
        assert_eq!(
            live(OutputMode::Traditional),
            IconChoice::new(IconKind::Traditional, "Traditional output")
        );
        assert_eq!(
            live(OutputMode::Unknown),
            IconChoice::new(IconKind::Default, "State updating…")
        );
    }

    #[test]
    fn hold_delay_never_negative() {
        let s = Duration::from_secs;
        assert_eq!(hold_delay(s(2), s(1), Duration::ZERO), s(2));
        assert_eq!(hold_delay(s(2), s(3), s(1)), s(2));
        assert_eq!(hold_delay(s(2), s(1), s(5)), Duration::ZERO);
    }

    #[test]
    fn model_goes_live_once_after_hold() {
        let model = TrayModel::new(Duration::from_secs(2), Instant::now());
        assert!(!model.go_live());
        model.hold();
        assert_eq!(model.phase(), TrayPhase::Held);
        assert!(model.go_live());
        assert!(!model.go_live());
        assert_eq!(model.phase(), TrayPhase::Live);
    }

    #[derive(Default)]
    struct CountingRenderer {
        renders: AtomicUsize,
        released: Arc<AtomicUsize>,
    }

    impl IconRenderer for CountingRenderer {
        type Icon = u32;

        fn render(&self, path: &Path, _size: u32) -> Result<u32> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            if path.ends_with("broken.png") {
                return Err(Error::ResourceInit("bad image".into()));
            }
            Ok(path.to_string_lossy().len() as u32)
        }

        fn fallback(&self) -> u32 {
            0
        }

        fn release(&self, _icon: u32) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn icons_render_once_and_fall_back() {
        let released = Arc::new(AtomicUsize::new(0));
        let renderer = CountingRenderer {
            released: released.clone(),
            ..CountingRenderer::default()
        };
        let paths = IconPaths {
            default: Some(PathBuf::from("default.png")),
            simplified: Some(PathBuf::from("broken.png")),
            traditional: None,
        };
        let cache = IconCache::new(renderer, paths, 32);

        let default = cache.get(IconKind::Default);
        assert_ne!(default, 0);
        assert_eq!(cache.get(IconKind::Default), default);
        assert_eq!(cache.get(IconKind::Simplified), 0);
        assert_eq!(cache.get(IconKind::Simplified), 0);
        assert_eq!(cache.get(IconKind::Traditional), default);
        assert_eq!(cache.renderer.renders.load(Ordering::SeqCst), 3);

        cache.release_all();
        assert_eq!(released.load(Ordering::SeqCst), 2);
        drop(cache);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    /// Fails every render and checks the cache lock from inside `fallback`.
    struct LockCheckingRenderer {
        owner: Arc<OnceLock<Weak<IconCache<LockCheckingRenderer>>>>,
        fallbacks: AtomicUsize,
    }

    impl IconRenderer for LockCheckingRenderer {
        type Icon = u32;

        fn render(&self, _path: &Path, _size: u32) -> Result<u32> {
            Err(Error::ResourceInit("unreadable".into()))
        }

        fn fallback(&self) -> u32 {
            if let Some(cache) = self.owner.get().and_then(Weak::upgrade) {
                assert!(cache.cache.try_lock().is_some(), "cache locked during fallback");
            }
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
            7
        }

        fn release(&self, _icon: u32) {}
    }

    #[test]
    fn fallback_runs_without_the_cache_lock() {
        let owner = Arc::new(OnceLock::new());
        let renderer = LockCheckingRenderer {
            owner: owner.clone(),
            fallbacks: AtomicUsize::new(0),
        };
        let paths = IconPaths {
            default: Some(PathBuf::from("default.png")),
            ..IconPaths::default()
        };
        let cache = Arc::new(IconCache::new(renderer, paths, 16));
        owner.set(Arc::downgrade(&cache)).unwrap();

        assert_eq!(cache.get(IconKind::Default), 7);
        assert_eq!(cache.get(IconKind::Default), 7);
        assert_eq!(cache.renderer.fallbacks.load(Ordering::SeqCst), 2);
    }
}
