pub mod chord;
pub mod clock;
pub mod config;
pub mod cursor_fix;
pub mod error;
pub mod hotkey;
pub mod layout_monitor;
pub mod orchestrator;
pub mod refresher;
pub mod store;
pub mod tray_model;
pub mod types;

#[cfg(windows)]
pub mod foreground_events;
#[cfg(windows)]
pub mod ime;
#[cfg(windows)]
pub mod keyboard_hook;
#[cfg(windows)]
pub mod process;
#[cfg(windows)]
pub mod registry;

pub use error::{Error, Result};
pub use types::{Key, KeyAction, KeyEvent, LayoutId, LayoutSnapshot, OutputMode};
