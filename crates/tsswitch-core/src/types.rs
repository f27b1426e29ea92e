use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Output variant of the Bopomofo IME.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Traditional,
    Simplified,
    Unknown,
}

impl OutputMode {
    /// Raw integer stored in the registry, `None` for `Unknown`.
    pub const fn as_raw(self) -> Option<u32> {
        match self {
            Self::Traditional => Some(0),
            Self::Simplified => Some(1),
            Self::Unknown => None,
        }
    }

    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Traditional,
            1 => Self::Simplified,
            _ => Self::Unknown,
        }
    }

    /// The mode a toggle moves to. `Unknown` counts as `Traditional`.
    pub const fn complement(self) -> Self {
        match self {
            Self::Simplified => Self::Traditional,
            Self::Traditional | Self::Unknown => Self::Simplified,
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Traditional => "traditional",
            Self::Simplified => "simplified",
            Self::Unknown => "unknown",
        })
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "traditional" | "trad" | "t" | "0" => Ok(Self::Traditional),
            "simplified" | "simp" | "s" | "1" => Ok(Self::Simplified),
            other => Err(format!("unknown output mode '{other}'")),
        }
    }
}

/// Windows LANGID: primary language in the low 10 bits, sublanguage above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutId(pub u16);

impl LayoutId {
    pub const fn primary(self) -> u16 {
        self.0 & 0x03FF
    }

    pub const fn sublanguage(self) -> u16 {
        self.0 >> 10
    }

    /// Low word of an HKL.
    pub const fn from_hkl(hkl: isize) -> Self {
        Self((hkl as usize & 0xFFFF) as u16)
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0x0404 => "zh-TW",
            0x0804 => "zh-CN",
            0x0C04 => "zh-HK",
            0x1004 => "zh-SG",
            0x1404 => "zh-MO",
            0x0409 => "en-US",
            0x0809 => "en-GB",
            0x0411 => "ja-JP",
            0x0412 => "ko-KR",
            0x0407 => "de-DE",
            0x040C => "fr-FR",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:04X})", self.0),
            None => write!(
                f,
                "lang {:03X}/sub {:X} ({:04X})",
                self.primary(),
                self.sublanguage(),
                self.0
            ),
        }
    }
}

/// What the monitor last saw in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayoutSnapshot {
    pub layout: LayoutId,
    pub is_target: bool,
}

/// Logical key names the chord detector works with. Left/right variants of
/// modifiers collapse into one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Key {
    Ctrl,
    Shift,
    Alt,
    Win,
    Space,
    Enter,
    Tab,
    Escape,
    CapsLock,
    Backspace,
    /// `a`..`z`, `0`..`9`
    Char(char),
    /// F1..F24
    Function(u8),
    /// Anything else, by virtual-key code.
    Other(u16),
}

pub mod vk {
    pub const BACK: u32 = 0x08;
    pub const TAB: u32 = 0x09;
    pub const RETURN: u32 = 0x0D;
    pub const SHIFT: u32 = 0x10;
    pub const CONTROL: u32 = 0x11;
    pub const MENU: u32 = 0x12;
    pub const CAPITAL: u32 = 0x14;
    pub const ESCAPE: u32 = 0x1B;
    pub const SPACE: u32 = 0x20;
    pub const LWIN: u32 = 0x5B;
    pub const RWIN: u32 = 0x5C;
    pub const F1: u32 = 0x70;
    pub const F24: u32 = 0x87;
    pub const LSHIFT: u32 = 0xA0;
    pub const RSHIFT: u32 = 0xA1;
    pub const LCONTROL: u32 = 0xA2;
    pub const RCONTROL: u32 = 0xA3;
    pub const LMENU: u32 = 0xA4;
    pub const RMENU: u32 = 0xA5;
}

impl Key {
    pub fn from_vk(code: u32) -> Self {
        match code {
            vk::CONTROL | vk::LCONTROL | vk::RCONTROL => Self::Ctrl,
            vk::SHIFT | vk::LSHIFT | vk::RSHIFT => Self::Shift,
            vk::MENU | vk::LMENU | vk::RMENU => Self::Alt,
            vk::LWIN | vk::RWIN => Self::Win,
            vk::SPACE => Self::Space,
            vk::RETURN => Self::Enter,
            vk::TAB => Self::Tab,
            vk::ESCAPE => Self::Escape,
            vk::CAPITAL => Self::CapsLock,
            vk::BACK => Self::Backspace,
            0x30..=0x39 => Self::Char(char::from(code as u8)),
            0x41..=0x5A => Self::Char(char::from(code as u8).to_ascii_lowercase()),
            vk::F1..=vk::F24 => Self::Function((code - vk::F1 + 1) as u8),
            other => Self::Other(other as u16),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ctrl => f.write_str("ctrl"),
            Self::Shift => f.write_str("shift"),
            Self::Alt => f.write_str("alt"),
            Self::Win => f.write_str("win"),
            Self::Space => f.write_str("space"),
            Self::Enter => f.write_str("enter"),
            Self::Tab => f.write_str("tab"),
            Self::Escape => f.write_str("esc"),
            Self::CapsLock => f.write_str("capslock"),
            Self::Backspace => f.write_str("backspace"),
            Self::Char(c) => write!(f, "{c}"),
            Self::Function(n) => write!(f, "f{n}"),
            Self::Other(code) => write!(f, "vk{code:02X}"),
        }
    }
}

impl FromStr for Key {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let key = match lower.as_str() {
            "ctrl" | "control" => Self::Ctrl,
            "shift" => Self::Shift,
            "alt" | "menu" => Self::Alt,
            "win" | "windows" => Self::Win,
            "space" => Self::Space,
            "enter" | "return" => Self::Enter,
            "tab" => Self::Tab,
            "esc" | "escape" => Self::Escape,
            "capslock" | "caps" => Self::CapsLock,
            "backspace" => Self::Backspace,
            _ => {
                let mut chars = lower.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphanumeric() => Self::Char(c),
                    _ => {
                        if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<u8>().ok())
                        {
                            if (1..=24).contains(&n) {
                                return Ok(Self::Function(n));
                            }
                        }
                        if let Some(code) = lower
                            .strip_prefix("vk")
                            .and_then(|c| u16::from_str_radix(c, 16).ok())
                        {
                            return Ok(Self::Other(code));
                        }
                        return Err(format!("unknown key name '{s}'"));
                    }
                }
            }
        };
        Ok(key)
    }
}

impl TryFrom<String> for Key {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEdge {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub edge: KeyEdge,
}

impl KeyEvent {
    pub const fn down(key: Key) -> Self {
        Self {
            key,
            edge: KeyEdge::Down,
        }
    }

    pub const fn up(key: Key) -> Self {
        Self {
            key,
            edge: KeyEdge::Up,
        }
    }
}

/// Action to be taken by the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Pass,
    Block,
}
