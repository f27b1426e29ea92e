use crate::error::{Error, Result};
use crate::store::{RawValue, RegistryBackend};
use tracing::trace;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS, WIN32_ERROR,
};
use windows::Win32::System::Registry::{
    RegCloseKey, RegCreateKeyExW, RegEnumKeyExW, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW,
    HKEY, HKEY_CURRENT_USER, KEY_ENUMERATE_SUB_KEYS, KEY_READ, KEY_WRITE, REG_DWORD,
    REG_EXPAND_SZ, REG_OPTION_NON_VOLATILE, REG_SAM_FLAGS, REG_SZ, REG_VALUE_TYPE,
};

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn check(call: &'static str, what: &str, status: WIN32_ERROR) -> Result<()> {
    match status {
        ERROR_SUCCESS => Ok(()),
        ERROR_FILE_NOT_FOUND => Err(Error::NotFound(what.to_string())),
        ERROR_ACCESS_DENIED => Err(Error::PermissionDenied(what.to_string())),
        other => Err(Error::Os {
            call,
            code: other.0,
        }),
    }
}

/// Open key, closed on drop.
struct Key(HKEY);

impl Key {
    fn open(path: &str, access: REG_SAM_FLAGS) -> Result<Self> {
        let sub = wide(path);
        let mut hkey = HKEY::default();
        let status =
            unsafe { RegOpenKeyExW(HKEY_CURRENT_USER, PCWSTR(sub.as_ptr()), 0, access, &mut hkey) };
        check("RegOpenKeyExW", path, status)?;
        Ok(Self(hkey))
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.0);
        }
    }
}

fn decode_string(bytes: &[u8]) -> String {
    let (text, _) = encoding_rs::UTF_16LE.decode_without_bom_handling(bytes);
    text.trim_end_matches('\0').to_string()
}

/// `HKEY_CURRENT_USER` through the Win32 registry API.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Registry;

impl RegistryBackend for Win32Registry {
    fn read(&self, key: &str, name: &str) -> Result<Option<RawValue>> {
        let handle = match Key::open(key, KEY_READ) {
            Ok(handle) => handle,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let value_name = wide(name);

        // First call only asks for the type and byte size.
        let mut kind = REG_VALUE_TYPE::default();
        let mut size = 0u32;
        let status = unsafe {
            RegQueryValueExW(
                handle.0,
                PCWSTR(value_name.as_ptr()),
                None,
                Some(&mut kind),
                None,
                Some(&mut size),
            )
        };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        check("RegQueryValueExW", name, status)?;

        // The value may have grown in between; `size` comes back as written.
        let mut data = vec![0u8; size as usize];
        let status = unsafe {
            RegQueryValueExW(
                handle.0,
                PCWSTR(value_name.as_ptr()),
                None,
                Some(&mut kind),
                Some(data.as_mut_ptr()),
                Some(&mut size),
            )
        };
        check("RegQueryValueExW", name, status)?;
        data.truncate(size as usize);

        trace!("{}\\{}: type {} with {} bytes", key, name, kind.0, data.len());
        let value = match kind {
            REG_DWORD if data.len() >= 4 => {
                RawValue::Dword(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
            }
            REG_SZ | REG_EXPAND_SZ => RawValue::String(decode_string(&data)),
            // unsupported type: present but not a mode
            _ => RawValue::String(String::new()),
        };
        Ok(Some(value))
    }

    fn write(&self, key: &str, name: &str, value: &RawValue) -> Result<()> {
        let handle = Key::open(key, KEY_WRITE)?;
        let value_name = wide(name);
        let (kind, bytes): (REG_VALUE_TYPE, Vec<u8>) = match value {
            RawValue::Dword(v) => (REG_DWORD, v.to_le_bytes().to_vec()),
            // REG_SZ data is UTF-16LE including the terminating NUL
            RawValue::String(s) => (
                REG_SZ,
                wide(s).iter().flat_map(|unit| unit.to_le_bytes()).collect(),
            ),
        };
        let status = unsafe {
            RegSetValueExW(handle.0, PCWSTR(value_name.as_ptr()), 0, kind, Some(&bytes))
        };
        check("RegSetValueExW", key, status)
    }

    fn create_key(&self, key: &str) -> Result<()> {
        let sub = wide(key);
        let mut hkey = HKEY::default();
        let status = unsafe {
            RegCreateKeyExW(
                HKEY_CURRENT_USER,
                PCWSTR(sub.as_ptr()),
                0,
                PCWSTR::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_WRITE,
                None,
                &mut hkey,
                None,
            )
        };
        check("RegCreateKeyExW", key, status)?;
        drop(Key(hkey));
        Ok(())
    }

    fn subkeys(&self, key: &str) -> Result<Vec<String>> {
        let handle = Key::open(key, KEY_ENUMERATE_SUB_KEYS)?;
        let mut names = Vec::new();
        // key names are limited to 255 characters
        let mut buf = [0u16; 256];
        for index in 0.. {
            let mut len = buf.len() as u32;
            let status = unsafe {
                RegEnumKeyExW(
                    handle.0,
                    index,
                    PWSTR(buf.as_mut_ptr()),
                    &mut len,
                    None,
                    PWSTR::null(),
                    None,
                    None,
                )
            };
            if status == ERROR_NO_MORE_ITEMS {
                break;
            }
            check("RegEnumKeyExW", key, status)?;
            names.push(String::from_utf16_lossy(&buf[..len as usize]));
        }
        Ok(names)
    }
}
