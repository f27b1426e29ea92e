use image::imageops::FilterType;
use image::ImageFormat;
use std::io::Cursor;
use std::path::Path;
use tsswitch_core::{Error, Result};

/// Decodes any supported image and re-encodes it as a square PNG.
pub fn prepare_icon_png(path: &Path, size: u32) -> Result<Vec<u8>> {
    let img = image::open(path)
        .map_err(|e| Error::ResourceInit(format!("{}: {e}", path.display())))?;
    let img = if img.width() == size && img.height() == size {
        img
    } else {
        img.resize_exact(size, size, FilterType::Lanczos3)
    };
    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)
        .map_err(|e| Error::ResourceInit(format!("{}: {e}", path.display())))?;
    Ok(png.into_inner())
}

#[cfg(windows)]
pub use win32::Win32IconRenderer;

#[cfg(windows)]
mod win32 {
    use super::prepare_icon_png;
    use std::path::Path;
    use tsswitch_core::tray_model::IconRenderer;
    use tsswitch_core::{Error, Result};
    use windows::Win32::Foundation::BOOL;
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateIconFromResourceEx, DestroyIcon, LoadIconW, HICON, IDI_APPLICATION, LR_DEFAULTCOLOR,
    };

    const ICON_RESOURCE_VERSION: u32 = 0x0003_0000;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct Win32IconRenderer;

    impl IconRenderer for Win32IconRenderer {
        type Icon = HICON;

        fn render(&self, path: &Path, size: u32) -> Result<HICON> {
            let png = prepare_icon_png(path, size)?;
            unsafe {
                CreateIconFromResourceEx(
                    &png,
                    BOOL::from(true),
                    ICON_RESOURCE_VERSION,
                    size as i32,
                    size as i32,
                    LR_DEFAULTCOLOR,
                )
            }
            .map_err(|e| Error::os("CreateIconFromResourceEx", &e))
        }

        fn fallback(&self) -> HICON {
            unsafe { LoadIconW(None, IDI_APPLICATION) }.unwrap_or_default()
        }

        fn release(&self, icon: HICON) {
            unsafe {
                let _ = DestroyIcon(icon);
            }
        }
    }
}
