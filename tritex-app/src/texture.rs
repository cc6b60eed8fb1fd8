use std::path::Path;

use eyre::WrapErr;
use tritex_vk::ash::vk;

/// Tightly packed, top-to-bottom RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Texture {
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let decoded = image::open(path)
            .wrap_err_with(|| format!("Failed to decode texture {}", path.display()))?
            .into_rgba8();
        let (width, height) = decoded.dimensions();
        tracing::info!("Loaded texture {} ({width}x{height})", path.display());
        Ok(Self {
            width,
            height,
            pixels: decoded.into_raw(),
        })
    }

    /// Two-tone checkerboard with `cell`-pixel squares.
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let cell = cell.max(1);
        let pixels = (0..size)
            .flat_map(|y| (0..size).map(move |x| (x / cell + y / cell) % 2 == 0))
            .flat_map(|light| {
                if light {
                    [0xee, 0xee, 0xee, 0xff]
                } else {
                    [0x33, 0x33, 0x44, 0xff]
                }
            })
            .collect();
        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    pub fn load_or_checkerboard(path: Option<&Path>) -> eyre::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                tracing::debug!("No texture given, using a checkerboard");
                Ok(Self::checkerboard(256, 32))
            }
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let tex = Texture::checkerboard(4, 2);
        assert_eq!(tex.pixels.len(), 4 * 4 * 4);
        let px = |x: usize, y: usize| &tex.pixels[(y * 4 + x) * 4..][..4];
        assert_eq!(px(0, 0), px(1, 1));
        assert_ne!(px(0, 0), px(2, 0));
        assert_ne!(px(0, 0), px(0, 2));
        assert_eq!(px(0, 0), px(2, 2));
        assert!(tex.pixels.chunks(4).all(|p| p[3] == 0xff));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = Texture::load(Path::new("definitely/not/here.png")).unwrap_err();
        assert!(format!("{err}").contains("definitely/not/here.png"));
    }
}
