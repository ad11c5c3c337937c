//! Launcher icon replacement.

use crate::core::archive::{ArchiveSession, ZipFileOptions};
use crate::core::error::{ArchiveResultExt, PatchError, Result};
use anyhow::Context;
use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{DynamicImage, GenericImageView, ImageOutputFormat, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Supplies replacement artwork by logical icon name.
#[cfg_attr(test, mockall::automock)]
pub trait AssetSource: Send + Sync {
    /// PNG bytes for `name`, or `None` when there is no replacement for it.
    fn asset(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Reads `<dir>/<name>.png`.
pub struct DirAssetSource {
    dir: PathBuf,
}

impl DirAssetSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl AssetSource for DirAssetSource {
    fn asset(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.dir.join(format!("{name}.png"));
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("While reading icon `{}`", path.display()))?;
        Ok(Some(bytes))
    }
}

pub struct Scaler {
    img: DynamicImage,
}

impl Scaler {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let img = image::load_from_memory(bytes)?;
        let (width, height) = img.dimensions();
        anyhow::ensure!(width == height, "expected width == height");
        anyhow::ensure!(width > 0, "expected a non-empty image");
        let mut scaler = Self { img };
        scaler.optimize();
        Ok(scaler)
    }

    /// Drops colour or alpha channels the image does not use.
    fn optimize(&mut self) {
        let mut is_grayscale = true;
        let mut is_opaque = true;
        for (_, _, pixel) in self.img.pixels() {
            if pixel[0] != pixel[1] || pixel[1] != pixel[2] {
                is_grayscale = false;
            }
            if pixel[3] != 255 {
                is_opaque = false;
            }
            if !is_grayscale && !is_opaque {
                break;
            }
        }
        match (is_grayscale, is_opaque) {
            (true, true) => self.img = DynamicImage::ImageLuma8(self.img.to_luma8()),
            (true, false) => self.img = DynamicImage::ImageLumaA8(self.img.to_luma_alpha8()),
            (false, true) => self.img = DynamicImage::ImageRgb8(self.img.to_rgb8()),
            (false, false) => {}
        }
    }

    /// PNG of `width`x`height`; non-square targets get the scaled icon centred on a
    /// transparent canvas.
    pub fn write_png(&self, width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
        let scaled_size = width.min(height);
        let resized = self.img.resize(scaled_size, scaled_size, FilterType::Nearest);
        let mut out = Cursor::new(Vec::new());
        if scaled_size == width && scaled_size == height {
            resized.write_to(&mut out, ImageOutputFormat::Png)?;
        } else {
            let x = (width - scaled_size) / 2;
            let y = (height - scaled_size) / 2;
            let mut padded = RgbaImage::new(width, height);
            image::imageops::overlay(&mut padded, &resized.to_rgba8(), x as i64, y as i64);
            DynamicImage::ImageRgba8(padded).write_to(&mut out, ImageOutputFormat::Png)?;
        }
        Ok(out.into_inner())
    }
}

/// `res/<dir>/<name>.png` for any single resource directory.
fn is_icon_entry(entry: &str, name: &str) -> bool {
    let mut parts = entry.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some("res"), Some(_), Some(file), None)
            if file.strip_suffix(".png") == Some(name)
    )
}

fn dimensions(bytes: &[u8]) -> anyhow::Result<(u32, u32)> {
    Ok(ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?)
}

/// Replaces every density variant of each named icon with the matching asset, scaled to
/// the size of the entry it replaces. Returns how many entries were rewritten.
pub fn replace_icons(
    session: &mut ArchiveSession,
    assets: &dyn AssetSource,
    names: &[String],
) -> Result<usize> {
    let path: PathBuf = session.path().to_path_buf();
    let mut replaced = 0;
    for name in names {
        let asset = assets.asset(name).map_err(|err| invalid(name, err))?;
        let Some(asset) = asset else {
            tracing::warn!("no replacement asset for icon `{name}`, skipping");
            continue;
        };
        let scaler = Scaler::from_bytes(&asset).map_err(|err| invalid(name, err))?;
        let entries: Vec<String> = session
            .entries()
            .filter(|entry| is_icon_entry(entry, name))
            .map(String::from)
            .collect();
        if entries.is_empty() {
            tracing::warn!("{} has no `{name}` icon entries", path.display());
            continue;
        }
        for entry in entries {
            let replaced_bytes = replacement(session, &path, &entry, &scaler)?;
            session.write_entry(&entry, replaced_bytes, ZipFileOptions::Aligned(4));
            tracing::debug!("replaced {entry}");
            replaced += 1;
        }
    }
    Ok(replaced)
}

fn replacement(
    session: &mut ArchiveSession,
    path: &Path,
    entry: &str,
    scaler: &Scaler,
) -> Result<Vec<u8>> {
    let existing = session
        .read_entry(entry)
        .in_archive(path)?
        .ok_or_else(|| PatchError::MissingArchiveEntry {
            archive: path.to_path_buf(),
            entry: entry.to_string(),
        })?;
    let (width, height) = dimensions(&existing).map_err(|err| invalid(entry, err))?;
    scaler
        .write_png(width, height)
        .map_err(|err| invalid(entry, err))
}

fn invalid(name: &str, err: anyhow::Error) -> PatchError {
    PatchError::InvalidAsset {
        name: name.to_string(),
        source: err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::ArchiveReader;
    use crate::core::testing::write_zip;
    use image::Rgba;
    use tempfile::tempdir;

    fn png(width: u32, height: u32, colour: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(colour));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn matches_density_variants_only() {
        assert!(is_icon_entry("res/mipmap-xxhdpi/ic_launcher.png", "ic_launcher"));
        assert!(!is_icon_entry("res/ic_launcher.png", "ic_launcher"));
        assert!(!is_icon_entry("res/mipmap-xxhdpi/ic_launcher_round.png", "ic_launcher"));
        assert!(!is_icon_entry("assets/res/x/ic_launcher.png", "ic_launcher"));
    }

    #[test]
    fn scales_to_each_existing_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("base.apk");
        let small = png(48, 48, [255, 0, 0, 255]);
        let large = png(144, 144, [255, 0, 0, 255]);
        write_zip(
            &path,
            &[
                ("res/mipmap-mdpi/ic_launcher.png", &small, ZipFileOptions::Aligned(4)),
                ("res/mipmap-xxhdpi/ic_launcher.png", &large, ZipFileOptions::Aligned(4)),
                ("res/drawable/other.png", &small, ZipFileOptions::Aligned(4)),
            ],
        );
        let mut assets = MockAssetSource::new();
        assets
            .expect_asset()
            .returning(|name| Ok((name == "ic_launcher").then(|| png(512, 512, [0, 0, 255, 255]))));

        let mut session = ArchiveSession::open(&path).unwrap();
        let names = vec!["ic_launcher".to_string(), "ic_launcher_round".to_string()];
        assert_eq!(replace_icons(&mut session, &assets, &names).unwrap(), 2);
        session.commit().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let mdpi = reader.read_entry("res/mipmap-mdpi/ic_launcher.png").unwrap().unwrap();
        assert_eq!(dimensions(&mdpi).unwrap(), (48, 48));
        let pixel = image::load_from_memory(&mdpi).unwrap().to_rgba8()[(10, 10)];
        assert_eq!(pixel, Rgba([0, 0, 255, 255]));
        let xxhdpi = reader.read_entry("res/mipmap-xxhdpi/ic_launcher.png").unwrap().unwrap();
        assert_eq!(dimensions(&xxhdpi).unwrap(), (144, 144));
        assert_eq!(reader.read_entry("res/drawable/other.png").unwrap().unwrap(), small);
    }

    #[test]
    fn pads_non_square_targets() {
        let scaler = Scaler::from_bytes(&png(64, 64, [9, 9, 9, 255])).unwrap();
        let out = scaler.write_png(32, 16).unwrap();
        assert_eq!(dimensions(&out).unwrap(), (32, 16));
    }

    #[test]
    fn rejects_non_square_assets() {
        assert!(Scaler::from_bytes(&png(10, 20, [0, 0, 0, 255])).is_err());
        assert!(Scaler::from_bytes(b"not an image").is_err());
    }
}
