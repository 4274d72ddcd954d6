use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Writes downloaded images into `dir`, named `<prefix>_<content hash>.<ext>`.
/// Each one is checked to actually decode first, and moved into place atomically.
pub fn save_images(dir: &Path, prefix: &str, images: &[Vec<u8>]) -> Result<Vec<SavedImage>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    // ComfyUI allows subfolders in the prefix. We keep everything flat.
    let prefix = prefix.replace(['/', '\\'], "_");
    let mut saved = Vec::new();
    for (i, data) in images.iter().enumerate() {
        let format = image::guess_format(data).context("downloaded data is not an image")?;
        let decoded = image::load_from_memory_with_format(data, format)
            .context("failed to decode downloaded image")?;
        let extension = format.extensions_str().first().copied().unwrap_or("img");
        let path = dir.join(format!("{}_{}.{}", prefix, &hash(data)[..16], extension));
        info!(
            "Saving image {} ({}x{}, {} bytes) to {}",
            i,
            decoded.width(),
            decoded.height(),
            data.len(),
            path.display()
        );

        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).context("failed to create temporary file")?;
        tmp.write_all(data).context("failed to write temporary file")?;
        tmp.persist(&path)
            .with_context(|| format!("failed to move image to {}", path.display()))?;

        saved.push(SavedImage {
            path,
            width: decoded.width(),
            height: decoded.height(),
        });
    }
    Ok(saved)
}

pub fn hash(data: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let hash = hasher.finalize();
    hash.to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
        let mut data = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut data), image::ImageOutputFormat::Png)
            .unwrap();
        data
    }

    #[test]
    fn test_hash() {
        assert_eq!(
            hash(b"hello"),
            "ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f"
        );
    }

    #[test_log::test]
    fn test_save_images() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output");
        let images = vec![png(4, 3), png(2, 2)];

        let saved = save_images(&out, "sub/ComfyUI", &images).unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!((saved[0].width, saved[0].height), (4, 3));
        assert_eq!(saved[0].path.extension().unwrap(), "png");
        let name = saved[0].path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("sub_ComfyUI_"), "{}", name);
        assert_eq!(std::fs::read(&saved[1].path).unwrap(), images[1]);
        // Only the two images; no stray temporary files.
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 2);
    }

    #[test]
    fn test_same_content_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let first = save_images(dir.path(), "x", &[png(1, 1)]).unwrap();
        let second = save_images(dir.path(), "x", &[png(1, 1)]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save_images(dir.path(), "x", &[b"not an image".to_vec()]).is_err());
    }
}
