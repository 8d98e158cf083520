use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ThumbnailConfig;

use super::metadata::exif_orientation;

const JPEG_QUALITY: u8 = 82;

/// Distinguishes concurrent writers of the same thumbnail.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A stored thumbnail and the oriented dimensions of its source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Produces per-photo preview images.
pub trait Thumbnailer: Send + Sync {
    fn thumb_path(&self, photo_id: i64) -> PathBuf;

    fn has_thumbnail(&self, photo_id: i64) -> bool {
        self.thumb_path(photo_id).exists()
    }

    /// Decode `source`, bound it to `max_edge` and store it for `photo_id`,
    /// replacing any earlier thumbnail.
    fn ensure(&self, photo_id: i64, source: &Path, max_edge: u32) -> Result<Thumbnail>;

    fn remove(&self, photo_id: i64) -> Result<()>;
}

/// Writes JPEG thumbnails into a directory sharded by photo id.
pub struct ThumbnailManager {
    cache_dir: PathBuf,
    max_edge: u32,
}

impl ThumbnailManager {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            cache_dir: config.path.clone(),
            max_edge: config.max_edge,
        }
    }

    pub fn max_edge(&self) -> u32 {
        self.max_edge
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl Thumbnailer for ThumbnailManager {
    fn thumb_path(&self, photo_id: i64) -> PathBuf {
        // Sharding keeps any one directory to roughly 1/1000th of the library
        let shard = format!("{:03}", photo_id.rem_euclid(1000));
        self.cache_dir.join(shard).join(format!("{}.jpg", photo_id))
    }

    fn ensure(&self, photo_id: i64, source: &Path, max_edge: u32) -> Result<Thumbnail> {
        let dest = self.thumb_path(photo_id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let img = image::open(source)
            .with_context(|| format!("Failed to decode {}", source.display()))?;
        let img = apply_orientation(img, exif_orientation(source).unwrap_or(1));
        let (width, height) = (img.width(), img.height());

        let thumb = img.thumbnail(max_edge, max_edge).to_rgb8();

        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = dest.with_extension(format!("{}.{}.tmp", std::process::id(), seq));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY).encode_image(&thumb)?;
        }
        fs::rename(&tmp, &dest)?;

        Ok(Thumbnail {
            path: dest,
            width,
            height,
        })
    }

    fn remove(&self, photo_id: i64) -> Result<()> {
        match fs::remove_file(self.thumb_path(photo_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rotate/flip according to an EXIF orientation value.
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> ThumbnailManager {
        ThumbnailManager::new(&ThumbnailConfig {
            path: dir.join("thumbs"),
            max_edge: 64,
        })
    }

    #[test]
    fn test_sharded_path() {
        let dir = tempdir().unwrap();
        let thumbs = manager(dir.path());

        assert_eq!(
            thumbs.thumb_path(12345),
            dir.path().join("thumbs/345/12345.jpg")
        );
        assert_eq!(thumbs.thumb_path(7), dir.path().join("thumbs/007/7.jpg"));
    }

    #[test]
    fn test_ensure_bounds_longest_edge() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("wide.png");
        image::RgbImage::new(400, 100).save(&src).unwrap();

        let thumbs = manager(dir.path());
        let thumb = thumbs.ensure(1, &src, 64).unwrap();

        assert_eq!((thumb.width, thumb.height), (400, 100));
        assert!(thumbs.has_thumbnail(1));

        let stored = image::open(&thumb.path).unwrap();
        assert_eq!(stored.width(), 64);
        assert_eq!(stored.height(), 16);

        thumbs.remove(1).unwrap();
        assert!(!thumbs.has_thumbnail(1));
        // Removing twice is fine.
        thumbs.remove(1).unwrap();
    }

    #[test]
    fn test_concurrent_ensure_of_same_photo() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("square.png");
        image::RgbImage::new(128, 128).save(&src).unwrap();
        let thumbs = std::sync::Arc::new(manager(dir.path()));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let thumbs = std::sync::Arc::clone(&thumbs);
                let src = src.clone();
                std::thread::spawn(move || thumbs.ensure(5, &src, 64))
            })
            .collect();
        for worker in workers {
            assert!(worker.join().unwrap().is_ok());
        }

        let shard = thumbs.thumb_path(5).parent().unwrap().to_path_buf();
        let names: Vec<_> = fs::read_dir(shard).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("5.jpg")]);
    }

    #[test]
    fn test_undecodable_source_fails() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("broken.jpg");
        std::fs::write(&src, b"not an image").unwrap();

        let thumbs = manager(dir.path());
        assert!(thumbs.ensure(1, &src, 64).is_err());
        assert!(!thumbs.has_thumbnail(1));
    }
}
