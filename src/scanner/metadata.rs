use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::SystemTime;

use crate::db::DateSource;

/// Catalog timestamp format, always UTC.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Read `DateTimeOriginal`, treating the camera clock as UTC.
pub fn exif_date_taken(path: &Path) -> Option<NaiveDateTime> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)?;

    match field.value {
        exif::Value::Ascii(ref parts) => {
            let raw = parts.first()?;
            let text = std::str::from_utf8(raw).ok()?;
            NaiveDateTime::parse_from_str(text.trim_end_matches('\0').trim(), EXIF_DATE_FORMAT).ok()
        }
        _ => None,
    }
}

/// EXIF orientation tag (1-8), if present.
pub fn exif_orientation(path: &Path) -> Option<u32> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;

    match field.value {
        exif::Value::Short(ref v) => v.first().map(|&o| o as u32),
        _ => None,
    }
}

/// Capture timestamp for the catalog, falling back to the file's mtime.
pub fn capture_date(path: &Path, mtime: Option<SystemTime>) -> (Option<String>, DateSource) {
    if let Some(taken) = exif_date_taken(path) {
        return (Some(taken.format(DATE_FORMAT).to_string()), DateSource::Exif);
    }

    match mtime {
        Some(mtime) => {
            let dt: DateTime<Utc> = mtime.into();
            (Some(dt.format(DATE_FORMAT).to_string()), DateSource::Mtime)
        }
        None => (None, DateSource::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::tempdir;

    #[test]
    fn test_falls_back_to_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.png");
        image::RgbImage::new(4, 4).save(&path).unwrap();

        let mtime = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let (date, source) = capture_date(&path, Some(mtime));

        assert_eq!(source, DateSource::Mtime);
        assert_eq!(date.as_deref(), Some("2020-09-13 12:26:40"));
    }

    #[test]
    fn test_unknown_without_any_date() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.jpg");

        let (date, source) = capture_date(&path, None);
        assert!(date.is_none());
        assert_eq!(source, DateSource::Unknown);
    }
}
