use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::filetypes::{is_hidden, is_supported_image};

/// Lazily walk `root` depth-first, yielding supported images.
///
/// Hidden directories are pruned and hidden files skipped. Unreadable
/// entries are passed to `on_error` and the walk carries on.
pub fn walk_images<'a, F>(root: &Path, mut on_error: F) -> impl Iterator<Item = PathBuf> + 'a
where
    F: FnMut(&walkdir::Error) + 'a,
{
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
        .filter_map(move |entry| match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && is_supported_image(entry.path()) {
                    Some(entry.into_path())
                } else {
                    None
                }
            }
            Err(err) => {
                on_error(&err);
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_walk_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.png")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();
        File::create(dir.path().join(".hidden.jpg")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        fs::create_dir(dir.path().join(".thumbs")).unwrap();
        File::create(dir.path().join(".thumbs/cached.jpg")).unwrap();

        let mut errors = 0;
        let mut images: Vec<PathBuf> = walk_images(dir.path(), |_| errors += 1).collect();
        images.sort();

        assert_eq!(
            images,
            vec![
                dir.path().join("photo1.jpg"),
                dir.path().join("photo2.png"),
                dir.path().join("subdir/photo3.jpeg"),
            ]
        );
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_missing_root_reports_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");

        let mut errors = 0;
        let count = walk_images(&missing, |_| errors += 1).count();

        assert_eq!(count, 0);
        assert_eq!(errors, 1);
    }
}
