use std::ffi::OsStr;
use std::path::Path;

/// Extensions the indexer accepts, lowercase and without the dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// True for non-hidden files with a whitelisted image extension.
pub fn is_supported_image(path: &Path) -> bool {
    match path.file_name() {
        Some(name) if !is_hidden(name) => {}
        _ => return false,
    }
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Lowercase extension of `path`, empty when it has none.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
