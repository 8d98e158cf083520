pub mod discovery;
pub mod filetypes;
pub mod metadata;
pub mod thumbnails;

pub use discovery::walk_images;
pub use filetypes::is_supported_image;
pub use metadata::capture_date;
pub use thumbnails::{Thumbnail, ThumbnailManager, Thumbnailer};
