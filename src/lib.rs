//! Incremental photo indexing with hybrid semantic and path search.
//!
//! Roots are walked by a scanner thread, every candidate image flows through
//! a bounded ingest queue, and each photo's catalog row, thumbnail and CLIP
//! embedding are kept current. [`library::Library`] ties it together.

pub mod config;
pub mod db;
pub mod embed;
pub mod indexer;
pub mod library;
pub mod logging;
pub mod scanner;
pub mod search;
pub mod tasks;
pub mod vector;
pub mod watcher;

pub use library::Library;
