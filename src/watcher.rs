//! Filesystem change notifications for tracked roots.

use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::scanner::filetypes::is_hidden;
use crate::scanner::is_supported_image;

/// Called with the owning root's id and path, and the path of a created or
/// changed image.
pub type PathCallback = Arc<dyn Fn(i64, &Path, PathBuf) + Send + Sync>;

/// Per-root subscription to file changes.
pub trait WatchService: Send + Sync {
    /// Start watching `path` for `root_id`. Watching an already watched root
    /// is a no-op.
    fn watch(&self, root_id: i64, path: &Path) -> Result<()>;

    fn unwatch(&self, root_id: i64);

    fn is_watching(&self, root_id: i64) -> bool;
}

type RootMap = Arc<RwLock<HashMap<i64, PathBuf>>>;

/// `notify` watcher forwarding image create/modify/rename-to events.
pub struct RootWatcher {
    watcher: Mutex<RecommendedWatcher>,
    roots: RootMap,
}

impl RootWatcher {
    pub fn new(on_path: PathCallback) -> Result<Self> {
        let roots: RootMap = Arc::new(RwLock::new(HashMap::new()));
        let handler_roots = Arc::clone(&roots);

        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let owned: Vec<(i64, PathBuf, PathBuf)> = {
                        let roots = handler_roots.read().unwrap_or_else(|e| e.into_inner());
                        changed_images(&event)
                            .into_iter()
                            .filter_map(|path| {
                                owning_root(&roots, &path).map(|(id, root)| (id, root.to_path_buf(), path))
                            })
                            .collect()
                    };
                    for (root_id, root_path, path) in owned {
                        on_path(root_id, &root_path, path);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Watcher error"),
            },
            Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            roots,
        })
    }

    fn roots_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, PathBuf>> {
        self.roots.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl WatchService for RootWatcher {
    fn watch(&self, root_id: i64, path: &Path) -> Result<()> {
        if self.is_watching(root_id) {
            return Ok(());
        }
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", path.display()))?;
        self.roots_mut().insert(root_id, path.to_path_buf());
        tracing::debug!(root_id, path = %path.display(), "Watching root");
        Ok(())
    }

    fn unwatch(&self, root_id: i64) {
        let Some(path) = self.roots_mut().remove(&root_id) else {
            return;
        };
        // Fails when the root is already gone; the watch is dead either way.
        if let Err(e) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwatch(&path)
        {
            tracing::debug!(root_id, error = %e, "Unwatch failed");
        }
    }

    fn is_watching(&self, root_id: i64) -> bool {
        self.roots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&root_id)
    }
}

/// Supported image files an event created, rewrote, or renamed into place.
fn changed_images(event: &Event) -> Vec<PathBuf> {
    let paths: Vec<&PathBuf> = match &event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Metadata(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Access(AccessKind::Close(AccessMode::Write)) => event.paths.iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.last().into_iter().collect(),
        // Backends that cannot tell source from destination.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().filter(|p| p.is_file()).collect()
        }
        _ => Vec::new(),
    };

    paths
        .into_iter()
        .filter(|p| is_supported_image(p) && !p.is_dir())
        .cloned()
        .collect()
}

/// The root with the longest prefix of `path`, unless a hidden entry lies
/// between the two.
fn owning_root<'a>(roots: &'a HashMap<i64, PathBuf>, path: &Path) -> Option<(i64, &'a Path)> {
    let (root_id, root_path) = roots
        .iter()
        .filter(|(_, root)| path.starts_with(root))
        .max_by_key(|(_, root)| root.components().count())?;
    let rel = path.strip_prefix(root_path).ok()?;
    if rel.components().any(|c| is_hidden(c.as_os_str())) {
        return None;
    }
    Some((*root_id, root_path.as_path()))
}
