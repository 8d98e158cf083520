use anyhow::Result;
use std::fs::Metadata;
use std::time::{Duration, UNIX_EPOCH};

use crate::db::{Database, PhotoUpsert};
use crate::embed::EmbedError;
use crate::scanner::filetypes::extension_of;
use crate::scanner::{capture_date, is_supported_image};

use super::{IndexTask, Indexer};

/// What one ingest did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Not a supported image, vanished, or its root is no longer tracked.
    Skipped,
    /// Nothing written: everything was current, or the stale parts could
    /// not be refreshed right now.
    Unchanged,
    Updated {
        photo_id: i64,
        metadata: bool,
        thumbnail: bool,
        embedding: bool,
    },
}

impl IngestOutcome {
    pub fn photo_id(&self) -> Option<i64> {
        match self {
            IngestOutcome::Updated { photo_id, .. } => Some(*photo_id),
            _ => None,
        }
    }
}

fn mtime_ns(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl Indexer {
    /// Pop one ingest task and process it, absorbing any failure. Returns
    /// false if none arrived within `timeout`.
    pub fn ingest_next(&self, db: &Database, timeout: Duration) -> bool {
        let Some(task) = self.ingest_queue.pop_timeout(timeout) else {
            return false;
        };

        self.progress
            .begin_ingest(task.root_id, &task.root_path, &task.path);
        match self.process_task(db, &task) {
            Ok(outcome) => {
                self.progress.ingest_succeeded(
                    task.root_id,
                    &task.path,
                    outcome.photo_id(),
                    task.scan,
                );
                if task.scan.is_some() {
                    self.maybe_mark_scan_finished(db, task.root_id);
                }
            }
            Err(e) => {
                let message = format!("Ingest failed: {:#}", e);
                tracing::warn!(
                    root_id = task.root_id,
                    path = %task.path.display(),
                    error = %format!("{:#}", e),
                    "Ingest failed"
                );
                self.progress.ingest_failed(task.root_id, task.scan);
                self.progress
                    .record_failure(task.root_id, &task.path, &message);
                if self.root_errors.allow(task.root_id) {
                    self.persist_root_error(db, task.root_id, &task.root_path, &message);
                }
            }
        }
        self.progress.end_ingest();
        true
    }

    /// Bring one file's catalog row, thumbnail and embedding up to date,
    /// doing only the work that is stale.
    pub fn process_task(&self, db: &Database, task: &IndexTask) -> Result<IngestOutcome> {
        if !is_supported_image(&task.path) {
            return Ok(IngestOutcome::Skipped);
        }

        let meta = match std::fs::metadata(&task.path) {
            Ok(meta) => meta,
            Err(e) => {
                if !task.root_path.exists() {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Root path unavailable: {}", task.root_path.display())));
                }
                tracing::debug!(path = %task.path.display(), error = %e, "File unreadable, skipping");
                return Ok(IngestOutcome::Skipped);
            }
        };
        if !meta.is_file() {
            return Ok(IngestOutcome::Skipped);
        }

        let size_bytes = meta.len() as i64;
        let mtime_ns = mtime_ns(&meta);
        let path_str = task.path.to_string_lossy();

        let existing = db.photo_signature(&path_str)?;
        let unchanged = existing
            .as_ref()
            .map(|sig| sig.matches(size_bytes, mtime_ns))
            .unwrap_or(false);

        let backend = self.embedding_backend();
        let mut needs_embedding = false;
        if let (Some((embedder, vectors)), Some(sig)) = (backend, existing.as_ref()) {
            let has_model = sig.embedding_model.as_deref() == Some(embedder.model_id());
            needs_embedding = !has_model;
            if has_model {
                // The catalog can claim an embedding the index lost.
                match vectors.has_label(sig.id) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(photo_id = sig.id, "Vector label missing, re-embedding");
                        needs_embedding = true;
                    }
                    Err(e) => {
                        tracing::warn!(photo_id = sig.id, error = %e, "Vector label check failed");
                    }
                }
            }
        }

        let needs_thumb = existing
            .as_ref()
            .map(|sig| !self.thumbnailer.has_thumbnail(sig.id))
            .unwrap_or(false);

        if unchanged && !needs_embedding && !needs_thumb {
            return Ok(IngestOutcome::Unchanged);
        }

        let (photo_id, metadata) = match existing {
            Some(sig) if unchanged => (sig.id, false),
            _ => {
                if db.get_root(task.root_id)?.is_none() {
                    tracing::debug!(root_id = task.root_id, "Root no longer tracked, skipping");
                    return Ok(IngestOutcome::Skipped);
                }

                let rel_path = match task.path.strip_prefix(&task.root_path) {
                    Ok(rel) => rel.to_string_lossy().into_owned(),
                    Err(_) => task
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                };
                let ext = extension_of(&task.path);
                let (date_taken, date_source) = capture_date(&task.path, meta.modified().ok());

                let id = db.upsert_photo(&PhotoUpsert {
                    root_id: task.root_id,
                    path: &path_str,
                    rel_path: &rel_path,
                    ext: &ext,
                    size_bytes,
                    mtime_ns,
                    date_taken: date_taken.as_deref(),
                    date_source,
                })?;
                (id, true)
            }
        };

        let mut thumbnail = false;
        if metadata || needs_thumb {
            match self
                .thumbnailer
                .ensure(photo_id, &task.path, self.thumb_max_edge)
            {
                Ok(thumb) => {
                    db.set_photo_dimensions(photo_id, thumb.width, thumb.height)?;
                    thumbnail = true;
                }
                Err(e) => {
                    tracing::warn!(
                        photo_id,
                        path = %task.path.display(),
                        error = %format!("{:#}", e),
                        "Thumbnail generation failed"
                    );
                }
            }
        }

        let mut embedding = false;
        if let Some((embedder, vectors)) = backend {
            if metadata || needs_embedding {
                match embedder.embed_image(&task.path) {
                    Ok(vector) => {
                        vectors.add_or_update(photo_id, &vector)?;
                        self.maybe_persist_vectors();
                        db.set_photo_embedding(photo_id, vector.len(), embedder.model_id())?;
                        embedding = true;
                    }
                    Err(EmbedError::Unavailable(reason)) => {
                        tracing::debug!(photo_id, reason = %reason, "Embedder unavailable, skipping embedding");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if !metadata && !thumbnail && !embedding {
            return Ok(IngestOutcome::Unchanged);
        }

        tracing::debug!(photo_id, metadata, thumbnail, embedding, "Ingested");
        Ok(IngestOutcome::Updated {
            photo_id,
            metadata,
            thumbnail,
            embedding,
        })
    }
}
