//! Photo catalog operations.

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use super::{Database, RootStatus, ID_CHUNK};

/// Where a photo's capture timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DateSource {
    Exif,
    Mtime,
    Unknown,
}

impl DateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateSource::Exif => "exif",
            DateSource::Mtime => "mtime",
            DateSource::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "exif" => DateSource::Exif,
            "mtime" => DateSource::Mtime,
            _ => DateSource::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Photo {
    pub id: i64,
    pub root_id: i64,
    pub path: String,
    pub rel_path: String,
    pub ext: String,
    pub size_bytes: i64,
    pub mtime_ns: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub date_taken: Option<String>,
    pub date_source: DateSource,
    pub indexed_at: String,
    pub embedding_dim: Option<i64>,
    pub embedding_model: Option<String>,
}

const PHOTO_COLUMNS: &str = "id, root_id, path, rel_path, ext, size_bytes, mtime_ns, width, \
     height, date_taken, date_source, indexed_at, embedding_dim, embedding_model";

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<Photo> {
    let date_source: String = row.get(10)?;
    Ok(Photo {
        id: row.get(0)?,
        root_id: row.get(1)?,
        path: row.get(2)?,
        rel_path: row.get(3)?,
        ext: row.get(4)?,
        size_bytes: row.get(5)?,
        mtime_ns: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        date_taken: row.get(9)?,
        date_source: DateSource::parse(&date_source),
        indexed_at: row.get(11)?,
        embedding_dim: row.get(12)?,
        embedding_model: row.get(13)?,
    })
}

/// The stored change-detection signature of one photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoSignature {
    pub id: i64,
    pub size_bytes: i64,
    pub mtime_ns: i64,
    pub embedding_model: Option<String>,
}

impl PhotoSignature {
    pub fn matches(&self, size_bytes: i64, mtime_ns: i64) -> bool {
        self.size_bytes == size_bytes && self.mtime_ns == mtime_ns
    }
}

/// Mutable fields written by an ingest.
#[derive(Debug, Clone)]
pub struct PhotoUpsert<'a> {
    pub root_id: i64,
    pub path: &'a str,
    pub rel_path: &'a str,
    pub ext: &'a str,
    pub size_bytes: i64,
    pub mtime_ns: i64,
    pub date_taken: Option<&'a str>,
    pub date_source: DateSource,
}

/// A photo whose stored embedding is absent or from another model.
#[derive(Debug, Clone)]
pub struct MissingEmbedding {
    pub photo_id: i64,
    pub path: PathBuf,
    pub root_id: i64,
    pub root_path: PathBuf,
}

/// Structured search filters. Date parts match the capture timestamp and
/// `folder` matches direct children of a directory only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhotoFilters {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub folder: Option<String>,
}

impl PhotoFilters {
    pub fn is_empty(&self) -> bool {
        self.year.is_none() && self.month.is_none() && self.day.is_none() && self.folder_prefix().is_none()
    }

    /// Normalized folder with a trailing separator, and the separator itself.
    fn folder_prefix(&self) -> Option<(String, char)> {
        let folder = self.folder.as_deref().map(str::trim).filter(|f| !f.is_empty())?;
        let sep = if folder.contains('\\') && !folder.contains('/') {
            '\\'
        } else {
            '/'
        };
        let base = folder.trim_end_matches(['/', '\\']);
        if base.is_empty() {
            return None;
        }
        Some((format!("{}{}", base, sep), sep))
    }

    /// SQL conditions over the `photos` table plus their bound values.
    fn conditions(&self) -> (Vec<&'static str>, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let Some(year) = self.year {
            clauses.push("strftime('%Y', date_taken) = ?");
            params.push(Value::Text(format!("{:04}", year)));
        }
        if let Some(month) = self.month {
            clauses.push("strftime('%m', date_taken) = ?");
            params.push(Value::Text(format!("{:02}", month)));
        }
        if let Some(day) = self.day {
            clauses.push("strftime('%d', date_taken) = ?");
            params.push(Value::Text(format!("{:02}", day)));
        }
        if let Some((prefix, sep)) = self.folder_prefix() {
            // The prefix match admits nested descendants; the separator
            // check on the remainder keeps direct children only.
            clauses.push("path LIKE ? ESCAPE '\\'");
            params.push(Value::Text(format!("{}%", escape_like(&prefix))));
            clauses.push("instr(substr(path, ?), ?) = 0");
            params.push(Value::Integer(prefix.chars().count() as i64 + 1));
            params.push(Value::Text(sep.to_string()));
        }

        (clauses, params)
    }
}

fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn where_sql(clauses: &[&str]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl Database {
    pub fn photo_signature(&self, path: &str) -> Result<Option<PhotoSignature>> {
        let sig = self
            .conn
            .query_row(
                "SELECT id, size_bytes, mtime_ns, embedding_model FROM photos WHERE path = ?",
                [path],
                |row| {
                    Ok(PhotoSignature {
                        id: row.get(0)?,
                        size_bytes: row.get(1)?,
                        mtime_ns: row.get(2)?,
                        embedding_model: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(sig)
    }

    /// Insert or refresh a photo keyed by path, returning its id. The owning
    /// root never changes once a row exists.
    pub fn upsert_photo(&self, photo: &PhotoUpsert<'_>) -> Result<i64> {
        let id = self.conn.query_row(
            r#"
            INSERT INTO photos (root_id, path, rel_path, ext, size_bytes, mtime_ns, date_taken, date_source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(path) DO UPDATE SET
                rel_path = excluded.rel_path,
                ext = excluded.ext,
                size_bytes = excluded.size_bytes,
                mtime_ns = excluded.mtime_ns,
                date_taken = excluded.date_taken,
                date_source = excluded.date_source,
                indexed_at = datetime('now')
            RETURNING id
            "#,
            rusqlite::params![
                photo.root_id,
                photo.path,
                photo.rel_path,
                photo.ext,
                photo.size_bytes,
                photo.mtime_ns,
                photo.date_taken,
                photo.date_source.as_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn set_photo_dimensions(&self, id: i64, width: u32, height: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE photos SET width = ?, height = ? WHERE id = ?",
            rusqlite::params![width, height, id],
        )?;
        Ok(())
    }

    pub fn set_photo_embedding(&self, id: i64, dimension: usize, model_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE photos SET embedding_dim = ?, embedding_model = ? WHERE id = ?",
            rusqlite::params![dimension as i64, model_id, id],
        )?;
        Ok(())
    }

    pub fn get_photo(&self, id: i64) -> Result<Option<Photo>> {
        let photo = self
            .conn
            .query_row(
                &format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS),
                [id],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    /// Fetch photos in the order of `ids`, silently dropping unknown ids.
    pub fn photos_by_ids(&self, ids: &[i64]) -> Result<Vec<Photo>> {
        let mut found: HashMap<i64, Photo> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {} FROM photos WHERE id IN ({})",
                PHOTO_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), photo_from_row)?;
            for photo in rows {
                let photo = photo?;
                found.insert(photo.id, photo);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// The subset of `ids` still present in the catalog.
    pub fn existing_photo_ids(&self, ids: &[i64]) -> Result<HashSet<i64>> {
        self.filter_photo_ids(ids, &PhotoFilters::default())
    }

    /// The subset of `ids` present in the catalog and matching `filters`.
    pub fn filter_photo_ids(&self, ids: &[i64], filters: &PhotoFilters) -> Result<HashSet<i64>> {
        let (filter_clauses, filter_params) = filters.conditions();
        let mut kept = HashSet::with_capacity(ids.len());

        for chunk in ids.chunks(ID_CHUNK) {
            let mut clauses = vec![format!("id IN ({})", placeholders(chunk.len()))];
            clauses.extend(filter_clauses.iter().map(|c| c.to_string()));
            let sql = format!("SELECT id FROM photos WHERE {}", clauses.join(" AND "));

            let mut params: Vec<Value> = chunk.iter().map(|id| Value::Integer(*id)).collect();
            params.extend(filter_params.iter().cloned());

            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?;
            for id in rows {
                kept.insert(id?);
            }
        }

        Ok(kept)
    }

    pub fn photo_ids_for_root(&self, root_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM photos WHERE root_id = ? ORDER BY id")?;
        let ids = stmt
            .query_map([root_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn count_photos_in_root(&self, root_id: i64) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM photos WHERE root_id = ?",
            [root_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Photos on reachable roots lacking an embedding for `model_id`.
    pub fn photos_missing_embedding(&self, model_id: &str, limit: usize) -> Result<Vec<MissingEmbedding>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.id, p.path, r.id, r.path
            FROM photos p
            JOIN tracked_roots r ON r.id = p.root_id
            WHERE r.status != ?
              AND (p.embedding_model IS NULL OR p.embedding_model != ?)
            ORDER BY p.id
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map(
                rusqlite::params![RootStatus::Offline.as_str(), model_id, limit as i64],
                |row| {
                    Ok(MissingEmbedding {
                        photo_id: row.get(0)?,
                        path: PathBuf::from(row.get::<_, String>(1)?),
                        root_id: row.get(2)?,
                        root_path: PathBuf::from(row.get::<_, String>(3)?),
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ids whose full or root-relative path contains any of `tokens`,
    /// case-insensitively, newest capture first.
    pub fn lexical_match_ids(
        &self,
        tokens: &[String],
        filters: &PhotoFilters,
        exclude: &HashSet<i64>,
        limit: usize,
    ) -> Result<Vec<i64>> {
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut token_clauses = Vec::with_capacity(tokens.len());
        let mut params = Vec::with_capacity(tokens.len() * 2);
        for token in tokens {
            token_clauses.push("lower(path) LIKE ? ESCAPE '\\' OR lower(rel_path) LIKE ? ESCAPE '\\'");
            let pattern = format!("%{}%", escape_like(&token.to_lowercase()));
            params.push(Value::Text(pattern.clone()));
            params.push(Value::Text(pattern));
        }

        let (filter_clauses, filter_params) = filters.conditions();
        let mut clauses = vec![format!("({})", token_clauses.join(" OR "))];
        clauses.extend(filter_clauses.iter().map(|c| c.to_string()));
        params.extend(filter_params);
        params.push(Value::Integer((limit + exclude.len()) as i64));

        let sql = format!(
            "SELECT id FROM photos WHERE {} ORDER BY date_taken DESC, id DESC LIMIT ?",
            clauses.join(" AND ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ids
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .take(limit)
            .collect())
    }

    pub fn count_photos(&self, filters: &PhotoFilters) -> Result<usize> {
        let (clauses, params) = filters.conditions();
        let sql = format!("SELECT COUNT(*) FROM photos {}", where_sql(&clauses));
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    /// A page of ids in an affine permutation keyed by `seed`. The same seed
    /// always yields the same order; a different seed rotates it.
    pub fn shuffled_photo_ids(
        &self,
        filters: &PhotoFilters,
        seed: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let (clauses, mut params) = filters.conditions();
        let sql = format!(
            "SELECT id FROM photos {} \
             ORDER BY (((id + ?) * 1103515245) & 2147483647), id \
             LIMIT ? OFFSET ?",
            where_sql(&clauses)
        );
        params.push(Value::Integer(seed));
        params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        params.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));

        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}
