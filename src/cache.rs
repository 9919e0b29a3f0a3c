use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::jobs::{JobKind, JobPayload};
use crate::timeline::ChordTimeline;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt cached timeline: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Identity of a file on disk: a cached entry is valid while size and mtime match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub path: String,
    pub size: i64,
    pub modified: String,
}

impl FileStamp {
    pub fn of(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(Self {
            path: path.to_string_lossy().to_string(),
            size: meta.len() as i64,
            modified: format_mtime(&meta),
        })
    }
}

fn format_mtime(meta: &std::fs::Metadata) -> String {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}

/// Previously computed analysis for one file. Missing fields were never
/// computed (or failed).
#[derive(Debug, Clone, Default)]
pub struct CachedAnalysis {
    pub chords: Option<ChordTimeline>,
    pub key: Option<String>,
    pub tempo: Option<f64>,
    pub stem: Option<PathBuf>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl CachedAnalysis {
    /// Cached results as payloads, in dispatch order.
    pub fn payloads(&self) -> Vec<(JobKind, JobPayload)> {
        let mut out = Vec::new();
        if let Some(stem) = &self.stem {
            out.push((JobKind::Separation, JobPayload::Stem(stem.clone())));
        }
        if let Some(chords) = &self.chords {
            out.push((JobKind::Chords, JobPayload::Chords(chords.clone())));
        }
        if let Some(key) = &self.key {
            out.push((JobKind::Key, JobPayload::Key(key.clone())));
        }
        if let Some(tempo) = self.tempo {
            out.push((JobKind::Tempo, JobPayload::Tempo(tempo)));
        }
        out
    }

    pub fn covers(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::Separation => self.stem.is_some(),
            JobKind::Chords => self.chords.is_some(),
            JobKind::Key => self.key.is_some(),
            JobKind::Tempo => self.tempo.is_some(),
        }
    }
}

pub struct AnalysisCache {
    conn: Connection,
}

impl AnalysisCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let cache = Self {
            conn: Connection::open(path)?,
        };
        cache.init()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self> {
        let cache = Self {
            conn: Connection::open_in_memory()?,
        };
        cache.init()?;
        Ok(cache)
    }

    fn init(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;

        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if version < 1 {
            self.conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS analyses (
                    file_path       TEXT PRIMARY KEY,
                    file_size       INTEGER NOT NULL,
                    file_modified   TEXT NOT NULL,
                    chords_json     TEXT,
                    key_label       TEXT,
                    tempo_bpm       REAL,
                    stem_path       TEXT,
                    analyzed_at     TEXT NOT NULL
                );
                ",
            )?;
        }
        self.conn.pragma_update(None, "user_version", 1)?;
        Ok(())
    }

    /// Cached analysis for `stamp`, or `None` if absent or the file changed.
    pub fn lookup(&self, stamp: &FileStamp) -> Result<Option<CachedAnalysis>> {
        let row = self
            .conn
            .query_row(
                "SELECT file_size, file_modified, chords_json, key_label, tempo_bpm, stem_path, analyzed_at
                 FROM analyses WHERE file_path = ?1",
                params![stamp.path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((size, modified, chords_json, key, tempo, stem, analyzed_at)) = row else {
            log::debug!("Cache miss: {}", stamp.path);
            return Ok(None);
        };
        if size != stamp.size || modified != stamp.modified {
            log::debug!("Cache stale (file changed): {}", stamp.path);
            return Ok(None);
        }

        let chords = chords_json
            .map(|json| serde_json::from_str::<ChordTimeline>(&json))
            .transpose()?;
        // Stems can be deleted out from under us
        let stem = stem.map(PathBuf::from).filter(|p| p.is_file());
        let analyzed_at = DateTime::parse_from_rfc3339(&analyzed_at)
            .ok()
            .map(|t| t.with_timezone(&Utc));

        log::debug!("Cache hit: {}", stamp.path);
        Ok(Some(CachedAnalysis {
            chords,
            key,
            tempo,
            stem,
            analyzed_at,
        }))
    }

    /// Record one successful job result. Entries for an older version of the
    /// file are discarded first.
    pub fn record(&self, stamp: &FileStamp, payload: &JobPayload) -> Result<()> {
        self.conn.execute(
            "DELETE FROM analyses WHERE file_path = ?1 AND (file_size != ?2 OR file_modified != ?3)",
            params![stamp.path, stamp.size, stamp.modified],
        )?;
        self.conn.execute(
            "INSERT INTO analyses (file_path, file_size, file_modified, analyzed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_path) DO NOTHING",
            params![stamp.path, stamp.size, stamp.modified, Utc::now().to_rfc3339()],
        )?;

        let (column, value): (&str, rusqlite::types::Value) = match payload {
            JobPayload::Chords(tl) => ("chords_json", serde_json::to_string(tl)?.into()),
            JobPayload::Key(key) => ("key_label", key.clone().into()),
            JobPayload::Tempo(bpm) => ("tempo_bpm", (*bpm).into()),
            JobPayload::Stem(path) => ("stem_path", path.to_string_lossy().to_string().into()),
        };
        let sql = format!(
            "UPDATE analyses SET {column} = ?1, analyzed_at = ?2 WHERE file_path = ?3"
        );
        self.conn
            .execute(&sql, params![value, Utc::now().to_rfc3339(), stamp.path])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn stamp() -> FileStamp {
        FileStamp {
            path: "/music/riff.mp3".to_string(),
            size: 4_200_000,
            modified: "1700000000".to_string(),
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = AnalysisCache::open_in_memory().unwrap();
        assert!(cache.lookup(&stamp()).unwrap().is_none());

        let tl = ChordTimeline::from_triples([(0.0, 2.0, "C"), (2.0, 4.0, "G")]);
        cache.record(&stamp(), &JobPayload::Chords(tl.clone())).unwrap();
        cache.record(&stamp(), &JobPayload::Key("G major".into())).unwrap();

        let hit = cache.lookup(&stamp()).unwrap().unwrap();
        assert_eq!(hit.chords, Some(tl));
        assert_eq!(hit.key.as_deref(), Some("G major"));
        assert_eq!(hit.tempo, None);
        assert!(hit.analyzed_at.is_some());
        assert!(hit.covers(JobKind::Chords));
        assert!(!hit.covers(JobKind::Tempo));
        assert_eq!(hit.payloads().len(), 2);
    }

    #[test]
    fn test_changed_file_invalidates() {
        let cache = AnalysisCache::open_in_memory().unwrap();
        cache.record(&stamp(), &JobPayload::Tempo(97.5)).unwrap();

        let mut changed = stamp();
        changed.modified = "1800000000".to_string();
        assert!(cache.lookup(&changed).unwrap().is_none());

        // Recording for the new version drops the old results
        cache.record(&changed, &JobPayload::Key("D minor".into())).unwrap();
        let hit = cache.lookup(&changed).unwrap().unwrap();
        assert_eq!(hit.tempo, None);
        assert_eq!(hit.key.as_deref(), Some("D minor"));
    }

    #[test]
    fn test_missing_stem_is_dropped() {
        let cache = AnalysisCache::open_in_memory().unwrap();
        cache
            .record(&stamp(), &JobPayload::Stem(PathBuf::from("/no/such/stem.wav")))
            .unwrap();
        let hit = cache.lookup(&stamp()).unwrap().unwrap();
        assert!(hit.stem.is_none());
    }

    #[test]
    fn test_file_stamp_of_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"12345").unwrap();
        file.flush().unwrap();
        let s = FileStamp::of(file.path()).unwrap();
        assert_eq!(s.size, 5);
        assert!(!s.modified.is_empty());
    }
}
