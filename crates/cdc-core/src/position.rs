//! Durable {stream_id → cursor} tracking.
//!
//! [`Position`] is the typed cursor a producer understands; [`PositionStore`]
//! persists it (and arbitrary metadata) keyed by stream, as opaque bytes, so
//! that the store itself never needs to understand any producer's wire
//! format. [`PositionRegistry`] is what lets a loaded record be decoded back
//! into the right `Position` variant.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("no position recorded for stream {0:?}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown position_type {0:?} in metadata")]
    UnknownPositionType(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// A producer cursor. Variants are deliberately incomparable across each
/// other: [`Position::compare`] treats cross-variant comparisons as `Less`,
/// but two such positions are never considered equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "position_type", rename_all = "snake_case")]
pub enum Position {
    Binlog {
        file: String,
        offset: u64,
        gtid: Option<String>,
        server_id: u32,
        captured_at: DateTime<Utc>,
    },
    Lsn {
        lsn: u64,
        txid: Option<u64>,
        timeline: u32,
        slot: String,
        database: String,
        captured_at: DateTime<Utc>,
    },
    Opaque {
        token: Vec<u8>,
        captured_at: DateTime<Utc>,
    },
}

impl Position {
    pub fn is_valid(&self) -> bool {
        match self {
            Position::Binlog { file, offset, .. } => !file.is_empty() && *offset > 0,
            Position::Lsn { lsn, .. } => *lsn > 0,
            Position::Opaque { token, .. } => !token.is_empty(),
        }
    }

    /// Extracts the trailing integer of a binlog file name, e.g.
    /// `mysql-bin.000002` → `2`, used to order files before offset.
    fn binlog_file_number(file: &str) -> u64 {
        file.rsplit('.')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Total order within a variant; cross-variant comparisons return
    /// `Less` (never `Equal`) so two positions of different kinds are never
    /// mistaken for the same cursor.
    pub fn compare(&self, other: &Position) -> Ordering {
        match (self, other) {
            (
                Position::Binlog { file: f1, offset: o1, .. },
                Position::Binlog { file: f2, offset: o2, .. },
            ) => Self::binlog_file_number(f1)
                .cmp(&Self::binlog_file_number(f2))
                .then(o1.cmp(o2)),
            (Position::Lsn { lsn: l1, .. }, Position::Lsn { lsn: l2, .. }) => l1.cmp(l2),
            (Position::Opaque { token: t1, .. }, Position::Opaque { token: t2, .. }) => {
                if t1 == t2 {
                    Ordering::Equal
                } else {
                    Ordering::Less
                }
            }
            _ => Ordering::Less,
        }
    }

    /// `"1/2345ABCD"` ↔ `lsn = 0x0000_0001_2345_ABCD`.
    pub fn parse_lsn_text(text: &str) -> Result<u64, PositionError> {
        let (high, low) = text
            .split_once('/')
            .ok_or_else(|| PositionError::Backend(format!("invalid lsn text {text:?}, missing '/'")))?;
        let high = u32::from_str_radix(high, 16)
            .map_err(|e| PositionError::Backend(format!("invalid lsn high half: {e}")))?;
        let low = u32::from_str_radix(low, 16)
            .map_err(|e| PositionError::Backend(format!("invalid lsn low half: {e}")))?;
        Ok(((high as u64) << 32) | low as u64)
    }

    pub fn format_lsn_text(lsn: u64) -> String {
        format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
    }

    pub fn position_type(&self) -> &'static str {
        match self {
            Position::Binlog { .. } => "binlog",
            Position::Lsn { .. } => "lsn",
            Position::Opaque { .. } => "opaque",
        }
    }
}

/// The persisted shape of a position record: the typed `Position`, encoded
/// as opaque bytes, plus bookkeeping metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub stream_id: String,
    #[serde(rename = "position_data")]
    pub position: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic counter (wall-clock nanoseconds) used for observability,
    /// not locking.
    pub version: i64,
}

/// Decodes a [`PositionRecord`]'s opaque bytes back into a typed
/// [`Position`] by consulting the `position_type` key the record's
/// metadata carries.
#[derive(Debug, Default, Clone)]
pub struct PositionRegistry;

impl PositionRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, bytes: &[u8], metadata: &HashMap<String, String>) -> Result<Position, PositionError> {
        // The bytes are themselves a tagged JSON encoding of `Position`
        // (the `position_type` field drives serde's internal tag), so the
        // metadata lookup below is a defensive cross-check rather than the
        // sole source of truth.
        let position: Position = serde_json::from_slice(bytes)?;
        if let Some(declared) = metadata.get("position_type") {
            if declared != position.position_type() {
                return Err(PositionError::UnknownPositionType(declared.clone()));
            }
        }
        Ok(position)
    }

    pub fn encode(&self, position: &Position) -> Result<Vec<u8>, PositionError> {
        Ok(serde_json::to_vec(position)?)
    }
}

/// Durable {stream_id → cursor} persistence with pluggable backends.
#[async_trait::async_trait]
pub trait PositionStore: Send + Sync {
    async fn save(
        &self,
        stream_id: &str,
        position: &[u8],
        metadata: HashMap<String, String>,
    ) -> Result<(), PositionError>;

    async fn load(&self, stream_id: &str) -> Result<(Vec<u8>, HashMap<String, String>), PositionError>;

    async fn delete(&self, stream_id: &str) -> Result<(), PositionError>;

    async fn list(&self) -> Result<HashMap<String, Vec<u8>>, PositionError>;

    async fn health_check(&self) -> Result<(), PositionError>;

    async fn close(&self) -> Result<(), PositionError> {
        Ok(())
    }
}

/// File-backed position store. One JSON file per stream at
/// `<directory>/<stream_id>.json`, written via a temp-file-then-rename so
/// readers never observe a torn write.
pub struct FilePositionStore {
    directory: PathBuf,
    backup_count: usize,
    enable_backup: bool,
    write_lock: Mutex<()>,
}

impl FilePositionStore {
    pub fn new(directory: impl Into<PathBuf>, enable_backup: bool, backup_count: usize) -> Self {
        Self {
            directory: directory.into(),
            backup_count,
            enable_backup,
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, stream_id: &str) -> PathBuf {
        self.directory.join(format!("{stream_id}.json"))
    }

    fn tmp_path(&self, stream_id: &str) -> PathBuf {
        self.directory.join(format!("{stream_id}.json.tmp"))
    }

    fn backup_path(&self, stream_id: &str, at: DateTime<Utc>) -> PathBuf {
        self.directory
            .join(format!("{stream_id}.json.backup.{}", at.format("%Y%m%d-%H%M%S")))
    }

    async fn read_record(&self, path: &Path) -> Result<PositionRecord, PositionError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn prune_backups(&self, stream_id: &str) -> Result<(), PositionError> {
        let prefix = format!("{stream_id}.json.backup.");
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&self.directory)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort();
        while backups.len() > self.backup_count {
            let oldest = backups.remove(0);
            let _ = std::fs::remove_file(oldest);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PositionStore for FilePositionStore {
    async fn save(
        &self,
        stream_id: &str,
        position: &[u8],
        metadata: HashMap<String, String>,
    ) -> Result<(), PositionError> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.directory).await?;

        let path = self.record_path(stream_id);
        let now = Utc::now();
        let created_at = match self.read_record(&path).await {
            Ok(existing) => existing.created_at,
            Err(PositionError::Io(_)) => now,
            Err(e) => return Err(e),
        };

        let record = PositionRecord {
            stream_id: stream_id.to_string(),
            position: position.to_vec(),
            metadata,
            created_at,
            updated_at: now,
            version: now.timestamp_nanos_opt().unwrap_or_default(),
        };

        if self.enable_backup {
            if let Ok(existing) = tokio::fs::read(&path).await {
                tokio::fs::write(self.backup_path(stream_id, now), existing).await?;
                self.prune_backups(stream_id)?;
            }
        }

        let tmp = self.tmp_path(stream_id);
        let bytes = serde_json::to_vec_pretty(&record)?;
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, stream_id: &str) -> Result<(Vec<u8>, HashMap<String, String>), PositionError> {
        let path = self.record_path(stream_id);
        match self.read_record(&path).await {
            Ok(record) => Ok((record.position, record.metadata)),
            Err(PositionError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PositionError::NotFound(stream_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, stream_id: &str) -> Result<(), PositionError> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(stream_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let prefix = format!("{stream_id}.json.backup.");
        if let Ok(mut entries) = tokio::fs::read_dir(&self.directory).await {
            while let Some(entry) = entries.next_entry().await? {
                if entry
                    .file_name()
                    .to_str()
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
                {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, Vec<u8>>, PositionError> {
        let mut out = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".json") && !n.ends_with(".json.tmp"))
                .unwrap_or(false);
            if !is_record {
                continue;
            }
            if let Ok(record) = self.read_record(&path).await {
                out.insert(record.stream_id, record.position);
            }
        }
        Ok(out)
    }

    async fn health_check(&self) -> Result<(), PositionError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let probe = self.directory.join(".health_check");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position() -> Position {
        Position::Binlog {
            file: "mysql-bin.000001".to_string(),
            offset: 1000,
            gtid: None,
            server_id: 1,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn lsn_parses_hi_lo() {
        assert_eq!(Position::parse_lsn_text("1/2345ABCD").unwrap(), 0x0000_0001_2345_ABCD);
        assert!(Position::parse_lsn_text("no-slash").is_err());
    }

    #[test]
    fn binlog_file_ordering_by_trailing_integer() {
        let a = Position::Binlog {
            file: "mysql-bin.000001".into(),
            offset: 10,
            gtid: None,
            server_id: 1,
            captured_at: Utc::now(),
        };
        let b = Position::Binlog {
            file: "mysql-bin.000002".into(),
            offset: 1,
            gtid: None,
            server_id: 1,
            captured_at: Utc::now(),
        };
        assert_eq!(b.compare(&a), Ordering::Greater);
    }

    #[test]
    fn invalid_positions_are_rejected() {
        let zero_lsn = Position::Lsn {
            lsn: 0,
            txid: None,
            timeline: 1,
            slot: "s".into(),
            database: "db".into(),
            captured_at: Utc::now(),
        };
        assert!(!zero_lsn.is_valid());

        let empty_file = Position::Binlog {
            file: String::new(),
            offset: 5,
            gtid: None,
            server_id: 1,
            captured_at: Utc::now(),
        };
        assert!(!empty_file.is_valid());
    }

    #[test]
    fn cross_variant_compare_is_never_equal() {
        let a = sample_position();
        let b = Position::Opaque {
            token: vec![1, 2, 3],
            captured_at: Utc::now(),
        };
        assert_ne!(a.compare(&b), Ordering::Equal);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), false, 3);
        let registry = PositionRegistry::new();
        let position = sample_position();
        let encoded = registry.encode(&position).unwrap();
        let mut metadata = HashMap::new();
        metadata.insert("position_type".to_string(), position.position_type().to_string());

        store.save("stream-a", &encoded, metadata.clone()).await.unwrap();
        let (loaded_bytes, loaded_metadata) = store.load("stream-a").await.unwrap();
        let loaded = registry.decode(&loaded_bytes, &loaded_metadata).unwrap();
        assert_eq!(loaded, position);
    }

    #[tokio::test]
    async fn load_missing_stream_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), false, 3);
        match store.load("missing").await {
            Err(PositionError::NotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_across_restart_preserves_created_at_and_updates_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), false, 3);

        store.save("s", b"pos-1000", HashMap::new()).await.unwrap();
        let path = dir.path().join("s.json");
        let first: PositionRecord = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

        // simulate a process restart: new store instance, same directory
        let store2 = FilePositionStore::new(dir.path(), false, 3);
        let (loaded, _) = store2.load("s").await.unwrap();
        assert_eq!(loaded, b"pos-1000");

        store2.save("s", b"pos-2000", HashMap::new()).await.unwrap();
        let second: PositionRecord = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.position, b"pos-2000");
    }

    #[tokio::test]
    async fn tmp_file_never_visible_after_successful_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), false, 3);
        store.save("s", b"pos", HashMap::new()).await.unwrap();
        assert!(!dir.path().join("s.json.tmp").exists());
        assert!(dir.path().join("s.json").exists());
    }

    #[tokio::test]
    async fn backups_are_capped_at_backup_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), true, 2);
        for i in 0..5u32 {
            store
                .save("s", format!("pos-{i}").as_bytes(), HashMap::new())
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_str().unwrap().contains(".backup."))
            .collect();
        assert!(backups.len() <= 2);
    }

    #[tokio::test]
    async fn delete_removes_record_and_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), true, 3);
        store.save("s", b"pos", HashMap::new()).await.unwrap();
        store.save("s", b"pos2", HashMap::new()).await.unwrap();
        store.delete("s").await.unwrap();
        assert!(matches!(store.load("s").await, Err(PositionError::NotFound(_))));
    }
}
