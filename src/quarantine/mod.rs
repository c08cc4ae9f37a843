//! Durable quarantine of rejected messages
//!
//! Two planes: a structured metadata index (embedded SQLite behind the
//! [`QuarantineIndex`] trait) and a content-addressed payload blob store.
//! Records are append-only; the retention sweep purges in bulk and unlinks
//! blobs once no surviving row references them.

mod blobs;
mod index;

pub use blobs::BlobStore;
pub use index::SqliteIndex;

use crate::config::StorageConfig;
use crate::error::StoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a message was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    TopicNotAllowed,
    NoSchemaBound,
    SchemaCompileError,
    SchemaValidationError,
    PayloadTooLarge,
    RateLimited,
    UpstreamUnavailable,
    InternalError,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopicNotAllowed => "topic_not_allowed",
            Self::NoSchemaBound => "no_schema_bound",
            Self::SchemaCompileError => "schema_compile_error",
            Self::SchemaValidationError => "schema_validation_error",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimited => "rate_limited",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::InternalError => "internal_error",
        }
    }

    /// Lenient parse for rows written by older builds; anything unknown
    /// maps to `InternalError`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "topic_not_allowed" => Self::TopicNotAllowed,
            "no_schema_bound" => Self::NoSchemaBound,
            "schema_compile_error" => Self::SchemaCompileError,
            "schema_validation_error" => Self::SchemaValidationError,
            "payload_too_large" => Self::PayloadTooLarge,
            "rate_limited" => Self::RateLimited,
            "upstream_unavailable" => Self::UpstreamUnavailable,
            _ => Self::InternalError,
        }
    }
}

impl std::fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision metadata captured alongside the message at quarantine time.
#[derive(Debug, Clone)]
pub struct RecordMeta {
    pub received_at: DateTime<Utc>,
    pub topic: String,
    pub client_id: String,
    pub qos: u8,
    pub retain: bool,
    pub reason: QuarantineReason,
    pub detail: String,
    pub schema_id: Option<String>,
}

/// One append-only quarantine row.
#[derive(Debug, Clone)]
pub struct QuarantineRecord {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub quarantined_at: DateTime<Utc>,
    pub topic: String,
    pub client_id: String,
    pub qos: u8,
    pub retain: bool,
    pub reason: QuarantineReason,
    pub detail: String,
    pub schema_id: Option<String>,
    /// sha256 of the payload in hex; addresses the blob store
    pub payload_ref: String,
    pub payload_size: u64,
}

/// Query filter for [`QuarantineStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub reason: Option<QuarantineReason>,
    /// SQL LIKE pattern on the topic column
    pub topic_like: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Metadata index operations. The embedded SQLite driver is the only one
/// compiled into this build; external relational drivers implement the same
/// trait.
pub trait QuarantineIndex: Send + Sync {
    fn insert(&self, record: &QuarantineRecord) -> Result<(), StoreError>;
    fn get(&self, id: Uuid) -> Result<Option<QuarantineRecord>, StoreError>;
    fn list(&self, filter: &ListFilter, page: &Page) -> Result<Vec<QuarantineRecord>, StoreError>;
    /// Delete matching rows, returning their payload refs for blob GC.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
    /// Delete one row, returning its payload ref if it existed.
    fn delete(&self, id: Uuid) -> Result<Option<String>, StoreError>;
    fn oldest(&self, limit: usize) -> Result<Vec<QuarantineRecord>, StoreError>;
    fn refs_to(&self, payload_ref: &str) -> Result<u64, StoreError>;
    fn known_refs(&self) -> Result<HashSet<String>, StoreError>;
    fn count(&self) -> Result<u64, StoreError>;
    fn total_payload_bytes(&self) -> Result<u64, StoreError>;
    fn is_writable(&self) -> bool;
}

/// Outcome of one retention sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub purged_records: usize,
    pub evicted_records: usize,
    pub unlinked_blobs: usize,
}

/// Facade over the metadata index and the blob store.
pub struct QuarantineStore {
    index: Arc<dyn QuarantineIndex>,
    blobs: BlobStore,
    cleanup_days: u32,
    max_size_bytes: Option<u64>,
    reaper_grace: Duration,
}

impl QuarantineStore {
    pub fn open(storage: &StorageConfig) -> Result<Self, StoreError> {
        let index = Arc::new(SqliteIndex::open(&storage.quarantine.path)?);
        let blobs = BlobStore::open(&storage.payloads)?;
        Ok(Self {
            index,
            blobs,
            cleanup_days: storage.quarantine.cleanup_days,
            max_size_bytes: storage.quarantine.max_size_bytes,
            reaper_grace: Duration::from_secs(storage.payloads.reaper_grace_secs),
        })
    }

    /// Persist a rejected message. The blob is written (and fsynced) before
    /// the index row commits, so a returned id implies both are durable.
    pub fn quarantine(&self, meta: RecordMeta, payload: &[u8]) -> Result<Uuid, StoreError> {
        let payload_ref = hex::encode(Sha256::digest(payload));
        self.blobs.write(&payload_ref, payload)?;

        let record = QuarantineRecord {
            id: Uuid::now_v7(),
            received_at: meta.received_at,
            quarantined_at: Utc::now(),
            topic: meta.topic,
            client_id: meta.client_id,
            qos: meta.qos,
            retain: meta.retain,
            reason: meta.reason,
            detail: meta.detail,
            schema_id: meta.schema_id,
            payload_ref,
            payload_size: payload.len() as u64,
        };
        self.index.insert(&record)?;

        debug!(
            id = %record.id,
            topic = %record.topic,
            reason = %record.reason,
            "message quarantined"
        );
        Ok(record.id)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<QuarantineRecord>, StoreError> {
        self.index.get(id)
    }

    pub fn list(&self, filter: &ListFilter, page: &Page) -> Result<Vec<QuarantineRecord>, StoreError> {
        self.index.list(filter, page)
    }

    /// Read a record's payload back from the blob store.
    pub fn read_payload(&self, record: &QuarantineRecord) -> Result<Vec<u8>, StoreError> {
        self.blobs.read(&record.payload_ref)
    }

    /// Remove records older than the cutoff; blobs are unlinked once no
    /// surviving row references them.
    pub fn purge(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let refs = self.index.delete_older_than(older_than)?;
        let purged = refs.len();
        self.unlink_unreferenced(refs)?;
        Ok(purged)
    }

    /// Delete a single record (replay tool path).
    pub fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        match self.index.delete(id)? {
            Some(payload_ref) => {
                self.unlink_unreferenced(vec![payload_ref])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Retention sweep: age-based purge plus oldest-first eviction while the
    /// soft size ceiling is exceeded.
    pub fn sweep(&self) -> Result<SweepStats, StoreError> {
        let mut stats = SweepStats::default();

        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.cleanup_days));
        let refs = self.index.delete_older_than(cutoff)?;
        stats.purged_records = refs.len();
        stats.unlinked_blobs += self.unlink_unreferenced(refs)?;

        if let Some(max_size) = self.max_size_bytes {
            let mut total = self.index.total_payload_bytes()?;
            while total > max_size {
                let batch = self.index.oldest(64)?;
                if batch.is_empty() {
                    break;
                }
                for record in batch {
                    if total <= max_size {
                        break;
                    }
                    if self.index.delete(record.id)?.is_some() {
                        total = total.saturating_sub(record.payload_size);
                        stats.evicted_records += 1;
                        stats.unlinked_blobs +=
                            self.unlink_unreferenced(vec![record.payload_ref])?;
                    }
                }
            }
        }

        if stats.purged_records > 0 || stats.evicted_records > 0 {
            info!(
                purged = stats.purged_records,
                evicted = stats.evicted_records,
                unlinked = stats.unlinked_blobs,
                "retention sweep complete"
            );
        }
        Ok(stats)
    }

    /// Remove blobs with no referring row older than the grace period.
    pub fn reap_orphans(&self) -> Result<usize, StoreError> {
        let referenced = self.index.known_refs()?;
        let removed = self.blobs.reap_orphans(&referenced, self.reaper_grace)?;
        if removed > 0 {
            warn!(removed, "reaped orphaned payload blobs");
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.index.count()
    }

    pub fn total_payload_bytes(&self) -> Result<u64, StoreError> {
        self.index.total_payload_bytes()
    }

    pub fn is_writable(&self) -> bool {
        self.index.is_writable() && self.blobs.is_writable()
    }

    fn unlink_unreferenced(&self, refs: Vec<String>) -> Result<usize, StoreError> {
        let mut unlinked = 0;
        let mut seen = HashSet::new();
        for payload_ref in refs {
            if !seen.insert(payload_ref.clone()) {
                continue;
            }
            if self.index.refs_to(&payload_ref)? == 0 && self.blobs.remove(&payload_ref)? {
                unlinked += 1;
            }
        }
        Ok(unlinked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, PayloadStoreConfig, QuarantineConfig};

    fn store_with(max_size_bytes: Option<u64>) -> (QuarantineStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            quarantine: QuarantineConfig {
                path: dir.path().join("quarantine.sqlite3"),
                cleanup_days: 30,
                max_size_bytes,
                ..Default::default()
            },
            payloads: PayloadStoreConfig {
                root: dir.path().join("payloads"),
                compression: Compression::None,
                ..Default::default()
            },
        };
        (QuarantineStore::open(&storage).unwrap(), dir)
    }

    fn meta(topic: &str, reason: QuarantineReason) -> RecordMeta {
        RecordMeta {
            received_at: Utc::now(),
            topic: topic.to_string(),
            client_id: "client-1".to_string(),
            qos: 1,
            retain: false,
            reason,
            detail: "test".to_string(),
            schema_id: None,
        }
    }

    #[test]
    fn test_quarantine_then_list_then_purge() {
        let (store, _dir) = store_with(None);

        let id = store
            .quarantine(
                meta("devices/a/telemetry", QuarantineReason::SchemaValidationError),
                b"{\"bad\": true}",
            )
            .unwrap();

        let records = store
            .list(&ListFilter::default(), &Page::default())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].reason, QuarantineReason::SchemaValidationError);
        assert_eq!(store.read_payload(&records[0]).unwrap(), b"{\"bad\": true}");

        let purged = store.purge(Utc::now() + ChronoDuration::days(1)).unwrap();
        assert_eq!(purged, 1);
        assert!(store
            .list(&ListFilter::default(), &Page::default())
            .unwrap()
            .is_empty());

        // Blob unlinked with its last reference
        assert!(!store.blobs.contains(&records[0].payload_ref));
    }

    #[test]
    fn test_identical_payloads_share_a_blob() {
        let (store, _dir) = store_with(None);
        let payload = b"shared payload";

        store
            .quarantine(meta("a/b", QuarantineReason::TopicNotAllowed), payload)
            .unwrap();
        store
            .quarantine(meta("c/d", QuarantineReason::TopicNotAllowed), payload)
            .unwrap();

        let records = store
            .list(&ListFilter::default(), &Page::default())
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload_ref, records[1].payload_ref);

        // Deleting one record keeps the shared blob alive
        assert!(store.delete(records[0].id).unwrap());
        assert!(store.blobs.contains(&records[1].payload_ref));

        assert!(store.delete(records[1].id).unwrap());
        assert!(!store.blobs.contains(&records[1].payload_ref));
    }

    #[test]
    fn test_list_filter_by_reason() {
        let (store, _dir) = store_with(None);
        store
            .quarantine(meta("a/b", QuarantineReason::TopicNotAllowed), b"1")
            .unwrap();
        store
            .quarantine(meta("c/d", QuarantineReason::PayloadTooLarge), b"2")
            .unwrap();

        let filter = ListFilter {
            reason: Some(QuarantineReason::PayloadTooLarge),
            ..Default::default()
        };
        let records = store.list(&filter, &Page::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "c/d");
    }

    #[test]
    fn test_size_ceiling_evicts_oldest_first() {
        let (store, _dir) = store_with(Some(10));

        store
            .quarantine(meta("old/topic", QuarantineReason::TopicNotAllowed), b"aaaaaaaa")
            .unwrap();
        store
            .quarantine(meta("new/topic", QuarantineReason::TopicNotAllowed), b"bbbbbbbb")
            .unwrap();

        let stats = store.sweep().unwrap();
        assert_eq!(stats.evicted_records, 1);

        let records = store
            .list(&ListFilter::default(), &Page::default())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "new/topic");
    }

    #[test]
    fn test_record_ids_are_monotonic() {
        let (store, _dir) = store_with(None);
        let a = store
            .quarantine(meta("a/b", QuarantineReason::TopicNotAllowed), b"1")
            .unwrap();
        let b = store
            .quarantine(meta("a/b", QuarantineReason::TopicNotAllowed), b"2")
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_writable_probe() {
        let (store, _dir) = store_with(None);
        assert!(store.is_writable());
    }
}
