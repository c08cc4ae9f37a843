//! Embedded quarantine metadata index (SQLite)
//!
//! WAL journal with `synchronous=FULL` so an insert that returns has been
//! fsynced; callers rely on post-return durability. Writes are serialized
//! through a single connection.

use super::{ListFilter, Page, QuarantineIndex, QuarantineRecord, QuarantineReason};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl SqliteIndex {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "full")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS quarantined_messages (
                id TEXT PRIMARY KEY,
                received_at TEXT NOT NULL,
                quarantined_at TEXT NOT NULL,
                topic TEXT NOT NULL,
                client_id TEXT NOT NULL,
                qos INTEGER NOT NULL,
                retain INTEGER NOT NULL,
                reason TEXT NOT NULL,
                detail TEXT NOT NULL,
                schema_id TEXT NULL,
                payload_ref TEXT NOT NULL,
                payload_size INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_quarantined_at
                ON quarantined_messages(quarantined_at);
            CREATE INDEX IF NOT EXISTS idx_reason
                ON quarantined_messages(reason);",
        )?;

        info!(path = %path.display(), "quarantine index opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<QuarantineRecord> {
    let id: String = row.get("id")?;
    let received_at: String = row.get("received_at")?;
    let quarantined_at: String = row.get("quarantined_at")?;
    let reason: String = row.get("reason")?;

    Ok(QuarantineRecord {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        received_at: parse_ts(&received_at),
        quarantined_at: parse_ts(&quarantined_at),
        topic: row.get("topic")?,
        client_id: row.get("client_id")?,
        qos: row.get("qos")?,
        retain: row.get::<_, i64>("retain")? != 0,
        reason: QuarantineReason::parse(&reason),
        detail: row.get("detail")?,
        schema_id: row.get("schema_id")?,
        payload_ref: row.get("payload_ref")?,
        payload_size: row.get::<_, i64>("payload_size")? as u64,
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl QuarantineIndex for SqliteIndex {
    fn insert(&self, record: &QuarantineRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO quarantined_messages
                (id, received_at, quarantined_at, topic, client_id, qos, retain,
                 reason, detail, schema_id, payload_ref, payload_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id.to_string(),
                record.received_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                record.quarantined_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                record.topic,
                record.client_id,
                record.qos,
                record.retain as i64,
                record.reason.as_str(),
                record.detail,
                record.schema_id,
                record.payload_ref,
                record.payload_size as i64,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<QuarantineRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT * FROM quarantined_messages WHERE id = ?1",
                params![id.to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list(&self, filter: &ListFilter, page: &Page) -> Result<Vec<QuarantineRecord>, StoreError> {
        let mut sql = String::from("SELECT * FROM quarantined_messages WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(reason) = filter.reason {
            sql.push_str(" AND reason = ?");
            args.push(Box::new(reason.as_str().to_string()));
        }
        if let Some(topic_like) = &filter.topic_like {
            sql.push_str(" AND topic LIKE ?");
            args.push(Box::new(topic_like.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND quarantined_at >= ?");
            args.push(Box::new(since.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND quarantined_at <= ?");
            args.push(Box::new(until.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)));
        }

        sql.push_str(" ORDER BY quarantined_at DESC LIMIT ? OFFSET ?");
        args.push(Box::new(page.limit as i64));
        args.push(Box::new(page.offset as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_record,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let refs = {
            let mut stmt = tx.prepare(
                "SELECT payload_ref FROM quarantined_messages WHERE quarantined_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)], |row| row.get(0))?;
            let mut refs: Vec<String> = Vec::new();
            for row in rows {
                refs.push(row?);
            }
            refs
        };
        tx.execute(
            "DELETE FROM quarantined_messages WHERE quarantined_at < ?1",
            params![cutoff.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)],
        )?;
        tx.commit()?;
        Ok(refs)
    }

    fn delete(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let payload_ref: Option<String> = tx
            .query_row(
                "SELECT payload_ref FROM quarantined_messages WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if payload_ref.is_some() {
            tx.execute(
                "DELETE FROM quarantined_messages WHERE id = ?1",
                params![id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(payload_ref)
    }

    fn oldest(&self, limit: usize) -> Result<Vec<QuarantineRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM quarantined_messages ORDER BY quarantined_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn refs_to(&self, payload_ref: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM quarantined_messages WHERE payload_ref = ?1",
            params![payload_ref],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn known_refs(&self) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT payload_ref FROM quarantined_messages")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut refs = HashSet::new();
        for row in rows {
            refs.insert(row?);
        }
        Ok(refs)
    }

    fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM quarantined_messages", [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    fn total_payload_bytes(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(payload_size), 0) FROM quarantined_messages",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    fn is_writable(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}
