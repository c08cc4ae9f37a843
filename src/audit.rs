//! Structured audit trail
//!
//! One line-JSON record per terminal decision. Records are buffered in
//! memory and written by a dedicated thread so the worker path never blocks
//! on audit I/O; when the buffer overflows, the oldest unwritten records are
//! dropped and counted. Events are enqueued only after the corresponding
//! side effect (forward or quarantine commit) has completed, so the trail
//! reflects post-commit state.

use crate::config::{AuditConfig, AuditDestination};
use crate::quarantine::QuarantineReason;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

/// Terminal state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Forwarded,
    Quarantined,
    Dropped,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub decision: Decision,
    pub topic: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<QuarantineReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,
    /// Schema violation carried through in warn-only mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub payload_size: usize,
    pub duration_us: u64,
    pub forwarded: bool,
    pub dry_run: bool,
}

struct Shared {
    queue: Mutex<VecDeque<AuditEvent>>,
    cond: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    shutdown: AtomicBool,
}

/// Asynchronous audit writer.
pub struct AuditSink {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditSink {
    /// Open the destination and start the writer thread.
    pub fn start(config: &AuditConfig) -> std::io::Result<Self> {
        let mut destination = Destination::open(config)?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.buffer_size.min(4096))),
            cond: Condvar::new(),
            capacity: config.buffer_size.max(1),
            dropped: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let writer_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || writer_loop(&writer_shared, &mut destination))?;

        Ok(Self {
            shared,
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a record. Never blocks; drops the oldest unwritten record on
    /// overflow.
    pub fn emit(&self, event: AuditEvent) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.shared.cond.notify_one();
    }

    /// Records dropped due to buffer overflow.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Sink with no writer thread, for exercising buffer behavior.
    #[cfg(test)]
    fn unstarted(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                capacity,
                dropped: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
            writer: Mutex::new(None),
        }
    }

    /// Flush remaining records and stop the writer thread.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                error!("audit writer thread panicked");
            }
        }
    }
}

fn writer_loop(shared: &Shared, destination: &mut Destination) {
    loop {
        let batch: Vec<AuditEvent> = {
            let mut queue = shared.queue.lock();
            while queue.is_empty() && !shared.shutdown.load(Ordering::SeqCst) {
                shared.cond.wait(&mut queue);
            }
            if queue.is_empty() {
                break;
            }
            queue.drain(..).collect()
        };

        for event in &batch {
            if let Err(e) = destination.write_line(event) {
                warn!(error = %e, "failed to write audit record");
            }
        }
        if let Err(e) = destination.flush() {
            warn!(error = %e, "failed to flush audit trail");
        }
    }
    let _ = destination.flush();
}

enum Destination {
    File {
        path: PathBuf,
        max_bytes: u64,
        file: File,
        written: u64,
    },
    Stdout,
}

impl Destination {
    fn open(config: &AuditConfig) -> std::io::Result<Self> {
        match config.destination {
            AuditDestination::Stdout => Ok(Self::Stdout),
            AuditDestination::File => {
                if let Some(parent) = config.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&config.path)?;
                let written = file.metadata()?.len();
                Ok(Self::File {
                    path: config.path.clone(),
                    max_bytes: config.max_file_bytes,
                    file,
                    written,
                })
            }
        }
    }

    fn write_line(&mut self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        match self {
            Self::Stdout => std::io::stdout().write_all(&line),
            Self::File {
                path,
                max_bytes,
                file,
                written,
            } => {
                if *written + line.len() as u64 > *max_bytes {
                    let rotated = rotate_path(path);
                    std::fs::rename(&*path, &rotated)?;
                    *file = OpenOptions::new().create(true).append(true).open(&*path)?;
                    *written = 0;
                }
                file.write_all(&line)?;
                *written += line.len() as u64;
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout => std::io::stdout().flush(),
            Self::File { file, .. } => file.flush(),
        }
    }
}

fn rotate_path(path: &PathBuf) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{stamp}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic: &str, decision: Decision) -> AuditEvent {
        AuditEvent {
            ts: Utc::now(),
            decision,
            topic: topic.to_string(),
            client_id: "client-1".to_string(),
            schema_id: Some("temperature_v1".to_string()),
            reason: None,
            detail: None,
            record_id: None,
            warning: None,
            payload_size: 42,
            duration_us: 120,
            forwarded: decision == Decision::Forwarded,
            dry_run: false,
        }
    }

    #[test]
    fn test_events_written_as_line_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            destination: AuditDestination::File,
            path: dir.path().join("audit.jsonl"),
            ..Default::default()
        };

        let sink = AuditSink::start(&config).unwrap();
        sink.emit(event("devices/a/telemetry", Decision::Forwarded));
        sink.emit(event("devices/b/telemetry", Decision::Quarantined));
        sink.shutdown();

        let content = std::fs::read_to_string(&config.path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["decision"], "forwarded");
        assert_eq!(first["topic"], "devices/a/telemetry");
        assert_eq!(first["forwarded"], true);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["decision"], "quarantined");
    }

    #[test]
    fn test_none_fields_are_omitted() {
        let mut e = event("t", Decision::Forwarded);
        e.schema_id = None;
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("schema_id").is_none());
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let sink = AuditSink::unstarted(2);
        sink.emit(event("first", Decision::Forwarded));
        sink.emit(event("second", Decision::Forwarded));
        sink.emit(event("third", Decision::Forwarded));

        assert_eq!(sink.dropped_events(), 1);
        let queue = sink.shared.queue.lock();
        let topics: Vec<&str> = queue.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, vec!["second", "third"]);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            destination: AuditDestination::File,
            path: dir.path().join("audit.jsonl"),
            max_file_bytes: 256,
            ..Default::default()
        };
        let sink = AuditSink::start(&config).unwrap();

        for i in 0..8 {
            sink.emit(event(&format!("topic/{i}"), Decision::Forwarded));
        }
        sink.shutdown();

        let rotated = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("audit.jsonl."))
            .count();
        assert!(rotated >= 1, "expected at least one rotated file");
        assert!(config.path.exists());
    }
}
