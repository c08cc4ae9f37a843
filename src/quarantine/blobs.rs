//! Content-addressed payload blob store
//!
//! Blobs live under `<root>/<hh>/<hh>/<sha256-hex>[.gz]`, sharded on the
//! first two hex byte pairs to avoid wide directories. Writes go to a
//! temporary file in the target shard directory, are fsynced, and renamed
//! into place; a write whose target already exists is a natural dedup hit.

use crate::config::{Compression, PayloadStoreConfig};
use crate::error::StoreError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

pub struct BlobStore {
    root: PathBuf,
    compression: Compression,
}

impl BlobStore {
    pub fn open(config: &PayloadStoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.root)?;
        Ok(Self {
            root: config.root.clone(),
            compression: config.compression,
        })
    }

    fn shard_dir(&self, hash_hex: &str) -> PathBuf {
        self.root.join(&hash_hex[0..2]).join(&hash_hex[2..4])
    }

    fn extension(compression: Compression) -> &'static str {
        match compression {
            Compression::None => "",
            Compression::Gzip => ".gz",
        }
    }

    /// Final path for a hash under the configured compression.
    pub fn path_for(&self, hash_hex: &str) -> PathBuf {
        self.shard_dir(hash_hex)
            .join(format!("{hash_hex}{}", Self::extension(self.compression)))
    }

    /// Any existing path for a hash, regardless of the compression it was
    /// written with.
    fn find(&self, hash_hex: &str) -> Option<PathBuf> {
        for ext in ["", ".gz"] {
            let candidate = self.shard_dir(hash_hex).join(format!("{hash_hex}{ext}"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    pub fn contains(&self, hash_hex: &str) -> bool {
        self.find(hash_hex).is_some()
    }

    /// Write a payload under its hash. Idempotent: an existing target is
    /// left untouched.
    pub fn write(&self, hash_hex: &str, payload: &[u8]) -> Result<(), StoreError> {
        if self.contains(hash_hex) {
            debug!(hash = hash_hex, "blob already present, deduplicated");
            return Ok(());
        }

        let shard = self.shard_dir(hash_hex);
        fs::create_dir_all(&shard).map_err(|source| StoreError::BlobWrite {
            hash: hash_hex.to_string(),
            source,
        })?;

        let tmp = shard.join(format!(".tmp-{}", Uuid::new_v4()));
        let target = self.path_for(hash_hex);

        let result = self.write_tmp(&tmp, payload).and_then(|_| {
            fs::rename(&tmp, &target)?;
            Ok(())
        });

        if let Err(source) = result {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::BlobWrite {
                hash: hash_hex.to_string(),
                source,
            });
        }
        Ok(())
    }

    fn write_tmp(&self, tmp: &Path, payload: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(tmp)?;
        match self.compression {
            Compression::None => file.write_all(payload)?,
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(&mut file, flate2::Compression::default());
                encoder.write_all(payload)?;
                encoder.finish()?;
            }
        }
        file.sync_all()
    }

    /// Read a payload back, decompressing as needed.
    pub fn read(&self, hash_hex: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.find(hash_hex).ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("blob {hash_hex} not found"),
            ))
        })?;

        let mut raw = Vec::new();
        File::open(&path)?.read_to_end(&mut raw)?;

        if path.extension().is_some_and(|e| e == "gz") {
            let mut decoded = Vec::new();
            GzDecoder::new(raw.as_slice()).read_to_end(&mut decoded)?;
            Ok(decoded)
        } else {
            Ok(raw)
        }
    }

    /// Unlink a blob. Returns whether anything was removed.
    pub fn remove(&self, hash_hex: &str) -> Result<bool, StoreError> {
        match self.find(hash_hex) {
            Some(path) => {
                fs::remove_file(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_writable(&self) -> bool {
        let probe = self.root.join(format!(".probe-{}", Uuid::new_v4()));
        match File::create(&probe) {
            Ok(_) => {
                let _ = fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    }

    /// Remove blobs with no referring index row that are older than the
    /// grace period. Covers blobs orphaned by a crash between the blob write
    /// and the index insert.
    pub fn reap_orphans(
        &self,
        referenced: &HashSet<String>,
        grace: Duration,
    ) -> Result<usize, StoreError> {
        let cutoff = SystemTime::now() - grace;
        let mut removed = 0;

        for first in read_subdirs(&self.root)? {
            for second in read_subdirs(&first)? {
                for entry in fs::read_dir(&second)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().to_string();
                    let hash = name.trim_end_matches(".gz");

                    // Stale temp files are orphans too
                    let is_tmp = name.starts_with(".tmp-");
                    if !is_tmp && referenced.contains(hash) {
                        continue;
                    }

                    let modified = entry.metadata()?.modified()?;
                    if modified > cutoff {
                        continue;
                    }

                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!(blob = %name, error = %e, "failed to reap orphaned blob");
                    } else {
                        removed += 1;
                    }
                }
            }
        }

        Ok(removed)
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}
