//! Directory-backed blob store used by the disk retry handler.
//!
//! One file per failed request, holding the raw payload bytes:
//!
//! ```text
//! 1718000000123-9f2c4a1be07d3355.blob.tmp            being written
//! 1718000000123-9f2c4a1be07d3355.blob                ready to resend
//! 1718000000123-9f2c4a1be07d3355.blob@1718000060456.lock   leased until t
//! ```
//!
//! The millisecond prefix is the creation time; it orders blobs oldest first
//! and drives retention. A lease is a rename, so two sweeps racing for the
//! same blob cannot both win it.

use crate::config::StorageConfig;
use crate::error::StorageError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const BLOB_EXT: &str = ".blob";
const TEMP_EXT: &str = ".tmp";
const LOCK_EXT: &str = ".lock";
const LEASE_SEP: char = '@';

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub stale_temp_removed: usize,
    pub leases_restored: usize,
    pub expired_removed: usize,
}

/// Blob store rooted at one directory.
#[derive(Debug)]
pub struct PersistentStorage {
    dir: PathBuf,
    max_size_bytes: u64,
    maintenance_period: Duration,
    retention_period: Duration,
    write_timeout: Duration,
    last_maintenance: Mutex<Instant>,
}

impl PersistentStorage {
    /// Opens (creating if needed) the directory and runs one maintenance pass.
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.path)?;
        let storage = Self {
            dir: config.path.clone(),
            max_size_bytes: config.max_size_bytes,
            maintenance_period: config.maintenance_period,
            retention_period: config.retention_period,
            write_timeout: config.write_timeout,
            last_maintenance: Mutex::new(Instant::now()),
        };
        storage.maintain()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Stores `payload` as a new blob and returns its path.
    ///
    /// The bytes land in a temp file first and become visible to
    /// [`blobs`](Self::blobs) only after the rename.
    pub fn write(&self, payload: &[u8]) -> Result<PathBuf, StorageError> {
        self.maintain_if_due();

        let size = self.directory_size()?;
        if size.saturating_add(payload.len() as u64) > self.max_size_bytes {
            return Err(StorageError::Full {
                path: self.dir.clone(),
                size,
                limit: self.max_size_bytes,
            });
        }

        let name = format!("{}-{:016x}{BLOB_EXT}", unix_millis(), rand::random::<u64>());
        let blob = self.dir.join(&name);
        let temp = self.dir.join(format!("{name}{TEMP_EXT}"));

        fs::write(&temp, payload)?;
        if let Err(e) = fs::rename(&temp, &blob) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(blob)
    }

    /// Blobs ready to resend, oldest first. Leased and half-written files are
    /// not listed.
    pub fn blobs(&self) -> Result<Vec<PathBuf>, StorageError> {
        self.maintain_if_due();

        let mut blobs: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| file_name(path).is_some_and(|name| name.ends_with(BLOB_EXT)))
            .collect();
        blobs.sort();
        Ok(blobs)
    }

    /// Takes a blob for `period`. Returns `None` if it is gone or someone
    /// else leased it first.
    pub fn lease(&self, blob: &Path, period: Duration) -> Option<LeasedBlob> {
        let name = file_name(blob)?;
        let until = unix_millis().saturating_add(period.as_millis() as u64);
        let leased = self.dir.join(format!("{name}{LEASE_SEP}{until}{LOCK_EXT}"));

        match fs::rename(blob, &leased) {
            Ok(()) => Some(LeasedBlob {
                path: leased,
                original: blob.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(blob = %blob.display(), error = %e, "failed to lease stored blob");
                None
            }
        }
    }

    /// Total size of every file in the directory, including temp and leased
    /// files.
    pub fn directory_size(&self) -> Result<u64, StorageError> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            // Files can vanish between listing and stat while a sweep runs.
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    total = total.saturating_add(meta.len());
                }
            }
        }
        Ok(total)
    }

    /// Removes abandoned temp files, restores expired leases and deletes
    /// blobs past the retention period.
    pub fn maintain(&self) -> Result<MaintenanceReport, StorageError> {
        *self
            .last_maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();

        let now = unix_millis();
        let retention = self.retention_period.as_millis() as u64;
        let mut report = MaintenanceReport::default();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = file_name(&path) else {
                continue;
            };

            if name.ends_with(TEMP_EXT) {
                if is_older_than(&path, self.write_timeout) && remove(&path) {
                    report.stale_temp_removed += 1;
                }
            } else if name.ends_with(LOCK_EXT) {
                let Some((blob_name, until)) = parse_lease(name) else {
                    continue;
                };
                if until <= now {
                    match fs::rename(&path, self.dir.join(blob_name)) {
                        Ok(()) => report.leases_restored += 1,
                        Err(e) => warn!(blob = %path.display(), error = %e, "failed to restore expired lease"),
                    }
                }
            } else if name.ends_with(BLOB_EXT) {
                let expired = created_millis(name)
                    .is_some_and(|created| now.saturating_sub(created) > retention);
                if expired && remove(&path) {
                    report.expired_removed += 1;
                }
            }
        }

        if report != MaintenanceReport::default() {
            debug!(
                dir = %self.dir.display(),
                stale_temp_removed = report.stale_temp_removed,
                leases_restored = report.leases_restored,
                expired_removed = report.expired_removed,
                "storage maintenance"
            );
        }
        Ok(report)
    }

    fn maintain_if_due(&self) {
        let due = self
            .last_maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
            >= self.maintenance_period;
        if due {
            if let Err(e) = self.maintain() {
                warn!(dir = %self.dir.display(), error = %e, "storage maintenance failed");
            }
        }
    }
}

/// A blob held by one sweep. Dropping it without calling
/// [`delete`](Self::delete) or [`release`](Self::release) leaves the lease to
/// expire on its own.
#[derive(Debug)]
pub struct LeasedBlob {
    path: PathBuf,
    original: PathBuf,
}

impl LeasedBlob {
    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    /// Removes the blob for good.
    pub fn delete(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }

    /// Gives the blob back before the lease expires.
    pub fn release(self) -> io::Result<()> {
        fs::rename(&self.path, &self.original)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// `<blob name>@<until>.lock` into its parts.
fn parse_lease(name: &str) -> Option<(&str, u64)> {
    let stem = name.strip_suffix(LOCK_EXT)?;
    let (blob_name, until) = stem.rsplit_once(LEASE_SEP)?;
    Some((blob_name, until.parse().ok()?))
}

fn created_millis(name: &str) -> Option<u64> {
    name.split_once('-')?.0.parse().ok()
}

fn is_older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|elapsed| elapsed > age)
}

fn remove(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed to remove stored file");
            false
        }
    }
}
