//! Lock Manager: the single expiring "a migration run is in progress" record.
//!
//! The lock record is a small JSON object (`{pid, acquired_at, host}`) written
//! with temp-file + rename so no reader ever sees a partial record. The
//! check-then-create sequence runs inside a short advisory `fs2` lock on a
//! sibling `<lock>.guard` file, which serializes competing processes.
//!
//! A record is stale when:
//! 1. its age reaches the configured TTL, or
//! 2. it is unparseable, or
//! 3. dead-holder reclaim is enabled, it was written on this host, and its
//!    pid is no longer alive.
//!
//! Stale records are removed as a side effect of any check.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;

use cms_migrate_core::paths::{ensure_parent_dir, write_file_atomic};
use cms_migrate_core::{Config, LockRecord};

use crate::{Result, StorageError};

/// Manages the run lock at a fixed path.
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    guard_path: PathBuf,
    ttl: Duration,
    reclaim_dead_holders: bool,
    host: String,
}

/// Holds the advisory guard-file lock for the duration of a check/create.
struct CriticalSection {
    file: File,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockManager {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_path(config.lock_path.clone(), config.lock_ttl)
            .with_dead_holder_reclaim(config.reclaim_dead_holders)
    }

    /// Lock at `path` with the given TTL; dead-holder reclaim is off.
    #[must_use]
    pub fn with_path(path: PathBuf, ttl: Duration) -> Self {
        let guard_path = {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            path.with_file_name(format!("{name}.guard"))
        };
        Self {
            path,
            guard_path,
            ttl,
            reclaim_dead_holders: false,
            host: local_host(),
        }
    }

    #[must_use]
    pub const fn with_dead_holder_reclaim(mut self, enabled: bool) -> Self {
        self.reclaim_dead_holders = enabled;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock. Returns `false` when a valid record already exists.
    ///
    /// The caller owns the lock afterwards and must call [`release`](Self::release).
    /// Prefer [`try_lock`](Self::try_lock), which releases on drop.
    pub fn acquire(&self) -> Result<bool> {
        match self.try_lock() {
            Ok(guard) => {
                guard.disarm();
                Ok(true)
            }
            Err(StorageError::LockBusy { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Take the lock, returning a guard that releases it when dropped.
    ///
    /// Errors with [`StorageError::LockBusy`] if another valid record exists,
    /// or [`StorageError::LockAcquisition`] if the record cannot be written.
    pub fn try_lock(&self) -> Result<LockGuard<'_>> {
        let _section = self.enter()?;

        if let Some(holder) = self.live_holder()? {
            return Err(StorageError::LockBusy {
                pid: holder.pid,
                host: holder.host,
            });
        }

        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            host: self.host.clone(),
        };
        let content = serde_json::to_vec(&record)?;
        write_file_atomic(&self.path, &content).map_err(|e| {
            StorageError::LockAcquisition(format!(
                "cannot write lock record {}: {e}",
                self.path.display()
            ))
        })?;

        tracing::info!(
            pid = record.pid,
            host = %record.host,
            lock = %self.path.display(),
            "migration lock acquired"
        );
        Ok(LockGuard {
            manager: self,
            record,
            armed: true,
        })
    }

    /// True iff a parseable, unexpired record exists. Stale records are deleted.
    pub fn is_locked(&self) -> Result<bool> {
        Ok(self.holder()?.is_some())
    }

    /// The current valid holder, if any. Stale records are deleted.
    pub fn holder(&self) -> Result<Option<LockRecord>> {
        let _section = self.enter()?;
        self.live_holder()
    }

    /// Remove the lock record. Removing a missing record is not an error.
    pub fn release(&self) -> Result<()> {
        remove_if_present(&self.path)?;
        tracing::info!(lock = %self.path.display(), "migration lock released");
        Ok(())
    }

    /// Remove the record only if it is still the one we wrote.
    ///
    /// After a TTL reclaim another process may own the path; its record must survive.
    fn release_owned(&self, ours: &LockRecord) -> Result<()> {
        let _section = self.enter()?;
        match read_record(&self.path) {
            Ok(Some(current)) if current == *ours => self.release(),
            Ok(None) => Ok(()),
            Ok(Some(current)) => {
                tracing::warn!(
                    holder_pid = current.pid,
                    holder_host = %current.host,
                    "migration lock was reclaimed by another run; leaving it in place"
                );
                Ok(())
            }
            // Unreadable record: nobody can hold it validly, remove it.
            Err(_) => self.release(),
        }
    }

    fn enter(&self) -> Result<CriticalSection> {
        ensure_parent_dir(&self.guard_path).map_err(|e| {
            StorageError::LockAcquisition(format!(
                "cannot create lock directory for {}: {e}",
                self.path.display()
            ))
        })?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.guard_path)
            .map_err(|e| {
                StorageError::LockAcquisition(format!(
                    "cannot open lock guard {}: {e}",
                    self.guard_path.display()
                ))
            })?;
        file.lock_exclusive().map_err(|e| {
            StorageError::LockAcquisition(format!(
                "cannot lock guard {}: {e}",
                self.guard_path.display()
            ))
        })?;
        Ok(CriticalSection { file })
    }

    /// Must be called inside [`enter`](Self::enter).
    fn live_holder(&self) -> Result<Option<LockRecord>> {
        let record = match read_record(&self.path) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(
                    lock = %self.path.display(),
                    error = %e,
                    "removing unparseable migration lock record"
                );
                remove_if_present(&self.path)?;
                return Ok(None);
            }
        };

        if record.is_expired(self.ttl, Utc::now()) {
            tracing::warn!(
                holder_pid = record.pid,
                holder_host = %record.host,
                acquired_at = %record.acquired_at,
                "reclaiming expired migration lock"
            );
            remove_if_present(&self.path)?;
            return Ok(None);
        }

        if self.reclaim_dead_holders && record.host == self.host && !pid_alive(record.pid) {
            tracing::warn!(
                holder_pid = record.pid,
                "reclaiming migration lock from dead process"
            );
            remove_if_present(&self.path)?;
            return Ok(None);
        }

        Ok(Some(record))
    }
}

/// RAII handle for a held run lock; releases on drop.
#[must_use = "dropping the guard releases the migration lock"]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    record: LockRecord,
    armed: bool,
}

impl LockGuard<'_> {
    #[must_use]
    pub const fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Release now and surface any error.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.manager.release_owned(&self.record)
    }

    /// Keep the lock held past the guard's lifetime.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.manager.release_owned(&self.record) {
            tracing::error!(error = %e, "failed to release migration lock");
        }
    }
}

fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Host name recorded in lock records.
#[must_use]
pub fn local_host() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            let name = name.to_string_lossy().into_owned();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Check if a process with the given PID is alive.
fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return true;
        };
        // Signal 0 checks existence; EPERM means it exists but belongs to someone else.
        !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
    }
    #[cfg(not(unix))]
    {
        // Conservatively assume alive; TTL expiry still applies.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn manager(tmp: &TempDir, ttl: Duration) -> LockManager {
        LockManager::with_path(tmp.path().join("run").join("migration.lock"), ttl)
    }

    fn write_record(path: &Path, record: &LockRecord) {
        ensure_parent_dir(path).unwrap();
        fs::write(path, serde_json::to_vec(record).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_then_busy_then_release() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800));

        assert!(!lock.is_locked().unwrap());
        assert!(lock.acquire().unwrap());
        assert!(lock.is_locked().unwrap());
        assert!(!lock.acquire().unwrap(), "second acquire must fail");

        lock.release().unwrap();
        assert!(!lock.is_locked().unwrap());
        assert!(lock.acquire().unwrap());
        lock.release().unwrap();
    }

    #[test]
    fn test_release_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800));
        lock.release().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn test_record_contents() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800));
        assert!(lock.acquire().unwrap());

        let record: LockRecord =
            serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.host, local_host());
        assert!(record.age(Utc::now()) < Duration::from_secs(60));
        lock.release().unwrap();
    }

    #[test]
    fn test_expired_record_is_treated_as_absent_and_removed() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(30 * 60));
        write_record(
            lock.path(),
            &LockRecord {
                pid: std::process::id(),
                acquired_at: Utc::now() - chrono::Duration::minutes(31),
                host: "elsewhere".into(),
            },
        );

        assert!(!lock.is_locked().unwrap());
        assert!(!lock.path().exists(), "stale record should be deleted");
    }

    #[test]
    fn test_acquire_reclaims_expired_record() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(30 * 60));
        let stale = LockRecord {
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            host: "crashed-host".into(),
        };
        write_record(lock.path(), &stale);

        let guard = lock.try_lock().unwrap();
        assert_eq!(guard.record().pid, std::process::id());
        let on_disk: LockRecord =
            serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        assert_ne!(on_disk, stale);
    }

    #[test]
    fn test_fresh_foreign_record_blocks() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(30 * 60));
        write_record(
            lock.path(),
            &LockRecord {
                pid: 4242,
                acquired_at: Utc::now(),
                host: "other-host".into(),
            },
        );

        match lock.try_lock() {
            Err(StorageError::LockBusy { pid, host }) => {
                assert_eq!(pid, 4242);
                assert_eq!(host, "other-host");
            }
            Err(e) => panic!("expected LockBusy, got {e:?}"),
            Ok(_) => panic!("expected LockBusy, got a guard"),
        }
        assert!(lock.path().exists(), "live record must not be removed");
    }

    #[test]
    fn test_fresh_record_with_unix_seconds_blocks() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(30 * 60));
        ensure_parent_dir(lock.path()).unwrap();
        let content = format!(
            r#"{{"pid":4242,"timestamp":{},"host":"web-1"}}"#,
            Utc::now().timestamp()
        );
        fs::write(lock.path(), content).unwrap();

        assert!(lock.is_locked().unwrap());
        assert!(lock.path().exists(), "live record must not be removed");
        assert!(!lock.acquire().unwrap());
    }

    #[test]
    fn test_future_stamped_record_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(30 * 60));
        write_record(
            lock.path(),
            &LockRecord {
                pid: 4242,
                acquired_at: Utc::now() + chrono::Duration::days(1),
                host: "skewed-host".into(),
            },
        );

        assert!(!lock.is_locked().unwrap());
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_unparseable_record_is_removed() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800));
        ensure_parent_dir(lock.path()).unwrap();
        fs::write(lock.path(), b"{not json").unwrap();

        assert!(!lock.is_locked().unwrap());
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800));
        {
            let _guard = lock.try_lock().unwrap();
            assert!(lock.is_locked().unwrap());
        }
        assert!(!lock.is_locked().unwrap());
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.try_lock().unwrap();
            panic!("unit blew up");
        }));
        assert!(result.is_err());
        assert!(!lock.is_locked().unwrap());
    }

    #[test]
    fn test_guard_does_not_remove_reclaimed_lock() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800));
        let guard = lock.try_lock().unwrap();

        // Simulate another run having reclaimed the path after our TTL lapsed.
        let newer = LockRecord {
            pid: 7777,
            acquired_at: Utc::now(),
            host: "web-2".into(),
        };
        write_record(lock.path(), &newer);

        drop(guard);
        let on_disk: LockRecord =
            serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        assert_eq!(on_disk, newer);
    }

    #[test]
    fn test_no_temp_files_left_after_acquire() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800));
        let _guard = lock.try_lock().unwrap();
        let leftovers: Vec<_> = fs::read_dir(lock.path().parent().unwrap())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_holder_on_same_host_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800)).with_dead_holder_reclaim(true);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        write_record(
            lock.path(),
            &LockRecord {
                pid: dead_pid,
                acquired_at: Utc::now(),
                host: local_host(),
            },
        );
        assert!(!lock.is_locked().unwrap());
    }

    #[test]
    fn test_live_holder_on_same_host_is_kept() {
        let tmp = TempDir::new().unwrap();
        let lock = manager(&tmp, Duration::from_secs(1800)).with_dead_holder_reclaim(true);
        write_record(
            lock.path(),
            &LockRecord {
                pid: std::process::id(),
                acquired_at: Utc::now(),
                host: local_host(),
            },
        );
        assert!(lock.is_locked().unwrap());
    }

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        let tmp = TempDir::new().unwrap();
        let lock = Arc::new(manager(&tmp, Duration::from_secs(1800)));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    lock.acquire().unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        lock.release().unwrap();
    }
}
