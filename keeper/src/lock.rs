//! Environment-scoped advisory run lock.
//!
//! Backup, prune and delete for one environment are serialized through a
//! lease file at `{backup_root}/{environment}/.keeper.lock`. The lease body is
//! written to a private temp file first and published with `hard_link`, which
//! never overwrites, so the lock file is either absent or complete.
//!
//! An expired lease is taken over by renaming it to a unique tombstone and
//! re-reading what was actually moved. A lease that cannot be parsed only
//! counts as abandoned once its mtime is older than [`ABANDONED_GRACE`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::manifest::validate_environment;
use crate::run_blocking;

const LOCK_FILE: &str = ".keeper.lock";

/// Age after which an unreadable lock file is treated as abandoned.
pub const ABANDONED_GRACE: Duration = Duration::from_secs(30);

/// Publish attempts before giving up on a lock that keeps changing hands.
const MAX_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub operation: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn describe(&self) -> String {
        format!(
            "{} ({}, pid {}, until {})",
            self.holder,
            self.operation,
            self.pid,
            self.expires_at.to_rfc3339()
        )
    }
}

/// What sits at the lock path right now.
enum Existing {
    Gone,
    Live(Lease),
    Stale(Option<Lease>),
    Unsettled,
}

/// A held run lock. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    lease: Lease,
    released: bool,
}

impl RunLock {
    /// Acquire the lock for `environment` off the async runtime.
    ///
    /// # Errors
    ///
    /// `LockContention` if another live holder owns it.
    pub async fn acquire(
        backup_root: &Path,
        environment: &str,
        operation: &str,
        lease_duration: Duration,
    ) -> Result<Self> {
        let backup_root = backup_root.to_path_buf();
        let environment = environment.to_string();
        let operation = operation.to_string();
        run_blocking(move || {
            Self::acquire_blocking(&backup_root, &environment, &operation, lease_duration)
        })
        .await
    }

    /// Blocking variant of [`RunLock::acquire`].
    pub fn acquire_blocking(
        backup_root: &Path,
        environment: &str,
        operation: &str,
        lease_duration: Duration,
    ) -> Result<Self> {
        validate_environment(environment)?;
        let dir = backup_root.join(environment);
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOCK_FILE);

        let now = Utc::now();
        let token = uuid::Uuid::new_v4();
        let lease = Lease {
            holder: format!("{}@{}", token, std::process::id()),
            operation: operation.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now
                + ChronoDuration::from_std(lease_duration)
                    .map_err(|e| Error::Config(format!("Invalid lease duration: {}", e)))?,
        };

        let staged = dir.join(format!("{}.{}.tmp", LOCK_FILE, token));
        write_staged(&staged, &lease)?;
        let result = publish(&path, &staged, &dir, environment, &lease);
        remove_quietly(&staged);

        result?;
        info!(environment, operation, holder = %lease.holder, "Acquired run lock");
        Ok(Self {
            path,
            lease,
            released: false,
        })
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Release explicitly, off the async runtime.
    pub async fn release(self) {
        let _ = run_blocking(move || {
            let mut lock = self;
            lock.release_inner();
            Ok(())
        })
        .await;
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Only remove the file if it is still ours (it may have been taken over)
        match read_lease(&self.path) {
            Some(current) if current.holder == self.lease.holder => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove run lock");
                } else {
                    debug!(holder = %self.lease.holder, "Released run lock");
                }
            }
            Some(current) => {
                warn!(
                    ours = %self.lease.holder,
                    current = %current.holder,
                    "Run lock was taken over while held"
                );
            }
            None => {}
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn write_staged(staged: &Path, lease: &Lease) -> Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(staged)?;
    file.write_all(&serde_json::to_vec_pretty(lease)?)?;
    file.sync_all()?;
    Ok(())
}

/// Link the staged lease into place, taking over a stale one at most once
/// per attempt.
fn publish(path: &Path, staged: &Path, dir: &Path, environment: &str, ours: &Lease) -> Result<()> {
    for _ in 0..MAX_ATTEMPTS {
        match fs::hard_link(staged, path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        match inspect(path) {
            Existing::Gone => continue,
            Existing::Live(held) => return Err(contention(environment, held.describe())),
            Existing::Unsettled => {
                return Err(contention(environment, "unreadable lease, still within grace".into()))
            }
            Existing::Stale(seen) => {
                if let Some(live) = take_over(path, dir, environment, seen.as_ref(), ours)? {
                    return Err(contention(environment, live.describe()));
                }
            }
        }
    }

    Err(contention(environment, "another process (lock kept changing hands)".into()))
}

/// Move the stale lease aside. Returns the lease that was moved when it
/// turned out to be live after all; that lease is put back in place.
fn take_over(
    path: &Path,
    dir: &Path,
    environment: &str,
    seen: Option<&Lease>,
    ours: &Lease,
) -> Result<Option<Lease>> {
    let tombstone = dir.join(format!("{}.{}.stale", LOCK_FILE, uuid::Uuid::new_v4()));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let moved = read_lease(&tombstone);
    let replaced = match (&moved, seen) {
        (Some(moved), Some(seen)) => moved.holder != seen.holder,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if let Some(moved) = moved.filter(|m| replaced && !m.is_expired(Utc::now())) {
        // Someone published a fresh lease between inspection and rename.
        if let Err(e) = fs::hard_link(&tombstone, path) {
            warn!(environment, error = %e, "Could not restore a live run lock moved aside");
        }
        remove_quietly(&tombstone);
        return Ok(Some(moved));
    }

    match seen {
        Some(stale) => warn!(
            environment,
            stale_holder = %stale.holder,
            expired_at = %stale.expires_at,
            new_holder = %ours.holder,
            "Taking over expired run lock"
        ),
        None => warn!(environment, "Run lock file unreadable past grace, treating as abandoned"),
    }
    remove_quietly(&tombstone);
    Ok(None)
}

fn inspect(path: &Path) -> Existing {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Existing::Gone,
        Err(_) => return Existing::Unsettled,
    };
    match serde_json::from_slice::<Lease>(&data) {
        Ok(lease) if lease.is_expired(Utc::now()) => Existing::Stale(Some(lease)),
        Ok(lease) => Existing::Live(lease),
        Err(_) if older_than(path, ABANDONED_GRACE) => Existing::Stale(None),
        Err(_) => Existing::Unsettled,
    }
}

fn older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed >= age)
}

fn contention(environment: &str, holder: String) -> Error {
    Error::LockContention {
        environment: environment.to_string(),
        holder,
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove lock scratch file"),
    }
}

fn read_lease(path: &Path) -> Option<Lease> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::TempDir;

    const LEASE: Duration = Duration::from_secs(60);

    fn lock_path(temp: &TempDir) -> PathBuf {
        temp.path().join("prod").join(LOCK_FILE)
    }

    fn write_garbage_lock(temp: &TempDir) {
        fs::create_dir_all(temp.path().join("prod")).unwrap();
        fs::write(lock_path(temp), "garbage").unwrap();
    }

    fn backdate(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let lock = RunLock::acquire_blocking(temp.path(), "prod", "backup", LEASE).unwrap();
        assert!(lock_path(&temp).exists());
        assert_eq!(lock.lease().operation, "backup");

        drop(lock);
        assert!(!lock_path(&temp).exists());
        // No staging or tombstone files are left next to the lock
        assert_eq!(fs::read_dir(temp.path().join("prod")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_async_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let lock = RunLock::acquire(temp.path(), "prod", "prune", LEASE).await.unwrap();
        let err = RunLock::acquire(temp.path(), "prod", "backup", LEASE).await.unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));

        lock.release().await;
        assert!(!lock_path(&temp).exists());
    }

    #[test]
    fn test_contention() {
        let temp = TempDir::new().unwrap();
        let _held = RunLock::acquire_blocking(temp.path(), "prod", "backup", LEASE).unwrap();
        let err = RunLock::acquire_blocking(temp.path(), "prod", "prune", LEASE).unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));

        // Other environments are independent
        RunLock::acquire_blocking(temp.path(), "staging", "prune", LEASE).unwrap();
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let stale = RunLock::acquire_blocking(temp.path(), "prod", "backup", Duration::ZERO).unwrap();

        let fresh = RunLock::acquire_blocking(temp.path(), "prod", "prune", LEASE).unwrap();
        assert_eq!(fresh.lease().operation, "prune");

        // The stale holder must not remove the new holder's lease
        drop(stale);
        assert!(lock_path(&temp).exists());
        let err = RunLock::acquire_blocking(temp.path(), "prod", "backup", LEASE).unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
    }

    #[test]
    fn test_fresh_unreadable_lock_is_respected() {
        let temp = TempDir::new().unwrap();
        write_garbage_lock(&temp);

        let err = RunLock::acquire_blocking(temp.path(), "prod", "backup", LEASE).unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
        assert_eq!(fs::read_to_string(lock_path(&temp)).unwrap(), "garbage");
    }

    #[test]
    fn test_old_unreadable_lock_is_abandoned() {
        let temp = TempDir::new().unwrap();
        write_garbage_lock(&temp);
        backdate(&lock_path(&temp), ABANDONED_GRACE * 2);

        let lock = RunLock::acquire_blocking(temp.path(), "prod", "backup", LEASE).unwrap();
        assert_eq!(read_lease(&lock_path(&temp)).unwrap().holder, lock.lease().holder);
    }

    #[test]
    fn test_concurrent_acquire_has_single_holder() {
        let temp = TempDir::new().unwrap();
        let double_held = AtomicUsize::new(0);

        for round in 0..200 {
            // Alternate between a free lock and an expired one to take over
            if round % 2 == 1 {
                std::mem::forget(
                    RunLock::acquire_blocking(temp.path(), "prod", "stale", Duration::ZERO).unwrap(),
                );
            }

            let start = Barrier::new(2);
            let held = Barrier::new(2);
            let winners = AtomicUsize::new(0);
            std::thread::scope(|s| {
                for _ in 0..2 {
                    s.spawn(|| {
                        start.wait();
                        let lock = RunLock::acquire_blocking(temp.path(), "prod", "backup", LEASE);
                        if lock.is_ok() {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                        // Both threads hold whatever they got until both tried
                        held.wait();
                        drop(lock);
                    });
                }
            });

            match winners.load(Ordering::SeqCst) {
                1 => {}
                2 => {
                    double_held.fetch_add(1, Ordering::SeqCst);
                }
                n => panic!("round {round}: {n} holders"),
            }
            assert!(!lock_path(&temp).exists(), "round {round} leaked the lock");
        }

        assert_eq!(double_held.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejects_bad_environment() {
        let temp = TempDir::new().unwrap();
        assert!(RunLock::acquire_blocking(temp.path(), "../etc", "backup", LEASE).is_err());
    }
}
