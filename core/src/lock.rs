/// Cooperative cross-process advisory lock.
///
/// A file-backed store acquires an exclusive lock by creating a sentinel
/// file next to the database (`<dbpath>.lock`) with O_EXCL semantics. The
/// sentinel holds a small JSON record identifying the holder. A candidate
/// that finds an existing sentinel reads it: a live pid on the same host
/// means the lock is taken; a dead or unreadable record is stale and taken
/// over.
use crate::errors::{TaskError, TaskResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Identity of the process holding (or last holding) the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub host: String,
    pub process: String,
    /// Acquisition time, epoch milliseconds.
    pub timestamp: i64,
}

impl LockHolder {
    fn current(process: &str) -> Self {
        LockHolder {
            pid: std::process::id(),
            host: current_host(),
            process: process.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Milliseconds since the holder acquired the lock.
    pub fn age_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.timestamp
    }

    /// True when the recorded holder still appears to be running. A holder
    /// on a different host cannot be probed and is presumed alive.
    pub fn is_alive(&self) -> bool {
        if self.host != current_host() {
            return true;
        }
        pid_alive(self.pid)
    }
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} on {} ({}, held {}ms)",
            self.pid,
            self.host,
            self.process,
            self.age_ms()
        )
    }
}

/// Exclusive advisory lock over a database path. Released explicitly via
/// `release`, or best-effort on drop.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    holder: LockHolder,
    released: bool,
}

impl ProcessLock {
    /// Sentinel path for a database file: sibling with a `.lock` suffix.
    pub fn lock_path_for(db_path: &Path) -> PathBuf {
        PathBuf::from(format!("{}.lock", db_path.display()))
    }

    /// Acquire the lock for `db_path`, taking over stale sentinels.
    pub fn acquire(db_path: &Path, process: &str) -> TaskResult<Self> {
        let lock_path = Self::lock_path_for(db_path);
        let holder = LockHolder::current(process);
        let payload = serde_json::to_string(&holder)
            .map_err(|e| TaskError::Storage(format!("failed to encode lock record: {e}")))?;

        // One takeover attempt after detecting a stale sentinel; a second
        // contender winning the race surfaces as Busy.
        for attempt in 0..2 {
            match create_exclusive(&lock_path, &payload) {
                Ok(()) => {
                    debug!(lock = %lock_path.display(), pid = holder.pid, "acquired advisory lock");
                    return Ok(ProcessLock {
                        lock_path,
                        holder,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match read_holder_file(&lock_path) {
                        Some(existing) if existing.is_alive() => {
                            return Err(TaskError::Busy { holder: existing });
                        }
                        Some(existing) => {
                            warn!(
                                lock = %lock_path.display(),
                                stale_pid = existing.pid,
                                "taking over stale advisory lock"
                            );
                            let _ = fs::remove_file(&lock_path);
                        }
                        None => {
                            warn!(
                                lock = %lock_path.display(),
                                "unreadable advisory lock record, treating as stale"
                            );
                            let _ = fs::remove_file(&lock_path);
                        }
                    }
                    if attempt == 1 {
                        // Someone else re-created it between our removal and
                        // retry; report whatever is there now.
                        if let Some(existing) = read_holder_file(&lock_path) {
                            return Err(TaskError::Busy { holder: existing });
                        }
                    }
                }
                Err(err) => return Err(TaskError::Io(err)),
            }
        }

        Err(TaskError::Storage(format!(
            "could not acquire advisory lock at {}",
            lock_path.display()
        )))
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Remove the sentinel. Idempotent.
    pub fn release(mut self) -> TaskResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> TaskResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {
                debug!(lock = %self.lock_path.display(), "released advisory lock");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TaskError::Io(err)),
        }
    }

    /// Read the holder record for a database path without acquiring.
    pub fn read_holder(db_path: &Path) -> Option<LockHolder> {
        read_holder_file(&Self::lock_path_for(db_path))
    }

    /// Operational recovery: unconditionally remove the sentinel. Returns
    /// true when a sentinel existed.
    pub fn force_unlock(db_path: &Path) -> TaskResult<bool> {
        let lock_path = Self::lock_path_for(db_path);
        match fs::remove_file(&lock_path) {
            Ok(()) => {
                warn!(lock = %lock_path.display(), "advisory lock forcibly removed");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(TaskError::Io(err)),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}

fn create_exclusive(path: &Path, payload: &str) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(payload.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_holder_file(path: &Path) -> Option<LockHolder> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn current_host() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM and anything else: the process exists but is not ours.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No portable probe; a matching-host holder is presumed alive.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn dead_pid() -> u32 {
        // Spawn and reap a short-lived child; its pid is free afterwards.
        let child = std::process::Command::new("true")
            .spawn()
            .expect("spawn child");
        let pid = child.id();
        let mut child = child;
        child.wait().expect("wait child");
        pid
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tasks.db");

        let lock = ProcessLock::acquire(&db_path, "test").expect("acquire");
        let lock_path = lock.lock_path().to_path_buf();
        assert!(lock_path.exists());

        let holder = ProcessLock::read_holder(&db_path).expect("holder record");
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.process, "test");

        lock.release().expect("release");
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_second_acquire_reports_busy_with_holder() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tasks.db");

        let _lock = ProcessLock::acquire(&db_path, "first").expect("acquire");
        let err = ProcessLock::acquire(&db_path, "second").expect_err("contended");
        match err {
            TaskError::Busy { holder } => {
                assert_eq!(holder.pid, std::process::id());
                assert_eq!(holder.process, "first");
            }
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_takeover() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tasks.db");
        let lock_path = ProcessLock::lock_path_for(&db_path);

        let stale = LockHolder {
            pid: dead_pid(),
            host: current_host(),
            process: "crashed".to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = ProcessLock::acquire(&db_path, "survivor").expect("takeover");
        assert_eq!(lock.holder().pid, std::process::id());

        let holder = ProcessLock::read_holder(&db_path).expect("holder record");
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.process, "survivor");
    }

    #[test]
    fn test_corrupt_lock_file_is_stale() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tasks.db");
        let lock_path = ProcessLock::lock_path_for(&db_path);
        fs::write(&lock_path, "not json").unwrap();

        let lock = ProcessLock::acquire(&db_path, "test").expect("takeover corrupt");
        assert_eq!(lock.holder().pid, std::process::id());
    }

    #[test]
    fn test_force_unlock() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tasks.db");

        assert!(!ProcessLock::force_unlock(&db_path).unwrap());

        let lock = ProcessLock::acquire(&db_path, "test").expect("acquire");
        assert!(ProcessLock::force_unlock(&db_path).unwrap());
        assert!(ProcessLock::read_holder(&db_path).is_none());
        // Dropping the original lock after a force-unlock is harmless.
        drop(lock);
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tasks.db");
        let lock_path = ProcessLock::lock_path_for(&db_path);

        {
            let _lock = ProcessLock::acquire(&db_path, "test").expect("acquire");
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }
}
