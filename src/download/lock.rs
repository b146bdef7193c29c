//! Advisory per-model download lock
//!
//! One file per model under `models_dir/.locks/`. The holder refreshes a
//! heartbeat while it works; a lock whose heartbeat is too old, or whose pid
//! is gone, is considered abandoned and may be taken over.

use crate::error::{ManagerError, ManagerResult};
use crate::models::model_dir_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Unreadable lock files younger than this are assumed to be mid-write
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        let now = Utc::now();
        Self {
            pid: std::process::id(),
            hostname: local_hostname(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// Whether the holder should be presumed dead
    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        let age = now
            .signed_duration_since(self.heartbeat_at)
            .to_std()
            .unwrap_or_default();
        if age > stale_after {
            return true;
        }
        // Liveness can only be checked for pids on this host
        let same_host = self.hostname.is_none() || self.hostname == local_hostname();
        same_host && !pid_alive(self.pid)
    }
}

/// Held download lock; the file is removed on drop
#[derive(Debug)]
pub struct DownloadLock {
    path: PathBuf,
    info: LockInfo,
}

impl DownloadLock {
    pub fn lock_path(locks_dir: &Path, name: &str) -> PathBuf {
        locks_dir.join(format!("{}.lock", model_dir_name(name)))
    }

    /// Take the lock for `name`, replacing an abandoned one
    ///
    /// Fails with [`ManagerError::DownloadInProgress`] when a live holder exists.
    pub fn acquire(locks_dir: &Path, name: &str, stale_after: Duration) -> ManagerResult<Self> {
        fs::create_dir_all(locks_dir)?;
        let path = Self::lock_path(locks_dir, name);

        // Second attempt only after removing a stale lock
        for _ in 0..2 {
            match Self::create(&path) {
                Ok(lock) => {
                    tracing::debug!(model = %name, path = %path.display(), "Download lock acquired");
                    return Ok(lock);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match read_lock(&path) {
                Some(existing) if !existing.is_stale(stale_after, Utc::now()) => {
                    return Err(ManagerError::DownloadInProgress {
                        name: name.to_string(),
                        pid: existing.pid,
                    });
                }
                Some(existing) => {
                    tracing::warn!(
                        model = %name,
                        pid = existing.pid,
                        heartbeat_at = %existing.heartbeat_at,
                        "Replacing stale download lock"
                    );
                }
                None if modified_within(&path, UNREADABLE_GRACE) => {
                    return Err(ManagerError::DownloadInProgress {
                        name: name.to_string(),
                        pid: 0,
                    });
                }
                None => {
                    tracing::warn!(model = %name, "Replacing unreadable download lock");
                }
            }

            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Lost the race to another process after removing the stale lock
        let pid = read_lock(&path).map(|info| info.pid).unwrap_or(0);
        Err(ManagerError::DownloadInProgress {
            name: name.to_string(),
            pid,
        })
    }

    fn create(path: &Path) -> io::Result<Self> {
        let info = LockInfo::current();
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(&serde_json::to_vec(&info)?)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            info,
        })
    }

    /// Live holder of the lock for `name`, if any
    pub fn holder(locks_dir: &Path, name: &str, stale_after: Duration) -> Option<LockInfo> {
        let path = Self::lock_path(locks_dir, name);
        match read_lock(&path) {
            Some(info) if !info.is_stale(stale_after, Utc::now()) => Some(info),
            Some(_) => None,
            // Freshly created, body not yet written
            None if modified_within(&path, UNREADABLE_GRACE) => Some(LockInfo {
                pid: 0,
                hostname: None,
                acquired_at: Utc::now(),
                heartbeat_at: Utc::now(),
            }),
            None => None,
        }
    }

    /// Refresh the heartbeat (write to tmp + rename)
    pub fn heartbeat(&mut self) -> io::Result<()> {
        if let Some(on_disk) = read_lock(&self.path)
            && on_disk.pid != self.info.pid
        {
            tracing::warn!(
                path = %self.path.display(),
                holder = on_disk.pid,
                "Download lock taken over by another process"
            );
            return Ok(());
        }

        self.info.heartbeat_at = Utc::now();
        let tmp_path = self.path.with_extension("lock.tmp");
        fs::write(&tmp_path, serde_json::to_vec(&self.info)?)?;
        fs::rename(&tmp_path, &self.path)
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DownloadLock {
    fn drop(&mut self) {
        // Never remove a lock another process has taken over
        let ours = read_lock(&self.path).is_none_or(|info| info.pid == self.info.pid);
        if ours && let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove download lock");
        }
    }
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    let content = fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

fn modified_within(path: &Path, window: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age < window)
}

#[cfg(unix)]
fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

#[cfg(not(unix))]
fn local_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|h| !h.is_empty())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(600);

    #[test]
    fn test_acquire_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let path = DownloadLock::lock_path(temp_dir.path(), "org/model");
        assert!(path.ends_with("org--model.lock"));

        {
            let lock = DownloadLock::acquire(temp_dir.path(), "org/model", STALE).unwrap();
            assert!(path.exists());
            assert_eq!(lock.info().pid, std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let temp_dir = TempDir::new().unwrap();
        let _lock = DownloadLock::acquire(temp_dir.path(), "m", STALE).unwrap();

        let err = DownloadLock::acquire(temp_dir.path(), "m", STALE).unwrap_err();
        match err {
            ManagerError::DownloadInProgress { name, pid } => {
                assert_eq!(name, "m");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stale_heartbeat_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let old = Utc::now() - chrono::Duration::hours(2);
        let info = LockInfo {
            pid: std::process::id(),
            hostname: None,
            acquired_at: old,
            heartbeat_at: old,
        };
        let path = DownloadLock::lock_path(temp_dir.path(), "m");
        fs::write(&path, serde_json::to_vec(&info).unwrap()).unwrap();

        assert!(DownloadLock::holder(temp_dir.path(), "m", STALE).is_none());
        let lock = DownloadLock::acquire(temp_dir.path(), "m", STALE).unwrap();
        assert!(lock.info().heartbeat_at > old);
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_pid_is_stale() {
        let info = LockInfo {
            pid: i32::MAX as u32,
            hostname: None,
            acquired_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        assert!(info.is_stale(STALE, Utc::now()));
    }

    #[test]
    fn test_live_holder_reported() {
        let temp_dir = TempDir::new().unwrap();
        assert!(DownloadLock::holder(temp_dir.path(), "m", STALE).is_none());

        let _lock = DownloadLock::acquire(temp_dir.path(), "m", STALE).unwrap();
        let holder = DownloadLock::holder(temp_dir.path(), "m", STALE).unwrap();
        assert_eq!(holder.pid, std::process::id());
    }

    #[test]
    fn test_heartbeat_advances() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = DownloadLock::acquire(temp_dir.path(), "m", STALE).unwrap();
        let before = lock.info().heartbeat_at;

        std::thread::sleep(Duration::from_millis(10));
        lock.heartbeat().unwrap();

        let on_disk = read_lock(lock.path()).unwrap();
        assert!(on_disk.heartbeat_at > before);
        assert_eq!(on_disk.acquired_at, lock.info().acquired_at);
    }

    #[test]
    fn test_old_unreadable_lock_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = DownloadLock::lock_path(temp_dir.path(), "m");
        fs::write(&path, "garbage").unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
            .unwrap();

        assert!(DownloadLock::acquire(temp_dir.path(), "m", STALE).is_ok());
    }
}
