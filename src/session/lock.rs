use std::collections::BTreeSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::TargetVolume;
use crate::engine::EngineError;

/// One active session per volume: an in-process registry, optionally backed by
/// a lock file so separate processes exclude each other too.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    held: Arc<Mutex<BTreeSet<String>>>,
    lock_dir: Option<PathBuf>,
}

impl LockManager {
    pub fn new(lock_dir: Option<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            lock_dir,
        }
    }

    pub fn is_held(&self, volume: &TargetVolume) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&volume.lock_key())
    }

    pub fn try_acquire(&self, volume: &TargetVolume) -> Result<VolumeLock, EngineError> {
        let key = volume.lock_key();
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            if !held.insert(key.clone()) {
                return Err(EngineError::SessionInProgress { volume: key });
            }
        }
        // From here on the guard owns the registry entry and removes it on any early return.
        let mut lock = VolumeLock {
            key,
            held: Arc::clone(&self.held),
            file: None,
        };
        if let Some(dir) = &self.lock_dir {
            lock.file = Some(LockFile::acquire(dir, &lock.key)?);
        }
        Ok(lock)
    }
}

pub struct VolumeLock {
    key: String,
    held: Arc<Mutex<BTreeSet<String>>>,
    file: Option<LockFile>,
}

impl VolumeLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for VolumeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeLock")
            .field("key", &self.key)
            .field("file", &self.file.as_ref().map(|l| l.path.display().to_string()))
            .finish()
    }
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        self.file.take();
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

struct LockFile {
    _file: File,
    path: PathBuf,
}

impl LockFile {
    fn acquire(dir: &Path, key: &str) -> Result<Self, EngineError> {
        let lock_err = |path: &Path, err: io::Error| EngineError::LockFile {
            path: path.to_path_buf(),
            detail: err.to_string(),
        };
        std::fs::create_dir_all(dir).map_err(|err| lock_err(dir, err))?;
        let name: String = key.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let path = dir.join(format!("bootmend-{name}.lock"));

        let Some(mut file) = open_exclusive(&path).map_err(|err| lock_err(&path, err))? else {
            return Err(EngineError::SessionInProgress {
                volume: key.to_string(),
            });
        };
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { _file: file, path })
    }
}

#[cfg(unix)]
fn open_exclusive(path: &Path) -> io::Result<Option<File>> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(Some(file));
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(None);
    }
    Err(err)
}

#[cfg(not(unix))]
fn open_exclusive(path: &Path) -> io::Result<Option<File>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(not(unix))]
impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("bootmend-lock-test-{}-{n}", std::process::id()))
    }

    #[test]
    fn second_acquire_fails_until_first_drops() {
        let locks = LockManager::default();
        let c = TargetVolume::new("c:").unwrap();
        let first = locks.try_acquire(&c).unwrap();
        assert!(matches!(
            locks.try_acquire(&c),
            Err(EngineError::SessionInProgress { .. })
        ));
        assert!(locks.is_held(&c));
        drop(first);
        assert!(!locks.is_held(&c));
        assert!(locks.try_acquire(&c).is_ok());
    }

    #[test]
    fn different_volumes_do_not_contend() {
        let locks = LockManager::default();
        let _c = locks.try_acquire(&TargetVolume::new("C:").unwrap()).unwrap();
        assert!(locks.try_acquire(&TargetVolume::new("D:").unwrap()).is_ok());
    }

    #[test]
    fn lock_files_exclude_separate_managers() {
        let dir = temp_dir();
        let a = LockManager::new(Some(dir.clone()));
        let b = LockManager::new(Some(dir.clone()));
        let c = TargetVolume::new("C:").unwrap();
        let held = a.try_acquire(&c).unwrap();
        assert!(matches!(
            b.try_acquire(&c),
            Err(EngineError::SessionInProgress { .. })
        ));
        assert!(!b.is_held(&c), "failed acquire must not leak a registry entry");
        drop(held);
        assert!(b.try_acquire(&c).is_ok());
        let _ = std::fs::remove_dir_all(dir);
    }
}
