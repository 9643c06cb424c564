use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::error::{Error, Result};

/// Monitor a task which may take a long time, and log messages as needed.
/// After SILENT_INTERVAL: log activity
/// After LOG_INTERVAL: log activity and duration
pub struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(move || {
            WaitMonitor::run(done, activity);
        });
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            if done.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(next_log.saturating_duration_since(Instant::now()));
            if done.load(Ordering::Relaxed) {
                break;
            }
            let waited = next_log.duration_since(start);
            if waited <= Self::SILENT_INTERVAL {
                tracing::info!("{}", activity);
                // Reset before adding the large scale increment
                next_log = start;
            } else {
                tracing::info!("{} ({} s)", activity, waited.as_secs());
            }
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub fn done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}

/// Advisory lock guarding writes to a state file.
///
/// The state file itself is replaced by rename on every write, so the lock is
/// taken on a sibling `<state file>.lock` whose inode stays put. The lock file
/// is created on first use, so stores that are only read leave no trace.
pub struct StateLock {
    path: PathBuf,
    locking: Option<fd_lock::RwLock<File>>,
}
impl StateLock {
    pub fn new(state_path: &Path) -> StateLock {
        let mut path = state_path.as_os_str().to_owned();
        path.push(".lock");
        StateLock {
            path: PathBuf::from(path),
            locking: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` while holding the exclusive lock, waiting for other processes
    /// to release it if needed. The wait monitor only starts when the lock is
    /// contended.
    pub fn with_write_lock<T>(&mut self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_err = |source| Error::Lock {
            path: self.path.clone(),
            source,
        };
        let locking = match self.locking.take() {
            Some(locking) => locking,
            None => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.path)
                    .map_err(lock_err)?;
                fd_lock::RwLock::new(file)
            }
        };
        let locking = self.locking.insert(locking);
        match locking.try_write() {
            Ok(guard) => {
                let r = f();
                drop(guard);
                return r;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(lock_err(e)),
        }
        let lock_wait_mon = WaitMonitor::new("Waiting for state file write lock".to_owned());
        let guard = locking.write();
        lock_wait_mon.done();
        let guard = guard.map_err(lock_err)?;
        let r = f();
        drop(guard);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path() {
        let lock = StateLock::new(Path::new("/tmp/deploy/terranova.state.json"));
        assert_eq!(
            lock.path(),
            Path::new("/tmp/deploy/terranova.state.json.lock")
        );
    }

    #[test]
    fn test_lock_file_created_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = StateLock::new(&dir.path().join("state.json"));
        assert!(!lock.path().exists());
        let r = lock.with_write_lock(|| Ok(42)).unwrap();
        assert_eq!(r, 42);
        assert!(lock.path().exists());
        // reentry after release
        lock.with_write_lock(|| Ok(())).unwrap();
    }

    #[test]
    fn test_lock_propagates_inner_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = StateLock::new(&dir.path().join("state.json"));
        let r: Result<()> = lock.with_write_lock(|| {
            Err(Error::LineageMismatch {
                expected: "a".to_owned(),
                found: "b".to_owned(),
            })
        });
        assert!(matches!(r, Err(Error::LineageMismatch { .. })));
    }

    #[test]
    fn test_lock_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = StateLock::new(&dir.path().join("missing").join("state.json"));
        let r = lock.with_write_lock(|| Ok(()));
        assert!(matches!(r, Err(Error::Lock { .. })));
    }

    #[test]
    fn test_contended_lock_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut first = StateLock::new(&path);
        let mut second = StateLock::new(&path);
        let (started, wait_started) = std::sync::mpsc::channel();

        let (waiter, released) = first
            .with_write_lock(|| {
                let waiter = std::thread::spawn(move || {
                    started.send(()).unwrap();
                    second.with_write_lock(|| Ok(Instant::now())).unwrap()
                });
                wait_started.recv().unwrap();
                std::thread::sleep(Duration::from_millis(200));
                Ok((waiter, Instant::now()))
            })
            .unwrap();
        let acquired = waiter.join().unwrap();
        assert!(acquired >= released);
    }

    #[test]
    #[ignore] // Slow test, no assertions
    fn test_wait_monitor() {
        let monitor = WaitMonitor::new("Testing...".to_owned());
        std::thread::sleep(Duration::from_secs(12));
        monitor.done();
    }
}
