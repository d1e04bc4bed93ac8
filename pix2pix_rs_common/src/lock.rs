use std::{
    cell::RefCell,
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use fs2::FileExt;
use parking_lot::{lock_api::ArcReentrantMutexGuard, Mutex, RawMutex, RawThreadId, ReentrantMutex};
use tracing::trace;

struct Held {
    file: File,
    depth: usize,
}

type Slot = Arc<ReentrantMutex<RefCell<Option<Held>>>>;

fn registry() -> &'static Mutex<HashMap<PathBuf, Slot>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Slot>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// A re-entrant lock over one cache entry.
///
/// Threads of this process are serialized per lock path by a process-wide re-entrant mutex, and
/// other processes by an exclusive advisory lock on the lock file itself. The file lock is taken
/// by the outermost acquisition of a thread and released when that acquisition is dropped, so
/// nested acquisitions on the same thread never block.
pub struct CacheLock {
    path: PathBuf,
    slot: Slot,
    guard: ArcReentrantMutexGuard<RawMutex, RawThreadId, RefCell<Option<Held>>>,
}

impl CacheLock {
    /// Block until the lock at `path` is held by the current thread.
    pub fn acquire<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let slot = registry().lock().entry(path.clone()).or_default().clone();
        let guard = slot.lock_arc();

        {
            let mut held = guard.borrow_mut();
            match held.as_mut() {
                Some(held) => held.depth += 1,
                None => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let file = OpenOptions::new()
                        .create(true)
                        .truncate(false)
                        .write(true)
                        .open(&path)?;
                    FileExt::lock_exclusive(&file)?;
                    trace!("locked {}", path.display());
                    *held = Some(Held { file, depth: 1 });
                }
            }
        }

        Ok(Self { path, slot, guard })
    }

    /// How many nested acquisitions the current thread holds on this lock.
    pub fn depth(&self) -> usize {
        self.guard.borrow().as_ref().map_or(0, |held| held.depth)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let mut held = self.guard.borrow_mut();
        let release = match held.as_mut() {
            Some(inner) => {
                inner.depth -= 1;
                inner.depth == 0
            }
            None => false,
        };
        if release {
            if let Some(inner) = held.take() {
                if let Err(e) = FileExt::unlock(&inner.file) {
                    tracing::warn!("failed to unlock {}: {e}", self.path.display());
                }
                trace!("unlocked {}", self.path.display());
            }

            // Only the registry, `self.slot` and `self.guard` refer to an unwaited slot. Slots are
            // cloned under the registry lock, so nobody can pick this one up while we check.
            let mut registry = registry().lock();
            if Arc::strong_count(&self.slot) == 3 {
                registry.remove(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use super::{registry, CacheLock};

    #[test]
    fn nested_acquisitions_do_not_deadlock() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.ckpt.lock");

        let outer = CacheLock::acquire(&path)?;
        assert_eq!(outer.depth(), 1);
        {
            let inner = CacheLock::acquire(&path)?;
            assert_eq!(inner.depth(), 2);
        }
        assert_eq!(outer.depth(), 1);
        drop(outer);

        let again = CacheLock::acquire(&path)?;
        assert_eq!(again.depth(), 1);
        Ok(())
    }

    #[test]
    fn other_threads_wait_for_release() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.ckpt.lock");
        let acquired = Arc::new(AtomicBool::new(false));

        let held = CacheLock::acquire(&path)?;
        let handle = {
            let path = path.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let _lock = CacheLock::acquire(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(held);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn released_locks_leave_no_slot_behind() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.ckpt.lock");
        let registered = || registry().lock().contains_key(&path);

        let outer = CacheLock::acquire(&path)?;
        drop(CacheLock::acquire(&path)?);
        assert!(registered());

        drop(outer);
        assert!(!registered());

        let again = CacheLock::acquire(&path)?;
        assert_eq!(again.depth(), 1);
        assert!(registered());
        Ok(())
    }

    #[test]
    fn waiting_threads_keep_their_slot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.ckpt.lock");
        let holders = Arc::new(AtomicUsize::new(0));

        let held = CacheLock::acquire(&path)?;
        let handles = (0..4)
            .map(|_| {
                let path = path.clone();
                let holders = holders.clone();
                thread::spawn(move || -> std::io::Result<()> {
                    let _lock = CacheLock::acquire(&path)?;
                    assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(10));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect::<Vec<_>>();

        thread::sleep(Duration::from_millis(50));
        drop(held);
        for handle in handles {
            handle.join().unwrap()?;
        }
        assert!(!registry().lock().contains_key(&path));
        Ok(())
    }

    #[test]
    fn distinct_files_are_independent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let _a = CacheLock::acquire(dir.path().join("a.ckpt.lock"))?;
        let handle = {
            let path = dir.path().join("b.ckpt.lock");
            thread::spawn(move || CacheLock::acquire(path).map(|lock| lock.depth()))
        };
        assert_eq!(handle.join().unwrap()?, 1);
        Ok(())
    }
}
