//! Builders exclude each other with an advisory lock on a file next
//! to the cache.  Readers never lock: they only see complete files,
//! since the builder publishes with a rename.
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use fs2::FileExt;

use crate::error::Error;
use crate::error::Result;

/// First wait between attempts; it doubles up to `MAX_BACKOFF`.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Returns `base` scaled by a uniform factor in `[0.5, 1.5)`, so
/// waiting builders do not retry in lockstep.
fn jitter(base: Duration) -> Duration {
    use rand::Rng;

    base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// An exclusive lock on the builder lock file, released on drop.
#[derive(Debug)]
pub(crate) struct BuildLock {
    file: File,
    path: PathBuf,
    /// Whether another builder held the lock when we first tried.
    contended: bool,
}

impl BuildLock {
    /// Blocks until the lock at `path` is ours, or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<BuildLock> {
        let lock_error = |source| Error::Lock {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(lock_error)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(lock_error)?;

        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut contended = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(lock_error(e)),
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(Error::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }

            if !contended {
                tracing::debug!(target: "sycoca", path = %path.display(), "waiting for another builder");
                contended = true;
            }

            std::thread::sleep(jitter(backoff).min(timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        Ok(BuildLock {
            file,
            path: path.to_path_buf(),
            contended,
        })
    }

    /// Whether we had to wait: someone else may have rebuilt the
    /// cache in the meantime.
    pub fn was_contended(&self) -> bool {
        self.contended
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(target: "sycoca", path = %self.path.display(), error = %e, "failed to unlock");
        }
    }
}

#[test]
fn test_jitter_range() {
    for _ in 0..100 {
        let jittered = jitter(Duration::from_millis(100));
        assert!(jittered >= Duration::from_millis(50));
        assert!(jittered < Duration::from_millis(150));
    }
}

#[test]
fn test_exclusion_and_timeout() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("cache/sycoca.lock");

    let held = BuildLock::acquire(&path, Duration::from_secs(1)).expect("lock must succeed");
    assert!(!held.was_contended());

    // flock(2) locks belong to the open file description, so a second
    // open in the same process contends.
    match BuildLock::acquire(&path, Duration::from_millis(50)) {
        Err(Error::LockTimeout { waited, .. }) => assert!(waited >= Duration::from_millis(50)),
        other => panic!("expected a timeout, got {:?}", other),
    }

    drop(held);
    let again = BuildLock::acquire(&path, Duration::from_millis(50)).expect("lock must succeed");
    assert!(!again.was_contended());
}

#[test]
fn test_waits_for_release() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("sycoca.lock");

    let held = BuildLock::acquire(&path, Duration::from_secs(1)).expect("lock must succeed");
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        drop(held);
    });

    let lock = BuildLock::acquire(&path, Duration::from_secs(10)).expect("lock must succeed");
    assert!(lock.was_contended());
    releaser.join().expect("join must succeed");
}
