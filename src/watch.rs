//! Background change notification for open caches.  Builders publish
//! a new cache by renaming it over the old one, so the watch is on
//! the cache directory, filtered down to the cache file and its
//! stamp.  Each relevant event bumps a counter; a reader compares it
//! with the count it last saw to know whether it is behind.
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use derivative::Derivative;
use notify::event::Flag;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;

use crate::error::Error;
use crate::error::Result;

/// Watches one cache file and its stamp.  The OS watch stops when
/// this is dropped.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CacheWatch {
    dir: PathBuf,
    changes: Arc<AtomicU64>,
    #[derivative(Debug = "ignore")]
    _watcher: RecommendedWatcher,
}

/// The file names in the cache directory whose changes matter.
fn watched_names(cache_path: &Path) -> Vec<OsString> {
    let mut ret = Vec::new();
    if let Some(name) = cache_path.file_name() {
        let mut stamp = name.to_os_string();
        stamp.push("stamp");
        ret.push(name.to_os_string());
        ret.push(stamp);
    }

    ret
}

/// Whether `event` may mean one of `names` changed.  Dropped events
/// are assumed to.
fn is_relevant(event: &notify::Event, names: &[OsString]) -> bool {
    if matches!(event.attrs.flag(), Some(Flag::Rescan)) {
        return true;
    }

    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }

    event.paths.iter().any(|path| match path.file_name() {
        Some(name) => names.iter().any(|watched| watched == name),
        None => false,
    })
}

impl CacheWatch {
    /// Starts watching the cache file at `cache_path` and its stamp.
    /// The cache directory must exist.
    pub fn start(cache_path: &Path) -> Result<CacheWatch> {
        let dir = match cache_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let names = watched_names(cache_path);
        let changes = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&changes);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let relevant = match &res {
                Ok(event) => is_relevant(event, &names),
                // Errors may hide changes.
                Err(e) => {
                    tracing::debug!(target: "sycoca", error = %e, "cache watch error");
                    true
                }
            };

            if relevant {
                counter.fetch_add(1, Ordering::AcqRel);
            }
        })
        .map_err(|source| Error::Watch {
            path: dir.clone(),
            source,
        })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| Error::Watch {
                path: dir.clone(),
                source,
            })?;

        tracing::debug!(target: "sycoca", dir = %dir.display(), "watching cache directory");
        Ok(CacheWatch {
            dir,
            changes,
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the number of relevant events seen so far.
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use crate::watch::*;
    use notify::event::CreateKind;
    use notify::event::AccessKind;
    use notify::event::ModifyKind;
    use notify::event::RenameMode;
    use test_dir::{DirBuilder, FileType, TestDir};

    fn event(kind: EventKind, path: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_relevant_events() {
        let names = watched_names(Path::new("/cache/sycoca_en_0123"));
        assert_eq!(names, vec![OsString::from("sycoca_en_0123"), OsString::from("sycoca_en_0123stamp")]);

        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            "/cache/sycoca_en_0123",
        );
        assert!(is_relevant(&renamed, &names));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::File), "/cache/sycoca_en_0123stamp"),
            &names
        ));

        // Other caches, lock files and reads do not count.
        assert!(!is_relevant(
            &event(EventKind::Create(CreateKind::File), "/cache/sycoca_fr_0123"),
            &names
        ));
        assert!(!is_relevant(
            &event(EventKind::Create(CreateKind::File), "/cache/sycoca_en_0123.lock"),
            &names
        ));
        assert!(!is_relevant(
            &event(EventKind::Access(AccessKind::Any), "/cache/sycoca_en_0123"),
            &names
        ));

        let rescan = notify::Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert!(is_relevant(&rescan, &names));
    }

    #[test]
    fn test_counts_changes() {
        let temp = TestDir::temp().create("cache", FileType::Dir);
        let cache_path = temp.path("cache/sycoca_en_0123");
        let watch = CacheWatch::start(&cache_path).expect("watch must start");
        assert_eq!(watch.dir(), temp.path("cache").as_path());
        assert_eq!(watch.changes(), 0);

        std::fs::write(temp.path("cache/unrelated"), b"x").expect("write must succeed");
        std::fs::write(&cache_path, b"new cache").expect("write must succeed");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while watch.changes() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(watch.changes() > 0);
    }

    #[test]
    fn test_missing_directory() {
        let temp = TestDir::temp();
        assert!(matches!(
            CacheWatch::start(&temp.path("missing/sycoca_en_0123")),
            Err(Error::Watch { .. })
        ));
    }
}
