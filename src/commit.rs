//! Publishing new files next to the cache.  Files are written to a
//! private temporary file in a scratch subdirectory, then renamed
//! over their destination, so readers either see the old file or the
//! complete new one.
use std::io::Result;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::benign_error::is_absent_file_error;

/// Name of the scratch subdirectory of the cache directory.
const TEMP_SUBDIR: &str = ".sycoca-tmp";

/// Delete temporary files with mtime older than this age.
#[cfg(not(test))]
const MAX_TEMP_FILE_AGE: Duration = Duration::from_secs(3600);

// We want a more eager timeout in tests.
#[cfg(test)]
const MAX_TEMP_FILE_AGE: Duration = Duration::from_secs(2);

/// Returns the scratch directory for `cache_dir`.  It must live on the
/// same filesystem as the cache, for the final rename.
pub(crate) fn temp_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join(TEMP_SUBDIR)
}

/// Creates a temporary file in the scratch directory of `cache_dir`.
pub(crate) fn new_temp_file(cache_dir: &Path) -> Result<NamedTempFile> {
    let dir = temp_dir(cache_dir);
    std::fs::create_dir_all(&dir)?;
    NamedTempFile::new_in(dir)
}

/// Syncs `file` and renames it to `to`.  On failure, `to` is left as
/// it was and the temporary file is deleted.
pub(crate) fn publish(mut file: NamedTempFile, to: &Path) -> Result<()> {
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(to).map_err(|e| e.error)?;
    Ok(())
}

/// Deletes any file with mtime older than `MAX_TEMP_FILE_AGE` in the
/// scratch directory of `cache_dir`: builders that crashed mid-write
/// leave their temporary files behind.  Returns the number of files
/// deleted.
pub(crate) fn cleanup_temp_dir(cache_dir: &Path) -> Result<usize> {
    let threshold = match std::time::SystemTime::now().checked_sub(MAX_TEMP_FILE_AGE) {
        Some(time) => time,
        None => return Ok(0),
    };

    let mut temp = temp_dir(cache_dir);
    let entries = match std::fs::read_dir(&temp) {
        Ok(entries) => entries,
        Err(e) if is_absent_file_error(&e) => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut deleted = 0;
    for dirent in entries.flatten() {
        let mut handle = || -> Result<bool> {
            let metadata = dirent.metadata()?;
            let mtime = metadata.modified()?;

            if mtime < threshold {
                temp.push(dirent.file_name());
                let ret = std::fs::remove_file(&temp);
                temp.pop();

                ret?;
                return Ok(true);
            }

            Ok(false)
        };

        if let Ok(true) = handle() {
            deleted += 1;
        }
    }

    if deleted > 0 {
        tracing::debug!(target: "sycoca", deleted, "removed stale temporary files");
    }

    Ok(deleted)
}

#[test]
fn test_publish_replaces_atomically() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache_dir = temp.path("cache");
    let dest = cache_dir.join("sycoca");

    let mut first = new_temp_file(&cache_dir).expect("temp file must succeed");
    first.write_all(b"first").expect("write must succeed");
    publish(first, &dest).expect("publish must succeed");
    assert_eq!(std::fs::read(&dest).expect("read must succeed"), b"first");

    // A file that is never published leaves the destination alone.
    let mut abandoned = new_temp_file(&cache_dir).expect("temp file must succeed");
    abandoned.write_all(b"partial").expect("write must succeed");
    drop(abandoned);
    assert_eq!(std::fs::read(&dest).expect("read must succeed"), b"first");

    let mut second = new_temp_file(&cache_dir).expect("temp file must succeed");
    second.write_all(b"second").expect("write must succeed");
    publish(second, &dest).expect("publish must succeed");
    assert_eq!(std::fs::read(&dest).expect("read must succeed"), b"second");

    // Nothing is left in the scratch directory.
    assert_eq!(
        std::fs::read_dir(temp_dir(&cache_dir))
            .expect("read_dir must succeed")
            .count(),
        0
    );
}

#[test]
fn test_cleanup_temp_dir() {
    use filetime::FileTime;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache_dir = temp.path("cache");
    assert_eq!(cleanup_temp_dir(&cache_dir).expect("cleanup must succeed"), 0);

    let old = new_temp_file(&cache_dir).expect("temp file must succeed");
    let (_, old_path) = old.keep().expect("keep must succeed");
    let fresh = new_temp_file(&cache_dir).expect("temp file must succeed");
    filetime::set_file_mtime(&old_path, FileTime::from_unix_time(1000, 0))
        .expect("set mtime must succeed");

    assert_eq!(cleanup_temp_dir(&cache_dir).expect("cleanup must succeed"), 1);
    assert!(!old_path.exists());
    assert!(fresh.path().exists());
}
