//! Fixture helpers shared by the unit tests.
use std::path::Path;

/// Writes `contents` to `path`, creating missing parent directories.
pub fn write_file(path: impl AsRef<Path>, contents: &str) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create_dir_all must succeed");
    }

    std::fs::write(path, contents).expect("write must succeed");
}

/// Sets the mtime of `path` to `secs` seconds after the epoch.
pub fn set_mtime(path: impl AsRef<Path>, secs: i64) {
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(secs, 0))
        .expect("set mtime must succeed");
}
