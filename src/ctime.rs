//! Per-file timestamps for incremental builds.  A file's "ctime" is
//! the wrapping sum of the mtimes (in seconds) of every copy of the
//! file across the data directories.  It is a weak fingerprint:
//! different sets of files can collide, but adding, removing or
//! touching any copy almost always changes it, and that is all a
//! rebuild decision needs.
use std::collections::BTreeMap;
use std::io::Seek;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::benign_error::is_absent_file_error;
use crate::error::DecodeError;
use crate::resources::Resource;
use crate::stream::DataReader;
use crate::stream::DataWriter;

/// Marker file whose ctime is the cache's update signature: touching
/// it anywhere forces a full rebuild.
pub const UPDATE_SIGNATURE_FILE: &str = "services/update_sycoca";

/// Returns the mtime of `path` in whole seconds, or `None` if the file
/// is absent or not a regular file.  Unexpected errors are logged and
/// also reported as `None`: a single unreadable file must not abort a
/// build.
pub(crate) fn file_mtime_secs(path: &Path) -> Option<i64> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            Some(filetime::FileTime::from_last_modification_time(&meta).unix_seconds())
        }
        Ok(_) => None,
        Err(e) if is_absent_file_error(&e) => None,
        Err(e) => {
            tracing::debug!(
                target: "sycoca",
                path = %path.display(),
                error = %e,
                "failed to stat resource file"
            );
            None
        }
    }
}

/// Returns the mtime of `path` (file or directory) in milliseconds,
/// or `None` if it does not exist.
pub(crate) fn mtime_millis(path: &Path) -> Option<i64> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let time = filetime::FileTime::from_last_modification_time(&meta);
            Some(time.unix_seconds() * 1000 + i64::from(time.nanoseconds() / 1_000_000))
        }
        Err(e) if is_absent_file_error(&e) => None,
        Err(e) => {
            tracing::debug!(
                target: "sycoca",
                path = %path.display(),
                error = %e,
                "failed to stat path"
            );
            None
        }
    }
}

/// Sums the mtimes of the copies of `rel_path` (relative to the data
/// directories).  Absent copies count as 0.
pub fn ctime_of(data_dirs: &[PathBuf], rel_path: &str) -> u32 {
    data_dirs
        .iter()
        .filter_map(|dir| file_mtime_secs(&dir.join(rel_path)))
        .fold(0u32, |acc, mtime| acc.wrapping_add(mtime as u32))
}

/// Returns the update signature for `data_dirs`.
pub fn update_signature(data_dirs: &[PathBuf]) -> u32 {
    ctime_of(data_dirs, UPDATE_SIGNATURE_FILE)
}

fn key(resource: &Resource, rel_path: &str) -> String {
    format!("{}|{}", resource.dir, rel_path)
}

/// The ctimes of every file a cache was built from, keyed by resource
/// and relative path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CTimeDict {
    ctimes: BTreeMap<String, u32>,
}

impl CTimeDict {
    pub fn new() -> CTimeDict {
        Default::default()
    }

    pub fn insert(&mut self, resource: &Resource, rel_path: &str, ctime: u32) {
        self.ctimes.insert(key(resource, rel_path), ctime);
    }

    pub fn get(&self, resource: &Resource, rel_path: &str) -> Option<u32> {
        self.ctimes.get(&key(resource, rel_path)).copied()
    }

    /// Removes and returns the ctime for the file.  Whatever is left
    /// after a build claimed all current files was deleted.
    pub fn take(&mut self, resource: &Resource, rel_path: &str) -> Option<u32> {
        self.ctimes.remove(&key(resource, rel_path))
    }

    pub fn len(&self) -> usize {
        self.ctimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctimes.is_empty()
    }

    /// Returns the resource directory names that still have entries.
    pub fn resources(&self) -> Vec<String> {
        let mut ret: Vec<String> = self
            .ctimes
            .keys()
            .filter_map(|key| key.split_once('|').map(|(res, _)| res.to_string()))
            .collect();
        ret.dedup();
        ret
    }

    pub fn save<W: Write + Seek>(&self, writer: &mut DataWriter<W>) -> std::io::Result<()> {
        writer.write_u32(self.ctimes.len() as u32)?;
        for (key, ctime) in &self.ctimes {
            writer.write_string(key)?;
            writer.write_u32(*ctime)?;
        }

        Ok(())
    }

    pub fn load(data: &[u8], offset: i32) -> Result<CTimeDict, DecodeError> {
        let mut reader = DataReader::at(data, offset.into())?;
        // A string length and a u32.
        let count = reader.read_count(8)?;
        let mut ctimes = BTreeMap::new();
        for _ in 0..count {
            let key = reader.read_string()?;
            let ctime = reader.read_u32()?;
            ctimes.insert(key, ctime);
        }

        Ok(CTimeDict { ctimes })
    }
}

#[test]
fn test_ctime_sums_copies() {
    use crate::test_util::{set_mtime, write_file};
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    write_file(temp.path("local/applications/a.desktop"), "a");
    write_file(temp.path("system/applications/a.desktop"), "a");
    set_mtime(temp.path("local/applications/a.desktop"), 1000);
    set_mtime(temp.path("system/applications/a.desktop"), 24);

    let dirs = vec![temp.path("local"), temp.path("system")];
    assert_eq!(ctime_of(&dirs, "applications/a.desktop"), 1024);
    assert_eq!(ctime_of(&dirs, "applications/missing.desktop"), 0);
    assert_eq!(update_signature(&dirs), 0);

    write_file(temp.path("system/services/update_sycoca"), "");
    set_mtime(temp.path("system/services/update_sycoca"), 77);
    assert_eq!(update_signature(&dirs), 77);

    // Removing a shadowed copy changes the ctime too.
    std::fs::remove_file(temp.path("system/applications/a.desktop"))
        .expect("remove must succeed");
    assert_eq!(ctime_of(&dirs, "applications/a.desktop"), 1000);
}

#[test]
fn test_save_load() {
    use crate::resources::{APPLICATIONS, SERVICE_TYPES};

    let mut dict = CTimeDict::new();
    dict.insert(&APPLICATIONS, "a.desktop", 10);
    dict.insert(&APPLICATIONS, "kde/b.desktop", u32::MAX);
    dict.insert(&SERVICE_TYPES, "app.desktop", 3);

    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    dict.save(&mut writer).expect("save must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let mut loaded = CTimeDict::load(&bytes, 4).expect("load must succeed");
    assert_eq!(loaded, dict);
    assert_eq!(loaded.get(&APPLICATIONS, "kde/b.desktop"), Some(u32::MAX));
    assert_eq!(loaded.take(&APPLICATIONS, "a.desktop"), Some(10));
    assert_eq!(loaded.take(&APPLICATIONS, "a.desktop"), None);
    assert_eq!(
        loaded.resources(),
        vec!["applications".to_string(), "servicetypes".to_string()]
    );
}

#[test]
fn test_mtimes() {
    use filetime::FileTime;
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("file", FileType::ZeroFile(4))
        .create("dir", FileType::Dir);

    filetime::set_file_mtime(temp.path("file"), FileTime::from_unix_time(1_000_000, 0))
        .expect("set mtime must succeed");
    assert_eq!(file_mtime_secs(&temp.path("file")), Some(1_000_000));
    assert_eq!(mtime_millis(&temp.path("file")), Some(1_000_000_000));

    // Directories have an mtime, but are not resource files.
    assert_eq!(file_mtime_secs(&temp.path("dir")), None);
    assert!(mtime_millis(&temp.path("dir")).is_some());

    assert_eq!(file_mtime_secs(&temp.path("missing")), None);
    assert_eq!(mtime_millis(&temp.path("missing")), None);
}
