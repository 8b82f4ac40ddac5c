//! Resource directories: the subdirectories of each data directory
//! that hold the files the cache is built from.  The same relative
//! file may exist under several data directories; the most local copy
//! shadows the others.
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::benign_error::is_absent_file_error;

/// A kind of source file, and where to find it under a data
/// directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Resource {
    /// Subdirectory of each data directory; also the tag reported
    /// when files of this resource changed.
    pub dir: &'static str,
    pub extension: &'static str,
    pub recursive: bool,
}

pub const SERVICE_TYPES: Resource = Resource {
    dir: "servicetypes",
    extension: ".desktop",
    recursive: true,
};

pub const MIME_PACKAGES: Resource = Resource {
    dir: "mime/packages",
    extension: ".xml",
    recursive: false,
};

pub const APPLICATIONS: Resource = Resource {
    dir: "applications",
    extension: ".desktop",
    recursive: true,
};

pub const SERVICES: Resource = Resource {
    dir: "services",
    extension: ".desktop",
    recursive: true,
};

pub const DIRECTORIES: Resource = Resource {
    dir: "desktop-directories",
    extension: ".directory",
    recursive: false,
};

/// Every resource the cache depends on.
pub const ALL_RESOURCES: [Resource; 5] =
    [SERVICE_TYPES, MIME_PACKAGES, APPLICATIONS, SERVICES, DIRECTORIES];

/// One logical file of a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceFile {
    /// Path relative to the resource directory, with `/` separators.
    pub rel_path: String,
    /// The most local copy.
    pub path: PathBuf,
}

/// Lists the files with `extension` under `root`, relative to `root`.
/// Unreadable entries are logged and skipped.
pub(crate) fn list_files(root: &Path, extension: &str, recursive: bool) -> Vec<(String, PathBuf)> {
    let mut ret = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let absent = e.io_error().map(is_absent_file_error).unwrap_or(false);
                if !absent {
                    tracing::debug!(
                        target: "sycoca",
                        root = %root.display(),
                        error = %e,
                        "skipping unreadable resource entry"
                    );
                }
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let rel: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        let rel = rel.join("/");
        if rel.ends_with(extension) {
            ret.push((rel, entry.into_path()));
        }
    }

    ret
}

/// Returns the files of `resource` across `data_dirs` (most local
/// first), one per relative path, sorted by relative path.
pub fn enumerate(data_dirs: &[PathBuf], resource: &Resource) -> Vec<ResourceFile> {
    let mut found: BTreeMap<String, PathBuf> = BTreeMap::new();
    for data_dir in data_dirs {
        let root = data_dir.join(resource.dir);
        for (rel_path, path) in list_files(&root, resource.extension, resource.recursive) {
            found.entry(rel_path).or_insert(path);
        }
    }

    found
        .into_iter()
        .map(|(rel_path, path)| ResourceFile { rel_path, path })
        .collect()
}

/// Returns the most local copy of `rel_path` under `dirs`.
pub fn locate(dirs: &[PathBuf], rel_path: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(rel_path))
        .find(|path| path.is_file())
}

/// Returns the latest mtime (in milliseconds) of `root` and of
/// everything below it, or `None` if `root` does not exist.  Adding,
/// removing or editing a file anywhere in the tree bumps it.
pub fn tree_stamp(root: &Path) -> Option<i64> {
    let mut ret = crate::ctime::mtime_millis(root)?;
    for entry in WalkDir::new(root).follow_links(true).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        if let Some(mtime) = crate::ctime::mtime_millis(entry.path()) {
            ret = ret.max(mtime);
        }
    }

    Some(ret)
}

/// Returns the stamp of every existing resource directory, in a
/// stable order: data directories most local first, then resources.
pub fn resource_dir_stamps(data_dirs: &[PathBuf]) -> Vec<(PathBuf, i64)> {
    let mut ret = Vec::new();
    for data_dir in data_dirs {
        for resource in ALL_RESOURCES.iter() {
            let root = data_dir.join(resource.dir);
            if let Some(stamp) = tree_stamp(&root) {
                ret.push((root, stamp));
            }
        }
    }

    ret
}

#[test]
fn test_enumerate_shadows() {
    use crate::test_util::write_file;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    for (rel, contents) in [
        ("local/applications/a.desktop", "local a"),
        ("local/applications/kde/b.desktop", "b"),
        ("system/applications/a.desktop", "system a"),
        ("system/applications/c.desktop", "c"),
        ("system/applications/notes.txt", "not a desktop file"),
        ("system/mime/packages/x.xml", "x"),
        ("system/mime/packages/sub/y.xml", "y"),
    ] {
        write_file(temp.path(rel), contents);
    }

    let dirs = vec![temp.path("local"), temp.path("system"), temp.path("missing")];
    let files = enumerate(&dirs, &APPLICATIONS);
    assert_eq!(
        files,
        vec![
            ResourceFile {
                rel_path: "a.desktop".into(),
                path: temp.path("local/applications/a.desktop"),
            },
            ResourceFile {
                rel_path: "c.desktop".into(),
                path: temp.path("system/applications/c.desktop"),
            },
            ResourceFile {
                rel_path: "kde/b.desktop".into(),
                path: temp.path("local/applications/kde/b.desktop"),
            },
        ]
    );

    // Not recursive.
    let packages: Vec<_> = enumerate(&dirs, &MIME_PACKAGES)
        .into_iter()
        .map(|f| f.rel_path)
        .collect();
    assert_eq!(packages, vec!["x.xml"]);

    assert_eq!(
        locate(&dirs, "applications/c.desktop"),
        Some(temp.path("system/applications/c.desktop"))
    );
    assert_eq!(locate(&dirs, "applications/z.desktop"), None);
}

#[test]
fn test_resource_dir_stamps() {
    use filetime::FileTime;
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("share", FileType::Dir)
        .create("share/applications", FileType::Dir)
        .create("share/applications/sub", FileType::Dir)
        .create("share/services", FileType::Dir);

    filetime::set_file_mtime(temp.path("share/applications"), FileTime::from_unix_time(1000, 0))
        .expect("set mtime must succeed");
    filetime::set_file_mtime(
        temp.path("share/applications/sub"),
        FileTime::from_unix_time(2000, 0),
    )
    .expect("set mtime must succeed");

    assert_eq!(tree_stamp(&temp.path("share/applications")), Some(2_000_000));
    assert_eq!(tree_stamp(&temp.path("share/missing")), None);

    let stamps = resource_dir_stamps(&[temp.path("share")]);
    let dirs: Vec<_> = stamps.iter().map(|(dir, _)| dir.clone()).collect();
    assert_eq!(
        dirs,
        vec![temp.path("share/applications"), temp.path("share/services")]
    );
}
