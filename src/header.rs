//! The global header at the start of every sycoca file, and the
//! stamp file written next to it.
//!
//! ```text
//! i32 VERSION
//! (i32 factory id, i32 segment offset)*, i32 0
//! string search path
//! u32 build timestamp (seconds)
//! string language
//! u32 update signature
//! u32 count, (string dir, i64 mtime ms)*     resource directories
//! u32 count, (string path, i64 mtime ms)*    association and menu files
//! ```
//!
//! The header is written twice: once with placeholder segment
//! offsets, and again once the segments are written.  Its size does
//! not depend on the offsets, so the second pass overwrites it in
//! place.
use std::io::Seek;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::benign_error::is_absent_file_error;
use crate::ctime::mtime_millis;
use crate::config::Environment;
use crate::ctime::update_signature;
use crate::error::DecodeError;
use crate::error::Error;
use crate::factory::FactoryId;
use crate::resources::resource_dir_stamps;
use crate::resources::tree_stamp;
use crate::stream::DataReader;
use crate::stream::DataWriter;

type Decoded<T> = std::result::Result<T, DecodeError>;

/// Format version.  Readers reject files with any other version.
pub const VERSION: i32 = 1;

/// Seconds since the epoch, never 0: a zero timestamp marks an
/// unfinished header.
fn now_secs() -> u32 {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (secs as u32).max(1)
}

fn write_stamps<W: Write + Seek>(
    writer: &mut DataWriter<W>,
    stamps: &[(PathBuf, i64)],
) -> std::io::Result<()> {
    writer.write_u32(stamps.len() as u32)?;
    for (path, mtime) in stamps {
        writer.write_string(&path.to_string_lossy())?;
        writer.write_i64(*mtime)?;
    }

    Ok(())
}

fn read_stamps(reader: &mut DataReader<'_>) -> Decoded<Vec<(PathBuf, i64)>> {
    // A string length and an i64.
    let count = reader.read_count(12)?;
    let mut ret = Vec::with_capacity(count);
    for _ in 0..count {
        let path = PathBuf::from(reader.read_string()?);
        ret.push((path, reader.read_i64()?));
    }

    Ok(ret)
}

/// Returns the current mtime of each file in `paths`; 0 for absent
/// files, so creating one is a change.
pub(crate) fn file_stamps<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Vec<(PathBuf, i64)> {
    paths
        .into_iter()
        .map(|path| (path.to_path_buf(), mtime_millis(path).unwrap_or(0)))
        .collect()
}

/// Returns the first reason `stored` differs from `current`, for
/// logging.
fn first_difference<'a>(
    stored: &'a [(PathBuf, i64)],
    current: &'a [(PathBuf, i64)],
) -> Option<&'a Path> {
    if stored.len() != current.len() {
        let longer = if stored.len() > current.len() { stored } else { current };
        let shorter = if stored.len() > current.len() { current } else { stored };
        return longer
            .iter()
            .find(|entry| !shorter.contains(entry))
            .map(|(path, _)| path.as_path());
    }

    stored
        .iter()
        .zip(current)
        .find(|(x, y)| x != y)
        .map(|(x, _)| x.0.as_path())
}

/// Reads the version of the file in `data`.
pub fn read_version(data: &[u8]) -> Decoded<i32> {
    DataReader::new(data).read_i32()
}

/// The global header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheHeader {
    /// Segment offsets, in write order.
    pub factories: Vec<(FactoryId, i32)>,
    pub search_path: String,
    pub timestamp: u32,
    pub language: String,
    pub update_signature: u32,
    pub resource_dirs: Vec<(PathBuf, i64)>,
    pub extra_files: Vec<(PathBuf, i64)>,
}

impl CacheHeader {
    /// Describes a cache built now, for `env`.  Segment offsets and
    /// extra files are filled in by the builder.
    pub fn for_environment(env: &Environment) -> CacheHeader {
        CacheHeader {
            factories: Vec::new(),
            search_path: env.search_path(),
            timestamp: now_secs(),
            language: env.language().to_string(),
            update_signature: update_signature(env.data_dirs()),
            resource_dirs: resource_dir_stamps(env.data_dirs()),
            extra_files: Vec::new(),
        }
    }

    pub fn factory_offset(&self, id: FactoryId) -> Option<i32> {
        self.factories
            .iter()
            .find(|(factory, _)| *factory == id)
            .map(|(_, offset)| *offset)
    }

    pub(crate) fn write<W: Write + Seek>(&self, writer: &mut DataWriter<W>) -> std::io::Result<()> {
        writer.write_i32(VERSION)?;
        for (id, offset) in &self.factories {
            writer.write_i32(id.code())?;
            writer.write_i32(*offset)?;
        }
        writer.write_i32(0)?;

        writer.write_string(&self.search_path)?;
        writer.write_u32(self.timestamp)?;
        writer.write_string(&self.language)?;
        writer.write_u32(self.update_signature)?;
        write_stamps(writer, &self.resource_dirs)?;
        write_stamps(writer, &self.extra_files)
    }

    /// Decodes the header at the start of `data`.  The version is not
    /// checked; see [`read_version`].
    pub fn read(data: &[u8]) -> Decoded<CacheHeader> {
        let mut reader = DataReader::new(data);
        reader.read_i32()?;

        let mut factories = Vec::new();
        loop {
            let at = reader.position();
            let code = reader.read_i32()?;
            if code == 0 {
                break;
            }

            let offset = reader.read_i32()?;
            match FactoryId::from_code(code) {
                Some(id) => factories.push((id, offset)),
                None => {
                    return Err(DecodeError::BadTag {
                        at,
                        tag: code.into(),
                    })
                }
            }
        }

        Ok(CacheHeader {
            factories,
            search_path: reader.read_string()?,
            timestamp: reader.read_u32()?,
            language: reader.read_string()?,
            update_signature: reader.read_u32()?,
            resource_dirs: read_stamps(&mut reader)?,
            extra_files: read_stamps(&mut reader)?,
        })
    }

    /// Checks that a cache with this header may serve `env` and be
    /// reused by an incremental build for it.
    pub fn check(&self, env: &Environment) -> Result<(), Error> {
        if self.timestamp == 0 {
            return Err(Error::EnvironmentMismatch { field: "timestamp" });
        }

        if self.update_signature != update_signature(env.data_dirs()) {
            return Err(Error::EnvironmentMismatch {
                field: "update signature",
            });
        }

        if self.language != env.language() {
            return Err(Error::EnvironmentMismatch { field: "language" });
        }

        if self.search_path != env.search_path() {
            return Err(Error::EnvironmentMismatch {
                field: "search path",
            });
        }

        Ok(())
    }

    /// Checks whether the cache still reflects the files on disk:
    /// `check` passes, and no resource directory or extra file changed.
    pub fn is_fresh(&self, env: &Environment) -> bool {
        if let Err(e) = self.check(env) {
            tracing::debug!(target: "sycoca", reason = %e, "cache header does not match");
            return false;
        }

        let dirs = resource_dir_stamps(env.data_dirs());
        if let Some(changed) = first_difference(&self.resource_dirs, &dirs) {
            tracing::debug!(target: "sycoca", path = %changed.display(), "resource directory changed");
            return false;
        }

        let files = file_stamps(self.extra_files.iter().map(|(path, _)| path.as_path()));
        if let Some(changed) = first_difference(&self.extra_files, &files) {
            tracing::debug!(target: "sycoca", path = %changed.display(), "extra file changed");
            return false;
        }

        true
    }
}

/// The stamp file: enough to tell whether a cache is fresh without
/// opening it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stamp {
    pub timestamp: u32,
    pub search_path: String,
    pub resource_dirs: Vec<(PathBuf, i64)>,
    /// `AppDir`s outside the data directories that the menu uses.
    pub extra_dirs: Vec<(PathBuf, i64)>,
}

impl Stamp {
    /// The stamp for a cache described by `header`, which used the
    /// `extra_dirs`.
    pub fn new(header: &CacheHeader, extra_dirs: &[PathBuf]) -> Stamp {
        Stamp {
            timestamp: header.timestamp,
            search_path: header.search_path.clone(),
            resource_dirs: header.resource_dirs.clone(),
            extra_dirs: extra_dirs
                .iter()
                .map(|dir| (dir.clone(), tree_stamp(dir).unwrap_or(0)))
                .collect(),
        }
    }

    pub(crate) fn write<W: Write + Seek>(&self, writer: &mut DataWriter<W>) -> std::io::Result<()> {
        writer.write_i32(VERSION)?;
        writer.write_u32(self.timestamp)?;
        writer.write_string(&self.search_path)?;
        write_stamps(writer, &self.resource_dirs)?;
        write_stamps(writer, &self.extra_dirs)
    }

    pub fn read(data: &[u8]) -> Decoded<Stamp> {
        let mut reader = DataReader::new(data);
        let at = reader.position();
        let version = reader.read_i32()?;
        if version != VERSION {
            return Err(DecodeError::BadTag {
                at,
                tag: version.into(),
            });
        }

        Ok(Stamp {
            timestamp: reader.read_u32()?,
            search_path: reader.read_string()?,
            resource_dirs: read_stamps(&mut reader)?,
            extra_dirs: read_stamps(&mut reader)?,
        })
    }

    /// Loads the stamp at `path`; `None` if it is absent or unusable.
    pub fn load(path: &Path) -> Option<Stamp> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                if !is_absent_file_error(&e) {
                    tracing::debug!(target: "sycoca", path = %path.display(), error = %e, "failed to read stamp");
                }
                return None;
            }
        };

        match Stamp::read(&data) {
            Ok(stamp) => Some(stamp),
            Err(e) => {
                tracing::debug!(target: "sycoca", path = %path.display(), error = %e, "invalid stamp");
                None
            }
        }
    }

    /// Checks the stamp against the directories on disk.
    pub fn is_current(&self, env: &Environment) -> bool {
        if self.timestamp == 0 || self.search_path != env.search_path() {
            return false;
        }

        let dirs = resource_dir_stamps(env.data_dirs());
        if first_difference(&self.resource_dirs, &dirs).is_some() {
            return false;
        }

        self.extra_dirs
            .iter()
            .all(|(dir, stamp)| tree_stamp(dir).unwrap_or(0) == *stamp)
    }
}

#[cfg(test)]
mod test {
    use crate::config::EnvironmentBuilder;
    use crate::header::*;
    use crate::test_util::{set_mtime, write_file};
    use test_dir::{DirBuilder, TestDir};

    fn encode(header: &CacheHeader) -> Vec<u8> {
        let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
        header.write(&mut writer).expect("write must succeed");
        writer.into_inner().expect("flush").into_inner()
    }

    #[test]
    fn test_round_trip_and_patch() {
        let temp = TestDir::temp();
        write_file(temp.path("data/applications/a.desktop"), "[Desktop Entry]\n");
        let env = EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .language("fr")
            .take()
            .build();

        let mut header = CacheHeader::for_environment(&env);
        header.factories = vec![(FactoryId::CTime, 0), (FactoryId::Service, 0)];
        header.extra_files = file_stamps([temp.path("config/mimeapps.list").as_path()]);
        let placeholder = encode(&header);

        header.factories = vec![(FactoryId::CTime, 400), (FactoryId::Service, 1234)];
        let patched = encode(&header);
        // The second pass overwrites the first one exactly.
        assert_eq!(placeholder.len(), patched.len());

        assert_eq!(read_version(&patched), Ok(VERSION));
        let decoded = CacheHeader::read(&patched).expect("read must succeed");
        assert_eq!(decoded, header);
        assert_eq!(decoded.factory_offset(FactoryId::Service), Some(1234));
        assert_eq!(decoded.factory_offset(FactoryId::MimeType), None);
        assert_eq!(decoded.extra_files[0].1, 0);
        assert!(decoded.check(&env).is_ok());
        assert!(decoded.is_fresh(&env));

        // Truncated headers are a decode error, not a panic.
        assert!(CacheHeader::read(&patched[..patched.len() - 3]).is_err());
    }

    #[test]
    fn test_check_and_freshness() {
        let temp = TestDir::temp();
        write_file(temp.path("data/applications/a.desktop"), "[Desktop Entry]\n");
        set_mtime(temp.path("data/applications/a.desktop"), 1000);
        let env = EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .language("de")
            .take()
            .build();
        let header = CacheHeader::for_environment(&env);
        assert!(header.is_fresh(&env));

        let other_language = EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .language("fr")
            .take()
            .build();
        assert!(matches!(
            header.check(&other_language),
            Err(Error::EnvironmentMismatch { field: "language" })
        ));

        let other_path = EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .data_dir(temp.path("more"))
            .language("de")
            .take()
            .build();
        assert!(matches!(
            header.check(&other_path),
            Err(Error::EnvironmentMismatch {
                field: "search path"
            })
        ));

        // An administrator touching the marker invalidates everything.
        write_file(temp.path("data/services/update_sycoca"), "");
        set_mtime(temp.path("data/services/update_sycoca"), 5);
        assert!(matches!(
            header.check(&env),
            Err(Error::EnvironmentMismatch {
                field: "update signature"
            })
        ));

        let header = CacheHeader::for_environment(&env);
        assert!(header.is_fresh(&env));
        // Editing a file in place is noticed.
        set_mtime(temp.path("data/applications/a.desktop"), 4_000_000_000);
        assert!(!header.is_fresh(&env));

        let mut zero = CacheHeader::for_environment(&env);
        zero.timestamp = 0;
        assert!(zero.check(&env).is_err());
    }

    #[test]
    fn test_stamp() {
        let temp = TestDir::temp();
        write_file(temp.path("data/applications/a.desktop"), "[Desktop Entry]\n");
        write_file(temp.path("extra/b.desktop"), "[Desktop Entry]\n");
        set_mtime(temp.path("extra/b.desktop"), 1000);
        let env = EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .take()
            .build();

        let stamp = Stamp::new(&CacheHeader::for_environment(&env), &[temp.path("extra")]);
        let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
        stamp.write(&mut writer).expect("write must succeed");
        let bytes = writer.into_inner().expect("flush").into_inner();
        std::fs::write(temp.path("stamp"), &bytes).expect("write must succeed");

        let loaded = Stamp::load(&temp.path("stamp")).expect("stamp must load");
        assert_eq!(loaded, stamp);
        assert!(loaded.is_current(&env));
        assert_eq!(Stamp::load(&temp.path("missing")), None);

        write_file(temp.path("extra/c.desktop"), "[Desktop Entry]\n");
        set_mtime(temp.path("extra/c.desktop"), 4_000_000_000);
        assert!(!loaded.is_current(&env));
    }
}
