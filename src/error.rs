use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Hard failures: opening an unusable cache file, or failing to
/// produce and commit a new one.  Individual lookups never return
/// these; they degrade to "not found" instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no cache file at {path}")]
    NotFound { path: PathBuf },

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("timed out after {waited:?} waiting for the builder lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("corrupt cache file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("incompatible cache version: expected {expected}, found {found}")]
    IncompatibleVersion { expected: i32, found: i32 },

    #[error("cache was built for a different environment ({field} differs)")]
    EnvironmentMismatch { field: &'static str },

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
}

/// Errors while decoding one record from the byte stream.  These
/// never cross the public API: the lookup that hits one reports "not
/// found" and flags the whole cache as unreliable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),

    #[error("length {len} at offset {at} exceeds the remaining data")]
    Oversized { at: usize, len: u64 },

    #[error("invalid utf-8 string at offset {0}")]
    InvalidUtf8(usize),

    #[error("unknown tag {tag} at offset {at}")]
    BadTag { at: usize, tag: i64 },

    #[error("offset {0} is outside the cache file")]
    BadOffset(i64),
}

#[test]
fn test_error_messages() {
    let err = Error::IncompatibleVersion {
        expected: 3,
        found: 2,
    };
    assert_eq!(
        err.to_string(),
        "incompatible cache version: expected 3, found 2"
    );

    let io: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
    assert!(matches!(io, Error::Io(_)));
    assert_eq!(
        DecodeError::Truncated(12).to_string(),
        "unexpected end of data at offset 12"
    );
}
