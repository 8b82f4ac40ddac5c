/// Some [`std::io::Error`]s are expected while scanning resource
/// directories: files come and go while we walk the tree.
use std::io::Error;
use std::io::ErrorKind;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A stale (NFS) handle means the inode we're trying to read
/// isn't available on the server anymore.  Resource directories on
/// network home directories do that, and a file that vanished under
/// us is simply not part of this build.
pub fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        // `ErrorKind::StaleNetworkFileHandle` isn't stable yet.
        errno == libc::ESTALE
    } else {
        false
    }
}

// Mostly trivial, but let's at least make sure we didn't mess up raw_os_error
// and confirm that libc agrees with what we know to be true on Linux.
#[test]
fn test_getters() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));

    #[cfg(target_os = "linux")]
    assert!(is_absent_file_error(&Error::from_raw_os_error(116))); // ESTALE
}
