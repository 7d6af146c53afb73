//! Unix socket utility functions
//!
//! Permission tightening for the directories the server's sockets live
//! in.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Error type for socket operations
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to set permissions on {path}: {source}")]
    PermissionError { path: String, source: io::Error },
}

/// Restrict a directory to its owner (0700). Session tunnel sockets live
/// under it, so group/other access would leak shells.
pub fn restrict_dir(path: &Path) -> Result<(), SocketError> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| {
        SocketError::PermissionError {
            path: path.display().to_string(),
            source: e,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_restrict_dir() {
        let dir = tempdir().unwrap();
        restrict_dir(dir.path()).unwrap();
        let mode = fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_restrict_dir_missing_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(matches!(
            restrict_dir(&missing),
            Err(SocketError::PermissionError { .. })
        ));
    }
}
