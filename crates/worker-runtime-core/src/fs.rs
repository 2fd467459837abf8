//! Filesystem helpers shared by the bootstrap cache and the preload manifest.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use uuid::Uuid;

use worker_runtime_common::RuntimeError;

/// Write `contents` to `path` atomically.
///
/// The data goes to a temporary file in the same directory, which is then
/// renamed over `path`. On failure the previous file is left untouched.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), RuntimeError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| RuntimeError::io(parent, e))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| RuntimeError::config(format!("'{}' is not a file path", path.display())))?;
    let temp_path = parent.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));

    let written = write_and_sync(&temp_path, contents).and_then(|()| fs::rename(&temp_path, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(RuntimeError::io(path, e));
    }

    Ok(())
}

fn write_and_sync(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Remove `path`. Returns `false` if there was nothing to remove.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool, RuntimeError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RuntimeError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/out.txt");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_write_atomic_failure_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let err = write_atomic(&blocker.join("out.txt"), b"data").unwrap_err();

        assert!(matches!(err, RuntimeError::Io { .. }));
        assert_eq!(fs::read(&blocker).unwrap(), b"not a directory");
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");

        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }
}
