//! Filesystem helpers shared by the pipeline stages.

use std::fs;
use std::io::BufReader;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use webapk_shared::{Result, WebApkError};

/// Remove `path` if present, then recreate it empty.
pub fn reset_dir(path: &Path) -> Result<()> {
    remove_dir_if_exists(path)?;
    fs::create_dir_all(path).map_err(|e| WebApkError::io(path, e))
}

/// Remove a directory tree. Returns `false` when there was nothing to remove.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed directory");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(WebApkError::io(path, e)),
    }
}

/// Copy every entry of `src` into `dst`, merging directories recursively and
/// overwriting same-named files wholesale. Returns the number of files copied.
///
/// Symlinks are skipped so that nothing outside `src` is ever pulled in.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst).map_err(|e| WebApkError::io(dst, e))?;

    let mut copied = 0;
    for entry in fs::read_dir(src).map_err(|e| WebApkError::io(src, e))? {
        let entry = entry.map_err(|e| WebApkError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| WebApkError::io(&from, e))?;

        if file_type.is_dir() {
            if to.is_file() {
                fs::remove_file(&to).map_err(|e| WebApkError::io(&to, e))?;
            }
            copied += copy_dir_all(&from, &to)?;
        } else if file_type.is_file() {
            if to.is_dir() {
                fs::remove_dir_all(&to).map_err(|e| WebApkError::io(&to, e))?;
            }
            fs::copy(&from, &to).map_err(|e| WebApkError::io(&to, e))?;
            copied += 1;
        } else {
            warn!(path = %from.display(), "skipping non-regular file");
        }
    }

    Ok(copied)
}

/// Copy a file by writing a hidden temp sibling and renaming it into place.
pub fn copy_file_atomic(src: &Path, dst: &Path) -> Result<u64> {
    let dir = dst
        .parent()
        .ok_or_else(|| WebApkError::validation(format!("{} has no parent", dst.display())))?;
    fs::create_dir_all(dir).map_err(|e| WebApkError::io(dir, e))?;

    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{name}.tmp"));

    let size = fs::copy(src, &temp).map_err(|e| WebApkError::io(&temp, e))?;
    fs::rename(&temp, dst).map_err(|e| WebApkError::io(dst, e))?;
    Ok(size)
}

/// Write a JSON file (pretty-printed) atomically.
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| WebApkError::validation(format!("JSON serialization failed: {e}")))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{name}.tmp"));

    fs::write(&temp, json).map_err(|e| WebApkError::io(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| WebApkError::io(path, e))?;
    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = fs::File::open(path).map_err(|e| WebApkError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher).map_err(|e| WebApkError::io(path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_dir;

    #[test]
    fn copy_dir_all_merges_and_overwrites() {
        let tmp = temp_dir("fsutil");
        let src = tmp.join("src");
        let dst = tmp.join("dst");

        fs::create_dir_all(src.join("assets/js")).unwrap();
        fs::write(src.join("index.html"), "new").unwrap();
        fs::write(src.join("assets/js/app.js"), "js").unwrap();

        fs::create_dir_all(dst.join("assets")).unwrap();
        fs::write(dst.join("index.html"), "old").unwrap();
        fs::write(dst.join("assets/keep.css"), "css").unwrap();

        let copied = copy_dir_all(&src, &dst).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(dst.join("index.html")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dst.join("assets/js/app.js")).unwrap(), "js");
        assert_eq!(fs::read_to_string(dst.join("assets/keep.css")).unwrap(), "css");

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn copy_dir_all_replaces_file_with_directory() {
        let tmp = temp_dir("fsutil");
        let src = tmp.join("src");
        let dst = tmp.join("dst");

        fs::create_dir_all(src.join("www")).unwrap();
        fs::write(src.join("www/index.html"), "page").unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("www"), "was a file").unwrap();

        copy_dir_all(&src, &dst).unwrap();
        assert!(dst.join("www").is_dir());
        assert!(dst.join("www/index.html").is_file());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn reset_dir_clears_previous_contents() {
        let tmp = temp_dir("fsutil");
        let dir = tmp.join("ws");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale.txt"), "stale").unwrap();

        reset_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        assert!(remove_dir_if_exists(&dir).unwrap());
        assert!(!remove_dir_if_exists(&dir).unwrap());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn atomic_copy_and_checksum() {
        let tmp = temp_dir("fsutil");
        let src = tmp.join("artifact.bin");
        fs::write(&src, "hello").unwrap();

        let dst = tmp.join("out/published.bin");
        let size = copy_file_atomic(&src, &dst).unwrap();
        assert_eq!(size, 5);
        assert!(!tmp.join("out/.published.bin.tmp").exists());

        // sha256("hello")
        assert_eq!(
            sha256_file(&dst).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let _ = fs::remove_dir_all(&tmp);
    }
}
