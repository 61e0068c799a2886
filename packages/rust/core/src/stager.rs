//! Workspace stager: unpack an uploaded archive into a job-exclusive directory.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{info, instrument};
use zip::ZipArchive;

use webapk_shared::{Result, WebApkError};

use crate::fsutil;

/// Local file header signature of a zip archive.
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
/// End-of-central-directory signature (an archive with no entries).
const ZIP_EMPTY_MAGIC: [u8; 4] = *b"PK\x05\x06";

/// Result of staging an upload.
#[derive(Debug, Clone)]
pub struct StagedWorkspace {
    pub path: PathBuf,
    /// Number of archive entries (files and directories) extracted.
    pub entries: usize,
}

/// Reject anything that is not a readable `.zip` file.
pub fn validate_archive(archive: &Path) -> Result<()> {
    let has_zip_ext = archive
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
    if !has_zip_ext {
        return Err(WebApkError::validation(format!(
            "{} is not a .zip archive",
            archive.display()
        )));
    }

    let mut file = match File::open(archive) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WebApkError::validation(format!(
                "archive {} does not exist",
                archive.display()
            )));
        }
        Err(e) => return Err(WebApkError::io(archive, e)),
    };

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) if magic == ZIP_MAGIC || magic == ZIP_EMPTY_MAGIC => Ok(()),
        Ok(()) => Err(WebApkError::validation(format!(
            "{} does not look like a zip archive",
            archive.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            WebApkError::validation(format!("{} is too short to be an archive", archive.display())),
        ),
        Err(e) => Err(WebApkError::io(archive, e)),
    }
}

/// Extract `archive` into a clean `workspace`.
///
/// Any previous content of `workspace` is removed first, so re-staging the
/// same job is idempotent. Entries whose paths would land outside the
/// workspace abort extraction.
#[instrument(skip_all, fields(archive = %archive.display()))]
pub fn stage(archive: &Path, workspace: &Path) -> Result<StagedWorkspace> {
    validate_archive(archive)?;
    fsutil::reset_dir(workspace)?;

    let file = File::open(archive).map_err(|e| WebApkError::io(archive, e))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .map_err(|e| WebApkError::extraction(format!("{}: {e}", archive.display())))?;

    let entries = zip.len();
    zip.extract(workspace)
        .map_err(|e| WebApkError::extraction(format!("{}: {e}", archive.display())))?;

    info!(entries, workspace = %workspace.display(), "archive extracted");

    Ok(StagedWorkspace {
        path: workspace.to_path_buf(),
        entries,
    })
}
