//! Code staging.
//!
//! Functions may point at an archive instead of a directory. Archives are
//! extracted into a fresh directory under the staging root so they can be
//! bind-mounted; the directory lives as long as the [`StagedCode`].

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result as AnyResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const ARCHIVE_EXTENSIONS: [&str; 3] = ["zip", "jar", "war"];

/// Code location ready to be mounted.
#[derive(Debug)]
pub struct StagedCode {
    path: PathBuf,
    /// Set when `path` is an extraction directory we own.
    ephemeral: bool,
    cleaned: AtomicBool,
}

impl StagedCode {
    fn in_place(path: PathBuf) -> Self {
        Self {
            path,
            ephemeral: false,
            cleaned: AtomicBool::new(false),
        }
    }

    fn extracted(path: PathBuf) -> Self {
        Self {
            path,
            ephemeral: true,
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Remove the extraction directory. Only the first call does any work.
    pub fn cleanup(&self) -> io::Result<()> {
        if !self.ephemeral || self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), event = "staged_code_removed", "Removed staged code");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StagedCode {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(path = %self.path.display(), error = %e, "Failed to remove staged code");
        }
    }
}

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ARCHIVE_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
}

#[derive(Debug, Clone)]
pub struct CodeStager {
    tmp_root: PathBuf,
}

impl CodeStager {
    pub fn new(tmp_root: PathBuf) -> Self {
        Self { tmp_root }
    }

    pub async fn stage(&self, code_location: &Path) -> Result<StagedCode> {
        if !is_archive(code_location) {
            return Ok(StagedCode::in_place(code_location.to_path_buf()));
        }

        let target = self.tmp_root.join(Uuid::new_v4().to_string());
        let archive = code_location.to_path_buf();
        let dest = target.clone();

        let extracted = tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
            .await
            .map_err(|e| anyhow::anyhow!("extraction task failed: {e}"))
            .and_then(|r| r);

        match extracted {
            Ok(entries) => {
                info!(
                    archive = %code_location.display(),
                    path = %target.display(),
                    entries,
                    event = "code_staged",
                    "Extracted code archive"
                );
                Ok(StagedCode::extracted(target))
            }
            Err(source) => {
                if let Err(e) = fs::remove_dir_all(&target) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(path = %target.display(), error = %e, "Failed to remove partial extraction");
                    }
                }
                Err(Error::Staging {
                    path: code_location.to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn extract_archive(archive_path: &Path, dest: &Path) -> AnyResult<usize> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("Failed to open archive {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("Failed to read zip archive")?;
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create staging directory {}", dest.display()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("Failed to read archive entry")?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| anyhow::anyhow!("archive entry {:?} escapes the target directory", entry.name()))?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to extract {}", out_path.display()))?;

        apply_mode(&out_path, entry.unix_mode())?;
        debug!(entry = %out_path.display(), "Extracted archive entry");
    }

    Ok(archive.len())
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}
