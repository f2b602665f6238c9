//! Blocking archive extraction with per-entry progress.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::{ToolboxError, ToolboxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// `.zip` is zip; anything else is treated as gzip-compressed tar.
    pub fn from_path(path: &Path) -> Self {
        let is_zip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_zip {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarGz
        }
    }
}

fn extraction_error(context: &str, err: impl std::fmt::Display) -> ToolboxError {
    ToolboxError::ExtractionFailure(format!("{context}: {err}"))
}

/// Relative path inside the destination, or an error if the entry would
/// land outside it.
fn contained(entry: &Path) -> ToolboxResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ToolboxError::ExtractionFailure(format!(
                    "entry {} escapes the destination",
                    entry.display()
                )));
            }
        }
    }
    Ok(out)
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from((done * 100 / total).min(100)).unwrap_or(100)
}

/// Extract `archive` into `dest`, calling `on_progress` after every entry.
///
/// Stops between entries once `cancel` fires. Returns the entry count.
pub fn extract_blocking(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u8),
) -> ToolboxResult<usize> {
    fs::create_dir_all(dest)?;
    match ArchiveFormat::from_path(archive) {
        ArchiveFormat::TarGz => extract_tar_gz(archive, dest, cancel, &mut on_progress),
        ArchiveFormat::Zip => extract_zip(archive, dest, cancel, &mut on_progress),
    }
}

fn open_tar(archive: &Path) -> ToolboxResult<tar::Archive<GzDecoder<File>>> {
    let file = File::open(archive)?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

fn extract_tar_gz(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(u8),
) -> ToolboxResult<usize> {
    let total = open_tar(archive)?
        .entries()
        .map_err(|e| extraction_error("reading archive", e))?
        .try_fold(0usize, |n, entry| entry.map(|_| n + 1))
        .map_err(|e| extraction_error("reading archive", e))?;
    debug!("{} contains {} entries", archive.display(), total);

    let mut tar = open_tar(archive)?;
    tar.set_preserve_permissions(true);
    let entries = tar
        .entries()
        .map_err(|e| extraction_error("reading archive", e))?;
    for (index, entry) in entries.enumerate() {
        if cancel.is_cancelled() {
            return Err(ToolboxError::ExtractionFailure("cancelled".to_string()));
        }
        let mut entry = entry.map_err(|e| extraction_error("reading entry", e))?;
        let path = entry
            .path()
            .map_err(|e| extraction_error("reading entry path", e))?
            .into_owned();
        contained(&path)?;
        entry
            .unpack_in(dest)
            .map_err(|e| extraction_error(&format!("unpacking {}", path.display()), e))?;
        on_progress(percent(index + 1, total));
    }
    Ok(total)
}

fn extract_zip(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(u8),
) -> ToolboxResult<usize> {
    let file = File::open(archive)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| extraction_error("reading archive", e))?;
    let total = zip.len();
    debug!("{} contains {} entries", archive.display(), total);

    for index in 0..total {
        if cancel.is_cancelled() {
            return Err(ToolboxError::ExtractionFailure("cancelled".to_string()));
        }
        let mut entry = zip
            .by_index(index)
            .map_err(|e| extraction_error("reading entry", e))?;
        let relative = contained(Path::new(entry.name()))?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)
                .map_err(|e| extraction_error(&format!("unpacking {}", relative.display()), e))?;
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
        on_progress(percent(index + 1, total));
    }
    Ok(total)
}
