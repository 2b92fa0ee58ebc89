use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::process::{self, ChildRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived(PathBuf),
    /// Nothing to back up; not an error.
    SourceAbsent,
}

/// `<prefix><basename>.tgz`, e.g. `upload_myproject.tgz`.
pub fn archive_name(src: &Path, prefix: &str) -> String {
    let base = src
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".into());
    format!("{prefix}{base}.tgz")
}

/// Pack `src` into `dest_dir/<prefix><basename>.tgz` with entries rooted at
/// `.`. The in-process tar+gzip writer is tried first; a stale destination is
/// removed and the write retried once; any other fault falls back to the
/// external `tar` binary under `timeout`.
pub fn archive_directory(
    registry: &ChildRegistry,
    src: &Path,
    dest_dir: &Path,
    prefix: &str,
    timeout: Duration,
) -> Result<ArchiveOutcome> {
    archive_with(registry, src, dest_dir, prefix, timeout, write_tar_gz)
}

fn archive_with(
    registry: &ChildRegistry,
    src: &Path,
    dest_dir: &Path,
    prefix: &str,
    timeout: Duration,
    write: impl Fn(&Path, &Path) -> io::Result<()>,
) -> Result<ArchiveOutcome> {
    if !src.exists() {
        info!(src = %src.display(), "nothing to archive, source does not exist");
        return Ok(ArchiveOutcome::SourceAbsent);
    }
    fs::create_dir_all(dest_dir).map_err(|e| Error::archive(src, dest_dir, e.to_string()))?;
    let target = dest_dir.join(archive_name(src, prefix));

    let mut library_err = None;
    for attempt in 0..2 {
        match write(src, &target) {
            Ok(()) => {
                debug!(archive = %target.display(), "archive written");
                return Ok(ArchiveOutcome::Archived(target));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt == 0 => {
                debug!(archive = %target.display(), "replacing existing archive");
                fs::remove_file(&target)
                    .map_err(|e| Error::archive(src, dest_dir, e.to_string()))?;
            }
            Err(e) => {
                library_err = Some(e);
                break;
            }
        }
    }

    let library_err = library_err.map(|e| e.to_string()).unwrap_or_default();
    warn!(
        src = %src.display(),
        error = %library_err,
        "library archiving failed, falling back to tar"
    );
    let _ = fs::remove_file(&target);
    match external_tar(registry, src, &target, timeout) {
        Ok(()) => Ok(ArchiveOutcome::Archived(target)),
        Err(tar_err) => {
            let _ = fs::remove_file(&target);
            Err(Error::archive(
                src,
                dest_dir,
                format!("library: {library_err}; tar: {tar_err}"),
            ))
        }
    }
}

fn write_tar_gz(src: &Path, target: &Path) -> io::Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)?;
    let res = append_tree(file, src);
    if res.is_err() {
        let _ = fs::remove_file(target);
    }
    res
}

fn append_tree(file: File, src: &Path) -> io::Result<()> {
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let name = Path::new(".").join(rel);
        let ft = entry.file_type();
        if ft.is_dir() || ft.is_file() || ft.is_symlink() {
            builder.append_path_with_name(entry.path(), &name)?;
        } else {
            debug!(path = %entry.path().display(), "skipping special file");
        }
    }
    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()
}

fn external_tar(
    registry: &ChildRegistry,
    src: &Path,
    target: &Path,
    timeout: Duration,
) -> std::result::Result<(), String> {
    let mut cmd = Command::new("tar");
    cmd.arg("czf").arg(target).arg("-C").arg(src).arg(".");
    let out = process::run(registry, cmd, timeout).map_err(|e| format!("spawn failed: {e}"))?;
    if out.success() {
        Ok(())
    } else {
        Err(out.summary())
    }
}

/// Unpack a `.tgz` produced by `archive_directory` into `dest`.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| Error::read(archive, e.to_string()))?;
    fs::create_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    let mut ar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    ar.set_preserve_permissions(true);
    ar.unpack(dest)
        .map_err(|e| Error::archive(archive, dest, e.to_string()))
}
