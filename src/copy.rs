//! Atomic file and directory copying

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn, Span};

use crate::task::CopyTask;

/// Tag appended to the transient siblings written next to a destination file
pub const ARTIFACT_TAG: &str = "config-watcher";

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("copy from {} to {} failed for {failed} entries", .from.display(), .to.display())]
    Incomplete {
        from: PathBuf,
        to: PathBuf,
        failed: usize,
    },
}

impl CopyError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        CopyError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CopyError>;

/// Name of the backup kept while `dest` is being replaced
pub fn backup_path(dest: &Path) -> PathBuf {
    sibling(dest, "bak")
}

/// Name of the file new content is staged into before it replaces `dest`
pub fn staging_path(dest: &Path) -> PathBuf {
    sibling(dest, "tmp")
}

fn sibling(dest: &Path, kind: &str) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{name}.{kind}.{ARTIFACT_TAG}"))
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Performs copies from a source directory into a destination directory
#[derive(Debug, Clone)]
pub struct Copier {
    copy_hidden: bool,
    span: Span,
}

impl Copier {
    pub fn new(copy_hidden: bool, span: Span) -> Self {
        Self { copy_hidden, span }
    }

    pub fn copy(&self, task: &CopyTask) -> Result<()> {
        self.copy_into(&task.source, &task.destination, &task.filename)
    }

    /// Copy `source/filename` into `destination`, or the whole of `source`
    /// when `filename` is empty.
    pub fn copy_into(&self, source: &Path, destination: &Path, filename: &str) -> Result<()> {
        let _enter = self.span.enter();
        if filename.is_empty() {
            self.copy_dir(source, destination)
        } else {
            self.copy_entry(source, destination, filename)
        }
    }

    fn copy_entry(&self, source: &Path, destination: &Path, filename: &str) -> Result<()> {
        if is_hidden(filename) && !self.copy_hidden {
            info!(filename = %filename, "hidden file ignored");
            return Ok(());
        }

        let source_path = source.join(filename);
        let Some(meta) = stat_source(&source_path)? else {
            warn!(source = %source_path.display(), "source file does not exist, nothing to copy");
            return Ok(());
        };

        if meta.is_dir() {
            return self.copy_dir(&source_path, destination);
        }

        ensure_dir(destination, &meta)?;
        let dest_path = destination.join(filename);
        replace_file(&source_path, &dest_path).inspect_err(|e| {
            error!(
                source = %source_path.display(),
                destination = %dest_path.display(),
                error = %e,
                "copy file failed"
            );
        })
    }

    fn copy_dir(&self, source: &Path, destination: &Path) -> Result<()> {
        let Some(meta) = stat_source(source)? else {
            warn!(source = %source.display(), "source directory does not exist, nothing to copy");
            return Ok(());
        };
        if !meta.is_dir() {
            return Err(CopyError::NotADirectory(source.to_path_buf()));
        }

        ensure_dir(destination, &meta)?;

        let entries =
            fs::read_dir(source).map_err(|e| CopyError::io("read directory", source, e))?;

        let mut failed = 0;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!(source = %source.display(), error = %e, "read directory entry failed");
                    failed += 1;
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) && !self.copy_hidden {
                debug!(name = %name, "hidden entry skipped");
                continue;
            }

            let inner_source = entry.path();
            let inner_dest = destination.join(&name);
            if let Err(e) = self.copy_dir_entry(&inner_source, &inner_dest) {
                error!(
                    source = %inner_source.display(),
                    destination = %inner_dest.display(),
                    error = %e,
                    "copy entry failed"
                );
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(CopyError::Incomplete {
                from: source.to_path_buf(),
                to: destination.to_path_buf(),
                failed,
            });
        }
        Ok(())
    }

    fn copy_dir_entry(&self, source: &Path, destination: &Path) -> Result<()> {
        // follows symlinks: configmap volumes expose every file as a link into ..data
        let Some(meta) = stat_source(source)? else {
            debug!(source = %source.display(), "entry vanished or dangling link, skipped");
            return Ok(());
        };
        if meta.is_dir() {
            self.copy_dir(source, destination)
        } else {
            replace_file(source, destination)
        }
    }
}

/// Stat a source path, mapping "not found" to `None`.
fn stat_source(path: &Path) -> Result<Option<Metadata>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CopyError::io("stat source", path, e)),
    }
}

fn ensure_dir(dir: &Path, source_meta: &Metadata) -> Result<()> {
    match fs::metadata(dir) {
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CopyError::io("stat destination", dir, e)),
    }

    create_dir_with_mode(dir, source_meta)
        .map_err(|e| CopyError::io("create destination directory", dir, e))?;
    info!(path = %dir.display(), "destination directory created");
    Ok(())
}

#[cfg(unix)]
fn create_dir_with_mode(dir: &Path, source_meta: &Metadata) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
    // a file's bits (0644) would make the directory untraversable
    let mode = (source_meta.permissions().mode() & 0o7777) | 0o700;
    fs::DirBuilder::new().recursive(true).mode(mode).create(dir)
}

#[cfg(not(unix))]
fn create_dir_with_mode(dir: &Path, _source_meta: &Metadata) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Atomically replace `dest` with the contents of `source`.
pub fn replace_file(source: &Path, dest: &Path) -> Result<()> {
    let mut reader = File::open(source).map_err(|e| CopyError::io("open source", source, e))?;
    let meta = reader
        .metadata()
        .map_err(|e| CopyError::io("stat source", source, e))?;
    if !meta.is_file() {
        return Err(CopyError::io(
            "open source",
            source,
            io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }

    let length = replace_with(&mut reader, &meta.permissions(), dest)?;
    info!(
        source = %source.display(),
        destination = %dest.display(),
        length,
        "copy succeeded"
    );
    Ok(())
}

/// Stream `reader` into `dest` using the backup-and-rollback protocol.
///
/// Content is staged next to `dest` and renamed over it only once fully
/// written, so `dest` always holds either its previous or its new content.
/// The previous file is kept as a backup until the rename has succeeded.
pub fn replace_with<R: Read>(
    reader: &mut R,
    permissions: &fs::Permissions,
    dest: &Path,
) -> Result<u64> {
    let staging = staging_path(dest);
    let backup = backup_path(dest);

    let length = match stage(reader, permissions, &staging) {
        Ok(length) => length,
        Err(e) => {
            remove_quietly(&staging);
            return Err(e);
        }
    };

    let has_backup = match preserve(dest, &backup) {
        Ok(has_backup) => has_backup,
        Err(e) => {
            remove_quietly(&staging);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&staging, dest) {
        warn!(destination = %dest.display(), error = %e, "replace failed, restoring backup");
        remove_quietly(&staging);
        if has_backup {
            if let Err(restore) = fs::rename(&backup, dest) {
                error!(backup = %backup.display(), error = %restore, "restore backup failed");
            }
        }
        return Err(CopyError::io("replace destination", dest, e));
    }

    if has_backup {
        remove_quietly(&backup);
    }
    Ok(length)
}

fn stage<R: Read>(reader: &mut R, permissions: &fs::Permissions, staging: &Path) -> Result<u64> {
    // leftovers from an interrupted run
    remove_quietly(staging);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staging)
        .map_err(|e| CopyError::io("create staging file", staging, e))?;

    let length =
        io::copy(reader, &mut file).map_err(|e| CopyError::io("copy content", staging, e))?;
    file.flush()
        .map_err(|e| CopyError::io("flush staging file", staging, e))?;
    file.sync_all()
        .map_err(|e| CopyError::io("sync staging file", staging, e))?;
    drop(file);

    // set explicitly so the umask does not change the mirrored bits
    fs::set_permissions(staging, permissions.clone())
        .map_err(|e| CopyError::io("set permissions", staging, e))?;
    Ok(length)
}

/// Keep the current destination aside as `backup`. Returns false when there
/// is nothing to keep.
fn preserve(dest: &Path, backup: &Path) -> Result<bool> {
    match fs::symlink_metadata(dest) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CopyError::io("stat destination", dest, e)),
    }

    remove_quietly(backup);
    if fs::hard_link(dest, backup).is_err() {
        // filesystems without hard links
        fs::copy(dest, backup).map_err(|e| CopyError::io("back up destination", dest, e))?;
    }
    Ok(true)
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "remove temporary file failed"),
    }
}
