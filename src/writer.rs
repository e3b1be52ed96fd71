//! Block sinks: where received payload bytes land
//!
//! A `FileCreator` resolves logical block names strictly under the
//! destination root and hands out positioned `FileWriter`s. Sibling
//! workers may hold writers into disjoint ranges of the same file at the
//! same time, so files are opened without truncation and each writer
//! seeks to its block offset.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::protocol::{BlockDetails, ErrorKind};

/// Resolve `name` to a path safely under `root`: no absolute paths, no
/// parent components, no NUL bytes, and the canonicalized result must
/// stay inside the root even through symlinks.
pub fn resolve_under_root(root: &Path, name: &Path) -> Result<PathBuf> {
    if name.to_string_lossy().contains('\0') {
        bail!("block name contains NUL byte");
    }
    let mut safe = PathBuf::new();
    for component in name.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => safe.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("block name has disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty block name");
    }
    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let joined = canonical_root.join(&safe);
    // canonicalize what exists so a symlinked subdirectory cannot point
    // outside the root; a yet-to-be-created file canonicalizes its parent
    let resolved = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("canonicalize {:?}: {}", joined, e))?
    } else {
        match joined.parent() {
            Some(parent) if parent.exists() => {
                let parent = parent
                    .canonicalize()
                    .map_err(|e| anyhow!("canonicalize {:?}: {}", parent, e))?;
                match joined.file_name() {
                    Some(file_name) => parent.join(file_name),
                    None => parent,
                }
            }
            _ => joined,
        }
    };
    if !resolved.starts_with(&canonical_root) {
        bail!("block name {:?} escapes destination root", name);
    }
    Ok(resolved)
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, size: i64) {
    use std::os::fd::AsRawFd;
    if size <= 0 {
        return;
    }
    // best effort; sparse allocation is the fallback
    let _ = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &File, _size: i64) {}

enum Sink {
    Disk(File),
    Discard,
}

/// Positioned write handle for one block. `total_written` is monotone.
pub struct FileWriter {
    sink: Sink,
    total_written: i64,
}

impl FileWriter {
    pub fn write(&mut self, data: &[u8]) -> ErrorKind {
        match &mut self.sink {
            Sink::Disk(file) => {
                if let Err(e) = file.write_all(data) {
                    eprintln!("block write failed: {}", e);
                    return ErrorKind::FileWriteError;
                }
            }
            Sink::Discard => {}
        }
        self.total_written += data.len() as i64;
        ErrorKind::Ok
    }

    pub fn total_written(&self) -> i64 {
        self.total_written
    }
}

/// Opens sinks for named logical blocks under one destination root.
pub struct FileCreator {
    root: PathBuf,
    skip_writes: bool,
}

impl FileCreator {
    pub fn new(root: &Path, skip_writes: bool) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create destination root {:?}", root))?;
        Ok(FileCreator {
            root: root.to_path_buf(),
            skip_writes,
        })
    }

    pub fn open_for_block(&self, details: &BlockDetails) -> Result<FileWriter> {
        if self.skip_writes {
            return Ok(FileWriter {
                sink: Sink::Discard,
                total_written: 0,
            });
        }
        let path = resolve_under_root(&self.root, Path::new(&details.file_name))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create parent for {:?}", path))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open block sink {:?}", path))?;
        preallocate(&file, details.file_size);
        if details.offset > 0 {
            file.seek(SeekFrom::Start(details.offset as u64))
                .with_context(|| format!("seek to {} in {:?}", details.offset, path))?;
        }
        Ok(FileWriter {
            sink: Sink::Disk(file),
            total_written: 0,
        })
    }
}
