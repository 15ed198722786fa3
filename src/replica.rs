//! Replica file operations across the configured backend roots.
//!
//! A logical file name lives once under every root. Uploads write each chunk
//! to all replicas; downloads read from the first replica that yields data;
//! deletes succeed only when every existing replica is gone.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use crate::checksum;
use crate::conn::BackendFile;
use crate::protocol::{MAX_MSG_DATA_LEN, MOUNT_STUB_DIR};
use crate::protocol_core::replica_path;

/// A root whose mount vanished loses its stub directory
pub fn check_mounted(root: &Path) -> Result<()> {
    let stub = root.join(MOUNT_STUB_DIR);
    if !stub.is_dir() {
        bail!("backend {} is not mounted ({} missing)", root.display(), stub.display());
    }
    Ok(())
}

fn replica_paths(roots: &[PathBuf], name: &str) -> Result<Vec<(PathBuf, PathBuf)>> {
    roots
        .iter()
        .map(|root| Ok((root.clone(), replica_path(root, name)?)))
        .collect()
}

/// Open (creating when missing, never truncating) one replica per root
pub fn open_for_upload(roots: &[PathBuf], name: &str, size: u64, md5: &str) -> Result<Vec<BackendFile>> {
    if md5.len() != crate::protocol::MD5_LEN {
        bail!("declared checksum {:?} is not {} characters", md5, crate::protocol::MD5_LEN);
    }
    let mut out = Vec::with_capacity(roots.len());
    for (root, path) in replica_paths(roots, name)? {
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .mode(0o644)
                    .open(&path)
                    .with_context(|| format!("create {}", path.display()))?
            }
            Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
        };
        let mut b = BackendFile::new(root, path);
        b.file = Some(file);
        b.md5 = md5.to_string();
        b.size = size;
        b.remaining = size;
        out.push(b);
    }
    Ok(out)
}

/// Write one chunk at `offset` into every replica
pub fn write_chunk(backends: &mut [BackendFile], offset: u64, data: &[u8]) -> Result<()> {
    if backends.is_empty() {
        bail!("no replica is open for writing");
    }
    for b in backends.iter_mut() {
        check_mounted(&b.root)?;
        let file = b
            .file
            .as_ref()
            .with_context(|| format!("{} is not open", b.path.display()))?;
        file.write_all_at(data, offset)
            .with_context(|| format!("write {} bytes at {} to {}", data.len(), offset, b.path.display()))?;
        b.done += data.len() as u64;
        b.remaining = b.remaining.saturating_sub(data.len() as u64);
    }
    Ok(())
}

/// Close every replica, verify each against the declared checksum and record
/// the checksum of the first replica in its directory ledger
pub fn finish_upload(backends: &mut Vec<BackendFile>) -> Result<()> {
    let Some(first) = backends.first() else {
        bail!("upload finished without open replicas");
    };
    let expected = first.md5.clone();
    let ledger_target = first.path.clone();
    for b in backends.iter_mut() {
        if let Some(f) = b.file.take() {
            f.sync_all()
                .with_context(|| format!("flush {}", b.path.display()))?;
        }
    }
    for b in backends.iter() {
        if !checksum::check_md5(&b.path, &expected)? {
            bail!("checksum mismatch on {} (expected {})", b.path.display(), expected);
        }
    }
    checksum::save_md5(&ledger_target, &expected)?;
    backends.clear();
    Ok(())
}

/// Open every existing replica read-only. Returns the size of the first one.
pub fn open_for_download(roots: &[PathBuf], name: &str) -> Result<(Vec<BackendFile>, u64)> {
    let existing: Vec<_> = replica_paths(roots, name)?
        .into_iter()
        .filter(|(_, p)| p.exists())
        .collect();
    if existing.is_empty() {
        bail!("{} exists on no backend", name);
    }
    let size = fs::metadata(&existing[0].1)
        .with_context(|| format!("stat {}", existing[0].1.display()))?
        .len();
    let mut out = Vec::with_capacity(existing.len());
    for (root, path) in existing {
        match File::open(&path) {
            Ok(f) => {
                let mut b = BackendFile::new(root, path);
                b.file = Some(f);
                b.size = size;
                b.remaining = size;
                out.push(b);
            }
            Err(e) => warn!("open replica {} failed: {}", path.display(), e),
        }
    }
    if out.is_empty() {
        bail!("no replica of {} could be opened", name);
    }
    Ok((out, size))
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read up to `count` bytes (capped at the max payload) from the first
/// replica that returns data
pub fn read_chunk(backends: &[BackendFile], offset: u64, count: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; count.min(MAX_MSG_DATA_LEN)];
    for b in backends {
        let Some(file) = b.file.as_ref() else { continue };
        match read_full_at(file, &mut buf, offset) {
            Ok(n) if n > 0 => {
                buf.truncate(n);
                return Ok(buf);
            }
            Ok(_) => debug!("replica {} has nothing at offset {}", b.path.display(), offset),
            Err(e) => error!("read {} at {} failed: {}", b.path.display(), offset, e),
        }
    }
    bail!("no replica returned data at offset {}", offset)
}

/// Remove the file from every root. True when nothing is left behind; a
/// file present on no root counts as deleted.
pub fn delete_replicas(roots: &[PathBuf], name: &str) -> Result<bool> {
    let existing: Vec<_> = replica_paths(roots, name)?
        .into_iter()
        .map(|(_, p)| p)
        .filter(|p| p.exists())
        .collect();
    let mut removed = 0;
    for path in &existing {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => error!("remove {} failed: {}", path.display(), e),
        }
    }
    Ok(removed == existing.len())
}

/// Open the first root's replica for whole-file streaming
pub fn open_sequential(root: &Path, name: &str) -> Result<BackendFile> {
    let path = replica_path(root, name)?;
    let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    crate::net::advise_sequential(&file);
    let mut b = BackendFile::new(root.to_path_buf(), path);
    b.file = Some(file);
    b.size = size;
    b.remaining = size;
    Ok(b)
}
