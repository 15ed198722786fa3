//! Sharded directory layout and file listings.
//!
//! A study key maps onto four directory levels derived from the study id:
//! two from its CRC32 and two from small polynomial string hashes. The layout
//! is fixed by data already on disk, so the hashes keep their historical
//! quirks: the polynomial hashes treat bytes as signed and wrap at 32 bits.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use walkdir::WalkDir;

use crate::protocol::MD5_LEDGER_NAME;

/// First allocation for a listing
pub const LIST_INITIAL_BUF: usize = 2 * 1024 * 1024;
/// Hard ceiling on a listing
pub const LIST_MAX_BUF: usize = 170 * 1024 * 1024;
/// Listing prefix: u64 total length + u32 file count
pub const LIST_PREFIX_LEN: usize = 12;

fn poly_hash(data: &[u8], mul: i32, modulus: i32) -> u32 {
    let mut v: i32 = 0;
    for &b in data {
        v = v.wrapping_mul(mul).wrapping_add(b as i8 as i32);
    }
    let mut r = v % modulus;
    if r < 0 {
        r += modulus;
    }
    r as u32
}

/// The four directory levels for a study id
pub fn shard_levels(study: &str) -> [u32; 4] {
    let bytes = study.as_bytes();
    let key = crc32fast::hash(bytes) % 4096;
    [
        key / 64,
        key % 64,
        poly_hash(bytes, 31, 101),
        poly_hash(bytes, 37, 103),
    ]
}

/// `<root>/x1/x2/x3/x4/<study>[/<serial>]`
pub fn shard_path(root: &Path, study: &str, serial: Option<&str>) -> PathBuf {
    let [x1, x2, x3, x4] = shard_levels(study);
    let mut p = root.join(format!("{}/{}/{}/{}", x1, x2, x3, x4)).join(study);
    if let Some(serial) = serial {
        p.push(serial);
    }
    p
}

/// Split `study/serial`; repeated slashes collapse and trailing segments are dropped
pub fn split_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once('/') {
        None => (key, None),
        Some((study, rest)) => {
            let serial = rest
                .trim_start_matches('/')
                .split('/')
                .next()
                .filter(|s| !s.is_empty());
            (study, serial)
        }
    }
}

/// Growable listing buffer with the historical doubling policy
struct ListBuffer {
    buf: Vec<u8>,
    limit: usize,
    count: u32,
}

impl ListBuffer {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(LIST_INITIAL_BUF);
        buf.extend_from_slice(&[0u8; LIST_PREFIX_LEN]);
        Self {
            buf,
            limit: LIST_INITIAL_BUF,
            count: 0,
        }
    }

    fn push(&mut self, name: &str, size: u64) -> Result<()> {
        let name_len = u16::try_from(name.len())
            .with_context(|| format!("file name too long for listing: {}", name))?;
        let need = self.buf.len() + 2 + name.len() + 8;
        while need > self.limit {
            if self.limit >= LIST_MAX_BUF {
                bail!("file list exceeds {} bytes", LIST_MAX_BUF);
            }
            self.limit = (self.limit * 2).min(LIST_MAX_BUF);
            info!("increase file list buffer to {} bytes", self.limit);
        }
        self.buf.extend_from_slice(&name_len.to_be_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(&size.to_be_bytes());
        self.count += 1;
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        let total = self.buf.len() as u64;
        self.buf[0..8].copy_from_slice(&total.to_be_bytes());
        self.buf[8..12].copy_from_slice(&self.count.to_be_bytes());
        self.buf
    }
}

/// Encode every regular file under `dirs` as
/// `[u64 total][u32 count]{[u16 len][name][u64 size]}*`. Names are absolute
/// paths with `root` removed. The checksum ledger is never listed.
pub fn build_file_list(root: &Path, dirs: &[PathBuf]) -> Result<Vec<u8>> {
    let mut list = ListBuffer::new();
    for dir in dirs {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    error!("skip listing entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || entry.file_name() == MD5_LEDGER_NAME {
                continue;
            }
            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    error!("skip {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            list.push(&strip_root(entry.path(), root), size)?;
        }
    }
    Ok(list.finish())
}

fn strip_root(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => path.display().to_string(),
    }
}

/// Decode a listing back into (name, size) pairs
pub fn parse_file_list(buf: &[u8]) -> Result<Vec<(String, u64)>> {
    if buf.len() < LIST_PREFIX_LEN {
        bail!("file list shorter than its prefix");
    }
    let total = u64::from_be_bytes(buf[0..8].try_into()?) as usize;
    let count = u32::from_be_bytes(buf[8..12].try_into()?) as usize;
    if total != buf.len() {
        bail!("file list length {} does not match buffer {}", total, buf.len());
    }
    let mut out = Vec::with_capacity(count);
    let mut at = LIST_PREFIX_LEN;
    for _ in 0..count {
        let len_end = at + 2;
        let name_len = u16::from_be_bytes(
            buf.get(at..len_end)
                .context("truncated file list")?
                .try_into()?,
        ) as usize;
        let name = buf
            .get(len_end..len_end + name_len)
            .context("truncated file list")?;
        let size_at = len_end + name_len;
        let size = u64::from_be_bytes(
            buf.get(size_at..size_at + 8)
                .context("truncated file list")?
                .try_into()?,
        );
        out.push((String::from_utf8_lossy(name).into_owned(), size));
        at = size_at + 8;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_levels_split_the_crc32_key() {
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
        // 0xCBF43926 % 4096 = 2342 = 36 * 64 + 38
        let [x1, x2, _, _] = shard_levels("123456789");
        assert_eq!((x1, x2), (36, 38));
        assert_eq!(crc32fast::hash(b"The quick brown fox jumps over the lazy dog"), 0x414F_A339);
    }

    #[test]
    fn shard_levels_in_range() {
        let study = "1.2.826.0.1.3680043.2.461.9701983.3645589902";
        let [x1, x2, x3, x4] = shard_levels(study);
        assert!(x1 < 64 && x2 < 64 && x3 < 101 && x4 < 103);
        // Deterministic
        assert_eq!(shard_levels(study), [x1, x2, x3, x4]);

        let p = shard_path(Path::new("/sgw.1"), study, Some("serial111"));
        assert_eq!(
            p,
            PathBuf::from(format!(
                "/sgw.1/{}/{}/{}/{}/{}/serial111",
                x1, x2, x3, x4, study
            ))
        );
    }

    #[test]
    fn poly_hash_normalises_negative_values() {
        // Long keys overflow i32 and go negative before the modulo
        let long = "9".repeat(64);
        let [_, _, x3, x4] = shard_levels(&long);
        assert!(x3 < 101);
        assert!(x4 < 103);
        assert_eq!(poly_hash(b"a", 31, 101), 97 % 101);
        assert_eq!(poly_hash(&[0xFF], 31, 101), 100);
    }

    #[test]
    fn split_key_variants() {
        assert_eq!(split_key("study"), ("study", None));
        assert_eq!(split_key("study/serial"), ("study", Some("serial")));
        assert_eq!(split_key("study///serial/extra"), ("study", Some("serial")));
        assert_eq!(split_key("study/"), ("study", None));
        assert_eq!(split_key("study//"), ("study", None));
    }

    #[test]
    fn listing_skips_ledger_and_strips_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let dir = root.join("s/t");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("x"), b"abc").unwrap();
        std::fs::write(dir.join("y"), b"").unwrap();
        std::fs::write(dir.join("sub/z"), b"12345").unwrap();
        std::fs::write(dir.join(MD5_LEDGER_NAME), b"ledger").unwrap();

        let buf = build_file_list(root, &[dir.clone()]).unwrap();
        let entries = parse_file_list(&buf).unwrap();
        assert_eq!(
            entries,
            vec![
                ("/s/t/sub/z".to_string(), 5),
                ("/s/t/x".to_string(), 3),
                ("/s/t/y".to_string(), 0),
            ]
        );
    }

    #[test]
    fn empty_listing_is_just_the_prefix() {
        let buf = build_file_list(Path::new("/"), &[]).unwrap();
        assert_eq!(buf.len(), LIST_PREFIX_LEN);
        assert!(parse_file_list(&buf).unwrap().is_empty());
    }
}
