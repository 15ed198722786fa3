//! MD5 verification and the per-directory checksum ledger.
//!
//! The ledger `md5sum.txt` sits next to the files it describes and holds one
//! `<absolute path> <32 hex digits>` line per completed upload. It is only ever
//! appended to, so a re-upload shadows the previous entry and lookups take the
//! last match. A torn append can leave garbage in front of a valid entry on
//! the same line; the scanner tolerates that.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::protocol::{MD5_LEDGER_NAME, MD5_LEN};

const READ_CHUNK: usize = 1024 * 1024;

/// Ledger file that covers `path`
pub fn ledger_path(path: &Path) -> Result<PathBuf> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    Ok(dir.join(MD5_LEDGER_NAME))
}

/// Append `"<path> <md5>\n"` to the ledger of `path`'s directory
pub fn save_md5(path: &Path, md5: &str) -> Result<()> {
    if !is_md5_hex(md5) {
        bail!("refusing to record malformed checksum {:?}", md5);
    }
    let ledger = ledger_path(path)?;
    let line = format!("{} {}\n", path.display(), md5);
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&ledger)
        .with_context(|| format!("open ledger {}", ledger.display()))?;
    // One write call so concurrent appenders do not interleave a line
    f.write_all(line.as_bytes())
        .with_context(|| format!("append to ledger {}", ledger.display()))?;
    Ok(())
}

/// Last recorded checksum for `path`, if any
pub fn lookup_md5(path: &Path) -> Result<Option<String>> {
    let ledger = ledger_path(path)?;
    let f = match File::open(&ledger) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("open ledger {}", ledger.display())),
    };
    let target = path.display().to_string();
    let mut found = None;
    for line in BufReader::new(f).split(b'\n') {
        let line = line.with_context(|| format!("read ledger {}", ledger.display()))?;
        if let Some(md5) = find_entry(&line, target.as_bytes()) {
            found = Some(md5);
        }
    }
    Ok(found)
}

// First `<target> <md5>` occurrence in one ledger line
fn find_entry(line: &[u8], target: &[u8]) -> Option<String> {
    let need = target.len() + 1 + MD5_LEN;
    if line.len() < need {
        return None;
    }
    (0..=line.len() - need).find_map(|i| {
        if &line[i..i + target.len()] != target || line[i + target.len()] != b' ' {
            return None;
        }
        let md5 = &line[i + target.len() + 1..i + need];
        if md5.iter().all(u8::is_ascii_hexdigit) {
            std::str::from_utf8(md5).ok().map(str::to_string)
        } else {
            None
        }
    })
}

pub fn is_md5_hex(s: &str) -> bool {
    s.len() == MD5_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Stream a file through MD5 and return the lowercase hex digest
pub fn file_md5(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// True when the file's MD5 matches `expected` (case-insensitive)
pub fn check_md5(path: &Path, expected: &str) -> Result<bool> {
    Ok(file_md5(path)?.eq_ignore_ascii_case(expected))
}
