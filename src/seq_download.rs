//! Whole-file streaming driven by writable events.
//!
//! The first writable event queues a 40-byte preamble (total length, then the
//! recorded checksum) in the send ring. Later events drain the ring with the
//! "more data follows" hint and then hand the file to `sendfile` until the
//! socket would block or the file is exhausted.

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::checksum;
use crate::conn::{ConnHandle, Connection, SendState};
use crate::net::{self, SendfileOutcome};
use crate::protocol::MD5_LEN;
use crate::worker::WorkerContext;

/// Length prefix plus checksum
pub const PREAMBLE_LEN: usize = 8 + MD5_LEN;

pub fn preamble(size: u64, md5: &str) -> Result<[u8; PREAMBLE_LEN]> {
    if md5.len() != MD5_LEN {
        bail!("checksum {:?} is not {} characters", md5, MD5_LEN);
    }
    let mut out = [0u8; PREAMBLE_LEN];
    out[..8].copy_from_slice(&(PREAMBLE_LEN as u64 + size).to_be_bytes());
    out[8..].copy_from_slice(md5.as_bytes());
    Ok(out)
}

enum Progress {
    Blocked,
    Finished,
}

fn drain_preamble(c: &mut Connection) -> Result<bool> {
    let fd = c.fd();
    while !c.send.is_empty() {
        let n = net::send_some(fd, c.send.readable_chunk(), true)?;
        if n == 0 {
            return Ok(false);
        }
        c.send.consume(n);
    }
    Ok(true)
}

fn step(c: &mut Connection) -> Result<Progress> {
    let fd = c.fd();
    loop {
        let state = c
            .backends
            .first()
            .map(|b| b.send_state)
            .context("sequential download without an open file")?;
        match state {
            SendState::NeedHeader => {
                let b = &c.backends[0];
                let md5 = checksum::lookup_md5(&b.path)?
                    .with_context(|| format!("no recorded checksum for {}", b.path.display()))?;
                let pre = preamble(b.size, &md5)?;
                if c.send.write(&pre) != pre.len() {
                    bail!("no room for the download preamble on fd {}", fd);
                }
                c.backends[0].send_state = SendState::Streaming;
            }
            SendState::Streaming => {
                if !drain_preamble(c)? {
                    return Ok(Progress::Blocked);
                }
                let b = &mut c.backends[0];
                if b.remaining == 0 {
                    b.send_state = SendState::Done;
                    continue;
                }
                let file = b.file.as_ref().context("sequential file already closed")?;
                match net::sendfile_chunk(fd, file, b.done, b.remaining)? {
                    SendfileOutcome::Sent(n) => {
                        b.done += n as u64;
                        b.remaining = b.remaining.saturating_sub(n as u64);
                    }
                    SendfileOutcome::WouldBlock => return Ok(Progress::Blocked),
                }
            }
            SendState::Done => {
                debug!(fd, sent = c.backends[0].done, "sequential file sent");
                c.close_backends();
                return Ok(Progress::Finished);
            }
        }
    }
}

/// Writable event on a connection in streaming mode
pub fn on_writable(ctx: &mut WorkerContext, h: ConnHandle) -> Result<()> {
    let progress = ctx
        .gateway()
        .table
        .with(h, step)
        .with_context(|| format!("fd {} is gone", h.fd))??;
    if let Progress::Finished = progress {
        ctx.poller.start_recv(h.fd)?;
        ctx.poller.stop_send(h.fd)?;
        info!(fd = h.fd, "sequential download complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_counts_itself() {
        let md5 = "0123456789abcdef0123456789abcdef";
        let p = preamble(1000, md5).unwrap();
        assert_eq!(u64::from_be_bytes(p[..8].try_into().unwrap()), 1040);
        assert_eq!(&p[8..], md5.as_bytes());
        assert!(preamble(1, "short").is_err());
    }
}
