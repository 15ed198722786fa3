//! Receive path: socket bytes into the ring, complete messages out of it.

use anyhow::{bail, Result};
use tracing::debug;

use crate::conn::ConnHandle;
use crate::handler;
use crate::net::{self, RecvOutcome};
use crate::protocol::HEADER_LEN;
use crate::protocol_core::{peek_message_len, validate_message_len, Message};
use crate::ring::Ring;
use crate::worker::WorkerContext;

/// Lift the next complete message off the front of `ring`. `None` means the
/// ring holds only part of one. An oversized length is an error before any
/// payload is looked at.
pub fn next_message(ring: &mut Ring) -> Result<Option<Message>> {
    if ring.data_size() < HEADER_LEN {
        return Ok(None);
    }
    let mut prefix = [0u8; 4];
    ring.peek(&mut prefix);
    let Some(len) = peek_message_len(&prefix) else {
        return Ok(None);
    };
    validate_message_len(len)?;
    if len > ring.capacity() {
        bail!("message of {} bytes can never fit a {} byte ring", len, ring.capacity());
    }
    if ring.data_size() < len {
        return Ok(None);
    }
    let mut buf = vec![0u8; len];
    ring.read(&mut buf);
    Message::decode(&buf).map(Some)
}

/// Readable event: one receive, then every complete message in arrival order
pub fn on_readable(ctx: &mut WorkerContext, h: ConnHandle) -> Result<()> {
    let outcome = ctx.gateway().table.with(h, |c| -> Result<RecvOutcome> {
        c.recv.compact();
        let fd = c.fd();
        let spare = c.recv.spare_tail_mut();
        if spare.is_empty() {
            bail!("receive ring of fd {} is full", fd);
        }
        let outcome = net::recv_some(fd, spare)?;
        if let RecvOutcome::Data(n) = outcome {
            c.recv.commit(n);
        }
        Ok(outcome)
    });
    match outcome {
        None => return Ok(()),
        Some(r) => match r? {
            RecvOutcome::Data(_) => {}
            RecvOutcome::WouldBlock => return Ok(()),
            RecvOutcome::Closed => {
                debug!(fd = h.fd, "peer closed");
                ctx.close_connection(h);
                return Ok(());
            }
        },
    }

    loop {
        let next = ctx.gateway().table.with(h, |c| next_message(&mut c.recv));
        let msg = match next {
            Some(r) => match r? {
                Some(m) => m,
                None => return Ok(()),
            },
            None => return Ok(()),
        };
        handler::deal_message(ctx, h, msg)?;
        if !ctx.gateway().table.is_live(h) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{command, MAX_MESSAGE_LEN};
    use crate::protocol_core::MsgHeader;

    fn message(cmd: u32, payload: &[u8]) -> Vec<u8> {
        let header = MsgHeader {
            command: cmd,
            trans_id: 9,
            ..MsgHeader::default()
        };
        Message::new(header, payload.to_vec()).encode()
    }

    #[test]
    fn waits_for_whole_messages() {
        let mut ring = Ring::new(8192).unwrap();
        let a = message(command::UPLOAD_DATA_REQ, b"abcde");
        let b = message(command::UPLOAD_FINISH_REQ, &[]);
        ring.write(&a[..30]);
        assert!(next_message(&mut ring).unwrap().is_none());
        ring.write(&a[30..]);
        ring.write(&b[..HEADER_LEN - 1]);

        let first = next_message(&mut ring).unwrap().unwrap();
        assert_eq!(first.header.command, command::UPLOAD_DATA_REQ);
        assert_eq!(first.header.length as usize, HEADER_LEN + 5);
        assert_eq!(first.payload, b"abcde");
        assert!(next_message(&mut ring).unwrap().is_none());

        ring.write(&b[HEADER_LEN - 1..]);
        let second = next_message(&mut ring).unwrap().unwrap();
        assert_eq!(second.header.command, command::UPLOAD_FINISH_REQ);
        assert!(second.payload.is_empty());
        assert!(ring.is_empty());
    }

    #[test]
    fn oversized_length_is_rejected_from_the_header_alone() {
        let mut ring = Ring::new(8192).unwrap();
        let mut raw = message(command::HEARTBEAT_REQ, &[]);
        raw[0..4].copy_from_slice(&((MAX_MESSAGE_LEN + 1) as u32).to_be_bytes());
        ring.write(&raw);
        assert!(next_message(&mut ring).is_err());

        let mut ring = Ring::new(8192).unwrap();
        let mut raw = message(command::HEARTBEAT_REQ, &[]);
        raw[0..4].copy_from_slice(&16u32.to_be_bytes());
        ring.write(&raw);
        assert!(next_message(&mut ring).is_err());
    }

    #[test]
    fn decoding_once_preserves_every_field() {
        let header = MsgHeader {
            length: 0,
            major: 1,
            minor: 2,
            src_type: 1,
            dst_type: 3,
            src_id: 0x1122_3344,
            dst_id: 0x5566_7788,
            trans_id: u64::MAX - 1,
            sequence: 42,
            command: command::DOWNLOAD_DATA_REQ,
            ack_code: 200,
            total: 1 << 40,
            offset: 12345,
            count: 4096,
        };
        let mut ring = Ring::new(8192).unwrap();
        ring.write(&Message::new(header, vec![1, 2, 3]).encode());
        let got = next_message(&mut ring).unwrap().unwrap();
        assert_eq!(got.header, MsgHeader { length: HEADER_LEN as u32 + 3, ..header });
        assert_eq!(got.payload, vec![1, 2, 3]);
    }
}
