//! Message codec shared by the reactor, the dispatcher and the tests
//!
//! Everything on the wire is big-endian. Decoding happens exactly once when a
//! complete message is lifted out of the receive ring, encoding exactly once
//! when a response or relayed message is pushed into a send ring.

use anyhow::{bail, Context, Result};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};

use crate::protocol::{HEADER_LEN, MAX_MESSAGE_LEN, MAX_NAME_LEN, MD5_LEN, TASK_INFO_LEN};

/// Fixed 64-byte message header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgHeader {
    pub length: u32,
    pub major: u8,
    pub minor: u8,
    pub src_type: u8,
    pub dst_type: u8,
    pub src_id: u32,
    pub dst_id: u32,
    pub trans_id: u64,
    pub sequence: u64,
    pub command: u32,
    pub ack_code: u32,
    pub total: u64,
    pub offset: u64,
    pub count: u32,
}

impl MsgHeader {
    /// Serialize into the 64-byte wire form
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0..4].copy_from_slice(&self.length.to_be_bytes());
        b[4] = self.major;
        b[5] = self.minor;
        b[6] = self.src_type;
        b[7] = self.dst_type;
        b[8..12].copy_from_slice(&self.src_id.to_be_bytes());
        b[12..16].copy_from_slice(&self.dst_id.to_be_bytes());
        b[16..24].copy_from_slice(&self.trans_id.to_be_bytes());
        b[24..32].copy_from_slice(&self.sequence.to_be_bytes());
        b[32..36].copy_from_slice(&self.command.to_be_bytes());
        b[36..40].copy_from_slice(&self.ack_code.to_be_bytes());
        b[40..48].copy_from_slice(&self.total.to_be_bytes());
        b[48..56].copy_from_slice(&self.offset.to_be_bytes());
        b[56..60].copy_from_slice(&self.count.to_be_bytes());
        // 60..64 padding stays zero
        b
    }

    /// Parse a header from at least 64 bytes of wire data
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            bail!("short header: {} bytes (need {})", buf.len(), HEADER_LEN);
        }
        Ok(Self {
            length: be_u32(buf, 0),
            major: buf[4],
            minor: buf[5],
            src_type: buf[6],
            dst_type: buf[7],
            src_id: be_u32(buf, 8),
            dst_id: be_u32(buf, 12),
            trans_id: be_u64(buf, 16),
            sequence: be_u64(buf, 24),
            command: be_u32(buf, 32),
            ack_code: be_u32(buf, 36),
            total: be_u64(buf, 40),
            offset: be_u64(buf, 48),
            count: be_u32(buf, 56),
        })
    }
}

/// Read the declared total length from the first four header bytes
pub fn peek_message_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    Some(be_u32(buf, 0) as usize)
}

/// Validate a declared message length before any payload is touched
pub fn validate_message_len(len: usize) -> Result<()> {
    if len > MAX_MESSAGE_LEN {
        bail!("message too large: {} bytes (max: {})", len, MAX_MESSAGE_LEN);
    }
    if len < HEADER_LEN {
        bail!("message shorter than its header: {} bytes", len);
    }
    Ok(())
}

/// A decoded message: header plus raw payload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub header: MsgHeader,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(header: MsgHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Decode a complete wire message (header + payload)
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = MsgHeader::decode(buf)?;
        let len = header.length as usize;
        validate_message_len(len)?;
        if buf.len() < len {
            bail!("truncated message: have {} bytes, header says {}", buf.len(), len);
        }
        Ok(Self {
            header,
            payload: buf[HEADER_LEN..len].to_vec(),
        })
    }

    /// Encode to wire bytes; `length` is recomputed from the payload
    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header;
        header.length = self.wire_len() as u32;
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Task descriptor carried by start/delete/list/seq-download requests
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub operation: u16,
    pub region_id: u16,
    pub site_id: u32,
    pub app_id: u32,
    pub timestamp: u32,
    pub sgw_port: u16,
    pub proxy_port: u16,
    pub sgw_ip: Ipv4Addr,
    pub proxy_ip: Ipv4Addr,
    pub sgw_id: u32,
    pub proxy_id: u32,
    pub file_len: u64,
    pub file_md5: String,
    pub file_name: String,
    pub metadata: Vec<u8>,
}

impl Default for TaskInfo {
    fn default() -> Self {
        Self {
            operation: 0,
            region_id: 0,
            site_id: 0,
            app_id: 0,
            timestamp: 0,
            sgw_port: 0,
            proxy_port: 0,
            sgw_ip: Ipv4Addr::UNSPECIFIED,
            proxy_ip: Ipv4Addr::UNSPECIFIED,
            sgw_id: 0,
            proxy_id: 0,
            file_len: 0,
            file_md5: String::new(),
            file_name: String::new(),
            metadata: Vec::new(),
        }
    }
}

// Field offsets inside the fixed part
const MD5_OFF: usize = 48;
const NAME_OFF: usize = MD5_OFF + MD5_LEN + 1;
const META_LEN_OFF: usize = 340;

impl TaskInfo {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < TASK_INFO_LEN {
            bail!(
                "task descriptor too short: {} bytes (need {})",
                payload.len(),
                TASK_INFO_LEN
            );
        }
        let metadata_len = be_u32(payload, META_LEN_OFF) as usize;
        let meta_end = TASK_INFO_LEN
            .checked_add(metadata_len)
            .filter(|end| *end <= payload.len())
            .with_context(|| {
                format!(
                    "task metadata truncated: {} declared, {} available",
                    metadata_len,
                    payload.len() - TASK_INFO_LEN
                )
            })?;
        Ok(Self {
            operation: be_u16(payload, 0),
            region_id: be_u16(payload, 2),
            site_id: be_u32(payload, 4),
            app_id: be_u32(payload, 8),
            timestamp: be_u32(payload, 12),
            sgw_port: be_u16(payload, 16),
            proxy_port: be_u16(payload, 18),
            sgw_ip: ipv4_at(payload, 20),
            proxy_ip: ipv4_at(payload, 24),
            sgw_id: be_u32(payload, 28),
            proxy_id: be_u32(payload, 32),
            file_len: be_u64(payload, 40),
            file_md5: c_string(&payload[MD5_OFF..MD5_OFF + MD5_LEN + 1])
                .context("file_md5 is not valid UTF-8")?,
            file_name: c_string(&payload[NAME_OFF..NAME_OFF + MAX_NAME_LEN + 1])
                .context("file_name is not valid UTF-8")?,
            metadata: payload[TASK_INFO_LEN..meta_end].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; TASK_INFO_LEN + self.metadata.len()];
        b[0..2].copy_from_slice(&self.operation.to_be_bytes());
        b[2..4].copy_from_slice(&self.region_id.to_be_bytes());
        b[4..8].copy_from_slice(&self.site_id.to_be_bytes());
        b[8..12].copy_from_slice(&self.app_id.to_be_bytes());
        b[12..16].copy_from_slice(&self.timestamp.to_be_bytes());
        b[16..18].copy_from_slice(&self.sgw_port.to_be_bytes());
        b[18..20].copy_from_slice(&self.proxy_port.to_be_bytes());
        b[20..24].copy_from_slice(&self.sgw_ip.octets());
        b[24..28].copy_from_slice(&self.proxy_ip.octets());
        b[28..32].copy_from_slice(&self.sgw_id.to_be_bytes());
        b[32..36].copy_from_slice(&self.proxy_id.to_be_bytes());
        b[40..48].copy_from_slice(&self.file_len.to_be_bytes());
        put_c_string(&mut b[MD5_OFF..MD5_OFF + MD5_LEN + 1], &self.file_md5);
        put_c_string(&mut b[NAME_OFF..NAME_OFF + MAX_NAME_LEN + 1], &self.file_name);
        b[META_LEN_OFF..META_LEN_OFF + 4]
            .copy_from_slice(&(self.metadata.len() as u32).to_be_bytes());
        b[TASK_INFO_LEN..].copy_from_slice(&self.metadata);
        b
    }

    /// True when the declared checksum is exactly 32 characters
    pub fn has_valid_md5(&self) -> bool {
        self.file_md5.len() == MD5_LEN
    }
}

/// One endpoint pair inside a migration request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

/// MIGRATION_START payload: old/new gateway and metadata-server endpoints
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    pub old_sgw: Endpoint,
    pub new_sgw: Endpoint,
    pub old_mds: Endpoint,
    pub new_mds: Endpoint,
}

const MIG_IP_LEN: usize = 64;
const MIG_ENTRY_LEN: usize = MIG_IP_LEN + 2;

impl MigrationOptions {
    pub const WIRE_LEN: usize = 4 * MIG_ENTRY_LEN;

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::WIRE_LEN {
            bail!(
                "migration options too short: {} bytes (need {})",
                payload.len(),
                Self::WIRE_LEN
            );
        }
        let entry = |i: usize| -> Result<Endpoint> {
            let base = i * MIG_ENTRY_LEN;
            Ok(Endpoint {
                ip: c_string(&payload[base..base + MIG_IP_LEN])
                    .context("migration address is not valid UTF-8")?,
                port: be_u16(payload, base + MIG_IP_LEN),
            })
        };
        Ok(Self {
            old_sgw: entry(0)?,
            new_sgw: entry(1)?,
            old_mds: entry(2)?,
            new_mds: entry(3)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; Self::WIRE_LEN];
        for (i, ep) in [&self.old_sgw, &self.new_sgw, &self.old_mds, &self.new_mds]
            .into_iter()
            .enumerate()
        {
            let base = i * MIG_ENTRY_LEN;
            put_c_string(&mut b[base..base + MIG_IP_LEN], &ep.ip);
            b[base + MIG_IP_LEN..base + MIG_ENTRY_LEN].copy_from_slice(&ep.port.to_be_bytes());
        }
        b
    }
}

/// Map a logical file name onto a backend root.
/// Rejects NUL bytes, parent-directory components and empty names; a leading
/// `/` is treated as relative to the root.
pub fn replica_path(root: &Path, name: &str) -> Result<PathBuf> {
    if name.contains('\0') {
        bail!("path contains NUL byte");
    }
    let mut safe = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::CurDir | Component::RootDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty file name");
    }
    Ok(root.join(safe))
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be_u64(b: &[u8], at: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[at..at + 8]);
    u64::from_be_bytes(v)
}

fn ipv4_at(b: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(b[at], b[at + 1], b[at + 2], b[at + 3])
}

fn c_string(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    Ok(std::str::from_utf8(&field[..end])?.to_string())
}

// Always leaves room for the terminating NUL
fn put_c_string(field: &mut [u8], s: &str) {
    let n = s.len().min(field.len().saturating_sub(1));
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{command, MAX_MSG_DATA_LEN};
    use tempfile::TempDir;

    fn sample_header() -> MsgHeader {
        MsgHeader {
            length: 64 + 3,
            major: 1,
            minor: 2,
            src_type: 1,
            dst_type: 3,
            src_id: 0x9000_0001,
            dst_id: 0x8000_0002,
            trans_id: 0x0102_0304_0506_0708,
            sequence: u64::MAX - 1,
            command: command::DOWNLOAD_DATA_REQ,
            ack_code: 200,
            total: 1 << 40,
            offset: 12345,
            count: 0xfeed,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let h = sample_header();
        let wire = h.encode();
        assert_eq!(MsgHeader::decode(&wire).unwrap(), h);
        // Re-encoding a decoded header is the identity on the wire bytes
        assert_eq!(MsgHeader::decode(&wire).unwrap().encode(), wire);
    }

    #[test]
    fn test_header_is_big_endian() {
        let wire = sample_header().encode();
        assert_eq!(&wire[0..4], &[0, 0, 0, 67]);
        assert_eq!(&wire[32..36], &[0x00, 0x02, 0x00, 0x09]);
        assert_eq!(&wire[60..64], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_oversized_message_rejected() {
        assert!(validate_message_len(MAX_MSG_DATA_LEN + HEADER_LEN).is_ok());
        assert!(validate_message_len(MAX_MSG_DATA_LEN + HEADER_LEN + 1).is_err());
        assert!(validate_message_len(HEADER_LEN - 1).is_err());

        let mut h = sample_header();
        h.length = (MAX_MESSAGE_LEN + 1) as u32;
        // Only the header is present: rejection must not need the payload
        assert!(Message::decode(&h.encode()).is_err());
    }

    #[test]
    fn test_message_encode_sets_length() {
        let mut h = sample_header();
        h.length = 0;
        let m = Message::new(h, b"abc".to_vec());
        let wire = m.encode();
        assert_eq!(wire.len(), 67);
        let back = Message::decode(&wire).unwrap();
        assert_eq!(back.header.length, 67);
        assert_eq!(back.payload, b"abc");
    }

    #[test]
    fn test_task_info_round_trip() {
        let t = TaskInfo {
            operation: 7,
            region_id: 10001,
            site_id: 3,
            app_id: 4,
            timestamp: 1_700_000_000,
            sgw_port: 7788,
            proxy_port: 7789,
            sgw_ip: Ipv4Addr::new(192, 168, 66, 80),
            proxy_ip: Ipv4Addr::new(10, 0, 0, 1),
            sgw_id: 0x9000_0001,
            proxy_id: 0x9000_0002,
            file_len: 10,
            file_md5: "0123456789abcdef0123456789abcdef".into(),
            file_name: "a/b.dat".into(),
            metadata: b"meta".to_vec(),
        };
        let wire = t.encode();
        assert_eq!(wire.len(), TASK_INFO_LEN + 4);
        assert_eq!(&wire[20..24], &[192, 168, 66, 80]);
        let back = TaskInfo::decode(&wire).unwrap();
        assert_eq!(back, t);
        assert!(back.has_valid_md5());
    }

    #[test]
    fn test_task_info_rejects_short_payload() {
        assert!(TaskInfo::decode(&[0u8; TASK_INFO_LEN - 1]).is_err());
        let mut wire = TaskInfo::default().encode();
        wire[META_LEN_OFF + 3] = 9; // claims 9 bytes of metadata that are not there
        assert!(TaskInfo::decode(&wire).is_err());
    }

    #[test]
    fn test_migration_options_decode() {
        let opts = MigrationOptions {
            old_sgw: Endpoint { ip: "10.0.0.1".into(), port: 7788 },
            new_sgw: Endpoint { ip: "10.0.0.2".into(), port: 7789 },
            old_mds: Endpoint { ip: "10.0.0.3".into(), port: 8000 },
            new_mds: Endpoint { ip: "10.0.0.4".into(), port: 8001 },
        };
        let wire = opts.encode();
        assert_eq!(wire.len(), MigrationOptions::WIRE_LEN);
        assert_eq!(MigrationOptions::decode(&wire).unwrap(), opts);
    }

    #[test]
    fn test_replica_path_safe_names() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let p = replica_path(root, "a/b.dat").unwrap();
        assert_eq!(p, root.join("a/b.dat"));
        // Leading slash does not escape the root
        let p = replica_path(root, "/study/1.dcm").unwrap();
        assert_eq!(p, root.join("study/1.dcm"));
        let p = replica_path(root, "./x/./y").unwrap();
        assert_eq!(p, root.join("x/y"));
    }

    #[test]
    fn test_replica_path_unsafe_names() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        assert!(replica_path(root, "../etc/passwd").is_err());
        assert!(replica_path(root, "a/../../etc/passwd").is_err());
        assert!(replica_path(root, "file\0.txt").is_err());
        assert!(replica_path(root, "").is_err());
        assert!(replica_path(root, "/").is_err());
    }
}
