//! Connection records, the descriptor-indexed connection table and the
//! per-worker proxy registry.
//!
//! The table is indexed by descriptor value, but every lookup goes through a
//! [`ConnHandle`] carrying the slot generation. A handle taken before a
//! descriptor was closed and reused by the kernel no longer matches, so a
//! late event for the old connection cannot touch the new one.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::ring::Ring;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnStatus {
    Idle,
    Connecting,
    Connected,
    Closing,
}

/// Progress of the sequential download preamble and body
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendState {
    #[default]
    NeedHeader,
    Streaming,
    Done,
}

/// Where a connection stands in the upload exchange
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadState {
    #[default]
    Idle,
    Receiving {
        remaining: u64,
    },
    AwaitingFinish,
}

/// One replica of the logical file a connection is working on
#[derive(Debug)]
pub struct BackendFile {
    /// Backend root this replica lives under
    pub root: PathBuf,
    pub path: PathBuf,
    pub file: Option<File>,
    pub md5: String,
    pub size: u64,
    pub remaining: u64,
    pub done: u64,
    pub send_state: SendState,
}

impl BackendFile {
    pub fn new(root: PathBuf, path: PathBuf) -> Self {
        Self {
            root,
            path,
            file: None,
            md5: String::new(),
            size: 0,
            remaining: 0,
            done: 0,
            send_state: SendState::NeedHeader,
        }
    }
}

pub struct Connection {
    socket: OwnedFd,
    pub status: ConnStatus,
    /// Worker that services this connection; `None` until handed off
    pub owner: Option<usize>,
    pub peer: SocketAddrV4,
    pub peer_type: u8,
    pub peer_id: u32,
    pub trans_id: u64,
    pub sequence: u64,
    pub recv: Ring,
    pub send: Ring,
    pub backends: Vec<BackendFile>,
    /// Raw streaming mode (no framing on the send side)
    pub sequential: bool,
    pub upload: UploadState,
}

impl Connection {
    pub fn new(socket: impl Into<OwnedFd>, peer: SocketAddrV4, ring_size: usize) -> Result<Self> {
        Ok(Self {
            socket: socket.into(),
            status: ConnStatus::Connected,
            owner: None,
            peer,
            peer_type: 0,
            peer_id: 0,
            trans_id: 0,
            sequence: 0,
            recv: Ring::new(ring_size)?,
            send: Ring::new(ring_size)?,
            backends: Vec::new(),
            sequential: false,
            upload: UploadState::Idle,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Drop every open replica handle and forget the per-file state
    pub fn close_backends(&mut self) {
        self.backends.clear();
        self.sequential = false;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("status", &self.status)
            .field("owner", &self.owner)
            .field("peer", &self.peer)
            .field("peer_type", &self.peer_type)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Generation-checked reference to a table slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    pub fd: RawFd,
    pub generation: u32,
}

impl ConnHandle {
    /// Poller token: generation in the high half, descriptor in the low half
    pub fn token(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.fd as u32 as u64)
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    conn: Option<Box<Connection>>,
}

pub struct ConnTable {
    slots: Box<[Mutex<Slot>]>,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(Slot::default())).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, fd: RawFd) -> Option<&Mutex<Slot>> {
        usize::try_from(fd).ok().and_then(|i| self.slots.get(i))
    }

    /// Store a fresh record. A descriptor beyond the table bound is rejected
    /// and closed when `conn` is dropped.
    pub fn install(&self, conn: Connection) -> Result<ConnHandle> {
        let fd = conn.fd();
        let Some(slot) = self.slot(fd) else {
            bail!("fd {} exceeds connection table capacity {}", fd, self.capacity());
        };
        let mut slot = slot.lock();
        if slot.conn.is_some() {
            bail!("fd {} already has a live connection record", fd);
        }
        // Generation 0 tags the listener and handoff pipe tokens
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.conn = Some(Box::new(conn));
        Ok(ConnHandle {
            fd,
            generation: slot.generation,
        })
    }

    /// Handle of whatever currently lives at `fd`
    pub fn handle_of(&self, fd: RawFd) -> Option<ConnHandle> {
        let slot = self.slot(fd)?.lock();
        slot.conn.as_ref().map(|_| ConnHandle {
            fd,
            generation: slot.generation,
        })
    }

    pub fn is_live(&self, h: ConnHandle) -> bool {
        self.with(h, |_| ()).is_some()
    }

    /// Run `f` on the record if the handle is still current
    pub fn with<R>(&self, h: ConnHandle, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut slot = self.slot(h.fd)?.lock();
        if slot.generation != h.generation {
            return None;
        }
        slot.conn.as_deref_mut().map(f)
    }

    /// Remove the record. The slot is empty before the caller drops (and so
    /// closes) the returned connection, so a reused descriptor finds it clear.
    pub fn take(&self, h: ConnHandle) -> Option<Box<Connection>> {
        let mut slot = self.slot(h.fd)?.lock();
        if slot.generation != h.generation {
            return None;
        }
        slot.conn.take()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().conn.is_some()).count()
    }
}

/// Process-wide counters; each worker only writes its own concurrency slot
pub struct Stats {
    pub accepts: AtomicU64,
    pub connections: AtomicI64,
    concurrents: Vec<AtomicI64>,
}

impl Stats {
    pub fn new(workers: usize) -> Self {
        Self {
            accepts: AtomicU64::new(0),
            connections: AtomicI64::new(0),
            concurrents: (0..workers).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    pub fn record_accept(&self) {
        self.accepts.fetch_add(1, Ordering::Relaxed);
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Outbound connections count as live but not as accepted
    pub fn record_open(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn worker_bound(&self, worker: usize) {
        if let Some(c) = self.concurrents.get(worker) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn worker_released(&self, worker: usize) {
        if let Some(c) = self.concurrents.get(worker) {
            c.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn concurrent(&self, worker: usize) -> i64 {
        self.concurrents
            .get(worker)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn accepts(&self) -> u64 {
        self.accepts.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Two connections relaying each other's traffic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProxyLink {
    pub a: ConnHandle,
    pub b: ConnHandle,
}

impl ProxyLink {
    pub fn other(&self, h: ConnHandle) -> Option<ConnHandle> {
        if h == self.a {
            Some(self.b)
        } else if h == self.b {
            Some(self.a)
        } else {
            None
        }
    }
}

/// Proxy pairs of one worker. Both directions are stored together and removed
/// together, so one side can never point at a partner that forgot it.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    partners: HashMap<ConnHandle, ConnHandle>,
}

impl ProxyRegistry {
    pub fn link(&mut self, a: ConnHandle, b: ConnHandle) -> Result<ProxyLink> {
        if a == b {
            bail!("cannot proxy fd {} to itself", a.fd);
        }
        if self.partners.contains_key(&a) || self.partners.contains_key(&b) {
            bail!("fd {} or fd {} is already proxied", a.fd, b.fd);
        }
        self.partners.insert(a, b);
        self.partners.insert(b, a);
        Ok(ProxyLink { a, b })
    }

    pub fn partner(&self, h: ConnHandle) -> Option<ConnHandle> {
        self.partners.get(&h).copied()
    }

    pub fn is_proxied(&self, h: ConnHandle) -> bool {
        self.partners.contains_key(&h)
    }

    /// Dissolve the pair containing `h`, both sides at once
    pub fn unlink(&mut self, h: ConnHandle) -> Option<ProxyLink> {
        let other = self.partners.remove(&h)?;
        self.partners.remove(&other);
        Some(ProxyLink { a: h, b: other })
    }

    pub fn len(&self) -> usize {
        self.partners.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.partners.is_empty()
    }
}

pub fn unspecified_peer() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn conn() -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::new(a, unspecified_peer(), 4096).unwrap(), b)
    }

    #[test]
    fn install_lookup_and_take() {
        let table = ConnTable::new(4096);
        let (c, _peer) = conn();
        let fd = c.fd();
        let h = table.install(c).unwrap();
        assert_eq!(h.fd, fd);
        assert_eq!(table.handle_of(fd), Some(h));
        assert_eq!(table.with(h, |c| c.status), Some(ConnStatus::Connected));

        let taken = table.take(h).unwrap();
        assert!(table.handle_of(fd).is_none());
        assert!(table.with(h, |_| ()).is_none());
        assert!(table.take(h).is_none());
        drop(taken);
    }

    #[test]
    fn stale_handle_misses_reused_descriptor() {
        let table = ConnTable::new(4096);
        let (c, _peer) = conn();
        let old = table.install(c).unwrap();
        let taken = table.take(old).unwrap();
        // Same descriptor number comes back from the kernel
        drop(taken);
        let (c2, _peer2) = conn();
        let fresh = table.install(c2).unwrap();
        if fresh.fd == old.fd {
            assert_ne!(fresh.generation, old.generation);
            assert_ne!(fresh.token(), old.token());
        }
        assert!(table.with(old, |_| ()).is_none());
        assert!(table.is_live(fresh));
    }

    #[test]
    fn rejects_descriptor_beyond_capacity() {
        let table = ConnTable::new(1);
        let (c, _peer) = conn();
        assert!(table.install(c).is_err());
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn unlink_clears_both_sides() {
        let a = ConnHandle { fd: 10, generation: 1 };
        let b = ConnHandle { fd: 11, generation: 4 };
        let c = ConnHandle { fd: 12, generation: 1 };
        let mut reg = ProxyRegistry::default();
        let link = reg.link(a, b).unwrap();
        assert_eq!(link.other(a), Some(b));
        assert_eq!(reg.partner(b), Some(a));
        assert!(reg.link(a, c).is_err());
        assert!(reg.link(c, c).is_err());

        // Tearing down either side leaves nothing pointing at the other
        let gone = reg.unlink(b).unwrap();
        assert_eq!(gone.other(b), Some(a));
        assert!(reg.partner(a).is_none());
        assert!(reg.partner(b).is_none());
        assert!(reg.is_empty());
        assert!(reg.unlink(a).is_none());
    }

    #[test]
    fn stats_track_per_worker() {
        let stats = Stats::new(2);
        stats.record_accept();
        stats.worker_bound(1);
        stats.worker_bound(1);
        stats.worker_released(1);
        stats.worker_bound(7);
        assert_eq!(stats.accepts(), 1);
        assert_eq!(stats.connections(), 1);
        assert_eq!(stats.concurrent(1), 1);
        assert_eq!(stats.concurrent(0), 0);
        stats.record_close();
        assert_eq!(stats.connections(), 0);
    }
}
