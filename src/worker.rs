//! Per-thread reactor state and the loop that drives it.
//!
//! The listener thread and every worker run the same loop: wait on their own
//! poller for at most one tick, service ready descriptors, then advance their
//! own timer wheel. Accepted sockets reach workers through one pipe per
//! worker; the pipe write is the only hand-over of a connection between
//! threads.

use anyhow::{bail, Context, Result};
use std::net::{SocketAddrV4, TcpListener};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::conn::{ConnHandle, ConnTable, Connection, ProxyRegistry, Stats};
use crate::migration::{MigrationGate, MigrationLauncher};
use crate::net;
use crate::poll::{self, Event, Poller};
use crate::protocol::limits::MAX_EVENTS;
use crate::protocol_core::Message;
use crate::timer::TimerWheel;
use crate::{framing, seq_download};

/// Process-wide state shared by every thread
pub struct Gateway {
    pub settings: Settings,
    pub table: ConnTable,
    pub stats: Stats,
    pub migration: MigrationGate,
    pub launcher: Box<dyn MigrationLauncher>,
    shutdown: AtomicBool,
}

impl Gateway {
    pub fn new(settings: Settings, launcher: Box<dyn MigrationLauncher>) -> Arc<Self> {
        // Slot 0 belongs to the listener thread
        let stats = Stats::new(settings.workers + 1);
        let table = ConnTable::new(settings.max_conns);
        Arc::new(Self {
            settings,
            table,
            stats,
            migration: MigrationGate::default(),
            launcher,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Log and terminate. Used where carrying on would leak descriptors.
pub fn fatal(reason: impl std::fmt::Display) -> ! {
    error!("fatal: {}", reason);
    std::process::exit(1)
}

// Listener and pipe registrations use generation 0, which no table slot ever has
fn internal_token(fd: RawFd) -> u64 {
    fd as u32 as u64
}

fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Dispatch {
    addr: SocketAddrV4,
    pipes: Vec<OwnedFd>,
    next: usize,
}

/// Everything one thread's handlers may touch
pub struct WorkerContext {
    id: usize,
    gateway: Arc<Gateway>,
    pub(crate) poller: Poller,
    pub(crate) proxies: ProxyRegistry,
    listener: Option<TcpListener>,
    dispatch: Option<Dispatch>,
    handoff: Option<OwnedFd>,
    /// Connection to the ASM, kept by the listener thread
    pub(crate) asm: Option<ConnHandle>,
    events: Vec<Event>,
}

impl WorkerContext {
    pub fn new(id: usize, gateway: Arc<Gateway>) -> Result<Self> {
        let poller = Poller::new(gateway.settings.max_conns, MAX_EVENTS)
            .with_context(|| format!("create poller for worker {}", id))?;
        Ok(Self {
            id,
            gateway,
            poller,
            proxies: ProxyRegistry::default(),
            listener: None,
            dispatch: None,
            handoff: None,
            asm: None,
            events: Vec::with_capacity(MAX_EVENTS),
        })
    }

    /// Make this context the acceptor, handing connections round-robin to
    /// the workers behind `pipes`
    pub fn with_listener(mut self, listener: TcpListener, pipes: Vec<OwnedFd>) -> Result<Self> {
        if pipes.is_empty() {
            bail!("listener needs at least one worker pipe");
        }
        let addr = match listener.local_addr().context("listener address")? {
            std::net::SocketAddr::V4(a) => a,
            other => bail!("listener bound to non-IPv4 address {}", other),
        };
        let fd = listener.as_raw_fd();
        self.poller.add(fd, internal_token(fd), poll::READABLE)?;
        info!(%addr, workers = pipes.len(), "listening");
        self.listener = Some(listener);
        self.dispatch = Some(Dispatch {
            addr,
            pipes,
            next: 0,
        });
        Ok(self)
    }

    /// Read handed-off descriptors from `reader`
    pub fn with_handoff(mut self, reader: OwnedFd) -> Result<Self> {
        let fd = reader.as_raw_fd();
        self.poller.add(fd, internal_token(fd), poll::READABLE)?;
        self.handoff = Some(reader);
        Ok(self)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn proxies(&self) -> &ProxyRegistry {
        &self.proxies
    }

    pub fn settings(&self) -> &Settings {
        &self.gateway.settings
    }

    /// Install a connection this thread created itself and start reading it
    pub fn adopt(&mut self, conn: Connection) -> Result<ConnHandle> {
        let h = self.gateway.table.install(conn)?;
        self.gateway.stats.record_open();
        if let Err(e) = self.bind(h) {
            self.close_connection(h);
            return Err(e);
        }
        Ok(h)
    }

    /// Blocking connect, then switch to non-blocking and adopt
    pub fn open_outbound(&mut self, peer: SocketAddrV4, peer_type: u8, peer_id: u32) -> Result<ConnHandle> {
        let stream = net::open_outbound(peer, None, false)?;
        net::set_nonblocking(stream.as_raw_fd(), true)?;
        let mut conn = Connection::new(stream, peer, self.gateway.settings.ring_size)?;
        conn.peer_type = peer_type;
        conn.peer_id = peer_id;
        let h = self.adopt(conn)?;
        debug!(fd = h.fd, %peer, peer_type, peer_id, "outbound connection open");
        Ok(h)
    }

    fn bind(&mut self, h: ConnHandle) -> Result<()> {
        let id = self.id;
        if self.gateway.table.with(h, |c| c.owner = Some(id)).is_none() {
            bail!("fd {} vanished before it was bound", h.fd);
        }
        self.gateway.stats.worker_bound(id);
        self.poller.add(h.fd, h.token(), poll::READABLE)
    }

    /// Wait up to `timeout_ms` and service whatever became ready
    pub fn turn(&mut self, timeout_ms: i32) -> Result<usize> {
        let mut events = std::mem::take(&mut self.events);
        let n = self.poller.wait(timeout_ms, &mut events)?;
        for ev in events.iter() {
            self.handle_event(*ev);
        }
        self.events = events;
        Ok(n)
    }

    fn handle_event(&mut self, ev: Event) {
        // Registration was dropped earlier in this batch
        if !self.poller.is_registered(ev.fd, ev.token) {
            return;
        }
        let generation = (ev.token >> 32) as u32;
        if generation == 0 {
            self.handle_internal(ev);
            return;
        }
        let h = ConnHandle {
            fd: ev.fd,
            generation,
        };
        match self.gateway.table.with(h, |c| c.owner) {
            Some(Some(owner)) if owner == self.id => {}
            _ => {
                // The descriptor may already belong to someone else: unhook, never close
                debug!(fd = ev.fd, worker = self.id, "dropping stale registration");
                self.poller.remove(ev.fd);
                return;
            }
        }

        if ev.writable() {
            if let Err(e) = self.on_writable(h) {
                error!(fd = h.fd, worker = self.id, "send failed: {:#}", e);
                self.close_connection(h);
                return;
            }
        }
        if ev.readable() {
            if let Err(e) = framing::on_readable(self, h) {
                error!(fd = h.fd, worker = self.id, "{:#}", e);
                self.close_connection(h);
            }
            return;
        }
        if (ev.is_error() || ev.hangup()) && !ev.writable() {
            debug!(fd = h.fd, events = ev.events, "error or hangup");
            self.close_connection(h);
        }
    }

    fn on_writable(&mut self, h: ConnHandle) -> Result<()> {
        let sequential = self.gateway.table.with(h, |c| c.sequential).unwrap_or(false);
        if sequential {
            seq_download::on_writable(self, h)
        } else {
            self.flush_send(h)
        }
    }

    fn handle_internal(&mut self, ev: Event) {
        let is_listener = self
            .listener
            .as_ref()
            .is_some_and(|l| l.as_raw_fd() == ev.fd);
        if is_listener {
            if ev.is_error() || ev.hangup() {
                self.recover_listener();
            } else {
                self.accept_pending();
            }
            return;
        }
        let is_pipe = self.handoff.as_ref().is_some_and(|p| p.as_raw_fd() == ev.fd);
        if is_pipe {
            self.read_handoffs();
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(l) => net::accept_inbound(l),
                None => return,
            };
            match accepted {
                Ok(Some((stream, peer))) => {
                    if let Err(e) = self.dispatch_accepted(stream, peer) {
                        warn!(%peer, "rejecting connection: {:#}", e);
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    error!("accept failed: {:#}", e);
                    return;
                }
            }
        }
    }

    fn dispatch_accepted(&mut self, stream: std::net::TcpStream, peer: SocketAddrV4) -> Result<()> {
        net::tune_socket(stream.as_raw_fd())?;
        let conn = Connection::new(stream, peer, self.gateway.settings.ring_size)?;
        let h = self.gateway.table.install(conn)?;
        self.gateway.stats.record_accept();
        let Some(dispatch) = self.dispatch.as_mut() else {
            bail!("no worker pipes configured");
        };
        let slot = dispatch.next % dispatch.pipes.len();
        dispatch.next = dispatch.next.wrapping_add(1);
        if let Err(e) = net::write_handoff(dispatch.pipes[slot].as_raw_fd(), h.fd) {
            fatal(format!("hand-off of fd {} to worker {}: {:#}", h.fd, slot + 1, e));
        }
        debug!(fd = h.fd, worker = slot + 1, %peer, "accepted");
        Ok(())
    }

    fn recover_listener(&mut self) {
        let Some(addr) = self.dispatch.as_ref().map(|d| d.addr) else {
            return;
        };
        warn!(%addr, "listening socket failed, recreating");
        if let Some(old) = self.listener.take() {
            self.poller.remove(old.as_raw_fd());
        }
        std::thread::sleep(Duration::from_secs(1));
        let listener = match net::bind_listener(addr) {
            Ok(l) => l,
            Err(e) => fatal(format!("cannot recreate listener on {}: {:#}", addr, e)),
        };
        let fd = listener.as_raw_fd();
        if let Err(e) = self.poller.add(fd, internal_token(fd), poll::READABLE) {
            fatal(format!("cannot watch recreated listener: {:#}", e));
        }
        self.listener = Some(listener);
        info!(%addr, "listener recreated");
    }

    fn read_handoffs(&mut self) {
        let Some(pipe) = self.handoff.as_ref().map(|p| p.as_raw_fd()) else {
            return;
        };
        loop {
            match net::read_handoff(pipe) {
                Ok(Some(fd)) => self.adopt_handoff(fd),
                Ok(None) => return,
                Err(e) if self.gateway.is_shutting_down() => {
                    debug!(worker = self.id, "dispatch pipe gone during shutdown: {:#}", e);
                    self.poller.remove(pipe);
                    return;
                }
                Err(e) => fatal(format!("worker {} dispatch pipe: {:#}", self.id, e)),
            }
        }
    }

    fn adopt_handoff(&mut self, fd: RawFd) {
        if fd < 3 || fd as usize >= self.gateway.table.capacity() {
            error!(fd, worker = self.id, "handed-off descriptor out of range");
            self.release_unbound(fd);
            return;
        }
        let Some(h) = self.gateway.table.handle_of(fd) else {
            warn!(fd, worker = self.id, "handed-off descriptor has no record");
            return;
        };
        if let Err(e) = self.bind(h) {
            error!(fd, worker = self.id, "bind failed: {:#}", e);
            self.close_connection(h);
        }
    }

    /// Drop the record a refused hand-off points at, closing its socket
    fn release_unbound(&mut self, fd: RawFd) {
        let Some(h) = self.gateway.table.handle_of(fd) else {
            return;
        };
        if self.gateway.table.take(h).is_some() {
            self.gateway.stats.record_close();
        }
    }

    /// Tear down a connection and, if it was proxied, its partner. The pair is
    /// unlinked and the slot emptied before the descriptor is closed. Only the
    /// owning worker may close a bound connection.
    pub fn close_connection(&mut self, h: ConnHandle) {
        if let Some(Some(owner)) = self.gateway.table.with(h, |c| c.owner) {
            if owner != self.id {
                error!(fd = h.fd, owner, worker = self.id, "refusing to close a connection owned by another worker");
                return;
            }
        }
        let partner = self.proxies.unlink(h).and_then(|link| link.other(h));
        if let Some(conn) = self.gateway.table.take(h) {
            self.poller.remove(h.fd);
            let stats = &self.gateway.stats;
            stats.record_close();
            if let Some(owner) = conn.owner {
                stats.worker_released(owner);
            }
            if self.asm == Some(h) {
                self.asm = None;
            }
            debug!(fd = h.fd, worker = self.id, peer = %conn.peer, "connection closed");
            drop(conn);
        }
        if let Some(p) = partner {
            self.close_connection(p);
        }
    }

    /// Queue raw bytes; either all of them fit in the send ring or none are queued
    pub fn send_raw(&mut self, h: ConnHandle, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (written, queued) = self
            .gateway
            .table
            .with(h, |c| (c.send.write(bytes), c.send.data_size()))
            .with_context(|| format!("fd {} is gone", h.fd))?;
        if written != bytes.len() {
            bail!(
                "send ring of fd {} full: {} bytes queued, {} more requested",
                h.fd,
                queued,
                bytes.len()
            );
        }
        self.poller.start_send(h.fd)
    }

    pub fn send_message(&mut self, h: ConnHandle, msg: &Message) -> Result<()> {
        self.send_raw(h, &msg.encode())
    }

    /// Push queued bytes until the socket would block; drop write interest
    /// once the ring is empty
    pub fn flush_send(&mut self, h: ConnHandle) -> Result<()> {
        let drained = self.gateway.table.with(h, |c| -> Result<bool> {
            let fd = c.fd();
            while !c.send.is_empty() {
                let n = net::send_some(fd, c.send.readable_chunk(), false)?;
                if n == 0 {
                    return Ok(false);
                }
                c.send.consume(n);
            }
            Ok(true)
        });
        match drained {
            Some(Ok(true)) => self.poller.stop_send(h.fd),
            Some(Ok(false)) | None => Ok(()),
            Some(Err(e)) => Err(e),
        }
    }
}

/// A reactor thread: context plus its private timer wheel
pub struct Worker {
    ctx: WorkerContext,
    timers: TimerWheel<WorkerContext>,
}

impl Worker {
    pub fn new(ctx: WorkerContext) -> Result<Self> {
        let s = &ctx.gateway.settings;
        let timers = TimerWheel::new(s.max_timers, s.tick_ms)?;
        Ok(Self { ctx, timers })
    }

    pub fn context(&mut self) -> &mut WorkerContext {
        &mut self.ctx
    }

    pub fn timers(&mut self) -> &mut TimerWheel<WorkerContext> {
        &mut self.timers
    }

    /// Run until shutdown. Timers advance by wall-clock ticks; a jump of more
    /// than two ticks either way re-bases the schedule and runs one tick.
    pub fn run(mut self) -> Result<()> {
        let tick = self.timers.tick_ms() as i64;
        info!(worker = self.ctx.id, tick_ms = tick, "reactor running");
        let mut next = wall_clock_ms() + tick;
        while !self.ctx.gateway.is_shutting_down() {
            let wait = (next - wall_clock_ms()).clamp(0, tick) as i32;
            self.ctx.turn(wait)?;

            let now = wall_clock_ms();
            let drift = now - next;
            if drift > 2 * tick || drift < -2 * tick {
                warn!(worker = self.ctx.id, drift_ms = drift, "clock jump, re-basing timers");
                self.timers.advance(&mut self.ctx);
                next = now + tick;
                continue;
            }
            while now >= next {
                self.timers.advance(&mut self.ctx);
                next += tick;
            }
        }
        info!(worker = self.ctx.id, "reactor stopped");
        Ok(())
    }
}

/// Start workers `1..=readers.len()`, one per pipe reader
pub fn spawn_workers(gateway: &Arc<Gateway>, readers: Vec<OwnedFd>) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(readers.len());
    for (i, reader) in readers.into_iter().enumerate() {
        let id = i + 1;
        let gateway = Arc::clone(gateway);
        let handle = std::thread::Builder::new()
            .name(format!("sgw-worker-{}", id))
            .spawn(move || {
                let run = WorkerContext::new(id, gateway)
                    .and_then(|ctx| ctx.with_handoff(reader))
                    .and_then(Worker::new)
                    .and_then(Worker::run);
                if let Err(e) = run {
                    fatal(format!("worker {} reactor failed: {:#}", id, e));
                }
            })
            .with_context(|| format!("spawn worker {}", id))?;
        handles.push(handle);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::conn::unspecified_peer;
    use crate::migration::MigrationHandle;
    use crate::migration::MigrationConfig;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;

    struct NoLaunch;

    impl MigrationLauncher for NoLaunch {
        fn launch(&self, _config: &MigrationConfig) -> Result<MigrationHandle> {
            bail!("not in tests")
        }
        fn on_completion(&self, _ack_code: u32) {}
    }

    fn gateway() -> Arc<Gateway> {
        let cfg = GatewayConfig {
            region_id: 1,
            system_id: 1,
            group_id: 1,
            local: Some("127.0.0.1:7788:0x1".into()),
            connect: Some("127.0.0.1:7788".into()),
            asm: Some("127.0.0.1:9000:0x6".into()),
            backends: vec![PathBuf::from("/nonexistent")],
            ring_size: 64 * 1024,
            ..GatewayConfig::default()
        };
        Gateway::new(cfg.validate().unwrap(), Box::new(NoLaunch))
    }

    fn pump(ctxs: &mut [&mut WorkerContext], rounds: usize) {
        for _ in 0..rounds {
            for ctx in ctxs.iter_mut() {
                ctx.turn(10).unwrap();
            }
        }
    }

    #[test]
    fn accepted_connection_reaches_worker_and_closes() {
        let gw = gateway();
        let pipe = net::HandoffPipe::new().unwrap();
        let socket = net::bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let mut listener = WorkerContext::new(0, Arc::clone(&gw))
            .unwrap()
            .with_listener(socket, vec![pipe.writer])
            .unwrap();
        let mut worker = WorkerContext::new(1, Arc::clone(&gw))
            .unwrap()
            .with_handoff(pipe.reader)
            .unwrap();

        let client = TcpStream::connect(addr).unwrap();
        pump(&mut [&mut listener, &mut worker], 5);
        assert_eq!(gw.stats.accepts(), 1);
        assert_eq!(gw.stats.concurrent(1), 1);
        assert_eq!(gw.table.live_count(), 1);

        drop(client);
        pump(&mut [&mut listener, &mut worker], 5);
        assert_eq!(gw.stats.connections(), 0);
        assert_eq!(gw.stats.concurrent(1), 0);
        assert_eq!(gw.table.live_count(), 0);
    }

    #[test]
    fn queued_bytes_are_flushed_on_writable() {
        let gw = gateway();
        let mut ctx = WorkerContext::new(1, Arc::clone(&gw)).unwrap();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let h = ctx
            .adopt(Connection::new(ours, unspecified_peer(), 64 * 1024).unwrap())
            .unwrap();
        ctx.send_raw(h, b"hello").unwrap();
        assert_eq!(ctx.poller.interest(h.fd), Some(poll::READABLE | poll::WRITABLE));
        ctx.turn(100).unwrap();
        assert_eq!(ctx.poller.interest(h.fd), Some(poll::READABLE));
        let mut buf = [0u8; 5];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // A full ring refuses the whole write
        assert!(ctx.send_raw(h, &vec![0u8; 128 * 1024]).is_err());
        ctx.close_connection(h);
        assert!(!gw.table.is_live(h));
        ctx.close_connection(h);
        assert_eq!(gw.stats.connections(), 0);
    }

    #[test]
    fn closing_one_side_closes_its_partner() {
        let gw = gateway();
        let mut ctx = WorkerContext::new(1, Arc::clone(&gw)).unwrap();
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();
        let ha = ctx.adopt(Connection::new(a, unspecified_peer(), 4096).unwrap()).unwrap();
        let hb = ctx.adopt(Connection::new(b, unspecified_peer(), 4096).unwrap()).unwrap();
        ctx.proxies.link(ha, hb).unwrap();
        ctx.close_connection(hb);
        assert!(!gw.table.is_live(ha));
        assert!(!gw.table.is_live(hb));
        assert!(ctx.proxies().is_empty());
        assert_eq!(gw.stats.concurrent(1), 0);
    }

    #[test]
    fn close_from_a_foreign_worker_is_refused() {
        let gw = gateway();
        let mut owner = WorkerContext::new(1, Arc::clone(&gw)).unwrap();
        let mut other = WorkerContext::new(2, Arc::clone(&gw)).unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let h = owner
            .adopt(Connection::new(ours, unspecified_peer(), 4096).unwrap())
            .unwrap();

        other.close_connection(h);
        assert!(gw.table.is_live(h));
        assert_eq!(gw.stats.concurrent(1), 1);

        owner.close_connection(h);
        assert!(!gw.table.is_live(h));
        assert_eq!(gw.stats.concurrent(1), 0);
    }

    #[test]
    fn events_for_a_reused_descriptor_leave_the_new_record_alone() {
        let gw = gateway();
        let mut ctx = WorkerContext::new(1, Arc::clone(&gw)).unwrap();

        // Same descriptor number, new record owned by another worker
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let stale = ctx
            .adopt(Connection::new(ours, unspecified_peer(), 4096).unwrap())
            .unwrap();
        let conn = gw.table.take(stale).unwrap();
        let fresh = gw.table.install(*conn).unwrap();
        assert_eq!(fresh.fd, stale.fd);
        assert_ne!(fresh.generation, stale.generation);
        gw.table.with(fresh, |c| c.owner = Some(2)).unwrap();

        theirs.write_all(b"ping").unwrap();
        ctx.turn(100).unwrap();
        assert_eq!(ctx.poller.interest(stale.fd), None);
        assert!(gw.table.is_live(fresh));
        assert_eq!(gw.table.with(fresh, |c| c.recv.data_size()), Some(0));

        // Current generation, but bound to someone else
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let h = ctx
            .adopt(Connection::new(ours, unspecified_peer(), 4096).unwrap())
            .unwrap();
        gw.table.with(h, |c| c.owner = Some(2)).unwrap();
        theirs.write_all(b"ping").unwrap();
        ctx.turn(100).unwrap();
        assert_eq!(ctx.poller.interest(h.fd), None);
        assert!(gw.table.is_live(h));
        assert_eq!(gw.table.with(h, |c| c.recv.data_size()), Some(0));
    }

    #[test]
    fn refused_handoff_releases_its_record() {
        let gw = gateway();
        let mut ctx = WorkerContext::new(1, Arc::clone(&gw)).unwrap();
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let h = gw
            .table
            .install(Connection::new(ours, unspecified_peer(), 4096).unwrap())
            .unwrap();
        gw.stats.record_accept();

        ctx.release_unbound(h.fd);
        assert!(!gw.table.is_live(h));
        assert_eq!(gw.stats.connections(), 0);
        theirs.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(theirs.read(&mut buf).unwrap(), 0);

        // Out-of-range values are discarded and the worker keeps running
        let pipe = net::HandoffPipe::new().unwrap();
        let mut worker = WorkerContext::new(1, Arc::clone(&gw))
            .unwrap()
            .with_handoff(pipe.reader)
            .unwrap();
        net::write_handoff(pipe.writer.as_raw_fd(), 1).unwrap();
        net::write_handoff(pipe.writer.as_raw_fd(), gw.table.capacity() as RawFd + 7).unwrap();
        worker.turn(100).unwrap();
        assert_eq!(gw.table.live_count(), 0);
    }
}
