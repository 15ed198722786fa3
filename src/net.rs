//! Socket plumbing: listener setup, outbound connects, non-blocking
//! send/recv wrappers, sendfile and the worker hand-off pipes.
//!
//! Every call here is a thin translation of one syscall. Transient errno
//! values (EINTR, EAGAIN) become typed outcomes; everything else becomes an
//! `anyhow::Error` built from the OS error.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::protocol::limits::{
    LISTEN_BACKLOG, RETRY_LIMIT, SENDFILE_CHUNK, SO_RCVBUF, SO_SNDBUF,
};

/// Result of a single non-blocking receive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    Data(usize),
    /// Orderly shutdown by the peer
    Closed,
    WouldBlock,
}

/// Result of one sendfile step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendfileOutcome {
    Sent(usize),
    WouldBlock,
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn set_nonblocking(fd: RawFd, on: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("fcntl(F_GETFL)");
    }
    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error()).context("fcntl(F_SETFL)");
    }
    Ok(())
}

// Socket tuning for accepted connections: address reuse, non-blocking mode
// and the fixed kernel buffer sizes
pub fn tune_socket(fd: RawFd) -> Result<()> {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).context("SO_REUSEADDR")?;
    set_nonblocking(fd, true)?;
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, SO_SNDBUF).context("SO_SNDBUF")?;
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, SO_RCVBUF).context("SO_RCVBUF")?;
    Ok(())
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sin
}

fn tcp_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("socket()");
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind_to(fd: RawFd, addr: SocketAddrV4) -> Result<()> {
    let sin = sockaddr_in(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).with_context(|| format!("bind {}", addr));
    }
    Ok(())
}

/// Create the non-blocking listening socket
pub fn bind_listener(addr: SocketAddrV4) -> Result<TcpListener> {
    let sock = tcp_socket()?;
    let fd = sock.as_raw_fd();
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).context("SO_REUSEADDR")?;
    bind_to(fd, addr)?;
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        return Err(io::Error::last_os_error()).with_context(|| format!("listen {}", addr));
    }
    set_nonblocking(fd, true)?;
    Ok(TcpListener::from(sock))
}

/// Connect to `peer`, optionally from `local`. EINTR is retried a bounded
/// number of times. A non-blocking connect may return while still in
/// progress; a blocking one must complete.
pub fn open_outbound(
    peer: SocketAddrV4,
    local: Option<SocketAddrV4>,
    nonblocking: bool,
) -> Result<TcpStream> {
    let sock = tcp_socket()?;
    let fd = sock.as_raw_fd();
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).context("SO_REUSEADDR")?;
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1).context("TCP_NODELAY")?;
    if let Some(local) = local {
        bind_to(fd, local)?;
    }
    if nonblocking {
        set_nonblocking(fd, true)?;
    }

    let sin = sockaddr_in(peer);
    let mut attempts = 0;
    loop {
        let rc = unsafe {
            libc::connect(
                fd,
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of_val(&sin) as libc::socklen_t,
            )
        };
        if rc == 0 {
            break;
        }
        match errno() {
            libc::EINTR if attempts < RETRY_LIMIT => attempts += 1,
            libc::EINPROGRESS if nonblocking => break,
            e => {
                return Err(io::Error::from_raw_os_error(e))
                    .with_context(|| format!("connect to {}", peer))
            }
        }
    }
    Ok(TcpStream::from(sock))
}

/// Accept one pending connection. `None` means nothing to accept right now.
pub fn accept_inbound(listener: &TcpListener) -> Result<Option<(TcpStream, SocketAddrV4)>> {
    let mut attempts = 0;
    loop {
        match listener.accept() {
            Ok((stream, std::net::SocketAddr::V4(peer))) => return Ok(Some((stream, peer))),
            Ok((_, other)) => bail!("unexpected non-IPv4 peer {}", other),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                attempts += 1;
                if attempts >= RETRY_LIMIT {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e).context("accept"),
        }
    }
}

/// Receive into `buf`
pub fn recv_some(fd: RawFd, buf: &mut [u8]) -> Result<RecvOutcome> {
    if buf.is_empty() {
        return Ok(RecvOutcome::WouldBlock);
    }
    let mut attempts = 0;
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n > 0 {
            return Ok(RecvOutcome::Data(n as usize));
        }
        if n == 0 {
            return Ok(RecvOutcome::Closed);
        }
        match errno() {
            libc::EAGAIN => return Ok(RecvOutcome::WouldBlock),
            libc::EINTR if attempts < RETRY_LIMIT => attempts += 1,
            libc::EINTR => return Ok(RecvOutcome::WouldBlock),
            e => return Err(io::Error::from_raw_os_error(e)).with_context(|| format!("recv fd {}", fd)),
        }
    }
}

/// Send as much of `buf` as the socket takes right now. Zero means try later.
/// `more` hints that further data follows immediately.
pub fn send_some(fd: RawFd, buf: &[u8], more: bool) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let flags = libc::MSG_NOSIGNAL | if more { libc::MSG_MORE } else { 0 };
    let mut interrupted = 0;
    let mut empty = 0;
    loop {
        let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) };
        if n > 0 {
            return Ok(n as usize);
        }
        if n == 0 {
            empty += 1;
            if empty >= RETRY_LIMIT {
                return Ok(0);
            }
            continue;
        }
        match errno() {
            libc::EAGAIN => return Ok(0),
            libc::EINTR if interrupted < RETRY_LIMIT => interrupted += 1,
            libc::EINTR => return Ok(0),
            e => return Err(io::Error::from_raw_os_error(e)).with_context(|| format!("send fd {}", fd)),
        }
    }
}

/// Push up to one chunk of `file` starting at `offset` into the socket
pub fn sendfile_chunk(out_fd: RawFd, file: &File, offset: u64, remaining: u64) -> Result<SendfileOutcome> {
    let len = remaining.min(SENDFILE_CHUNK as u64) as usize;
    let mut off = offset as libc::off_t;
    let mut attempts = 0;
    loop {
        let sent = unsafe { libc::sendfile(out_fd, file.as_raw_fd(), &mut off, len) };
        if sent > 0 {
            return Ok(SendfileOutcome::Sent(sent as usize));
        }
        if sent == 0 {
            bail!("sendfile hit end of file with {} bytes outstanding", remaining);
        }
        match errno() {
            libc::EAGAIN => return Ok(SendfileOutcome::WouldBlock),
            libc::EINTR if attempts < RETRY_LIMIT => attempts += 1,
            libc::EINTR => return Ok(SendfileOutcome::WouldBlock),
            e => return Err(io::Error::from_raw_os_error(e)).context("sendfile"),
        }
    }
}

/// Read-ahead hint for a file about to be streamed front to back
pub fn advise_sequential(file: &File) {
    unsafe {
        let _ = libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

/// One dispatch pipe: the listener writes accepted descriptors, a worker reads them
pub struct HandoffPipe {
    pub reader: OwnedFd,
    pub writer: OwnedFd,
}

impl HandoffPipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error()).context("pipe2");
        }
        let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_nonblocking(reader.as_raw_fd(), true)?;
        Ok(Self { reader, writer })
    }
}

/// Hand a descriptor number to a worker. Writes of four bytes are atomic on a pipe.
pub fn write_handoff(pipe_fd: RawFd, fd: RawFd) -> Result<()> {
    let bytes = fd.to_ne_bytes();
    let mut attempts = 0;
    loop {
        let n = unsafe { libc::write(pipe_fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n == bytes.len() as isize {
            return Ok(());
        }
        if n >= 0 {
            bail!("short write on dispatch pipe: {} bytes", n);
        }
        match errno() {
            libc::EINTR if attempts < RETRY_LIMIT => attempts += 1,
            e => return Err(io::Error::from_raw_os_error(e)).context("write to dispatch pipe"),
        }
    }
}

/// Read one handed-off descriptor. `None` when the pipe is drained.
pub fn read_handoff(pipe_fd: RawFd) -> Result<Option<RawFd>> {
    let mut bytes = [0u8; 4];
    let mut attempts = 0;
    loop {
        let n = unsafe { libc::read(pipe_fd, bytes.as_mut_ptr() as *mut libc::c_void, bytes.len()) };
        if n == bytes.len() as isize {
            return Ok(Some(RawFd::from_ne_bytes(bytes)));
        }
        if n == 0 {
            bail!("dispatch pipe closed");
        }
        if n > 0 {
            bail!("partial read on dispatch pipe: {} bytes", n);
        }
        match errno() {
            libc::EAGAIN => return Ok(None),
            libc::EINTR if attempts < RETRY_LIMIT => attempts += 1,
            libc::EINTR => return Ok(None),
            e => return Err(io::Error::from_raw_os_error(e)).context("read from dispatch pipe"),
        }
    }
}

/// Parse a dotted IPv4 address
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map_err(|e| anyhow!("invalid IPv4 address {:?}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn outbound_connect_and_accept() {
        let listener = bind_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        assert!(accept_inbound(&listener).unwrap().is_none());

        let mut client = open_outbound(addr, None, false).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = accept_inbound(&listener).unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let (server, peer) = accepted.expect("connection accepted");
        assert_eq!(peer.ip(), &Ipv4Addr::LOCALHOST);
        tune_socket(server.as_raw_fd()).unwrap();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let mut got = RecvOutcome::WouldBlock;
        for _ in 0..100 {
            got = recv_some(server.as_raw_fd(), &mut buf).unwrap();
            if got != RecvOutcome::WouldBlock {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(got, RecvOutcome::Data(4));
        assert_eq!(&buf[..4], b"ping");

        assert_eq!(send_some(server.as_raw_fd(), b"pong", false).unwrap(), 4);
        let mut back = [0u8; 4];
        client.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"pong");

        drop(client);
        let mut closed = false;
        for _ in 0..100 {
            if recv_some(server.as_raw_fd(), &mut buf).unwrap() == RecvOutcome::Closed {
                closed = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(closed);
    }

    #[test]
    fn handoff_pipe_carries_descriptors() {
        let pipe = HandoffPipe::new().unwrap();
        assert_eq!(read_handoff(pipe.reader.as_raw_fd()).unwrap(), None);
        write_handoff(pipe.writer.as_raw_fd(), 42).unwrap();
        write_handoff(pipe.writer.as_raw_fd(), 7).unwrap();
        assert_eq!(read_handoff(pipe.reader.as_raw_fd()).unwrap(), Some(42));
        assert_eq!(read_handoff(pipe.reader.as_raw_fd()).unwrap(), Some(7));
        assert_eq!(read_handoff(pipe.reader.as_raw_fd()).unwrap(), None);
    }

    #[test]
    fn sendfile_streams_a_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &body).unwrap();
        let file = File::open(&path).unwrap();
        advise_sequential(&file);

        let (a, mut b) = UnixStream::pair().unwrap();
        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            b.read_to_end(&mut out).unwrap();
            out
        });
        let mut offset = 0u64;
        while offset < body.len() as u64 {
            match sendfile_chunk(a.as_raw_fd(), &file, offset, body.len() as u64 - offset).unwrap() {
                SendfileOutcome::Sent(n) => {
                    assert!(n <= SENDFILE_CHUNK);
                    offset += n as u64;
                }
                SendfileOutcome::WouldBlock => std::thread::yield_now(),
            }
        }
        drop(a);
        assert_eq!(reader.join().unwrap(), body);
    }

    #[test]
    fn parses_ipv4() {
        assert_eq!(parse_ipv4(" 10.0.0.1 ").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(parse_ipv4("10.0.0").is_err());
    }
}
