//! Thin epoll wrapper with a per-descriptor shadow interest table.
//!
//! The shadow table lets callers flip read and write interest independently
//! (`start_recv`, `stop_send`, ...) without knowing the other bit, and lets the
//! reactor recognise events for descriptors it already dropped.

use anyhow::{bail, Result};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub const READABLE: u32 = libc::EPOLLIN as u32;
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;
pub const ERROR: u32 = libc::EPOLLERR as u32;
pub const HANGUP: u32 = libc::EPOLLHUP as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Registration {
    token: u64,
    events: u32,
}

/// One readiness notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub token: u64,
    pub events: u32,
}

impl Event {
    pub fn readable(&self) -> bool {
        self.events & READABLE != 0
    }

    pub fn writable(&self) -> bool {
        self.events & WRITABLE != 0
    }

    pub fn is_error(&self) -> bool {
        self.events & ERROR != 0
    }

    pub fn hangup(&self) -> bool {
        self.events & HANGUP != 0
    }
}

// Tokens carry the descriptor in the low half so the fd can be recovered
fn token_fd(token: u64) -> RawFd {
    (token & 0xFFFF_FFFF) as u32 as RawFd
}

pub struct Poller {
    epfd: OwnedFd,
    regs: Vec<Option<Registration>>,
    buf: Vec<libc::epoll_event>,
}

impl Poller {
    /// `capacity` bounds the descriptor values this poller accepts
    pub fn new(capacity: usize, max_events: usize) -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            regs: vec![None; capacity],
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    fn slot(&mut self, fd: RawFd) -> Result<&mut Option<Registration>> {
        let cap = self.regs.len();
        match usize::try_from(fd).ok().and_then(|i| self.regs.get_mut(i)) {
            Some(slot) => Ok(slot),
            None => bail!("fd {} outside poller capacity {}", fd, cap),
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, reg: Registration) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: reg.events,
            u64: reg.token,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Register `fd`; an already-registered descriptor is modified instead
    pub fn add(&mut self, fd: RawFd, token: u64, events: u32) -> Result<()> {
        let reg = Registration { token, events };
        *self.slot(fd)? = Some(reg);
        match self.ctl(libc::EPOLL_CTL_ADD, fd, reg) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, reg)?;
                Ok(())
            }
            Err(e) => {
                *self.slot(fd)? = None;
                Err(anyhow::Error::new(e).context(format!("epoll add fd {}", fd)))
            }
        }
    }

    /// Unregister `fd`. Errors from the kernel (already closed) are ignored.
    pub fn remove(&mut self, fd: RawFd) {
        if let Ok(slot) = self.slot(fd) {
            *slot = None;
        }
        let _ = self.ctl(
            libc::EPOLL_CTL_DEL,
            fd,
            Registration { token: 0, events: 0 },
        );
    }

    /// True when `fd` is registered here under exactly this token
    pub fn is_registered(&self, fd: RawFd, token: u64) -> bool {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.regs.get(i))
            .and_then(|r| r.as_ref())
            .map(|r| r.token == token)
            .unwrap_or(false)
    }

    pub fn interest(&self, fd: RawFd) -> Option<u32> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.regs.get(i))
            .and_then(|r| r.as_ref())
            .map(|r| r.events)
    }

    fn modify_interest(&mut self, fd: RawFd, update: impl FnOnce(u32) -> u32) -> Result<()> {
        let reg = {
            let slot = self.slot(fd)?;
            let Some(reg) = slot.as_mut() else {
                bail!("fd {} is not registered", fd);
            };
            reg.events = update(reg.events);
            *reg
        };
        match self.ctl(libc::EPOLL_CTL_MOD, fd, reg) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, reg)?;
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("epoll modify fd {}", fd))),
        }
    }

    pub fn start_monitoring(&mut self, fd: RawFd, events: u32) -> Result<()> {
        self.modify_interest(fd, |cur| cur | events)
    }

    pub fn stop_monitoring(&mut self, fd: RawFd, events: u32) -> Result<()> {
        self.modify_interest(fd, |cur| cur & !events)
    }

    pub fn start_recv(&mut self, fd: RawFd) -> Result<()> {
        self.start_monitoring(fd, READABLE)
    }

    pub fn stop_recv(&mut self, fd: RawFd) -> Result<()> {
        self.stop_monitoring(fd, READABLE)
    }

    pub fn start_send(&mut self, fd: RawFd) -> Result<()> {
        self.start_monitoring(fd, WRITABLE)
    }

    pub fn stop_send(&mut self, fd: RawFd) -> Result<()> {
        self.stop_monitoring(fd, WRITABLE)
    }

    /// Wait up to `timeout_ms`; an interrupted wait yields zero events
    pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<Event>) -> Result<usize> {
        out.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                self.buf.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(anyhow::Error::new(e).context("epoll_wait"));
        }
        for ev in &self.buf[..n as usize] {
            let token = ev.u64;
            out.push(Event {
                fd: token_fd(token),
                token,
                events: ev.events,
            });
        }
        Ok(out.len())
    }
}
