//! Readiness multiplexer over `epoll(7)`.
//!
//! Connections are registered one-shot: after an event is delivered for a
//! descriptor, nothing more is reported for it until [`Poller::modify`]
//! re-arms it. That is what keeps a connection on at most one thread at a
//! time.

use crate::error::SonataResult;
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};
use std::io;
use std::os::fd::RawFd;
use std::ptr;

/// What a registration waits for. Never read and write at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => EPOLLIN as u32,
            Interest::Write => EPOLLOUT as u32,
        }
    }
}

/// Classified readiness for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Readable,
    Writable,
    /// Peer hang-up or socket error. Wins over readable/writable.
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub kind: EventKind,
}

impl Event {
    fn from_raw(raw: &epoll_event) -> Option<Self> {
        let bits = raw.events;
        let kind = if bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
            EventKind::Hangup
        } else if bits & EPOLLIN as u32 != 0 {
            EventKind::Readable
        } else if bits & EPOLLOUT as u32 != 0 {
            EventKind::Writable
        } else {
            return None;
        };
        Some(Self {
            token: raw.u64,
            kind,
        })
    }
}

/// Reusable buffer for [`Poller::wait`].
pub struct Events {
    raw: Vec<epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().filter_map(Event::from_raw)
    }
}

pub struct Poller {
    fd: RawFd,
}

impl Poller {
    pub fn new() -> SonataResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    /// Add `fd` under `token`. Hang-ups are always reported.
    pub fn register(&self, fd: RawFd, token: u64, interest: Interest, one_shot: bool) -> io::Result<()> {
        let mut events = interest.bits() | EPOLLRDHUP as u32;
        if one_shot {
            events |= EPOLLONESHOT as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    /// Re-arm a one-shot registration with a new interest.
    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let events = interest.bits() | (EPOLLONESHOT | EPOLLRDHUP) as u32;
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    /// Remove `fd`. Unknown descriptors are not an error.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Block up to `timeout_ms` (-1 forever). Interrupts return zero events.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.raw.as_mut_ptr(),
                events.raw.len() as libc::c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            events.len = 0;
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        events.len = res as usize;
        Ok(events.len)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn one_shot_delivers_once_until_rearmed() {
        let poller = Poller::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        poller.register(a.as_raw_fd(), 42, Interest::Read, true).unwrap();

        b.write_all(b"x").unwrap();
        let mut events = Events::with_capacity(8);
        assert_eq!(poller.wait(&mut events, 1000).unwrap(), 1);
        let ev: Vec<Event> = events.iter().collect();
        assert_eq!(ev, vec![Event { token: 42, kind: EventKind::Readable }]);

        // Data is still unread but the registration is consumed.
        assert_eq!(poller.wait(&mut events, 50).unwrap(), 0);

        poller.modify(a.as_raw_fd(), 42, Interest::Read).unwrap();
        assert_eq!(poller.wait(&mut events, 1000).unwrap(), 1);
    }

    #[test]
    fn write_interest_fires_on_writable_socket() {
        let poller = Poller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        poller.register(a.as_raw_fd(), 1, Interest::Read, true).unwrap();
        poller.modify(a.as_raw_fd(), 1, Interest::Write).unwrap();

        let mut events = Events::with_capacity(4);
        poller.wait(&mut events, 1000).unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Writable]);
    }

    #[test]
    fn hangup_takes_priority() {
        let poller = Poller::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        poller.register(a.as_raw_fd(), 9, Interest::Read, true).unwrap();
        b.write_all(b"bye").unwrap();
        drop(b);

        let mut events = Events::with_capacity(4);
        poller.wait(&mut events, 1000).unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Hangup]);
    }

    #[test]
    fn unregister_unknown_fd_is_ok() {
        let poller = Poller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(poller.unregister(a.as_raw_fd()).is_ok());
    }
}
