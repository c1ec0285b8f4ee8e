// src/syscalls.rs
use crate::error::SonataResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

/// Pending-connection queue length handed to `listen(2)`.
pub const LISTEN_BACKLOG: c_int = 16;

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
pub fn create_listen_socket(addr: &SocketAddr) -> SonataResult<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        // 1. Atomic non-blocking + close-on-exec socket
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // 2. SO_REUSEADDR so a restart does not wait out TIME_WAIT
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // 3. Bind
        bind_addr(fd, addr)?;

        // 4. Listen with a small, fixed backlog
        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Bind a socket to an address. Closes `fd` on failure.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> SonataResult<()> {
    let (storage, len) = socket_addr_to_raw(addr);
    unsafe {
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
    }
    Ok(())
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Accept a non-blocking connection. `Ok(None)` means the backlog is drained.
pub fn accept_connection(listen_fd: RawFd) -> SonataResult<Option<(RawFd, Option<SocketAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err.into())
        }
    } else {
        Ok(Some((fd, raw_to_socket_addr(&storage))))
    }
}

/// Address a bound socket is listening on (resolves port 0).
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let res = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    raw_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Data Transfer ----

/// Single `read(2)`. Would-block surfaces as `ErrorKind::WouldBlock`;
/// `Ok(0)` is end of stream.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(res as usize);
    }
}

/// Single `write(2)` with the same error conventions as [`read_nonblocking`].
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(res as usize);
    }
}

/// Vectored write: write multiple buffers in a single syscall (scatter-gather I/O)
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }

    // Build iovec array on stack (max 8 segments)
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(res as usize);
    }
}

// ---- Completion Pipe Operations ----

/// Create a Unix pipe whose read end is non-blocking. Returns (read_fd, write_fd).
pub fn create_pipe() -> SonataResult<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Make read end non-blocking
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Send a token over a pipe (blocking write of 8 bytes; atomic below PIPE_BUF).
pub fn send_token(pipe_write_fd: RawFd, token: u64) -> io::Result<()> {
    let bytes = token.to_ne_bytes();
    let n = write_nonblocking(pipe_write_fd, &bytes)?;
    if n == bytes.len() {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::WriteZero, "short pipe write"))
    }
}

/// Receive a token from a pipe (non-blocking read of 8 bytes).
pub fn recv_token(pipe_read_fd: RawFd) -> io::Result<Option<u64>> {
    let mut buf = [0u8; 8];
    match read_nonblocking(pipe_read_fd, &mut buf) {
        Ok(8) => Ok(Some(u64::from_ne_bytes(buf))),
        Ok(0) => Ok(None),
        Ok(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "short pipe read")),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}
