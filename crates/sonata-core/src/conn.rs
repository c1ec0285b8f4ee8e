// src/conn.rs
//! Per-connection HTTP state machine.
//!
//! The reactor thread calls [`Connection::read`] and [`Connection::write`];
//! a worker calls [`Connection::process`] in between. One-shot readiness
//! guarantees these never overlap for the same connection.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use arrayvec::ArrayVec;
use serde_json::json;

use crate::credentials::Credentials;
use crate::identity::guarded;
use crate::mmap::MappedFile;
use crate::parser::{self, Header, LineStatus, Method, Version};
use crate::poller::Interest;
use crate::response::{self, Overflow, Status, WRITE_BUF_SIZE, WriteBuf};
use crate::services::Services;
use crate::syscalls;

pub const READ_BUF_SIZE: usize = 2048;

/// Readable by "other" users.
const S_IROTH: u32 = 0o004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    RequestLine,
    Headers,
    Body,
}

/// Result of one `process` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// More bytes are needed; nothing was produced.
    Incomplete,
    Malformed,
    NotFound,
    Forbidden,
    InternalError,
    StaticFile,
    Json,
}

impl Outcome {
    fn status(self) -> Status {
        match self {
            Outcome::Malformed => Status::BadRequest,
            Outcome::NotFound => Status::NotFound,
            Outcome::Forbidden => Status::Forbidden,
            Outcome::InternalError => Status::InternalError,
            Outcome::Incomplete | Outcome::StaticFile | Outcome::Json => Status::Ok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Head,
    File,
}

/// One pending output region: `pos..end` of its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    source: Source,
    pos: usize,
    end: usize,
}

impl Segment {
    fn remaining(&self) -> usize {
        self.end - self.pos
    }
}

/// Drop fully written leading segments and move into a partially written one.
fn advance(segments: &mut ArrayVec<Segment, 2>, mut n: usize) {
    while n > 0 {
        let Some(first) = segments.first_mut() else {
            return;
        };
        let left = first.remaining();
        if n >= left {
            n -= left;
            segments.remove(0);
        } else {
            first.pos += n;
            n = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// The socket stopped accepting bytes; wait for writability.
    Pending { written: usize },
    /// Everything was sent. With `keep_alive` the connection has already
    /// been reset for the next request.
    Complete { written: usize, keep_alive: bool },
}

pub struct Connection {
    fd: RawFd,
    peer: Option<SocketAddr>,
    /// Readiness the multiplexer is currently armed for. `None` while an
    /// event is being handled or a worker owns the connection.
    armed: Option<Interest>,

    read_buf: Box<[u8]>,
    read_len: usize,
    checked: usize,
    line_start: usize,
    state: MainState,

    method: Option<Method>,
    target: String,
    version: Option<Version>,
    host: Option<String>,
    keep_alive: bool,
    content_length: usize,
    body_start: usize,
    force_close: bool,

    outcome: Outcome,
    write_buf: WriteBuf,
    segments: ArrayVec<Segment, 2>,
    json_body: Vec<u8>,
    file: Option<MappedFile>,
    file_len: usize,
    content_type: &'static str,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// A closed connection with its buffers allocated.
    pub fn new() -> Self {
        Self {
            fd: -1,
            peer: None,
            armed: None,
            read_buf: vec![0; READ_BUF_SIZE].into_boxed_slice(),
            read_len: 0,
            checked: 0,
            line_start: 0,
            state: MainState::RequestLine,
            method: None,
            target: String::new(),
            version: None,
            host: None,
            keep_alive: false,
            content_length: 0,
            body_start: 0,
            force_close: false,
            outcome: Outcome::Incomplete,
            write_buf: WriteBuf::with_capacity(WRITE_BUF_SIZE),
            segments: ArrayVec::new(),
            json_body: Vec::new(),
            file: None,
            file_len: 0,
            content_type: "text/html",
        }
    }

    /// Take ownership of a freshly accepted socket.
    pub fn init(&mut self, fd: RawFd, peer: Option<SocketAddr>) {
        self.reset();
        self.fd = fd;
        self.peer = peer;
        self.armed = None;
    }

    /// Forget the current request; the socket stays.
    pub fn reset(&mut self) {
        self.file = None;
        self.read_len = 0;
        self.checked = 0;
        self.line_start = 0;
        self.state = MainState::RequestLine;
        self.method = None;
        self.target.clear();
        self.version = None;
        self.host = None;
        self.keep_alive = false;
        self.content_length = 0;
        self.body_start = 0;
        self.force_close = false;
        self.outcome = Outcome::Incomplete;
        self.write_buf.clear();
        self.segments.clear();
        self.json_body.clear();
        self.file_len = 0;
        self.content_type = "text/html";
    }

    /// Release the mapping and hand the socket back for closing.
    pub fn detach(&mut self) -> Option<RawFd> {
        self.reset();
        self.peer = None;
        self.armed = None;
        if self.fd < 0 {
            return None;
        }
        let fd = self.fd;
        self.fd = -1;
        Some(fd)
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn armed(&self) -> Option<Interest> {
        self.armed
    }

    /// Record what the connection was re-armed for; one-shot delivery
    /// moves it back to `None`.
    pub fn set_armed(&mut self, interest: Option<Interest>) {
        self.armed = interest;
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes still to be written for the current response.
    pub fn pending(&self) -> usize {
        self.segments.iter().map(Segment::remaining).sum()
    }

    /// Read everything the socket has right now.
    ///
    /// Stops on would-block or when the buffer is full. End of stream is
    /// reported as `UnexpectedEof`.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.read_len < self.read_buf.len() {
            match syscalls::read_nonblocking(self.fd, &mut self.read_buf[self.read_len..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                Ok(n) => {
                    self.read_len += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Parse what has been read and, once a request is complete, build its
    /// response. Performs no socket I/O.
    pub fn process(&mut self, services: &Services) -> Outcome {
        #[cfg(feature = "catch-panic")]
        let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.process_request(services)
        })) {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(fd = self.fd, "request processing panicked");
                self.fail_internal()
            }
        };
        #[cfg(not(feature = "catch-panic"))]
        let outcome = self.process_request(services);

        self.outcome = outcome;
        outcome
    }

    fn process_request(&mut self, services: &Services) -> Outcome {
        let outcome = self.parse(services);
        if outcome == Outcome::Incomplete {
            return outcome;
        }
        if outcome == Outcome::Malformed {
            tracing::debug!(fd = self.fd, peer = ?self.peer, "malformed request");
        }
        match self.build_response(outcome) {
            Ok(()) => outcome,
            Err(Overflow) => {
                tracing::warn!(fd = self.fd, ?outcome, "response overflowed the write buffer");
                self.fail_internal()
            }
        }
    }

    /// Replace whatever was prepared with a 500 that closes the connection.
    fn fail_internal(&mut self) -> Outcome {
        self.file = None;
        self.json_body.clear();
        self.keep_alive = false;
        self.force_close = true;
        // A bare 500 always fits an empty write buffer.
        let _ = self.build_response(Outcome::InternalError);
        Outcome::InternalError
    }

    fn parse(&mut self, services: &Services) -> Outcome {
        loop {
            if self.state == MainState::Body {
                let end = self.body_start + self.content_length;
                if self.read_len < end {
                    return Outcome::Incomplete;
                }
                return self.route(services);
            }

            let line_start = self.line_start;
            let status = parser::scan_line(
                &self.read_buf[..self.read_len],
                &mut self.checked,
                line_start,
            );
            let line_end = match status {
                LineStatus::Ok(end) => end,
                LineStatus::Bad => return Outcome::Malformed,
                LineStatus::Open => {
                    if self.read_len == self.read_buf.len() {
                        self.force_close = true;
                        return Outcome::Malformed;
                    }
                    return Outcome::Incomplete;
                }
            };
            self.line_start = self.checked;
            let line = &self.read_buf[line_start..line_end];

            match self.state {
                MainState::RequestLine => match parser::parse_request_line(line) {
                    Ok(rl) => {
                        self.method = Some(rl.method);
                        self.target.push_str(rl.target);
                        self.version = Some(rl.version);
                        self.state = MainState::Headers;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "bad request line");
                        return Outcome::Malformed;
                    }
                },
                MainState::Headers if line.is_empty() => {
                    if self.method != Some(Method::Post) {
                        return self.route(services);
                    }
                    if self.content_length == 0 {
                        return Outcome::Malformed;
                    }
                    self.body_start = self.checked;
                    let fits = self
                        .body_start
                        .checked_add(self.content_length)
                        .is_some_and(|end| end <= self.read_buf.len());
                    if !fits {
                        self.force_close = true;
                        return Outcome::Malformed;
                    }
                    self.state = MainState::Body;
                }
                MainState::Headers => match parser::parse_header(line) {
                    Ok(Header::Connection { keep_alive }) => self.keep_alive = keep_alive,
                    Ok(Header::ContentLength(len)) => self.content_length = len,
                    Ok(Header::Host(host)) => self.host = Some(host.to_string()),
                    Ok(Header::ContentType { .. }) | Ok(Header::Other) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "bad header");
                        return Outcome::Malformed;
                    }
                },
                MainState::Body => unreachable!("body state is handled before line scanning"),
            }
        }
    }

    fn route(&mut self, services: &Services) -> Outcome {
        if self.method == Some(Method::Post) {
            match self.target.as_str() {
                "/login" | "/register" => return self.handle_account(services),
                _ => {}
            }
        }
        self.resolve_static(services)
    }

    fn handle_account(&mut self, services: &Services) -> Outcome {
        let body = &self.read_buf[self.body_start..self.body_start + self.content_length];
        let Some(Credentials {
            username,
            password,
            email,
        }) = services.decoder.decode(body)
        else {
            return Outcome::Malformed;
        };

        let reply = if self.target == "/login" {
            let verdict = guarded("login", || services.identity.login(&username, &password));
            if verdict.success {
                tracing::info!(%username, "login succeeded");
                json!({
                    "success": true,
                    "message": verdict.message,
                    "username": username,
                    "redirect": services.login_redirect,
                    "timestamp": chrono::Utc::now().timestamp(),
                })
            } else {
                json!({ "success": false, "message": verdict.message })
            }
        } else {
            let verdict = guarded("register", || {
                services
                    .identity
                    .register(&username, &password, email.as_deref())
            });
            if verdict.success {
                tracing::info!(%username, "user registered");
            }
            json!({ "success": verdict.success, "message": verdict.message })
        };

        match serde_json::to_vec(&reply) {
            Ok(body) => {
                self.json_body = body;
                Outcome::Json
            }
            Err(_) => Outcome::InternalError,
        }
    }

    fn resolve_static(&mut self, services: &Services) -> Outcome {
        let path_part = self.target.split(['?', '#']).next().unwrap_or("/");
        let relative = if path_part == "/" {
            services.index_file.as_deref().unwrap_or("")
        } else {
            path_part.trim_start_matches('/')
        };
        if relative.split('/').any(|segment| segment == "..") {
            return Outcome::Forbidden;
        }
        let path: PathBuf = services.doc_root.join(relative);

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Outcome::Forbidden,
            Err(_) => return Outcome::NotFound,
        };
        if meta.permissions().mode() & S_IROTH == 0 {
            return Outcome::Forbidden;
        }
        if meta.is_dir() {
            return Outcome::Malformed;
        }

        self.content_type = response::content_type_for(&path);
        self.file_len = meta.len() as usize;
        if self.method == Some(Method::Head) {
            return Outcome::StaticFile;
        }
        match MappedFile::open(&path) {
            Ok(file) => {
                self.file_len = file.len();
                self.file = Some(file);
                Outcome::StaticFile
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to map file");
                Outcome::InternalError
            }
        }
    }

    fn build_response(&mut self, outcome: Outcome) -> Result<(), Overflow> {
        self.write_buf.clear();
        self.segments.clear();
        if self.force_close {
            self.keep_alive = false;
        }
        let keep_alive = self.keep_alive;

        match outcome {
            Outcome::Incomplete => return Ok(()),
            Outcome::StaticFile => {
                response::write_head(
                    &mut self.write_buf,
                    Status::Ok,
                    self.content_type,
                    self.file_len,
                    keep_alive,
                )?;
            }
            Outcome::Json => {
                response::write_head(
                    &mut self.write_buf,
                    Status::Ok,
                    "application/json",
                    self.json_body.len(),
                    keep_alive,
                )?;
                self.write_buf.append(&self.json_body)?;
            }
            _ => {
                let status = outcome.status();
                let page = status.page();
                response::write_head(&mut self.write_buf, status, "text/html", page.len(), keep_alive)?;
                self.write_buf.append(page.as_bytes())?;
            }
        }

        self.segments.push(Segment {
            source: Source::Head,
            pos: 0,
            end: self.write_buf.len(),
        });
        if let Some(file) = self.file.as_ref().filter(|f| !f.is_empty()) {
            self.segments.push(Segment {
                source: Source::File,
                pos: 0,
                end: file.len(),
            });
        }
        Ok(())
    }

    /// Send the prepared response with `writev`, resuming where the last
    /// call stopped.
    pub fn write(&mut self) -> io::Result<WriteProgress> {
        if self.pending() == 0 {
            self.reset();
            return Ok(WriteProgress::Complete {
                written: 0,
                keep_alive: true,
            });
        }

        let mut written = 0;
        while self.pending() > 0 {
            // The slices borrow `self.file`; release them before the match.
            let res = {
                let head = self.write_buf.as_bytes();
                let file = self.file.as_ref().map_or(&[][..], MappedFile::as_slice);
                let bufs: ArrayVec<&[u8], 2> = self
                    .segments
                    .iter()
                    .map(|seg| {
                        let source = match seg.source {
                            Source::Head => head,
                            Source::File => file,
                        };
                        source.get(seg.pos..seg.end).unwrap_or_default()
                    })
                    .collect();
                syscalls::writev_nonblocking(self.fd, &bufs)
            };

            match res {
                Ok(0) => {
                    self.file = None;
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ));
                }
                Ok(n) => {
                    written += n;
                    advance(&mut self.segments, n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Pending { written });
                }
                Err(e) => {
                    self.file = None;
                    return Err(e);
                }
            }
        }

        self.file = None;
        let keep_alive = self.keep_alive;
        if keep_alive {
            self.reset();
        }
        Ok(WriteProgress::Complete {
            written,
            keep_alive,
        })
    }

    #[cfg(test)]
    fn feed(&mut self, bytes: &[u8]) {
        let end = self.read_len + bytes.len();
        self.read_buf[self.read_len..end].copy_from_slice(bytes);
        self.read_len = end;
    }

    #[cfg(test)]
    fn head_bytes(&self) -> &[u8] {
        self.write_buf.as_bytes()
    }
}
