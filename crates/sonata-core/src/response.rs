// src/response.rs
use std::fmt::{self, Write as _};
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;

/// Write buffer capacity. Large enough for any header block plus an error
/// page or JSON reply.
pub const WRITE_BUF_SIZE: usize = 1024;

/// Sent verbatim when no connection slot is free.
pub const BUSY_RESPONSE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Type: text/plain\r\n\
Content-Length: 35\r\n\
Connection: close\r\n\
\r\n\
Server busy, please try again later";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed body sent with error statuses.
    pub fn page(self) -> &'static str {
        match self {
            Status::Ok => "",
            Status::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => "You do not have permission to get file from this server.\n",
            Status::NotFound => "The requested file was not found on this server.\n",
            Status::InternalError => "There was an unusual problem serving the request file.\n",
        }
    }
}

/// Content-Type for a served file, by extension. Anything unknown is HTML.
pub fn content_type_for(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return "text/html";
    };
    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        _ => "text/html",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("response does not fit the write buffer")]
pub struct Overflow;

/// Fixed-capacity output buffer. Appends are all-or-nothing.
pub struct WriteBuf {
    buf: Box<[u8]>,
    len: usize,
}

impl WriteBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let end = self.len + bytes.len();
        if end > self.buf.len() {
            return Err(Overflow);
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Bounded formatted append; nothing is kept if the text does not fit.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), Overflow> {
        let start = self.len;
        let mut cursor = Cursor { buf: self };
        if cursor.write_fmt(args).is_err() {
            self.len = start;
            return Err(Overflow);
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

struct Cursor<'a> {
    buf: &'a mut WriteBuf,
}

impl fmt::Write for Cursor<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.append(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// Status line plus the standard header block, terminated by a blank line.
pub fn write_head(
    buf: &mut WriteBuf,
    status: Status,
    content_type: &str,
    content_length: usize,
    keep_alive: bool,
) -> Result<(), Overflow> {
    buf.append_fmt(format_args!(
        "HTTP/1.1 {} {}\r\n",
        status.code(),
        status.reason()
    ))?;
    buf.append_fmt(format_args!(
        "Date: {}\r\n",
        httpdate::fmt_http_date(SystemTime::now())
    ))?;
    buf.append_fmt(format_args!("Content-Type: {}\r\n", content_type))?;
    buf.append_fmt(format_args!("Content-Length: {}\r\n", content_length))?;
    buf.append_fmt(format_args!(
        "Connection: {}\r\n",
        if keep_alive { "keep-alive" } else { "close" }
    ))?;
    buf.append(b"\r\n")
}
