// src/parser.rs
use memchr::memchr2;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"HEAD" => Some(Method::Head),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"TRACE" => Some(Method::Trace),
            b"OPTIONS" => Some(Method::Options),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line terminator is not CRLF")]
    BadLineEnding,
    #[error("request line is not `METHOD SP TARGET SP VERSION`")]
    BadRequestLine,
    #[error("unsupported method")]
    UnsupportedMethod,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("request target must start with '/'")]
    BadTarget,
    #[error("header line has no ':'")]
    BadHeader,
    #[error("invalid Content-Length")]
    BadContentLength,
    #[error("POST without a body")]
    MissingBody,
    #[error("request does not fit the read buffer")]
    TooLarge,
}

/// Result of scanning for one CRLF-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// Terminator found; the line ends (exclusive) at this index.
    Ok(usize),
    /// Malformed terminator.
    Bad,
    /// No terminator yet.
    Open,
}

/// Scan `buf` from `*checked` for the end of the line starting at
/// `line_start`. On `Ok`, `*checked` moves past the CRLF; on `Open` it stays
/// where scanning can resume once more bytes arrive.
pub fn scan_line(buf: &[u8], checked: &mut usize, line_start: usize) -> LineStatus {
    while *checked < buf.len() {
        let Some(off) = memchr2(b'\r', b'\n', &buf[*checked..]) else {
            *checked = buf.len();
            return LineStatus::Open;
        };
        let idx = *checked + off;
        if buf[idx] == b'\r' {
            if idx + 1 == buf.len() {
                // Keep the cursor on the '\r' so the pair is re-examined.
                *checked = idx;
                return LineStatus::Open;
            }
            if buf[idx + 1] == b'\n' {
                *checked = idx + 2;
                return LineStatus::Ok(idx);
            }
            return LineStatus::Bad;
        }
        // Bare '\n': only valid right after a '\r' belonging to this line.
        if idx > line_start && buf[idx - 1] == b'\r' {
            *checked = idx + 1;
            return LineStatus::Ok(idx - 1);
        }
        return LineStatus::Bad;
    }
    LineStatus::Open
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: Method,
    pub target: &'a str,
    pub version: Version,
}

/// Parse `METHOD SP TARGET SP HTTP/1.x` (terminator already stripped).
pub fn parse_request_line(line: &[u8]) -> Result<RequestLine<'_>, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::BadRequestLine);
    };

    let method = Method::from_bytes(method.as_bytes()).ok_or(ParseError::UnsupportedMethod)?;

    let version = if version.eq_ignore_ascii_case("HTTP/1.1") {
        Version::Http11
    } else if version.eq_ignore_ascii_case("HTTP/1.0") {
        Version::Http10
    } else {
        return Err(ParseError::UnsupportedVersion);
    };

    if !target.starts_with('/') {
        return Err(ParseError::BadTarget);
    }

    Ok(RequestLine {
        method,
        target,
        version,
    })
}

/// The headers the state machine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header<'a> {
    Connection { keep_alive: bool },
    ContentLength(usize),
    ContentType { json: bool },
    Host(&'a str),
    Other,
}

/// Split a header line at its first colon and classify it.
pub fn parse_header(line: &[u8]) -> Result<Header<'_>, ParseError> {
    let colon = memchr::memchr(b':', line).ok_or(ParseError::BadHeader)?;
    let name = &line[..colon];
    let mut value = &line[colon + 1..];
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }

    if name.eq_ignore_ascii_case(b"Connection") {
        Ok(Header::Connection {
            keep_alive: value.eq_ignore_ascii_case(b"keep-alive"),
        })
    } else if name.eq_ignore_ascii_case(b"Content-Length") {
        let value = std::str::from_utf8(value).map_err(|_| ParseError::BadContentLength)?;
        let len = value
            .trim_end()
            .parse::<usize>()
            .map_err(|_| ParseError::BadContentLength)?;
        Ok(Header::ContentLength(len))
    } else if name.eq_ignore_ascii_case(b"Content-Type") {
        let json = value.len() >= 16 && value[..16].eq_ignore_ascii_case(b"application/json");
        Ok(Header::ContentType { json })
    } else if name.eq_ignore_ascii_case(b"Host") {
        let host = std::str::from_utf8(value).map_err(|_| ParseError::BadHeader)?;
        Ok(Header::Host(host))
    } else {
        Ok(Header::Other)
    }
}
