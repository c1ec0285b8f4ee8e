//! Extraction of `username` / `password` / `email` from a login or
//! registration body.
//!
//! Two decoders are provided. [`LenientCredentialDecoder`] is a substring
//! scanner: for each key it finds the quoted key, the first `:` after it and
//! the first pair of `"` after that, and takes what lies between. It knows
//! nothing about escapes, so a value containing `\"` is cut short at the
//! escaped quote. [`StrictCredentialDecoder`] parses the body as a JSON
//! object with `serde_json`.

use memchr::memmem;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Turns a raw request body into [`Credentials`]. `None` means the body
/// lacks a username or password and the request is malformed.
pub trait CredentialDecoder: Send + Sync {
    fn decode(&self, body: &[u8]) -> Option<Credentials>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LenientCredentialDecoder;

impl LenientCredentialDecoder {
    fn field(body: &[u8], quoted_key: &[u8]) -> Option<String> {
        let key_at = memmem::find(body, quoted_key)?;
        let rest = &body[key_at + quoted_key.len()..];
        let colon = memchr::memchr(b':', rest)?;
        let rest = &rest[colon + 1..];
        let open = memchr::memchr(b'"', rest)?;
        let rest = &rest[open + 1..];
        let close = memchr::memchr(b'"', rest)?;
        Some(String::from_utf8_lossy(&rest[..close]).into_owned())
    }
}

impl CredentialDecoder for LenientCredentialDecoder {
    fn decode(&self, body: &[u8]) -> Option<Credentials> {
        Some(Credentials {
            username: Self::field(body, b"\"username\"")?,
            password: Self::field(body, b"\"password\"")?,
            email: Self::field(body, b"\"email\""),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StrictCredentialDecoder;

impl CredentialDecoder for StrictCredentialDecoder {
    fn decode(&self, body: &[u8]) -> Option<Credentials> {
        match serde_json::from_slice(body) {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                tracing::debug!(error = %e, "credential body rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_extracts_fields() {
        let creds = LenientCredentialDecoder
            .decode(br#"{"username":"alice","password":"pw"}"#)
            .unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "pw");
        assert_eq!(creds.email, None);

        let creds = LenientCredentialDecoder
            .decode(br#"{ "email" : "a@b.c", "password": "pw", "username" :"bob" }"#)
            .unwrap();
        assert_eq!(creds.username, "bob");
        assert_eq!(creds.email.as_deref(), Some("a@b.c"));
    }

    #[test]
    fn lenient_requires_username_and_password() {
        assert!(LenientCredentialDecoder.decode(br#"{"username":"alice"}"#).is_none());
        assert!(LenientCredentialDecoder.decode(br#"{"password":"pw"}"#).is_none());
        assert!(LenientCredentialDecoder.decode(b"").is_none());
    }

    #[test]
    fn lenient_stops_at_escaped_quote() {
        let creds = LenientCredentialDecoder
            .decode(br#"{"username":"al\"ice","password":"pw"}"#)
            .unwrap();
        assert_eq!(creds.username, "al\\");
    }

    #[test]
    fn lenient_accepts_non_json_shapes() {
        // Only the substrings matter.
        let creds = LenientCredentialDecoder
            .decode(br#"junk "username" garbage: "u" "password":"p""#)
            .unwrap();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p");
    }

    #[test]
    fn strict_handles_escapes() {
        let creds = StrictCredentialDecoder
            .decode(br#"{"username":"al\"ice","password":"pw","email":"e@x"}"#)
            .unwrap();
        assert_eq!(creds.username, "al\"ice");
        assert_eq!(creds.email.as_deref(), Some("e@x"));
    }

    #[test]
    fn strict_rejects_invalid_bodies() {
        assert!(StrictCredentialDecoder.decode(br#"{"username":"alice"}"#).is_none());
        assert!(StrictCredentialDecoder.decode(b"username=alice").is_none());
    }
}
