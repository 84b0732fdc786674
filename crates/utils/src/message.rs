//! Message representation used by the authentication pipeline.
//!
//! [`EmailMessage`] keeps structured [RFC 5322](https://www.rfc-editor.org/rfc/rfc5322)
//! headers next to the original bytes as received, so header edits made by
//! the pipeline never disturb the byte sequence handed to DKIM verification.

use crate::{normalize_crlf, parse_raw_headers};

/// A received message with editable headers.
///
/// Headers are stored as an ordered `Vec` (preserving RFC 5322 order and
/// supporting duplicate headers such as `Received`). A cached `raw` field
/// holds the full serialized form; call [`rebuild`](Self::rebuild) after
/// modifying headers so that [`raw`](Self::raw) reflects the changes.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    /// Ordered list of MIME headers (case-preserved keys, trimmed values).
    headers: Vec<(String, String)>,

    /// Message body after the blank-line separator (RFC 5322 body).
    body: String,

    /// Cached full serialization (headers + blank line + body).
    raw: String,

    /// Original bytes as received, never modified after construction.
    original_raw: Vec<u8>,
}

impl EmailMessage {
    /// Builds the message from the bytes received on the wire.
    ///
    /// Non UTF-8 sequences are replaced in the editable view only, the
    /// original bytes are kept untouched.
    pub fn new(raw: Vec<u8>) -> Self {
        let text = String::from_utf8_lossy(&raw).into_owned();
        let (headers, content) = parse_raw_headers(&text);
        let body = content.to_string();
        Self {
            headers,
            body,
            raw: text,
            original_raw: raw,
        }
    }

    pub fn from_raw(raw: &str) -> Self {
        Self::new(raw.as_bytes().to_vec())
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns whether at least one header named `name` is present.
    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Returns the full serialized email (headers + blank line + content).
    ///
    /// Call [`rebuild`](Self::rebuild) after modifying headers to ensure
    /// this is up to date.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns the original bytes as received, before any header edits.
    pub fn original_raw(&self) -> &[u8] {
        &self.original_raw
    }

    /// Returns the original bytes with CRLF line endings, the form
    /// signature verification operates on.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        normalize_crlf(&self.original_raw)
    }

    /// Returns the message body after the header section.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns a reference to the ordered header list.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Prepends a header to the beginning of the header list.
    ///
    /// The cached [`raw`](Self::raw) field is **not** updated automatically,
    /// call [`rebuild`](Self::rebuild) once after all header modifications.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(0, (name.to_string(), value.to_string()));
    }

    /// Removes every header named `name` (case-insensitive), returning how
    /// many were removed.
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    /// Rebuilds the cached [`raw`](Self::raw) field from the headers and body.
    ///
    /// Pre-computes the exact byte length, allocates once, and writes all
    /// parts via `push_str`.
    pub fn rebuild(&mut self) {
        let headers_len: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + 2 + v.len() + 2)
            .sum();

        let capacity = headers_len + if self.headers.is_empty() { 0 } else { 2 } + self.body.len();

        let mut raw = String::with_capacity(capacity);

        for (key, value) in &self.headers {
            raw.push_str(key);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push_str("\r\n");
        }

        if !self.headers.is_empty() {
            raw.push_str("\r\n");
        }

        raw.push_str(&self.body);

        self.raw = raw;
    }
}
