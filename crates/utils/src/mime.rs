//! Header-level parsing helpers shared by the message model and the
//! verification collaborators.

/// Parses headers from a raw email, returning an ordered list of headers
/// and a reference to the content after the blank-line separator.
///
/// Headers are preserved in their original order with case-preserved keys
/// and trimmed values. Folded continuation lines (starting with a space or
/// tab) are unfolded into the previous header value, joined by a single
/// space, which keeps tag-list headers such as `DKIM-Signature` readable.
///
/// # Examples
///
/// ```rust
/// let (headers, content) = authgate_utils::parse_raw_headers(
///     "From: alice@example.com\r\nDKIM-Signature: v=1;\r\n\td=example.com\r\n\r\nHello!"
/// );
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[0], ("From".to_string(), "alice@example.com".to_string()));
/// assert_eq!(headers[1].1, "v=1; d=example.com");
/// assert_eq!(content, "Hello!");
/// ```
pub fn parse_raw_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    for line in raw.lines() {
        let end = pos + line.len();
        let consumed = if raw[end..].starts_with("\r\n") {
            end + 2
        } else if raw[end..].starts_with('\n') {
            end + 1
        } else {
            end
        };

        if line.trim().is_empty() {
            pos = consumed;
            break;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(line.trim());
                pos = consumed;
                continue;
            }
        }

        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        } else {
            // Line is not a header (no colon) and not blank, treat as start of content
            break;
        }

        pos = consumed;
    }

    (headers, &raw[pos..])
}

/// Normalizes line endings to CRLF, converting every bare `\n` into
/// `\r\n` while leaving existing `\r\n` pairs untouched.
///
/// ```rust
/// assert_eq!(
///     authgate_utils::normalize_crlf(b"a\nb\r\nc"),
///     b"a\r\nb\r\nc".to_vec()
/// );
/// ```
pub fn normalize_crlf(raw: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(raw.len() + raw.len() / 32);
    let mut previous = 0u8;
    for &byte in raw {
        if byte == b'\n' && previous != b'\r' {
            normalized.push(b'\r');
        }
        normalized.push(byte);
        previous = byte;
    }
    normalized
}

/// Parses a `tag=value; tag=value` list as used by DKIM, ARC, DMARC and
/// BIMI records. Tag names are lowercased, values are trimmed and empty
/// segments are ignored.
pub fn parse_tag_list(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|segment| {
            let (tag, value) = segment.split_once('=')?;
            let tag = tag.trim();
            if tag.is_empty() {
                return None;
            }
            Some((tag.to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

/// Returns the value of `tag` in a tag list (see [`parse_tag_list`]).
pub fn tag_value<'a>(tags: &'a [(String, String)], tag: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(tag))
        .map(|(_, value)| value.as_str())
}

/// Extracts the bare address from a header value such as
/// `"Alice" <alice@example.com>`, falling back to the trimmed value.
pub fn header_address(value: &str) -> &str {
    match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim(),
        _ => value.trim(),
    }
}

/// Returns the lowercased domain part of an address, if any.
///
/// ```rust
/// assert_eq!(
///     authgate_utils::address_domain("<Bob@Example.COM>").as_deref(),
///     Some("example.com")
/// );
/// assert_eq!(authgate_utils::address_domain("postmaster"), None);
/// ```
pub fn address_domain(address: &str) -> Option<String> {
    let address = header_address(address);
    let (_, domain) = address.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('.');
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

/// Approximates the organizational domain as the last two labels.
///
/// No public suffix list is consulted, `mail.example.co.uk` therefore
/// yields `co.uk`.
pub fn organizational_domain(domain: &str) -> String {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return domain;
    }
    labels[labels.len() - 2..].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_headers_unfolds_continuations() {
        let raw = "ARC-Seal: i=1; a=rsa-sha256;\r\n d=relay.example;\r\n\ts=sel\r\nSubject: Hi\r\n\r\nBody";
        let (headers, content) = parse_raw_headers(raw);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].1, "i=1; a=rsa-sha256; d=relay.example; s=sel");
        assert_eq!(headers[1], ("Subject".to_string(), "Hi".to_string()));
        assert_eq!(content, "Body");
    }

    #[test]
    fn test_parse_raw_headers_plain_text() {
        let (headers, content) = parse_raw_headers("Just plain text");
        assert!(headers.is_empty());
        assert_eq!(content, "Just plain text");
    }

    #[test]
    fn test_normalize_crlf_idempotent() {
        let once = normalize_crlf(b"From: a@b\nSubject: x\n\nbody\n");
        assert_eq!(once, b"From: a@b\r\nSubject: x\r\n\r\nbody\r\n".to_vec());
        assert_eq!(normalize_crlf(&once), once);
    }

    #[test]
    fn test_parse_tag_list() {
        let tags = parse_tag_list("v=DMARC1; P=reject ; adkim=s;;  ");
        assert_eq!(tag_value(&tags, "v"), Some("DMARC1"));
        assert_eq!(tag_value(&tags, "p"), Some("reject"));
        assert_eq!(tag_value(&tags, "adkim"), Some("s"));
        assert_eq!(tag_value(&tags, "aspf"), None);
    }

    #[test]
    fn test_header_address() {
        assert_eq!(header_address("\"Alice\" <alice@example.com>"), "alice@example.com");
        assert_eq!(header_address("  bob@example.com "), "bob@example.com");
    }

    #[test]
    fn test_organizational_domain() {
        assert_eq!(organizational_domain("mail.news.Example.com."), "example.com");
        assert_eq!(organizational_domain("example.com"), "example.com");
        assert_eq!(organizational_domain("localhost"), "localhost");
    }
}
