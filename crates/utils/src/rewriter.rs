//! Header side effects of the pipeline.
//!
//! Only two edits are ever made: the SPF diagnostic header is added in
//! front of the message, and sender-supplied BIMI headers are removed once
//! the BIMI stage has had its turn.

use crate::Transaction;

/// Name of the SPF diagnostic header.
pub const SPF_HEADER: &str = "Received-SPF";

/// Sender-controlled headers that must never reach delivery.
pub const SENDER_BIMI_HEADERS: [&str; 2] = ["bimi-location", "bimi-indicator"];

/// Strips a leading `Label:` from a raw header line, everything up to and
/// including the first colon, and trims surrounding whitespace.
///
/// ```rust
/// assert_eq!(
///     authgate_utils::spf_header_value("Received-SPF: pass (mx.local: sender OK)\r\n"),
///     "pass (mx.local: sender OK)"
/// );
/// assert_eq!(authgate_utils::spf_header_value("  none "), "none");
/// ```
pub fn spf_header_value(raw: &str) -> &str {
    match raw.split_once(':') {
        Some((_, value)) => value.trim(),
        None => raw.trim(),
    }
}

/// Adds the SPF diagnostic header derived from the verdict's raw line.
pub fn insert_spf_header(transaction: &mut Transaction, raw: &str) {
    transaction.add_leading_header(SPF_HEADER, spf_header_value(raw));
}

/// Removes every inbound `BIMI-Location` and `BIMI-Indicator` header,
/// returning how many were removed.
pub fn strip_sender_bimi_headers(transaction: &mut Transaction) -> usize {
    SENDER_BIMI_HEADERS
        .iter()
        .map(|name| transaction.remove_header(name))
        .sum()
}
