//! The canonical signing block.
//!
//! Requests and responses are signed over the same byte rendering: every
//! field emitted as a `key=value` line terminated by `\n`, keys sorted
//! ASCII-ascending. The terminator after every field (the last one included)
//! keeps field boundaries unambiguous when an attacker controls the values.

use std::collections::BTreeMap;

/// The fields composing a signing domain. For responses, `body` is the
/// (possibly encrypted) response body and the nonce/timestamp are the fresh
/// server-generated pair.
#[derive(Debug, Clone, Copy)]
pub struct SignFields<'a> {
    pub nonce: &'a str,
    pub timestamp: &'a str,
    pub platform: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub body: &'a [u8],
}

/// Renders the sorted, newline-terminated block. This exact byte sequence is
/// what gets signed and verified.
pub fn canonical_block(fields: &SignFields<'_>) -> Vec<u8> {
    let mut entries: BTreeMap<&str, &[u8]> = BTreeMap::new();
    entries.insert("body", fields.body);
    entries.insert("method", fields.method.as_bytes());
    entries.insert("nonce", fields.nonce.as_bytes());
    entries.insert("path", fields.path.as_bytes());
    entries.insert("platform", fields.platform.as_bytes());
    entries.insert("query", fields.query.as_bytes());
    entries.insert("timestamp", fields.timestamp.as_bytes());

    let total: usize = entries
        .iter()
        .map(|(key, value)| key.len() + value.len() + 2)
        .sum();
    let mut out = Vec::with_capacity(total);
    for (key, value) in entries {
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value);
        out.push(b'\n');
    }
    out
}
