//! # Node Keys
//!
//! Percent-coding of key strings exchanged with the node, and composition of
//! the per-day slot keys a board uses.
//!
//! ## Why Both Directions Matter
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Key Encoding Contract                              │
//! │                                                                         │
//! │  OUTGOING (client → node)                                              │
//! │  ────────────────────────                                              │
//! │  KSK@fcpboard|message|my board|2024.1.1-0.json                         │
//! │        │ encode_key()                                                   │
//! │        ▼                                                                │
//! │  KSK@fcpboard%7Cmessage%7Cmy%20board%7C2024.1.1-0.json                 │
//! │                                                                         │
//! │  The node silently strips unencoded special characters, so a raw key  │
//! │  turns into a DIFFERENT key without any error.                          │
//! │                                                                         │
//! │  INCOMING (node → client)                                              │
//! │  ────────────────────────                                              │
//! │  freenet:CHK%40abc,def,AAMC--8/file.txt                                 │
//! │        │ decode_incoming_key()                                          │
//! │        ▼                                                                │
//! │  CHK@abc,def,AAMC--8/file.txt                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{Datelike, NaiveDate};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::types::Board;
use crate::KEY_NAMESPACE;

/// Bytes left as-is: RFC 3986 unreserved, sub-delims minus `+`, and `: @ /`.
///
/// `+` is escaped because form decoders on the node side read it as a space.
const KEY_ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b':')
    .remove(b'@')
    .remove(b'/');

// =============================================================================
// Key Types
// =============================================================================

/// The key families the node understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Content hash key.
    Chk,
    /// Signed subspace key.
    Ssk,
    /// Updatable subspace key.
    Usk,
    /// Keyword signed key.
    Ksk,
}

impl KeyType {
    /// All key types, in marker search order.
    pub const ALL: [KeyType; 4] = [KeyType::Chk, KeyType::Ssk, KeyType::Usk, KeyType::Ksk];

    /// The `XXX@` prefix that starts a key of this type.
    pub const fn marker(&self) -> &'static str {
        match self {
            KeyType::Chk => "CHK@",
            KeyType::Ssk => "SSK@",
            KeyType::Usk => "USK@",
            KeyType::Ksk => "KSK@",
        }
    }

    /// Detects the key type from the start of a decoded key.
    pub fn of(key: &str) -> Option<KeyType> {
        KeyType::ALL.into_iter().find(|t| key.starts_with(t.marker()))
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.marker()[..3])
    }
}

// =============================================================================
// Percent Coding
// =============================================================================

/// Percent-encodes a key for sending to the node (path style, space = `%20`).
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ESCAPE_SET).to_string()
}

/// Percent-decodes a key fragment. Invalid UTF-8 sequences are replaced.
pub fn decode_key(encoded: &str) -> String {
    percent_decode_str(encoded).decode_utf8_lossy().into_owned()
}

/// Decodes a key received from the node and trims it to its key-type marker.
///
/// The node may prefix keys with a scheme (`freenet:`) or pad them with
/// whitespace. When no marker is present the decoded, trimmed text is
/// returned unchanged.
pub fn decode_incoming_key(raw: &str) -> String {
    let decoded = decode_key(raw.trim());
    let start = KeyType::ALL
        .iter()
        .filter_map(|t| decoded.find(t.marker()))
        .min();

    match start {
        Some(pos) => decoded[pos..].trim().to_string(),
        None => decoded.trim().to_string(),
    }
}

// =============================================================================
// Board Key Composition
// =============================================================================

/// Formats a day bucket the way board keys embed it (`2024.1.1`).
pub fn format_day(day: NaiveDate) -> String {
    format!("{}.{}.{}", day.year(), day.month(), day.day())
}

/// Composes the key a message for `board` on `day` at `index` is fetched from.
///
/// Public boards share a keyword namespace; access-controlled boards live
/// under the board's public key.
pub fn compose_download_key(board: &Board, day: NaiveDate, index: u32) -> String {
    match board.public_key() {
        Some(public_key) => compose_signed_key(public_key, board, day, index),
        None => compose_public_key(board, day, index),
    }
}

/// Composes the key a message for `board` on `day` at `index` is inserted to.
///
/// Returns `None` for access-controlled boards without a private key.
pub fn compose_upload_key(board: &Board, day: NaiveDate, index: u32) -> Option<String> {
    if !board.is_access_controlled() {
        return Some(compose_public_key(board, day, index));
    }
    board
        .private_key()
        .map(|private_key| compose_signed_key(private_key, board, day, index))
}

fn compose_public_key(board: &Board, day: NaiveDate, index: u32) -> String {
    format!(
        "KSK@{}|message|{}|{}-{}.json",
        KEY_NAMESPACE,
        board.filename(),
        format_day(day),
        index
    )
}

fn compose_signed_key(base: &str, board: &Board, day: NaiveDate, index: u32) -> String {
    format!(
        "{}/{}|{}-{}.json",
        base.trim_end_matches('/'),
        board.filename(),
        format_day(day),
        index
    )
}
