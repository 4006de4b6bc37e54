//! # Message Codec
//!
//! Framing for the node's line protocol.
//!
//! ## Wire Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ClientGet                 ◄── message name                             │
//! │  URI=KSK@fcpboard|...      ◄── Key=Value fields, one per line           │
//! │  Identifier=get-1a2b-7                                                  │
//! │  EndMessage                ◄── terminator                               │
//! │                                                                         │
//! │  AllData                                                                │
//! │  Identifier=get-1a2b-7                                                  │
//! │  DataLength=1234                                                        │
//! │  Data                      ◄── terminator, DataLength raw bytes follow  │
//! │  <1234 bytes>                                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::io::{BufRead, Read};

use fcpboard_core::keys::encode_key;

use crate::error::{FcpError, FcpResult};

/// Longest line accepted from the node, terminator included.
pub const MAX_LINE_LEN: usize = 32 * 1024;

/// How a message's field block is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// `EndMessage`: no payload follows.
    EndMessage,
    /// `Data`: a raw payload of `DataLength` bytes follows.
    Data,
}

impl Terminator {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Terminator::EndMessage => "EndMessage",
            Terminator::Data => "Data",
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// An outgoing message, built field by field.
///
/// ## Example
/// ```rust
/// use fcpboard_fcp::codec::{Request, Terminator};
///
/// let wire = Request::new("ClientHello")
///     .field("Name", "board-sync-1")
///     .field("ExpectedVersion", "2.0")
///     .encode(Terminator::EndMessage);
/// assert_eq!(wire, "ClientHello\nName=board-sync-1\nExpectedVersion=2.0\nEndMessage\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    name: String,
    fields: Vec<(String, String)>,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field.
    pub fn field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    /// Appends a field only when a value is present.
    pub fn field_opt<V: ToString>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    /// Appends a key field, percent-encoded.
    pub fn key_field(self, key: impl Into<String>, uri: &str) -> Self {
        self.field(key, encode_key(uri))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First value of a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Renders the message header including the terminator line.
    pub fn encode(&self, terminator: Terminator) -> String {
        let mut out = String::with_capacity(64 + self.fields.len() * 32);
        out.push_str(&self.name);
        out.push('\n');
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push('=');
            // Line breaks would end the field early.
            out.push_str(&value.replace(['\n', '\r'], " "));
            out.push('\n');
        }
        out.push_str(terminator.as_str());
        out.push('\n');
        out
    }
}

// =============================================================================
// Replies
// =============================================================================

/// A parsed message from the node. Payload bytes, if any, are still on the
/// stream when this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    name: String,
    fields: BTreeMap<String, String>,
    terminator: Terminator,
}

impl Reply {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// `true`/`false` field; anything else reads as false.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn identifier(&self) -> Option<&str> {
        self.get("Identifier")
    }

    pub fn data_length(&self) -> Option<u64> {
        self.get_u64("DataLength")
    }

    /// True when a raw payload follows on the stream.
    pub fn has_data(&self) -> bool {
        self.terminator == Terminator::Data
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

/// Reads one line of at most [`MAX_LINE_LEN`] bytes into `line`.
fn read_bounded_line<R: BufRead>(reader: &mut R, line: &mut String) -> FcpResult<usize> {
    let read = reader.by_ref().take(MAX_LINE_LEN as u64).read_line(line)?;
    if read == MAX_LINE_LEN && !line.ends_with('\n') {
        return Err(FcpError::MalformedReply(format!(
            "line longer than {MAX_LINE_LEN} bytes"
        )));
    }
    Ok(read)
}

/// Reads one message from the stream.
///
/// Returns `Ok(None)` on a clean end of stream before any message line.
/// Blank lines between messages are skipped.
pub fn read_reply<R: BufRead>(reader: &mut R) -> FcpResult<Option<Reply>> {
    let mut line = String::new();

    let name = loop {
        line.clear();
        if read_bounded_line(reader, &mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if !trimmed.is_empty() {
            break trimmed.to_string();
        }
    };

    let mut fields = BTreeMap::new();
    loop {
        line.clear();
        if read_bounded_line(reader, &mut line)? == 0 {
            return Err(FcpError::UnexpectedEof);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        match trimmed {
            "EndMessage" => {
                return Ok(Some(Reply {
                    name,
                    fields,
                    terminator: Terminator::EndMessage,
                }))
            }
            "Data" => {
                return Ok(Some(Reply {
                    name,
                    fields,
                    terminator: Terminator::Data,
                }))
            }
            "" => continue,
            _ => {
                let (key, value) = trimmed.split_once('=').ok_or_else(|| {
                    FcpError::MalformedReply(format!("{name}: line without '=': {trimmed}"))
                })?;
                fields.insert(key.to_string(), value.to_string());
            }
        }
    }
}
