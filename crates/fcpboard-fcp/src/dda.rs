//! # Direct Disk Access
//!
//! Proves to the node that client and node share a filesystem, so payloads
//! can be exchanged as file paths instead of socket bytes.
//!
//! ```text
//!  client                                   node
//!    │ TestDDARequest (dir, want r/w)   ──►   │
//!    │                                  ◄──   │ TestDDAReply (read file, write file + content)
//!    │ read the read file,                    │
//!    │ write the content to the write file    │
//!    │ TestDDAResponse (read content)   ──►   │
//!    │                                  ◄──   │ TestDDAComplete (allowed r/w)
//!    │ remove the write file                  │
//! ```
//!
//! The node remembers the result per connection, so every connection that
//! wants disk transfers runs its own probe.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::codec::{Reply, Request};
use crate::error::{FcpError, FcpResult};
use crate::socket::FcpSocket;

/// What the node agreed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DdaAccess {
    pub read: bool,
    pub write: bool,
}

/// Runs the probe for `dir` on an open connection.
pub fn test_dda(
    socket: &mut FcpSocket,
    dir: &Path,
    want_read: bool,
    want_write: bool,
) -> FcpResult<DdaAccess> {
    let directory = dir.display().to_string();
    socket.send(
        &Request::new("TestDDARequest")
            .field("Directory", &directory)
            .field("WantReadDirectory", want_read)
            .field("WantWriteDirectory", want_write),
    )?;

    let reply = expect(socket, "TestDDAReply", &directory)?;

    let mut written: Option<PathBuf> = None;
    let result = respond(socket, &reply, &directory, want_read, want_write, &mut written);

    if let Some(path) = written {
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Could not remove DDA probe file");
        }
    }

    if let Ok(access) = &result {
        debug!(directory = %directory, read = access.read, write = access.write, "DDA probe finished");
    }
    result
}

fn respond(
    socket: &mut FcpSocket,
    reply: &Reply,
    directory: &str,
    want_read: bool,
    want_write: bool,
    written: &mut Option<PathBuf>,
) -> FcpResult<DdaAccess> {
    let mut response = Request::new("TestDDAResponse").field("Directory", directory);

    if want_read {
        if let Some(read_file) = reply.get("ReadFilename") {
            // An unreadable file just means the node refuses read access.
            let content = fs::read_to_string(read_file).unwrap_or_default();
            response = response.field("ReadContent", content.trim_end());
        }
    }

    if want_write {
        if let Some(write_file) = reply.get("WriteFilename") {
            let path = PathBuf::from(write_file);
            fs::write(&path, reply.get("ContentToWrite").unwrap_or_default())?;
            *written = Some(path);
        }
    }

    socket.send(&response)?;
    let complete = expect(socket, "TestDDAComplete", directory)?;
    Ok(DdaAccess {
        read: complete.get_bool("ReadDirectoryAllowed"),
        write: complete.get_bool("WriteDirectoryAllowed"),
    })
}

/// Runs the probe and fails unless every wanted access was granted.
pub fn require_dda(
    socket: &mut FcpSocket,
    dir: &Path,
    want_read: bool,
    want_write: bool,
) -> FcpResult<()> {
    let access = test_dda(socket, dir, want_read, want_write)?;
    if (want_read && !access.read) || (want_write && !access.write) {
        return Err(FcpError::DdaDenied(dir.display().to_string()));
    }
    Ok(())
}

fn expect(socket: &mut FcpSocket, name: &str, directory: &str) -> FcpResult<Reply> {
    match socket.read_reply()? {
        Some(reply) if reply.is(name) => Ok(reply),
        Some(reply) if reply.is("ProtocolError") => Err(FcpError::Protocol(format!(
            "DDA probe for {directory}: {}",
            reply.get("CodeDescription").unwrap_or("refused")
        ))),
        Some(reply) => Err(FcpError::Protocol(format!(
            "expected {name}, got {}",
            reply.name()
        ))),
        None => Err(FcpError::UnexpectedEof),
    }
}
