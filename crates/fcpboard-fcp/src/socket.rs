//! # Node Socket
//!
//! One connection to the node: open, handshake, send requests, read replies
//! and payloads, close.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Connector::connect ──► set read timeout ──► ClientHello ──► NodeHello  │
//! │                                                    │                    │
//! │                                           anything else: close, Err     │
//! │                                                                         │
//! │  send / write_raw / read_reply / read_payload_to_file   (any order)     │
//! │                                                                         │
//! │  close()  ◄── idempotent; also runs on Drop                            │
//! │  after close every operation returns FcpError::Closed                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::codec::{read_reply, Reply, Request, Terminator};
use crate::error::{FcpError, FcpResult};
use crate::ids::IdGenerator;

/// Default node protocol port.
pub const DEFAULT_PORT: u16 = 9481;

/// Protocol version announced in the hello.
pub const EXPECTED_VERSION: &str = "2.0";

// =============================================================================
// Timeouts
// =============================================================================

/// Idle connections and payload transfers.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Requests the node should answer promptly.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Read timeout of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTimeout {
    /// Block forever. Used by the persistent listener connection;
    /// [`FcpSocket::set_timeout`] is a no-op on such sockets.
    Infinite,
    After(Duration),
}

impl ReadTimeout {
    pub const LONG: ReadTimeout = ReadTimeout::After(LONG_TIMEOUT);

    pub const SHORT: ReadTimeout = ReadTimeout::After(SHORT_TIMEOUT);

    fn as_option(&self) -> Option<Duration> {
        match self {
            ReadTimeout::Infinite => None,
            ReadTimeout::After(d) => Some(*d),
        }
    }
}

// =============================================================================
// Addressing & Transport
// =============================================================================

/// Where the node listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for NodeAddress {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A bidirectional byte stream to the node.
pub trait NodeStream: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shuts down both directions. Unblocks readers on cloned handles.
    fn shutdown(&mut self) -> io::Result<()>;

    /// A second handle to the same connection.
    fn try_clone_stream(&self) -> io::Result<Box<dyn NodeStream>>;
}

impl NodeStream for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn try_clone_stream(&self) -> io::Result<Box<dyn NodeStream>> {
        Ok(Box::new(self.try_clone()?))
    }
}

/// Opens streams to the node.
pub trait Connector: Send + Sync {
    fn address(&self) -> String;

    fn connect(&self) -> io::Result<Box<dyn NodeStream>>;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: NodeAddress,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    fn address(&self) -> String {
        self.address.to_string()
    }

    fn connect(&self) -> io::Result<Box<dyn NodeStream>> {
        let mut last_err = None;
        for addr in (self.address.host.as_str(), self.address.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "node address resolved to nothing")
        }))
    }
}

// =============================================================================
// FcpSocket
// =============================================================================

/// One handshaken connection to the node.
pub struct FcpSocket {
    stream: Option<BufReader<Box<dyn NodeStream>>>,
    timeout: ReadTimeout,
    name: String,
    node_hello: Option<Reply>,
}

impl fmt::Debug for FcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FcpSocket")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("closed", &self.stream.is_none())
            .finish()
    }
}

impl FcpSocket {
    /// Connects and performs the hello handshake.
    ///
    /// The read timeout is applied once, before the handshake. On any
    /// failure the stream is shut down before the error is returned.
    pub fn open(
        connector: &dyn Connector,
        ids: &IdGenerator,
        timeout: ReadTimeout,
    ) -> FcpResult<Self> {
        let stream = connector.connect().map_err(|e| FcpError::ConnectFailed {
            address: connector.address(),
            reason: e.to_string(),
        })?;

        let mut socket = FcpSocket {
            stream: Some(BufReader::new(stream)),
            timeout,
            name: ids.next("conn"),
            node_hello: None,
        };

        if let Err(e) = socket.handshake(timeout) {
            debug!(connection = %socket.name, error = %e, "Handshake failed");
            socket.close();
            return Err(e);
        }

        trace!(connection = %socket.name, "Connected to node");
        Ok(socket)
    }

    fn handshake(&mut self, timeout: ReadTimeout) -> FcpResult<()> {
        self.stream_mut()?
            .get_mut()
            .set_read_timeout(timeout.as_option())?;

        let hello = Request::new("ClientHello")
            .field("Name", &self.name)
            .field("ExpectedVersion", EXPECTED_VERSION);
        self.send(&hello)?;

        match self.read_reply()? {
            Some(reply) if reply.is("NodeHello") => {
                self.node_hello = Some(reply);
                Ok(())
            }
            Some(reply) => Err(FcpError::HandshakeRejected(reply.name().to_string())),
            None => Err(FcpError::UnexpectedEof),
        }
    }

    fn stream_mut(&mut self) -> FcpResult<&mut BufReader<Box<dyn NodeStream>>> {
        self.stream.as_mut().ok_or(FcpError::Closed)
    }

    /// Connection name announced in the hello.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node's hello reply.
    pub fn node_hello(&self) -> FcpResult<&Reply> {
        if self.stream.is_none() {
            return Err(FcpError::Closed);
        }
        self.node_hello.as_ref().ok_or(FcpError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Changes the read timeout. No-op on an infinite-timeout socket.
    pub fn set_timeout(&mut self, timeout: Duration) -> FcpResult<()> {
        if self.timeout == ReadTimeout::Infinite {
            return Ok(());
        }
        self.stream_mut()?.get_mut().set_read_timeout(Some(timeout))?;
        self.timeout = ReadTimeout::After(timeout);
        Ok(())
    }

    /// Sends a message terminated by `EndMessage`.
    pub fn send(&mut self, request: &Request) -> FcpResult<()> {
        self.send_header(request, Terminator::EndMessage)
    }

    /// Sends a message header. With [`Terminator::Data`] the caller must
    /// follow up with exactly `DataLength` raw bytes.
    pub fn send_header(&mut self, request: &Request, terminator: Terminator) -> FcpResult<()> {
        trace!(connection = %self.name, message = request.name(), "Sending");
        let wire = request.encode(terminator);
        let stream = self.stream_mut()?.get_mut();
        stream.write_all(wire.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    /// Writes raw payload bytes and flushes without closing the stream.
    pub fn write_raw(&mut self, bytes: &[u8]) -> FcpResult<()> {
        let stream = self.stream_mut()?.get_mut();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Streams a reader's contents as payload. Returns bytes written.
    pub fn write_from(&mut self, source: &mut dyn Read) -> FcpResult<u64> {
        let stream = self.stream_mut()?.get_mut();
        let written = io::copy(source, stream)?;
        stream.flush()?;
        Ok(written)
    }

    /// Reads the next message. `Ok(None)` means the node closed the stream.
    pub fn read_reply(&mut self) -> FcpResult<Option<Reply>> {
        let reply = read_reply(self.stream_mut()?)?;
        if let Some(r) = &reply {
            trace!(connection = %self.name, message = r.name(), "Received");
        }
        Ok(reply)
    }

    /// Copies up to `length` payload bytes into a new file at `path`.
    ///
    /// Returns the number of bytes written, which is less than `length` if
    /// the stream ended early. Callers compare and discard short files.
    pub fn read_payload_to_file(&mut self, length: u64, path: &Path) -> FcpResult<u64> {
        let reader = self.stream_mut()?;
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        let written = io::copy(&mut reader.by_ref().take(length), &mut out)?;
        out.flush()?;
        Ok(written)
    }

    /// Reads and drops `length` payload bytes.
    pub fn skip_payload(&mut self, length: u64) -> FcpResult<u64> {
        let reader = self.stream_mut()?;
        Ok(io::copy(&mut reader.by_ref().take(length), &mut io::sink())?)
    }

    /// A writable handle to the same connection, for a split reader/writer.
    pub fn try_clone_writer(&self) -> FcpResult<Box<dyn NodeStream>> {
        let stream = self.stream.as_ref().ok_or(FcpError::Closed)?;
        Ok(stream.get_ref().try_clone_stream()?)
    }

    /// Shuts the connection down. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.get_mut().shutdown() {
                // Already closed by the peer.
                if e.kind() != io::ErrorKind::NotConnected {
                    warn!(connection = %self.name, error = %e, "Error closing node connection");
                }
            }
            trace!(connection = %self.name, "Closed");
        }
    }
}

impl Drop for FcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
