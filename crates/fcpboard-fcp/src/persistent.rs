//! # Persistent Queue Client
//!
//! Drives the node's durable global queue: jobs survive client restarts and
//! report progress to whoever watches the queue.
//!
//! ## Connections
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  control connection (long-lived, infinite timeout)                      │
//! │    writer ──► WatchGlobal, ListPersistentRequests,                      │
//! │               ModifyPersistentRequest, RemoveRequest  (no reply awaited)│
//! │    reader thread ──► PersistentEvent ──► PersistentQueueListener        │
//! │                                                                         │
//! │  per-operation connections (short-lived)                                │
//! │    enqueue get/put: DDA probe, ClientGet/ClientPut, close               │
//! │    direct retrieval: GetRequestStatus, AllData, close                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Anti-deadlock Retrieval
//! ```text
//!  attempt 1 (30 s) ──timeout──► attempt 2 (5 min) ──timeout──► attempt 3 (30 s)
//!       │                             │                              │
//!       └──────── any reply ──────────┴──────────────────────────────┤
//!                                                                    ▼
//!     AllData: raise timeout to 30 min, copy DataLength bytes, verify
//!              (a stall mid-payload is a truncated transfer, never a retry)
//!     other:   protocol failure, no further attempts
//!     3 timeouts: NoAnswer
//! ```
//! Retrieving a finished job's payload can wedge the node's reply queue for
//! a connection indefinitely. An aborted attempt usually makes the next
//! connection answer quickly, hence the long middle attempt.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fcpboard_core::keys::decode_incoming_key;
use tracing::{debug, error, info, warn};

use crate::codec::{Reply, Request, Terminator};
use crate::dda::{require_dda, test_dda};
use crate::error::{FcpError, FcpResult};
use crate::ids::IdGenerator;
use crate::single_shot::{client_get, client_put, describe, get_failed, parse_progress};
use crate::socket::{Connector, FcpSocket, NodeStream, ReadTimeout, LONG_TIMEOUT};
use crate::types::{
    GetRequest, GetResult, PriorityClass, PutRequest, PutResult, ReturnType, SimpleProgress,
    VERBOSITY_ALL,
};

/// Read timeouts of the three retrieval attempts.
pub const DIRECT_GET_ATTEMPTS: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30),
];

// =============================================================================
// Events
// =============================================================================

/// A reply seen on the control connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistentEvent {
    PersistentGet {
        identifier: String,
        key: String,
        return_type: Option<String>,
        filename: Option<PathBuf>,
    },
    PersistentPut {
        identifier: String,
        key: String,
        filename: Option<PathBuf>,
    },
    Progress {
        identifier: String,
        progress: SimpleProgress,
    },
    DataFound {
        identifier: String,
        data_length: Option<u64>,
    },
    GetFailed {
        identifier: String,
        result: GetResult,
    },
    PutSuccessful {
        identifier: String,
        key: Option<String>,
    },
    PutFailed {
        identifier: String,
        result: PutResult,
    },
    UriGenerated {
        identifier: String,
        key: String,
    },
    RequestRemoved {
        identifier: String,
    },
    EndOfList,
    ProtocolError {
        identifier: Option<String>,
        code: Option<i32>,
        description: String,
    },
    IdentifierCollision {
        identifier: String,
    },
    Other(Reply),
}

impl PersistentEvent {
    pub fn from_reply(reply: Reply) -> Self {
        let identifier = reply.identifier().unwrap_or_default().to_string();
        let key = reply.get("URI").map(decode_incoming_key);
        let name = reply.name().to_string();

        match name.as_str() {
            "PersistentGet" => PersistentEvent::PersistentGet {
                key: key.unwrap_or_default(),
                return_type: reply.get("ReturnType").map(str::to_string),
                filename: reply.get("Filename").map(PathBuf::from),
                identifier,
            },
            "PersistentPut" => PersistentEvent::PersistentPut {
                key: key.unwrap_or_default(),
                filename: reply.get("Filename").map(PathBuf::from),
                identifier,
            },
            "SimpleProgress" => PersistentEvent::Progress {
                progress: parse_progress(&reply),
                identifier,
            },
            "DataFound" => PersistentEvent::DataFound {
                data_length: reply.data_length(),
                identifier,
            },
            "GetFailed" => PersistentEvent::GetFailed {
                result: get_failed(&reply),
                identifier,
            },
            "PutSuccessful" => PersistentEvent::PutSuccessful {
                key,
                identifier,
            },
            "PutFailed" => PersistentEvent::PutFailed {
                result: PutResult::from_failure(
                    reply.get_i32("Code"),
                    describe(&reply, "insert failed"),
                ),
                identifier,
            },
            "URIGenerated" => PersistentEvent::UriGenerated {
                key: key.unwrap_or_default(),
                identifier,
            },
            "PersistentRequestRemoved" => PersistentEvent::RequestRemoved { identifier },
            "EndListPersistentRequests" => PersistentEvent::EndOfList,
            "ProtocolError" => PersistentEvent::ProtocolError {
                identifier: reply.identifier().map(str::to_string),
                code: reply.get_i32("Code"),
                description: describe(&reply, "protocol error"),
            },
            "IdentifierCollision" => PersistentEvent::IdentifierCollision { identifier },
            _ => PersistentEvent::Other(reply),
        }
    }
}

/// Receives control connection events on the reader thread.
pub trait PersistentQueueListener: Send + Sync {
    fn on_event(&self, event: PersistentEvent);

    /// The control connection is gone. No further events follow.
    fn disconnected(&self);
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of enqueueing a persistent job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued {
        identifier: String,
        return_type: ReturnType,
    },
    /// Disk access was refused; nothing was enqueued.
    DdaUnavailable,
}

/// Result of fetching a finished job's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectGetOutcome {
    Completed { bytes: u64 },
    /// Stream ended early; the partial file was removed.
    Truncated { expected: u64, received: u64 },
    /// No attempt got any reply. Retry the whole job later.
    NoAnswer,
}

enum Attempt {
    TimedOut,
    Done(DirectGetOutcome),
}

// =============================================================================
// Client
// =============================================================================

/// Client for the node's global persistent queue.
pub struct PersistentQueueClient {
    connector: Arc<dyn Connector>,
    ids: Arc<IdGenerator>,
    writer: Mutex<Box<dyn NodeStream>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl PersistentQueueClient {
    /// Opens the control connection and starts its reader thread.
    pub fn connect(
        connector: Arc<dyn Connector>,
        ids: Arc<IdGenerator>,
        listener: Arc<dyn PersistentQueueListener>,
    ) -> FcpResult<Self> {
        let socket = FcpSocket::open(connector.as_ref(), &ids, ReadTimeout::Infinite)?;
        let writer = socket.try_clone_writer()?;
        let connected = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&connected);
        let reader = thread::Builder::new()
            .name("fcp-persistent-reader".into())
            .spawn(move || read_events(socket, listener, flag))?;

        info!(node = %connector.address(), "Persistent queue connected");
        Ok(Self {
            connector,
            ids,
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, request: &Request) -> FcpResult<()> {
        if !self.is_connected() {
            return Err(FcpError::Closed);
        }
        let mut writer = self.writer.lock().map_err(|_| FcpError::Closed)?;
        writer.write_all(request.encode(Terminator::EndMessage).as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    // =========================================================================
    // Fire-and-forget Commands
    // =========================================================================

    /// Subscribes to progress of all global jobs. The mask matches the one
    /// used when enqueueing, otherwise progress of those jobs is not sent.
    pub fn watch_global(&self, enabled: bool) -> FcpResult<()> {
        self.send(
            &Request::new("WatchGlobal")
                .field("Enabled", enabled)
                .field("VerbosityMask", VERBOSITY_ALL),
        )
    }

    /// Asks for a `PersistentGet`/`PersistentPut` per job, then an end marker.
    pub fn list_persistent_requests(&self) -> FcpResult<()> {
        self.send(&Request::new("ListPersistentRequests"))
    }

    pub fn modify_priority(&self, identifier: &str, priority: PriorityClass) -> FcpResult<()> {
        self.send(
            &Request::new("ModifyPersistentRequest")
                .field("Identifier", identifier)
                .field("Global", true)
                .field("PriorityClass", priority),
        )
    }

    pub fn remove_request(&self, identifier: &str) -> FcpResult<()> {
        self.send(
            &Request::new("RemoveRequest")
                .field("Identifier", identifier)
                .field("Global", true),
        )
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Enqueues a download. Without disk access the job returns its data
    /// directly, to be fetched later with [`Self::start_direct_persistent_get`].
    pub fn start_persistent_get(&self, request: &GetRequest) -> FcpResult<EnqueueOutcome> {
        let mut socket = self.open(ReadTimeout::SHORT)?;

        let dir = request.target.parent().unwrap_or_else(|| Path::new("."));
        let return_type = match test_dda(&mut socket, dir, false, true) {
            Ok(access) if access.write => ReturnType::Disk,
            Ok(_) => ReturnType::Direct,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                debug!(directory = %dir.display(), error = %e, "DDA probe failed");
                ReturnType::Direct
            }
        };

        let identifier = self.ids.next("pget");
        let mut msg = client_get(request, &identifier)
            .field("Persistence", "forever")
            .field("Global", true)
            .field("ReturnType", return_type.as_str());
        if return_type == ReturnType::Disk {
            msg = msg.field("Filename", request.target.display());
        }
        socket.send(&msg)?;
        socket.close();

        debug!(identifier = %identifier, key = %request.key, return_type = return_type.as_str(), "Persistent get enqueued");
        Ok(EnqueueOutcome::Enqueued {
            identifier,
            return_type,
        })
    }

    /// Enqueues an upload of a file the node reads from disk.
    ///
    /// Returns [`EnqueueOutcome::DdaUnavailable`] without enqueueing when the
    /// node may not read the source directory.
    pub fn start_persistent_put_using_dda(&self, request: &PutRequest) -> FcpResult<EnqueueOutcome> {
        let mut socket = self.open(ReadTimeout::SHORT)?;

        let dir = request.source.parent().unwrap_or_else(|| Path::new("."));
        match require_dda(&mut socket, dir, true, false) {
            Ok(()) => {}
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                info!(directory = %dir.display(), error = %e, "Persistent put needs disk access");
                return Ok(EnqueueOutcome::DdaUnavailable);
            }
        }

        let identifier = self.ids.next("pput");
        let msg = client_put(request, &identifier)
            .field("Persistence", "forever")
            .field("Global", true)
            .field("UploadFrom", "disk")
            .field("Filename", request.source.display());
        socket.send(&msg)?;
        socket.close();

        debug!(identifier = %identifier, key = %request.key, "Persistent put enqueued");
        Ok(EnqueueOutcome::Enqueued {
            identifier,
            return_type: ReturnType::Disk,
        })
    }

    // =========================================================================
    // Anti-deadlock Retrieval
    // =========================================================================

    /// Fetches the buffered payload of a finished global get into `target`.
    ///
    /// Runs the fixed attempt sequence in [`DIRECT_GET_ATTEMPTS`]; only a
    /// timeout before the node's first reply moves on to the next attempt. Connect failures and unexpected
    /// replies end the sequence with an error.
    pub fn start_direct_persistent_get(
        &self,
        identifier: &str,
        target: &Path,
    ) -> FcpResult<DirectGetOutcome> {
        for (attempt, timeout) in DIRECT_GET_ATTEMPTS.iter().enumerate() {
            match self.direct_get_attempt(identifier, target, *timeout)? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::TimedOut => {
                    warn!(
                        identifier,
                        attempt = attempt + 1,
                        timeout_secs = timeout.as_secs(),
                        "No answer retrieving persistent data"
                    );
                }
            }
        }
        error!(identifier, "Node never answered data retrieval, deferring");
        Ok(DirectGetOutcome::NoAnswer)
    }

    fn direct_get_attempt(
        &self,
        identifier: &str,
        target: &Path,
        timeout: Duration,
    ) -> FcpResult<Attempt> {
        let mut socket = match self.open(ReadTimeout::After(timeout)) {
            Ok(s) => s,
            Err(FcpError::Timeout) => return Ok(Attempt::TimedOut),
            Err(e) => return Err(e),
        };

        let result = receive_persistent_data(&mut socket, identifier, target);
        socket.close();

        match result {
            Err(FcpError::Timeout) => Ok(Attempt::TimedOut),
            other => other.map(Attempt::Done),
        }
    }

    fn open(&self, timeout: ReadTimeout) -> FcpResult<FcpSocket> {
        FcpSocket::open(self.connector.as_ref(), &self.ids, timeout)
    }

    /// Closes the control connection and waits for the reader thread.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.shutdown();
        }

        let handle = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = handle {
            // Closing from inside a listener callback must not join itself.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Persistent reader thread panicked");
            }
        }
    }
}

impl Drop for PersistentQueueClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_persistent_data(
    socket: &mut FcpSocket,
    identifier: &str,
    target: &Path,
) -> FcpResult<DirectGetOutcome> {
    socket.send(
        &Request::new("GetRequestStatus")
            .field("Identifier", identifier)
            .field("Global", true)
            .field("OnlyData", true),
    )?;

    let reply = socket.read_reply()?.ok_or(FcpError::UnexpectedEof)?;
    if !(reply.is("AllData") && reply.has_data()) {
        return Err(FcpError::Protocol(format!(
            "expected AllData for {identifier}, got {}",
            reply.name()
        )));
    }
    let expected = reply
        .data_length()
        .ok_or_else(|| FcpError::MalformedReply("AllData without DataLength".into()))?;

    // The node may pause while it decompresses.
    socket.set_timeout(LONG_TIMEOUT)?;

    let received = match socket.read_payload_to_file(expected, target) {
        Ok(n) => n,
        // The node already answered; whatever reached the file is all we get.
        Err(FcpError::Timeout) => fs::metadata(target).map(|m| m.len()).unwrap_or(0),
        Err(e) => {
            let _ = fs::remove_file(target);
            return Err(e);
        }
    };
    if received != expected {
        let _ = fs::remove_file(target);
        return Ok(DirectGetOutcome::Truncated { expected, received });
    }
    Ok(DirectGetOutcome::Completed { bytes: received })
}

fn read_events(
    mut socket: FcpSocket,
    listener: Arc<dyn PersistentQueueListener>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match socket.read_reply() {
            Ok(Some(reply)) => {
                if reply.has_data() {
                    let length = reply.data_length().unwrap_or(0);
                    if let Err(e) = socket.skip_payload(length) {
                        debug!(error = %e, "Control connection lost while skipping payload");
                        break;
                    }
                }
                listener.on_event(PersistentEvent::from_reply(reply));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Control connection read failed");
                break;
            }
        }
    }

    socket.close();
    if connected.swap(false, Ordering::SeqCst) {
        warn!("Persistent queue disconnected");
        listener.disconnected();
    }
}
