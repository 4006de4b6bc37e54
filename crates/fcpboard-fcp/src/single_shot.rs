//! # Single-Shot Transfers
//!
//! Every get, put, key generation or plugin query opens its own connection
//! and closes it when the request ends, whatever the outcome.
//!
//! ## Get Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  open (long timeout)                                                    │
//! │   │                                                                     │
//! │   ├── DDA enabled? ── probe target dir for write ── ok ──► ReturnType=disk
//! │   │                                      └── refused ───► ReturnType=direct
//! │   ▼                                                                     │
//! │  ClientGet ──► loop read_reply:                                         │
//! │                 SimpleProgress       ─► progress sink                   │
//! │                 ExpectedHashes       ─► blocklisted? abort (Disabled)   │
//! │                 DataFound (disk)     ─► Success                         │
//! │                 AllData (direct)     ─► stream DataLength bytes to file │
//! │                 GetFailed            ─► Failed {code, fatal, redirect}  │
//! │                 IdentifierCollision  ─► IdentifierCollision             │
//! │                 ProtocolError, EOF   ─► Failed                          │
//! │   │                                                                     │
//! │  close, remove temp files; on failure remove the target                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fcpboard_core::keys::decode_incoming_key;
use tracing::{debug, info, warn};

use crate::codec::{Reply, Request, Terminator};
use crate::dda::require_dda;
use crate::error::{FcpError, FcpResult};
use crate::ids::IdGenerator;
use crate::socket::{Connector, FcpSocket, ReadTimeout};
use crate::types::{
    GetRequest, GetResult, HashBlocklist, PluginInfo, PutMode, PutRequest, PutResult, ReturnType,
    SimpleProgress, SskKeypair, TargetFilename, TransferProgress, VERBOSITY_ALL,
};

/// Blocking download/upload seam used by the sync layer.
pub trait TransferClient: Send + Sync {
    fn get(&self, request: &GetRequest) -> GetResult;

    fn put(&self, request: &PutRequest) -> PutResult;
}

/// Opens a fresh connection per request.
pub struct SingleShotClient {
    connector: Arc<dyn Connector>,
    ids: Arc<IdGenerator>,
    use_dda: bool,
    blocklist: Option<Arc<dyn HashBlocklist>>,
    progress: Option<Arc<dyn TransferProgress>>,
}

impl SingleShotClient {
    pub fn new(connector: Arc<dyn Connector>, ids: Arc<IdGenerator>) -> Self {
        Self {
            connector,
            ids,
            use_dda: false,
            blocklist: None,
            progress: None,
        }
    }

    /// Try direct disk access before falling back to socket transfers.
    pub fn with_dda(mut self, enabled: bool) -> Self {
        self.use_dda = enabled;
        self
    }

    pub fn with_blocklist(mut self, blocklist: Arc<dyn HashBlocklist>) -> Self {
        self.blocklist = Some(blocklist);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn TransferProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn open(&self, timeout: ReadTimeout) -> FcpResult<FcpSocket> {
        FcpSocket::open(self.connector.as_ref(), &self.ids, timeout)
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Downloads a key to `request.target`.
    pub fn get(&self, request: &GetRequest) -> GetResult {
        let mut socket = match self.open(ReadTimeout::LONG) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %request.key, error = %e, "Get: no connection to node");
                return GetResult::connection_failure(&e);
            }
        };

        let temp = temp_path(&request.target);
        let result = self.run_get(&mut socket, request, &temp);
        socket.close();

        remove_if_exists(&temp);
        if !result.is_success() {
            remove_if_exists(&request.target);
        }
        result
    }

    fn run_get(&self, socket: &mut FcpSocket, request: &GetRequest, temp: &Path) -> GetResult {
        let return_type = match request.target.parent() {
            Some(dir) => self.negotiate_return(socket, dir, false, true),
            None => ReturnType::Direct,
        };
        let identifier = self.ids.next("get");

        let mut msg = client_get(request, &identifier)
            .field("Persistence", "connection")
            .field("Global", false)
            .field("ReturnType", return_type.as_str());
        if return_type == ReturnType::Disk {
            msg = msg
                .field("Filename", request.target.display())
                .field("TempFilename", temp.display());
        }

        if let Err(e) = socket.send(&msg) {
            return GetResult::connection_failure(&e);
        }

        loop {
            let reply = match socket.read_reply() {
                Ok(Some(r)) => r,
                Ok(None) => return GetResult::connection_failure(&FcpError::UnexpectedEof),
                Err(e) => return GetResult::connection_failure(&e),
            };

            match reply.name() {
                "SimpleProgress" => self.report_progress(&identifier, &reply),
                "ExpectedHashes" => {
                    if let Some(reason) = self.blocked_reason(&reply) {
                        info!(key = %request.key, "Get aborted: content hash is blocklisted");
                        return GetResult::disabled(reason);
                    }
                }
                "DataFound" if return_type == ReturnType::Disk => {
                    return GetResult::success(reply.data_length().unwrap_or(0));
                }
                "AllData" => return self.receive_all_data(socket, &reply, &request.target),
                "GetFailed" => return get_failed(&reply),
                "ProtocolError" => {
                    return GetResult::failed(
                        reply.get_i32("Code"),
                        reply.get_bool("Fatal"),
                        describe(&reply, "protocol error"),
                    )
                }
                "IdentifierCollision" => return GetResult::identifier_collision(),
                "UnknownNodeIdentifier" | "UnknownPeerNoteType" => {
                    return GetResult::failed(None, true, reply.name().to_string())
                }
                other => debug!(identifier = %identifier, message = other, "Get: ignoring reply"),
            }
        }
    }

    fn receive_all_data(&self, socket: &mut FcpSocket, reply: &Reply, target: &Path) -> GetResult {
        let Some(expected) = reply.data_length() else {
            return GetResult::failed(None, false, "AllData without DataLength");
        };
        match socket.read_payload_to_file(expected, target) {
            Ok(received) if received == expected => GetResult::success(received),
            Ok(received) => GetResult::failed(
                None,
                false,
                format!("payload truncated: received {received} of {expected} bytes"),
            ),
            Err(e) => GetResult::connection_failure(&e),
        }
    }

    // =========================================================================
    // Put
    // =========================================================================

    /// Inserts a file, or only computes its key.
    pub fn put(&self, request: &PutRequest) -> PutResult {
        let mut socket = match self.open(ReadTimeout::LONG) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %request.key, error = %e, "Put: no connection to node");
                return PutResult::connection_failure(&e);
            }
        };

        let result = self.run_put(&mut socket, request);
        socket.close();
        result
    }

    fn run_put(&self, socket: &mut FcpSocket, request: &PutRequest) -> PutResult {
        let source_len = match fs::metadata(&request.source) {
            Ok(meta) => meta.len(),
            Err(e) => return PutResult::error(format!("cannot read {}: {e}", request.source.display())),
        };

        let upload_from = match request.source.parent() {
            Some(dir) => self.negotiate_return(socket, dir, true, false),
            None => ReturnType::Direct,
        };
        let identifier = self.ids.next("put");

        let msg = client_put(request, &identifier)
            .field("Persistence", "connection")
            .field("Global", false);

        let sent = match upload_from {
            ReturnType::Disk => socket.send(
                &msg.field("UploadFrom", "disk")
                    .field("Filename", request.source.display()),
            ),
            ReturnType::Direct => self.send_direct(socket, msg, &request.source, source_len),
        };
        if let Err(e) = sent {
            return PutResult::connection_failure(&e);
        }

        let mut generated: Option<String> = None;
        loop {
            let reply = match socket.read_reply() {
                Ok(Some(r)) => r,
                Ok(None) => return PutResult::connection_failure(&FcpError::UnexpectedEof),
                Err(e) => return PutResult::connection_failure(&e),
            };

            match reply.name() {
                "URIGenerated" => {
                    let key = reply.get("URI").map(decode_incoming_key);
                    if request.is_key_only() {
                        return match key {
                            Some(k) => PutResult::key_only(k),
                            None => PutResult::error("URIGenerated without URI"),
                        };
                    }
                    generated = key;
                }
                "PutSuccessful" => {
                    return match reply.get("URI").map(decode_incoming_key).or(generated) {
                        Some(k) => PutResult::success(k),
                        None => PutResult::error("PutSuccessful without URI"),
                    };
                }
                "PutFailed" => {
                    return PutResult::from_failure(
                        reply.get_i32("Code"),
                        describe(&reply, "insert failed"),
                    )
                }
                "ProtocolError" => {
                    return PutResult::from_failure(None, describe(&reply, "protocol error"))
                }
                "IdentifierCollision" => return PutResult::identifier_collision(),
                "UnknownNodeIdentifier" | "UnknownPeerNoteType" => {
                    return PutResult::error(reply.name().to_string())
                }
                "SimpleProgress" => self.report_progress(&identifier, &reply),
                other => debug!(identifier = %identifier, message = other, "Put: ignoring reply"),
            }
        }
    }

    fn send_direct(
        &self,
        socket: &mut FcpSocket,
        msg: Request,
        source: &Path,
        length: u64,
    ) -> FcpResult<()> {
        let mut file = File::open(source)?;
        socket.send_header(
            &msg.field("UploadFrom", "direct").field("DataLength", length),
            Terminator::Data,
        )?;
        let written = socket.write_from(&mut file)?;
        if written != length {
            return Err(FcpError::Protocol(format!(
                "{} changed size during upload",
                source.display()
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Keys & Plugins
    // =========================================================================

    /// Asks the node for a new signed-subspace key pair.
    pub fn generate_ssk(&self) -> FcpResult<SskKeypair> {
        let mut socket = self.open(ReadTimeout::SHORT)?;
        let identifier = self.ids.next("ssk");
        socket.send(&Request::new("GenerateSSK").field("Identifier", &identifier))?;

        let result = loop {
            match socket.read_reply()? {
                Some(reply) if reply.is("SSKKeypair") => {
                    let insert = reply.get("InsertURI").map(decode_incoming_key);
                    let request = reply.get("RequestURI").map(decode_incoming_key);
                    break match (insert, request) {
                        (Some(insert_uri), Some(request_uri)) => Ok(SskKeypair {
                            insert_uri,
                            request_uri,
                        }),
                        _ => Err(FcpError::MalformedReply("SSKKeypair without URIs".into())),
                    };
                }
                Some(reply) if reply.is("ProtocolError") => {
                    break Err(FcpError::Protocol(describe(&reply, "GenerateSSK refused")))
                }
                Some(_) => continue,
                None => break Err(FcpError::UnexpectedEof),
            }
        };
        socket.close();
        result
    }

    /// Looks up a plugin by name. `Ok(None)` if it is not loaded.
    pub fn plugin_info(&self, plugin_name: &str) -> FcpResult<Option<PluginInfo>> {
        let mut socket = self.open(ReadTimeout::SHORT)?;
        socket.send(
            &Request::new("GetPluginInfo")
                .field("Identifier", self.ids.next("plugin"))
                .field("PluginName", plugin_name)
                .field("Detailed", false),
        )?;

        let result = loop {
            match socket.read_reply()? {
                Some(reply) if reply.is("PluginInfo") => {
                    break Ok(Some(PluginInfo {
                        name: reply.get("PluginName").unwrap_or(plugin_name).to_string(),
                        origin_uri: reply.get("OriginUri").map(str::to_string),
                        is_talkable: reply.get_bool("IsTalkable"),
                        version: reply
                            .get("LongVersion")
                            .or_else(|| reply.get("Version"))
                            .map(str::to_string),
                    }))
                }
                Some(reply) if reply.is("ProtocolError") => break Ok(None),
                Some(_) => continue,
                None => break Err(FcpError::UnexpectedEof),
            }
        };
        socket.close();
        result
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Disk transfer if DDA is enabled and the node grants it for `dir`.
    fn negotiate_return(
        &self,
        socket: &mut FcpSocket,
        dir: &Path,
        want_read: bool,
        want_write: bool,
    ) -> ReturnType {
        if !self.use_dda {
            return ReturnType::Direct;
        }
        match require_dda(socket, dir, want_read, want_write) {
            Ok(()) => ReturnType::Disk,
            Err(e) => {
                debug!(directory = %dir.display(), error = %e, "DDA unavailable, using direct transfer");
                ReturnType::Direct
            }
        }
    }

    fn report_progress(&self, identifier: &str, reply: &Reply) {
        if let Some(sink) = &self.progress {
            sink.progress(identifier, &parse_progress(reply));
        }
    }

    fn blocked_reason(&self, reply: &Reply) -> Option<String> {
        let blocklist = self.blocklist.as_ref()?;
        let hash = reply.get("Hashes.SHA256")?;
        blocklist
            .is_blocked(hash)
            .then(|| format!("content hash {hash} is blocklisted"))
    }
}

impl TransferClient for SingleShotClient {
    fn get(&self, request: &GetRequest) -> GetResult {
        SingleShotClient::get(self, request)
    }

    fn put(&self, request: &PutRequest) -> PutResult {
        SingleShotClient::put(self, request)
    }
}

/// `ClientGet` fields shared by single-shot and persistent gets.
pub(crate) fn client_get(request: &GetRequest, identifier: &str) -> Request {
    Request::new("ClientGet")
        .field("IgnoreDS", false)
        .field("DSOnly", false)
        .key_field("URI", &request.key)
        .field("Identifier", identifier)
        .field("MaxRetries", request.retries.wire_value())
        .field("Verbosity", VERBOSITY_ALL)
        .field_opt("PriorityClass", request.priority)
        .field_opt("MaxSize", request.max_size)
}

/// `ClientPut` fields shared by single-shot and persistent puts.
pub(crate) fn client_put(request: &PutRequest, identifier: &str) -> Request {
    let target_filename = match &request.target_filename {
        TargetFilename::Omit => String::new(),
        TargetFilename::Name(name) => name.clone(),
    };

    let mut msg = Request::new("ClientPut")
        .key_field("URI", &request.key)
        .field("Identifier", identifier)
        .field("Verbosity", VERBOSITY_ALL)
        .field("MaxRetries", request.max_retries)
        .field("DontCompress", !request.compress)
        .field("TargetFilename", target_filename);

    if request.quick_heal {
        msg = msg
            .field("ExtraInsertsSingleBlock", 0)
            .field("ExtraInsertsSplitfileHeaderBlock", 0)
            .field("EarlyEncode", true);
    } else {
        msg = msg
            .field_opt("ExtraInsertsSingleBlock", request.extra_inserts_single_block)
            .field_opt(
                "ExtraInsertsSplitfileHeaderBlock",
                request.extra_inserts_header_block,
            );
    }

    msg = msg
        .field_opt("OverrideSplitfileCryptoKey", request.crypto_key.as_deref())
        .field_opt("CompatibilityMode", request.compatibility_mode.as_deref());

    match request.mode {
        PutMode::KeyOnly => msg.field("GetCHKOnly", true),
        PutMode::Insert { priority } => msg.field("PriorityClass", priority),
    }
}

pub(crate) fn parse_progress(reply: &Reply) -> SimpleProgress {
    SimpleProgress {
        total: reply.get_u64("Total").unwrap_or(0),
        required: reply.get_u64("Required").unwrap_or(0),
        failed: reply.get_u64("Failed").unwrap_or(0),
        fatally_failed: reply.get_u64("FatallyFailed").unwrap_or(0),
        succeeded: reply.get_u64("Succeeded").unwrap_or(0),
        finalized: reply.get_bool("FinalizedTotal"),
    }
}

pub(crate) fn get_failed(reply: &Reply) -> GetResult {
    let mut result = GetResult::failed(
        reply.get_i32("Code"),
        reply.get_bool("Fatal"),
        describe(reply, "get failed"),
    );
    result.redirect_key = reply.get("RedirectURI").map(decode_incoming_key);
    result
}

pub(crate) fn describe(reply: &Reply, fallback: &str) -> String {
    reply
        .get("ExtraDescription")
        .or_else(|| reply.get("CodeDescription"))
        .or_else(|| reply.get("ShortCodeDescription"))
        .unwrap_or(fallback)
        .to_string()
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove file"),
    }
}
