//! # fcpboard-fcp: Node Protocol Client
//!
//! Blocking client for the node's line-oriented client protocol.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         fcpboard-fcp                                    │
//! │                                                                         │
//! │  ┌────────────────────┐       ┌────────────────────────────────────┐   │
//! │  │ SingleShotClient   │       │ PersistentQueueClient              │   │
//! │  │  get / put         │       │  watch / list / modify / remove    │   │
//! │  │  generate_ssk      │       │  enqueue get / put                 │   │
//! │  │  plugin_info       │       │  anti-deadlock data retrieval      │   │
//! │  └─────────┬──────────┘       └─────────────────┬──────────────────┘   │
//! │            │                                    │                       │
//! │            ▼                                    ▼                       │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ FcpSocket: connect, ClientHello/NodeHello, timeouts, close       │  │
//! │  │ dda: TestDDA negotiation                                         │  │
//! │  │ codec: Name / Key=Value / EndMessage|Data                        │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  Connector ──► TcpConnector (or a scripted stream in tests)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each single-shot request owns its socket from open to close on the
//! calling thread. No socket is shared between threads except the
//! persistent control connection, which is split into a writer and a
//! dedicated reader thread.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod codec;
pub mod dda;
pub mod error;
pub mod ids;
pub mod persistent;
pub mod single_shot;
pub mod socket;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{FcpError, FcpResult};
pub use ids::IdGenerator;
pub use persistent::{
    DirectGetOutcome, EnqueueOutcome, PersistentEvent, PersistentQueueClient,
    PersistentQueueListener,
};
pub use single_shot::{SingleShotClient, TransferClient};
pub use socket::{Connector, FcpSocket, NodeAddress, ReadTimeout, TcpConnector};
pub use types::*;
