//! # upwell-collab: Peer sync, relay and storage for Upwell documents
//!
//! Keeps drafts and family metadata in sync between peers through a relay,
//! and stores serialized families locally and remotely.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌──────────────┐   JSON frames    ┌──────────────┐
//! │ SyncTransport│ ◄──────────────► │ RelayServer  │ ◄──────────────► │ SyncTransport│
//! │ (peer A)     │                  │ rooms per id │                  │ (peer B)     │
//! └──────┬───────┘                  └──────────────┘                  └──────┬───────┘
//!        │ SyncSession                                                       │
//!        ▼                                                                   ▼
//! ┌──────────────┐                                                    ┌──────────────┐
//! │ SyncTarget   │ Draft, Upwell metadata, LiveDraft                  │ SyncTarget   │
//! └──────────────┘                                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames (`OPEN`, `MESSAGE`, `BYE`, `CURSOR`)
//! - [`session`]: Per-peer sync state machine, socket free
//! - [`transport`]: Async websocket transport with reconnect backoff
//! - [`live`]: Live draft queueing attributed remote transactions
//! - [`room`]: Relay rooms with broadcast fan-out
//! - [`server`]: Websocket relay server
//! - [`storage`]: Blob stores (memory, RocksDB)
//! - [`documents`]: Local-first manager of open families

pub mod backoff;
pub mod documents;
pub mod live;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

pub use backoff::Backoff;
pub use documents::{Documents, DocumentsError};
pub use live::{LiveDraft, Transaction};
pub use protocol::{CursorPosition, Method, ProtocolError, WireMessage};
pub use room::{RelayFrame, Room, RoomManager, RoomStats};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{PeerSyncState, Received, Step, SyncSession, TransportEvent, TransportState};
pub use storage::{ItemMetadata, MemoryStore, RocksStore, Storage, StoreConfig, StoreError};
pub use transport::{SyncTarget, SyncTransport, TransportConfig};
