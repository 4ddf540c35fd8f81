//! `sync_client`
//!
//! Client-side sync core:
//! - WebSocket transport with fixed-delay reconnect
//! - Protocol router (handshake state machine, typed session events)
//! - Session manager (identity, slot, online/offline mode, send primitives)
//! - Entity registry and per-entity sync
//! - Interpolation for remote vehicles
//!
//! Threading model: socket IO runs on tokio tasks; all protocol and entity
//! state lives on the thread calling [`SyncContext::tick`].

pub mod context;
pub mod entity_sync;
pub mod interp;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

pub use context::SyncContext;
