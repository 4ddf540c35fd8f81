//! `sync_relay`
//!
//! Room relay for the sync envelope:
//! - Groups clients into fixed-capacity sessions per game
//! - Assigns participant ids (`p1`, `p2`, ...)
//! - Announces joins and leaves
//! - Forwards `event` frames verbatim to the rest of the session
//!
//! Networking model:
//! - WebSocket text frames over TCP
//! - One task per client; a shared room table

pub mod server;

pub use server::RelayServer;
