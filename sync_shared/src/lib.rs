//! `sync_shared`
//!
//! Shared libraries used by both the sync client and the relay.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - One wire codec for both ends of the connection.
//! - Traits for abstraction and dependency injection (the vehicle body seam).
//! - No `unsafe`.

pub mod body;
pub mod config;
pub mod entity;
pub mod event;
pub mod math;
pub mod wire;
