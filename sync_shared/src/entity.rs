//! Entity identity and replicated state.
//!
//! An entity is one participating vehicle. Its id is the participant's network
//! id, so it doubles as the registry key and the `carId` on the wire.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::math::{Quat, Vec3};

/// Opaque entity id, stable for the lifetime of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    /// Generates an id for a participant that has not been assigned one by a server.
    pub fn generate_local() -> Self {
        let n: u64 = rand::thread_rng().gen();
        EntityId(format!("local-{n:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        EntityId(s)
    }
}

/// Kinematic state of a body: what gets sampled locally and applied remotely.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BodyState {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
}

impl BodyState {
    pub fn at(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            velocity: Vec3::ZERO,
        }
    }
}

/// Where a spawned vehicle is placed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpawnPoint {
    pub position: Vec3,
    #[serde(default)]
    pub rotation: Quat,
}

impl SpawnPoint {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }
}
