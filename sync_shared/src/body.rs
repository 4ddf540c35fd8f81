//! Vehicle body abstraction.
//!
//! The sync core never touches physics or transforms directly. A body is the
//! two-way seam to the gameplay layer: local sync pulls a snapshot from it on
//! its send timer, remote sync pushes the interpolated state into it every tick.

use crate::entity::{BodyState, EntityId, SpawnPoint};

/// Collaborator surface for one vehicle.
pub trait EntityBody: Send {
    /// Current transform and velocity of a locally simulated body.
    fn local_state_snapshot(&self) -> BodyState;

    /// Writes replicated state onto the transform of a remote body.
    fn apply_remote_state(&mut self, state: &BodyState);

    /// Race gate: whether player input may move this body.
    fn set_input_enabled(&mut self, _enabled: bool) {}
}

/// Builds bodies for remote participants.
pub trait BodyFactory: Send {
    fn spawn(&mut self, id: &EntityId, at: &SpawnPoint) -> Box<dyn EntityBody>;
}

/// In-memory body that stores whatever it is given.
///
/// Useful headless: the demo client drives one as its local vehicle and the
/// tests read remote state back out of it.
#[derive(Debug, Clone, Default)]
pub struct KinematicBody {
    pub state: BodyState,
    pub input_enabled: bool,
}

impl KinematicBody {
    pub fn new(state: BodyState) -> Self {
        Self {
            state,
            input_enabled: false,
        }
    }
}

impl EntityBody for KinematicBody {
    fn local_state_snapshot(&self) -> BodyState {
        self.state
    }

    fn apply_remote_state(&mut self, state: &BodyState) {
        self.state = *state;
    }

    fn set_input_enabled(&mut self, enabled: bool) {
        self.input_enabled = enabled;
    }
}

/// Spawns a [`KinematicBody`] at the requested spawn point.
#[derive(Debug, Default)]
pub struct KinematicFactory;

impl BodyFactory for KinematicFactory {
    fn spawn(&mut self, _id: &EntityId, at: &SpawnPoint) -> Box<dyn EntityBody> {
        Box::new(KinematicBody::new(BodyState::at(at.position, at.rotation)))
    }
}
