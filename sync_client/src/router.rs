//! Protocol router.
//!
//! Turns decoded envelopes into session mutations and typed events. Runs on
//! the simulation thread only.

use std::collections::BTreeSet;

use sync_shared::{
    entity::EntityId,
    wire::{Envelope, SyncSample},
};
use tracing::{debug, info, warn};

use crate::session::{Role, Session};

/// Something the rest of the client reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Handshake done. `previous_id` is the local id before the server
    /// assigned one.
    Welcomed {
        previous_id: EntityId,
        local_id: EntityId,
        slot: u32,
        role: Role,
    },
    PeerJoined(EntityId),
    PeerLeft(EntityId),
    /// The session reached its capacity; the game may start. Fires once per
    /// session.
    SessionReady,
    EntityUpdate(SyncSample),
    ServerError(String),
}

/// Handshake state machine.
#[derive(Debug, Default)]
pub struct Router {
    peers: BTreeSet<EntityId>,
    ready_fired: bool,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes one text frame. Never panics; unknown input is logged.
    pub fn route(&mut self, session: &mut Session, frame: &str) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        match Envelope::decode(frame) {
            Envelope::Welcome {
                net_id,
                session_id,
                game,
                capacity,
                session_size,
            } => {
                let previous_id = session.local_id.clone();
                if !net_id.is_empty() {
                    session.local_id = EntityId::new(net_id);
                }
                session.session_id = session_id;
                if !game.is_empty() {
                    session.game = game;
                }
                session.capacity = capacity;
                session.current_size = session_size.max(1);
                session.slot = session.current_size - 1;
                session.role = if session.current_size == 1 {
                    Role::Host
                } else {
                    Role::Guest
                };
                session.welcomed = true;
                self.peers.clear();
                self.ready_fired = false;
                info!(
                    local_id = %session.local_id,
                    session = %session.session_id,
                    size = session.current_size,
                    capacity = session.capacity,
                    "Welcomed"
                );
                events.push(SessionEvent::Welcomed {
                    previous_id,
                    local_id: session.local_id.clone(),
                    slot: session.slot,
                    role: session.role,
                });
                // The last arrival gets no peer_joined for itself.
                self.check_ready(session, &mut events);
            }
            Envelope::PeerJoined { net_id } => {
                let id = EntityId::new(net_id);
                if !session.welcomed || id.is_empty() || id == session.local_id {
                    debug!(peer = %id, "Ignoring peer_joined");
                    return events;
                }
                if !self.peers.insert(id.clone()) {
                    debug!(peer = %id, "Peer already tracked");
                    return events;
                }
                session.current_size += 1;
                info!(peer = %id, size = session.current_size, "Peer joined");
                events.push(SessionEvent::PeerJoined(id));
                self.check_ready(session, &mut events);
            }
            Envelope::PeerLeft { net_id } => {
                let id = EntityId::new(net_id);
                if id.is_empty() || id == session.local_id {
                    debug!(peer = %id, "Ignoring peer_left");
                    return events;
                }
                let tracked = self.peers.remove(&id);
                // Peers present before our welcome were never announced.
                let untracked = session
                    .current_size
                    .saturating_sub(1)
                    .saturating_sub(self.peers.len() as u32);
                if !tracked && untracked == 0 {
                    debug!(peer = %id, "peer_left for unknown peer");
                    return events;
                }
                session.current_size = session.current_size.saturating_sub(1).max(1);
                info!(peer = %id, size = session.current_size, "Peer left");
                events.push(SessionEvent::PeerLeft(id));
            }
            Envelope::Event { payload } => {
                let Some(payload) = payload else {
                    debug!("Event without payload");
                    return events;
                };
                match SyncSample::from_payload(&payload) {
                    Some(sample) if sample.id == session.local_id => {
                        debug!(id = %sample.id, "Dropping echo of own update");
                    }
                    Some(sample) => events.push(SessionEvent::EntityUpdate(sample)),
                    None => debug!("Event payload is not an entity update"),
                }
            }
            Envelope::Error { message } => {
                warn!(message = %message, "Server error");
                events.push(SessionEvent::ServerError(message));
            }
            Envelope::Info { kind } => debug!(kind = %kind, "Informational message"),
            Envelope::Hello { .. } | Envelope::Leave => {
                debug!("Ignoring client-side message type from server")
            }
            Envelope::Unknown { kind } => warn!(kind = %kind, "Unknown message type"),
        }
        events
    }

    /// The handshake must be redone on the next connection.
    pub fn connection_lost(&mut self, session: &mut Session) {
        if session.welcomed {
            debug!(session = %session.session_id, "Connection lost; awaiting new welcome");
        }
        session.welcomed = false;
    }

    fn check_ready(&mut self, session: &Session, events: &mut Vec<SessionEvent>) {
        if !self.ready_fired && session.is_full() {
            self.ready_fired = true;
            info!(size = session.current_size, "Session ready");
            events.push(SessionEvent::SessionReady);
        }
    }
}
