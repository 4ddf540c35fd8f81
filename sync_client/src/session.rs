//! Session state and the session manager.
//!
//! [`Session`] is plain data mutated only by the [`Router`] while handling
//! handshake frames. [`SessionManager`] layers mode handling and the send
//! primitives over a [`Transport`].

use std::time::Instant;

use sync_shared::{
    config::SyncConfig,
    entity::EntityId,
    wire::{Envelope, SyncSample},
};
use tracing::{debug, info};

use crate::{
    router::{Router, SessionEvent},
    transport::{ConnectionState, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First arrival in the session.
    Host,
    Guest,
}

/// Handshake-derived identity and membership.
#[derive(Debug, Clone)]
pub struct Session {
    /// Server-assigned id after `welcome`; a locally generated one before.
    pub local_id: EntityId,
    /// Team/slot index: 0 for the first arrival, 1 for the second, ...
    pub slot: u32,
    pub role: Role,
    pub session_id: String,
    pub game: String,
    pub capacity: u32,
    pub current_size: u32,
    pub welcomed: bool,
}

impl Session {
    pub fn new(game: &str) -> Self {
        Self {
            local_id: EntityId::generate_local(),
            slot: 0,
            role: Role::Host,
            session_id: String::new(),
            game: game.to_string(),
            capacity: 0,
            current_size: 1,
            welcomed: false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.current_size >= self.capacity
    }
}

/// Mode flag, session data and the transport, driven from the simulation
/// thread.
pub struct SessionManager {
    session: Session,
    router: Router,
    transport: Box<dyn Transport>,
    online: bool,
    url: String,
}

impl SessionManager {
    pub fn new(cfg: &SyncConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            session: Session::new(&cfg.game),
            router: Router::new(),
            transport,
            online: false,
            url: cfg.server_url.clone(),
        }
    }

    /// Offline play: never touches the transport. The game starts at once in
    /// slot 0.
    pub fn start_local(&mut self) -> Vec<SessionEvent> {
        self.online = false;
        self.session.slot = 0;
        self.session.role = Role::Host;
        self.session.current_size = 1;
        info!(local_id = %self.session.local_id, "Local session started");
        vec![SessionEvent::SessionReady]
    }

    /// Online play: connects; the game starts once the router sees the
    /// session fill up.
    pub fn start_online(&mut self) {
        self.online = true;
        info!(url = %self.url, game = %self.session.game, "Online session starting");
        self.transport.connect(&self.url);
    }

    /// Drains the transport and routes every frame. After a shutdown the
    /// transport is still drained until its close completes; those frames
    /// are discarded.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        if !self.online {
            if self.transport.state() == ConnectionState::Closing {
                let dropped = self.transport.poll(now).len();
                if dropped > 0 {
                    debug!(dropped, "Discarding frames received while closing");
                }
            }
            return Vec::new();
        }
        let mut events = Vec::new();
        for frame in self.transport.poll(now) {
            events.extend(self.router.route(&mut self.session, &frame));
        }
        if self.session.welcomed && self.transport.state() != ConnectionState::Open {
            self.router.connection_lost(&mut self.session);
        }
        events
    }

    /// Sends `sample` as an `event`. No-op offline, without a local id, or
    /// before `welcome` (peers would see the provisional id).
    pub fn send_entity_update(&mut self, sample: &SyncSample) {
        if !self.online || !self.session.welcomed || self.session.local_id.is_empty() {
            return;
        }
        self.transport.send(sample.to_event_frame());
    }

    /// Sends an arbitrary JSON object as an `event` payload.
    pub fn send_event(&mut self, payload: &str) {
        if !self.online {
            return;
        }
        let frame = Envelope::Event {
            payload: Some(payload.to_string()),
        }
        .encode();
        self.transport.send(frame);
    }

    /// Tells the server we are leaving the session.
    pub fn leave(&mut self) {
        if !self.online {
            return;
        }
        debug!(local_id = %self.session.local_id, "Leaving session");
        self.transport.send(Envelope::Leave.encode());
    }

    /// Closes the connection and stops reconnecting. Keep polling until
    /// [`connection_state`](Self::connection_state) reports `Closed`.
    pub fn shutdown(&mut self) {
        self.transport.disconnect();
        self.router.connection_lost(&mut self.session);
        self.online = false;
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn local_id(&self) -> &EntityId {
        &self.session.local_id
    }

    pub fn slot(&self) -> u32 {
        self.session.slot
    }

    pub fn role(&self) -> Role {
        self.session.role
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }
}
