//! Client sync context.
//!
//! Owns the session (and through it the transport), the entity registry and
//! the event listeners. Created at session start, dropped at session end;
//! dropping it closes the connection.
//!
//! Per frame the caller runs [`SyncContext::tick`]:
//! drain transport -> route -> registry -> listeners -> entity sync -> outbound.

use std::time::Instant;

use sync_shared::{
    body::{BodyFactory, EntityBody},
    config::SyncConfig,
    entity::EntityId,
    event::{ListenerId, Listeners},
};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::{
    entity_sync::SyncTuning,
    registry::{DispatchOutcome, EntityRecord, EntityRegistry},
    router::SessionEvent,
    session::SessionManager,
    transport::{Transport, WsTransport},
};

pub struct SyncContext {
    cfg: SyncConfig,
    session: SessionManager,
    registry: EntityRegistry,
    listeners: Listeners<SessionEvent>,
    epoch: Instant,
    last_tick: Option<Instant>,
}

impl SyncContext {
    pub fn new(cfg: SyncConfig, transport: Box<dyn Transport>, factory: Box<dyn BodyFactory>) -> Self {
        let tuning = SyncTuning::from(&cfg);
        Self {
            session: SessionManager::new(&cfg, transport),
            registry: EntityRegistry::new(cfg.spawn_points.clone(), tuning, factory),
            listeners: Listeners::new(),
            epoch: Instant::now(),
            last_tick: None,
            cfg,
        }
    }

    /// Context over a WebSocket transport whose socket task runs on `handle`.
    pub fn websocket(handle: Handle, cfg: SyncConfig, factory: Box<dyn BodyFactory>) -> Self {
        let transport = WsTransport::new(handle, &cfg);
        Self::new(cfg, Box::new(transport), factory)
    }

    /// Registers the local vehicle under the current local id.
    pub fn attach_local(&mut self, body: Box<dyn EntityBody>) -> Option<EntityId> {
        let id = self.session.local_id().clone();
        let record = EntityRecord::local(id.clone(), self.registry.tuning(), body);
        self.registry.register(record).then_some(id)
    }

    pub fn start_local(&mut self) {
        let events = self.session.start_local();
        self.handle_events(events);
    }

    /// Goes online, connecting now when `auto_connect` is set.
    pub fn start_online(&mut self) {
        if self.cfg.auto_connect {
            self.session.start_online();
        } else {
            debug!("auto_connect disabled; call connect() to go online");
        }
    }

    /// Goes online regardless of `auto_connect`.
    pub fn connect(&mut self) {
        self.session.start_online();
    }

    /// Per-frame entry point using the wall clock.
    pub fn tick(&mut self, dt: f32) {
        self.tick_at(Instant::now(), dt);
    }

    /// Per-frame entry point at an explicit instant.
    pub fn tick_at(&mut self, now: Instant, dt: f32) {
        self.last_tick = Some(now);
        let events = self.session.poll(now);
        self.handle_events(events);

        let clock = now.saturating_duration_since(self.epoch).as_secs_f64();
        if let Some(sample) = self.registry.tick(dt, now, clock) {
            self.session.send_entity_update(&sample);
        }
    }

    /// Same as [`tick_at`](Self::tick_at) with `dt` derived from the
    /// previous tick.
    pub fn tick_now(&mut self) {
        let now = Instant::now();
        let dt = self
            .last_tick
            .map(|t| now.saturating_duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        self.tick_at(now, dt);
    }

    fn handle_events(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            self.apply(&event);
            self.listeners.publish(&event);
        }
    }

    fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Welcomed {
                previous_id,
                local_id,
                ..
            } => {
                // Membership is re-announced in every session.
                self.registry.clear_remote();
                if previous_id != local_id && self.registry.local_id() == Some(previous_id) {
                    self.registry.rekey(previous_id, local_id);
                }
            }
            SessionEvent::PeerJoined(id) => {
                self.registry.spawn_remote(id);
            }
            SessionEvent::PeerLeft(id) => {
                self.registry.unregister(id);
            }
            SessionEvent::EntityUpdate(sample) => {
                if self.registry.dispatch(sample) == DispatchOutcome::Unknown
                    && self.cfg.lazy_remote_spawn
                    && self.registry.spawn_remote(&sample.id)
                {
                    self.registry.dispatch(sample);
                }
            }
            SessionEvent::SessionReady => self.registry.start_race(),
            SessionEvent::ServerError(_) => {}
        }
    }

    /// Leaves the session (online) and closes the race gate.
    pub fn leave(&mut self) {
        self.session.leave();
        self.registry.stop_race();
    }

    /// Closes the connection and stops reconnecting.
    pub fn shutdown(&mut self) {
        info!(local_id = %self.session.local_id(), "Shutting down sync context");
        self.registry.stop_race();
        self.session.shutdown();
    }

    pub fn subscribe(&mut self, f: impl FnMut(&SessionEvent) + Send + 'static) -> ListenerId {
        self.listeners.subscribe(f)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionManager {
        &mut self.session
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };
    use sync_shared::{
        body::{KinematicBody, KinematicFactory},
        entity::BodyState,
        math::{Quat, Vec3},
        wire::{Envelope, SyncSample},
    };

    use crate::{session::Role, transport::MemoryTransport};

    fn online_context() -> (SyncContext, MemoryTransport, Arc<Mutex<Vec<SessionEvent>>>) {
        let cfg = SyncConfig::default();
        let wire = MemoryTransport::new(&cfg.game, cfg.reconnect_delay());
        let mut ctx = SyncContext::new(cfg, Box::new(wire.clone()), Box::new(KinematicFactory));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        ctx.subscribe(move |e| log.lock().unwrap().push(e.clone()));
        ctx.attach_local(Box::new(KinematicBody::new(BodyState::at(
            Vec3::new(1.0, 0.0, 1.0),
            Quat::IDENTITY,
        ))))
        .unwrap();
        ctx.start_online();
        (ctx, wire, seen)
    }

    fn ready_count(seen: &Arc<Mutex<Vec<SessionEvent>>>) -> usize {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|e| **e == SessionEvent::SessionReady)
            .count()
    }

    #[test]
    fn handshake_join_leave_scenario() {
        let (mut ctx, wire, seen) = online_context();
        let p1 = EntityId::from("p1");
        let p2 = EntityId::from("p2");
        let t0 = Instant::now();

        wire.push_frame(
            r#"{"type":"welcome","net_id":"p1","sessionId":"s1","game":"race","capacity":2,"sessionSize":1}"#,
        );
        ctx.tick_at(t0, 0.016);
        assert_eq!(ctx.session().local_id(), &p1);
        assert_eq!(ctx.session().role(), Role::Host);
        assert_eq!(ctx.session().session().current_size, 1);
        assert_eq!(ctx.registry().local_id(), Some(&p1));
        assert_eq!(ready_count(&seen), 0);

        wire.push_frame(r#"{"type":"peer_joined","net_id":"p2"}"#);
        ctx.tick_at(t0 + Duration::from_millis(16), 0.016);
        assert_eq!(ctx.session().session().current_size, 2);
        assert_eq!(ready_count(&seen), 1);
        assert!(ctx.registry().contains(&p2));
        assert!(ctx.registry().is_racing());

        wire.push_frame(r#"{"type":"peer_left","net_id":"p2"}"#);
        ctx.tick_at(t0 + Duration::from_millis(32), 0.016);
        assert_eq!(ctx.session().session().current_size, 1);
        assert!(!ctx.registry().contains(&p2));
        assert_eq!(ready_count(&seen), 1);
    }

    #[test]
    fn local_samples_go_out_at_send_interval() {
        let (mut ctx, wire, _) = online_context();
        wire.push_frame(
            r#"{"type":"welcome","net_id":"p1","sessionId":"s1","game":"race","capacity":2,"sessionSize":1}"#,
        );
        let t0 = Instant::now();
        ctx.tick_at(t0, 0.016);
        ctx.tick_at(t0 + Duration::from_millis(16), 0.016);
        ctx.tick_at(t0 + Duration::from_millis(50), 0.016);

        let sent = wire.take_sent();
        let updates: Vec<SyncSample> = sent
            .iter()
            .filter_map(|f| match Envelope::decode(f) {
                Envelope::Event { payload: Some(p) } => SyncSample::from_payload(&p),
                _ => None,
            })
            .collect();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|s| s.id.as_str() == "p1"));
        assert_eq!(updates[0].position, Vec3::new(1.0, 0.0, 1.0));
    }

    #[test]
    fn unknown_sender_is_spawned_lazily_and_converges() {
        let (mut ctx, wire, _) = online_context();
        wire.push_frame(
            r#"{"type":"welcome","net_id":"p2","sessionId":"s1","game":"race","capacity":2,"sessionSize":2}"#,
        );
        let sample = SyncSample::new(
            EntityId::from("p1"),
            BodyState::at(Vec3::new(20.0, 0.0, -3.0), Quat::IDENTITY),
            1.0,
        );
        wire.push_frame(sample.to_event_frame());

        let t0 = Instant::now();
        for i in 0..240 {
            ctx.tick_at(t0 + Duration::from_millis(16 * i), 1.0 / 60.0);
        }
        let remote = ctx.registry().get(&EntityId::from("p1")).unwrap();
        assert!(!remote.is_local());
        let pos = remote.body.local_state_snapshot().position;
        assert!(pos.distance(Vec3::new(20.0, 0.0, -3.0)) < 1e-3);
    }

    #[test]
    fn local_mode_starts_race_without_network() {
        let cfg = SyncConfig::default();
        let wire = MemoryTransport::new(&cfg.game, cfg.reconnect_delay());
        let mut ctx = SyncContext::new(cfg, Box::new(wire.clone()), Box::new(KinematicFactory));
        ctx.attach_local(Box::new(KinematicBody::default()));
        ctx.start_local();
        ctx.tick(0.016);
        assert!(ctx.registry().is_racing());
        assert_eq!(wire.connect_attempts(), 0);
        assert!(wire.take_sent().is_empty());
    }

    #[test]
    fn unsubscribed_listener_stops_hearing() {
        let (mut ctx, wire, _) = online_context();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let id = ctx.subscribe(move |_| *h.lock().unwrap() += 1);
        wire.push_frame(r#"{"type":"error","message":"x"}"#);
        ctx.tick(0.016);
        assert!(ctx.unsubscribe(id));
        wire.push_frame(r#"{"type":"error","message":"y"}"#);
        ctx.tick(0.016);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn reconnect_after_lost_connection_and_new_session_refires_ready() {
        let (mut ctx, wire, seen) = online_context();
        let welcome = r#"{"type":"welcome","net_id":"p2","sessionId":"s1","game":"race","capacity":2,"sessionSize":2}"#;
        let t0 = Instant::now();
        wire.push_frame(welcome);
        ctx.tick_at(t0, 0.016);
        assert_eq!(ready_count(&seen), 1);

        wire.drop_connection();
        ctx.tick_at(t0 + Duration::from_millis(10), 0.016);
        assert!(!ctx.session().session().welcomed);
        ctx.tick_at(t0 + Duration::from_millis(1000), 0.016);
        assert_eq!(ctx.session().transport().connect_attempts(), 1);
        ctx.tick_at(t0 + Duration::from_millis(2010), 0.016);
        assert_eq!(ctx.session().transport().connect_attempts(), 2);

        wire.push_frame(welcome.replace("s1", "s2"));
        ctx.tick_at(t0 + Duration::from_millis(2030), 0.016);
        assert_eq!(ready_count(&seen), 2);
    }
}
