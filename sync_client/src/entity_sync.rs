//! Per-entity sync component.
//!
//! A local entity is sampled on a wall-clock timer and its samples go out
//! through the session. A remote entity keeps only the latest received state
//! (last write wins, nothing is queued) and approaches it every tick.

use std::time::{Duration, Instant};

use sync_shared::{
    body::EntityBody,
    config::SyncConfig,
    entity::{BodyState, EntityId},
    wire::SyncSample,
};

use crate::interp::{approach, blend_factor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Local,
    Remote,
}

/// Timing knobs shared by every sync component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncTuning {
    pub send_interval: Duration,
    pub interpolation_speed: f32,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncTuning {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            send_interval: cfg.sync_interval(),
            interpolation_speed: cfg.interpolation_speed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntitySync {
    mode: SyncMode,
    tuning: SyncTuning,
    last_sent: Option<Instant>,
    /// Rendered state of a remote entity.
    current: BodyState,
    /// Latest received state of a remote entity.
    target: BodyState,
    last_timestamp: Option<f64>,
}

impl EntitySync {
    pub fn new(mode: SyncMode, tuning: SyncTuning, body: &dyn EntityBody) -> Self {
        let seed = body.local_state_snapshot();
        Self {
            mode,
            tuning,
            last_sent: None,
            current: seed,
            target: seed,
            last_timestamp: None,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn is_local(&self) -> bool {
        self.mode == SyncMode::Local
    }

    /// Switches mode. Going remote seeds both the rendered state and the
    /// target with the body's current state, so the entity holds still until
    /// the first sample arrives.
    pub fn set_mode(&mut self, mode: SyncMode, body: &dyn EntityBody) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        match mode {
            SyncMode::Remote => {
                let seed = body.local_state_snapshot();
                self.current = seed;
                self.target = seed;
                self.last_timestamp = None;
            }
            SyncMode::Local => self.last_sent = None,
        }
    }

    /// Stores `sample` as the new target. Rejected (false) in local mode.
    pub fn receive(&mut self, sample: &SyncSample) -> bool {
        if self.is_local() {
            return false;
        }
        self.target = sample.state();
        self.last_timestamp = Some(sample.timestamp);
        true
    }

    /// Latest received state.
    pub fn target(&self) -> &BodyState {
        &self.target
    }

    /// Interpolated state of a remote entity.
    pub fn current(&self) -> &BodyState {
        &self.current
    }

    /// Sender timestamp of the latest received sample.
    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// Samples the body once the send interval has elapsed. `clock` is the
    /// session time in seconds stamped on the sample.
    pub fn tick_local(
        &mut self,
        now: Instant,
        clock: f64,
        id: &EntityId,
        body: &dyn EntityBody,
    ) -> Option<SyncSample> {
        if !self.is_local() {
            return None;
        }
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.tuning.send_interval {
                return None;
            }
        }
        self.last_sent = Some(now);
        Some(SyncSample::new(id.clone(), body.local_state_snapshot(), clock))
    }

    /// Advances the rendered state toward the target and pushes it onto the
    /// body.
    pub fn tick_remote(&mut self, dt: f32, body: &mut dyn EntityBody) {
        if self.is_local() {
            return;
        }
        let t = blend_factor(dt, self.tuning.interpolation_speed);
        self.current = approach(&self.current, &self.target, t);
        body.apply_remote_state(&self.current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::{
        body::KinematicBody,
        math::{Quat, Vec3},
    };

    fn tuning() -> SyncTuning {
        SyncTuning {
            send_interval: Duration::from_millis(50),
            interpolation_speed: 15.0,
        }
    }

    fn sample_at(x: f32) -> SyncSample {
        SyncSample::new(
            EntityId::from("p2"),
            BodyState::at(Vec3::new(x, 0.0, 0.0), Quat::IDENTITY),
            1.0,
        )
    }

    #[test]
    fn local_emits_on_interval() {
        let body = KinematicBody::default();
        let mut sync = EntitySync::new(SyncMode::Local, tuning(), &body);
        let id = EntityId::from("p1");
        let t0 = Instant::now();
        assert!(sync.tick_local(t0, 0.0, &id, &body).is_some());
        assert!(sync.tick_local(t0 + Duration::from_millis(20), 0.02, &id, &body).is_none());
        let s = sync.tick_local(t0 + Duration::from_millis(50), 0.05, &id, &body).unwrap();
        assert_eq!(s.id, id);
        assert_eq!(s.timestamp, 0.05);
    }

    #[test]
    fn local_rejects_inbound() {
        let body = KinematicBody::default();
        let mut sync = EntitySync::new(SyncMode::Local, tuning(), &body);
        assert!(!sync.receive(&sample_at(5.0)));
        assert_eq!(sync.target().position, Vec3::ZERO);
    }

    #[test]
    fn remote_converges_monotonically_without_overshoot() {
        let mut body = KinematicBody::default();
        let mut sync = EntitySync::new(SyncMode::Remote, tuning(), &body);
        assert_eq!(sync.last_timestamp(), None);
        assert!(sync.receive(&sample_at(10.0)));
        assert_eq!(sync.last_timestamp(), Some(1.0));

        let dt = 1.0 / 60.0; // k*d = 0.25
        let mut prev = 10.0_f32;
        for _ in 0..120 {
            sync.tick_remote(dt, &mut body);
            let remaining = 10.0 - body.state.position.x;
            assert!(remaining >= -1e-4, "overshot: {remaining}");
            assert!(remaining <= prev + 1e-6);
            assert_eq!(sync.current().position, body.state.position);
            prev = remaining;
        }
        assert!(prev < 1e-3);
    }

    #[test]
    fn remote_last_write_wins() {
        let mut body = KinematicBody::default();
        let mut sync = EntitySync::new(SyncMode::Remote, tuning(), &body);
        sync.receive(&sample_at(10.0));
        sync.receive(&sample_at(-2.0));
        sync.tick_remote(1.0, &mut body);
        assert_eq!(body.state.position.x, -2.0);
    }

    #[test]
    fn switching_to_remote_seeds_from_body() {
        let mut body = KinematicBody::new(BodyState::at(Vec3::new(7.0, 1.0, 0.0), Quat::IDENTITY));
        let mut sync = EntitySync::new(SyncMode::Local, tuning(), &body);
        sync.set_mode(SyncMode::Remote, &body);
        sync.tick_remote(1.0 / 60.0, &mut body);
        assert_eq!(body.state.position, Vec3::new(7.0, 1.0, 0.0));
        assert!(sync
            .tick_local(Instant::now(), 0.0, &EntityId::from("x"), &body)
            .is_none());
    }
}
