//! Interpolation.
//!
//! Remote vehicles are not replayed from a snapshot history. Each tick the
//! rendered state moves a fixed fraction of the remaining distance toward the
//! latest received sample (exponential approach), so late or dropped samples
//! only ever slow the approach down.

use sync_shared::entity::BodyState;

/// Fraction of the remaining distance covered this tick, clamped to `[0, 1]`.
///
/// With `dt * speed <= 1` the approach is monotonic and never overshoots.
pub fn blend_factor(dt: f32, speed: f32) -> f32 {
    let t = dt * speed;
    if t.is_nan() {
        return 0.0;
    }
    t.clamp(0.0, 1.0)
}

/// Moves `from` toward `to` by `t`: lerp for position and velocity,
/// shortest-arc slerp for rotation.
pub fn approach(from: &BodyState, to: &BodyState, t: f32) -> BodyState {
    BodyState {
        position: from.position.lerp(to.position, t),
        rotation: from.rotation.slerp(to.rotation, t),
        velocity: from.velocity.lerp(to.velocity, t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::math::{Quat, Vec3};

    #[test]
    fn blend_factor_clamps() {
        assert!((blend_factor(1.0 / 60.0, 15.0) - 0.25).abs() < 1e-6);
        assert_eq!(blend_factor(1.0, 15.0), 1.0);
        assert_eq!(blend_factor(-1.0, 15.0), 0.0);
        assert_eq!(blend_factor(f32::NAN, 15.0), 0.0);
    }

    #[test]
    fn approach_full_step_lands_on_target() {
        let from = BodyState::default();
        let to = BodyState {
            position: Vec3::new(3.0, 0.0, -4.0),
            rotation: Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), 1.0),
            velocity: Vec3::new(1.0, 0.0, 0.0),
        };
        let out = approach(&from, &to, 1.0);
        assert!(out.position.distance(to.position) < 1e-5);
        assert!(out.rotation.angle_to(to.rotation) < 1e-3);
        assert!(out.velocity.distance(to.velocity) < 1e-5);
    }
}
