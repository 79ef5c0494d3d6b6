// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Velocity limits and straight-line velocity splitting
//!
//! Each SMCD14 axis accepts velocities between a minimum and a maximum. A
//! straight-line move of the manipulator is requested with one total velocity
//! that is split into per-axis components proportional to the travel of each
//! axis, so that the three axes arrive together.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{PerAxis, Position, Velocity};

/// Components below this magnitude (µm/s) are treated as "axis does not move"
pub const VELOCITY_THRESHOLD: f64 = 0.05;

/// Rejected velocity request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VelocityError {
    #[error("velocity {velocity} µm/s is below the minimum of {min} µm/s")]
    TooSlow { velocity: f64, min: f64 },
    #[error("velocity {velocity} µm/s exceeds the limit of {max:.3} µm/s")]
    TooFast { velocity: f64, max: f64 },
}

/// Per-axis velocity bounds in µm/s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityLimits {
    pub min: u32,
    pub max: u32,
}

impl Default for VelocityLimits {
    fn default() -> Self {
        Self { min: 1, max: 1000 }
    }
}

impl VelocityLimits {
    /// Check a single axis velocity
    pub fn validate_axis(&self, velocity: Velocity) -> Result<(), VelocityError> {
        let v = velocity.0 as f64;
        if velocity.0 < self.min {
            return Err(VelocityError::TooSlow {
                velocity: v,
                min: self.min as f64,
            });
        }
        if velocity.0 > self.max {
            return Err(VelocityError::TooFast {
                velocity: v,
                max: self.max as f64,
            });
        }
        Ok(())
    }

    /// Check a straight-line velocity; the diagonal allows √3 × the axis limit.
    pub fn validate_total(&self, velocity: f64) -> Result<(), VelocityError> {
        if !(velocity >= self.min as f64) {
            return Err(VelocityError::TooSlow {
                velocity,
                min: self.min as f64,
            });
        }
        let diagonal = 3f64.sqrt() * self.max as f64;
        if velocity > diagonal {
            return Err(VelocityError::TooFast {
                velocity,
                max: diagonal,
            });
        }
        Ok(())
    }

    fn adjust(&self, v: f64) -> f64 {
        let magnitude = v.abs();
        if magnitude < VELOCITY_THRESHOLD {
            0.0
        } else if magnitude < self.min as f64 {
            (self.min as f64).copysign(v)
        } else if magnitude > self.max as f64 {
            (self.max as f64).copysign(v)
        } else {
            v
        }
    }
}

/// Split `total` (µm/s) into signed X/Y/Z components for a move from `start`
/// to `end`, bounded by `limits`.
///
/// A zero-length move yields all-zero components.
pub fn velocity_components(
    start: PerAxis<Position>,
    end: PerAxis<Position>,
    total: f64,
    limits: &VelocityLimits,
) -> Result<PerAxis<f64>, VelocityError> {
    limits.validate_total(total)?;

    let delta = PerAxis::from_fn(|axis| (end.get(axis).0 as f64) - (start.get(axis).0 as f64));
    let distance = (delta.x * delta.x + delta.y * delta.y + delta.z * delta.z).sqrt();
    if distance == 0.0 {
        return Ok(PerAxis::new(0.0, 0.0, 0.0));
    }

    let mut v = delta.map(|_, d| limits.adjust(d / distance * total));

    // Clamping may have slowed the move down; scale back up where possible
    let actual = (v.x * v.x + v.y * v.y + v.z * v.z).sqrt();
    if actual > 0.0 && actual < total {
        let scale = total / actual;
        v = v.map(|_, c| limits.adjust(c * scale));
    }

    Ok(v)
}

/// Register velocity for a signed component: magnitude rounded to whole µm/s.
pub fn axis_velocity(component: f64) -> Velocity {
    Velocity(component.abs().round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at(x: i32, y: i32, z: i32) -> PerAxis<Position> {
        PerAxis::new(Position(x), Position(y), Position(z))
    }

    #[test]
    fn test_single_axis_move_gets_full_velocity() {
        let v = velocity_components(at(0, 0, 0), at(1000, 0, 0), 200.0, &Default::default())
            .unwrap();
        assert_relative_eq!(v.x, 200.0);
        assert_relative_eq!(v.y, 0.0);
        assert_relative_eq!(v.z, 0.0);
    }

    #[test]
    fn test_diagonal_components_keep_total_speed() {
        let v = velocity_components(at(0, 0, 0), at(3000, -4000, 0), 500.0, &Default::default())
            .unwrap();
        assert_relative_eq!(v.x, 300.0, epsilon = 1e-9);
        assert_relative_eq!(v.y, -400.0, epsilon = 1e-9);
        assert_relative_eq!((v.x * v.x + v.y * v.y).sqrt(), 500.0, epsilon = 1e-9);
    }

    #[test]
    fn test_components_are_clamped_to_axis_maximum() {
        // Each raw component would be ~1202 µm/s
        let v = velocity_components(at(0, 0, 0), at(10, 10, 0), 1700.0, &Default::default())
            .unwrap();
        assert_relative_eq!(v.x, 1000.0);
        assert_relative_eq!(v.y, 1000.0);
        assert_relative_eq!(v.z, 0.0);
    }

    #[test]
    fn test_tiny_components_are_raised_to_minimum() {
        let limits = VelocityLimits { min: 1, max: 1000 };
        // Z travels 1/1000 of X, so its raw component is 0.1 µm/s
        let v = velocity_components(at(0, 0, 0), at(100_000, 0, 100), 100.0, &limits).unwrap();
        assert_relative_eq!(v.z, 1.0);
    }

    #[test]
    fn test_zero_length_move() {
        let v = velocity_components(at(5, 5, 5), at(5, 5, 5), 10.0, &Default::default()).unwrap();
        assert_eq!(v, PerAxis::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_total_velocity_limits() {
        let limits = VelocityLimits::default();
        assert!(matches!(
            limits.validate_total(0.5),
            Err(VelocityError::TooSlow { .. })
        ));
        assert!(limits.validate_total(1700.0).is_ok());
        assert!(matches!(
            limits.validate_total(1800.0),
            Err(VelocityError::TooFast { .. })
        ));
        assert!(limits.validate_total(f64::NAN).is_err());
    }

    #[test]
    fn test_axis_velocity_limits() {
        let limits = VelocityLimits::default();
        assert!(limits.validate_axis(Velocity(0)).is_err());
        assert!(limits.validate_axis(Velocity(1000)).is_ok());
        assert!(limits.validate_axis(Velocity(1001)).is_err());
        assert_eq!(axis_velocity(-399.6), Velocity(400));
    }
}
