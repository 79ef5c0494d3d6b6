// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Single axis control
//!
//! Value types shared by the axis controller, the manipulator and the
//! emulator: engineering units, axis identity and the client side view of an
//! axis state.

pub mod controller;
pub mod kinematics;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use controller::{AxisController, AxisError};
pub use kinematics::{velocity_components, VelocityLimits};

/// Axis position in micrometers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position(pub i32);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn micrometers(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} µm", self.0)
    }
}

impl From<i32> for Position {
    fn from(value: i32) -> Self {
        Position(value)
    }
}

/// Axis velocity in micrometers per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Velocity(pub u32);

impl Velocity {
    pub fn micrometers_per_second(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Velocity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} µm/s", self.0)
    }
}

impl From<u32> for Velocity {
    fn from(value: u32) -> Self {
        Velocity(value)
    }
}

/// One of the three manipulator axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// Fixed command order of the manipulator
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

/// Client side view of an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisState {
    /// Last exchange with the axis failed at the link level
    Disconnected,
    Idle,
    Homing,
    Moving,
    /// Device reports its error bit; terminal for this layer
    Error,
}

/// Whether positions of an axis refer to a homed zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Calibration {
    /// Positions are relative to power-on
    Uncalibrated,
    /// A homing run completed; positions are absolute
    Homed,
}

/// One value per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerAxis<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T> PerAxis<T> {
    pub fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }

    pub fn from_fn(mut f: impl FnMut(Axis) -> T) -> Self {
        Self {
            x: f(Axis::X),
            y: f(Axis::Y),
            z: f(Axis::Z),
        }
    }

    pub fn get(&self, axis: Axis) -> &T {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    pub fn get_mut(&mut self, axis: Axis) -> &mut T {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(Axis, T) -> U) -> PerAxis<U> {
        PerAxis {
            x: f(Axis::X, self.x),
            y: f(Axis::Y, self.y),
            z: f(Axis::Z, self.z),
        }
    }

    /// Iterate in X, Y, Z order
    pub fn iter(&self) -> impl Iterator<Item = (Axis, &T)> {
        [(Axis::X, &self.x), (Axis::Y, &self.y), (Axis::Z, &self.z)].into_iter()
    }

    /// Consume into `(axis, value)` pairs in X, Y, Z order
    pub fn iter_owned(self) -> impl Iterator<Item = (Axis, T)> {
        [(Axis::X, self.x), (Axis::Y, self.y), (Axis::Z, self.z)].into_iter()
    }
}
