// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Manipulator client configuration
//!
//! Where the SMCD14 link lives and how the three axes are addressed on it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::axis::{PerAxis, VelocityLimits};
use crate::modbus::SlaveId;

/// Connection and motion settings of the manipulator client.
///
/// # Example
///
/// ```
/// use smcd14_manipulator::config::ClientConfig;
///
/// let client = ClientConfig {
///     host: "192.168.1.50".to_string(),
///     port: 502,
///     ..Default::default()
/// };
/// assert_eq!(client.slave_ids, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or IP address of the Modbus TCP endpoint
    pub host: String,

    /// TCP port of the endpoint
    pub port: u16,

    /// Slave identifiers of the X, Y and Z controllers, in that order
    pub slave_ids: Vec<SlaveId>,

    /// Deadline of a single register exchange, in milliseconds
    pub timeout_ms: u64,

    /// Interval between status polls while waiting for motion, in milliseconds
    pub poll_interval_ms: u64,

    /// Lowest accepted axis velocity (µm/s)
    pub min_velocity: u32,

    /// Highest accepted axis velocity (µm/s)
    pub max_velocity: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5020,
            slave_ids: vec![1, 2, 3],
            timeout_ms: 1000,
            poll_interval_ms: 50,
            min_velocity: 1,
            max_velocity: 1000,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn velocity_limits(&self) -> VelocityLimits {
        VelocityLimits {
            min: self.min_velocity,
            max: self.max_velocity,
        }
    }

    /// X, Y and Z slave identifiers, `None` unless exactly three are configured
    pub fn axis_slaves(&self) -> Option<PerAxis<SlaveId>> {
        match self.slave_ids.as_slice() {
            [x, y, z] => Some(PerAxis::new(*x, *y, *z)),
            _ => None,
        }
    }
}
