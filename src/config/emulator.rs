// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! SMCD14 emulator configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::emulator::SimulationSettings;
use crate::modbus::SlaveId;

/// Settings of the emulator server and of its simulated axes.
///
/// # Fields
///
/// * `address` - Network address to bind to (default: 0.0.0.0, all interfaces)
/// * `port` - TCP port (default: 5020)
/// * `slave_ids` - Unit identifiers answered by the emulator (default: 1, 2, 3)
/// * `homing_duration_ms` - Duration of a simulated homing run
/// * `travel_min` / `travel_max` - Reachable range of every axis, in µm
/// * `time_scale` - Simulated seconds per wall clock second
/// * `heartbeat_ms` - Interval of the state log, 0 disables it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub address: String,
    pub port: u16,
    pub slave_ids: Vec<SlaveId>,
    pub homing_duration_ms: u64,
    pub travel_min: i32,
    pub travel_max: i32,
    pub time_scale: f64,
    pub heartbeat_ms: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 5020,
            slave_ids: vec![1, 2, 3],
            homing_duration_ms: 2000,
            travel_min: -50_000_000,
            travel_max: 50_000_000,
            time_scale: 1.0,
            heartbeat_ms: 10_000,
        }
    }
}

impl EmulatorConfig {
    pub fn simulation_settings(&self) -> SimulationSettings {
        SimulationSettings {
            homing_duration: Duration::from_millis(self.homing_duration_ms),
            travel_min: self.travel_min,
            travel_max: self.travel_max,
            time_scale: self.time_scale,
        }
    }
}
