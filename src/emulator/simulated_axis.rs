// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Simulated SMCD14 axis
//!
//! One register bank plus the motion state machine behind it:
//!
//! ```text
//! Idle --StartMove--> Moving --[ramp done]--> Idle (InPosition)
//! Idle --StartHome--> HomingActive --[homing duration]--> Idle (Homed, position 0)
//! any  --Stop--> Idle, position frozen where the ramp was
//! ```
//!
//! There is no background timer. Motion is interpolated from the instant the
//! command was accepted every time the bank is touched, through [`SimulatedAxis::tick`],
//! so a read in the middle of a move returns the position reached at that
//! instant. Tests drive it with explicit instants.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use tokio_modbus::prelude::ExceptionCode;

use crate::modbus::register_map::{
    self, field_at, i32_to_registers, registers_to_i32, registers_to_u32, CommandWord,
    ErrorCode, MoveType, RegisterAddress, RegisterRole, StatusWord, REGISTER_MAP,
};

/// Physical behaviour of a simulated axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationSettings {
    /// Time needed by a homing run
    pub homing_duration: Duration,
    /// Lowest reachable position (µm)
    pub travel_min: i32,
    /// Highest reachable position (µm)
    pub travel_max: i32,
    /// Simulated seconds per wall clock second
    pub time_scale: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            homing_duration: Duration::from_millis(2000),
            travel_min: -50_000_000,
            travel_max: 50_000_000,
            time_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Motion {
    Idle,
    Moving {
        from: i32,
        to: i32,
        velocity: u32,
        started: Instant,
    },
    Homing {
        from: i32,
        started: Instant,
    },
}

/// Register bank and motion state of one emulated controller
#[derive(Debug)]
pub struct SimulatedAxis {
    registers: HashMap<u16, u16>,
    settings: SimulationSettings,
    motion: Motion,
    position: i32,
    homed: bool,
    in_position: bool,
    error: ErrorCode,
}

impl SimulatedAxis {
    pub fn new(settings: SimulationSettings) -> Self {
        let mut registers = HashMap::new();
        for field in REGISTER_MAP {
            for offset in 0..field.count() {
                registers.insert(field.address + offset, 0);
            }
        }
        registers.insert(register_map::MOVE_TYPE.address, MoveType::Absolute as u16);

        let mut axis = Self {
            registers,
            settings,
            motion: Motion::Idle,
            position: 0,
            homed: false,
            in_position: false,
            error: ErrorCode::None,
        };
        axis.sync_registers();
        axis
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn is_homed(&self) -> bool {
        self.homed
    }

    pub fn status(&self) -> StatusWord {
        let mut status = StatusWord::empty();
        if self.homed {
            status |= StatusWord::HOMED;
        }
        if self.error != ErrorCode::None {
            return status | StatusWord::IDLE | StatusWord::ERROR;
        }
        match self.motion {
            Motion::Idle if self.in_position => status | StatusWord::IDLE | StatusWord::IN_POSITION,
            Motion::Idle => status | StatusWord::IDLE,
            Motion::Moving { .. } => status | StatusWord::MOVING,
            Motion::Homing { .. } => status | StatusWord::HOMING_ACTIVE,
        }
    }

    /// Advance the motion state machine to `now`.
    pub fn tick(&mut self, now: Instant) {
        match self.motion {
            Motion::Idle => {}
            Motion::Moving {
                from,
                to,
                velocity,
                started,
            } => {
                let elapsed = self.simulated_seconds(started, now);
                let distance = (to as i64 - from as i64).abs();
                let travelled = velocity as f64 * elapsed;
                if travelled >= distance as f64 {
                    self.position = to;
                    self.motion = Motion::Idle;
                    self.in_position = true;
                    debug!("Simulated move reached {} µm", to);
                } else {
                    // Truncation keeps the position short of the target until the ramp ends
                    let step = travelled.floor() as i64;
                    let direction = (to as i64 - from as i64).signum();
                    self.position = (from as i64 + direction * step) as i32;
                }
            }
            Motion::Homing { from, started } => {
                let elapsed = self.simulated_seconds(started, now);
                let duration = self.settings.homing_duration.as_secs_f64();
                if elapsed >= duration {
                    self.position = 0;
                    self.homed = true;
                    self.motion = Motion::Idle;
                    debug!("Simulated homing complete");
                } else {
                    let remaining = 1.0 - elapsed / duration;
                    self.position = (from as f64 * remaining).trunc() as i32;
                }
            }
        }
        self.sync_registers();
    }

    fn simulated_seconds(&self, started: Instant, now: Instant) -> f64 {
        now.saturating_duration_since(started).as_secs_f64() * self.settings.time_scale
    }

    fn sync_registers(&mut self) {
        let [low, high] = i32_to_registers(self.position);
        let status = self.status();
        let base = register_map::CURRENT_POSITION.address;
        self.registers.insert(base, low);
        self.registers.insert(base + 1, high);
        self.registers
            .insert(register_map::STATUS_WORD.address, status.bits());
        self.registers
            .insert(register_map::ERROR_CODE.address, self.error as u16);
    }

    fn pair(&self, field: RegisterAddress) -> [u16; 2] {
        let low = self.registers.get(&field.address).copied().unwrap_or(0);
        let high = self.registers.get(&(field.address + 1)).copied().unwrap_or(0);
        [low, high]
    }

    /// Serve a holding register read at `now`
    pub fn read(&mut self, addr: u16, cnt: u16, now: Instant) -> Result<Vec<u16>, ExceptionCode> {
        self.tick(now);
        register_read(&self.registers, addr, cnt)
    }

    /// Serve a holding register write at `now`
    pub fn write(&mut self, addr: u16, values: &[u16], now: Instant) -> Result<(), ExceptionCode> {
        self.tick(now);

        // Validate the whole span before touching anything
        for offset in 0..values.len() {
            let reg_addr = addr
                .checked_add(offset as u16)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            match field_at(reg_addr).map(|f| f.role) {
                Some(RegisterRole::StatusWord)
                | Some(RegisterRole::CurrentPosition)
                | Some(RegisterRole::ErrorCode)
                | None => {
                    warn!("Write to read-only or unmapped register {}", reg_addr);
                    return Err(ExceptionCode::IllegalDataAddress);
                }
                Some(_) => {}
            }
        }

        let command = values
            .iter()
            .enumerate()
            .find(|(offset, _)| addr + *offset as u16 == register_map::COMMAND_WORD.address)
            .map(|(_, value)| *value);
        let clear = values
            .iter()
            .enumerate()
            .find(|(offset, _)| addr + *offset as u16 == register_map::CLEAR_ERROR.address)
            .map(|(_, value)| *value);

        if let Some(word) = command {
            // Reject malformed commands before storing anything
            let command = CommandWord::from_bits(word)
                .filter(|c| c.is_well_formed())
                .ok_or(ExceptionCode::IllegalDataValue)?;
            if command.intersects(CommandWord::START_MOVE | CommandWord::START_HOME) {
                self.check_can_start()?;
            }
        }

        register_write(&mut self.registers, addr, values)?;

        if clear == Some(1) {
            self.clear_error();
        }
        if let Some(word) = command {
            self.execute(CommandWord::from_bits_truncate(word), now);
        }
        self.sync_registers();
        Ok(())
    }

    fn check_can_start(&self) -> Result<(), ExceptionCode> {
        if self.error != ErrorCode::None {
            warn!("Motion command refused: error {:?} latched", self.error);
            return Err(ExceptionCode::ServerDeviceFailure);
        }
        if !matches!(self.motion, Motion::Idle) {
            warn!("Motion command refused: axis busy");
            return Err(ExceptionCode::ServerDeviceBusy);
        }
        Ok(())
    }

    fn execute(&mut self, command: CommandWord, now: Instant) {
        // The command word is consumed by the controller
        self.registers.insert(register_map::COMMAND_WORD.address, 0);

        if command.contains(CommandWord::STOP) {
            if !matches!(self.motion, Motion::Idle) {
                info!("Simulated axis stopped at {} µm", self.position);
            }
            self.motion = Motion::Idle;
        } else if command.contains(CommandWord::START_MOVE) {
            self.start_move(now);
        } else if command.contains(CommandWord::START_HOME) {
            self.in_position = false;
            self.homed = false;
            if self.settings.homing_duration.is_zero() {
                self.position = 0;
                self.homed = true;
            } else {
                self.motion = Motion::Homing {
                    from: self.position,
                    started: now,
                };
            }
            info!("Simulated homing started from {} µm", self.position);
        }
    }

    fn start_move(&mut self, now: Instant) {
        let move_type = self
            .registers
            .get(&register_map::MOVE_TYPE.address)
            .copied()
            .and_then(MoveType::from_register);
        let value = registers_to_i32(self.pair(register_map::TARGET_POSITION));
        let velocity = registers_to_u32(self.pair(register_map::VELOCITY));

        let target = match move_type {
            Some(MoveType::Absolute) => Some(value as i64),
            Some(MoveType::Relative) => Some(self.position as i64 + value as i64),
            None => return self.latch(ErrorCode::InvalidMoveType),
        };
        let Some(target) = target.filter(|t| {
            *t >= self.settings.travel_min as i64 && *t <= self.settings.travel_max as i64
        }) else {
            return self.latch(ErrorCode::TargetOutOfTravel);
        };
        if velocity == 0 {
            return self.latch(ErrorCode::InvalidVelocity);
        }

        let target = target as i32;
        self.in_position = false;
        if target == self.position {
            self.in_position = true;
            return;
        }
        info!(
            "Simulated move {} -> {} µm at {} µm/s",
            self.position, target, velocity
        );
        self.motion = Motion::Moving {
            from: self.position,
            to: target,
            velocity,
            started: now,
        };
    }

    fn latch(&mut self, code: ErrorCode) {
        warn!("Simulated axis latched error {:?}", code);
        self.error = code;
        self.motion = Motion::Idle;
        self.in_position = false;
    }

    fn clear_error(&mut self) {
        if self.error != ErrorCode::None {
            info!("Simulated axis error {:?} cleared", self.error);
        }
        self.error = ErrorCode::None;
        self.registers.insert(register_map::CLEAR_ERROR.address, 0);
    }
}

/// Helper function for reading Modbus registers from a HashMap
///
/// Returns `ExceptionCode::IllegalDataAddress` if any requested register
/// address does not exist in the bank.
fn register_read(
    registers: &HashMap<u16, u16>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    let mut response_values = vec![0; cnt.into()];

    for i in 0..cnt {
        let reg_addr = addr.checked_add(i).ok_or(ExceptionCode::IllegalDataAddress)?;
        if let Some(r) = registers.get(&reg_addr) {
            response_values[i as usize] = *r;
        } else {
            warn!(
                "Exception::IllegalDataAddress - Register {} not found",
                reg_addr
            );
            return Err(ExceptionCode::IllegalDataAddress);
        }
    }

    Ok(response_values)
}

/// Helper function for writing values to Modbus registers
fn register_write(
    registers: &mut HashMap<u16, u16>,
    addr: u16,
    values: &[u16],
) -> Result<(), ExceptionCode> {
    for (i, value) in values.iter().enumerate() {
        let reg_addr = addr + i as u16;
        if let Some(r) = registers.get_mut(&reg_addr) {
            *r = *value;
        } else {
            warn!(
                "Exception::IllegalDataAddress - Register {} not found",
                reg_addr
            );
            return Err(ExceptionCode::IllegalDataAddress);
        }
    }

    Ok(())
}
