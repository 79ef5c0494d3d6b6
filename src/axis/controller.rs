// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! SMCD14 axis controller
//!
//! An [`AxisController`] drives one SMCD14 device, identified by its slave id,
//! over a [`RegisterBus`] that may be shared with the other two axes. It turns
//! motion intents into register writes and interprets the status word into an
//! [`AxisState`].
//!
//! ### Busy guard
//!
//! `move_to`, `move_by` and `home` read the status word first and refuse to
//! send anything while a move or homing run is in flight. `stop` is always
//! sent.
//!
//! ### State machine
//!
//! ```text
//! Idle --move--> Moving --[status Idle]--> Idle
//! Idle --home--> Homing --[status Idle & Homed]--> Idle (Homed)
//! any  --stop--> Idle, once the status word confirms it
//! any  --[status Error]--> Error (left only by an explicit clear_error)
//! ```

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::{self, Instant};

use super::{
    kinematics::{VelocityError, VelocityLimits},
    Axis, AxisState, Calibration, Position, Velocity,
};
use crate::modbus::{
    register_map::{
        self, i32_to_registers, registers_to_i32, u32_to_registers, CommandWord, MoveType,
        StatusWord,
    },
    RegisterBus, SlaveId, TransportError,
};

/// Errors raised by axis operations
#[derive(Error, Debug)]
pub enum AxisError {
    /// The axis could not be reached
    #[error("axis {axis}: could not talk to the controller: {source}")]
    Communication {
        axis: Axis,
        #[source]
        source: TransportError,
    },

    /// The controller answered with a Modbus exception
    #[error("axis {axis}: command rejected by the controller: {source}")]
    Rejected {
        axis: Axis,
        #[source]
        source: TransportError,
    },

    /// A move or homing run is still in flight; nothing was written
    #[error("axis {axis} is busy (status {status:?})")]
    Busy { axis: Axis, status: StatusWord },

    /// The controller reports its error bit
    #[error("axis {axis} is in error state (error code {code})")]
    Faulted { axis: Axis, code: u16 },

    #[error("axis {axis}: {source}")]
    InvalidVelocity {
        axis: Axis,
        #[source]
        source: VelocityError,
    },

    /// A stop request overtook a coordinated command on this axis
    #[error("axis {axis}: command abandoned after a stop request")]
    Interrupted { axis: Axis },

    /// The axis did not come back to Idle in time
    #[error("axis {axis} still {state:?} after {waited:?}")]
    MotionTimeout {
        axis: Axis,
        state: AxisState,
        waited: Duration,
    },
}

impl AxisError {
    fn link(axis: Axis, source: TransportError) -> Self {
        match source {
            TransportError::Device { .. } => AxisError::Rejected { axis, source },
            source => AxisError::Communication { axis, source },
        }
    }

    pub fn axis(&self) -> Axis {
        match self {
            AxisError::Communication { axis, .. }
            | AxisError::Rejected { axis, .. }
            | AxisError::Busy { axis, .. }
            | AxisError::Faulted { axis, .. }
            | AxisError::InvalidVelocity { axis, .. }
            | AxisError::Interrupted { axis }
            | AxisError::MotionTimeout { axis, .. } => *axis,
        }
    }

    /// Could not talk to the axis at all
    pub fn is_communication(&self) -> bool {
        matches!(self, AxisError::Communication { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Move,
    Home,
    Stop,
}

#[derive(Debug)]
struct LocalState {
    state: AxisState,
    calibration: Calibration,
    last_command: Option<Command>,
}

/// One SMCD14 controller on a shared register bus
pub struct AxisController {
    axis: Axis,
    slave: SlaveId,
    bus: Arc<dyn RegisterBus>,
    limits: VelocityLimits,
    local: Mutex<LocalState>,
}

impl AxisController {
    pub fn new(axis: Axis, slave: SlaveId, bus: Arc<dyn RegisterBus>) -> Self {
        Self::with_limits(axis, slave, bus, VelocityLimits::default())
    }

    pub fn with_limits(
        axis: Axis,
        slave: SlaveId,
        bus: Arc<dyn RegisterBus>,
        limits: VelocityLimits,
    ) -> Self {
        Self {
            axis,
            slave,
            bus,
            limits,
            local: Mutex::new(LocalState {
                state: AxisState::Idle,
                calibration: Calibration::Uncalibrated,
                last_command: None,
            }),
        }
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn slave(&self) -> SlaveId {
        self.slave
    }

    pub fn limits(&self) -> VelocityLimits {
        self.limits
    }

    /// Last known state, without talking to the device
    pub fn state(&self) -> AxisState {
        self.local().state
    }

    pub fn calibration(&self) -> Calibration {
        self.local().calibration
    }

    fn local(&self) -> MutexGuard<'_, LocalState> {
        // The guarded data stays consistent even if a holder panicked
        self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fail(&self, source: TransportError) -> AxisError {
        if !matches!(source, TransportError::Device { .. }) {
            self.local().state = AxisState::Disconnected;
        }
        AxisError::link(self.axis, source)
    }

    async fn read(&self, field: register_map::RegisterAddress) -> Result<Vec<u16>, AxisError> {
        self.bus
            .read_registers(self.slave, field.address, field.count())
            .await
            .map_err(|e| self.fail(e))
    }

    async fn write(&self, field: register_map::RegisterAddress, value: u16) -> Result<(), AxisError> {
        self.bus
            .write_register(self.slave, field.address, value)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn write_pair(
        &self,
        field: register_map::RegisterAddress,
        words: [u16; 2],
    ) -> Result<(), AxisError> {
        self.bus
            .write_registers(self.slave, field.address, &words)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn read_pair(&self, field: register_map::RegisterAddress) -> Result<[u16; 2], AxisError> {
        let words = self.read(field).await?;
        match words.as_slice() {
            [low, high] => Ok([*low, *high]),
            _ => Err(self.fail(TransportError::Protocol {
                slave: self.slave,
                reason: format!("expected 2 registers, got {}", words.len()),
            })),
        }
    }

    async fn read_single(&self, field: register_map::RegisterAddress) -> Result<u16, AxisError> {
        let words = self.read(field).await?;
        words.first().copied().ok_or_else(|| {
            self.fail(TransportError::Protocol {
                slave: self.slave,
                reason: "empty register response".to_string(),
            })
        })
    }

    /// Read the current position registers
    pub async fn read_position(&self) -> Result<Position, AxisError> {
        let words = self.read_pair(register_map::CURRENT_POSITION).await?;
        Ok(Position(registers_to_i32(words)))
    }

    /// Read the status word and fold it into the local state
    pub async fn read_status(&self) -> Result<StatusWord, AxisError> {
        let word = self.read_single(register_map::STATUS_WORD).await?;
        let status = StatusWord::from_bits_retain(word);
        self.apply_status(status);
        Ok(status)
    }

    /// Read the status word and return the resulting state
    pub async fn poll(&self) -> Result<AxisState, AxisError> {
        self.read_status().await?;
        Ok(self.state())
    }

    fn apply_status(&self, status: StatusWord) {
        let mut local = self.local();
        let previous = local.state;

        local.state = if status.is_error() {
            AxisState::Error
        } else if status.contains(StatusWord::HOMING_ACTIVE) {
            AxisState::Homing
        } else if status.contains(StatusWord::MOVING) {
            AxisState::Moving
        } else {
            AxisState::Idle
        };
        local.calibration = if status.is_homed() {
            Calibration::Homed
        } else {
            Calibration::Uncalibrated
        };

        if !status.is_consistent() && !status.is_error() {
            warn!(
                "Axis {} (slave {}) reports inconsistent status {:?}",
                self.axis, self.slave, status
            );
        }

        if previous != local.state {
            match (local.last_command, local.state) {
                (Some(Command::Home), AxisState::Idle) if status.is_homed() => {
                    info!("Axis {} homed", self.axis);
                    local.last_command = None;
                }
                (Some(Command::Home), AxisState::Idle) => {
                    warn!("Axis {} homing ended without a reference", self.axis);
                    local.last_command = None;
                }
                (Some(Command::Move), AxisState::Idle) => {
                    info!("Axis {} move complete", self.axis);
                    local.last_command = None;
                }
                (Some(Command::Stop), AxisState::Idle) => {
                    info!("Axis {} stopped", self.axis);
                    local.last_command = None;
                }
                (_, AxisState::Error) => {
                    warn!("Axis {} entered error state ({:?})", self.axis, status);
                }
                (_, state) => debug!("Axis {} {:?} -> {:?}", self.axis, previous, state),
            }
        }
    }

    /// Status check shared by every motion initiating command
    async fn guard(&self) -> Result<StatusWord, AxisError> {
        let status = self.read_status().await?;
        if status.is_error() {
            let code = self.read_single(register_map::ERROR_CODE).await?;
            warn!(
                "Axis {} refused a command: controller in error (code {})",
                self.axis, code
            );
            return Err(AxisError::Faulted {
                axis: self.axis,
                code,
            });
        }
        if status.is_busy() {
            warn!(
                "Axis {} refused a command: busy ({:?})",
                self.axis, status
            );
            return Err(AxisError::Busy {
                axis: self.axis,
                status,
            });
        }
        Ok(status)
    }

    /// Move to an absolute position.
    ///
    /// Before any homing the position is relative to power-on; the move is
    /// still sent but logged as uncalibrated.
    pub async fn move_to(&self, target: Position, velocity: Velocity) -> Result<(), AxisError> {
        self.start_move(MoveType::Absolute, target.0, velocity).await
    }

    /// Move by a signed distance from the current position
    pub async fn move_by(&self, distance: i32, velocity: Velocity) -> Result<(), AxisError> {
        self.start_move(MoveType::Relative, distance, velocity).await
    }

    async fn start_move(
        &self,
        move_type: MoveType,
        value: i32,
        velocity: Velocity,
    ) -> Result<(), AxisError> {
        self.limits
            .validate_axis(velocity)
            .map_err(|source| AxisError::InvalidVelocity {
                axis: self.axis,
                source,
            })?;

        let status = self.guard().await?;
        if !status.is_homed() {
            warn!(
                "Axis {} is not homed: {:?} move to {} is relative to power-on",
                self.axis, move_type, value
            );
        }

        self.write(register_map::MOVE_TYPE, move_type as u16).await?;
        self.write_pair(register_map::VELOCITY, u32_to_registers(velocity.0))
            .await?;
        self.write_pair(register_map::TARGET_POSITION, i32_to_registers(value))
            .await?;
        self.write(register_map::COMMAND_WORD, CommandWord::START_MOVE.bits())
            .await?;

        let mut local = self.local();
        local.state = AxisState::Moving;
        local.last_command = Some(Command::Move);
        info!(
            "Axis {} {:?} move to {} at {}",
            self.axis, move_type, value, velocity
        );
        Ok(())
    }

    /// Start a homing run
    pub async fn home(&self) -> Result<(), AxisError> {
        self.guard().await?;
        self.write(register_map::COMMAND_WORD, CommandWord::START_HOME.bits())
            .await?;

        let mut local = self.local();
        local.state = AxisState::Homing;
        local.last_command = Some(Command::Home);
        info!("Axis {} homing", self.axis);
        Ok(())
    }

    /// Request a stop. Sent whatever the current state.
    pub async fn stop(&self) -> Result<(), AxisError> {
        self.write(register_map::COMMAND_WORD, CommandWord::STOP.bits())
            .await?;
        self.local().last_command = Some(Command::Stop);
        info!("Axis {} stop requested", self.axis);
        Ok(())
    }

    /// Poll the status every `interval` until the axis is Idle.
    ///
    /// ### Errors
    ///
    /// [`AxisError::Faulted`] if the axis reports an error while waiting,
    /// [`AxisError::MotionTimeout`] if it is still busy after `timeout`.
    pub async fn wait_until_idle(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Position, AxisError> {
        let started = Instant::now();
        loop {
            match self.poll().await? {
                AxisState::Idle => return self.read_position().await,
                AxisState::Error => {
                    let code = self.read_error_code().await?;
                    return Err(AxisError::Faulted {
                        axis: self.axis,
                        code,
                    });
                }
                state if started.elapsed() >= timeout => {
                    return Err(AxisError::MotionTimeout {
                        axis: self.axis,
                        state,
                        waited: started.elapsed(),
                    });
                }
                _ => time::sleep(interval).await,
            }
        }
    }

    pub async fn motor_on(&self) -> Result<(), AxisError> {
        self.write(register_map::MOTOR_ON, 1).await
    }

    pub async fn motor_off(&self) -> Result<(), AxisError> {
        self.write(register_map::MOTOR_ON, 0).await
    }

    pub async fn read_error_code(&self) -> Result<u16, AxisError> {
        self.read_single(register_map::ERROR_CODE).await
    }

    /// Ask the controller to drop a latched error.
    ///
    /// Recovery is the caller's decision; the controller never calls this on
    /// its own.
    pub async fn clear_error(&self) -> Result<AxisState, AxisError> {
        self.write(register_map::CLEAR_ERROR, 1).await?;
        info!("Axis {} error clear requested", self.axis);
        self.poll().await
    }

    pub async fn homing_type(&self) -> Result<u16, AxisError> {
        self.read_single(register_map::HOMING_TYPE).await
    }

    pub async fn set_homing_type(&self, homing_type: u16) -> Result<(), AxisError> {
        self.write(register_map::HOMING_TYPE, homing_type).await
    }

    pub async fn backlash(&self) -> Result<i32, AxisError> {
        Ok(registers_to_i32(self.read_pair(register_map::BACKLASH).await?))
    }

    pub async fn set_backlash(&self, micrometers: i32) -> Result<(), AxisError> {
        self.write_pair(register_map::BACKLASH, i32_to_registers(micrometers))
            .await
    }
}
