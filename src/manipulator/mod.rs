// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Three-axis manipulator
//!
//! [`XyzManipulator`] composes the X, Y and Z [`AxisController`]s that share
//! one register bus. Coordinated commands check that no axis is busy, then
//! address the axes in the fixed X, Y, Z order.
//!
//! The busy check and the three commands are not atomic at the device level:
//! there is no transaction spanning several Modbus slaves. A command that
//! fails on one axis is not rolled back on the others; the failure is
//! reported per axis and the manipulator enters `PartialError`.
//!
//! `stop` is a best-effort broadcast. It does not wait for an in-flight
//! coordinated command and one failing axis never prevents the stop request
//! from reaching the others. A coordinated command overtaken by a stop does
//! not start its remaining axes, and an axis it started after the stop is
//! stopped again; those axes are reported as [`AxisError::Interrupted`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};

use crate::axis::{
    kinematics::{axis_velocity, VelocityError},
    velocity_components, Axis, AxisController, AxisError, AxisState, Calibration, PerAxis,
    Position, Velocity, VelocityLimits,
};
use crate::config::ClientConfig;
use crate::modbus::{register_map::StatusWord, ModbusTransport, RegisterBus, SlaveId, TransportError};

/// Per-axis outcome of a coordinated command that did not succeed everywhere
#[derive(Debug)]
pub struct AxisFailures {
    pub outcomes: PerAxis<Result<(), AxisError>>,
}

impl AxisFailures {
    /// Axes whose command failed, with the reason
    pub fn failed(&self) -> impl Iterator<Item = (Axis, &AxisError)> {
        self.outcomes
            .iter()
            .filter_map(|(axis, outcome)| outcome.as_ref().err().map(|e| (axis, e)))
    }

    /// Axes that accepted the command
    pub fn succeeded(&self) -> Vec<Axis> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(axis, _)| axis)
            .collect()
    }

    pub fn error(&self, axis: Axis) -> Option<&AxisError> {
        self.outcomes.get(axis).as_ref().err()
    }
}

impl fmt::Display for AxisFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (_, error) in self.failed() {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", error)?;
            first = false;
        }
        Ok(())
    }
}

/// Errors raised by manipulator operations
#[derive(Error, Debug)]
pub enum ManipulatorError {
    /// The link could not be opened
    #[error("could not connect to the manipulator: {0}")]
    Connection(#[from] TransportError),

    /// Unusable axis addressing
    #[error("invalid manipulator configuration: {0}")]
    Configuration(String),

    /// An axis is moving or homing; nothing was written to any axis
    #[error("axis {axis} is busy (status {status:?})")]
    Busy { axis: Axis, status: StatusWord },

    #[error("invalid velocity: {0}")]
    InvalidVelocity(#[from] VelocityError),

    /// At least one axis failed; the others kept their outcome
    #[error("command failed on some axes: {0}")]
    Partial(AxisFailures),
}

/// Overall state derived from the three axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallState {
    Idle,
    Homing,
    Moving,
    /// A coordinated command failed on some axis, or an axis is in error or
    /// unreachable. Inspect each axis.
    PartialError,
}

/// Snapshot of the manipulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManipulatorState {
    pub axes: PerAxis<AxisState>,
    pub calibration: PerAxis<Calibration>,
    pub overall: OverallState,
}

impl ManipulatorState {
    /// All three axes have a homed reference
    pub fn is_homed(&self) -> bool {
        self.calibration
            .iter()
            .all(|(_, c)| *c == Calibration::Homed)
    }
}

/// X, Y and Z axis controllers sharing one register bus
pub struct XyzManipulator {
    axes: PerAxis<AxisController>,
    transport: Option<Arc<ModbusTransport>>,
    command_lock: Mutex<()>,
    partial_error: AtomicBool,
    /// Bumped by every stop, before it is sent
    stop_generation: AtomicU64,
    poll_interval: Duration,
}

impl XyzManipulator {
    /// Open the Modbus TCP link described by `config` and address the axes
    /// with its slave identifiers.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ManipulatorError> {
        let slaves = config.axis_slaves().ok_or_else(|| {
            ManipulatorError::Configuration(format!(
                "expected three slave identifiers, got {:?}",
                config.slave_ids
            ))
        })?;
        let transport =
            Arc::new(ModbusTransport::connect(&config.host, config.port, config.timeout()).await?);
        let mut manipulator = Self::new(transport.clone(), slaves, config.velocity_limits())?
            .with_poll_interval(config.poll_interval());
        manipulator.transport = Some(transport);
        info!(
            "Manipulator connected to {}:{} (X={}, Y={}, Z={})",
            config.host, config.port, slaves.x, slaves.y, slaves.z
        );
        Ok(manipulator)
    }

    /// Build a manipulator over an existing bus.
    ///
    /// ### Errors
    ///
    /// [`ManipulatorError::Configuration`] when two axes share a slave id.
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        slaves: PerAxis<SlaveId>,
        limits: VelocityLimits,
    ) -> Result<Self, ManipulatorError> {
        if slaves.x == slaves.y || slaves.y == slaves.z || slaves.x == slaves.z {
            return Err(ManipulatorError::Configuration(format!(
                "slave identifiers must be unique, got X={}, Y={}, Z={}",
                slaves.x, slaves.y, slaves.z
            )));
        }
        let axes = slaves.map(|axis, slave| {
            AxisController::with_limits(axis, slave, bus.clone(), limits)
        });
        Ok(Self {
            axes,
            transport: None,
            command_lock: Mutex::new(()),
            partial_error: AtomicBool::new(false),
            stop_generation: AtomicU64::new(0),
            poll_interval: Duration::from_millis(50),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn axis(&self, axis: Axis) -> &AxisController {
        self.axes.get(axis)
    }

    /// Straight-line velocity limits (per-axis limits are shared by all axes)
    pub fn limits(&self) -> VelocityLimits {
        self.axes.x.limits()
    }

    /// Read the status of every axis and fail if any of them is busy.
    ///
    /// Axes that cannot be read are returned as failures so that the command
    /// skips them; they do not block the other axes.
    async fn busy_check(&self) -> Result<PerAxis<Option<AxisError>>, ManipulatorError> {
        let mut unreachable = PerAxis::new(None, None, None);
        let mut busy = None;
        for axis in Axis::ALL {
            match self.axes.get(axis).read_status().await {
                Ok(status) if status.is_busy() => {
                    busy.get_or_insert((axis, status));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Axis {} unreadable before command: {}", axis, e);
                    *unreachable.get_mut(axis) = Some(e);
                }
            }
        }
        if let Some((axis, status)) = busy {
            warn!("Manipulator command refused: axis {} busy", axis);
            return Err(ManipulatorError::Busy { axis, status });
        }
        Ok(unreachable)
    }

    fn stop_requested_since(&self, generation: u64) -> bool {
        self.stop_generation.load(Ordering::SeqCst) != generation
    }

    /// Outcome of one axis command issued under `generation`.
    ///
    /// A stop may have reached the axis before the start command did, in
    /// which case the axis is stopped again.
    async fn settle(
        &self,
        axis: Axis,
        generation: u64,
        outcome: Result<(), AxisError>,
    ) -> Result<(), AxisError> {
        outcome?;
        if !self.stop_requested_since(generation) {
            return Ok(());
        }
        warn!("Axis {} started while a stop was requested, stopping it", axis);
        if let Err(e) = self.axes.get(axis).stop().await {
            warn!("Stop could not be delivered to axis {}: {}", axis, e);
        }
        Err(AxisError::Interrupted { axis })
    }

    fn conclude(&self, outcomes: PerAxis<Result<(), AxisError>>) -> Result<(), ManipulatorError> {
        if outcomes.iter().all(|(_, o)| o.is_ok()) {
            self.partial_error.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.partial_error.store(true, Ordering::SeqCst);
        let failures = AxisFailures { outcomes };
        warn!("Manipulator command partially failed: {}", failures);
        Err(ManipulatorError::Partial(failures))
    }

    /// Move every axis to its target at the same axis velocity.
    pub async fn move_to(
        &self,
        x: Position,
        y: Position,
        z: Position,
        velocity: Velocity,
    ) -> Result<(), ManipulatorError> {
        let targets = PerAxis::new(x, y, z).map(|_, target| Some((target, velocity)));
        self.move_axes(targets).await
    }

    /// Move along a straight line so that all axes arrive together.
    ///
    /// `total_velocity` (µm/s) is split into per-axis components; axes that
    /// do not travel are not commanded.
    pub async fn move_linear(
        &self,
        target: PerAxis<Position>,
        total_velocity: f64,
    ) -> Result<(), ManipulatorError> {
        let limits = self.limits();
        limits.validate_total(total_velocity)?;

        let mut start = PerAxis::new(Position::ZERO, Position::ZERO, Position::ZERO);
        let mut failures = PerAxis::new(Ok(()), Ok(()), Ok(()));
        let mut failed = false;
        for (axis, position) in self.poll_positions().await.iter_owned() {
            match position {
                Ok(position) => *start.get_mut(axis) = position,
                Err(e) => {
                    *failures.get_mut(axis) = Err(e);
                    failed = true;
                }
            }
        }
        if failed {
            return self.conclude(failures);
        }

        let components = velocity_components(start, target, total_velocity, &limits)?;
        let targets = target.map(|axis, position| {
            if position == *start.get(axis) {
                return None;
            }
            let velocity = axis_velocity(*components.get(axis));
            Some((position, Velocity(velocity.0.max(limits.min))))
        });
        self.move_axes(targets).await
    }

    async fn move_axes(
        &self,
        targets: PerAxis<Option<(Position, Velocity)>>,
    ) -> Result<(), ManipulatorError> {
        let generation = self.stop_generation.load(Ordering::SeqCst);

        // Reject bad velocities before touching any axis
        for (axis, target) in targets.iter() {
            if let Some((_, velocity)) = target {
                self.axes.get(axis).limits().validate_axis(*velocity)?;
            }
        }

        let _command = self.command_lock.lock().await;
        let unreachable = self.busy_check().await?;

        let mut outcomes = PerAxis::new(Ok(()), Ok(()), Ok(()));
        for (axis, error) in unreachable.iter_owned() {
            if let Some(error) = error {
                *outcomes.get_mut(axis) = Err(error);
                continue;
            }
            let Some((position, velocity)) = *targets.get(axis) else {
                continue;
            };
            if self.stop_requested_since(generation) {
                *outcomes.get_mut(axis) = Err(AxisError::Interrupted { axis });
                continue;
            }
            let outcome = self.axes.get(axis).move_to(position, velocity).await;
            *outcomes.get_mut(axis) = self.settle(axis, generation, outcome).await;
        }
        self.conclude(outcomes)
    }

    /// Home the three axes.
    ///
    /// The manipulator is homed once every axis reports its homed flag, see
    /// [`XyzManipulator::is_homed`].
    pub async fn home(&self) -> Result<(), ManipulatorError> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        let _command = self.command_lock.lock().await;
        let unreachable = self.busy_check().await?;

        let mut outcomes = PerAxis::new(Ok(()), Ok(()), Ok(()));
        for (axis, error) in unreachable.iter_owned() {
            *outcomes.get_mut(axis) = match error {
                Some(error) => Err(error),
                None if self.stop_requested_since(generation) => {
                    Err(AxisError::Interrupted { axis })
                }
                None => {
                    let outcome = self.axes.get(axis).home().await;
                    self.settle(axis, generation, outcome).await
                }
            };
        }
        self.conclude(outcomes)
    }

    /// Send stop to every axis, whatever happens on the others.
    pub async fn stop(&self) -> Result<(), ManipulatorError> {
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = PerAxis::new(Ok(()), Ok(()), Ok(()));
        for axis in Axis::ALL {
            let outcome = self.axes.get(axis).stop().await;
            if let Err(e) = &outcome {
                warn!("Stop could not be delivered to axis {}: {}", axis, e);
            }
            *outcomes.get_mut(axis) = outcome;
        }
        self.conclude(outcomes)
    }

    /// Read the three positions; a failing axis does not hide the others.
    pub async fn poll_positions(&self) -> PerAxis<Result<Position, AxisError>> {
        let mut positions = PerAxis::new(
            Ok(Position::ZERO),
            Ok(Position::ZERO),
            Ok(Position::ZERO),
        );
        for axis in Axis::ALL {
            *positions.get_mut(axis) = self.axes.get(axis).read_position().await;
        }
        positions
    }

    /// Whether all three axes currently report a homed reference
    pub async fn is_homed(&self) -> bool {
        for axis in Axis::ALL {
            match self.axes.get(axis).read_status().await {
                Ok(status) if status.is_homed() => {}
                _ => return false,
            }
        }
        true
    }

    /// Poll every axis and return the resulting state.
    pub async fn refresh(&self) -> ManipulatorState {
        for axis in Axis::ALL {
            if let Err(e) = self.axes.get(axis).poll().await {
                warn!("Axis {} status unavailable: {}", axis, e);
            }
        }
        self.state()
    }

    /// State from the last known axis states, without bus traffic
    pub fn state(&self) -> ManipulatorState {
        let axes = PerAxis::from_fn(|axis| self.axes.get(axis).state());
        let calibration = PerAxis::from_fn(|axis| self.axes.get(axis).calibration());
        let overall = if self.partial_error.load(Ordering::SeqCst)
            || axes
                .iter()
                .any(|(_, s)| matches!(s, AxisState::Error | AxisState::Disconnected))
        {
            OverallState::PartialError
        } else if axes.iter().any(|(_, s)| *s == AxisState::Homing) {
            OverallState::Homing
        } else if axes.iter().any(|(_, s)| *s == AxisState::Moving) {
            OverallState::Moving
        } else {
            OverallState::Idle
        };
        ManipulatorState {
            axes,
            calibration,
            overall,
        }
    }

    /// Wait until every axis is Idle and return the final positions.
    ///
    /// `timeout` bounds the whole wait, not each axis.
    pub async fn wait_until_idle(
        &self,
        timeout: Duration,
    ) -> Result<PerAxis<Position>, ManipulatorError> {
        let started = Instant::now();
        let mut positions = PerAxis::new(Position::ZERO, Position::ZERO, Position::ZERO);
        let mut outcomes = PerAxis::new(Ok(()), Ok(()), Ok(()));
        for axis in Axis::ALL {
            let remaining = timeout.saturating_sub(started.elapsed());
            match self
                .axes
                .get(axis)
                .wait_until_idle(remaining, self.poll_interval)
                .await
            {
                Ok(position) => *positions.get_mut(axis) = position,
                Err(e) => *outcomes.get_mut(axis) = Err(e),
            }
        }
        self.conclude(outcomes).map(|_| positions)
    }

    /// Close the Modbus link when this manipulator opened it.
    pub async fn close(&self) {
        if let Some(transport) = &self.transport {
            transport.close().await;
        }
    }
}
