// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! SMCD14 emulator
//!
//! A set of simulated axis controllers addressed by slave identifier, sharing
//! one register protocol implementation. The emulator is served over Modbus
//! TCP by [`crate::modbus::Smcd14ModbusServer`] and can also be used in process
//! through its [`RegisterBus`] implementation.

pub mod simulated_axis;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio_modbus::prelude::*;

use crate::config::EmulatorConfig;
use crate::modbus::register_map::StatusWord;
use crate::modbus::{FunctionCode, RegisterBus, SlaveId, TransportError};

pub use simulated_axis::{SimulatedAxis, SimulationSettings};

/// Observed state of one simulated axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSnapshot {
    pub position: i32,
    pub status: StatusWord,
}

/// All emulated slaves behind one endpoint
#[derive(Debug, Clone)]
pub struct Smcd14Emulator {
    axes: Arc<Mutex<HashMap<SlaveId, SimulatedAxis>>>,
}

impl Smcd14Emulator {
    pub fn new(slaves: &[SlaveId], settings: SimulationSettings) -> Self {
        let axes = slaves
            .iter()
            .map(|slave| (*slave, SimulatedAxis::new(settings)))
            .collect();
        Self {
            axes: Arc::new(Mutex::new(axes)),
        }
    }

    pub fn from_config(config: &EmulatorConfig) -> Self {
        Self::new(&config.slave_ids, config.simulation_settings())
    }

    /// Identifiers answered by this emulator, sorted
    pub fn slaves(&self) -> Vec<SlaveId> {
        let mut slaves: Vec<SlaveId> = match self.axes.lock() {
            Ok(axes) => axes.keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        slaves.sort_unstable();
        slaves
    }

    /// Process one request addressed to `slave`.
    pub fn handle(&self, slave: SlaveId, request: Request<'_>) -> Result<Response, ExceptionCode> {
        self.handle_at(slave, request, Instant::now())
    }

    /// Process one request as if it arrived at `now`.
    pub fn handle_at(
        &self,
        slave: SlaveId,
        request: Request<'_>,
        now: Instant,
    ) -> Result<Response, ExceptionCode> {
        let mut axes = self.axes.lock().map_err(|_| {
            error!("Emulator state lock poisoned");
            ExceptionCode::ServerDeviceFailure
        })?;
        let Some(axis) = axes.get_mut(&slave) else {
            warn!("Request for unknown slave {}: {:?}", slave, request);
            return Err(ExceptionCode::GatewayTargetDevice);
        };

        debug!("slave {} <- {:?}", slave, request);
        match request {
            Request::ReadHoldingRegisters(addr, cnt) => axis
                .read(addr, cnt, now)
                .map(Response::ReadHoldingRegisters),
            Request::WriteSingleRegister(addr, value) => axis
                .write(addr, std::slice::from_ref(&value), now)
                .map(|_| Response::WriteSingleRegister(addr, value)),
            Request::WriteMultipleRegisters(addr, values) => axis
                .write(addr, &values, now)
                .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16)),
            _ => {
                error!(
                    "Exception::IllegalFunction - Unimplemented function code in request: {:?}",
                    request
                );
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }

    /// Position and status of `slave`, advanced to the current instant
    pub fn snapshot(&self, slave: SlaveId) -> Option<AxisSnapshot> {
        let mut axes = self.axes.lock().ok()?;
        let axis = axes.get_mut(&slave)?;
        axis.tick(Instant::now());
        Some(AxisSnapshot {
            position: axis.position(),
            status: axis.status(),
        })
    }

    fn call(&self, slave: SlaveId, request: Request<'_>) -> Result<Response, TransportError> {
        let function = FunctionCode::of(&request).ok_or_else(|| TransportError::Protocol {
            slave,
            reason: format!("unsupported request {:?}", request),
        })?;
        self.handle(slave, request)
            .map_err(|exception| TransportError::Device {
                slave,
                function,
                exception,
            })
    }
}

#[async_trait]
impl RegisterBus for Smcd14Emulator {
    async fn read_registers(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        match self.call(slave, Request::ReadHoldingRegisters(address, count))? {
            Response::ReadHoldingRegisters(words) => Ok(words),
            other => Err(TransportError::Protocol {
                slave,
                reason: format!("unexpected response {:?}", other),
            }),
        }
    }

    async fn write_register(
        &self,
        slave: SlaveId,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        self.call(slave, Request::WriteSingleRegister(address, value))
            .map(|_| ())
    }

    async fn write_registers(
        &self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        self.call(
            slave,
            Request::WriteMultipleRegisters(address, values.into()),
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::register_map::{
        CommandWord, COMMAND_WORD, CURRENT_POSITION, STATUS_WORD, TARGET_POSITION, VELOCITY,
    };

    #[test]
    fn test_unknown_slave_is_a_gateway_error() {
        let emulator = Smcd14Emulator::new(&[1, 2, 3], SimulationSettings::default());
        let err = emulator
            .handle(9, Request::ReadHoldingRegisters(STATUS_WORD.address, 1))
            .unwrap_err();
        assert_eq!(err, ExceptionCode::GatewayTargetDevice);
    }

    #[test]
    fn test_unsupported_function() {
        let emulator = Smcd14Emulator::new(&[1], SimulationSettings::default());
        let err = emulator
            .handle(1, Request::ReadInputRegisters(0, 1))
            .unwrap_err();
        assert_eq!(err, ExceptionCode::IllegalFunction);
    }

    #[test]
    fn test_slaves_are_independent() {
        let emulator = Smcd14Emulator::new(&[3, 1, 2], SimulationSettings::default());
        assert_eq!(emulator.slaves(), vec![1, 2, 3]);

        emulator
            .handle(2, Request::WriteMultipleRegisters(VELOCITY.address, vec![10, 0].into()))
            .unwrap();
        emulator
            .handle(2, Request::WriteMultipleRegisters(TARGET_POSITION.address, vec![500, 0].into()))
            .unwrap();
        emulator
            .handle(2, Request::WriteSingleRegister(COMMAND_WORD.address, CommandWord::START_MOVE.bits()))
            .unwrap();
        assert!(emulator.snapshot(2).unwrap().status.is_busy());
        assert_eq!(emulator.snapshot(1).unwrap().status, StatusWord::IDLE);

        let words = emulator
            .handle(1, Request::ReadHoldingRegisters(CURRENT_POSITION.address, 2))
            .unwrap();
        assert_eq!(words, Response::ReadHoldingRegisters(vec![0, 0]));
    }

    #[tokio::test]
    async fn test_register_bus_maps_exceptions() {
        let emulator = Smcd14Emulator::new(&[1], SimulationSettings::default());
        let err = emulator.read_registers(4, STATUS_WORD.address, 1).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Device {
                slave: 4,
                function: FunctionCode::ReadHoldingRegisters,
                exception: ExceptionCode::GatewayTargetDevice,
            }
        ));
        let status = emulator.read_registers(1, STATUS_WORD.address, 1).await.unwrap();
        assert_eq!(status, vec![StatusWord::IDLE.bits()]);
    }
}
