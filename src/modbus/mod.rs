// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus communication module
//!
//! This module holds everything that speaks Modbus TCP on behalf of the
//! manipulator: the SMCD14 register contract, the shared client transport and
//! the server side service used by the emulator.
//!
//! ## Key Components
//!
//! - [`register_map`]: addresses, widths and bit layouts of the SMCD14 registers
//! - [`ModbusTransport`]: one serialized TCP session shared by the three axes
//! - [`Smcd14ModbusServer`]: `tokio-modbus` service answering for every
//!   emulated slave
//!
//! ## Usage
//!
//! ```no_run
//! use smcd14_manipulator::modbus::{ModbusTransport, RegisterBus, register_map};
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let transport = ModbusTransport::connect("127.0.0.1", 5020, Duration::from_secs(1)).await?;
//! let status = transport.read_registers(1, register_map::STATUS_WORD.address, 1).await?;
//! println!("status of slave 1: {:#06x}", status[0]);
//! # Ok(())
//! # }
//! ```

pub mod modbus_server;
pub mod register_map;
pub mod transport;

pub use modbus_server::Smcd14ModbusServer;
pub use transport::{FunctionCode, ModbusTransport, RegisterBus, SlaveId, TransportError};
