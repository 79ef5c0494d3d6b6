// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! SMCD14 manipulator library
//!
//! Control of a three-axis (X, Y, Z) manipulator whose axes are driven by
//! SMCD14 stepper motor controllers on one Modbus TCP link, plus an emulator
//! of those controllers.
//!
//! - [`modbus`]: register contract, shared transport and the emulator service
//! - [`axis`]: one controller, engineering units and velocity handling
//! - [`manipulator`]: coordinated three-axis commands
//! - [`emulator`]: simulated controllers
//! - [`daemon`]: background tasks of the emulator process
//! - [`config`]: YAML configuration

pub mod axis;
pub mod config;
pub mod daemon;
pub mod emulator;
pub mod manipulator;
pub mod modbus;

pub use axis::{Axis, AxisState, Calibration, PerAxis, Position, Velocity};
pub use manipulator::{ManipulatorError, ManipulatorState, OverallState, XyzManipulator};
