// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus server implementation for the SMCD14 emulator
//!
//! For avoiding confusion with the Modbus master/slave terminology, this module uses
//! the terms "server" and "client" instead. The server is the emulated bank of axis
//! controllers, while the client is the manipulator control library.
//!
//! One server answers for every emulated slave: the unit identifier of each
//! request selects the simulated axis, and requests for identifiers that are
//! not emulated fail with `GatewayTargetDevice`.
//!
//! ## Supported functions
//!
//! | Code | Function |
//! |------|----------|
//! | 0x03 | Read Holding Registers |
//! | 0x06 | Write Single Register |
//! | 0x10 | Write Multiple Registers |
//!
//! Anything else is answered with `IllegalFunction`.

use std::future;

use log::{debug, error};
use tokio_modbus::prelude::*;

use crate::emulator::Smcd14Emulator;

/// `tokio-modbus` service in front of a [`Smcd14Emulator`].
///
/// Cloning is cheap; every connection gets its own service sharing the same
/// emulated axes.
#[derive(Debug, Clone)]
pub struct Smcd14ModbusServer {
    emulator: Smcd14Emulator,
}

impl Smcd14ModbusServer {
    pub fn new(emulator: Smcd14Emulator) -> Self {
        Self { emulator }
    }

    pub fn emulator(&self) -> &Smcd14Emulator {
        &self.emulator
    }
}

impl tokio_modbus::server::Service for Smcd14ModbusServer {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;
        debug!("Received Modbus request for slave {}: {:?}", slave, request);

        let res = self.emulator.handle(slave, request);

        if let Err(e) = &res {
            error!("Modbus request error for slave {}: {:?}", slave, e);
        }

        future::ready(res)
    }
}
