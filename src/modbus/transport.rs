// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Shared Modbus TCP transport
//!
//! The three SMCD14 controllers of the manipulator sit behind one TCP session,
//! each answering on its own unit (slave) identifier. [`ModbusTransport`] owns
//! that session and serializes every request/response exchange: only one
//! request is ever in flight, whichever axis issued it.
//!
//! Framing and MBAP transaction matching are delegated to `tokio-modbus`; this
//! layer adds the per-request slave addressing, a caller configurable deadline,
//! a response consistency check and the error taxonomy used by the axis
//! controllers.
//!
//! Axis controllers do not talk to the transport directly but through the
//! [`RegisterBus`] trait, which the in-process emulator implements as well.

use std::{borrow::Cow, fmt, io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{sync::Mutex, time};
use tokio_modbus::client::{Client, Context};
use tokio_modbus::prelude::*;

/// Modbus unit identifier of one axis controller
pub type SlaveId = u8;

/// Default deadline for one exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Modbus function codes used by the SMCD14 register protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn of(request: &Request<'_>) -> Option<Self> {
        match request {
            Request::ReadHoldingRegisters(..) => Some(FunctionCode::ReadHoldingRegisters),
            Request::WriteSingleRegister(..) => Some(FunctionCode::WriteSingleRegister),
            Request::WriteMultipleRegisters(..) => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, *self as u8)
    }
}

/// Errors raised by a register exchange
#[derive(Error, Debug)]
pub enum TransportError {
    /// The TCP session could not be established or broke down
    #[error("connection to {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The session was closed or lost and has not been reopened
    #[error("not connected to {address}")]
    NotConnected { address: String },

    /// No response within the configured deadline
    #[error("no response from slave {slave} within {timeout:?}")]
    Timeout { slave: SlaveId, timeout: Duration },

    /// Malformed or mismatched response
    #[error("protocol error talking to slave {slave}: {reason}")]
    Protocol { slave: SlaveId, reason: String },

    /// The device answered with a Modbus exception
    #[error("slave {slave} answered {function} with exception {exception}")]
    Device {
        slave: SlaveId,
        function: FunctionCode,
        exception: ExceptionCode,
    },
}

impl TransportError {
    /// The link itself is unusable until reconnected
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. } | TransportError::NotConnected { .. }
        )
    }
}

/// Register level access to addressed SMCD14 devices.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// Read `count` holding registers starting at `address`
    async fn read_registers(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write one holding register
    async fn write_register(
        &self,
        slave: SlaveId,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError>;

    /// Write consecutive holding registers starting at `address`
    async fn write_registers(
        &self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError>;
}

struct Session {
    context: Option<Context>,
    /// Reopen transparently on the next exchange. Set after a timeout, where the
    /// session may still carry a late response that must never be matched.
    reopen: bool,
    transaction_id: u16,
}

/// One persistent Modbus TCP session shared by several slave devices.
pub struct ModbusTransport {
    address: SocketAddr,
    timeout: Duration,
    session: Mutex<Session>,
}

impl ModbusTransport {
    /// Open a session to `host:port`.
    ///
    /// ### Errors
    ///
    /// [`TransportError::Connection`] when the host cannot be resolved, the
    /// connection is refused or does not complete within `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let address = resolve(host, port).await?;
        Self::connect_addr(address, timeout).await
    }

    /// Open a session to an already resolved socket address.
    pub async fn connect_addr(address: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let context = open(address, timeout).await?;
        info!("Connected to SMCD14 link at {}", address);
        Ok(Self {
            address,
            timeout,
            session: Mutex::new(Session {
                context: Some(context),
                reopen: false,
                transaction_id: 0,
            }),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.context.is_some()
    }

    /// Drop the current session, if any, and open a fresh one.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if let Some(context) = session.context.take() {
            shutdown(context).await;
        }
        session.context = Some(open(self.address, self.timeout).await?);
        session.reopen = false;
        info!("Reconnected to SMCD14 link at {}", self.address);
        Ok(())
    }

    /// Release the socket. Calling it again is a no-op.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        session.reopen = false;
        if let Some(context) = session.context.take() {
            shutdown(context).await;
            info!("Closed SMCD14 link at {}", self.address);
        }
    }

    /// Send one request to `slave` and wait for its response.
    ///
    /// The session lock is held for the whole exchange, so requests coming
    /// from different axes are delivered one at a time, in lock order.
    pub async fn exchange(
        &self,
        slave: SlaveId,
        request: Request<'_>,
    ) -> Result<Response, TransportError> {
        let function = FunctionCode::of(&request).ok_or_else(|| TransportError::Protocol {
            slave,
            reason: format!("unsupported request {:?}", request),
        })?;

        let mut session = self.session.lock().await;
        if session.context.is_none() {
            if !session.reopen {
                return Err(TransportError::NotConnected {
                    address: self.address.to_string(),
                });
            }
            debug!("Reopening SMCD14 session after timeout");
            session.context = Some(open(self.address, self.timeout).await?);
            session.reopen = false;
        }

        session.transaction_id = next_transaction_id(session.transaction_id);
        let transaction_id = session.transaction_id;
        let Some(context) = session.context.as_mut() else {
            return Err(TransportError::NotConnected {
                address: self.address.to_string(),
            });
        };

        debug!(
            "tx {} -> slave {}: {} {:?}",
            transaction_id, slave, function, request
        );
        context.set_slave(Slave(slave));
        let outcome = time::timeout(self.timeout, context.call(request)).await;

        match outcome {
            Err(_) => {
                warn!(
                    "tx {}: slave {} did not answer within {:?}",
                    transaction_id, slave, self.timeout
                );
                session.context = None;
                session.reopen = true;
                Err(TransportError::Timeout {
                    slave,
                    timeout: self.timeout,
                })
            }
            Ok(Err(tokio_modbus::Error::Transport(source))) => {
                error!("tx {}: link failure: {}", transaction_id, source);
                session.context = None;
                Err(TransportError::Connection {
                    address: self.address.to_string(),
                    source,
                })
            }
            Ok(Err(other)) => Err(TransportError::Protocol {
                slave,
                reason: other.to_string(),
            }),
            Ok(Ok(Err(exception))) => {
                warn!(
                    "tx {}: slave {} raised {} for {}",
                    transaction_id, slave, exception, function
                );
                Err(TransportError::Device {
                    slave,
                    function,
                    exception,
                })
            }
            Ok(Ok(Ok(response))) => {
                debug!("tx {} <- slave {}: {:?}", transaction_id, slave, response);
                Ok(response)
            }
        }
    }

    /// Identifier that was attached to the most recent exchange
    pub async fn last_transaction_id(&self) -> u16 {
        self.session.lock().await.transaction_id
    }
}

#[async_trait]
impl RegisterBus for ModbusTransport {
    async fn read_registers(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        match self
            .exchange(slave, Request::ReadHoldingRegisters(address, count))
            .await?
        {
            Response::ReadHoldingRegisters(words) if words.len() == count as usize => Ok(words),
            Response::ReadHoldingRegisters(words) => Err(TransportError::Protocol {
                slave,
                reason: format!("expected {} registers, got {}", count, words.len()),
            }),
            other => Err(mismatch(slave, FunctionCode::ReadHoldingRegisters, &other)),
        }
    }

    async fn write_register(
        &self,
        slave: SlaveId,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        match self
            .exchange(slave, Request::WriteSingleRegister(address, value))
            .await?
        {
            Response::WriteSingleRegister(echo_addr, echo_value)
                if echo_addr == address && echo_value == value =>
            {
                Ok(())
            }
            Response::WriteSingleRegister(echo_addr, echo_value) => Err(TransportError::Protocol {
                slave,
                reason: format!(
                    "write echo {}={} does not match request {}={}",
                    echo_addr, echo_value, address, value
                ),
            }),
            other => Err(mismatch(slave, FunctionCode::WriteSingleRegister, &other)),
        }
    }

    async fn write_registers(
        &self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        match self
            .exchange(
                slave,
                Request::WriteMultipleRegisters(address, Cow::Borrowed(values)),
            )
            .await?
        {
            Response::WriteMultipleRegisters(echo_addr, quantity)
                if echo_addr == address && quantity as usize == values.len() =>
            {
                Ok(())
            }
            Response::WriteMultipleRegisters(echo_addr, quantity) => Err(TransportError::Protocol {
                slave,
                reason: format!(
                    "write echo {}x{} does not match request {}x{}",
                    echo_addr,
                    quantity,
                    address,
                    values.len()
                ),
            }),
            other => Err(mismatch(slave, FunctionCode::WriteMultipleRegisters, &other)),
        }
    }
}

/// Transaction identifiers wrap at the 16-bit MBAP field width
fn next_transaction_id(current: u16) -> u16 {
    current.wrapping_add(1)
}

fn mismatch(slave: SlaveId, expected: FunctionCode, response: &Response) -> TransportError {
    TransportError::Protocol {
        slave,
        reason: format!("expected a {} response, got {:?}", expected, response),
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let address = format!("{}:{}", host, port);
    let mut candidates = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| TransportError::Connection {
            address: address.clone(),
            source,
        })?;
    candidates.next().ok_or_else(|| TransportError::Connection {
        address,
        source: io::Error::new(io::ErrorKind::NotFound, "host did not resolve"),
    })
}

async fn open(address: SocketAddr, timeout: Duration) -> Result<Context, TransportError> {
    match time::timeout(timeout, tcp::connect(address)).await {
        Ok(Ok(context)) => Ok(context),
        Ok(Err(source)) => Err(TransportError::Connection {
            address: address.to_string(),
            source,
        }),
        Err(_) => Err(TransportError::Connection {
            address: address.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

async fn shutdown(mut context: Context) {
    if let Err(err) = context.disconnect().await {
        debug!("Ignoring error while closing Modbus session: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Start a Modbus TCP peer answering every request PDU with `answer`.
    ///
    /// The MBAP header of the response echoes the transaction and unit
    /// identifiers of the request, so only the PDU is under test.
    async fn start_peer(
        answer: fn(&[u8]) -> Vec<u8>,
    ) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            loop {
                let mut header = [0u8; 7];
                if stream.read_exact(&mut header).await.is_err() {
                    return;
                }
                let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                let mut pdu = vec![0u8; length.saturating_sub(1)];
                if stream.read_exact(&mut pdu).await.is_err() {
                    return;
                }
                let reply = answer(&pdu);
                let mut frame = Vec::with_capacity(7 + reply.len());
                frame.extend_from_slice(&header[0..4]);
                frame.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
                frame.push(header[6]);
                frame.extend_from_slice(&reply);
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
        });
        (address, task)
    }

    async fn transport_to(address: SocketAddr) -> ModbusTransport {
        ModbusTransport::connect_addr(address, Duration::from_millis(500))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_short_register_read_is_a_protocol_error() {
        // One register whatever the requested count
        let (address, peer) = start_peer(|_| vec![0x03, 0x02, 0x00, 0x2a]).await;
        let transport = transport_to(address).await;

        let err = transport.read_registers(1, 18, 2).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol { slave: 1, .. }), "{err}");
        assert!(!err.is_connection_error());
        peer.abort();
    }

    #[tokio::test]
    async fn test_wrong_write_echo_is_a_protocol_error() {
        // Echo the address with another value
        let (address, peer) = start_peer(|pdu| {
            let mut echo = pdu.to_vec();
            echo[4] = echo[4].wrapping_add(1);
            echo
        })
        .await;
        let transport = transport_to(address).await;

        let err = transport.write_register(2, 15, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol { slave: 2, .. }), "{err}");
        peer.abort();
    }

    #[tokio::test]
    async fn test_wrong_write_quantity_is_a_protocol_error() {
        // Acknowledge a single register for a two register write
        let (address, peer) = start_peer(|pdu| vec![0x10, pdu[1], pdu[2], 0x00, 0x01]).await;
        let transport = transport_to(address).await;

        let err = transport.write_registers(3, 2, &[1, 0]).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol { slave: 3, .. }), "{err}");
        peer.abort();
    }

    #[tokio::test]
    async fn test_response_for_another_function_is_a_protocol_error() {
        // A write echo in answer to a read
        let (address, peer) = start_peer(|_| vec![0x06, 0x00, 0x0f, 0x00, 0x01]).await;
        let transport = transport_to(address).await;

        let err = transport.read_registers(1, 17, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol { .. }), "{err}");
        peer.abort();
    }

    #[tokio::test]
    async fn test_exception_response_is_a_device_error() {
        let (address, peer) = start_peer(|pdu| vec![pdu[0] | 0x80, 0x06]).await;
        let transport = transport_to(address).await;

        let err = transport.write_register(1, 15, 1).await.unwrap_err();
        assert!(
            matches!(
                err,
                TransportError::Device {
                    slave: 1,
                    function: FunctionCode::WriteSingleRegister,
                    exception: ExceptionCode::ServerDeviceBusy,
                }
            ),
            "{err}"
        );
        peer.abort();
    }

    #[test]
    fn test_transaction_id_wraps() {
        assert_eq!(next_transaction_id(0), 1);
        assert_eq!(next_transaction_id(u16::MAX - 1), u16::MAX);
        assert_eq!(next_transaction_id(u16::MAX), 0);
    }

    #[tokio::test]
    async fn test_exchange_after_the_last_transaction_id_wraps() {
        let (address, peer) = start_peer(|_| vec![0x03, 0x02, 0x00, 0x01]).await;
        let transport = transport_to(address).await;
        transport.session.lock().await.transaction_id = u16::MAX;

        assert_eq!(transport.read_registers(1, 17, 1).await.unwrap(), vec![1]);
        assert_eq!(transport.last_transaction_id().await, 0);
        assert_eq!(transport.read_registers(1, 17, 1).await.unwrap(), vec![1]);
        assert_eq!(transport.last_transaction_id().await, 1);
        peer.abort();
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_connection_error() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let err = ModbusTransport::connect_addr(address, Duration::from_millis(500))
            .await
            .err()
            .expect("connect must fail");
        assert!(err.is_connection_error(), "{err}");
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_and_session_is_reopened() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        // Accept connections but never answer
        let accept_task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let transport = ModbusTransport::connect_addr(address, Duration::from_millis(100))
            .await
            .unwrap();
        let err = transport.read_registers(1, 17, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { slave: 1, .. }), "{err}");
        assert!(!transport.is_connected().await);

        // The next exchange opens a fresh session and times out again
        let err = transport.read_registers(2, 17, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { slave: 2, .. }), "{err}");
        assert_eq!(transport.last_transaction_id().await, 2);

        transport.close().await;
        transport.close().await;
        let err = transport.read_registers(1, 17, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected { .. }), "{err}");
        accept_task.abort();
    }

    #[test]
    fn test_function_codes() {
        assert_eq!(
            FunctionCode::of(&Request::ReadHoldingRegisters(0, 1)),
            Some(FunctionCode::ReadHoldingRegisters)
        );
        assert_eq!(FunctionCode::of(&Request::ReadCoils(0, 1)), None);
        assert_eq!(FunctionCode::WriteMultipleRegisters as u8, 0x10);
    }
}
