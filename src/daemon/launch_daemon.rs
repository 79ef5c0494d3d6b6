// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Management Module
//!
//! Background tasks of the SMCD14 emulator process:
//!
//! - the Modbus TCP server answering for every emulated slave
//! - a heartbeat that periodically logs the simulated axes
//!
//! Tasks share a `running` flag. [`Daemon::shutdown`] clears it and
//! [`Daemon::join`] waits for every task with a bounded timeout. Client
//! sessions that are still open when the daemon shuts down are closed as
//! well, not only the accept loop.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};

use crate::config::Config;
use crate::emulator::Smcd14Emulator;
use crate::modbus::Smcd14ModbusServer;

/// How often long running tasks look at the `running` flag
const RUNNING_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// How long `join` waits for each task
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection that reads as closed once the daemon shuts down.
///
/// `tokio-modbus` spawns one task per connection and keeps no handle to it,
/// so the end of file seen here is what ends those tasks.
struct SessionStream {
    inner: TcpStream,
    shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,
    closed: bool,
}

impl SessionStream {
    fn new(inner: TcpStream, mut shutdown: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            shutdown: Box::pin(async move {
                // A dropped sender also means shutdown
                let _ = shutdown.wait_for(|stop| *stop).await;
            }),
            closed: false,
        }
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.closed && this.shutdown.as_mut().poll(cx).is_ready() {
            debug!("Closing Modbus client session on shutdown");
            this.closed = true;
        }
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Coordinates the background services of the emulator process.
///
/// ### Fields
///
/// * `tasks` - Handles of the spawned tasks, awaited by [`Daemon::join`]
/// * `running` - Shared flag; tasks terminate once it becomes `false`
/// * `sessions` - Raised on shutdown to close open client sessions
/// * `local_addr` - Address the Modbus listener actually bound to
/// * `emulator` - Emulated axes served by the listener
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
    sessions: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
    emulator: Option<Smcd14Emulator>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    pub fn new() -> Self {
        Daemon {
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            sessions: watch::channel(false).0,
            local_addr: None,
            emulator: None,
        }
    }

    /// Launch all configured tasks
    ///
    /// The listener is bound before this returns, so bind failures are
    /// reported here and [`Daemon::local_addr`] is usable right away. Port 0
    /// picks a free port.
    pub async fn launch(&mut self, config: &Config) -> Result<()> {
        let emulator = Smcd14Emulator::from_config(&config.emulator);
        self.start_modbus_server(config, emulator.clone()).await?;
        self.start_heartbeat(config, emulator.clone())?;
        self.emulator = Some(emulator);
        Ok(())
    }

    /// Address of the running Modbus listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The emulated axes, once launched
    pub fn emulator(&self) -> Option<&Smcd14Emulator> {
        self.emulator.as_ref()
    }

    /// Bind the listener and serve the emulator until shutdown
    ///
    /// # Errors
    ///
    /// Fails when the configured address does not resolve or the listener
    /// cannot be bound.
    async fn start_modbus_server(
        &mut self,
        config: &Config,
        emulator: Smcd14Emulator,
    ) -> Result<()> {
        // IP literals of both families or a host name; every resolved
        // address is tried in turn
        let target = (config.emulator.address.as_str(), config.emulator.port);
        let listener = TcpListener::bind(target).await.with_context(|| {
            format!(
                "Failed to bind Modbus listener on {} port {}",
                config.emulator.address, config.emulator.port
            )
        })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!(
            "Starting SMCD14 emulator on {} for slaves {:?}",
            local_addr,
            emulator.slaves()
        );

        let running = self.running.clone();
        let sessions = self.sessions.subscribe();
        let task = tokio::spawn(async move {
            let server = Server::new(listener);

            // Every connection gets its own service over the same simulated axes
            let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
                let service = Smcd14ModbusServer::new(emulator.clone());
                let shutdown = sessions.clone();
                async move {
                    debug!("Modbus client connected from {}", socket_addr);
                    let accepted =
                        accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                            Ok(Some(service.clone()))
                        })?;
                    Ok::<_, io::Error>(accepted.map(|(service, stream)| {
                        (service, SessionStream::new(stream, shutdown))
                    }))
                }
            };

            let on_process_error = |err| {
                error!("Modbus server error: {err}");
            };

            let server_handle = tokio::spawn(async move {
                if let Err(e) = server.serve(&on_connected, on_process_error).await {
                    error!("Modbus server error: {}", e);
                }
            });

            while running.load(Ordering::SeqCst) {
                time::sleep(RUNNING_CHECK_INTERVAL).await;
            }

            info!("Shutting down Modbus server...");
            server_handle.abort();

            match time::timeout(JOIN_TIMEOUT, server_handle).await {
                Ok(_) => info!("Modbus server shut down successfully"),
                Err(_) => warn!("Modbus server shutdown timed out, forcing termination"),
            }

            Ok(())
        });

        self.tasks.push(task);
        info!("Modbus server started");
        Ok(())
    }

    /// Periodically log the simulated axes at debug level
    fn start_heartbeat(&mut self, config: &Config, emulator: Smcd14Emulator) -> Result<()> {
        let interval = Duration::from_millis(config.emulator.heartbeat_ms);
        if interval.is_zero() {
            return Ok(());
        }
        let running = self.running.clone();
        let task = tokio::spawn(async move {
            let mut elapsed = Duration::ZERO;
            while running.load(Ordering::SeqCst) {
                time::sleep(RUNNING_CHECK_INTERVAL).await;
                elapsed += RUNNING_CHECK_INTERVAL;
                if elapsed < interval {
                    continue;
                }
                elapsed = Duration::ZERO;
                for slave in emulator.slaves() {
                    if let Some(snapshot) = emulator.snapshot(slave) {
                        debug!(
                            "Emulator heartbeat: slave {} at {} µm, status {:?}",
                            slave, snapshot.position, snapshot.status
                        );
                    }
                }
            }
            Ok(())
        });
        self.tasks.push(task);
        Ok(())
    }

    /// Signal every task to stop. Does not wait; see [`Daemon::join`].
    pub fn shutdown(&self) {
        info!("Shutting down daemon tasks");
        self.running.store(false, Ordering::SeqCst);
        self.sessions.send_replace(true);
    }

    /// Wait for all tasks to complete
    ///
    /// Task panics and task errors are logged, not returned. A task that does
    /// not finish within five seconds is abandoned with a warning.
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            match time::timeout(JOIN_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!("Task failed: {:#}", e),
                Ok(Err(e)) => error!("Task panicked: {}", e),
                Err(_) => warn!("Task did not complete within timeout period, may be hung"),
            }
        }
        Ok(())
    }
}
