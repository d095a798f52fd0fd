// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Blocking bus sessions.
//!
//! A [`BusSession`] owns everything one poll cycle needs: the GPIO
//! direction controller (for half-duplex profiles), the serial connection
//! wrapped in the direction-switching transport, and a current-thread
//! runtime that the synchronous API blocks on. The session moves through
//! a fixed set of states:
//!
//! ```text
//! Unconfigured -> GpioReady -> BusConnected -> SlaveSelected
//!     -> TransactionInFlight -> Done | Failed
//! ```
//!
//! There is exactly one outstanding transaction at a time and no retry
//! policy; callers wanting retries issue another [`poll`](BusSession::poll).

use std::{
    fmt, io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    runtime::{self, Runtime},
};
use tokio_modbus::{
    client::{rtu, Client as _, Context, Reader as _},
    Address, Quantity, Slave,
};
use tokio_serial::SerialStream;

use crate::{
    direction::{DirectionController, DirectionSwitch},
    profile::{DeviceProfile, SerialMode},
    transport::{FaultLatch, RtsTransport},
    Error, TransactionError,
};

/// One register-read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest {
    /// Starting register address.
    pub address: Address,
    /// Number of registers to read.
    pub quantity: Quantity,
}

/// The ordered register values of one successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub address: Address,
    pub values: Vec<u16>,
}

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconfigured,
    GpioReady,
    BusConnected,
    SlaveSelected,
    TransactionInFlight,
    Done,
    Failed,
}

/// A synchronous Modbus session over one serial bus connection.
pub struct BusSession {
    runtime: Runtime,
    ctx: Context,
    controller: Option<Arc<Mutex<DirectionController>>>,
    faults: Option<FaultLatch>,
    timeout: Option<Duration>,
    state: State,
}

impl BusSession {
    /// Opens GPIO resources and the serial device described by `profile`
    /// and binds the session to the profile's slave address.
    ///
    /// For RS485 half-duplex profiles the direction controller is opened
    /// first; if the serial device cannot be opened afterwards, the GPIO
    /// lines are released again before the error is returned.
    pub fn connect(profile: &DeviceProfile) -> crate::Result<Self> {
        let runtime = new_runtime().map_err(|source| Error::ConnectFailed {
            path: profile.device.clone(),
            source,
        })?;

        let mut state = State::Unconfigured;
        let controller = match profile.mode {
            SerialMode::Rs485HalfDuplex(pins) => {
                let controller = DirectionController::open(&profile.gpio_root, pins)?;
                log::debug!("direction control on GPIO pins {:?}", controller.pins());
                transition(&mut state, State::GpioReady);
                Some(Arc::new(Mutex::new(controller)))
            }
            SerialMode::Rs232 => {
                transition(&mut state, State::GpioReady);
                None
            }
        };

        let builder = profile.serial_builder();
        let serial = match runtime.block_on(async { SerialStream::open(&builder) }) {
            Ok(serial) => serial,
            Err(source) => {
                if let Some(controller) = &controller {
                    lock(controller).close();
                }
                // The serialport error converts with its kind intact, so a
                // missing device stays distinguishable from a permission
                // problem.
                return Err(Error::ConnectFailed {
                    path: profile.device.clone(),
                    source: source.into(),
                });
            }
        };
        transition(&mut state, State::BusConnected);

        let (ctx, faults) = match &controller {
            Some(controller) => {
                let transport = RtsTransport::new(serial, Arc::clone(controller));
                let faults = transport.fault_latch();
                (rtu::attach_slave(transport, profile.slave), Some(faults))
            }
            None => (rtu::attach_slave(serial, profile.slave), None),
        };
        transition(&mut state, State::SlaveSelected);

        Ok(Self {
            runtime,
            ctx,
            controller,
            faults,
            timeout: profile.timeout,
            state,
        })
    }

    /// Binds the session to an externally managed transport without any
    /// direction switching, as used for point-to-point links.
    pub fn attach<T>(transport: T, slave: Slave, timeout: Option<Duration>) -> crate::Result<Self>
    where
        T: AsyncRead + AsyncWrite + fmt::Debug + Send + Unpin + 'static,
    {
        let runtime = new_runtime().map_err(attach_failed)?;
        let mut state = State::BusConnected;
        let ctx = rtu::attach_slave(transport, slave);
        transition(&mut state, State::SlaveSelected);
        Ok(Self {
            runtime,
            ctx,
            controller: None,
            faults: None,
            timeout,
            state,
        })
    }

    /// Binds the session to an externally managed transport, switching the
    /// transceiver direction through `switch` around every transaction.
    pub fn attach_with_switch<T, D>(
        transport: T,
        switch: D,
        slave: Slave,
        timeout: Option<Duration>,
    ) -> crate::Result<Self>
    where
        T: AsyncRead + AsyncWrite + fmt::Debug + Send + Unpin + 'static,
        D: DirectionSwitch + fmt::Debug + Send + Unpin + 'static,
    {
        let runtime = new_runtime().map_err(attach_failed)?;
        let mut state = State::BusConnected;
        let transport = RtsTransport::new(transport, switch);
        let faults = transport.fault_latch();
        let ctx = rtu::attach_slave(transport, slave);
        transition(&mut state, State::SlaveSelected);
        Ok(Self {
            runtime,
            ctx,
            controller: None,
            faults: Some(faults),
            timeout,
            state,
        })
    }

    /// The current lifecycle state.
    pub const fn state(&self) -> State {
        self.state
    }

    /// Issues one register-read transaction.
    ///
    /// The whole request/response round trip is bounded by the profile
    /// timeout. Failures are not retried; a failed session can poll again
    /// unless the failure was a fatal direction-control error, in which
    /// case the GPIO resources have already been released.
    pub fn poll(&mut self, request: PollRequest) -> crate::Result<PollResult> {
        let PollRequest { address, quantity } = request;
        if quantity == 0 {
            // Rejected locally: a zero-length read must not touch the GPIO
            // lines nor reach the wire.
            return Err(TransactionError::InvalidRequest("register count must be positive").into());
        }

        transition(&mut self.state, State::TransactionInFlight);
        log::debug!("reading {quantity} holding registers at 0x{address:04X}");

        let timeout = self.timeout;
        let Self { runtime, ctx, .. } = &mut *self;
        let response = runtime.block_on(async {
            let call = ctx.read_holding_registers(address, quantity);
            match timeout {
                Some(duration) => tokio::time::timeout(duration, call)
                    .await
                    .map_err(|_elapsed| TransactionError::Timeout(duration)),
                None => Ok(call.await),
            }
        });

        let values = match response {
            Err(timed_out) => return Err(self.fail(timed_out.into())),
            Ok(Err(client_err)) => {
                // A parked fault means the client error is only the echo of
                // a failed direction switch; report the typed fatal error.
                let err = match self.faults.as_ref().and_then(FaultLatch::take) {
                    Some(fatal) => {
                        log::debug!("client error caused by direction switch: {client_err}");
                        fatal
                    }
                    None => TransactionError::Client(client_err).into(),
                };
                return Err(self.fail(err));
            }
            Ok(Ok(Err(exception))) => {
                return Err(self.fail(TransactionError::Exception(exception).into()))
            }
            Ok(Ok(Ok(values))) => values,
        };

        transition(&mut self.state, State::Done);
        Ok(PollResult { address, values })
    }

    /// Shuts the session down, disconnecting the protocol client and
    /// releasing the GPIO lines.
    ///
    /// Dropping a session releases the GPIO lines as well; `close` exists
    /// to make the teardown ordering explicit on the happy path.
    pub fn close(self) {
        let Self {
            runtime,
            mut ctx,
            controller,
            ..
        } = self;
        if let Err(err) = runtime.block_on(ctx.disconnect()) {
            log::debug!("disconnect failed: {err}");
        }
        // Drop the client first so its transport releases the shared
        // controller handle before the lines are closed.
        drop(ctx);
        if let Some(controller) = controller {
            lock(&controller).close();
        }
    }

    /// Marks the session failed; fatal direction-control errors release the
    /// GPIO resources immediately because the line state can no longer be
    /// trusted.
    fn fail(&mut self, err: Error) -> Error {
        transition(&mut self.state, State::Failed);
        if matches!(
            err,
            Error::Io { .. } | Error::ResourceUnavailable { .. }
        ) {
            log::error!("fatal direction-control failure: {err}");
            if let Some(controller) = self.controller.take() {
                lock(&controller).close();
            }
        }
        err
    }
}

impl fmt::Debug for BusSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSession")
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn new_runtime() -> io::Result<Runtime> {
    runtime::Builder::new_current_thread().enable_all().build()
}

fn attach_failed(source: io::Error) -> Error {
    Error::ConnectFailed {
        path: "<attached transport>".into(),
        source,
    }
}

fn transition(state: &mut State, next: State) {
    log::debug!("session state: {state:?} -> {next:?}");
    *state = next;
}

fn lock(controller: &Arc<Mutex<DirectionController>>) -> std::sync::MutexGuard<'_, DirectionController> {
    controller.lock().unwrap_or_else(PoisonError::into_inner)
}
