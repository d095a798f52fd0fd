// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::{io, time::Duration};

use thiserror::Error;

use crate::gpio::PinId;

/// Error type for bus sessions and their GPIO resources.
#[derive(Debug, Error)]
pub enum Error {
    /// A GPIO pin could not be exported, configured, or opened.
    #[error("GPIO pin {pin} unavailable: {source}")]
    ResourceUnavailable {
        pin: PinId,
        #[source]
        source: io::Error,
    },

    /// A GPIO value write did not complete atomically.
    ///
    /// The transceiver direction is unknown afterwards, which makes any
    /// further bus activity untrustworthy. This error is fatal for the
    /// whole session.
    #[error("GPIO pin {pin} direction write failed: {source}")]
    Io {
        pin: PinId,
        #[source]
        source: io::Error,
    },

    /// The serial device could not be opened.
    #[error("connecting to {path} failed: {source}")]
    ConnectFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A bus transaction was rejected or did not complete.
    #[error("transaction failed: {0}")]
    TransactionFailed(#[from] TransactionError),
}

/// Reasons a single request/response round trip can fail.
///
/// These are surfaced to the caller of the session state machine and are
/// not retried automatically. Callers wanting retries re-issue the poll.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The request was rejected before any bus or GPIO activity.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// No valid response arrived within the configured round-trip timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The device answered with a _Modbus_ exception.
    #[error("device exception: {0}")]
    Exception(tokio_modbus::ExceptionCode),

    /// The protocol client reported a transport or framing error.
    #[error(transparent)]
    Client(tokio_modbus::Error),
}
