// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU register polling over an RS485 bus whose transceiver
//! direction is switched in software through two GPIO lines.
//!
//! Some RS485 hardware has no automatic line-direction control. On such
//! boards the driver-enable and receiver-enable inputs of the transceiver
//! hang off ordinary GPIO pins, and the bus master has to assert transmit
//! mode right before a request frame goes out and re-enable the receiver
//! the moment the frame has been flushed, or the response's leading bytes
//! are lost.
//!
//! This crate implements that control loop on top of
//! [`tokio-modbus`](https://crates.io/crates/tokio-modbus):
//!
//! - [`gpio::GpioLine`] owns one exported sysfs GPIO pin,
//! - [`direction::DirectionController`] commits both enable lines as a
//!   single logical transmit/receive direction,
//! - [`transport::RtsTransport`] wraps the serial stream and performs the
//!   direction switch around every request, exactly where the RTU client
//!   writes and flushes its frames,
//! - [`session::BusSession`] drives one blocking poll cycle against a
//!   device described by a [`profile::DeviceProfile`].
//!
//! ```no_run
//! use rs485_poll::{profile::DeviceProfile, session::{BusSession, PollRequest}};
//!
//! # fn main() -> rs485_poll::Result<()> {
//! let profile = DeviceProfile::pv_inverter();
//! let mut session = BusSession::connect(&profile)?;
//! let result = session.poll(PollRequest { address: 0x0200, quantity: 8 })?;
//! for (index, value) in result.values.iter().enumerate() {
//!     println!("{index}: {value}");
//! }
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod direction;
pub mod gpio;
pub mod profile;
pub mod session;
pub mod transport;

mod error;

pub use self::error::{Error, TransactionError};

/// Specialized [`Result`](std::result::Result) type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
