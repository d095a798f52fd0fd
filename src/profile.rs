// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device profiles.
//!
//! Each field device on the bus is described by a small configuration
//! value instead of a dedicated program: serial parameters, slave address,
//! physical mode, response timeout, and the register window that is polled
//! when the caller does not name one.

use std::{path::PathBuf, time::Duration};

use tokio_modbus::{Address, Quantity, Slave};
use tokio_serial::{DataBits, Parity, SerialPortBuilder, StopBits};

use crate::gpio::{PinId, SYSFS_GPIO_ROOT};

/// The GPIO pins driving the transceiver enable inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtsPins {
    pub driver_enable: PinId,
    pub receiver_enable: PinId,
}

/// Enable pins of the reference deployment.
pub const DEFAULT_RTS_PINS: RtsPins = RtsPins {
    driver_enable: 272,
    receiver_enable: 273,
};

/// Physical mode of the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialMode {
    /// Point-to-point; the transceiver needs no direction control.
    Rs232,
    /// Multidrop half-duplex; the transmit/receive direction is switched
    /// through the given GPIO pins.
    Rs485HalfDuplex(RtsPins),
}

/// Everything the session needs to know about one field device.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Human-readable device name, used in log output.
    pub name: &'static str,
    /// Serial device path.
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Bus address of the device.
    pub slave: Slave,
    pub mode: SerialMode,
    /// Mount point of the sysfs GPIO interface.
    pub gpio_root: PathBuf,
    /// Timeout for the whole request/response round trip.
    pub timeout: Option<Duration>,
    /// Register window polled when the caller does not specify one.
    pub default_poll: (Address, Quantity),
}

impl DeviceProfile {
    /// The PV-inverter controller: status block at `0x0200`.
    pub fn pv_inverter() -> Self {
        Self {
            name: "pv-inverter",
            default_poll: (0x0200, 8),
            ..Self::bus_defaults()
        }
    }

    /// The weather-station transmitter: wind-speed average at `0x7533`.
    pub fn weather_station() -> Self {
        Self {
            name: "weather-station",
            default_poll: (0x7533, 2),
            ..Self::bus_defaults()
        }
    }

    /// Parameters shared by all devices on the reference bus.
    fn bus_defaults() -> Self {
        Self {
            name: "device",
            device: "/dev/ttyS5".into(),
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            slave: Slave(1),
            mode: SerialMode::Rs485HalfDuplex(DEFAULT_RTS_PINS),
            gpio_root: PathBuf::from(SYSFS_GPIO_ROOT),
            timeout: Some(Duration::from_secs(5)),
            default_poll: (0x0000, 1),
        }
    }

    /// The serial port configuration for this profile.
    pub fn serial_builder(&self) -> SerialPortBuilder {
        tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
    }
}
