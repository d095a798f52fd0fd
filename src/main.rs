// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line register poller.
//!
//! Reads a block of holding registers from one of the configured field
//! devices and prints one `index: value` line per register. Nothing is
//! printed unless the whole requested block was received.

use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use tokio_modbus::Slave;

use rs485_poll::{
    profile::{DeviceProfile, SerialMode},
    session::{BusSession, PollRequest},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    /// The PV-inverter controller.
    PvInverter,
    /// The weather-station transmitter.
    WeatherStation,
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Starting register address (decimal or 0x-prefixed hex).
    ///
    /// Defaults to the profile's register window.
    #[arg(value_parser = parse_word, requires = "count")]
    address: Option<u16>,

    /// Number of registers to read.
    #[arg(value_parser = parse_word)]
    count: Option<u16>,

    /// Device profile to poll.
    #[arg(long, value_enum, default_value = "pv-inverter")]
    profile: Profile,

    /// Serial device path override.
    #[arg(long)]
    device: Option<String>,

    /// Slave address override.
    #[arg(long)]
    slave: Option<u8>,

    /// Response timeout in seconds, 0 to wait forever.
    #[arg(long)]
    timeout: Option<u64>,

    /// Treat the link as point-to-point RS232 (no direction switching).
    #[arg(long)]
    rs232: bool,
}

fn parse_word(input: &str) -> Result<u16, String> {
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|err| format!("invalid register number {input:?}: {err}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut profile = match args.profile {
        Profile::PvInverter => DeviceProfile::pv_inverter(),
        Profile::WeatherStation => DeviceProfile::weather_station(),
    };
    if let Some(device) = args.device {
        profile.device = device;
    }
    if let Some(slave) = args.slave {
        profile.slave = Slave(slave);
    }
    if let Some(secs) = args.timeout {
        profile.timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if args.rs232 {
        profile.mode = SerialMode::Rs232;
    }

    let (address, quantity) = match (args.address, args.count) {
        (Some(address), Some(count)) => (address, count),
        _ => profile.default_poll,
    };
    log::info!(
        "polling {quantity} registers at 0x{address:04X} from {} on {}",
        profile.name,
        profile.device
    );

    let mut session = BusSession::connect(&profile)
        .with_context(|| format!("cannot open a bus session for {}", profile.name))?;
    let outcome = session.poll(PollRequest { address, quantity });
    session.close();

    let result = outcome.with_context(|| format!("polling {} failed", profile.name))?;
    for (index, value) in result.values.iter().enumerate() {
        println!("{index}: {value}");
    }
    Ok(())
}
