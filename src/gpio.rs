// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sysfs GPIO lines.
//!
//! The transceiver enable pins are plain kernel GPIOs driven through the
//! sysfs interface: a pin is exported by writing its number to
//! `<root>/export`, configured as an output via `<root>/gpio<N>/direction`,
//! and toggled by writing `"1"`/`"0"` to `<root>/gpio<N>/value`. The sysfs
//! root is configurable so deployments with relocated mounts and tests with
//! fake trees use the same code path.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

/// Identifies one GPIO pin within the sysfs GPIO namespace.
pub type PinId = u32;

/// Default mount point of the kernel GPIO control surface.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Logical level of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    const fn sysfs_value(self) -> &'static [u8] {
        match self {
            Self::Low => b"0",
            Self::High => b"1",
        }
    }
}

/// One exported sysfs GPIO pin, configured as an output.
///
/// The value-file handle stays open for the whole lifetime of the line, so
/// switching the level during a bus transaction is a single `write(2)`.
/// [`close`](Self::close) (or dropping the line) releases the handle and
/// unexports the pin.
#[derive(Debug)]
pub struct GpioLine {
    pin: PinId,
    root: PathBuf,
    value: Option<File>,
}

impl GpioLine {
    /// Exports `pin` below `root` (usually [`SYSFS_GPIO_ROOT`]) and
    /// configures it as an output.
    ///
    /// Fails with [`Error::ResourceUnavailable`](crate::Error::ResourceUnavailable)
    /// if the export interface, the direction file, or the value file cannot
    /// be opened or fully written. Partially established sysfs state is not
    /// rolled back; releasing it is the caller's responsibility.
    pub fn open(root: &Path, pin: PinId) -> crate::Result<Self> {
        let unavailable = |source| crate::Error::ResourceUnavailable { pin, source };

        write_attr(&root.join("export"), pin.to_string().as_bytes()).map_err(unavailable)?;

        let pin_dir = root.join(format!("gpio{pin}"));
        write_attr(&pin_dir.join("direction"), b"out").map_err(unavailable)?;

        let value = OpenOptions::new()
            .write(true)
            .open(pin_dir.join("value"))
            .map_err(unavailable)?;
        log::debug!("exported GPIO pin {pin} as output");

        Ok(Self {
            pin,
            root: root.to_path_buf(),
            value: Some(value),
        })
    }

    /// The pin number this line was opened with.
    pub const fn pin(&self) -> PinId {
        self.pin
    }

    /// Whether the value handle is currently open.
    pub const fn is_open(&self) -> bool {
        self.value.is_some()
    }

    /// Drives the line to `level`.
    ///
    /// The write must complete atomically (exactly one byte); anything else
    /// leaves the physical line state unknown and is reported as
    /// [`Error::Io`](crate::Error::Io), which is fatal for the session.
    pub fn set(&mut self, level: Level) -> crate::Result<()> {
        let pin = self.pin;
        let io_error = |source| crate::Error::Io { pin, source };

        let value = self.value.as_mut().ok_or_else(|| {
            io_error(io::Error::new(
                io::ErrorKind::NotConnected,
                "GPIO line is closed",
            ))
        })?;
        let written = value.write(level.sysfs_value()).map_err(io_error)?;
        if written != 1 {
            return Err(io_error(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to GPIO value file",
            )));
        }
        log::trace!("GPIO pin {pin} set to {level:?}");
        Ok(())
    }

    /// Closes the value handle and unexports the pin.
    ///
    /// Best effort: unexport failures are logged and swallowed, since this
    /// runs during shutdown where nothing can act on them anymore. Calling
    /// `close` on an already-closed line is a no-op.
    pub fn close(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        drop(value);

        let pin = self.pin;
        if let Err(err) = write_attr(&self.root.join("unexport"), pin.to_string().as_bytes()) {
            log::warn!("failed to unexport GPIO pin {pin}: {err}");
        } else {
            log::debug!("unexported GPIO pin {pin}");
        }
    }
}

impl Drop for GpioLine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writes `bytes` to a sysfs attribute file, treating short writes as failures.
fn write_attr(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let written = file.write(bytes)?;
    if written != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write to {}", path.display()),
        ));
    }
    Ok(())
}
