// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transceiver direction control.
//!
//! The RS485 transceiver exposes separate driver-enable and receiver-enable
//! inputs, wired to two GPIO pins. Both pins must always carry the same
//! logical value; a state where one side of the transceiver believes it is
//! transmitting while the other is listening cannot be reasoned about and
//! risks bus contention.

use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    gpio::{GpioLine, Level, PinId},
    profile::RtsPins,
};

/// The commanded transceiver direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// The capability handed to the protocol client for committing the
/// transceiver direction.
///
/// Contract: `set_transmit` returns only once the physical line state
/// matches `enable`, because the caller starts writing frame bytes
/// (`enable == true`) or reading response bytes (`enable == false`)
/// immediately afterwards. A failure means the line state is unknown and
/// the in-flight transaction must be aborted.
pub trait DirectionSwitch {
    fn set_transmit(&mut self, enable: bool) -> crate::Result<()>;
}

/// Shared access for the session and the transport, which both hold on to
/// the one controller instance.
impl<D> DirectionSwitch for Arc<Mutex<D>>
where
    D: DirectionSwitch,
{
    fn set_transmit(&mut self, enable: bool) -> crate::Result<()> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_transmit(enable)
    }
}

/// Owns the driver-enable and receiver-enable GPIO lines and moves them as
/// a single logical unit.
#[derive(Debug)]
pub struct DirectionController {
    driver_enable: GpioLine,
    receiver_enable: GpioLine,
    direction: Direction,
}

impl DirectionController {
    /// Opens both enable lines below `root` (usually
    /// [`SYSFS_GPIO_ROOT`](crate::gpio::SYSFS_GPIO_ROOT)), driver-enable
    /// first.
    ///
    /// If the second line fails to open, the first is closed again before
    /// the error is reported, so partial construction never leaks an
    /// exported pin.
    pub fn open(root: &std::path::Path, pins: RtsPins) -> crate::Result<Self> {
        let driver_enable = GpioLine::open(root, pins.driver_enable)?;
        let receiver_enable = match GpioLine::open(root, pins.receiver_enable) {
            Ok(line) => line,
            Err(err) => {
                let mut driver_enable = driver_enable;
                driver_enable.close();
                return Err(err);
            }
        };

        // The kernel initializes exported pins to 0, which is the receive
        // (listening) state of the transceiver.
        Ok(Self {
            driver_enable,
            receiver_enable,
            direction: Direction::Receive,
        })
    }

    /// The last direction that was successfully committed.
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// The pin identifiers of the owned lines, driver-enable first.
    pub const fn pins(&self) -> (PinId, PinId) {
        (self.driver_enable.pin(), self.receiver_enable.pin())
    }

    /// Releases both lines, not stopping on individual failures.
    pub fn close(&mut self) {
        self.driver_enable.close();
        self.receiver_enable.close();
    }
}

impl DirectionSwitch for DirectionController {
    /// Drives both enable lines to `enable`.
    ///
    /// If the first write succeeds and the second fails, the transceiver is
    /// physically inconsistent; the error propagates as fatal and the
    /// session must not issue any further bus traffic.
    fn set_transmit(&mut self, enable: bool) -> crate::Result<()> {
        let (level, direction) = if enable {
            (Level::High, Direction::Transmit)
        } else {
            (Level::Low, Direction::Receive)
        };
        self.driver_enable.set(level)?;
        self.receiver_enable.set(level)?;
        self.direction = direction;
        log::trace!("transceiver direction committed: {direction:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::gpio::tests::{fake_sysfs, last_value};

    const PINS: RtsPins = RtsPins {
        driver_enable: 272,
        receiver_enable: 273,
    };

    #[test]
    fn lines_move_as_one_unit() {
        let root = fake_sysfs(&[272, 273]);
        let mut controller = DirectionController::open(root.path(), PINS).unwrap();

        controller.set_transmit(true).unwrap();
        assert_eq!(controller.direction(), Direction::Transmit);
        assert_eq!(last_value(root.path(), 272), Some('1'));
        assert_eq!(last_value(root.path(), 273), Some('1'));

        controller.set_transmit(false).unwrap();
        assert_eq!(controller.direction(), Direction::Receive);
        assert_eq!(last_value(root.path(), 272), Some('0'));
        assert_eq!(last_value(root.path(), 273), Some('0'));
    }

    #[test]
    fn starts_out_listening() {
        let root = fake_sysfs(&[272, 273]);
        let controller = DirectionController::open(root.path(), PINS).unwrap();

        assert_eq!(controller.direction(), Direction::Receive);
    }

    #[test]
    fn partial_construction_releases_the_first_line() {
        // Only the first pin exists; opening the second fails at its
        // direction file.
        let root = fake_sysfs(&[272]);

        let result = DirectionController::open(root.path(), PINS);

        assert!(matches!(
            result,
            Err(crate::Error::ResourceUnavailable { pin: 273, .. })
        ));
        assert_eq!(
            fs::read_to_string(root.path().join("unexport")).unwrap(),
            "272"
        );
    }

    #[test]
    fn failure_on_the_second_line_is_a_fatal_io_error() {
        let root = fake_sysfs(&[272, 273]);
        let mut controller = DirectionController::open(root.path(), PINS).unwrap();
        // The receiver-enable value handle goes away mid-session; the next
        // commit moves the driver line and then fails.
        controller.receiver_enable.close();

        let result = controller.set_transmit(true);

        assert!(matches!(result, Err(crate::Error::Io { pin: 273, .. })));
        // The lines are physically divergent now; the commanded direction
        // must not pretend the commit went through.
        assert_eq!(last_value(root.path(), 272), Some('1'));
        assert_eq!(controller.direction(), Direction::Receive);
    }

    #[test]
    fn close_releases_both_lines() {
        let root = fake_sysfs(&[272, 273]);
        let mut controller = DirectionController::open(root.path(), PINS).unwrap();

        controller.close();
        // Safe to call again with the lines already gone.
        controller.close();

        assert!(!fs::read_to_string(root.path().join("unexport"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn open_fails_without_gpio_interface() {
        let root = TempDir::new().unwrap();

        let result = DirectionController::open(root.path(), PINS);

        assert!(matches!(
            result,
            Err(crate::Error::ResourceUnavailable { pin: 272, .. })
        ));
    }
}
