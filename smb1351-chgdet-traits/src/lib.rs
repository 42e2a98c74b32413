//! Hardware traits for the SMB1351 charger detection engine.
//!
//! Provides the transport trait through which the engine reaches the chip's
//! register space, and the control-line trait for the few GPIOs the engine
//! drives directly.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
use core::future::Future;

/// Bus transaction error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoError {
    /// The peripheral did not acknowledge the transfer.
    Nack,
    /// The transfer failed on the bus (arbitration loss, bus fault, timeout).
    Bus,
}

/// Transport trait, through which the engine talks to the chip.
///
/// All register traffic of the engine funnels through a single implementation
/// of this trait, so the implementation does not need to be re-entrant.
/// Reads and writes may block for the duration of a bus transaction and may
/// fail; the engine decides whether to retry.
pub trait Transport {
    /// Read a single register.
    fn read_register(&mut self, reg: u8) -> impl Future<Output = Result<u8, IoError>>;

    /// Write a single register.
    fn write_register(&mut self, reg: u8, value: u8) -> impl Future<Output = Result<(), IoError>>;

    /// Wait for the chip's interrupt line to assert.
    fn wait_for_interrupt(&mut self) -> impl Future<Output = ()>;

    /// Keep the platform from suspending until [`Transport::relax`] is called.
    ///
    /// Bracketed around every bus transaction by the register access layer,
    /// so a transfer is never cut short by a platform suspend.
    fn stay_awake(&mut self);

    /// Release the keep-awake token taken by [`Transport::stay_awake`].
    fn relax(&mut self);
}

/// Control lines the engine drives besides the register bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Line {
    /// D+/D- mux select: high routes the data lines to the host controller
    /// for enumeration, low routes them to the charger for detection.
    UsbSwitch,
    /// Chip suspend pin. Must be high for detection to run.
    Suspend,
    /// Thermal cut-off switch in the VBUS path. High closes the switch and
    /// connects the input.
    ConnectTherm,
}

/// GPIO control-line trait.
pub trait ControlLines {
    /// Drive a control line high (`true`) or low (`false`).
    fn set_line(&mut self, line: Line, level: bool);
}
