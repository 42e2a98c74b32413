//! Charger port-type detection and HVDCP negotiation engine for the SMB1351.
//!
//! The engine classifies the attached USB source via the chip's automatic
//! power source detection (APSD), negotiates an elevated bus voltage with
//! quick-charge (QC2/QC3) adapters, supervises the negotiated contract, and
//! exposes the result to an external charging-policy manager.
//!
//! Hardware access goes through the traits in `smb1351-chgdet-traits`; the
//! policy manager is connected through
//! [`detection::policy_manager::ChargingPolicyManager`].
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

// This must go first, so that the fmt macros are visible in the other modules.
#[macro_use]
mod fmt;

pub mod access;
pub mod config;
pub mod counters;
pub mod detection;
#[cfg(any(test, feature = "dummy"))]
pub mod dummy;
pub mod irq;
pub mod regs;
pub mod timers;
pub mod units;

use smb1351_chgdet_traits::IoError;

/// Classification result for the attached port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortType {
    /// No classification, or classification exhausted its retries.
    #[default]
    Unknown,
    /// Standard downstream port (SDP), a regular USB host.
    StandardDownstream,
    /// Charging downstream port (CDP), a USB host with extra current budget.
    ChargingDownstream,
    /// Dedicated charging port (DCP) or another proprietary charging port.
    DedicatedCharger,
    /// A port that matched an accessory charger adapter pattern.
    NonStandard,
    /// A port that looked like an SDP but never enumerated. Treated like a
    /// dedicated charger for current-limit purposes.
    Float,
}

/// Result of high-voltage adapter detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HvdcpState {
    /// No high-voltage adapter detected.
    #[default]
    NotDetected,
    /// Quick Charge 2.0 adapter, fixed 9 V tier selected.
    Qc2,
    /// Quick Charge 3.0 adapter, voltage reached by pulse-count stepping.
    Qc3,
}

/// Progress of the high-voltage negotiation for the current attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NegotiationStatus {
    /// No probe has run yet.
    #[default]
    Idle,
    /// A probe is scheduled or in progress.
    Probing,
    /// An adapter was detected and the voltage request was issued.
    Complete,
    /// The bounded probe retries elapsed without detection; high-voltage
    /// charging stays off until the next attach.
    TimedOut,
}

/// Battery condition flags, set by interrupt handlers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryStatus {
    /// Hard hot limit exceeded.
    pub hot: bool,
    /// Hard cold limit exceeded.
    pub cold: bool,
    /// Soft hot limit exceeded.
    pub warm: bool,
    /// Soft cold limit exceeded.
    pub cool: bool,
    /// No battery present.
    pub missing: bool,
}

/// Errors surfaced by the engine's public operations.
#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A bus transaction failed. The operation was aborted; the engine
    /// retries on the next interrupt or timer cycle.
    #[error("bus transaction failed: {0:?}")]
    Io(IoError),
    /// The operation conflicts with the engine's current state, e.g.
    /// enabling detection while OTG is sourcing power. Nothing was mutated.
    #[error("operation violates a detection invariant")]
    InvariantViolation,
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::Io(error)
    }
}
