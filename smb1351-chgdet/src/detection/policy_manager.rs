//! The charging policy manager commands the detection engine and is informed
//! about supply changes.
//!
//! It is the engine's window into the rest of the platform: bus voltage
//! measurements, USB enumeration state, and the thermal policy on
//! high-voltage charging all come from here.

use core::future::Future;

use crate::units::{Voltage, millivolts};
use crate::{HvdcpState, PortType};

/// The kind of supply the engine concluded is attached.
///
/// This is the vocabulary of [`SupplyChange`] notifications; it folds the
/// port classification and the negotiated contract into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SupplyType {
    /// Nothing attached, or classification pending.
    #[default]
    Unknown,
    /// Standard downstream port.
    Sdp,
    /// Charging downstream port.
    Cdp,
    /// Dedicated charging port without a high-voltage contract.
    Dcp,
    /// Accessory charger adapter.
    NonStandard,
    /// Non-enumerating port treated as a charger.
    Float,
    /// QC2 adapter at the fixed 9 V tier.
    Hvdcp,
    /// QC3 adapter at the stepped voltage.
    Hvdcp3,
}

impl SupplyType {
    /// Folds a port classification and negotiation result into a supply
    /// kind.
    pub fn from_detection(port_type: PortType, hvdcp: HvdcpState) -> Self {
        match port_type {
            PortType::Unknown => SupplyType::Unknown,
            PortType::StandardDownstream => SupplyType::Sdp,
            PortType::ChargingDownstream => SupplyType::Cdp,
            PortType::DedicatedCharger => match hvdcp {
                HvdcpState::NotDetected => SupplyType::Dcp,
                HvdcpState::Qc2 => SupplyType::Hvdcp,
                HvdcpState::Qc3 => SupplyType::Hvdcp3,
            },
            PortType::NonStandard => SupplyType::NonStandard,
            PortType::Float => SupplyType::Float,
        }
    }
}

/// A change of the detected supply, pushed to the policy manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SupplyChange {
    /// The supply the engine now believes is attached.
    pub kind: SupplyType,
    /// Whether a supply is present at all.
    pub online: bool,
}

/// Events that the policy manager can send to the detection engine.
///
/// Each event maps onto one of the engine's public operations; sending an
/// event is equivalent to calling that operation between `run_step` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Empty event.
    None,
    /// Turn port detection on or off.
    EnableDetection(bool),
    /// A cable was attached.
    PlugIn,
    /// The cable was removed.
    PlugOut,
    /// Turn OTG power sourcing on or off.
    EnableOtg(bool),
    /// The platform's high-voltage charging policy may have changed;
    /// re-evaluate it.
    CheckHighVoltagePolicy,
}

/// Trait for the charging policy manager.
///
/// All methods have defaults, so an implementation only overrides what its
/// platform provides.
pub trait ChargingPolicyManager {
    /// Informs the device that the detected supply changed.
    fn power_supply_changed(&mut self, _change: SupplyChange) -> impl Future<Output = ()> {
        async {}
    }

    /// The measured bus voltage.
    ///
    /// Defaults to a nominal 5 V for platforms without a measurement path.
    fn bus_voltage(&mut self) -> impl Future<Output = Voltage> {
        async { millivolts(5000) }
    }

    /// Whether the USB stack has enumerated on the attached port.
    fn is_enumerated(&mut self) -> impl Future<Output = bool> {
        async { false }
    }

    /// Whether platform policy currently permits high-voltage charging.
    ///
    /// Thermal mitigation typically drives this.
    fn high_voltage_charging_allowed(&mut self) -> impl Future<Output = bool> {
        async { true }
    }

    /// The engine gets and evaluates policy events when ready.
    ///
    /// By default, this is a future that never resolves.
    fn get_event(&mut self) -> impl Future<Output = Event> {
        async { core::future::pending().await }
    }
}
