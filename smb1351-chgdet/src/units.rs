//! Electrical units, expressed with `uom` quantities.

use uom::si::electric_potential::millivolt;
pub use uom::si::u32::ElectricPotential as Voltage;

/// Constructs a voltage from a millivolt count.
pub fn millivolts(value: u32) -> Voltage {
    Voltage::new::<millivolt>(value)
}

/// Extracts the millivolt count from a voltage.
pub fn to_millivolts(voltage: Voltage) -> u32 {
    voltage.get::<millivolt>()
}
