//! Bounded counters for the retry loops in the detection engine.

use crate::config::DetectionConfig;

/// The bounded retry loops the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// APSD reruns while the port status register stays empty.
    ApsdRerun,
    /// High-voltage adapter probe attempts per attach.
    HvdcpDetect,
    /// AICL reruns while a QC adapter sags into 500 mA mode.
    HvdcpAiclRerun,
}

/// The counter reached its bound; the caller must give up the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Overrun;

/// Saturating counter with a configurable bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Counter {
    value: u8,
    max_value: u8,
}

impl Counter {
    /// Creates a counter for the given retry loop, bounded per `config`.
    pub fn new(counter_type: CounterType, config: &DetectionConfig) -> Self {
        let max_value = match counter_type {
            CounterType::ApsdRerun => config.max_apsd_rerun,
            CounterType::HvdcpDetect => config.hvdcp_detect_retries,
            CounterType::HvdcpAiclRerun => config.hvdcp_aicl_retries,
        };

        Self::with_max(max_value)
    }

    /// Creates a counter with an explicit bound.
    pub fn with_max(max_value: u8) -> Self {
        Self {
            value: 0,
            max_value,
        }
    }

    /// Current count.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// True once the counter has reached its bound.
    pub fn at_limit(&self) -> bool {
        self.value >= self.max_value
    }

    /// Counts one attempt.
    ///
    /// Fails with [`Overrun`] when the bound is already reached, leaving the
    /// value saturated.
    pub fn increment(&mut self) -> Result<(), Overrun> {
        if self.at_limit() {
            return Err(Overrun);
        }

        self.value += 1;
        Ok(())
    }

    /// Resets the count to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}
