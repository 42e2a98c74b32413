//! Tuning knobs of the detection engine.

/// Configuration of the detection engine.
///
/// The defaults match the reference board tuning; adjust per platform.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectionConfig {
    /// APSD reruns to attempt while classification stays `Unknown`.
    pub max_apsd_rerun: u8,
    /// High-voltage adapter probe attempts per attach.
    pub hvdcp_detect_retries: u8,
    /// AICL reruns before giving up on a sagging QC adapter.
    pub hvdcp_aicl_retries: u8,
    /// Upper bound on QC3 increment pulses, regardless of the target voltage.
    pub max_qc3_pulses: u8,
    /// Bus-voltage step per QC3 increment pulse, in millivolts.
    pub qc3_step_mv: u32,
    /// Requested QC3 bus voltage, in millivolts.
    pub qc3_target_mv: u32,
    /// Bus voltage a QC3 adapter starts from, in millivolts.
    pub qc3_base_mv: u32,
    /// Bus voltage below which the source counts as absent, in millivolts.
    pub vbus_present_threshold_mv: u32,
    /// An undervoltage glitch shorter than this window, while a QC contract
    /// is active, counts as an adapter collapse.
    pub vbus_collapse_window_ms: u64,
    /// Delay before (re)probing for a high-voltage adapter, in milliseconds.
    pub hvdcp_detect_delay_ms: u64,
    /// Period of the post-negotiation current-mode check, in milliseconds.
    pub hvdcp_mode_check_period_ms: u64,
    /// Delay before re-enabling adapter detection after unplug.
    pub hvdcp_rearm_delay_ms: u64,
    /// Delay before the floating-charger check, in milliseconds.
    pub float_check_delay_ms: u64,
    /// Enumeration grace period after the float-triggered APSD rerun.
    pub float_recheck_delay_ms: u64,
    /// Delay before the safety re-read of the port status register.
    pub check_type_delay_ms: u64,
    /// First input-current supervision check, in milliseconds.
    pub aicl_first_check_delay_ms: u64,
    /// Period of the input-current supervision, in milliseconds.
    pub aicl_period_ms: u64,
    /// Settle time between the two halves of an AICL restart.
    pub aicl_settle_ms: u64,
    /// Settle time after each QC3 increment pulse, in milliseconds.
    pub pulse_settle_ms: u64,
    /// Settle time after moving the data-line switch, in milliseconds.
    pub usb_switch_settle_ms: u64,
    /// Probe dedicated chargers for a high-voltage contract automatically.
    pub auto_hvdcp: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_apsd_rerun: 3,
            hvdcp_detect_retries: 3,
            hvdcp_aicl_retries: 3,
            max_qc3_pulses: 8,
            qc3_step_mv: 200,
            qc3_target_mv: 7000,
            qc3_base_mv: 5000,
            vbus_present_threshold_mv: 4000,
            vbus_collapse_window_ms: 100,
            hvdcp_detect_delay_ms: 5000,
            hvdcp_mode_check_period_ms: 5000,
            hvdcp_rearm_delay_ms: 3000,
            float_check_delay_ms: 1000,
            float_recheck_delay_ms: 1000,
            check_type_delay_ms: 5000,
            aicl_first_check_delay_ms: 6000,
            aicl_period_ms: 120_000,
            aicl_settle_ms: 200,
            pulse_settle_ms: 80,
            usb_switch_settle_ms: 30,
            auto_hvdcp: true,
        }
    }
}

impl DetectionConfig {
    /// QC3 increment pulses needed to reach the target voltage, capped at
    /// [`Self::max_qc3_pulses`].
    pub fn qc3_pulse_count(&self) -> u8 {
        if self.qc3_step_mv == 0 {
            return 0;
        }

        let delta = self.qc3_target_mv.saturating_sub(self.qc3_base_mv);
        let steps = (delta / self.qc3_step_mv).min(u8::MAX as u32) as u8;

        steps.min(self.max_qc3_pulses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pulse_count_hits_cap() {
        // 2000 mV in 200 mV steps wants 10 pulses, capped at 8.
        let config = DetectionConfig::default();
        assert_eq!(config.qc3_pulse_count(), 8);
    }

    #[test]
    fn pulse_count_below_cap() {
        let config = DetectionConfig {
            qc3_target_mv: 6000,
            ..DetectionConfig::default()
        };
        assert_eq!(config.qc3_pulse_count(), 5);
    }

    #[test]
    fn pulse_count_zero_step() {
        let config = DetectionConfig {
            qc3_step_mv: 0,
            ..DetectionConfig::default()
        };
        assert_eq!(config.qc3_pulse_count(), 0);
    }
}
