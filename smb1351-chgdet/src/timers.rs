//! Timer abstraction and the named delays used by the detection engine.

use core::future::Future;

use crate::config::DetectionConfig;

/// A timesource for the detection engine.
///
/// Implement this for the target's clock, e.g. with `embassy_time::Timer`
/// and `embassy_time::Instant` on embedded targets.
pub trait Timer {
    /// Waits for the given amount of time.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()>;

    /// A monotonic millisecond clock. Only differences of its readings are
    /// meaningful.
    fn now_millis() -> u64;
}

/// The named delays of the detection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    /// Delay before (re)probing for a high-voltage adapter.
    HvdcpDetect,
    /// Period of the post-negotiation current-mode check.
    HvdcpModeCheck,
    /// Re-enable of hardware adapter detection after unplug.
    HvdcpRearm,
    /// First input-current supervision check after classification.
    AiclFirstCheck,
    /// Period of the input-current supervision.
    AiclSupervise,
    /// Settle time between the two halves of an AICL restart.
    AiclSettle,
    /// Delay before the floating-charger check on a standard port.
    FloatCheck,
    /// Second chance for enumeration after the float-triggered rerun.
    FloatRecheck,
    /// Safety re-read of the port status after enabling detection.
    CheckType,
    /// Settle time after each QC3 increment pulse.
    PulseSettle,
    /// Settle time after moving the data-line switch.
    UsbSwitchSettle,
}

impl TimerType {
    /// The configured duration of this delay, in milliseconds.
    pub fn millis(&self, config: &DetectionConfig) -> u64 {
        match self {
            TimerType::HvdcpDetect => config.hvdcp_detect_delay_ms,
            TimerType::HvdcpModeCheck => config.hvdcp_mode_check_period_ms,
            TimerType::HvdcpRearm => config.hvdcp_rearm_delay_ms,
            TimerType::AiclFirstCheck => config.aicl_first_check_delay_ms,
            TimerType::AiclSupervise => config.aicl_period_ms,
            TimerType::AiclSettle => config.aicl_settle_ms,
            TimerType::FloatCheck => config.float_check_delay_ms,
            TimerType::FloatRecheck => config.float_recheck_delay_ms,
            TimerType::CheckType => config.check_type_delay_ms,
            TimerType::PulseSettle => config.pulse_settle_ms,
            TimerType::UsbSwitchSettle => config.usb_switch_settle_ms,
        }
    }

    /// Waits for the configured duration of this delay.
    pub fn after<TIMER: Timer>(self, config: &DetectionConfig) -> impl Future<Output = ()> {
        TIMER::after_millis(self.millis(config))
    }
}
