//! SMB1351 register map, as far as port detection and HVDCP negotiation use
//! it.

use proc_bitfield::bitfield;

/// A register address in the SMB1351's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reg(pub u8);

impl Reg {
    /// Charge and input current limits.
    pub const CHG_CURRENT_CTRL: Reg = Reg(0x00);
    /// APSD and AICL enables, among other functions.
    pub const VARIOUS_FUNC: Reg = Reg(0x02);
    /// Pin control: enable polarity, USBCS source, LED blink.
    pub const CHG_PIN_EN_CTRL: Reg = Reg(0x06);
    /// QC3 auto-increment control, among other functions.
    pub const VARIOUS_FUNC_3: Reg = Reg(0x11);
    /// HVDCP adapter selection and enable.
    pub const HVDCP_CTRL: Reg = Reg(0x12);
    /// Volatile-access gate for the configuration registers.
    pub const CMD_I2C: Reg = Reg(0x30);
    /// Input limit mode and suspend command bits.
    pub const CMD_INPUT_LIMIT: Reg = Reg(0x31);
    /// Charging and OTG command bits.
    pub const CMD_CHG: Reg = Reg(0x32);
    /// HVDCP commands: APSD rerun, QC3 increment and decrement pulses.
    pub const CMD_HVDCP: Reg = Reg(0x34);
    /// AICL result and USB mode status.
    pub const STATUS_0: Reg = Reg(0x36);
    /// APSD port classification result.
    pub const STATUS_5: Reg = Reg(0x3B);
    /// HVDCP detection status.
    pub const STATUS_7: Reg = Reg(0x3D);
    /// Battery temperature interrupts.
    pub const IRQ_A: Reg = Reg(0x40);
    /// Battery presence and internal-limit interrupts.
    pub const IRQ_B: Reg = Reg(0x41);
    /// Charge-cycle interrupts.
    pub const IRQ_C: Reg = Reg(0x42);
    /// Timeout and fault interrupts.
    pub const IRQ_D: Reg = Reg(0x43);
    /// Input voltage interrupts.
    pub const IRQ_E: Reg = Reg(0x44);
    /// OTG and RID interrupts.
    pub const IRQ_F: Reg = Reg(0x45);
    /// APSD and AICL completion interrupts.
    pub const IRQ_G: Reg = Reg(0x46);
    /// Watchdog and HVDCP authentication interrupts.
    pub const IRQ_H: Reg = Reg(0x47);

    /// One past the highest implemented register address.
    pub const SPACE: usize = 0x48;
}

// VARIOUS_FUNC bits.
pub(crate) const APSD_EN_BIT: u8 = 1 << 2;
pub(crate) const AICL_EN_BIT: u8 = 1 << 4;

// VARIOUS_FUNC_3 bits.
pub(crate) const QC_2P1_AUTO_INCREMENT_BIT: u8 = 1 << 2;

// CHG_PIN_EN_CTRL fields.
pub(crate) const LED_BLINK_FUNC_BIT: u8 = 1 << 7;
pub(crate) const EN_PIN_CTRL_MASK: u8 = 0x60;
pub(crate) const EN_BY_I2C_0_DISABLE: u8 = 0;
pub(crate) const USBCS_CTRL_BIT: u8 = 1 << 4;
pub(crate) const USBCS_CTRL_BY_I2C: u8 = 0;

// HVDCP_CTRL fields.
pub(crate) const HVDCP_EN_BIT: u8 = 1 << 5;
pub(crate) const HVDCP_ADAPTER_SEL_MASK: u8 = 0xC0;
pub(crate) const HVDCP_ADAPTER_SEL_9V: u8 = 0x40;

// CMD_I2C bits.
pub(crate) const CMD_BQ_CFG_ACCESS_BIT: u8 = 1 << 6;

// CMD_INPUT_LIMIT fields.
pub(crate) const CMD_INPUT_MODE_MASK: u8 = 0x03;
pub(crate) const CMD_INPUT_MODE_USB500: u8 = 0x00;
pub(crate) const CMD_INPUT_MODE_AC: u8 = 0x01;

// CMD_CHG bits.
pub(crate) const CMD_OTG_EN_BIT: u8 = 1 << 0;
pub(crate) const CMD_CHG_EN_BIT: u8 = 1 << 1;

// CMD_HVDCP bits.
pub(crate) const CMD_APSD_RE_RUN_BIT: u8 = 1 << 7;
pub(crate) const CMD_INCREMENT_QC3_BIT: u8 = 1 << 0;

// Shared low-nibble current-limit field of CHG_CURRENT_CTRL and STATUS_0.
pub(crate) const AC_INPUT_CURRENT_LIMIT_MASK: u8 = 0x0F;

// STATUS_7 field: either QC 9 V or 12 V detection bit.
pub(crate) const STATUS_HVDCP_9V_12V_MASK: u8 = 0x0C;

// IRQ_H raw status bit, read directly by the adapter probe.
pub(crate) const IRQ_HVDCP_2P1_STATUS_BIT: u8 = 1 << 4;

bitfield! {
    /// APSD classification result, register STATUS_5.
    ///
    /// At most one of the port bits is set once APSD completes; an empty
    /// register means classification has not produced a result.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct PortStatus(pub u8): Debug, FromStorage, IntoStorage {
        /// Charging downstream port.
        pub cdp: bool @ 7,
        /// Dedicated charging port.
        pub dcp: bool @ 6,
        /// Proprietary charging port.
        pub other_charging_port: bool @ 5,
        /// Standard downstream port.
        pub sdp: bool @ 4,
        /// Accessory charger adapter patterns.
        pub aca: u8 @ 0..=3,
    }
}

bitfield! {
    /// AICL and input-mode status, register STATUS_0.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct InputStatus(pub u8): Debug, FromStorage, IntoStorage {
        /// AICL has completed.
        pub aicl_done: bool @ 7,
        /// The input collapsed into USB 500 mA mode.
        pub usb500_mode: bool @ 6,
        /// The input current limit AICL granted, as a table index.
        pub granted_limit: u8 @ 0..=3,
    }
}

bitfield! {
    /// HVDCP detection status, register STATUS_7.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct HvdcpStatus(pub u8): Debug, FromStorage, IntoStorage {
        /// A QC adapter acknowledged the 12 V request.
        pub selected_12v: bool @ 3,
        /// A QC adapter acknowledged the 9 V request.
        pub selected_9v: bool @ 2,
    }
}

impl HvdcpStatus {
    /// True when either high-voltage tier was acknowledged.
    pub fn qc_detected(&self) -> bool {
        self.0 & STATUS_HVDCP_9V_12V_MASK != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_status_decodes_each_port() {
        assert!(PortStatus(0x80).cdp());
        assert!(PortStatus(0x40).dcp());
        assert!(PortStatus(0x20).other_charging_port());
        assert!(PortStatus(0x10).sdp());
        assert_eq!(PortStatus(0x07).aca(), 0x07);
    }

    #[test]
    fn hvdcp_status_detects_either_tier() {
        assert!(HvdcpStatus(0x04).qc_detected());
        assert!(HvdcpStatus(0x08).qc_detected());
        assert!(!HvdcpStatus(0x03).qc_detected());
    }

    #[test]
    fn input_status_fields() {
        let status = InputStatus(0xC5);
        assert!(status.aicl_done());
        assert!(status.usb500_mode());
        assert_eq!(status.granted_limit(), 0x5);
    }
}
