//! The interrupt status block and its dispatch table.
//!
//! The SMB1351 reports interrupts in eight consecutive registers, IRQ_A
//! through IRQ_H. Each register packs four sources; per source, the lower
//! bit of its two-bit slot is the live rt-status and the upper bit latches
//! a trigger since the last read.

use crate::regs::Reg;

/// Number of interrupt status registers.
pub const IRQ_REG_COUNT: usize = 8;
/// Sources per interrupt status register.
pub const IRQ_SLOTS_PER_REG: usize = 4;

const IRQ_STATUS_BIT: u8 = 0x01;
const IRQ_LATCHED_BIT: u8 = 0x02;
const BITS_PER_IRQ: u8 = 2;

/// The interrupt sources the engine reacts to.
///
/// Sources without an entry here are logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IrqEvent {
    /// Battery soft cold limit.
    ColdSoft,
    /// Battery soft hot limit.
    HotSoft,
    /// Battery hard cold limit.
    ColdHard,
    /// Battery hard hot limit.
    HotHard,
    /// Battery removed or inserted.
    BatteryMissing,
    /// Charge cycle terminated.
    ChargeTerminated,
    /// Input undervoltage.
    UsbinUv,
    /// Input overvoltage.
    UsbinOv,
    /// APSD classification completed.
    ApsdComplete,
    /// AICL completed.
    AiclDone,
    /// AICL failed.
    AiclFail,
    /// HVDCP authentication finished.
    HvdcpAuthDone,
}

/// One source within an interrupt status register.
pub struct IrqSlot {
    /// Name for logging, mirroring the datasheet.
    pub name: &'static str,
    /// The event the engine dispatches on, if any.
    pub event: Option<IrqEvent>,
}

/// One interrupt status register and its four sources, lowest slot first.
pub struct IrqRegister {
    /// The status register.
    pub reg: Reg,
    /// Its sources.
    pub slots: [IrqSlot; IRQ_SLOTS_PER_REG],
}

const fn slot(name: &'static str, event: IrqEvent) -> IrqSlot {
    IrqSlot {
        name,
        event: Some(event),
    }
}

const fn ignored(name: &'static str) -> IrqSlot {
    IrqSlot { name, event: None }
}

/// Dispatch table for the interrupt status block, ordered IRQ_A..IRQ_H.
pub static IRQ_TABLE: [IrqRegister; IRQ_REG_COUNT] = [
    IrqRegister {
        reg: Reg::IRQ_A,
        slots: [
            slot("cold_soft", IrqEvent::ColdSoft),
            slot("hot_soft", IrqEvent::HotSoft),
            slot("cold_hard", IrqEvent::ColdHard),
            slot("hot_hard", IrqEvent::HotHard),
        ],
    },
    IrqRegister {
        reg: Reg::IRQ_B,
        slots: [
            ignored("internal_temp_limit"),
            ignored("vbatt_low"),
            slot("battery_missing", IrqEvent::BatteryMissing),
            ignored("batt_therm_removed"),
        ],
    },
    IrqRegister {
        reg: Reg::IRQ_C,
        slots: [
            slot("chg_term", IrqEvent::ChargeTerminated),
            ignored("taper"),
            ignored("recharge"),
            ignored("fast_chg"),
        ],
    },
    IrqRegister {
        reg: Reg::IRQ_D,
        slots: [
            ignored("prechg_timeout"),
            ignored("safety_timeout"),
            ignored("chg_error"),
            ignored("batt_ov"),
        ],
    },
    IrqRegister {
        reg: Reg::IRQ_E,
        slots: [
            ignored("power_ok"),
            ignored("afvc"),
            slot("usbin_uv", IrqEvent::UsbinUv),
            slot("usbin_ov", IrqEvent::UsbinOv),
        ],
    },
    IrqRegister {
        reg: Reg::IRQ_F,
        slots: [
            ignored("otg_oc_retry"),
            ignored("rid"),
            ignored("otg_fail"),
            ignored("otg_oc"),
        ],
    },
    IrqRegister {
        reg: Reg::IRQ_G,
        slots: [
            ignored("chg_inhibit"),
            slot("aicl_fail", IrqEvent::AiclFail),
            slot("aicl_done", IrqEvent::AiclDone),
            slot("apsd_complete", IrqEvent::ApsdComplete),
        ],
    },
    IrqRegister {
        reg: Reg::IRQ_H,
        slots: [
            ignored("wdog_timeout"),
            slot("hvdcp_auth_done", IrqEvent::HvdcpAuthDone),
            ignored("hvdcp_2p1_status"),
            ignored("reserved"),
        ],
    },
];

/// True when the slot's trigger bit latched since the last read.
pub fn slot_triggered(value: u8, slot: usize) -> bool {
    value & (IRQ_LATCHED_BIT << (slot as u8 * BITS_PER_IRQ)) != 0
}

/// The slot's live rt-status bit.
pub fn slot_status(value: u8, slot: usize) -> bool {
    value & (IRQ_STATUS_BIT << (slot as u8 * BITS_PER_IRQ)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_the_status_block_in_order() {
        for (index, entry) in IRQ_TABLE.iter().enumerate() {
            assert_eq!(entry.reg.0, Reg::IRQ_A.0 + index as u8);
        }
    }

    #[test]
    fn slot_bits_decode() {
        // Slot 3 latched and asserted, slot 1 asserted only.
        let value = 0xC4;
        assert!(slot_triggered(value, 3));
        assert!(slot_status(value, 3));
        assert!(!slot_triggered(value, 1));
        assert!(slot_status(value, 1));
        assert!(!slot_status(value, 0));
    }

    #[test]
    fn apsd_complete_lives_in_irq_g() {
        let entry = &IRQ_TABLE[6];
        assert_eq!(entry.reg, Reg::IRQ_G);
        assert_eq!(entry.slots[3].event, Some(IrqEvent::ApsdComplete));
    }
}
