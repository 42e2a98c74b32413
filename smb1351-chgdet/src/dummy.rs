//! Dummy implementations of the hardware traits and the policy manager,
//! for tests and examples.

use core::future::{Future, pending};

use heapless::{Deque, Vec};
use smb1351_chgdet_traits::{ControlLines, IoError, Line, Transport};

use crate::detection::policy_manager::{ChargingPolicyManager, Event, SupplyChange};
use crate::regs::Reg;
use crate::timers::Timer;
use crate::units::{Voltage, millivolts};

/// A dummy transport that serves registers from memory.
///
/// Tests preload register values with [`Self::set_reg`], raise the fake
/// interrupt line with [`Self::inject_interrupt`], and inspect the write
/// log afterwards.
pub struct DummyTransport {
    registers: [u8; Reg::SPACE],
    writes: Vec<(u8, u8), 64>,
    failing_reads: Vec<u8, 8>,
    pending_interrupts: u8,
    stay_awake_count: u32,
    relax_count: u32,
}

impl Default for DummyTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyTransport {
    /// Creates a transport with all registers reading zero.
    pub fn new() -> Self {
        Self {
            registers: [0; Reg::SPACE],
            writes: Vec::new(),
            failing_reads: Vec::new(),
            pending_interrupts: 0,
            stay_awake_count: 0,
            relax_count: 0,
        }
    }

    /// Preloads a register value.
    pub fn set_reg(&mut self, reg: Reg, value: u8) {
        self.registers[reg.0 as usize] = value;
    }

    /// Current value of a register.
    pub fn reg(&self, reg: Reg) -> u8 {
        self.registers[reg.0 as usize]
    }

    /// Asserts the fake interrupt line once.
    pub fn inject_interrupt(&mut self) {
        self.pending_interrupts += 1;
    }

    /// Makes the next read of the given register fail on the bus.
    pub fn fail_next_read(&mut self, reg: Reg) {
        self.failing_reads.push(reg.0).expect("fault log full");
    }

    /// The raw write log, in order.
    pub fn writes(&self) -> &[(u8, u8)] {
        &self.writes
    }

    /// The values written to one register, in order.
    pub fn writes_to(&self, reg: Reg) -> impl Iterator<Item = u8> + '_ {
        self.writes
            .iter()
            .filter(move |(address, _)| *address == reg.0)
            .map(|(_, value)| *value)
    }

    /// Forgets the write log.
    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Outstanding keep-awake tokens. Zero once all brackets closed.
    pub fn wake_balance(&self) -> i64 {
        i64::from(self.stay_awake_count) - i64::from(self.relax_count)
    }
}

impl Transport for DummyTransport {
    fn read_register(&mut self, reg: u8) -> impl Future<Output = Result<u8, IoError>> {
        async move {
            if let Some(position) = self.failing_reads.iter().position(|&r| r == reg) {
                self.failing_reads.swap_remove(position);
                return Err(IoError::Bus);
            }

            let value = self.registers[reg as usize];

            // The latched bits of the interrupt status block clear on read,
            // as on silicon. The rt-status bits stay.
            if (Reg::IRQ_A.0..=Reg::IRQ_H.0).contains(&reg) {
                self.registers[reg as usize] = value & 0x55;
            }

            Ok(value)
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) -> impl Future<Output = Result<(), IoError>> {
        async move {
            self.writes.push((reg, value)).expect("write log full");

            // The HVDCP command bits self-clear on silicon.
            if reg != Reg::CMD_HVDCP.0 {
                self.registers[reg as usize] = value;
            }

            Ok(())
        }
    }

    fn wait_for_interrupt(&mut self) -> impl Future<Output = ()> {
        async {
            if self.pending_interrupts > 0 {
                self.pending_interrupts -= 1;
            } else {
                pending().await
            }
        }
    }

    fn stay_awake(&mut self) {
        self.stay_awake_count += 1;
    }

    fn relax(&mut self) {
        self.relax_count += 1;
    }
}

/// Dummy control lines that record every transition.
#[derive(Default)]
pub struct DummyLines {
    transitions: Vec<(Line, bool), 16>,
}

impl DummyLines {
    /// The last level a line was driven to, if any.
    pub fn level(&self, line: Line) -> Option<bool> {
        self.transitions
            .iter()
            .rev()
            .find(|(l, _)| *l == line)
            .map(|(_, level)| *level)
    }
}

impl ControlLines for DummyLines {
    fn set_line(&mut self, line: Line, level: bool) {
        self.transitions.push((line, level)).expect("transition log full");
    }
}

/// A dummy policy manager with settable platform state.
pub struct DummyManager {
    /// The bus voltage it reports, in millivolts.
    pub vbus_mv: u32,
    /// Whether it reports the USB stack as enumerated.
    pub enumerated: bool,
    /// Whether it permits high-voltage charging.
    pub hv_allowed: bool,
    notifications: Vec<SupplyChange, 16>,
    events: Deque<Event, 8>,
}

impl Default for DummyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyManager {
    /// Creates a manager reporting a nominal 5 V source.
    pub fn new() -> Self {
        Self {
            vbus_mv: 5000,
            enumerated: false,
            hv_allowed: true,
            notifications: Vec::new(),
            events: Deque::new(),
        }
    }

    /// Queues an event for the engine's next wait.
    pub fn push_event(&mut self, event: Event) {
        self.events.push_back(event).expect("event queue full");
    }

    /// The supply-change notifications received so far, in order.
    pub fn notifications(&self) -> &[SupplyChange] {
        &self.notifications
    }

    /// Forgets the received notifications.
    pub fn clear_notifications(&mut self) {
        self.notifications.clear();
    }
}

impl ChargingPolicyManager for DummyManager {
    fn power_supply_changed(&mut self, change: SupplyChange) -> impl Future<Output = ()> {
        async move {
            self.notifications.push(change).expect("notification log full");
        }
    }

    fn bus_voltage(&mut self) -> impl Future<Output = Voltage> {
        async { millivolts(self.vbus_mv) }
    }

    fn is_enumerated(&mut self) -> impl Future<Output = bool> {
        async { self.enumerated }
    }

    fn high_voltage_charging_allowed(&mut self) -> impl Future<Output = bool> {
        async { self.hv_allowed }
    }

    fn get_event(&mut self) -> impl Future<Output = Event> {
        async {
            match self.events.pop_front() {
                Some(event) => event,
                None => pending().await,
            }
        }
    }
}

/// A timer whose delays expire immediately, keeping tests deterministic.
pub struct DummyTimer {}

impl Timer for DummyTimer {
    fn after_millis(_milliseconds: u64) -> impl Future<Output = ()> {
        async {}
    }

    fn now_millis() -> u64 {
        0
    }
}
