//! Register access on top of a [`Transport`], with wake bracketing and
//! read-modify-write helpers.

use smb1351_chgdet_traits::{IoError, Transport};

use crate::regs::{CMD_BQ_CFG_ACCESS_BIT, Reg};

/// Register accessor for the SMB1351.
///
/// Every transaction is bracketed by `stay_awake`/`relax` so the platform
/// does not suspend the bus mid-transfer. The bracket is balanced on the
/// error path as well.
pub struct RegisterAccess<T: Transport> {
    transport: T,
}

impl<T: Transport> RegisterAccess<T> {
    /// Wraps a transport.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Access to the underlying transport, e.g. for interrupt waits.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Reads a register.
    pub async fn read(&mut self, reg: Reg) -> Result<u8, IoError> {
        self.transport.stay_awake();
        let result = self.transport.read_register(reg.0).await;
        self.transport.relax();

        if let Err(error) = result {
            warn!("read of register {:x} failed: {:?}", reg.0, error);
        }

        result
    }

    /// Writes a register.
    pub async fn write(&mut self, reg: Reg, value: u8) -> Result<(), IoError> {
        self.transport.stay_awake();
        let result = self.transport.write_register(reg.0, value).await;
        self.transport.relax();

        match result {
            Ok(()) => trace!("wrote register {:x} = {:x}", reg.0, value),
            Err(error) => warn!("write of register {:x} failed: {:?}", reg.0, error),
        }

        result
    }

    /// Replaces the masked bits of a register, leaving the rest untouched.
    pub async fn masked_write(&mut self, reg: Reg, mask: u8, value: u8) -> Result<(), IoError> {
        let current = self.read(reg).await?;
        let updated = (current & !mask) | (value & mask);

        self.write(reg, updated).await
    }

    /// Unlocks the volatile configuration registers for writing.
    ///
    /// Must precede any write to a configuration register; command registers
    /// do not need it.
    pub async fn enable_volatile_writes(&mut self) -> Result<(), IoError> {
        self.masked_write(Reg::CMD_I2C, CMD_BQ_CFG_ACCESS_BIT, CMD_BQ_CFG_ACCESS_BIT)
            .await
    }
}
