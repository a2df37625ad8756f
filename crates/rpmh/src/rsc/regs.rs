//! RSC register layout and access
//!
//! Per-TCS registers live at
//! `tcs_base + reg + RSC_DRV_TCS_OFFSET * m + RSC_DRV_CMD_OFFSET * n`
//! where `m` is the TCS index and `n` the command slot.

use crate::error::TcsError;
use crate::hal::RegisterBus;
use std::sync::Arc;

/// Channel configuration register, relative to the channel base
pub const DRV_PRNT_CHLD_CONFIG: usize = 0x0C;
pub const DRV_NUM_TCS_MASK: u32 = 0x3F;
pub const DRV_NUM_TCS_SHIFT: u32 = 6;
pub const DRV_NCPT_MASK: u32 = 0x1F;
pub const DRV_NCPT_SHIFT: u32 = 27;

pub const RSC_DRV_TCS_OFFSET: usize = 672;
pub const RSC_DRV_CMD_OFFSET: usize = 20;

// Channel-wide, addressed with m = 0, n = 0
pub const RSC_DRV_IRQ_ENABLE: usize = 0x00;
pub const RSC_DRV_IRQ_STATUS: usize = 0x04;
pub const RSC_DRV_IRQ_CLEAR: usize = 0x08;

// Per TCS
pub const RSC_DRV_CMD_WAIT_FOR_CMPL: usize = 0x10;
pub const RSC_DRV_CONTROL: usize = 0x14;
pub const RSC_DRV_STATUS: usize = 0x18;
pub const RSC_DRV_CMD_ENABLE: usize = 0x1C;

// Per command
pub const RSC_DRV_CMD_MSGID: usize = 0x30;
pub const RSC_DRV_CMD_ADDR: usize = 0x34;
pub const RSC_DRV_CMD_DATA: usize = 0x38;
pub const RSC_DRV_CMD_STATUS: usize = 0x3C;

pub const TCS_AMC_MODE_ENABLE: u32 = 1 << 16;
pub const TCS_AMC_MODE_TRIGGER: u32 = 1 << 24;

pub const CMD_MSGID_LEN: u32 = 8;
pub const CMD_MSGID_RESP_REQ: u32 = 1 << 8;
pub const CMD_MSGID_WRITE: u32 = 1 << 16;

pub const CMD_STATUS_ISSUED: u32 = 1 << 8;
pub const CMD_STATUS_COMPL: u32 = 1 << 16;

/// Channel geometry reported by the configuration register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    /// TCSes available to this DRV
    pub max_tcs: usize,
    /// Command slots per TCS
    pub ncpt: usize,
}

impl HardwareInfo {
    pub fn decode(config: u32, drv_id: u32) -> Self {
        let shift = DRV_NUM_TCS_SHIFT * drv_id;
        let max_tcs = (config >> shift) & DRV_NUM_TCS_MASK;
        let ncpt = (config >> DRV_NCPT_SHIFT) & DRV_NCPT_MASK;
        Self {
            max_tcs: max_tcs as usize,
            ncpt: ncpt as usize,
        }
    }

    /// Inverse of [`decode`](Self::decode) for a single DRV
    pub fn encode(&self, drv_id: u32) -> u32 {
        let tcs = (self.max_tcs as u32 & DRV_NUM_TCS_MASK) << (DRV_NUM_TCS_SHIFT * drv_id);
        let ncpt = (self.ncpt as u32 & DRV_NCPT_MASK) << DRV_NCPT_SHIFT;
        tcs | ncpt
    }
}

/// Highest DRV id whose TCS count field fits below the NCPT field
pub const MAX_DRV_ID: u32 = (DRV_NCPT_SHIFT / DRV_NUM_TCS_SHIFT) - 1;

/// TCS register accessor for one channel
pub struct TcsRegs {
    bus: Arc<dyn RegisterBus>,
    tcs_base: usize,
    poll_limit: u32,
}

impl TcsRegs {
    pub fn new(bus: Arc<dyn RegisterBus>, tcs_base: usize, poll_limit: u32) -> Self {
        Self {
            bus,
            tcs_base,
            poll_limit: poll_limit.max(1),
        }
    }

    pub fn read_config(&self) -> u32 {
        self.bus.read32(DRV_PRNT_CHLD_CONFIG)
    }

    pub fn offset(&self, reg: usize, m: usize, n: usize) -> usize {
        self.tcs_base + reg + RSC_DRV_TCS_OFFSET * m + RSC_DRV_CMD_OFFSET * n
    }

    pub fn read(&self, reg: usize, m: usize, n: usize) -> u32 {
        self.bus.read32(self.offset(reg, m, n))
    }

    pub fn write(&self, reg: usize, m: usize, n: usize, data: u32) {
        self.bus.write32(self.offset(reg, m, n), data);
    }

    /// Write and poll until the value reads back.
    ///
    /// The hardware applies these writes within a few cycles; the poll count
    /// is bounded so a wedged block surfaces as an error.
    pub fn write_sync(&self, reg: usize, m: usize, n: usize, data: u32) -> Result<(), TcsError> {
        self.write(reg, m, n, data);
        for _ in 0..self.poll_limit {
            if self.read(reg, m, n) == data {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        let offset = self.offset(reg, m, n);
        log::error!(
            "RSC register {:#x} stuck: wrote {:#x}, reads {:#x}",
            offset,
            data,
            self.bus.read32(offset)
        );
        Err(TcsError::RegisterLatch {
            offset,
            expected: data,
            polls: self.poll_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimRsc;

    #[test]
    fn config_register_roundtrip() {
        let info = HardwareInfo { max_tcs: 10, ncpt: 16 };
        for drv_id in 0..=MAX_DRV_ID {
            assert_eq!(HardwareInfo::decode(info.encode(drv_id), drv_id), info);
        }
        // Another DRV's field does not leak into ours.
        let mixed = info.encode(2) | HardwareInfo { max_tcs: 5, ncpt: 16 }.encode(0);
        assert_eq!(HardwareInfo::decode(mixed, 0).max_tcs, 5);
        assert_eq!(HardwareInfo::decode(mixed, 2).max_tcs, 10);
    }

    #[test]
    fn strided_offsets() {
        let sim = Arc::new(SimRsc::new(0, 4, 16, 0xd00));
        let regs = TcsRegs::new(sim, 0xd00, 8);
        assert_eq!(regs.offset(RSC_DRV_IRQ_STATUS, 0, 0), 0xd04);
        assert_eq!(regs.offset(RSC_DRV_CONTROL, 2, 0), 0xd00 + 0x14 + 2 * 672);
        assert_eq!(regs.offset(RSC_DRV_CMD_ADDR, 1, 3), 0xd00 + 0x34 + 672 + 60);
    }

    #[test]
    fn sync_write_is_bounded() {
        let sim = Arc::new(SimRsc::new(0, 4, 16, 0xd00));
        let regs = TcsRegs::new(sim.clone(), 0xd00, 8);

        regs.write_sync(RSC_DRV_CONTROL, 1, 0, TCS_AMC_MODE_ENABLE).unwrap();
        assert_eq!(regs.read(RSC_DRV_CONTROL, 1, 0), TCS_AMC_MODE_ENABLE);

        sim.pin(regs.offset(RSC_DRV_CONTROL, 1, 0));
        let err = regs.write_sync(RSC_DRV_CONTROL, 1, 0, 0).unwrap_err();
        assert_eq!(
            err,
            TcsError::RegisterLatch {
                offset: 0xd00 + 0x14 + 672,
                expected: 0,
                polls: 8,
            }
        );
    }
}
