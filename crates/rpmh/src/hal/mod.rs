//! Hardware Abstraction Layer
//!
//! The RSC is reached through a 32-bit register bus. Real channels use
//! [`mmio::MmioBus`]; tests and the simulator use [`sim::SimRsc`].

pub mod cpu;
pub mod mmio;
pub mod sim;

/// 32-bit register access addressed by byte offset from the channel base
pub trait RegisterBus: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// Receiver of a channel's completion interrupt
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self);
}
