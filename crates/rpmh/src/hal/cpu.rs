//! Per-thread interrupt context tracking
//!
//! A thread delivering the completion interrupt, or running with interrupts
//! masked, holds an [`IrqContext`]. Paths that sleep check
//! [`irqs_disabled`] first.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static IRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the current thread as running with interrupts disabled until dropped
pub struct IrqContext {
    // Bound to the thread that entered it.
    _not_send: PhantomData<*const ()>,
}

impl IrqContext {
    pub fn enter() -> Self {
        IRQ_DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for IrqContext {
    fn drop(&mut self) {
        IRQ_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

pub fn irqs_disabled() -> bool {
    IRQ_DEPTH.with(|d| d.get() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_and_thread_locality() {
        assert!(!irqs_disabled());
        let outer = IrqContext::enter();
        {
            let _inner = IrqContext::enter();
            assert!(irqs_disabled());
        }
        assert!(irqs_disabled());

        let other = std::thread::spawn(irqs_disabled).join().unwrap();
        assert!(!other);

        drop(outer);
        assert!(!irqs_disabled());
    }
}
