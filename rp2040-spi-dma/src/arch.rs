//! Platform primitives used by the transfer engine and the fail-halt path.
//!
//! On the RP2040 these map onto Cortex-M0+ instructions. Everywhere else they
//! are placeholders, except [`halt_system`], which panics so that a host test
//! can observe that the system would have stopped.

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod inner {
    pub use cortex_m::asm::dsb;
    pub use cortex_m::interrupt::disable as interrupt_disable;

    /// Stop the core for good.
    ///
    /// Interrupts are masked so that neither the scheduler tick nor a DMA
    /// completion can run again, then the core parks on a breakpoint. With a
    /// debugger attached this stops in the debugger; without one the
    /// breakpoint escalates to a HardFault and nothing runs until an external
    /// reset.
    pub fn halt_system() -> ! {
        interrupt_disable();
        loop {
            cortex_m::asm::bkpt();
        }
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod inner {
    /// Placeholder function to disable interrupts
    pub fn interrupt_disable() {}
    /// Placeholder function to emit a data synchronisation barrier
    pub fn dsb() {}

    /// Host stand-in for stopping the system.
    ///
    /// There is no core to park, so this panics with a fixed message.
    pub fn halt_system() -> ! {
        interrupt_disable();
        panic!("system halted");
    }
}

pub use inner::*;
