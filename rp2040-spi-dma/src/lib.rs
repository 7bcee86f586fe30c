//! Interrupt-driven SPI DMA transfers for the RP2040 under a preemptive RTOS
//!
//! The crate drives one full-duplex PL022 SPI link through a pair of DMA
//! channels. The calling task is put to sleep while the hardware moves the
//! data and is woken from the DMA completion interrupt, so no task busy-waits
//! on the link.
//!
//! The moving parts:
//!
//! - [`SpiDma`] is the peripheral descriptor. One exists per SPI block for the
//!   whole program. It owns the channel pair, the access gate and the
//!   interrupt bridge ([`SpiDma::on_interrupt`]).
//! - [`SpiDma::lock`] / [`SpiDma::unlock`] bracket one or more
//!   [`SpiDma::transfer`] calls. Only the task holding the lock may transfer.
//! - Broken invariants are not errors: they go through the
//!   [`diag`] fail-halt path, which prints a report and stops the system.
//!   The only recoverable failure is [`Error::Timeout`].
//!
//! The scheduler, DMA block and interrupt controller are reached through the
//! [`Rtos`], [`dma::DmaController`] and [`dma::InterruptLine`] traits. The
//! RP2040 implementations of the latter two live in [`dma::rp2040`] (ARM
//! targets only); [`sim`] provides thread-backed host implementations of all
//! three for tests.
//!
//! ## Crate features
//!
//! - **defmt** - Implement `defmt::Format` for public types and log through defmt
//! - **log** - Log through the `log` facade
//! - **rt** - Minimal startup / runtime for Cortex-M microcontrollers
//! - **sim** - Host simulation backend (needs `std`)

#![warn(missing_docs)]
#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "sim", not(test)))]
extern crate std;

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub(crate) mod arch;
pub mod descriptor;
pub mod diag;
pub mod dma;
pub mod gate;
pub mod harness;
pub mod pattern;
pub mod rtos;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod spi;
pub mod transfer;

pub use descriptor::SpiDma;
pub use diag::{Console, Diagnostics, FailHalt, FailureReport};
pub use rtos::{RecursiveLock, Rtos};
pub use spi::{SpiConfig, SpiInstance, SpiPins};
pub use transfer::{TransferConfig, TransferState};

/// Recoverable failures of the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The completion interrupt did not arrive within the configured timeout.
    ///
    /// The buffers of the abandoned transfer hold partial data.
    Timeout,
    /// Fewer than two DMA channels were free at initialization.
    NoFreeChannel,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Timeout => f.write_str("transfer timed out"),
            Error::NoFreeChannel => f.write_str("no free DMA channel"),
        }
    }
}
