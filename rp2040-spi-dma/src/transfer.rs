//! The transfer orchestrator.
//!
//! A transfer goes `Idle -> Armed -> InFlight -> Completed | TimedOut`:
//!
//! - **Armed**: the channel pair is pointed at the caller's buffers and any
//!   stale completion notification of the calling task is drained, so a
//!   notification left over from an earlier transfer cannot pass for this
//!   one.
//! - **InFlight**: both channels are loaded, then started together with a
//!   single `MULTI_CHAN_TRIGGER` write. The calling task sleeps on its
//!   notification.
//! - **Completed**: the interrupt bridge woke the task. Both channels are
//!   checked to be idle.
//! - **TimedOut**: nothing arrived in time. The transfer is abandoned and
//!   [`Error::Timeout`] returned; the buffers hold partial data and the
//!   channels should be considered in an unknown state.

use core::sync::atomic::{compiler_fence, Ordering};

use fugit::MillisDurationU32;

use crate::arch;
use crate::descriptor::SpiDma;
use crate::dma::{DmaController, InterruptLine, TransferRequest};
use crate::rtos::Rtos;
use crate::{fail, fatal_assert, Error};

/// How far the most recent transfer on a link got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferState {
    /// No transfer yet.
    Idle,
    /// Channels bound to the buffers, not started.
    Armed,
    /// Channels running, caller waiting.
    InFlight,
    /// Finished and checked.
    Completed,
    /// Abandoned after the completion timeout.
    TimedOut,
}

/// Per-link transfer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub(crate) timeout: MillisDurationU32,
    pub(crate) fill: u8,
}

impl TransferConfig {
    /// One second timeout, `0xff` sent when there is nothing to send.
    pub const fn new() -> Self {
        TransferConfig {
            timeout: MillisDurationU32::millis(1000),
            fill: 0xff,
        }
    }

    /// Give up on a transfer whose completion takes longer than `timeout`.
    pub const fn with_timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.timeout = timeout;
        self
    }

    /// Byte clocked out by receive-only transfers.
    pub const fn with_fill_byte(mut self, fill: u8) -> Self {
        self.fill = fill;
        self
    }

    /// Completion timeout.
    pub const fn timeout(&self) -> MillisDurationU32 {
        self.timeout
    }

    /// Byte clocked out by receive-only transfers.
    pub const fn fill_byte(&self) -> u8 {
        self.fill
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, R, D, I> SpiDma<'a, R, D, I>
where
    R: Rtos,
    D: DmaController,
    I: InterruptLine,
{
    /// Exchange `len` bytes: clock out `send` while clocking into `recv`.
    ///
    /// Either buffer may be `None` (not both): a missing `send` clocks out
    /// the configured fill byte, a missing `recv` discards what comes in.
    /// The calling task sleeps until the hardware is done.
    ///
    /// The caller must hold the link ([`SpiDma::lock`]). Breaking that rule,
    /// passing no buffers or passing buffers shorter than `len` is fatal.
    ///
    /// A zero-length transfer returns `Ok` without touching the hardware.
    /// On [`Error::Timeout`] both channels have been aborted: `recv` may hold
    /// partial data but is no longer written to.
    pub fn transfer(
        &self,
        send: Option<&[u8]>,
        recv: Option<&mut [u8]>,
        len: usize,
    ) -> Result<(), Error> {
        let diag = self.diagnostics();
        let mut request = TransferRequest::new(send, recv, len);

        fatal_assert!(diag, self.is_initialized());
        let me = self.rtos().current_task();
        let owner = self.owner();
        fatal_assert!(diag, owner == Some(me), "transfer from a task that does not hold the link");
        fatal_assert!(diag, request.has_buffer());
        fatal_assert!(diag, request.buffers_fit(), "buffers shorter than {} bytes", len);
        let Ok(count) = u32::try_from(request.len()) else {
            fail!(diag, "{} bytes exceed the DMA transfer counter\n", len)
        };

        if request.is_empty() {
            self.set_state(TransferState::Completed);
            return Ok(());
        }

        // Idle -> Armed
        let pair = critical_section::with(|cs| {
            let mut channels = self.channels_cell(cs).borrow_mut();
            channels.as_mut().map(|pair| {
                pair.rebind(&mut request, self.placeholders());
                *pair
            })
        });
        let Some(pair) = pair else {
            fail!(diag, "no DMA channels configured\n")
        };
        self.rtos().take_notification(MillisDurationU32::millis(0));
        self.set_state(TransferState::Armed);
        trace!("transfer: armed {} bytes", count);

        // Armed -> InFlight. The buffers must be in memory before the DMA
        // reads them.
        arch::dsb();
        compiler_fence(Ordering::SeqCst);
        pair.load(self.dma(), count);
        self.set_state(TransferState::InFlight);
        self.dma().trigger(pair.trigger_mask());

        let timeout = self.config().timeout;
        if !self.rtos().take_notification(timeout) {
            // InFlight -> TimedOut. The channels must be stopped before the
            // buffer borrows end, and no completion of theirs may reach the
            // interrupt bridge once the caller unlocks.
            let rx = pair.rx();
            self.dma().set_irq0_enabled(rx, false);
            self.dma().abort(pair.trigger_mask());
            self.dma().acknowledge_irq0(rx);
            self.dma().set_irq0_enabled(rx, true);
            compiler_fence(Ordering::SeqCst);
            self.rtos().take_notification(MillisDurationU32::millis(0));
            self.set_state(TransferState::TimedOut);
            warn!("transfer: no completion after {} ms", timeout.ticks());
            return Err(Error::Timeout);
        }

        // InFlight -> Completed
        self.dma().wait_for_finish_blocking(pair.tx());
        self.dma().wait_for_finish_blocking(pair.rx());
        compiler_fence(Ordering::SeqCst);
        let tx_busy = self.dma().is_busy(pair.tx());
        let rx_busy = self.dma().is_busy(pair.rx());
        fatal_assert!(diag, !tx_busy && !rx_busy);
        self.set_state(TransferState::Completed);
        trace!("transfer: complete");
        Ok(())
    }
}
