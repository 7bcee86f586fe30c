//! The peripheral descriptor and its interrupt bridge.

use core::cell::{Cell, RefCell, UnsafeCell};
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::{CriticalSection, Mutex};

use crate::diag::FailHalt;
use crate::dma::pair::Placeholders;
use crate::dma::{ChannelPair, DmaController, InterruptLine, IrqHandler};
use crate::gate::{self, AccessGate};
use crate::rtos::Rtos;
use crate::spi::SpiConfig;
use crate::transfer::{TransferConfig, TransferState};
use crate::{fatal_assert, Error};

/// Everything the engine knows about one SPI link.
///
/// Create exactly one per SPI block, usually as a `static`, and keep it for
/// the lifetime of the program: the DMA channels and the completion interrupt
/// point back into it.
///
/// `irq_handler` must be an `extern "C" fn` that calls
/// [`SpiDma::on_interrupt`] on this descriptor. It is installed on the DMA
/// completion line by [`SpiDma::init`].
///
/// ```ignore
/// static LINK: SpiDma<'static, MyRtos, Rp2040Dma, DmaIrq0> = SpiDma::new(
///     SPI_CONFIG, &RTOS, Rp2040Dma::new(), DmaIrq0::new(), &DIAG, dma_irq0,
///     TransferConfig::new(),
/// );
///
/// extern "C" fn dma_irq0() {
///     LINK.on_interrupt();
/// }
/// ```
pub struct SpiDma<'a, R: Rtos, D, I> {
    link: SpiConfig,
    rtos: &'a R,
    dma: D,
    irq: I,
    diag: &'a dyn FailHalt,
    irq_handler: IrqHandler,
    config: TransferConfig,
    initialized: AtomicBool,
    gate: AccessGate<R>,
    channels: Mutex<RefCell<Option<ChannelPair>>>,
    state: Mutex<Cell<TransferState>>,
    discard: UnsafeCell<u8>,
}

// Safety: `discard` is only ever written by the DMA hardware and never read.
// Everything else is either immutable after construction or behind a
// critical-section mutex.
unsafe impl<R, D, I> Sync for SpiDma<'_, R, D, I>
where
    R: Rtos,
    D: DmaController,
    I: InterruptLine,
{
}

impl<'a, R, D, I> SpiDma<'a, R, D, I>
where
    R: Rtos,
    D: DmaController,
    I: InterruptLine,
{
    /// Describe a link. Nothing touches the hardware until [`SpiDma::init`].
    pub const fn new(
        link: SpiConfig,
        rtos: &'a R,
        dma: D,
        irq: I,
        diag: &'a dyn FailHalt,
        irq_handler: IrqHandler,
        config: TransferConfig,
    ) -> Self {
        SpiDma {
            link,
            rtos,
            dma,
            irq,
            diag,
            irq_handler,
            config,
            initialized: AtomicBool::new(false),
            gate: AccessGate::new(),
            channels: Mutex::new(RefCell::new(None)),
            state: Mutex::new(Cell::new(TransferState::Idle)),
            discard: UnsafeCell::new(0),
        }
    }

    /// Claim the DMA channels and hook up the completion interrupt.
    ///
    /// Call once, before any task uses the link. Later calls return `Ok`
    /// without doing anything. On failure the descriptor stays uninitialized
    /// and nothing is left claimed.
    pub fn init(&self) -> Result<(), Error> {
        if gate::test_and_set(&self.initialized) {
            return Ok(());
        }
        match ChannelPair::configure(
            &self.dma,
            &self.irq,
            &self.link,
            self.placeholders(),
            self.irq_handler,
        ) {
            Ok(pair) => {
                debug!(
                    "spi{}: tx on DMA channel {}, rx on DMA channel {}",
                    self.link.instance.id(),
                    pair.tx().index(),
                    pair.rx().index()
                );
                critical_section::with(|cs| self.channels.borrow(cs).replace(Some(pair)));
                Ok(())
            }
            Err(e) => {
                self.initialized.store(false, Ordering::Release);
                warn!("spi{}: no free DMA channels", self.link.instance.id());
                Err(e)
            }
        }
    }

    /// Take the link for the calling task, waiting for whoever holds it.
    ///
    /// Nested calls from the holder are fine; each needs its own
    /// [`SpiDma::unlock`].
    pub fn lock(&self) {
        let locked = self.gate.acquire(self.rtos);
        fatal_assert!(self.diag, locked);
    }

    /// Give the link back. Fatal if the calling task does not hold it.
    pub fn unlock(&self) {
        let released = self.gate.release(self.rtos);
        fatal_assert!(self.diag, released, "unlock from a task that does not hold the link");
    }

    /// The interrupt bridge. Call this, and nothing else, from the DMA_IRQ_0
    /// handler.
    ///
    /// Acknowledges the RX channel's completion and wakes the task holding
    /// the link. Never blocks.
    pub fn on_interrupt(&self) {
        let rx = critical_section::with(|cs| {
            self.channels
                .borrow(cs)
                .borrow()
                .as_ref()
                .map(|pair| pair.rx())
        });
        let Some(rx) = rx else {
            return;
        };
        // The line is shared; only act on our own channel.
        if !self.dma.acknowledge_irq0(rx) {
            return;
        }
        let rx_busy = self.dma.is_busy(rx);
        fatal_assert!(self.diag, !rx_busy);
        let owner = self.gate.owner();
        fatal_assert!(self.diag, owner.is_some(), "completion with no task holding the link");
        if let Some(owner) = owner {
            let woken = self.rtos.notify_from_isr(owner);
            self.rtos.yield_from_isr(woken);
        }
    }

    pub(crate) fn placeholders(&self) -> Placeholders {
        Placeholders {
            fill: &self.config.fill as *const u8 as usize,
            discard: self.discard.get() as usize,
        }
    }

    pub(crate) fn channels_cell<'cs>(
        &'cs self,
        cs: CriticalSection<'cs>,
    ) -> &'cs RefCell<Option<ChannelPair>> {
        self.channels.borrow(cs)
    }

    pub(crate) fn set_state(&self, state: TransferState) {
        critical_section::with(|cs| self.state.borrow(cs).set(state));
    }

    pub(crate) fn dma(&self) -> &D {
        &self.dma
    }

    /// The channel pair, once initialized.
    pub fn channels(&self) -> Option<ChannelPair> {
        critical_section::with(|cs| *self.channels.borrow(cs).borrow())
    }

    /// Task currently holding the link.
    pub fn owner(&self) -> Option<R::TaskId> {
        self.gate.owner()
    }

    /// How far the most recent transfer got.
    pub fn state(&self) -> TransferState {
        critical_section::with(|cs| self.state.borrow(cs).get())
    }

    /// Has [`SpiDma::init`] succeeded?
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Static link configuration.
    pub fn link(&self) -> &SpiConfig {
        &self.link
    }

    /// Transfer settings.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Where fatal failures are reported.
    pub fn diagnostics(&self) -> &'a dyn FailHalt {
        self.diag
    }

    /// The scheduler the link runs under.
    pub fn rtos(&self) -> &'a R {
        self.rtos
    }
}
