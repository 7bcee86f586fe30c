//! Direct memory access (DMA) for the serial link.
//!
//! A full-duplex SPI transfer needs two DMA channels: one moving bytes from
//! memory into the SPI TX FIFO and one moving bytes from the SPI RX FIFO back
//! into memory. Both are paced by the SPI's data request (DREQ) lines and must
//! be started by a single write to `MULTI_CHAN_TRIGGER`; started one after the
//! other, the first channel can overrun or starve the FIFO before the second
//! one is running.
//!
//! The register level work is behind [`DmaController`] and [`InterruptLine`]
//! so the transfer logic can run against the RP2040 ([`rp2040`], ARM targets
//! only) or against the host simulation in [`sim`](crate::sim).

pub mod pair;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod rp2040;

pub use pair::{ChannelPair, TransferRequest};

/// Number of channels in the RP2040 DMA block.
pub const CHANNEL_COUNT: u8 = 12;

/// The DREQ value for SPI0's TX FIFO
pub const DREQ_SPI0_TX: u8 = 16;
/// The DREQ value for SPI0's RX FIFO
pub const DREQ_SPI0_RX: u8 = 17;
/// The DREQ value for SPI1's TX FIFO
pub const DREQ_SPI1_TX: u8 = 18;
/// The DREQ value for SPI1's RX FIFO
pub const DREQ_SPI1_RX: u8 = 19;

/// A claimed DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelHandle(u8);

impl ChannelHandle {
    /// Wrap a channel index (0..12).
    pub const fn new(index: u8) -> Self {
        debug_assert!(index < CHANNEL_COUNT);
        ChannelHandle(index)
    }

    /// Numerical index of the DMA channel.
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Bit of this channel in the multi-channel registers (`MULTI_CHAN_TRIGGER`, `INTS0`, ...).
    pub const fn mask(self) -> u32 {
        1 << self.0
    }
}

/// Size of one transfer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataSize {
    /// 8 bits
    Byte = 0,
    /// 16 bits
    HalfWord = 1,
    /// 32 bits
    Word = 2,
}

/// Parameters of one DMA channel.
///
/// `read_addr` and `write_addr` are bus addresses. An address pointing at a
/// peripheral FIFO never increments; an address pointing at memory increments
/// once per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelConfig {
    /// Element size.
    pub data_size: DataSize,
    /// Increment the read address after each element.
    pub incr_read: bool,
    /// Increment the write address after each element.
    pub incr_write: bool,
    /// Transfer request signal pacing the channel.
    pub treq: u8,
    /// Source address.
    pub read_addr: usize,
    /// Destination address.
    pub write_addr: usize,
}

impl ChannelConfig {
    /// The `CTRL` register value for this configuration on channel `ch`.
    ///
    /// The channel is enabled, chains to itself (no chaining) and raises its
    /// interrupt on completion.
    pub fn ctrl_word(&self, ch: ChannelHandle) -> u32 {
        const EN: u32 = 1 << 0;
        const DATA_SIZE_SHIFT: u32 = 2;
        const INCR_READ: u32 = 1 << 4;
        const INCR_WRITE: u32 = 1 << 5;
        const CHAIN_TO_SHIFT: u32 = 11;
        const TREQ_SEL_SHIFT: u32 = 15;

        let mut ctrl = EN
            | (self.data_size as u32) << DATA_SIZE_SHIFT
            | (ch.index() as u32 & 0xf) << CHAIN_TO_SHIFT
            | (self.treq as u32 & 0x3f) << TREQ_SEL_SHIFT;
        if self.incr_read {
            ctrl |= INCR_READ;
        }
        if self.incr_write {
            ctrl |= INCR_WRITE;
        }
        ctrl
    }
}

/// Handler installed on the DMA completion interrupt line.
pub type IrqHandler = extern "C" fn();

/// Register-level operations on the DMA block.
///
/// All methods take `&self`: the interrupt bridge acknowledges completion
/// while the owning task may still hold a reference to the controller.
pub trait DmaController: Sync {
    /// Claim a channel nobody else uses.
    fn claim_unused_channel(&self) -> Option<ChannelHandle>;

    /// Give a claimed channel back.
    fn unclaim(&self, ch: ChannelHandle);

    /// Write the channel configuration and transfer count without starting it.
    fn load(&self, ch: ChannelHandle, config: &ChannelConfig, count: u32);

    /// Start every channel in `mask` with one write to `MULTI_CHAN_TRIGGER`.
    fn trigger(&self, mask: u32);

    /// Is the channel still transferring?
    fn is_busy(&self, ch: ChannelHandle) -> bool;

    /// Stop every channel in `mask` and wait until none of them is busy.
    ///
    /// An aborted channel moves no further data and does not report
    /// completion, but a completion that landed before the abort stays
    /// pending in `INTS0`.
    fn abort(&self, mask: u32);

    /// Spin until the channel is no longer busy.
    fn wait_for_finish_blocking(&self, ch: ChannelHandle) {
        while self.is_busy(ch) {}
    }

    /// Route (or stop routing) the channel's completion to DMA_IRQ_0.
    fn set_irq0_enabled(&self, ch: ChannelHandle, enabled: bool);

    /// Clear the channel's pending DMA_IRQ_0 bit. Returns whether it was set.
    fn acknowledge_irq0(&self, ch: ChannelHandle) -> bool;
}

/// The NVIC line the DMA completion interrupt arrives on.
pub trait InterruptLine: Sync {
    /// Make `handler` the handler of this line.
    fn install(&self, handler: IrqHandler);

    /// Give the line the lowest urgency, below anything the scheduler masks.
    fn set_lowest_priority(&self);

    /// Unmask the line.
    fn enable(&self);
}
