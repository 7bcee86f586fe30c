//! TX/RX channel pair for one serial link.

use super::{
    ChannelConfig, ChannelHandle, DataSize, DmaController, InterruptLine, IrqHandler,
};
use crate::spi::SpiConfig;
use crate::Error;

/// One full-duplex transfer: what to send, where to receive, how many elements.
///
/// Either direction may be `None`; the channel pair then substitutes a
/// one-byte placeholder (a fixed fill value to send, a discard cell to
/// receive into) and stops incrementing that address.
pub struct TransferRequest<'b> {
    send: Option<&'b [u8]>,
    recv: Option<&'b mut [u8]>,
    len: usize,
}

impl<'b> TransferRequest<'b> {
    /// Bundle the buffers of a transfer of `len` elements.
    pub fn new(send: Option<&'b [u8]>, recv: Option<&'b mut [u8]>, len: usize) -> Self {
        TransferRequest { send, recv, len }
    }

    /// Number of elements to move.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Nothing to move.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// At least one direction has a real buffer.
    pub fn has_buffer(&self) -> bool {
        self.send.is_some() || self.recv.is_some()
    }

    /// Every real buffer holds at least `len` elements.
    pub fn buffers_fit(&self) -> bool {
        self.send.map_or(true, |s| s.len() >= self.len)
            && self.recv.as_ref().map_or(true, |r| r.len() >= self.len)
    }
}

/// Addresses of the one-byte stand-ins for a missing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placeholders {
    pub fill: usize,
    pub discard: usize,
}

/// The two channels serving one serial link and their current configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelPair {
    tx: ChannelHandle,
    rx: ChannelHandle,
    tx_config: ChannelConfig,
    rx_config: ChannelConfig,
}

impl ChannelPair {
    /// Claim two channels, build their base configuration and hook up the
    /// completion interrupt.
    ///
    /// Both channels move bytes and are paced by the link's DREQ lines. The
    /// FIFO side never increments; the memory side starts out pointing at the
    /// placeholders. Only the RX channel raises DMA_IRQ_0: it is the last one
    /// to finish, so its completion means the whole exchange is done.
    pub(crate) fn configure<D, I>(
        dma: &D,
        irq: &I,
        link: &SpiConfig,
        placeholders: Placeholders,
        handler: IrqHandler,
    ) -> Result<Self, Error>
    where
        D: DmaController,
        I: InterruptLine,
    {
        let tx = dma.claim_unused_channel().ok_or(Error::NoFreeChannel)?;
        let rx = match dma.claim_unused_channel() {
            Some(rx) => rx,
            None => {
                dma.unclaim(tx);
                return Err(Error::NoFreeChannel);
            }
        };
        let fifo = link.instance.data_register();

        let pair = ChannelPair {
            tx,
            rx,
            tx_config: ChannelConfig {
                data_size: DataSize::Byte,
                incr_read: false,
                incr_write: false,
                treq: link.instance.tx_dreq(),
                read_addr: placeholders.fill,
                write_addr: fifo,
            },
            rx_config: ChannelConfig {
                data_size: DataSize::Byte,
                incr_read: false,
                incr_write: false,
                treq: link.instance.rx_dreq(),
                read_addr: fifo,
                write_addr: placeholders.discard,
            },
        };

        dma.acknowledge_irq0(rx);
        dma.set_irq0_enabled(rx, true);
        irq.install(handler);
        irq.set_lowest_priority();
        irq.enable();

        Ok(pair)
    }

    /// Point the memory side of both channels at the request's buffers.
    ///
    /// A missing buffer is replaced by its placeholder and that address stops
    /// incrementing, so "don't care" directions need no separate code path.
    pub(crate) fn rebind(&mut self, request: &mut TransferRequest<'_>, placeholders: Placeholders) {
        match request.send {
            Some(send) => {
                self.tx_config.read_addr = send.as_ptr() as usize;
                self.tx_config.incr_read = true;
            }
            None => {
                self.tx_config.read_addr = placeholders.fill;
                self.tx_config.incr_read = false;
            }
        }
        match request.recv.as_mut() {
            Some(recv) => {
                self.rx_config.write_addr = recv.as_mut_ptr() as usize;
                self.rx_config.incr_write = true;
            }
            None => {
                self.rx_config.write_addr = placeholders.discard;
                self.rx_config.incr_write = false;
            }
        }
    }

    /// Write both configurations and the transfer count. Nothing starts yet.
    pub(crate) fn load<D: DmaController>(&self, dma: &D, count: u32) {
        dma.load(self.tx, &self.tx_config, count);
        dma.load(self.rx, &self.rx_config, count);
    }

    /// `MULTI_CHAN_TRIGGER` value starting both channels.
    pub fn trigger_mask(&self) -> u32 {
        self.tx.mask() | self.rx.mask()
    }

    /// Memory to FIFO channel.
    pub fn tx(&self) -> ChannelHandle {
        self.tx
    }

    /// FIFO to memory channel.
    pub fn rx(&self) -> ChannelHandle {
        self.rx
    }

    /// Current configuration of the TX channel.
    pub fn tx_config(&self) -> &ChannelConfig {
        &self.tx_config
    }

    /// Current configuration of the RX channel.
    pub fn rx_config(&self) -> &ChannelConfig {
        &self.rx_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDma, SimIrq};
    use crate::spi::{SpiInstance, SpiPins};
    use fugit::RateExtU32;

    const PLACEHOLDERS: Placeholders = Placeholders {
        fill: 0x1000,
        discard: 0x2000,
    };

    extern "C" fn no_op() {}

    fn link() -> SpiConfig {
        SpiConfig::new(
            SpiInstance::Spi1,
            SpiPins {
                sck: 10,
                mosi: 11,
                miso: 12,
            },
            12_500_000u32.Hz(),
        )
    }

    #[test]
    fn configure_builds_fifo_facing_configs() {
        let irq = SimIrq::new();
        let dma = SimDma::new(irq.clone());
        let pair = ChannelPair::configure(&dma, &irq, &link(), PLACEHOLDERS, no_op).unwrap();

        assert_ne!(pair.tx(), pair.rx());
        assert_eq!(pair.tx_config().write_addr, SpiInstance::Spi1.data_register());
        assert_eq!(pair.tx_config().read_addr, PLACEHOLDERS.fill);
        assert_eq!(pair.tx_config().treq, SpiInstance::Spi1.tx_dreq());
        assert_eq!(pair.rx_config().read_addr, SpiInstance::Spi1.data_register());
        assert_eq!(pair.rx_config().write_addr, PLACEHOLDERS.discard);
        assert_eq!(pair.rx_config().treq, SpiInstance::Spi1.rx_dreq());
        for config in [pair.tx_config(), pair.rx_config()] {
            assert_eq!(config.data_size, DataSize::Byte);
            assert!(!config.incr_read);
            assert!(!config.incr_write);
        }

        assert!(dma.irq0_enabled(pair.rx()));
        assert!(!dma.irq0_enabled(pair.tx()));
        assert!(irq.is_installed());
        assert!(irq.is_lowest_priority());
        assert!(irq.is_enabled());
    }

    #[test]
    fn configure_gives_channel_back_when_only_one_is_free() {
        let irq = SimIrq::new();
        let dma = SimDma::new(irq.clone());
        let hogged: Vec<_> = (0..11).map(|_| dma.claim_unused_channel().unwrap()).collect();
        assert_eq!(hogged.len(), 11);

        let result = ChannelPair::configure(&dma, &irq, &link(), PLACEHOLDERS, no_op);
        assert_eq!(result, Err(Error::NoFreeChannel));
        assert!(dma.claim_unused_channel().is_some());
        assert!(!irq.is_installed());
    }

    #[test]
    fn rebind_increments_only_real_buffers() {
        let irq = SimIrq::new();
        let dma = SimDma::new(irq.clone());
        let mut pair = ChannelPair::configure(&dma, &irq, &link(), PLACEHOLDERS, no_op).unwrap();
        let fifo = SpiInstance::Spi1.data_register();

        let send = [1u8, 2, 3, 4];
        let mut request = TransferRequest::new(Some(&send[..]), None, send.len());
        pair.rebind(&mut request, PLACEHOLDERS);
        assert_eq!(pair.tx_config().read_addr, send.as_ptr() as usize);
        assert!(pair.tx_config().incr_read);
        assert_eq!(pair.rx_config().write_addr, PLACEHOLDERS.discard);
        assert!(!pair.rx_config().incr_write);

        let mut recv = [0u8; 4];
        let recv_addr = recv.as_ptr() as usize;
        let mut request = TransferRequest::new(None, Some(&mut recv[..]), 4);
        pair.rebind(&mut request, PLACEHOLDERS);
        assert_eq!(pair.tx_config().read_addr, PLACEHOLDERS.fill);
        assert!(!pair.tx_config().incr_read);
        assert_eq!(pair.rx_config().write_addr, recv_addr);
        assert!(pair.rx_config().incr_write);

        // The FIFO side is never touched.
        assert_eq!(pair.tx_config().write_addr, fifo);
        assert!(!pair.tx_config().incr_write);
        assert_eq!(pair.rx_config().read_addr, fifo);
        assert!(!pair.rx_config().incr_read);
    }

    #[test]
    fn request_checks() {
        let send = [0u8; 8];
        let mut recv = [0u8; 4];
        assert!(TransferRequest::new(Some(&send[..]), None, 8).buffers_fit());
        assert!(!TransferRequest::new(Some(&send[..]), Some(&mut recv[..]), 8).buffers_fit());
        assert!(!TransferRequest::new(None, None, 1).has_buffer());
        assert!(TransferRequest::new(None, None, 0).is_empty());
    }
}
