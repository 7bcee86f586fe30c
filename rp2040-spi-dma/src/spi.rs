//! Serial Peripheral Interface (SPI) link description.
//!
//! [`SpiConfig`] is the static half of a peripheral descriptor: which PL022
//! instance, which pins, which clock rate and mode. The DMA channel pair is
//! derived from it (DREQ numbers and the SSPDR FIFO address).
//!
//! On ARM targets [`Rp2040Spi`] brings the SSP block up for DMA use. See
//! [Chapter 4 Section 4](https://datasheets.raspberrypi.org/rp2040/rp2040-datasheet.pdf) for more details

use embedded_hal::spi::Mode;
use fugit::{HertzU32, RateExtU32};

use crate::dma::{DREQ_SPI0_RX, DREQ_SPI0_TX, DREQ_SPI1_RX, DREQ_SPI1_TX};

/// Offset of SSPDR, the data register in front of both FIFOs.
const SSPDR_OFFSET: usize = 0x08;

/// One of the two PL022 SSP blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiInstance {
    /// SPI0, base address 0x4003_c000
    Spi0,
    /// SPI1, base address 0x4004_0000
    Spi1,
}

impl SpiInstance {
    /// Index of the peripheral.
    pub const fn id(self) -> u8 {
        match self {
            SpiInstance::Spi0 => 0,
            SpiInstance::Spi1 => 1,
        }
    }

    /// Base address of the register block.
    pub const fn base_address(self) -> usize {
        match self {
            SpiInstance::Spi0 => 0x4003_c000,
            SpiInstance::Spi1 => 0x4004_0000,
        }
    }

    /// Address of the data register. Writes push the TX FIFO, reads pop the RX FIFO.
    pub const fn data_register(self) -> usize {
        self.base_address() + SSPDR_OFFSET
    }

    /// The DREQ number for which TX DMA requests are triggered.
    pub const fn tx_dreq(self) -> u8 {
        match self {
            SpiInstance::Spi0 => DREQ_SPI0_TX,
            SpiInstance::Spi1 => DREQ_SPI1_TX,
        }
    }

    /// The DREQ number for which RX DMA requests are triggered.
    pub const fn rx_dreq(self) -> u8 {
        match self {
            SpiInstance::Spi0 => DREQ_SPI0_RX,
            SpiInstance::Spi1 => DREQ_SPI1_RX,
        }
    }
}

/// GPIO numbers wired to the SPI function. Pin muxing itself is left to the
/// application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiPins {
    /// Clock
    pub sck: u8,
    /// Controller out, peripheral in
    pub mosi: u8,
    /// Controller in, peripheral out
    pub miso: u8,
}

/// Static configuration of a serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiConfig {
    /// Hardware instance.
    pub instance: SpiInstance,
    /// Pin assignment.
    pub pins: SpiPins,
    /// Requested clock rate.
    pub baudrate: HertzU32,
    /// Clock polarity and phase.
    pub mode: Mode,
}

impl SpiConfig {
    /// Motorola SPI mode 0 at `baudrate`.
    pub const fn new(instance: SpiInstance, pins: SpiPins, baudrate: HertzU32) -> Self {
        SpiConfig {
            instance,
            pins,
            baudrate,
            mode: embedded_hal::spi::MODE_0,
        }
    }

    /// Use a different clock polarity and phase.
    pub const fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// Pick the SSP clock dividers for `baudrate`.
///
/// Returns `(prescale, postdiv)` where `prescale` is the smallest even value in
/// 2..=254 that brings the output into range of the post-divider, and `postdiv`
/// is the largest value in 1..=255 for which `peri_frequency / (prescale *
/// postdiv)` still exceeds the request. The hardware divides by `postdiv + 1`,
/// see [`achieved_baud`].
pub fn baud_dividers(peri_frequency: HertzU32, baudrate: HertzU32) -> (u8, u8) {
    let freq_in = peri_frequency.to_Hz();
    let baudrate = baudrate.to_Hz();
    let mut prescale: u8 = u8::MAX;
    let mut postdiv: u8 = 0;

    for prescale_option in (2u32..=254).step_by(2) {
        // Invalid prescale values can overflow with a high baudrate; those
        // exceed any sys_clk anyway, so saturating is fine.
        if freq_in < ((prescale_option + 2) * 256).saturating_mul(baudrate) {
            prescale = prescale_option as u8;
            break;
        }
    }

    // Not found: the clock cannot be divided down enough, stay at max.
    debug_assert_ne!(prescale, u8::MAX);

    for postdiv_option in (1..=255u8).rev() {
        if freq_in / (prescale as u32 * postdiv_option as u32) > baudrate {
            postdiv = postdiv_option;
            break;
        }
    }

    (prescale, postdiv)
}

/// Clock rate produced by the given dividers.
pub fn achieved_baud(peri_frequency: HertzU32, prescale: u8, postdiv: u8) -> HertzU32 {
    (peri_frequency.to_Hz() / (prescale as u32 * (1 + postdiv as u32))).Hz()
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use self::rp2040::Rp2040Spi;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod rp2040 {
    use embedded_hal::spi::{Phase, Polarity};
    use fugit::HertzU32;
    use rp2040_pac as pac;

    use super::{achieved_baud, baud_dividers, SpiConfig, SpiInstance};

    /// An SSP block configured as an 8-bit SPI controller with both DREQs enabled.
    pub struct Rp2040Spi {
        instance: SpiInstance,
        baudrate: HertzU32,
    }

    impl Rp2040Spi {
        /// Reset the SSP block selected by `config` and bring it up.
        pub fn new(resets: &mut pac::RESETS, peri_frequency: HertzU32, config: &SpiConfig) -> Self {
            let instance = config.instance;
            resets.reset().modify(|_, w| match instance {
                SpiInstance::Spi0 => w.spi0().set_bit(),
                SpiInstance::Spi1 => w.spi1().set_bit(),
            });
            resets.reset().modify(|_, w| match instance {
                SpiInstance::Spi0 => w.spi0().clear_bit(),
                SpiInstance::Spi1 => w.spi1().clear_bit(),
            });
            while match instance {
                SpiInstance::Spi0 => resets.reset_done().read().spi0().bit_is_clear(),
                SpiInstance::Spi1 => resets.reset_done().read().spi1().bit_is_clear(),
            } {}

            let device = Self::regs(instance);
            let (prescale, postdiv) = baud_dividers(peri_frequency, config.baudrate);
            device
                .sspcpsr()
                .write(|w| unsafe { w.cpsdvsr().bits(prescale) });
            device.sspcr0().modify(|_, w| unsafe {
                w.scr()
                    .bits(postdiv)
                    .dss()
                    .bits(8 - 1)
                    .frf()
                    .bits(0x00)
                    .spo()
                    .bit(config.mode.polarity == Polarity::IdleHigh)
                    .sph()
                    .bit(config.mode.phase == Phase::CaptureOnSecondTransition)
            });
            // Controller mode.
            device.sspcr1().modify(|_, w| w.ms().clear_bit());
            // Always enable DREQ signals -- harmless if DMA is not listening
            device
                .sspdmacr()
                .modify(|_, w| w.txdmae().set_bit().rxdmae().set_bit());
            device.sspcr1().modify(|_, w| w.sse().set_bit());

            Rp2040Spi {
                instance,
                baudrate: achieved_baud(peri_frequency, prescale, postdiv),
            }
        }

        fn regs(instance: SpiInstance) -> &'static pac::spi0::RegisterBlock {
            // Safety: SPI1 shares the SPI0 register layout; the driver only
            // touches the block it was created for.
            unsafe {
                match instance {
                    SpiInstance::Spi0 => &*pac::SPI0::ptr(),
                    SpiInstance::Spi1 => &*(pac::SPI1::ptr() as *const pac::spi0::RegisterBlock),
                }
            }
        }

        /// Clock rate the dividers produce.
        pub fn baudrate(&self) -> HertzU32 {
            self.baudrate
        }

        /// Check if the SSP is busy transmitting and/or receiving
        pub fn is_busy(&self) -> bool {
            Self::regs(self.instance).sspsr().read().bsy().bit_is_set()
        }
    }
}
