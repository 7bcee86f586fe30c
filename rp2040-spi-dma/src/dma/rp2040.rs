//! RP2040 register backend.
//!
//! [`Rp2040Dma`] drives the DMA block directly. [`DmaIrq0`] installs the
//! completion handler by switching the core to a RAM copy of its vector table
//! (VTOR) and configures DMA_IRQ_0 in the NVIC.

use core::cell::{Cell, UnsafeCell};
use core::ptr::{read_volatile, write_volatile};

use cortex_m::peripheral::NVIC;
use critical_section::Mutex;
use rp2040_pac as pac;

use super::{ChannelConfig, ChannelHandle, DmaController, InterruptLine, IrqHandler, CHANNEL_COUNT};

/// Atomic set alias of an RP2040 peripheral register.
///
/// See [section 2.1.2 of the RP2040 datasheet][section_2_1_2].
///
/// [section_2_1_2]: https://datasheets.raspberrypi.com/rp2040/rp2040-datasheet.pdf#atomic-rwtype
#[inline]
unsafe fn write_bitmask_set(register: *mut u32, bits: u32) {
    write_volatile((register as usize + 0x2000) as *mut u32, bits);
}

/// Atomic clear alias, see [`write_bitmask_set`].
#[inline]
unsafe fn write_bitmask_clear(register: *mut u32, bits: u32) {
    write_volatile((register as usize + 0x3000) as *mut u32, bits);
}

fn regs() -> &'static pac::dma::RegisterBlock {
    // Safety: every write below touches only the channels or bits the caller
    // claimed, or goes through an atomic alias.
    unsafe { &*pac::DMA::ptr() }
}

/// The DMA block of the RP2040.
///
/// Channel ownership is tracked here, so every user of the DMA block in the
/// program must claim its channels through the same instance.
pub struct Rp2040Dma {
    claimed: Mutex<Cell<u16>>,
}

impl Rp2040Dma {
    /// No channels claimed.
    pub const fn new() -> Self {
        Rp2040Dma {
            claimed: Mutex::new(Cell::new(0)),
        }
    }

    /// Take the DMA block out of reset.
    pub fn bring_up(&self, resets: &mut pac::RESETS) {
        resets.reset().modify(|_, w| w.dma().clear_bit());
        while resets.reset_done().read().dma().bit_is_clear() {}
    }
}

impl Default for Rp2040Dma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaController for Rp2040Dma {
    fn claim_unused_channel(&self) -> Option<ChannelHandle> {
        critical_section::with(|cs| {
            let claimed = self.claimed.borrow(cs);
            let index = (0..CHANNEL_COUNT).find(|i| claimed.get() & (1 << i) == 0)?;
            claimed.set(claimed.get() | 1 << index);
            Some(ChannelHandle::new(index))
        })
    }

    fn unclaim(&self, ch: ChannelHandle) {
        critical_section::with(|cs| {
            let claimed = self.claimed.borrow(cs);
            claimed.set(claimed.get() & !(1 << ch.index()));
        });
    }

    fn load(&self, ch: ChannelHandle, config: &ChannelConfig, count: u32) {
        let regs = regs().ch(ch.index() as usize);
        regs.ch_read_addr()
            .write(|w| unsafe { w.bits(config.read_addr as u32) });
        regs.ch_write_addr()
            .write(|w| unsafe { w.bits(config.write_addr as u32) });
        regs.ch_trans_count().write(|w| unsafe { w.bits(count) });
        // AL1_CTRL is the non-triggering alias.
        regs.ch_al1_ctrl()
            .write(|w| unsafe { w.bits(config.ctrl_word(ch)) });
    }

    fn trigger(&self, mask: u32) {
        regs().multi_chan_trigger().write(|w| unsafe { w.bits(mask) });
    }

    fn abort(&self, mask: u32) {
        // RP2040-E13: an abort can raise a spurious completion on channels
        // whose interrupt is enabled; the caller masks and acknowledges.
        regs().chan_abort().write(|w| unsafe { w.bits(mask) });
        while regs().chan_abort().read().bits() & mask != 0 {}
    }

    fn is_busy(&self, ch: ChannelHandle) -> bool {
        regs()
            .ch(ch.index() as usize)
            .ch_ctrl_trig()
            .read()
            .busy()
            .bit_is_set()
    }

    fn set_irq0_enabled(&self, ch: ChannelHandle, enabled: bool) {
        let inte0 = regs().inte0().as_ptr();
        // Safety: INTE0 provides atomic aliases; only this channel's bit changes.
        unsafe {
            if enabled {
                write_bitmask_set(inte0, ch.mask());
            } else {
                write_bitmask_clear(inte0, ch.mask());
            }
        }
    }

    fn acknowledge_irq0(&self, ch: ChannelHandle) -> bool {
        let status = regs().ints0().read().bits();
        if status & ch.mask() != 0 {
            // Write one to clear; other channels' bits are untouched.
            regs().ints0().write(|w| unsafe { w.bits(ch.mask()) });
            true
        } else {
            false
        }
    }
}

/// Entry for a Vector in the Interrupt Vector Table.
#[derive(Clone, Copy)]
union Vector {
    handler: extern "C" fn(),
    reserved: usize,
}

/// SP + Reset vector + 14 exceptions + 32 interrupts
const VECTOR_COUNT: usize = 48;

/// The VTOR register can only point to 256 byte offsets.
#[repr(C, align(256))]
struct VectorTable {
    table: [Vector; VECTOR_COUNT],
}

/// DMA_IRQ_0 on the core that calls [`InterruptLine::install`].
pub struct DmaIrq0 {
    table: UnsafeCell<VectorTable>,
}

// Safety: the table is only written inside a critical section, and only
// the hardware reads it.
unsafe impl Sync for DmaIrq0 {}

/// NVIC priority byte; the RP2040 implements the top two bits.
const LOWEST_PRIORITY: u8 = 0xc0;

impl DmaIrq0 {
    /// The line, untouched. Must not move once installed: the core keeps
    /// pointing at the table inside.
    pub const fn new() -> Self {
        DmaIrq0 {
            table: UnsafeCell::new(VectorTable {
                table: [Vector { reserved: 0 }; VECTOR_COUNT],
            }),
        }
    }
}

impl Default for DmaIrq0 {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptLine for DmaIrq0 {
    fn install(&self, handler: IrqHandler) {
        critical_section::with(|_| {
            // Safety: PPB is core-local; VTOR is only changed here.
            let ppb = unsafe { &*pac::PPB::ptr() };
            let table = self.table.get();
            let current = ppb.vtor().read().bits() as *const usize;
            // Safety: `current` is the active vector table, `table` is ours
            // and nobody else writes it.
            unsafe {
                if current as usize != table as usize {
                    for (i, vector) in (*table).table.iter_mut().enumerate() {
                        vector.reserved = read_volatile(current.add(i));
                    }
                }
                (*table).table[16 + pac::Interrupt::DMA_IRQ_0 as usize].handler = handler;
                ppb.vtor().write(|w| w.bits(table as u32));
            }
        });
    }

    fn set_lowest_priority(&self) {
        // Safety: only the priority of our own line changes.
        unsafe {
            let mut peripherals = cortex_m::Peripherals::steal();
            peripherals
                .NVIC
                .set_priority(pac::Interrupt::DMA_IRQ_0, LOWEST_PRIORITY);
        }
    }

    fn enable(&self) {
        NVIC::unpend(pac::Interrupt::DMA_IRQ_0);
        // Safety: the handler is installed before the line is unmasked.
        unsafe { NVIC::unmask(pac::Interrupt::DMA_IRQ_0) };
    }
}
