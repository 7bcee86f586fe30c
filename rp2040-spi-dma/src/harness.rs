//! Loopback soak test.
//!
//! Each test task owns a TX and an RX buffer and loops: fill TX from the
//! pattern generator, exchange it over the link, check the result. With MOSI
//! wired to MISO the RX buffer must come back equal to TX. Several tasks
//! running this against one link exercise the access gate and the interrupt
//! handoff under contention. Any mismatch goes through the fail-halt path with
//! a dump of the offending buffer and the expected bytes.

use core::fmt::Write;

use embedded_hal::digital::OutputPin;

use crate::descriptor::SpiDma;
use crate::diag::{Diagnostics, NoTrigger};
use crate::dma::{DmaController, InterruptLine};
use crate::pattern;
use crate::rtos::Rtos;
use crate::{fail, fatal_assert, task_print, Error};

/// One task's share of the soak test.
pub struct LoopbackTest<'t, 'a, R: Rtos, D, I, W, P = NoTrigger> {
    link: &'t SpiDma<'a, R, D, I>,
    diag: &'t Diagnostics<'a, R, W, P>,
    task_no: u32,
}

impl<'t, 'a, R, D, I, W, P> LoopbackTest<'t, 'a, R, D, I, W, P>
where
    R: Rtos,
    D: DmaController,
    I: InterruptLine,
    W: Write + Send,
    P: OutputPin + Send,
{
    /// Test number `task_no` on `link`, reporting to `diag`.
    pub fn new(link: &'t SpiDma<'a, R, D, I>, diag: &'t Diagnostics<'a, R, W, P>, task_no: u32) -> Self {
        LoopbackTest {
            link,
            diag,
            task_no,
        }
    }

    /// Pattern seed of `iteration`. Neighbouring tasks reuse each other's
    /// seeds one iteration apart.
    pub fn seed(&self, iteration: u32) -> u32 {
        self.task_no.wrapping_add(iteration)
    }

    /// One fill, exchange and check round. Returns only on success or
    /// timeout; a mismatch halts.
    pub fn run_iteration(&self, iteration: u32, tx: &mut [u8], rx: &mut [u8]) -> Result<(), Error> {
        let console = self.diag.console();
        let len = tx.len();
        fatal_assert!(self.diag, rx.len() == len);

        let seed = self.seed(iteration);
        pattern::fill(tx, seed);

        self.link.lock();
        let result = self.link.transfer(Some(&*tx), Some(&mut *rx), len);
        self.link.unlock();
        result?;

        task_print!(console, "Done. Checking...");
        // The engine must not write to the send buffer.
        if let Some(m) = pattern::first_mismatch(tx, seed) {
            fail!(
                self.diag,
                ("txbuf", &*tx, Some(seed)),
                "Mismatch at {}/{}: expected {:02x}, got {:02x}\n",
                m.index,
                len,
                m.expected,
                m.actual
            )
        }
        if let Some(m) = pattern::first_mismatch(rx, seed) {
            fail!(
                self.diag,
                ("rxbuf", &*rx, Some(seed)),
                "Mismatch at {}/{}: expected {:02x}, got {:02x}\n",
                m.index,
                len,
                m.expected,
                m.actual
            )
        }
        if let Some(m) = pattern::first_difference(tx.iter().copied(), rx) {
            console.hexdump_8("txbuf", tx);
            fail!(
                self.diag,
                ("rxbuf", &*rx, Some(seed)),
                "Mismatch at {}/{}: expected {:02x}, got {:02x}\n",
                m.index,
                len,
                m.expected,
                m.actual
            )
        }

        task_print!(console, "All good\n");
        if let Some(words) = self.link.rtos().stack_high_water_mark() {
            task_print!(console, "Stack High Water Mark: {}\n", words);
        }
        Ok(())
    }

    /// Run iterations until a transfer times out.
    pub fn run(&self, tx: &mut [u8], rx: &mut [u8]) -> Error {
        task_print!(self.diag.console(), "loopback(task_no={})\n", self.task_no);
        let mut iteration: u32 = 0;
        loop {
            if let Err(e) = self.run_iteration(iteration, tx, rx) {
                return e;
            }
            iteration = iteration.wrapping_add(1);
        }
    }
}
