//! Host simulation of the scheduler, the DMA block and the interrupt line.
//!
//! Good enough to run the transfer engine and its failure paths in unit tests:
//!
//! - [`SimRtos`]: tasks are OS threads started through [`SimRtos::spawn`];
//!   the thread that created the scheduler is the task `main`. Notifications
//!   and recursive locks are mutex/condvar pairs.
//! - [`SimDma`]: twelve channels. A trigger hands the started channels to a
//!   "hardware" thread that moves the data, then raises the completion
//!   interrupt. Both SSPDR addresses behave as one loopback FIFO, so whatever
//!   the TX channel writes the RX channel reads back, like a SPI block with
//!   MOSI wired to MISO. Everything else is treated as memory.
//! - [`SimIrq`]: calls the installed handler on the hardware thread.
//!
//! Fault injection: [`SimDma::withhold_interrupt`], [`SimDma::set_latency`]
//! and [`SimDma::corrupt_next_transfer`]. Every load, trigger and abort is
//! recorded as a [`SimEvent`].

use core::convert::Infallible;
use core::fmt;

use std::boxed::Box;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::string::String;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::thread_local;
use std::time::{Duration, Instant};
use std::vec::Vec;

use embedded_hal::digital::{ErrorType, OutputPin};
use fugit::MillisDurationU32;

use crate::dma::{
    ChannelConfig, ChannelHandle, DmaController, InterruptLine, IrqHandler, CHANNEL_COUNT,
};
use crate::rtos::{RecursiveLock, Rtos};
use crate::spi::SpiInstance;

/// A panicking task poisons nothing we care about.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn duration(timeout: MillisDurationU32) -> Duration {
    Duration::from_millis(timeout.to_millis() as u64)
}

static NEXT_SCHEDULER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// (scheduler, task) pairs this thread runs as.
    static CURRENT: RefCell<Vec<(usize, SimTaskId)>> = const { RefCell::new(Vec::new()) };
}

/// Task identity in a [`SimRtos`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimTaskId(usize);

impl SimTaskId {
    /// The task that created the scheduler.
    pub const MAIN: SimTaskId = SimTaskId(0);
}

fn current_task_of(scheduler: usize) -> SimTaskId {
    CURRENT.with(|current| {
        current
            .borrow()
            .iter()
            .find(|(id, _)| *id == scheduler)
            .map_or(SimTaskId::MAIN, |(_, task)| *task)
    })
}

struct Task {
    name: &'static str,
    notifications: Mutex<u32>,
    notified: Condvar,
}

struct RtosInner {
    id: usize,
    tasks: Mutex<Vec<Arc<Task>>>,
    suspended: AtomicBool,
    locks_created: AtomicUsize,
    notifications_sent: AtomicUsize,
    yields: AtomicUsize,
    high_water_mark: Mutex<Option<u32>>,
}

/// Thread-backed scheduler.
pub struct SimRtos {
    inner: Arc<RtosInner>,
}

impl SimRtos {
    /// A scheduler whose only task is the calling thread, named `main`.
    pub fn new() -> Self {
        let main = Arc::new(Task {
            name: "main",
            notifications: Mutex::new(0),
            notified: Condvar::new(),
        });
        SimRtos {
            inner: Arc::new(RtosInner {
                id: NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed),
                tasks: Mutex::new(std::vec![main]),
                suspended: AtomicBool::new(false),
                locks_created: AtomicUsize::new(0),
                notifications_sent: AtomicUsize::new(0),
                yields: AtomicUsize::new(0),
                high_water_mark: Mutex::new(None),
            }),
        }
    }

    /// A scheduler living for the rest of the test binary, for tests that
    /// hand it to spawned tasks.
    pub fn leak() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    /// Start a task named `name` running `f` on its own thread.
    pub fn spawn<F, T>(&self, name: &'static str, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let task = {
            let mut tasks = lock(&self.inner.tasks);
            tasks.push(Arc::new(Task {
                name,
                notifications: Mutex::new(0),
                notified: Condvar::new(),
            }));
            SimTaskId(tasks.len() - 1)
        };
        let scheduler = self.inner.id;
        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                CURRENT.with(|current| current.borrow_mut().push((scheduler, task)));
                f()
            })
            .unwrap_or_else(|e| panic!("cannot spawn task {}: {}", name, e))
    }

    fn task(&self, task: SimTaskId) -> Arc<Task> {
        lock(&self.inner.tasks)[task.0].clone()
    }

    /// Has [`Rtos::suspend_all`] been called?
    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    /// Number of recursive locks handed out.
    pub fn locks_created(&self) -> usize {
        self.inner.locks_created.load(Ordering::SeqCst)
    }

    /// Number of notifications posted from interrupt context.
    pub fn notifications_sent(&self) -> usize {
        self.inner.notifications_sent.load(Ordering::SeqCst)
    }

    /// Number of yield requests from interrupt context.
    pub fn yields(&self) -> usize {
        self.inner.yields.load(Ordering::SeqCst)
    }

    /// Value reported by [`Rtos::stack_high_water_mark`].
    pub fn set_stack_high_water_mark(&self, words: Option<u32>) {
        *lock(&self.inner.high_water_mark) = words;
    }
}

impl Default for SimRtos {
    fn default() -> Self {
        Self::new()
    }
}

impl Rtos for SimRtos {
    type TaskId = SimTaskId;
    type Lock = SimLock;

    fn current_task(&self) -> SimTaskId {
        current_task_of(self.inner.id)
    }

    fn task_name(&self, task: SimTaskId) -> &str {
        self.task(task).name
    }

    fn create_recursive_lock(&self) -> SimLock {
        self.inner.locks_created.fetch_add(1, Ordering::SeqCst);
        SimLock {
            scheduler: self.inner.id,
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }

    fn notify_from_isr(&self, task: SimTaskId) -> bool {
        let task = self.task(task);
        *lock(&task.notifications) += 1;
        task.notified.notify_all();
        self.inner.notifications_sent.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn yield_from_isr(&self, _higher_priority_woken: bool) {
        self.inner.yields.fetch_add(1, Ordering::SeqCst);
    }

    fn take_notification(&self, timeout: MillisDurationU32) -> bool {
        let task = self.task(self.current_task());
        let pending = lock(&task.notifications);
        let (mut pending, _) = task
            .notified
            .wait_timeout_while(pending, duration(timeout), |count| *count == 0)
            .unwrap_or_else(PoisonError::into_inner);
        let taken = *pending > 0;
        *pending = 0;
        taken
    }

    fn suspend_all(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
    }

    fn stack_high_water_mark(&self) -> Option<u32> {
        *lock(&self.inner.high_water_mark)
    }
}

struct LockState {
    owner: Option<SimTaskId>,
    depth: u32,
}

/// Recursive lock of a [`SimRtos`].
pub struct SimLock {
    scheduler: usize,
    state: Mutex<LockState>,
    released: Condvar,
}

impl RecursiveLock for SimLock {
    fn lock(&self, timeout: Option<MillisDurationU32>) -> bool {
        let me = current_task_of(self.scheduler);
        let deadline = timeout.map(|t| Instant::now() + duration(t));
        let mut state = lock(&self.state);
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return true;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return true;
                }
                Some(_) => {}
            }
            state = match deadline {
                None => self
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn unlock(&self) -> bool {
        let me = current_task_of(self.scheduler);
        let mut state = lock(&self.state);
        if state.owner != Some(me) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
        true
    }
}

struct IrqInner {
    handler: Mutex<Option<IrqHandler>>,
    lowest_priority: AtomicBool,
    enabled: AtomicBool,
    raised: AtomicUsize,
}

/// DMA_IRQ_0 of the simulation.
#[derive(Clone)]
pub struct SimIrq {
    inner: Arc<IrqInner>,
}

impl SimIrq {
    /// A masked line with no handler.
    pub fn new() -> Self {
        SimIrq {
            inner: Arc::new(IrqInner {
                handler: Mutex::new(None),
                lowest_priority: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                raised: AtomicUsize::new(0),
            }),
        }
    }

    /// Fire the line: run the handler if the line is enabled.
    pub fn raise(&self) {
        self.inner.raised.fetch_add(1, Ordering::SeqCst);
        if !self.is_enabled() {
            return;
        }
        let handler = *lock(&self.inner.handler);
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Has a handler been installed?
    pub fn is_installed(&self) -> bool {
        lock(&self.inner.handler).is_some()
    }

    /// Was the line set to the lowest priority?
    pub fn is_lowest_priority(&self) -> bool {
        self.inner.lowest_priority.load(Ordering::SeqCst)
    }

    /// Is the line unmasked?
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// How often the line fired.
    pub fn raised(&self) -> usize {
        self.inner.raised.load(Ordering::SeqCst)
    }
}

impl Default for SimIrq {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptLine for SimIrq {
    fn install(&self, handler: IrqHandler) {
        *lock(&self.inner.handler) = Some(handler);
    }

    fn set_lowest_priority(&self) {
        self.inner.lowest_priority.store(true, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
    }
}

/// Something the simulated DMA block was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// A channel was configured.
    Load {
        /// Channel
        channel: ChannelHandle,
        /// Transfer count
        count: u32,
    },
    /// `MULTI_CHAN_TRIGGER` was written.
    Trigger {
        /// Value written
        mask: u32,
    },
    /// `CHAN_ABORT` was written.
    Abort {
        /// Value written
        mask: u32,
    },
}

#[derive(Clone, Copy, Default)]
struct Channel {
    config: Option<ChannelConfig>,
    count: u32,
    busy: bool,
    /// Bumped by every trigger and abort; a hardware thread holding an older
    /// value must not touch the channel.
    generation: u32,
}

struct DmaState {
    claimed: u32,
    channels: [Channel; CHANNEL_COUNT as usize],
    inte0: u32,
    ints0: u32,
    events: Vec<SimEvent>,
}

struct DmaInner {
    state: Mutex<DmaState>,
    finished: Condvar,
    irq: SimIrq,
    withhold_interrupt: AtomicBool,
    latency: Mutex<Duration>,
    corrupt: Mutex<Option<usize>>,
}

/// Simulated DMA block wired to a loopback SPI FIFO.
#[derive(Clone)]
pub struct SimDma {
    inner: Arc<DmaInner>,
}

fn is_fifo(addr: usize) -> bool {
    addr == SpiInstance::Spi0.data_register() || addr == SpiInstance::Spi1.data_register()
}

/// The SSP FIFO with MOSI looped back to MISO.
struct Loopback {
    queue: VecDeque<u8>,
    pushed: usize,
    corrupt: Option<usize>,
}

impl Loopback {
    fn push(&mut self, byte: u8) {
        let byte = if self.corrupt == Some(self.pushed) {
            !byte
        } else {
            byte
        };
        self.pushed += 1;
        self.queue.push_back(byte);
    }

    fn pop(&mut self) -> Option<u8> {
        self.queue.pop_front()
    }
}

/// A channel as the hardware thread sees it.
struct Running {
    ch: ChannelHandle,
    generation: u32,
    read_addr: usize,
    write_addr: usize,
    incr_read: bool,
    incr_write: bool,
    remaining: u32,
}

impl Running {
    fn new(ch: ChannelHandle, generation: u32, config: &ChannelConfig, count: u32) -> Self {
        Running {
            ch,
            generation,
            read_addr: config.read_addr,
            write_addr: config.write_addr,
            incr_read: config.incr_read,
            incr_write: config.incr_write,
            remaining: count,
        }
    }

    /// Move one byte. Returns `false` if paced out by an empty FIFO.
    fn step(&mut self, fifo: &mut Loopback) -> bool {
        let byte = if is_fifo(self.read_addr) {
            match fifo.pop() {
                Some(byte) => byte,
                None => return false,
            }
        } else {
            // Safety: the engine only loads addresses of buffers that stay
            // borrowed until the channel has finished or been aborted, and
            // every step runs under the state lock that `abort` takes.
            unsafe { core::ptr::read_volatile(self.read_addr as *const u8) }
        };
        if is_fifo(self.write_addr) {
            fifo.push(byte);
        } else {
            // Safety: as above.
            unsafe { core::ptr::write_volatile(self.write_addr as *mut u8, byte) };
        }
        if self.incr_read {
            self.read_addr += 1;
        }
        if self.incr_write {
            self.write_addr += 1;
        }
        self.remaining -= 1;
        true
    }
}

impl SimDma {
    /// Twelve idle, unclaimed channels raising `irq` on completion.
    pub fn new(irq: SimIrq) -> Self {
        SimDma {
            inner: Arc::new(DmaInner {
                state: Mutex::new(DmaState {
                    claimed: 0,
                    channels: [Channel::default(); CHANNEL_COUNT as usize],
                    inte0: 0,
                    ints0: 0,
                    events: Vec::new(),
                }),
                finished: Condvar::new(),
                irq,
                withhold_interrupt: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
                corrupt: Mutex::new(None),
            }),
        }
    }

    /// Finish transfers without raising the completion interrupt.
    pub fn withhold_interrupt(&self, withhold: bool) {
        self.inner.withhold_interrupt.store(withhold, Ordering::SeqCst);
    }

    /// Delay between a trigger and the first byte moving.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// Invert the `index`th byte clocked through the FIFO by the next
    /// trigger.
    pub fn corrupt_next_transfer(&self, index: usize) {
        *lock(&self.inner.corrupt) = Some(index);
    }

    /// Is completion of `ch` routed to DMA_IRQ_0?
    pub fn irq0_enabled(&self, ch: ChannelHandle) -> bool {
        lock(&self.inner.state).inte0 & ch.mask() != 0
    }

    /// Everything the block was asked to do, oldest first.
    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.inner.state).events.clone()
    }

    /// Number of channel loads so far.
    pub fn load_count(&self) -> usize {
        lock(&self.inner.state)
            .events
            .iter()
            .filter(|e| matches!(e, SimEvent::Load { .. }))
            .count()
    }

    /// Number of claimed channels.
    pub fn claimed_count(&self) -> u32 {
        lock(&self.inner.state).claimed.count_ones()
    }

    fn run(inner: Arc<DmaInner>, mut running: Vec<Running>, corrupt: Option<usize>) {
        let latency = *lock(&inner.latency);
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        // Lockstep, lowest channel first: the TX channel fills the FIFO before
        // the RX channel of the same round drains it.
        let mut fifo = Loopback {
            queue: VecDeque::new(),
            pushed: 0,
            corrupt,
        };
        let mut state = loop {
            let state = lock(&inner.state);
            running.retain(|c| state.channels[c.ch.index() as usize].generation == c.generation);
            let mut progress = false;
            for channel in running.iter_mut().filter(|c| c.remaining > 0) {
                progress |= channel.step(&mut fifo);
            }
            if !progress {
                break state;
            }
        };

        let mut raise = false;
        for channel in running.iter().filter(|c| c.remaining == 0) {
            state.channels[channel.ch.index() as usize].busy = false;
            if state.inte0 & channel.ch.mask() != 0 {
                state.ints0 |= channel.ch.mask();
                raise = true;
            }
        }
        drop(state);
        inner.finished.notify_all();

        if raise && !inner.withhold_interrupt.load(Ordering::SeqCst) {
            inner.irq.raise();
        }
    }
}

impl DmaController for SimDma {
    fn claim_unused_channel(&self) -> Option<ChannelHandle> {
        let mut state = lock(&self.inner.state);
        let index = (0..CHANNEL_COUNT).find(|i| state.claimed & (1 << i) == 0)?;
        state.claimed |= 1 << index;
        Some(ChannelHandle::new(index))
    }

    fn unclaim(&self, ch: ChannelHandle) {
        lock(&self.inner.state).claimed &= !ch.mask();
    }

    fn load(&self, ch: ChannelHandle, config: &ChannelConfig, count: u32) {
        let mut state = lock(&self.inner.state);
        let channel = &mut state.channels[ch.index() as usize];
        channel.config = Some(*config);
        channel.count = count;
        state.events.push(SimEvent::Load { channel: ch, count });
    }

    fn trigger(&self, mask: u32) {
        let mut running = Vec::new();
        {
            let mut state = lock(&self.inner.state);
            state.events.push(SimEvent::Trigger { mask });
            for index in 0..CHANNEL_COUNT {
                let ch = ChannelHandle::new(index);
                let channel = &mut state.channels[index as usize];
                if mask & ch.mask() == 0 || channel.count == 0 {
                    continue;
                }
                if let Some(config) = channel.config {
                    channel.busy = true;
                    channel.generation = channel.generation.wrapping_add(1);
                    running.push(Running::new(ch, channel.generation, &config, channel.count));
                }
            }
        }
        if running.is_empty() {
            return;
        }
        let corrupt = lock(&self.inner.corrupt).take();
        let inner = self.inner.clone();
        thread::spawn(move || SimDma::run(inner, running, corrupt));
    }

    fn abort(&self, mask: u32) {
        {
            let mut state = lock(&self.inner.state);
            state.events.push(SimEvent::Abort { mask });
            for index in 0..CHANNEL_COUNT {
                if mask & ChannelHandle::new(index).mask() == 0 {
                    continue;
                }
                let channel = &mut state.channels[index as usize];
                channel.generation = channel.generation.wrapping_add(1);
                channel.busy = false;
            }
        }
        self.inner.finished.notify_all();
    }

    fn is_busy(&self, ch: ChannelHandle) -> bool {
        lock(&self.inner.state).channels[ch.index() as usize].busy
    }

    fn wait_for_finish_blocking(&self, ch: ChannelHandle) {
        let state = lock(&self.inner.state);
        let _state = self
            .inner
            .finished
            .wait_while(state, |s| s.channels[ch.index() as usize].busy)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn set_irq0_enabled(&self, ch: ChannelHandle, enabled: bool) {
        let mut state = lock(&self.inner.state);
        if enabled {
            state.inte0 |= ch.mask();
        } else {
            state.inte0 &= !ch.mask();
        }
    }

    fn acknowledge_irq0(&self, ch: ChannelHandle) -> bool {
        let mut state = lock(&self.inner.state);
        let pending = state.ints0 & ch.mask() != 0;
        state.ints0 &= !ch.mask();
        pending
    }
}

/// Console output collected in memory.
#[derive(Clone, Default)]
pub struct SimConsole {
    text: Arc<Mutex<String>>,
}

impl SimConsole {
    /// An empty console.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything printed so far.
    pub fn contents(&self) -> String {
        lock(&self.text).clone()
    }
}

impl fmt::Write for SimConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        lock(&self.text).push_str(s);
        Ok(())
    }
}

/// Output pin remembering its level.
#[derive(Clone, Default)]
pub struct SimPin {
    high: Arc<AtomicBool>,
}

impl SimPin {
    /// A pin driven low.
    pub fn new() -> Self {
        Self::default()
    }

    /// Is the pin driven high?
    pub fn is_high(&self) -> bool {
        self.high.load(Ordering::SeqCst)
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DataSize, DREQ_SPI0_RX, DREQ_SPI0_TX};
    use fugit::ExtU32;

    #[test]
    fn spawned_tasks_have_their_own_identity() {
        let rtos = SimRtos::leak();
        assert_eq!(rtos.current_task(), SimTaskId::MAIN);
        assert_eq!(rtos.task_name(rtos.current_task()), "main");
        let (id, name) = rtos
            .spawn("T0", move || {
                let me = rtos.current_task();
                (me, rtos.task_name(me).to_string())
            })
            .join()
            .unwrap();
        assert_ne!(id, SimTaskId::MAIN);
        assert_eq!(name, "T0");
    }

    #[test]
    fn notification_is_single_slot_and_drainable() {
        let rtos = SimRtos::new();
        let me = rtos.current_task();
        assert!(!rtos.take_notification(0.millis()));
        rtos.notify_from_isr(me);
        rtos.notify_from_isr(me);
        assert!(rtos.take_notification(0.millis()));
        assert!(!rtos.take_notification(10.millis()));
    }

    #[test]
    fn lock_times_out_for_other_task() {
        let rtos = SimRtos::leak();
        let lock: &'static SimLock = Box::leak(Box::new(rtos.create_recursive_lock()));
        assert!(lock.lock(None));
        let got = rtos
            .spawn("other", move || lock.lock(Some(20.millis())))
            .join()
            .unwrap();
        assert!(!got);
        assert!(lock.unlock());
        assert!(!lock.unlock());
    }

    #[test]
    fn loopback_copies_tx_into_rx() {
        let irq = SimIrq::new();
        let dma = SimDma::new(irq.clone());
        let tx = dma.claim_unused_channel().unwrap();
        let rx = dma.claim_unused_channel().unwrap();
        let fifo = SpiInstance::Spi0.data_register();

        let send = [5u8, 6, 7, 8];
        let mut recv = [0u8; 4];
        dma.load(
            tx,
            &ChannelConfig {
                data_size: DataSize::Byte,
                incr_read: true,
                incr_write: false,
                treq: DREQ_SPI0_TX,
                read_addr: send.as_ptr() as usize,
                write_addr: fifo,
            },
            4,
        );
        dma.load(
            rx,
            &ChannelConfig {
                data_size: DataSize::Byte,
                incr_read: false,
                incr_write: true,
                treq: DREQ_SPI0_RX,
                read_addr: fifo,
                write_addr: recv.as_mut_ptr() as usize,
            },
            4,
        );
        dma.set_irq0_enabled(rx, true);
        dma.trigger(tx.mask() | rx.mask());
        dma.wait_for_finish_blocking(tx);
        dma.wait_for_finish_blocking(rx);

        assert_eq!(recv, send);
        assert!(dma.acknowledge_irq0(rx));
        assert!(!dma.acknowledge_irq0(rx));
        assert!(!dma.acknowledge_irq0(tx));
        assert_eq!(
            dma.events().last(),
            Some(&SimEvent::Trigger {
                mask: tx.mask() | rx.mask()
            })
        );
    }

    #[test]
    fn abort_stops_channel_before_it_moves_data() {
        let irq = SimIrq::new();
        let dma = SimDma::new(irq.clone());
        let ch = dma.claim_unused_channel().unwrap();
        dma.set_latency(Duration::from_millis(100));

        let source = [0x42u8; 8];
        let mut sink = [0u8; 8];
        dma.load(
            ch,
            &ChannelConfig {
                data_size: DataSize::Byte,
                incr_read: true,
                incr_write: true,
                treq: DREQ_SPI0_TX,
                read_addr: source.as_ptr() as usize,
                write_addr: sink.as_mut_ptr() as usize,
            },
            8,
        );
        dma.set_irq0_enabled(ch, true);
        dma.trigger(ch.mask());
        assert!(dma.is_busy(ch));

        dma.abort(ch.mask());
        assert!(!dma.is_busy(ch));
        thread::sleep(Duration::from_millis(250));

        assert_eq!(sink, [0u8; 8]);
        assert!(!dma.acknowledge_irq0(ch));
        assert_eq!(irq.raised(), 0);
        assert_eq!(dma.events().last(), Some(&SimEvent::Abort { mask: ch.mask() }));
    }
}
