//! Exclusive access to a shared peripheral.
//!
//! [`AccessGate`] hands a peripheral to one task at a time. It is built on the
//! scheduler's recursive lock, so the owning task may nest `acquire` calls,
//! and it records the owning task so that transfer calls and the interrupt
//! handler can check who is driving the hardware.
//!
//! The kernel lock lives as long as the gate and is created on first use.
//! ARMv6-M has no compare-and-swap, so the lock is built inside a critical
//! section: a task that arrives while another is building it waits on the
//! critical section, never on a task that has been preempted halfway.

use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;

use crate::rtos::{RecursiveLock, Rtos};

/// Set `flag` and return its previous value.
pub(crate) fn test_and_set(flag: &AtomicBool) -> bool {
    critical_section::with(|_| {
        let was_set = flag.load(Ordering::Relaxed);
        flag.store(true, Ordering::Relaxed);
        was_set
    })
}

/// A value constructed exactly once, by whichever caller gets there first.
pub(crate) struct LazyLock<L> {
    ready: AtomicBool,
    slot: UnsafeCell<MaybeUninit<L>>,
}

// Safety: the slot is written once, before `ready` is set, and only shared
// references are handed out afterwards.
unsafe impl<L: Send + Sync> Sync for LazyLock<L> {}

impl<L> LazyLock<L> {
    pub(crate) const fn new() -> Self {
        LazyLock {
            ready: AtomicBool::new(false),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// `init` runs inside a critical section and must not block.
    pub(crate) fn get_or_init(&self, init: impl FnOnce() -> L) -> &L {
        if !self.is_initialized() {
            critical_section::with(|_| {
                if !self.ready.load(Ordering::Relaxed) {
                    // Safety: unset `ready` inside the critical section means
                    // nobody has written the slot or holds a reference to it.
                    unsafe { (*self.slot.get()).write(init()) };
                    self.ready.store(true, Ordering::Release);
                }
            });
        }
        // Safety: `ready` is set, the slot is initialized.
        unsafe { (*self.slot.get()).assume_init_ref() }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl<L> Drop for LazyLock<L> {
    fn drop(&mut self) {
        if *self.ready.get_mut() {
            // Safety: `ready` means the slot holds a value.
            unsafe { self.slot.get_mut().assume_init_drop() }
        }
    }
}

#[derive(Clone, Copy)]
struct Ownership<T> {
    owner: Option<T>,
    depth: u32,
}

/// Recursive, owner-tracking lock guarding one peripheral.
pub struct AccessGate<R: Rtos> {
    lock: LazyLock<R::Lock>,
    ownership: Mutex<Cell<Ownership<R::TaskId>>>,
}

impl<R: Rtos> AccessGate<R> {
    /// A gate nobody holds. The kernel lock is created on first `acquire`.
    pub const fn new() -> Self {
        AccessGate {
            lock: LazyLock::new(),
            ownership: Mutex::new(Cell::new(Ownership {
                owner: None,
                depth: 0,
            })),
        }
    }

    /// Block until no other task holds the gate, then record the calling task
    /// as owner. Nested calls from the owner return immediately.
    ///
    /// Returns `false` only if the kernel refused the lock.
    pub fn acquire(&self, rtos: &R) -> bool {
        let me = rtos.current_task();
        let lock = self.lock.get_or_init(|| rtos.create_recursive_lock());
        if !lock.lock(None) {
            return false;
        }
        let depth = critical_section::with(|cs| {
            let cell = self.ownership.borrow(cs);
            let mut ownership = cell.get();
            ownership.owner = Some(me);
            ownership.depth += 1;
            cell.set(ownership);
            ownership.depth
        });
        trace!("gate: acquired, depth {}", depth);
        true
    }

    /// Drop one level of ownership; the last level clears the owner and lets
    /// the next waiter in.
    ///
    /// Returns `false`, without touching the lock, if the calling task is not
    /// the owner.
    pub fn release(&self, rtos: &R) -> bool {
        let me = rtos.current_task();
        let remaining = critical_section::with(|cs| {
            let cell = self.ownership.borrow(cs);
            let mut ownership = cell.get();
            if ownership.owner != Some(me) || ownership.depth == 0 {
                return None;
            }
            ownership.depth -= 1;
            if ownership.depth == 0 {
                ownership.owner = None;
            }
            cell.set(ownership);
            Some(ownership.depth)
        });
        let Some(remaining) = remaining else {
            return false;
        };
        trace!("gate: released, depth {}", remaining);
        self.lock
            .get_or_init(|| rtos.create_recursive_lock())
            .unlock()
    }

    /// The task currently holding the gate.
    pub fn owner(&self) -> Option<R::TaskId> {
        critical_section::with(|cs| self.ownership.borrow(cs).get().owner)
    }

    /// How many times the owner has acquired the gate.
    pub fn depth(&self) -> u32 {
        critical_section::with(|cs| self.ownership.borrow(cs).get().depth)
    }

    /// Has the kernel lock been created yet?
    pub fn is_constructed(&self) -> bool {
        self.lock.is_initialized()
    }
}

impl<R: Rtos> Default for AccessGate<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRtos;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc, Barrier, Mutex as StdMutex};
    use std::time::Duration;

    #[test]
    fn test_and_set_reports_previous_value() {
        let flag = AtomicBool::new(false);
        assert!(!test_and_set(&flag));
        assert!(test_and_set(&flag));
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn lazy_lock_builds_once() {
        let built = AtomicUsize::new(0);
        let lazy: LazyLock<u32> = LazyLock::new();
        assert!(!lazy.is_initialized());
        for _ in 0..3 {
            let value = lazy.get_or_init(|| {
                built.fetch_add(1, Ordering::SeqCst);
                7
            });
            assert_eq!(*value, 7);
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(lazy.is_initialized());
    }

    #[test]
    fn lazy_lock_contended_first_use_builds_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let lazy: &'static LazyLock<usize> = Box::leak(Box::new(LazyLock::new()));
        let start = Arc::new(Barrier::new(4));

        let racers: Vec<_> = (0..4)
            .map(|_| {
                let built = built.clone();
                let start = start.clone();
                std::thread::spawn(move || {
                    start.wait();
                    let value = lazy.get_or_init(|| {
                        // Long enough for every racer to arrive mid-build.
                        std::thread::sleep(Duration::from_millis(30));
                        built.fetch_add(1, Ordering::SeqCst) + 1
                    });
                    value as *const usize as usize
                })
            })
            .collect();
        let seen: Vec<usize> = racers.into_iter().map(|r| r.join().unwrap()).collect();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(*lazy.get_or_init(|| 0), 1);
        assert!(seen.iter().all(|&addr| addr == seen[0]));
    }

    #[test]
    fn lazy_lock_is_built_within_one_critical_section() {
        let lazy: &'static LazyLock<u32> = Box::leak(Box::new(LazyLock::new()));
        let (building_tx, building_rx) = mpsc::channel();
        let builder = std::thread::spawn(move || {
            *lazy.get_or_init(|| {
                building_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                5
            })
        });
        building_rx.recv().unwrap();

        // Any other critical section waits for the build to finish.
        assert!(critical_section::with(|_| lazy.is_initialized()));
        assert_eq!(builder.join().unwrap(), 5);
    }

    #[test]
    fn first_acquire_from_several_tasks_creates_one_lock() {
        let rtos = SimRtos::leak();
        let gate: &'static AccessGate<SimRtos> = Box::leak(Box::new(AccessGate::new()));
        let start = Arc::new(Barrier::new(3));

        let tasks: Vec<_> = ["T0", "T1", "T2"]
            .into_iter()
            .map(|name| {
                let start = start.clone();
                rtos.spawn(name, move || {
                    start.wait();
                    assert!(gate.acquire(rtos));
                    assert_eq!(gate.owner(), Some(rtos.current_task()));
                    assert!(gate.release(rtos));
                })
            })
            .collect();
        for task in tasks {
            task.join().unwrap();
        }
        assert_eq!(rtos.locks_created(), 1);
        assert_eq!(gate.owner(), None);
    }

    #[test]
    fn gate_is_constructed_on_first_acquire() {
        let rtos = SimRtos::new();
        let gate = AccessGate::<SimRtos>::new();
        assert!(!gate.is_constructed());
        assert!(gate.acquire(&rtos));
        assert!(gate.is_constructed());
        assert!(gate.release(&rtos));
        assert_eq!(rtos.locks_created(), 1);
    }

    #[test]
    fn owner_can_nest() {
        let rtos = SimRtos::new();
        let gate = AccessGate::<SimRtos>::new();
        let me = rtos.current_task();

        assert!(gate.acquire(&rtos));
        assert!(gate.acquire(&rtos));
        assert_eq!(gate.owner(), Some(me));
        assert_eq!(gate.depth(), 2);

        assert!(gate.release(&rtos));
        assert_eq!(gate.owner(), Some(me));
        assert!(gate.release(&rtos));
        assert_eq!(gate.owner(), None);
        assert_eq!(gate.depth(), 0);
    }

    #[test]
    fn release_by_non_owner_is_refused() {
        let rtos = SimRtos::leak();
        let gate: &'static AccessGate<SimRtos> = Box::leak(Box::new(AccessGate::new()));
        assert!(gate.acquire(rtos));

        let refused = rtos
            .spawn("intruder", move || gate.release(rtos))
            .join()
            .unwrap();
        assert!(!refused);
        assert_eq!(gate.owner(), Some(rtos.current_task()));
        assert!(gate.release(rtos));
    }

    #[test]
    fn second_task_waits_for_release() {
        let rtos = SimRtos::leak();
        let gate: &'static AccessGate<SimRtos> = Box::leak(Box::new(AccessGate::new()));
        let events = Arc::new(StdMutex::new(Vec::new()));

        assert!(gate.acquire(rtos));
        events.lock().unwrap().push("main locked");

        let waiter = {
            let events = events.clone();
            rtos.spawn("waiter", move || {
                assert!(gate.acquire(rtos));
                events.lock().unwrap().push("waiter locked");
                assert_eq!(gate.owner(), Some(rtos.current_task()));
                assert!(gate.release(rtos));
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*events.lock().unwrap(), ["main locked"]);
        events.lock().unwrap().push("main unlocked");
        assert!(gate.release(rtos));

        waiter.join().unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            ["main locked", "main unlocked", "waiter locked"]
        );
        assert_eq!(gate.owner(), None);
    }
}
