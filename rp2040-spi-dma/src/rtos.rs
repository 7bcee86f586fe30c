//! Scheduler interface.
//!
//! The engine does not ship a scheduler. It runs under whatever preemptive,
//! priority based kernel the application uses (FreeRTOS through bindings, a
//! Rust kernel, or the host [`sim`](crate::sim) backend) and talks to it
//! through [`Rtos`]. The trait mirrors the handful of kernel services the
//! engine needs: task identity, direct-to-task notifications usable from an
//! interrupt, a recursive lock and the ability to stop every task.

use core::fmt::Debug;

use fugit::MillisDurationU32;

/// A lock that the owning task may take more than once.
///
/// `lock` must block the calling task (not spin) until the lock is free or the
/// timeout expires, and must succeed immediately when the calling task already
/// holds it. Each successful `lock` is paired with one `unlock`.
pub trait RecursiveLock: Sync {
    /// Take the lock, waiting at most `timeout` (`None` waits forever).
    ///
    /// Returns `false` if the timeout expired.
    fn lock(&self, timeout: Option<MillisDurationU32>) -> bool;

    /// Release one level of the lock. Returns `false` if the calling task
    /// does not hold it.
    fn unlock(&self) -> bool;
}

/// Services the transfer engine needs from the task scheduler.
pub trait Rtos: Sync {
    /// Identity of a task. Must be cheap to copy and compare.
    type TaskId: Copy + Eq + Debug + Send;

    /// Lock type handed out by [`Rtos::create_recursive_lock`].
    type Lock: RecursiveLock + Send;

    /// The task that is currently running.
    fn current_task(&self) -> Self::TaskId;

    /// Human readable task name, used to prefix console output.
    fn task_name(&self, task: Self::TaskId) -> &str;

    /// Create a recursive lock. Called at most once per lock site.
    fn create_recursive_lock(&self) -> Self::Lock;

    /// Post a notification to `task` from interrupt context.
    ///
    /// Must not block or allocate. Returns `true` if the woken task has a
    /// higher priority than the one that was interrupted.
    fn notify_from_isr(&self, task: Self::TaskId) -> bool;

    /// Request a context switch on interrupt exit if `higher_priority_woken`.
    fn yield_from_isr(&self, higher_priority_woken: bool);

    /// Block the current task until it has a pending notification or until
    /// `timeout` expires, clearing the notification.
    ///
    /// A zero timeout only drains a stale notification. Returns `true` if a
    /// notification was consumed.
    fn take_notification(&self, timeout: MillisDurationU32) -> bool;

    /// Stop every other task from being scheduled.
    fn suspend_all(&self);

    /// Smallest amount of free stack the current task has had, in words, if
    /// the kernel tracks it.
    fn stack_high_water_mark(&self) -> Option<u32> {
        None
    }
}
