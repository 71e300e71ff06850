// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Forces the running thread to yield at a fixed tick.
//!
//! Preemption uses a virtual interval timer, which raises `SIGVTALRM`
//! each time the process has consumed another tick of CPU time. The
//! signal handler calls [`yield_now`](crate::yield_now), exactly as if the
//! running thread had yielded voluntarily.
//!
//! ## Critical sections
//!
//! The handler reuses the scheduler's own code path, so the scheduler
//! must never be interrupted by it part-way through a change. Blocking
//! the tick signal with [`disable`] creates a section that is atomic
//! with respect to preemption; [`PreemptGuard`] does this for a scope
//! and restores the previous state when dropped.
//!
//! Signal masks belong to kernel threads, and the controller is only
//! active on the kernel thread that started a preemptive runtime. On
//! any other kernel thread, [`enable`], [`disable`] and the guard do
//! nothing.

use crate::error::{Error, Result};
use libc::{c_int, itimerval, sigaction, sigset_t, timeval};
use std::cell::Cell;
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::time::Duration;

/// The signal raised on each tick.
///
const TICK_SIGNAL: c_int = libc::SIGVTALRM;

thread_local! {
    /// Whether this kernel thread has an active
    /// preemption controller.
    ///
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Returns whether preemption is configured on the
/// calling kernel thread.
///
fn active() -> bool {
    ACTIVE.with(Cell::get)
}

/// Returns a signal set containing only the tick signal.
///
fn tick_set() -> sigset_t {
    unsafe {
        let mut set = MaybeUninit::<sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), TICK_SIGNAL);
        set.assume_init()
    }
}

/// Applies `how` to the tick signal, returning whether
/// the signal was unblocked beforehand.
///
fn mask_tick(how: c_int) -> bool {
    let set = tick_set();
    let mut old = MaybeUninit::<sigset_t>::uninit();
    unsafe {
        // pthread_sigmask only fails for an invalid
        // `how`, which we never pass.
        libc::pthread_sigmask(how, &set, old.as_mut_ptr());
        libc::sigismember(old.as_ptr(), TICK_SIGNAL) == 0
    }
}

/// Allows forced yields on the calling kernel thread.
///
pub fn enable() {
    if active() {
        mask_tick(libc::SIG_UNBLOCK);
    }
}

/// Prevents forced yields on the calling kernel thread
/// until [`enable`] is called.
///
/// This has no effect on anything other than preemption.
///
pub fn disable() {
    if active() {
        mask_tick(libc::SIG_BLOCK);
    }
}

/// Returns whether forced yields can currently occur on
/// the calling kernel thread.
///
pub fn are_enabled() -> bool {
    if !active() {
        return false;
    }

    let mut current = MaybeUninit::<sigset_t>::uninit();
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), current.as_mut_ptr());
        libc::sigismember(current.as_ptr(), TICK_SIGNAL) == 0
    }
}

/// A section of code that cannot be preempted.
///
/// Preemption is disabled when the guard is created and
/// returned to its previous state when the guard is
/// dropped.
///
#[must_use = "preemption is restored as soon as the guard is dropped"]
pub struct PreemptGuard {
    restart: bool,
}

impl PreemptGuard {
    /// Disables preemption until the returned guard is
    /// dropped.
    ///
    pub fn new() -> Self {
        let restart = active() && mask_tick(libc::SIG_BLOCK);
        PreemptGuard { restart }
    }

    /// Consumes the guard without restoring preemption.
    ///
    /// Whoever disabled preemption before the guard was
    /// created is then responsible for restoring it.
    ///
    pub(crate) fn keep_disabled(self) {
        mem::forget(self);
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        PreemptGuard::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        if self.restart {
            mask_tick(libc::SIG_UNBLOCK);
        }
    }
}

/// Runs `f` with preemption disabled, restoring the
/// previous state afterwards.
///
pub fn without_preemption<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = PreemptGuard::new();
    f()
}

/// Handles the tick signal.
///
extern "C" fn on_tick(_signal: c_int) {
    // The timer is process-wide, so the tick can land
    // on a kernel thread that is not preemptive.
    if !active() {
        return;
    }

    // The interrupted code may be about to read
    // errno, so we must leave it as we found it.
    let errno = unsafe { *libc::__errno_location() };
    crate::yield_now();
    unsafe { *libc::__errno_location() = errno };
}

/// Converts a duration to the timer's representation.
///
fn to_timeval(duration: Duration) -> timeval {
    timeval {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_usec: duration.subsec_micros() as libc::suseconds_t,
    }
}

/// Consumes the tick signal if it is pending on the
/// calling kernel thread. The signal must be blocked.
///
fn discard_pending_tick() {
    let set = tick_set();
    let mut pending = MaybeUninit::<sigset_t>::uninit();
    unsafe {
        if libc::sigpending(pending.as_mut_ptr()) != 0 {
            return;
        }

        if libc::sigismember(pending.as_ptr(), TICK_SIGNAL) == 1 {
            let timeout = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            libc::sigtimedwait(&set, ptr::null_mut(), &timeout);
        }
    }
}

/// Returns the last OS error, wrapped for the caller.
///
fn last_error() -> Error {
    Error::Signal(io::Error::last_os_error())
}

/// The preemption controller.
///
/// Holds the signal mask, handler and timer that were in
/// place before preemption started, so [`stop`](Preemption::stop)
/// can put them back exactly.
///
pub(crate) struct Preemption {
    old_mask: sigset_t,
    old_action: sigaction,
    old_timer: itimerval,
}

impl Preemption {
    /// Starts forcing a yield every `tick` of CPU time.
    ///
    /// Preemption starts out disabled and must be
    /// allowed with [`enable`].
    ///
    pub fn start(tick: Duration) -> Result<Self> {
        // Block the tick before anything can raise it.
        let blocker = tick_set();
        let mut old_mask = MaybeUninit::<sigset_t>::uninit();
        let ret =
            unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &blocker, old_mask.as_mut_ptr()) };
        if ret != 0 {
            return Err(Error::Signal(io::Error::from_raw_os_error(ret)));
        }

        let old_mask = unsafe { old_mask.assume_init() };

        // Install the handler.
        let mut action: sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = on_tick as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        let mut old_action = MaybeUninit::<sigaction>::uninit();
        if unsafe { libc::sigaction(TICK_SIGNAL, &action, old_action.as_mut_ptr()) } != 0 {
            let err = last_error();
            unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut()) };
            return Err(err);
        }

        let old_action = unsafe { old_action.assume_init() };

        // Arm the timer.
        let interval = to_timeval(tick);
        let timer = itimerval {
            it_interval: interval,
            it_value: interval,
        };

        let mut old_timer = MaybeUninit::<itimerval>::uninit();
        if unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, old_timer.as_mut_ptr()) } != 0 {
            let err = last_error();
            unsafe {
                libc::sigaction(TICK_SIGNAL, &old_action, ptr::null_mut());
                libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
            }

            return Err(err);
        }

        ACTIVE.with(|active| active.set(true));

        Ok(Preemption {
            old_mask,
            old_action,
            old_timer: unsafe { old_timer.assume_init() },
        })
    }

    /// Stops preemption, restoring the timer, handler
    /// and signal mask saved by [`start`](Preemption::start).
    ///
    /// Each is restored even if an earlier one fails;
    /// the first failure is returned.
    ///
    pub fn stop(self) -> Result<()> {
        disable();
        ACTIVE.with(|active| active.set(false));

        let mut result = Ok(());
        unsafe {
            if libc::setitimer(libc::ITIMER_VIRTUAL, &self.old_timer, ptr::null_mut()) != 0 {
                result = Err(last_error());
            }

            // A tick raised while blocked would otherwise
            // reach the old handler once the mask is restored.
            discard_pending_tick();

            let ret = libc::sigaction(TICK_SIGNAL, &self.old_action, ptr::null_mut());
            if ret != 0 && result.is_ok() {
                result = Err(last_error());
            }

            let ret = libc::pthread_sigmask(libc::SIG_SETMASK, &self.old_mask, ptr::null_mut());
            if ret != 0 && result.is_ok() {
                result = Err(Error::Signal(io::Error::from_raw_os_error(ret)));
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_guard_does_nothing() {
        // No controller runs on test threads, so the
        // mask must be left alone.
        let before = mask_tick(libc::SIG_BLOCK);
        mask_tick(libc::SIG_UNBLOCK);
        assert!(before);

        {
            let _guard = PreemptGuard::new();
            assert!(!are_enabled());
            disable();
        }

        let set = tick_set();
        let mut current = MaybeUninit::<sigset_t>::uninit();
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), current.as_mut_ptr());
            assert_eq!(libc::sigismember(current.as_ptr(), TICK_SIGNAL), 0);
            assert_eq!(libc::sigismember(&set, TICK_SIGNAL), 1);
        }
    }

    #[test]
    fn timeval() {
        let tv = to_timeval(Duration::from_millis(10));
        assert_eq!(tv.tv_sec, 0);
        assert_eq!(tv.tv_usec, 10_000);

        let tv = to_timeval(Duration::from_micros(2_500_001));
        assert_eq!(tv.tv_sec, 2);
        assert_eq!(tv.tv_usec, 500_001);
    }
}
