// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements user-level threads, multiplexed onto a single kernel thread.
//!
//! A kernel thread becomes a runtime by calling [`start`]. It then continues
//! as the runtime's main thread (thread id 0), and can create further logical
//! threads with [`create`]. Each logical thread has its own stack and runs
//! until its entry point returns or it calls [`exit`]. Its return value is
//! collected with [`join`], which also releases the thread's resources.
//! Once every created thread has been joined, the main thread calls [`stop`].
//!
//! ```no_run
//! uthread::start(false).unwrap();
//! let child = uthread::create(|| {
//!     uthread::yield_now();
//!     42
//! })
//! .unwrap();
//!
//! assert_eq!(uthread::join(child).unwrap(), 42);
//! uthread::stop().unwrap();
//! ```
//!
//! ## Scheduling
//!
//! Threads are scheduled round-robin from a single ready queue. A thread
//! gives up the CPU by calling [`yield_now`], by blocking in [`join`], or by
//! exiting. With preemption enabled (see [`Config`] and the [`preempt`]
//! module), a timer also forces the running thread to yield at each tick.
//!
//! ## Shared state
//!
//! The runtime's state is stored in the crate root, in a slot local to the
//! kernel thread that started it, so separate kernel threads can each run an
//! independent runtime. The state is only ever accessed with preemption
//! disabled, which the runtime enforces by requiring a [`PreemptGuard`] for
//! each access.
//!
//! ## Preemption and locks
//!
//! A preempted thread can be suspended anywhere, including while it holds a
//! lock inside the allocator or the standard library. Another logical thread
//! that then waits for the same lock will never be woken. Code that runs
//! with preemption enabled should keep such calls inside [`without_preemption`].

#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("uthread only supports x86_64 Linux");

pub mod config;
mod error;
pub mod preempt;
mod scheduler;
mod switch;
mod thread;

pub use crate::config::Config;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::preempt::{without_preemption, PreemptGuard};
pub use crate::scheduler::{start, start_with, stop, yield_now};
pub use crate::thread::{
    create, current_thread_id, debug, exit, join, thread_state, ThreadId, ThreadState,
};

use crate::preempt::Preemption;
use crate::scheduler::Scheduler;
use crate::thread::{Thread, ThreadIds};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::ptr;

type ThreadTable = BTreeMap<ThreadId, Box<Thread>>;

/// The state of an active runtime.
///
pub(crate) struct Runtime {
    // Every thread not yet joined, including
    // the main thread.
    pub threads: ThreadTable,

    // The ready and zombie queues.
    pub scheduler: Scheduler,

    // The thread currently running.
    pub current: ThreadId,

    // The source of new thread ids.
    pub ids: ThreadIds,

    // Present while the runtime is preemptive.
    pub preemption: Option<Preemption>,

    pub config: Config,
}

impl Runtime {
    /// Returns a runtime with only the main thread,
    /// which is running.
    ///
    fn new(config: Config) -> Result<Self> {
        let mut threads = ThreadTable::new();
        threads.insert(ThreadId::MAIN, Box::new(Thread::new_main_thread()));

        Ok(Runtime {
            threads,
            scheduler: Scheduler::new()?,
            current: ThreadId::MAIN,
            ids: ThreadIds::new(),
            preemption: None,
            config,
        })
    }

    /// Returns the thread with the given id.
    ///
    /// # Panics
    ///
    /// `thread` panics if the thread is not in the
    /// thread table. Callers only pass ids they have
    /// found in the scheduler, so this would mean the
    /// scheduler's state is corrupt.
    ///
    pub fn thread(&self, id: ThreadId) -> &Thread {
        match self.threads.get(&id) {
            Some(thread) => thread,
            None => panic!("thread {} is not in the thread table", id),
        }
    }

    /// Returns the thread with the given id.
    ///
    /// # Panics
    ///
    /// `thread_mut` panics if the thread is not in the
    /// thread table.
    ///
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.threads.get_mut(&id) {
            Some(thread) => thread,
            None => panic!("thread {} is not in the thread table", id),
        }
    }

    /// Returns the thread currently running.
    ///
    pub fn current_thread_mut(&mut self) -> &mut Thread {
        self.thread_mut(self.current)
    }
}

thread_local! {
    /// RUNTIME holds the runtime started on this
    /// kernel thread, or null.
    ///
    static RUNTIME: Cell<*mut Runtime> = const { Cell::new(ptr::null_mut()) };
}

/// Provides access to the runtime started on this
/// kernel thread, returning `None` if there is none.
///
/// The guard shows that preemption is disabled, so
/// `f` cannot be interrupted by a forced yield. `f`
/// must not call `with_runtime` itself.
///
pub(crate) fn with_runtime<F, R>(_guard: &PreemptGuard, f: F) -> Option<R>
where
    F: FnOnce(&mut Runtime) -> R,
{
    let runtime = RUNTIME.with(Cell::get);
    if runtime.is_null() {
        return None;
    }

    // The runtime is only reachable through this
    // function, which is never re-entered while
    // preemption is disabled.
    Some(f(unsafe { &mut *runtime }))
}

/// Returns whether this kernel thread has a runtime.
///
fn runtime_installed() -> bool {
    !RUNTIME.with(Cell::get).is_null()
}

/// Makes `runtime` the runtime of this kernel thread.
///
fn install_runtime(runtime: Box<Runtime>) {
    RUNTIME.with(|slot| slot.set(Box::into_raw(runtime)));
}

/// Removes and returns this kernel thread's runtime.
///
fn take_runtime(_guard: &PreemptGuard) -> Option<Box<Runtime>> {
    let runtime = RUNTIME.with(|slot| slot.replace(ptr::null_mut()));
    if runtime.is_null() {
        None
    } else {
        // The pointer came from Box::into_raw in
        // install_runtime and has just been cleared,
        // so nothing else can reach it.
        Some(unsafe { Box::from_raw(runtime) })
    }
}
