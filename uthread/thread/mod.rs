// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements logical threads, each with its own stack and execution state.
//!
//! This module allows the main thread to start an arbitrary number of
//! threads, which the [`scheduler`](crate::scheduler) switches between.
//!
//! ## Manipulating threads
//!
//! Threads are created and made ready to run with [`create`]. A thread
//! terminates when its entry point returns, or earlier by calling [`exit`].
//! Either way, it stays in the thread table as a zombie until another thread
//! collects its return value with [`join`], which also frees its stack.
//!
//! Calling [`debug`] will log debug info about the current thread.

mod stacks;

use crate::error::{Error, Result};
use crate::preempt::{self, PreemptGuard};
use crate::switch::start_thread;
use crate::thread::stacks::{new_stack, Stack};
use crate::with_runtime;
use log::{error, info, trace};
use std::arch::asm;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use x86_64::VirtAddr;

/// The initial floating point control state of a new
/// thread: the x87 control word in the upper half and
/// MXCSR in the lower half, both at their power-on
/// defaults.
///
/// This is popped off in switch_stack, like the other
/// callee-saved state.
///
const DEFAULT_FPU_CONTROL: u64 = (0x037f << 32) | 0x1f80;

/// Uniquely identifies a thread within a runtime.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u16);

impl ThreadId {
    /// MAIN is the thread id of the main thread, which
    /// started the runtime.
    ///
    pub const MAIN: Self = ThreadId(0);

    #[cfg(test)]
    pub(crate) const fn new(id: u16) -> Self {
        ThreadId(id)
    }

    /// Returns a numerical representation for the thread
    /// ID.
    ///
    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates thread ids, in increasing order.
///
/// Ids are never reused during a runtime's lifetime, so
/// allocation fails once the id space is exhausted.
///
pub(crate) struct ThreadIds {
    last: u16,
}

impl ThreadIds {
    pub const fn new() -> Self {
        ThreadIds { last: ThreadId::MAIN.0 }
    }

    /// Allocates and returns the next available ThreadId.
    ///
    pub fn next(&mut self) -> Option<ThreadId> {
        if self.last == u16::MAX {
            return None;
        }

        self.last += 1;
        Some(ThreadId(self.last))
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread is waiting in the ready
    /// queue.
    Ready,

    /// The thread is executing.
    Running,

    /// The thread is waiting to join
    /// another thread.
    Blocked,

    /// The thread has exited and is waiting
    /// to be joined.
    Zombie,
}

/// A thread's entry point.
///
/// This is called exactly once, but is stored as
/// FnMut so that calling it does not free it.
///
type Entry = Box<dyn FnMut() -> i32>;

/// Wraps `f` as an [`Entry`].
///
fn entry_point<F>(f: F) -> Entry
where
    F: FnOnce() -> i32 + 'static,
{
    let mut f = Some(f);
    Box::new(move || match f.take() {
        Some(f) => f(),
        None => panic!("thread entry point called twice"),
    })
}

/// Contains the metadata for a thread of
/// execution.
///
pub(crate) struct Thread {
    id: ThreadId,

    // The thread's current state.
    pub state: ThreadState,

    // The thread's stack. The main thread runs
    // on the kernel thread's stack, so has none.
    stack: Option<Stack>,

    // The thread's saved stack pointer. While the
    // thread is executing, this value will be stale.
    // When the thread is switched out, its final stack
    // pointer is written to this cell. When the thread
    // is resumed, its stack pointer is restored from
    // this value.
    stack_pointer: UnsafeCell<u64>,

    // The thread's entry point, which is taken when
    // the thread starts.
    entry: Option<Entry>,

    // The thread waiting to join this one, if any.
    pub joiner: Option<ThreadId>,

    // The thread's return value, once it has
    // exited.
    pub retval: i32,

    // Whether the thread is blocked in join. It
    // resumes with preemption still disabled.
    pub collector: bool,
}

/// push_stack is used to build a new thread's stack
/// without having to drop down to assembly. This is
/// done by dynamically populating the stack, value
/// by value. These are then popped off in switch_stack
/// when switching to the new thread for the first
/// time.
///
unsafe fn push_stack(mut rsp: *mut u64, value: u64) -> *mut u64 {
    // We move the stack pointer down by 8 bytes, write
    // the value to the new space, then return the updated
    // stack pointer.
    rsp = rsp.sub(1);
    rsp.write(value);
    rsp
}

impl Thread {
    /// Returns the main thread, which is already
    /// running.
    ///
    pub fn new_main_thread() -> Thread {
        // The initial stack pointer is 0, as the main
        // thread inherits the kernel thread's stack.
        //
        // When we switch away from the main thread for
        // the first time, the current stack pointer is
        // written here. The 0 we set is never read.
        Thread {
            id: ThreadId::MAIN,
            state: ThreadState::Running,
            stack: None,
            stack_pointer: UnsafeCell::new(0),
            entry: None,
            joiner: None,
            retval: 0,
            collector: false,
        }
    }

    /// Returns a new thread, ready to run `entry` on
    /// `stack` once it is first switched in.
    ///
    pub fn new(id: ThreadId, stack: Stack, entry: Entry) -> Thread {
        let rsp = unsafe {
            let mut rsp: *mut u64 = stack.bounds().end().as_mut_ptr();

            // The stack pointer starts out pointing to
            // the last address in range, which is not
            // aligned. We add one to the pointer value
            // so it becomes aligned again. The next
            // `push_stack` will subtract 8 straight
            // away, so we will still remain within the
            // stack bounds.
            rsp = (rsp as *mut u8).add(1) as *mut u64;

            // Push start_thread and the initial registers
            // to be loaded by switch_stack. start_thread
            // calls the function in r12.
            rsp = push_stack(rsp, start_thread as *const u8 as u64); // RIP.
            rsp = push_stack(rsp, 0); // Initial RBP.
            rsp = push_stack(rsp, 0); // Initial RBX.
            rsp = push_stack(rsp, enter_thread as *const u8 as u64); // Initial R12.
            rsp = push_stack(rsp, 0); // Initial R13.
            rsp = push_stack(rsp, 0); // Initial R14.
            rsp = push_stack(rsp, 0); // Initial R15.
            rsp = push_stack(rsp, DEFAULT_FPU_CONTROL); // MXCSR and x87 control word.

            rsp
        };

        Thread {
            id,
            state: ThreadState::Ready,
            stack: Some(stack),
            stack_pointer: UnsafeCell::new(rsp as u64),
            entry: Some(entry),
            joiner: None,
            retval: 0,
            collector: false,
        }
    }

    /// Returns the thread's stack pointer.
    ///
    pub fn stack_pointer(&self) -> *mut u64 {
        self.stack_pointer.get()
    }

    /// Logs the thread's stack usage, given its
    /// current stack pointer.
    ///
    /// # Panics
    ///
    /// `debug` panics if the stack pointer is not
    /// within the thread's stack.
    ///
    fn debug(&self, stack_pointer: VirtAddr) {
        let stack_bounds = match &self.stack {
            Some(stack) => stack.bounds(),
            None => {
                info!("thread {}: running on the kernel thread's stack", self.id);
                return;
            }
        };

        if !stack_bounds.contains(stack_pointer) {
            panic!(
                "thread {}: current stack pointer {:p} is not in stack bounds {:p}-{:p}",
                self.id,
                stack_pointer,
                stack_bounds.start(),
                stack_bounds.end()
            );
        }

        // Do the calculations, remembering that the stack grows
        // downwards, so some of these look the wrong way around.
        let total_stack = stack_bounds.size();
        let used_stack = stack_bounds.end() - stack_pointer;
        let free_stack = stack_pointer - stack_bounds.start();
        let percent = (100 * used_stack) / total_stack;
        info!(
            "thread {}: {} bytes ({}%) of stack used, {} / {} bytes remaining.",
            self.id, used_stack, percent, free_stack, total_stack
        );
    }
}

/// The first Rust code a new thread executes, called
/// by start_thread.
///
/// Runs the thread's entry point with preemption
/// enabled, then exits with its return value.
///
extern "C" fn enter_thread() -> ! {
    let (id, mut entry) = {
        let guard = PreemptGuard::new();
        let taken = with_runtime(&guard, |runtime| {
            let thread = runtime.current_thread_mut();
            (thread.id, thread.entry.take())
        });

        match taken {
            Some((id, Some(entry))) => (id, entry),
            _ => {
                error!("thread started without an entry point");
                process::abort();
            }
        }
    };

    preempt::enable();

    // A panic cannot unwind past start_thread.
    let retval = match panic::catch_unwind(AssertUnwindSafe(&mut entry)) {
        Ok(retval) => retval,
        Err(_) => {
            preempt::disable();
            error!("thread {} panicked", id);
            process::abort();
        }
    };

    // The allocator must not be preempted.
    preempt::disable();
    drop(entry);

    exit(retval)
}

/// Creates a new thread, which will run `entry` once
/// scheduled. The thread is added to the back of the
/// ready queue.
///
/// Returns the new thread's id, to be passed to [`join`].
///
pub fn create<F>(entry: F) -> Result<ThreadId>
where
    F: FnOnce() -> i32 + 'static,
{
    let guard = PreemptGuard::new();
    with_runtime(&guard, |runtime| -> Result<ThreadId> {
        let id = runtime.ids.next().ok_or(Error::ThreadIdsExhausted)?;
        let stack = new_stack(runtime.config.stack_size)?;
        let thread = Box::new(Thread::new(id, stack, entry_point(entry)));

        // Make sure switching threads never needs
        // to allocate.
        runtime.scheduler.reserve(runtime.threads.len() + 1)?;
        runtime.threads.insert(id, thread);
        runtime.scheduler.add(id);

        trace!("created thread {}", id);

        Ok(id)
    })
    .unwrap_or(Err(Error::NotStarted))
}

/// Returns the id of the currently executing thread,
/// or `None` if no runtime has been started.
///
pub fn current_thread_id() -> Option<ThreadId> {
    let guard = PreemptGuard::new();
    with_runtime(&guard, |runtime| runtime.current)
}

/// Returns the scheduling state of the given thread,
/// or `None` if it does not exist or has been joined.
///
pub fn thread_state(id: ThreadId) -> Option<ThreadState> {
    let guard = PreemptGuard::new();
    with_runtime(&guard, |runtime| runtime.threads.get(&id).map(|thread| thread.state)).flatten()
}

/// Terminates the current thread and switches to
/// the next ready thread.
///
/// The thread's return value is `retval`, which is
/// passed to the thread that joins it. If a thread is
/// already waiting to join it, that thread is made
/// ready to run.
///
/// # Panics
///
/// `exit` will panic if called by the main thread,
/// which must stop the runtime instead, or if no
/// runtime has been started.
///
pub fn exit(retval: i32) -> ! {
    let guard = PreemptGuard::new();
    let exited = with_runtime(&guard, |runtime| {
        let id = runtime.current;
        if id == ThreadId::MAIN {
            panic!("main thread tried to exit");
        }

        let thread = runtime.thread_mut(id);
        thread.state = ThreadState::Zombie;
        thread.retval = retval;
        let joiner = thread.joiner;
        match joiner {
            Some(joiner) => {
                runtime.thread_mut(joiner).state = ThreadState::Ready;
                runtime.scheduler.add(joiner);
            }
            None => runtime.scheduler.add_zombie(id),
        }

        trace!("thread {} exited with {}", id, retval);

        id
    });

    let id = match exited {
        Some(id) => id,
        None => panic!("exit called without a runtime"),
    };

    // We've now been unscheduled, so we
    // switch to the next thread.
    crate::scheduler::switch(&guard);
    unreachable!("exited thread {} was rescheduled", id);
}

/// Waits for the given thread to exit, then returns
/// its return value.
///
/// The thread's resources are released, so each
/// thread can be joined once. A thread can only be
/// joined while it is ready to run or has exited.
///
/// # Panics
///
/// `join` panics if the thread is woken before it
/// has exited, which would mean the scheduler's
/// state is corrupt.
///
pub fn join(id: ThreadId) -> Result<i32> {
    let guard = PreemptGuard::new();
    let exited = with_runtime(&guard, |runtime| {
        let current = runtime.current;
        if id == ThreadId::MAIN {
            return Err(Error::JoinMain);
        }

        if id == current {
            return Err(Error::JoinSelf);
        }

        let exited = if runtime.scheduler.is_ready(id) {
            false
        } else if runtime.scheduler.is_zombie(id) {
            true
        } else {
            return Err(Error::NotFound(id));
        };

        if runtime.thread(id).joiner.is_some() {
            return Err(Error::AlreadyJoined(id));
        }

        if exited {
            runtime.scheduler.remove_zombie(id);
            return Ok(true);
        }

        // Wait for the child to wake us when it
        // exits.
        runtime.thread_mut(id).joiner = Some(current);
        let parent = runtime.current_thread_mut();
        parent.state = ThreadState::Blocked;
        parent.collector = true;

        Ok(false)
    })
    .ok_or(Error::NotStarted)??;

    if !exited {
        crate::yield_now();
    }

    let retval = with_runtime(&guard, |runtime| {
        runtime.current_thread_mut().collector = false;
        match runtime.threads.remove(&id) {
            Some(child) if child.state == ThreadState::Zombie => child.retval,
            Some(_) => panic!("joined thread {} has not exited", id),
            None => panic!("joined thread {} is not in the thread table", id),
        }
    })
    .ok_or(Error::NotStarted)?;

    trace!("joined thread {}", id);

    Ok(retval)
}

/// Logs debug info about the currently executing thread.
///
pub fn debug() {
    // Start by getting the current stack pointer.
    let rsp: u64;
    unsafe {
        asm!("mov {}, rsp", out(reg) rsp, options(nostack, nomem, preserves_flags));
    }

    let guard = PreemptGuard::new();
    let found = with_runtime(&guard, |runtime| {
        runtime.current_thread_mut().debug(VirtAddr::new(rsp));
    });

    if found.is_none() {
        info!("no runtime started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids() {
        let mut ids = ThreadIds::new();
        assert_eq!(ids.next(), Some(ThreadId(1)));
        assert_eq!(ids.next(), Some(ThreadId(2)));

        let mut ids = ThreadIds { last: u16::MAX - 1 };
        assert_eq!(ids.next(), Some(ThreadId(u16::MAX)));
        assert_eq!(ids.next(), None);
        assert_eq!(ids.next(), None);

        assert_eq!(ThreadId::MAIN.as_u16(), 0);
        assert_eq!(ThreadId(513).to_string(), "513");
    }

    #[test]
    fn initial_stack() {
        let stack = new_stack(16 * 1024).unwrap();
        let top = stack.bounds().end() + 1u64;
        let thread = Thread::new(ThreadId(1), stack, entry_point(|| 0));
        assert_eq!(thread.state, ThreadState::Ready);

        let rsp = unsafe { *thread.stack_pointer() };
        assert_eq!(top.as_u64() - rsp, 8 * 8);

        // The values are popped in reverse order by
        // switch_stack.
        let words = unsafe { std::slice::from_raw_parts(rsp as *const u64, 8) };
        assert_eq!(words[0], DEFAULT_FPU_CONTROL);
        assert_eq!(words[1..4], [0, 0, 0]); // R15, R14, R13.
        assert_eq!(words[4], enter_thread as *const u8 as u64); // R12.
        assert_eq!(words[5..7], [0, 0]); // RBX, RBP.
        assert_eq!(words[7], start_thread as *const u8 as u64); // RIP.

        // start_thread is entered with the stack
        // 16-byte aligned, as it makes a call.
        assert_eq!(top.as_u64() % 16, 0);
    }

    #[test]
    fn ids_exhausted() {
        crate::start(false).unwrap();

        let guard = PreemptGuard::new();
        with_runtime(&guard, |runtime| runtime.ids = ThreadIds { last: u16::MAX - 1 }).unwrap();
        drop(guard);

        let last = create(|| 9).unwrap();
        assert_eq!(last.as_u16(), u16::MAX);
        match create(|| 0) {
            Err(err @ Error::ThreadIdsExhausted) => {
                assert_eq!(err.kind(), crate::ErrorKind::CapacityExhausted)
            }
            other => panic!("unexpected create result: {:?}", other),
        }

        // The failed create leaves nothing behind.
        let guard = PreemptGuard::new();
        assert_eq!(with_runtime(&guard, |runtime| runtime.threads.len()), Some(2));
        drop(guard);

        assert_eq!(join(last).unwrap(), 9);
        crate::stop().unwrap();
    }

    #[test]
    fn no_runtime() {
        assert!(matches!(create(|| 0), Err(Error::NotStarted)));
        assert!(matches!(join(ThreadId(1)), Err(Error::NotStarted)));
        assert_eq!(current_thread_id(), None);
        assert_eq!(thread_state(ThreadId::MAIN), None);
    }
}
