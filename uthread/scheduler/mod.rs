// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a simple round robin scheduler for threads.
//!
//! ## Initialisation
//!
//! The scheduler does nothing until the kernel thread calls [`start`],
//! at which point it becomes the runtime's main thread. The runtime is
//! shut down again with [`stop`], once every created thread has been
//! joined.
//!
//! ## Thread switching
//!
//! [`yield_now`] can be called to proactively switch to the next thread in
//! the ready queue. The preemption handler calls it too, so nothing on this
//! path may allocate or log. Capacity for every live thread is reserved in
//! both queues when a thread is created.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::preempt::{self, PreemptGuard, Preemption};
use crate::switch::switch_stack;
use crate::thread::{ThreadId, ThreadState};
use crate::{install_runtime, runtime_installed, take_runtime, with_runtime, Runtime};
use log::debug;
use queue::{Queue, Visit};

/// Scheduler is a basic thread scheduler.
///
/// Currently, it implements a round-robin algorithm,
/// along with the queue of exited threads that are
/// waiting to be joined.
///
pub(crate) struct Scheduler {
    ready: Queue<ThreadId>,
    zombies: Queue<ThreadId>,
}

impl Scheduler {
    /// Returns a scheduler with empty queues.
    ///
    pub fn new() -> Result<Scheduler> {
        let mut scheduler = Scheduler {
            ready: Queue::new(),
            zombies: Queue::new(),
        };

        // Make room for the main thread.
        scheduler.reserve(1)?;

        Ok(scheduler)
    }

    /// Ensures each queue can hold `threads` entries
    /// without allocating.
    ///
    pub fn reserve(&mut self, threads: usize) -> Result<()> {
        self.ready.reserve(threads)?;
        self.zombies.reserve(threads)?;

        Ok(())
    }

    /// add queues a thread onto the ready queue.
    ///
    /// # Panics
    ///
    /// `add` panics if the queue has to grow, as
    /// capacity for every live thread is reserved
    /// when the thread is created.
    ///
    pub fn add(&mut self, thread: ThreadId) {
        if self.ready.enqueue(thread).is_err() {
            panic!("ready queue has no room for thread {}", thread);
        }
    }

    /// next returns the next thread able to run.
    ///
    /// The thread is removed from the ready queue,
    /// so it must be added again afterwards if still
    /// able to run.
    ///
    pub fn next(&mut self) -> Option<ThreadId> {
        self.ready.dequeue()
    }

    /// Returns whether no thread is waiting to run.
    ///
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
    }

    /// remove removes the thread from the ready queue,
    /// returning whether it was there.
    ///
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        self.ready.delete(&thread).is_some()
    }

    /// Returns whether the thread is in the ready queue.
    ///
    pub fn is_ready(&mut self, thread: ThreadId) -> bool {
        find(&mut self.ready, thread)
    }

    /// Records an exited thread that nobody is joining.
    ///
    /// # Panics
    ///
    /// `add_zombie` panics if the queue has to grow,
    /// for the same reason as [`add`](Scheduler::add).
    ///
    pub fn add_zombie(&mut self, thread: ThreadId) {
        if self.zombies.enqueue(thread).is_err() {
            panic!("zombie queue has no room for thread {}", thread);
        }
    }

    /// Returns whether the thread has exited and is
    /// waiting to be joined.
    ///
    pub fn is_zombie(&mut self, thread: ThreadId) -> bool {
        find(&mut self.zombies, thread)
    }

    /// Removes an exited thread from the zombie queue,
    /// returning whether it was there.
    ///
    pub fn remove_zombie(&mut self, thread: ThreadId) -> bool {
        self.zombies.delete(&thread).is_some()
    }

    /// Releases both queues, which must be empty.
    ///
    pub fn destroy(self) -> Result<()> {
        let ready = self.ready.destroy();
        let zombies = self.zombies.destroy();
        if ready.is_err() || zombies.is_err() {
            return Err(Error::QueueNotEmpty);
        }

        Ok(())
    }
}

/// Returns whether `queue` contains `thread`.
///
fn find(queue: &mut Queue<ThreadId>, thread: ThreadId) -> bool {
    queue
        .iterate(|id| if *id == thread { Visit::Stop } else { Visit::Continue })
        .is_some()
}

/// Starts a runtime on the calling kernel thread,
/// which becomes its main thread.
///
/// If `preempt` is true, the running thread will be
/// forced to yield at the default tick.
///
pub fn start(preempt: bool) -> Result<()> {
    start_with(Config::default().with_preemption(preempt))
}

/// Starts a runtime on the calling kernel thread, using
/// the given configuration.
///
pub fn start_with(config: Config) -> Result<()> {
    config.validate()?;
    if runtime_installed() {
        return Err(Error::AlreadyStarted);
    }

    let mut runtime = Box::new(Runtime::new(config)?);

    // The controller leaves preemption disabled until
    // the runtime is in place to handle the ticks.
    if config.preempt {
        runtime.preemption = Some(Preemption::start(config.tick)?);
    }

    install_runtime(runtime);
    preempt::enable();

    if config.preempt {
        debug!("started preemptive runtime with a {:?} tick", config.tick);
    } else {
        debug!("started cooperative runtime");
    }

    Ok(())
}

/// Shuts down the runtime on the calling kernel thread.
///
/// `stop` must be called by the main thread, once every
/// created thread has been joined.
///
pub fn stop() -> Result<()> {
    let guard = PreemptGuard::new();
    with_runtime(&guard, |runtime| {
        if runtime.current != ThreadId::MAIN {
            return Err(Error::NotMainThread);
        }

        // The table includes blocked threads, which
        // are in neither queue.
        let outstanding = runtime.threads.len().saturating_sub(1);
        if outstanding > 0 {
            return Err(Error::ThreadsOutstanding(outstanding));
        }

        Ok(())
    })
    .ok_or(Error::NotStarted)??;

    let runtime = take_runtime(&guard).ok_or(Error::NotStarted)?;

    // Any tick from here on finds no runtime. The
    // guard must be released before the controller
    // restores the previous signal mask.
    drop(guard);

    let Runtime {
        threads,
        mut scheduler,
        preemption,
        ..
    } = *runtime;

    let stopped = match preemption {
        Some(preemption) => preemption.stop(),
        None => Ok(()),
    };

    scheduler.remove(ThreadId::MAIN);
    let destroyed = scheduler.destroy();
    drop(threads);

    debug!("stopped runtime");

    stopped.and(destroyed)
}

/// Schedules out the current thread and switches to the next
/// thread in the ready queue.
///
/// If no other threads are ready to run, `switch` returns
/// immediately. A thread that is still running is added to
/// the back of the ready queue. A blocked or exited thread
/// is not, and runs again only once something else adds it.
///
/// `switch` returns whether the thread resumed in the middle
/// of a join, in which case preemption must stay disabled
/// until the join completes.
///
pub(crate) fn switch(guard: &PreemptGuard) -> bool {
    let stack_pointers = with_runtime(guard, |runtime| {
        let current_id = runtime.current;
        let state = runtime.thread(current_id).state;
        if runtime.scheduler.is_idle() && state != ThreadState::Zombie {
            return None;
        }

        if state == ThreadState::Running {
            runtime.thread_mut(current_id).state = ThreadState::Ready;
            runtime.scheduler.add(current_id);
        }

        // An exited thread always has somewhere to
        // go, so falling back to the main thread is
        // a last resort.
        let next_id = runtime.scheduler.next().unwrap_or(ThreadId::MAIN);
        runtime.thread_mut(next_id).state = ThreadState::Running;
        runtime.current = next_id;
        if next_id == current_id {
            return None;
        }

        // Retrieve a pointer to each stack pointer. These
        // point to the value in the Thread structure, where
        // we keep a copy of the current stack pointer. The
        // threads are boxed, so the pointers stay valid
        // while the table changes.
        let current_stack_pointer = runtime.thread(current_id).stack_pointer();
        let new_stack_pointer = runtime.thread(next_id).stack_pointer();

        Some((current_stack_pointer, new_stack_pointer))
    })
    .flatten();

    let (current_stack_pointer, new_stack_pointer) = match stack_pointers {
        Some(pointers) => pointers,
        None => return false,
    };

    unsafe { switch_stack(current_stack_pointer, new_stack_pointer) };

    // We have been switched back in.
    with_runtime(guard, |runtime| runtime.current_thread_mut().collector).unwrap_or(false)
}

/// Gives up the CPU, letting the next ready thread
/// run. The calling thread is added to the back of
/// the ready queue.
///
/// This does nothing if no other thread is ready,
/// or if no runtime has been started.
///
pub fn yield_now() {
    let guard = PreemptGuard::new();
    if switch(&guard) {
        guard.keep_disabled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin() {
        let mut scheduler = Scheduler::new().unwrap();
        let (a, b, c) = (ThreadId::new(1), ThreadId::new(2), ThreadId::new(3));
        scheduler.reserve(3).unwrap();
        assert!(scheduler.is_idle());

        scheduler.add(a);
        scheduler.add(b);
        scheduler.add(c);
        assert!(!scheduler.is_idle());
        assert!(scheduler.is_ready(b));
        assert!(!scheduler.is_zombie(b));

        assert_eq!(scheduler.next(), Some(a));
        scheduler.add(a);
        assert_eq!(scheduler.next(), Some(b));
        assert_eq!(scheduler.next(), Some(c));
        assert_eq!(scheduler.next(), Some(a));
        assert_eq!(scheduler.next(), None);
        assert!(scheduler.destroy().is_ok());
    }

    #[test]
    fn zombies() {
        let mut scheduler = Scheduler::new().unwrap();
        let (a, b) = (ThreadId::new(1), ThreadId::new(2));
        scheduler.reserve(2).unwrap();

        scheduler.add(a);
        scheduler.add_zombie(b);
        assert!(scheduler.is_zombie(b));
        assert!(!scheduler.is_ready(b));
        assert!(scheduler.remove(a));
        assert!(!scheduler.remove(a));

        // Both queues must be empty before they are released.
        assert!(matches!(scheduler.destroy(), Err(Error::QueueNotEmpty)));

        let mut scheduler = Scheduler::new().unwrap();
        scheduler.reserve(1).unwrap();
        scheduler.add_zombie(b);
        assert!(scheduler.remove_zombie(b));
        assert!(!scheduler.remove_zombie(b));
        assert!(scheduler.destroy().is_ok());
    }

    #[test]
    fn yield_without_runtime() {
        yield_now();
        assert!(matches!(stop(), Err(Error::NotStarted)));
    }
}
