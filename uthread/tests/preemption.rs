// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Preemption tests.
//!
//! The preemption timer is shared by the whole process, so these tests
//! run one after another on the process's only kernel thread, rather
//! than under the standard test harness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use uthread::{Config, ThreadState};

/// Cleared by the second thread, once it runs.
///
static FLAG: AtomicBool = AtomicBool::new(true);

/// Set by the spinner as it returns.
///
static SPUN: AtomicBool = AtomicBool::new(false);

/// Records whether the spinner had returned by the
/// time the second thread ran.
///
static CLEARED_AFTER_SPIN: AtomicBool = AtomicBool::new(false);

/// Spins until FLAG is cleared, returning 1000, or
/// until `limit` passes, returning 1.
///
fn spin(limit: Duration) -> i32 {
    let deadline = Instant::now() + limit;
    let mut retval = 1000;
    while FLAG.load(Ordering::SeqCst) {
        if Instant::now() > deadline {
            retval = 1;
            break;
        }
    }

    SPUN.store(true, Ordering::SeqCst);
    retval
}

fn clear_flag() -> i32 {
    CLEARED_AFTER_SPIN.store(SPUN.load(Ordering::SeqCst), Ordering::SeqCst);
    FLAG.store(false, Ordering::SeqCst);
    776
}

/// A thread that never yields is preempted, letting
/// the other thread run.
///
fn spinner_is_preempted() {
    FLAG.store(true, Ordering::SeqCst);
    SPUN.store(false, Ordering::SeqCst);
    uthread::start(true).unwrap();
    assert!(uthread::preempt::are_enabled());

    let spinner = uthread::create(|| spin(Duration::from_secs(10))).unwrap();
    let clearer = uthread::create(clear_flag).unwrap();
    assert_eq!(uthread::join(spinner).unwrap(), 1000);
    assert_eq!(uthread::join(clearer).unwrap(), 776);
    assert!(!CLEARED_AFTER_SPIN.load(Ordering::SeqCst));

    uthread::stop().unwrap();
    assert!(!uthread::preempt::are_enabled());
}

/// Without preemption, the spinner keeps the CPU until
/// it gives up.
///
fn spinner_is_not_preempted() {
    FLAG.store(true, Ordering::SeqCst);
    SPUN.store(false, Ordering::SeqCst);
    uthread::start(false).unwrap();
    assert!(!uthread::preempt::are_enabled());

    let spinner = uthread::create(|| spin(Duration::from_millis(500))).unwrap();
    let clearer = uthread::create(clear_flag).unwrap();
    assert_eq!(uthread::join(spinner).unwrap(), 1);

    // The spinner's exit woke us, behind the clearer
    // in the ready queue, so the clearer has already
    // run, but only once the spinner gave up.
    assert_eq!(uthread::thread_state(clearer), Some(ThreadState::Zombie));
    assert!(CLEARED_AFTER_SPIN.load(Ordering::SeqCst));
    assert!(!FLAG.load(Ordering::SeqCst));
    assert_eq!(uthread::join(clearer).unwrap(), 776);

    uthread::stop().unwrap();
}

/// Preemption can be suspended around sections that
/// must not be interrupted.
///
fn critical_sections() {
    let config = Config::default()
        .with_preemption(true)
        .with_tick(Duration::from_millis(1));

    uthread::start_with(config).unwrap();
    assert!(uthread::preempt::are_enabled());

    {
        let _guard = uthread::PreemptGuard::new();
        assert!(!uthread::preempt::are_enabled());

        // Guards nest, restoring the state they
        // found.
        uthread::without_preemption(|| assert!(!uthread::preempt::are_enabled()));
        assert!(!uthread::preempt::are_enabled());
    }

    assert!(uthread::preempt::are_enabled());
    uthread::preempt::disable();
    assert!(!uthread::preempt::are_enabled());
    uthread::preempt::enable();

    // Many busy threads, all preempted in turn. The
    // list is allocated up front, as an allocation
    // must not be preempted.
    let mut threads = Vec::with_capacity(16);
    for i in 0..16 {
        let thread = uthread::create(move || {
            let deadline = Instant::now() + Duration::from_millis(20);
            let mut spins = 0u64;
            while Instant::now() < deadline {
                spins = spins.wrapping_add(1);
            }

            std::hint::black_box(spins);
            i
        });

        threads.push(thread.unwrap());
    }

    for (i, thread) in threads.into_iter().enumerate() {
        assert_eq!(uthread::join(thread).unwrap(), i as i32);
    }

    uthread::stop().unwrap();
}

fn main() {
    let tests: [(&str, fn()); 3] = [
        ("spinner_is_preempted", spinner_is_preempted),
        ("spinner_is_not_preempted", spinner_is_not_preempted),
        ("critical_sections", critical_sections),
    ];

    println!("running {} tests", tests.len());
    for (name, test) in tests {
        test();
        println!("test {} ... ok", name);
    }
}
