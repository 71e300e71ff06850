// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.

use std::arch::global_asm;

global_asm!(include_str!("switch.s"));

// The following functions are implemented in switch.s.
//
extern "sysv64" {
    /// switch_stack replaces the current stack with a new
    /// stack, using the System V ABI. Its last action is
    /// to start executing the new thread.
    ///
    /// switch_stack takes a pointer to each thread's saved
    /// stack pointer. The current thread's stack pointer
    /// is written before the new one is read.
    ///
    #[link_name = "uthread_switch_stack"]
    pub fn switch_stack(current_stack_pointer: *mut u64, new_stack_pointer: *const u64);

    /// start_thread should be used to start a new thread
    /// by placing its address into the new thread's stack
    /// before calling switch_stack.
    ///
    /// start_thread calls the function whose address was
    /// restored into r12, which must never return.
    ///
    #[link_name = "uthread_start_thread"]
    pub fn start_thread() -> !;
}
