// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Includes helpers for managing the stacks used by created threads.
//!
//! The main thread keeps running on the stack the process gave it.
//! Every other thread is given its own stack by [`new_stack`], which
//! maps fresh memory with an inaccessible guard page below it, so an
//! overflow faults rather than silently corrupting a neighbour. The
//! mapping is released when the [`Stack`] is dropped.

use crate::error::{Error, Result};
use std::io;
use std::ptr;
use x86_64::{align_up, VirtAddr};

/// Returns the size of a memory page.
///
fn page_size() -> u64 {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as u64,
        _ => 4096,
    }
}

/// Describes the address space used for a thread's stack.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    start: VirtAddr,
    end: VirtAddr,
}

impl StackBounds {
    /// Returns the smallest valid address in the stack bounds.
    /// As the stack grows downwards, this is also known as the
    /// bottom of the stack.
    ///
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the largest valid address in the stack bounds.
    /// As the stack grows downwards, this is also known as the
    /// top of the stack.
    ///
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Returns the number of usable bytes in the stack.
    ///
    pub fn size(&self) -> u64 {
        (self.end - self.start) + 1
    }

    /// Returns whether the stack bounds include the given
    /// virtual address.
    ///
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr <= self.end
    }
}

/// A thread stack, with a guard page below it.
///
/// The memory is unmapped when the stack is dropped.
///
#[derive(Debug)]
pub struct Stack {
    bounds: StackBounds,

    // The whole mapping, guard page included.
    mapping: *mut libc::c_void,
    mapping_len: usize,
}

impl Stack {
    /// Returns the usable address space of the stack.
    ///
    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.mapping, self.mapping_len) };
    }
}

/// Allocates a stack with at least `size` usable bytes,
/// plus a guard page.
///
pub fn new_stack(size: usize) -> Result<Stack> {
    let page = page_size();
    let usable = align_up(size as u64, page);
    let mapping_len = (usable + page) as usize;

    let mapping = unsafe {
        libc::mmap(
            ptr::null_mut(),
            mapping_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };

    if mapping == libc::MAP_FAILED {
        return Err(Error::StackAllocation(io::Error::last_os_error()));
    }

    // The guard page is the lowest page, as the
    // stack grows downwards.
    if unsafe { libc::mprotect(mapping, page as usize, libc::PROT_NONE) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::munmap(mapping, mapping_len) };
        return Err(Error::StackAllocation(err));
    }

    let start = VirtAddr::from_ptr(mapping) + page;
    let end = start + (usable - 1);

    Ok(Stack {
        bounds: StackBounds { start, end },
        mapping,
        mapping_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_bounds() {
        let page = page_size();
        let stack = new_stack(10_000).unwrap();
        let bounds = stack.bounds();

        // The size is rounded up to whole pages.
        assert_eq!(bounds.size() % page, 0);
        assert!(bounds.size() >= 10_000);
        assert!(bounds.size() < 10_000 + page);

        // The top of the stack is one byte short of
        // a page boundary.
        assert_eq!((bounds.end() + 1u64).as_u64() % page, 0);
        assert!(bounds.contains(bounds.start()));
        assert!(bounds.contains(bounds.end()));
        assert!(!bounds.contains(bounds.end() + 1u64));
        assert!(!bounds.contains(bounds.start() - 1u64));

        // The whole usable range can be written.
        let top: *mut u8 = bounds.end().as_mut_ptr();
        let bottom: *mut u8 = bounds.start().as_mut_ptr();
        unsafe {
            top.write(0xaa);
            bottom.write(0x55);
            assert_eq!(top.read(), 0xaa);
            assert_eq!(bottom.read(), 0x55);
        }
    }
}
