// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements an ordered FIFO container, backed by a doubly-linked list
//! of slots in a single arena.
//!
//! The queue supports O(1) insertion at the tail and removal from the
//! head, plus removal of an arbitrary entry and a forward iteration that
//! may remove the entry it is visiting.
//!
//! Entries live in a `Vec` of slots, linked by index. Slots released by
//! removal are kept on a free list and reused, so a queue that has had
//! enough capacity [reserved](Queue::reserve) never allocates again.
//!
//! # Examples
//!
//! ```
//! use queue::{Queue, Visit};
//!
//! let mut queue = Queue::new();
//! queue.enqueue(1).unwrap();
//! queue.enqueue(2).unwrap();
//! queue.enqueue(3).unwrap();
//!
//! // Remove the first even value we find.
//! let found = queue.iterate(|value| if value % 2 == 0 { Visit::Take } else { Visit::Continue });
//! assert_eq!(found, Some(2));
//! assert_eq!(queue.len(), 2);
//!
//! assert_eq!(queue.dequeue(), Some(1));
//! assert_eq!(queue.dequeue(), Some(3));
//! assert_eq!(queue.dequeue(), None);
//! assert!(queue.destroy().is_ok());
//! ```

#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

use std::collections::TryReserveError;
use std::fmt;
use thiserror::Error;

/// The failures a queue operation can report.
///
#[derive(Debug, Error)]
pub enum QueueError {
    /// Memory for a new entry could not be reserved.
    #[error("failed to allocate queue entry: {0}")]
    AllocationFailure(#[from] TryReserveError),
}

/// The instruction a visitor passed to [`Queue::iterate`]
/// returns for each entry.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    /// Move on to the next entry.
    Continue,

    /// Stop iterating, returning a copy of this
    /// entry's value.
    Stop,

    /// Remove this entry and move on to the next.
    Remove,

    /// Remove this entry and stop iterating,
    /// returning its value.
    Take,
}

/// An index into the slot arena, or `None` for
/// the end of the list.
///
type Link = Option<usize>;

enum Slot<T> {
    Occupied { value: T, prev: Link, next: Link },
    Vacant { next_free: Link },
}

/// A FIFO queue with identity-based removal and
/// deletion-safe iteration.
///
/// Values are compared with `PartialEq` when deleting,
/// so storing handles (such as ids) gives removal by
/// identity rather than by content.
///
pub struct Queue<T> {
    slots: Vec<Slot<T>>,
    free: Link,
    oldest: Link,
    newest: Link,
    len: usize,
}

impl<T> Queue<T> {
    /// Returns a new, empty queue.
    ///
    pub const fn new() -> Self {
        Queue {
            slots: Vec::new(),
            free: None,
            oldest: None,
            newest: None,
            len: 0,
        }
    }

    /// Returns a new, empty queue with room for at
    /// least `capacity` entries.
    ///
    pub fn with_capacity(capacity: usize) -> Self {
        Queue {
            slots: Vec::with_capacity(capacity),
            free: None,
            oldest: None,
            newest: None,
            len: 0,
        }
    }

    /// Returns the number of entries in the queue.
    ///
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the queue has no entries.
    ///
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ensures the queue can hold `total` entries in all
    /// without allocating.
    ///
    pub fn reserve(&mut self, total: usize) -> Result<(), QueueError> {
        // Every slot, vacant or not, counts towards
        // the total, as vacant slots are reused first.
        let additional = total.saturating_sub(self.slots.len());
        self.slots.try_reserve(additional)?;
        Ok(())
    }

    /// Releases the queue.
    ///
    /// A queue that still holds entries is handed back
    /// unchanged, so undrained state is never discarded.
    ///
    pub fn destroy(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Appends `value` at the tail of the queue.
    ///
    #[allow(clippy::missing_panics_doc)] // Will only panic if the free list is inconsistent.
    pub fn enqueue(&mut self, value: T) -> Result<(), QueueError> {
        let slot = Slot::Occupied {
            value,
            prev: self.newest,
            next: None,
        };

        let index = match self.free {
            Some(index) => {
                self.free = match self.slots[index] {
                    Slot::Vacant { next_free } => next_free,
                    Slot::Occupied { .. } => panic!("queue free list links an occupied slot"),
                };

                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.try_reserve(1)?;
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };

        match self.newest {
            Some(newest) => self.set_next(newest, Some(index)),
            None => self.oldest = Some(index),
        }

        self.newest = Some(index);
        self.len += 1;

        Ok(())
    }

    /// Removes and returns the value at the head of
    /// the queue, or `None` if the queue is empty.
    ///
    pub fn dequeue(&mut self) -> Option<T> {
        self.oldest.map(|index| self.unlink(index))
    }

    /// Removes the oldest entry equal to `value`,
    /// returning the stored value.
    ///
    /// If no entry matches, `delete` returns `None`
    /// and the queue is unchanged.
    ///
    pub fn delete(&mut self, value: &T) -> Option<T>
    where
        T: PartialEq,
    {
        let mut cursor = self.oldest;
        while let Some(index) = cursor {
            let (stored, _, next) = self.entry(index);
            if stored == value {
                return Some(self.unlink(index));
            }

            cursor = next;
        }

        None
    }

    /// Visits each entry from oldest to newest.
    ///
    /// The successor of each entry is captured before
    /// `visitor` sees it, so the visitor may ask for the
    /// entry to be removed without disturbing the rest
    /// of the iteration.
    ///
    /// Returns the value of the entry at which the visitor
    /// stopped, or `None` if it visited every entry.
    ///
    pub fn iterate<F>(&mut self, mut visitor: F) -> Option<T>
    where
        F: FnMut(&T) -> Visit,
        T: Clone,
    {
        let mut cursor = self.oldest;
        while let Some(index) = cursor {
            let (value, _, next) = self.entry(index);
            match visitor(value) {
                Visit::Continue => {}
                Visit::Stop => return Some(value.clone()),
                Visit::Remove => {
                    self.unlink(index);
                }
                Visit::Take => return Some(self.unlink(index)),
            }

            cursor = next;
        }

        None
    }

    /// Returns an iterator over the queue's values,
    /// from oldest to newest.
    ///
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.oldest,
        }
    }

    /// Returns the value and links of an occupied slot.
    ///
    fn entry(&self, index: usize) -> (&T, Link, Link) {
        match &self.slots[index] {
            Slot::Occupied { value, prev, next } => (value, *prev, *next),
            Slot::Vacant { .. } => panic!("queue links to vacant slot {}", index),
        }
    }

    fn set_next(&mut self, index: usize, link: Link) {
        if let Slot::Occupied { next, .. } = &mut self.slots[index] {
            *next = link;
        }
    }

    fn set_prev(&mut self, index: usize, link: Link) {
        if let Slot::Occupied { prev, .. } = &mut self.slots[index] {
            *prev = link;
        }
    }

    /// Removes the occupied slot at `index` from the
    /// list, returning its value and moving the slot
    /// to the free list.
    ///
    fn unlink(&mut self, index: usize) -> T {
        let vacant = Slot::Vacant {
            next_free: self.free,
        };

        let (value, prev, next) = match std::mem::replace(&mut self.slots[index], vacant) {
            Slot::Occupied { value, prev, next } => (value, prev, next),
            Slot::Vacant { .. } => panic!("queue unlinked vacant slot {}", index),
        };

        // Bridge the gap between our neighbours, or
        // move the ends of the list if we were one.
        match prev {
            Some(prev) => self.set_next(prev, next),
            None => self.oldest = next,
        }

        match next {
            Some(next) => self.set_prev(next, prev),
            None => self.newest = prev,
        }

        self.free = Some(index);
        self.len -= 1;

        value
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterates over a [`Queue`], from oldest to newest.
///
pub struct Iter<'queue, T> {
    queue: &'queue Queue<T>,
    cursor: Link,
}

impl<'queue, T> Iterator for Iter<'queue, T> {
    type Item = &'queue T;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let (value, _, next) = self.queue.entry(index);
        self.cursor = next;
        Some(value)
    }
}
