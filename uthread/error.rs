// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the failures the runtime reports to its callers.
//!
//! Every failure is local and synchronous: it is returned to the
//! caller of the operation that failed and leaves the runtime in the
//! state it was in before the call. A broken scheduler invariant is
//! not an [`Error`]; it panics.

use crate::thread::ThreadId;
use queue::QueueError;
use std::io;
use thiserror::Error;

/// The error type returned by the runtime.
///
#[derive(Debug, Error)]
pub enum Error {
    /// A thread's stack could not be mapped.
    #[error("failed to allocate thread stack: {0}")]
    StackAllocation(#[source] io::Error),

    /// A scheduler queue could not grow.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The runtime configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Every thread id has been handed out.
    #[error("thread ids exhausted")]
    ThreadIdsExhausted,

    /// The thread is neither ready nor waiting to be joined.
    #[error("thread {0} not found")]
    NotFound(ThreadId),

    /// The main thread cannot be joined.
    #[error("cannot join the main thread")]
    JoinMain,

    /// A thread cannot join itself.
    #[error("thread cannot join itself")]
    JoinSelf,

    /// Another thread is already joining this thread.
    #[error("thread {0} already has a joiner")]
    AlreadyJoined(ThreadId),

    /// No runtime is active on this kernel thread.
    #[error("runtime not started")]
    NotStarted,

    /// A runtime is already active on this kernel thread.
    #[error("runtime already started")]
    AlreadyStarted,

    /// Only the main thread may stop the runtime.
    #[error("runtime can only be stopped by the main thread")]
    NotMainThread,

    /// Created threads have not all been joined.
    #[error("{0} thread(s) not yet joined")]
    ThreadsOutstanding(usize),

    /// A scheduler queue still held entries at shutdown.
    #[error("scheduler queue not empty")]
    QueueNotEmpty,

    /// The preemption signal or timer could not be configured.
    #[error("failed to configure preemption: {0}")]
    Signal(#[source] io::Error),
}

/// Groups errors by the kind of failure.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Memory for a stack, context or queue entry
    /// could not be allocated.
    AllocationFailure,

    /// An argument was unusable.
    InvalidArgument,

    /// The thread id space is saturated.
    CapacityExhausted,

    /// The target of a join does not exist.
    NotFound,

    /// The caller broke the runtime's usage rules.
    ProtocolViolation,

    /// The operating system refused a request.
    Os,
}

impl Error {
    /// Returns the kind of failure this error represents.
    ///
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StackAllocation(_) | Error::Queue(_) => ErrorKind::AllocationFailure,
            Error::InvalidConfig(_) => ErrorKind::InvalidArgument,
            Error::ThreadIdsExhausted => ErrorKind::CapacityExhausted,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::JoinMain
            | Error::JoinSelf
            | Error::AlreadyJoined(_)
            | Error::NotStarted
            | Error::AlreadyStarted
            | Error::NotMainThread
            | Error::ThreadsOutstanding(_)
            | Error::QueueNotEmpty => ErrorKind::ProtocolViolation,
            Error::Signal(_) => ErrorKind::Os,
        }
    }
}

/// The result type returned by the runtime.
///
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let oom = io::Error::from_raw_os_error(libc::ENOMEM);
        assert_eq!(Error::StackAllocation(oom).kind(), ErrorKind::AllocationFailure);
        assert_eq!(Error::InvalidConfig("tick").kind(), ErrorKind::InvalidArgument);
        assert_eq!(Error::ThreadIdsExhausted.kind(), ErrorKind::CapacityExhausted);
        assert_eq!(Error::NotFound(ThreadId::MAIN).kind(), ErrorKind::NotFound);
        assert_eq!(Error::JoinSelf.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(Error::ThreadsOutstanding(2).kind(), ErrorKind::ProtocolViolation);

        let eperm = io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(Error::Signal(eperm).kind(), ErrorKind::Os);
    }

    #[test]
    fn messages() {
        assert_eq!(Error::ThreadsOutstanding(3).to_string(), "3 thread(s) not yet joined");
        assert_eq!(
            Error::AlreadyJoined(ThreadId::MAIN).to_string(),
            "thread 0 already has a joiner"
        );
    }
}
