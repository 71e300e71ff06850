// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Holds the settings a runtime is started with.
//!
//! A [`Config`] is normally built from [`Config::default`] using its
//! builder methods, then passed to [`start_with`](crate::start_with).
//! [`Config::from_env`] applies overrides from the environment on top
//! of the defaults:
//!
//! - `UTHREAD_PREEMPT`: `1`/`true` to enable preemption.
//! - `UTHREAD_TICK_MS`: the preemption tick, in milliseconds.
//! - `UTHREAD_STACK_KIB`: the stack size of each created thread, in KiB.

use crate::error::{Error, Result};
use log::warn;
use static_assertions::const_assert;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// The default interval between forced yields (100 Hz).
///
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// The default size of each created thread's stack.
///
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024; // 256 KiB.

/// The smallest stack a created thread may be given.
///
pub const MIN_STACK_SIZE: usize = 16 * 1024; // 16 KiB.

const_assert!(DEFAULT_STACK_SIZE >= MIN_STACK_SIZE);

/// Describes how a runtime schedules its threads.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Whether the running thread is forced to yield
    /// on each tick.
    pub preempt: bool,

    /// The interval between forced yields, measured
    /// in CPU time consumed by the process.
    pub tick: Duration,

    /// The usable size of each created thread's stack,
    /// in bytes. This is rounded up to a whole number
    /// of pages.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            preempt: false,
            tick: DEFAULT_TICK,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Config {
    /// Returns the default configuration, with any
    /// overrides from the environment applied.
    ///
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(preempt) = env_flag("UTHREAD_PREEMPT") {
            config.preempt = preempt;
        }

        if let Some(millis) = env_number::<u64>("UTHREAD_TICK_MS") {
            config.tick = Duration::from_millis(millis);
        }

        if let Some(kib) = env_number::<usize>("UTHREAD_STACK_KIB") {
            config.stack_size = kib.saturating_mul(1024);
        }

        config
    }

    /// Sets whether the runtime preempts running threads.
    ///
    #[must_use]
    pub fn with_preemption(mut self, preempt: bool) -> Self {
        self.preempt = preempt;
        self
    }

    /// Sets the interval between forced yields.
    ///
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Sets the size of each created thread's stack.
    ///
    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Checks that the configuration can be used
    /// to start a runtime.
    ///
    pub fn validate(&self) -> Result<()> {
        // A zero interval would disarm the timer.
        if self.preempt && self.tick.as_micros() == 0 {
            return Err(Error::InvalidConfig("preemption tick must be at least 1 microsecond"));
        }

        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidConfig("stack size must be at least 16 KiB"));
        }

        Ok(())
    }
}

/// Reads a boolean from the environment.
///
fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring {}={:?}: not a boolean", name, value);
            None
        }
    }
}

/// Reads a number from the environment.
///
fn env_number<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(number) => Some(number),
        Err(_) => {
            warn!("ignoring {}={:?}: not a number", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::default().with_preemption(true).validate().is_ok());

        let config = Config::default().with_stack_size(4096);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config::default()
            .with_preemption(true)
            .with_tick(Duration::from_nanos(10));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        // The tick is irrelevant without preemption.
        let config = Config::default().with_tick(Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment() {
        // Use names no other test reads, as tests
        // run in parallel.
        env::set_var("UTHREAD_TEST_FLAG", "On");
        env::set_var("UTHREAD_TEST_NUMBER", " 25 ");
        env::set_var("UTHREAD_TEST_GARBAGE", "lots");
        assert_eq!(env_flag("UTHREAD_TEST_FLAG"), Some(true));
        assert_eq!(env_number::<u64>("UTHREAD_TEST_NUMBER"), Some(25));
        assert_eq!(env_flag("UTHREAD_TEST_GARBAGE"), None);
        assert_eq!(env_number::<u64>("UTHREAD_TEST_GARBAGE"), None);
        assert_eq!(env_flag("UTHREAD_TEST_MISSING"), None);
    }
}
