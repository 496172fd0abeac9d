//! Pieces of the wait driver shared by the blocking and tokio waiters.
//!
//! Both waiters run the same loop: resume the step-sequence, stop if it is
//! done, otherwise check for interruption and block until the descriptor is
//! ready or the interval elapsed. Only the blocking part differs.

use core::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::state::{Step, Wait};

/// Lets another thread or task interrupt the operation currently driving a
/// connection.
///
/// The driver notices the request at its next suspension point, which is at
/// most one wait interval away. If a command is in flight it is cancelled on
/// the server before the operation returns [`Error::Interrupted`].
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Request interruption.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Interrupt flag as seen by a driver loop.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Interrupt<'a> {
    /// Honour the flag
    Observe(&'a AtomicBool),
    /// Run to completion, e.g. while re-driving after a cancel
    Ignore,
}

impl Interrupt<'_> {
    fn take(self) -> bool {
        match self {
            Interrupt::Observe(flag) => flag.swap(false, Ordering::SeqCst),
            Interrupt::Ignore => false,
        }
    }
}

/// Decide what the driver does after a resume.
pub(crate) fn next_wait<T>(step: Step<T>, interrupt: Interrupt<'_>) -> Result<ControlFlow<T, Wait>> {
    match step {
        Step::Done(value) => Ok(ControlFlow::Break(value)),
        Step::Wait(_) if interrupt.take() => Err(Error::Interrupted),
        Step::Wait(wait) => Ok(ControlFlow::Continue(wait)),
    }
}

/// Timeout in milliseconds for `poll(2)`; -1 blocks indefinitely.
///
/// Rounds up so a sub-millisecond interval does not turn into a busy loop.
pub(crate) fn poll_timeout_ms(interval: Option<Duration>) -> i32 {
    match interval {
        None => -1,
        Some(d) => {
            let ms = d.as_micros().div_ceil(1000);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}
