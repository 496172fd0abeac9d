//! Cooperative wait driver built on tokio's `AsyncFd`.

use core::ops::ControlFlow;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::error::Result;
use crate::state::{Ready, Step, Wait};
use crate::wait::{Interrupt, next_wait};

/// Borrowed descriptor registered with the reactor for one wait.
///
/// Does not close the descriptor on drop.
struct FdRef(RawFd);

impl AsRawFd for FdRef {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Drive a step-sequence to completion against `fd`, yielding to the
/// runtime while waiting.
///
/// `resume` is called with [`Ready::NONE`] first and whenever `interval`
/// elapses without the descriptor becoming ready.
pub(crate) async fn drive<T>(
    mut resume: impl FnMut(Ready) -> Result<Step<T>>,
    fd: RawFd,
    interval: Option<Duration>,
    interrupt: Interrupt<'_>,
) -> Result<T> {
    let mut ready = Ready::NONE;
    loop {
        match next_wait(resume(ready)?, interrupt)? {
            ControlFlow::Break(value) => return Ok(value),
            ControlFlow::Continue(wait) => ready = wait_fd(fd, wait, interval).await?,
        }
    }
}

async fn wait_fd(fd: RawFd, wait: Wait, interval: Option<Duration>) -> Result<Ready> {
    let interest = match wait {
        Wait::R => Interest::READABLE,
        Wait::W => Interest::WRITABLE,
        Wait::RW => Interest::READABLE | Interest::WRITABLE,
    };
    // Registered per wait: the same socket may be waited on through several
    // descriptors, each by its own driver.
    let afd = AsyncFd::with_interest(FdRef(fd), interest)?;
    let guard = match interval {
        Some(interval) => match tokio::time::timeout(interval, afd.ready(interest)).await {
            Ok(guard) => guard?,
            Err(_) => return Ok(Ready::NONE),
        },
        None => afd.ready(interest).await?,
    };

    let observed = guard.ready();
    let mut ready = Ready::NONE;
    if observed.is_readable() || observed.is_read_closed() {
        ready = ready | Ready::R;
    }
    if observed.is_writable() || observed.is_write_closed() {
        ready = ready | Ready::W;
    }
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicBool;

    use crate::error::Error;

    #[tokio::test]
    async fn test_wait_readable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        assert!(
            wait_fd(a.as_raw_fd(), Wait::R, Some(Duration::from_millis(5)))
                .await
                .unwrap()
                .is_none()
        );
        b.write_all(b"x").unwrap();
        let ready = wait_fd(a.as_raw_fd(), Wait::R, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(ready.is_readable());
    }

    #[tokio::test]
    async fn test_drive_and_interrupt() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut calls = 0;
        let out = drive(
            |_| {
                calls += 1;
                Ok(if calls < 3 { Step::Wait(Wait::R) } else { Step::Done("done") })
            },
            a.as_raw_fd(),
            Some(Duration::from_millis(2)),
            Interrupt::Ignore,
        )
        .await
        .unwrap();
        assert_eq!(out, "done");

        let flag = AtomicBool::new(true);
        let result: Result<()> = drive(
            |_| Ok(Step::Wait(Wait::R)),
            a.as_raw_fd(),
            Some(Duration::from_millis(2)),
            Interrupt::Observe(&flag),
        )
        .await;
        assert!(matches!(result, Err(Error::Interrupted)));
    }
}
