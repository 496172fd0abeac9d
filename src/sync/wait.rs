//! Blocking wait driver built on `poll(2)`.

use core::ops::ControlFlow;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::state::{Ready, Step, Wait};
use crate::wait::{Interrupt, next_wait, poll_timeout_ms};

/// Drive a step-sequence to completion against `fd`.
///
/// `resume` is called with [`Ready::NONE`] first and whenever `interval`
/// elapses without the descriptor becoming ready.
pub(crate) fn drive<T>(
    mut resume: impl FnMut(Ready) -> Result<Step<T>>,
    fd: RawFd,
    interval: Option<Duration>,
    interrupt: Interrupt<'_>,
) -> Result<T> {
    let mut ready = Ready::NONE;
    loop {
        match next_wait(resume(ready)?, interrupt)? {
            ControlFlow::Break(value) => return Ok(value),
            ControlFlow::Continue(wait) => ready = poll_fd(fd, wait, interval)?,
        }
    }
}

/// Block until `fd` is ready for `wait` or `interval` elapses.
fn poll_fd(fd: RawFd, wait: Wait, interval: Option<Duration>) -> Result<Ready> {
    let mut events = 0;
    if wait.wants_read() {
        events |= libc::POLLIN;
    }
    if wait.wants_write() {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };

    // SAFETY: `pfd` is a valid, exclusively borrowed pollfd and nfds is 1.
    let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout_ms(interval)) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Ready::NONE);
        }
        return Err(err.into());
    }

    let mut ready = Ready::NONE;
    if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
        ready = ready | Ready::R;
    }
    if pfd.revents & libc::POLLOUT != 0 {
        ready = ready | Ready::W;
    }
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    use crate::error::Error;

    #[test]
    fn test_poll_reports_readable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        assert!(poll_fd(a.as_raw_fd(), Wait::R, Some(Duration::ZERO)).unwrap().is_none());
        b.write_all(b"x").unwrap();
        let ready = poll_fd(a.as_raw_fd(), Wait::RW, Some(Duration::from_secs(1))).unwrap();
        assert!(ready.is_readable());
        assert!(ready.is_writable());
    }

    #[test]
    fn test_interval_resumes_with_none() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut seen = Vec::new();
        let started = Instant::now();
        let out = drive(
            |ready| {
                seen.push(ready);
                Ok(if seen.len() < 3 { Step::Wait(Wait::R) } else { Step::Done(7) })
            },
            a.as_raw_fd(),
            Some(Duration::from_millis(5)),
            Interrupt::Ignore,
        )
        .unwrap();
        assert_eq!(out, 7);
        assert!(seen.iter().all(|r| r.is_none()));
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_interrupt_stops_at_suspension() {
        let (a, _b) = UnixStream::pair().unwrap();
        let flag = AtomicBool::new(true);
        let mut resumes = 0;
        let result: Result<()> = drive(
            |_| {
                resumes += 1;
                Ok(Step::Wait(Wait::R))
            },
            a.as_raw_fd(),
            Some(Duration::from_millis(5)),
            Interrupt::Observe(&flag),
        );
        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(resumes, 1);
    }
}
