//! Blocking iterator over LISTEN/NOTIFY notifications.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::error::Result;
use crate::notify::{HandlerId, Notify, Window};
use crate::wait::InterruptHandle;

use super::Conn;

/// Notifications yielded by [`Conn::notifies`].
///
/// Waits on a duplicate of the session socket, so queries can run on the
/// connection from other threads meanwhile. Dropping the iterator removes its
/// handler and closes the duplicate.
pub struct Notifies<'a> {
    conn: &'a Conn,
    queue: Arc<SegQueue<Notify>>,
    handler: HandlerId,
    fd: OwnedFd,
    window: Window,
    interrupt: Arc<AtomicBool>,
    done: bool,
}

impl<'a> Notifies<'a> {
    pub(super) fn new(conn: &'a Conn, timeout: Option<Duration>, stop_after: Option<usize>) -> Result<Self> {
        let fd = conn.dup_socket()?;
        let queue = Arc::new(SegQueue::new());
        let sink = Arc::clone(&queue);
        let handler = conn.add_notify_handler(move |n: &Notify| sink.push(n.clone()));
        Ok(Self {
            conn,
            queue,
            handler,
            fd,
            window: Window::new(timeout, stop_after, conn.wait_interval()),
            interrupt: Arc::new(AtomicBool::new(false)),
            done: false,
        })
    }

    /// Handle that stops this listener with [`Error::Interrupted`].
    ///
    /// Separate from the connection's own handle: interrupting the listener
    /// leaves foreground operations alone, and the other way round.
    ///
    /// [`Error::Interrupted`]: crate::Error::Interrupted
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle::new(Arc::clone(&self.interrupt))
    }
}

impl Iterator for Notifies<'_> {
    type Item = Result<Notify>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(notify) = self.queue.pop() {
                self.window.record();
                return Some(Ok(notify));
            }
            if self.done {
                return None;
            }
            let Some(interval) = self.window.next_poll() else {
                self.done = true;
                return None;
            };
            if let Err(err) = self.conn.poll_notifies(self.fd.as_raw_fd(), interval, &self.interrupt) {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

impl Drop for Notifies<'_> {
    fn drop(&mut self) {
        self.conn.remove_notify_handler(self.handler);
    }
}

impl core::fmt::Debug for Notifies<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Notifies")
            .field("fd", &self.fd)
            .field("window", &self.window)
            .field("buffered", &self.queue.len())
            .finish()
    }
}
