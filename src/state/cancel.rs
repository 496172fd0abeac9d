//! Non-blocking CancelRequest on a separate connection.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use crate::error::Result;
use crate::pgconn::Socket;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::write_cancel_request;

use super::action::{Ready, Step, Wait};

/// Sends a CancelRequest and waits for the server to close the connection,
/// which it does once the request was handled.
///
/// Owns its socket, so it is resumed directly rather than through a
/// session: `resume` takes only the observed readiness.
#[derive(Debug)]
pub struct CancelRequest {
    socket: Socket,
    buf: Vec<u8>,
    written: usize,
}

impl CancelRequest {
    /// `socket` must already be connected to the server.
    pub fn new(socket: Socket, key: &BackendKeyData) -> Result<Self> {
        socket.set_nonblocking(true)?;
        let mut buf = Vec::with_capacity(16);
        write_cancel_request(&mut buf, key.process_id(), key.secret());
        Ok(Self {
            socket,
            buf,
            written: 0,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn resume(&mut self, _ready: Ready) -> Result<Step<()>> {
        while self.written < self.buf.len() {
            match self.socket.write(&self.buf[self.written..]) {
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Wait(Wait::W)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut scratch = [0u8; 64];
        loop {
            match self.socket.read(&mut scratch) {
                Ok(0) => return Ok(Step::Done(())),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Wait(Wait::R)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // A reset after the request went out still means it was delivered.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(Step::Done(())),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
