//! Non-blocking transport and protocol bookkeeping for one session.
//!
//! [`PgConn`] owns the socket, the read and write buffers and the state
//! derived from the backend stream: transaction status, server parameters,
//! backend key data and the replies still expected from the server. It never
//! blocks. Step-sequences in [`crate::state`] call into it and ask their
//! driver to wait when it reports `WouldBlock`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, ErrorFields, Result};
use crate::notify::Notify;
use crate::opts::Opts;
use crate::protocol::backend::{
    BackendKeyData, NoticeResponse, NotificationResponse, ParameterStatus, ReadyForQuery, msg_type,
};
use crate::protocol::codec::{HEADER_LEN, frame_bounds};
use crate::protocol::frontend::{
    write_bind, write_describe_portal, write_execute, write_flush, write_parse, write_query,
    write_sync, write_terminate,
};
use crate::protocol::types::TransactionStatus;

const READ_CHUNK: usize = 16 * 1024;

/// Transport to the server.
#[derive(Debug)]
pub enum Socket {
    /// TCP connection
    Tcp(TcpStream),
    /// Unix domain socket connection
    Unix(UnixStream),
}

/// Where a cancel request for this session should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    /// Server TCP address
    Tcp(SocketAddr),
    /// Server Unix socket path
    Unix(PathBuf),
}

impl Socket {
    /// Connect with blocking I/O to the target in `opts`.
    ///
    /// The returned socket is still in blocking mode.
    pub fn connect_blocking(opts: &Opts) -> Result<Self> {
        if let Some(path) = &opts.socket {
            return Ok(Socket::Unix(UnixStream::connect(path)?));
        }
        let addr = (opts.host.as_str(), opts.port);
        let stream = match opts.connect_timeout {
            Some(timeout) => connect_tcp_timeout(addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_nodelay(true)?;
        Ok(Socket::Tcp(stream))
    }

    /// Connect with blocking I/O to a cancel target.
    pub fn connect_target(target: &CancelTarget, timeout: Duration) -> Result<Self> {
        match target {
            CancelTarget::Tcp(addr) => Ok(Socket::Tcp(TcpStream::connect_timeout(addr, timeout)?)),
            CancelTarget::Unix(path) => Ok(Socket::Unix(UnixStream::connect(path)?)),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_nonblocking(nonblocking),
            Socket::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_read_timeout(timeout),
            Socket::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn try_clone(&self) -> io::Result<Socket> {
        match self {
            Socket::Tcp(s) => s.try_clone().map(Socket::Tcp),
            Socket::Unix(s) => s.try_clone().map(Socket::Unix),
        }
    }

    /// Peer address usable for a cancel request, if the socket has one.
    pub fn cancel_target(&self) -> Option<CancelTarget> {
        match self {
            Socket::Tcp(s) => s.peer_addr().ok().map(CancelTarget::Tcp),
            Socket::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(PathBuf::from))
                .map(CancelTarget::Unix),
        }
    }

    pub fn shutdown(&self) {
        let _ = match self {
            Socket::Tcp(s) => s.shutdown(Shutdown::Both),
            Socket::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

fn connect_tcp_timeout(addr: (&str, u16), timeout: Duration) -> Result<TcpStream> {
    use std::net::ToSocketAddrs;

    let mut last_err = None;
    for sock_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no address"))
        .into())
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            Socket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            Socket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl From<Socket> for OwnedFd {
    fn from(socket: Socket) -> OwnedFd {
        match socket {
            Socket::Tcp(s) => s.into(),
            Socket::Unix(s) => s.into(),
        }
    }
}

fn set_param(params: &mut Vec<(String, String)>, name: &str, value: &str) {
    match params.iter_mut().find(|(n, _)| n == name) {
        Some(slot) => slot.1 = value.to_string(),
        None => params.push((name.to_string(), value.to_string())),
    }
}

/// A backend message held until a step-sequence consumes it.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message type byte
    pub type_byte: u8,
    /// Message payload (after length field)
    pub payload: Vec<u8>,
}

/// Reply group the server still owes for a pipelined request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Results of one queued command, identified by its ticket id
    Command(u64),
    /// ReadyForQuery answering a Sync
    Sync,
}

/// One PostgreSQL session over a non-blocking socket.
#[derive(Debug)]
pub struct PgConn {
    socket: Socket,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    inbox: VecDeque<Frame>,
    notifies: VecDeque<Notify>,
    notices: VecDeque<ErrorFields>,
    server_params: Vec<(String, String)>,
    backend_key: Option<BackendKeyData>,
    status: TransactionStatus,
    /// ReadyForQuery messages still owed by the server
    pending_syncs: usize,
    /// Pipelined commands sent since the last Sync
    unsynced: usize,
    expected: VecDeque<Expect>,
    next_ticket: u64,
    eof: bool,
    broken: bool,
}

impl PgConn {
    /// Wrap a socket. The socket is switched to non-blocking mode.
    pub fn new(socket: Socket) -> Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            read_buf: Vec::with_capacity(READ_CHUNK),
            write_buf: Vec::new(),
            inbox: VecDeque::new(),
            notifies: VecDeque::new(),
            notices: VecDeque::new(),
            server_params: Vec::new(),
            backend_key: None,
            status: TransactionStatus::Idle,
            pending_syncs: 0,
            unsynced: 0,
            expected: VecDeque::new(),
            next_ticket: 1,
            eof: false,
            broken: false,
        })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Duplicate the socket descriptor for a side-channel listener.
    pub fn dup_socket(&self) -> Result<OwnedFd> {
        Ok(self.socket.try_clone()?.into())
    }

    /// Current transaction status as seen by the client.
    ///
    /// Reports `Active` while any reply is outstanding.
    pub fn transaction_status(&self) -> TransactionStatus {
        if self.broken {
            TransactionStatus::Unknown
        } else if self.pending_syncs > 0 || self.unsynced > 0 {
            TransactionStatus::Active
        } else {
            self.status
        }
    }

    /// Whether the server still owes replies or pipelined commands lack a Sync.
    pub fn has_pending(&self) -> bool {
        self.pending_syncs > 0 || self.unsynced > 0
    }

    pub fn unsynced(&self) -> usize {
        self.unsynced
    }

    /// Whether the server closed its end of the stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        if !self.broken {
            tracing::debug!("connection marked broken");
        }
        self.broken = true;
    }

    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    pub fn set_backend_key(&mut self, key: BackendKeyData) {
        self.backend_key = Some(key);
    }

    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Raw output buffer for startup-phase messages.
    pub fn write_buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.write_buf
    }

    /// Queue a simple Query message.
    pub fn send_query(&mut self, sql: &str) {
        write_query(&mut self.write_buf, sql);
        self.pending_syncs += 1;
    }

    /// Queue an unnamed Parse/Bind/Describe/Execute group without Sync.
    ///
    /// Returns the id of the reply group.
    pub fn send_extended(&mut self, sql: &str) -> u64 {
        write_parse(&mut self.write_buf, sql);
        write_bind(&mut self.write_buf);
        write_describe_portal(&mut self.write_buf);
        write_execute(&mut self.write_buf);
        let id = self.next_ticket;
        self.next_ticket += 1;
        self.expected.push_back(Expect::Command(id));
        self.unsynced += 1;
        id
    }

    /// Queue a Sync message.
    pub fn send_sync(&mut self) {
        write_sync(&mut self.write_buf);
        self.expected.push_back(Expect::Sync);
        self.pending_syncs += 1;
        self.unsynced = 0;
    }

    /// Queue a Flush message.
    pub fn send_flush(&mut self) {
        write_flush(&mut self.write_buf);
    }

    /// Queue a Terminate message.
    pub fn send_terminate(&mut self) {
        write_terminate(&mut self.write_buf);
    }

    /// Reply group at the head of the pipeline queue.
    pub fn expected_front(&self) -> Option<Expect> {
        self.expected.front().copied()
    }

    pub fn pop_expected(&mut self) -> Option<Expect> {
        self.expected.pop_front()
    }

    pub fn expects(&self, id: u64) -> bool {
        self.expected.contains(&Expect::Command(id))
    }

    pub fn expected_is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    /// Forget all reply bookkeeping. Used after the stream was drained.
    pub fn reset_expected(&mut self) {
        self.expected.clear();
        self.pending_syncs = 0;
        self.unsynced = 0;
    }

    /// Write as much pending output as the socket accepts.
    ///
    /// Returns true once the output buffer is empty.
    pub fn flush(&mut self) -> Result<bool> {
        while !self.write_buf.is_empty() {
            match self.socket.write(&self.write_buf) {
                Ok(0) => {
                    self.mark_broken();
                    return Err(Error::ConnectionBroken);
                }
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.mark_broken();
                    return Err(e.into());
                }
            }
        }
        Ok(true)
    }

    /// Read everything the socket has available into the read buffer.
    pub fn consume_input(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.eof {
            match self.socket.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.mark_broken();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Take the single-byte answer to an SSLRequest.
    pub fn take_ssl_response(&mut self) -> Option<u8> {
        if self.read_buf.is_empty() {
            None
        } else {
            Some(self.read_buf.remove(0))
        }
    }

    /// Split complete frames out of the read buffer.
    ///
    /// Notifications, notices and parameter changes are moved to their own
    /// queues. Everything else is kept in order for [`PgConn::next_frame`].
    pub fn parse_input(&mut self) -> Result<()> {
        let mut offset = 0;
        while let Some((type_byte, frame_len)) = frame_bounds(&self.read_buf[offset..])? {
            let payload = &self.read_buf[offset + HEADER_LEN..offset + frame_len];
            match type_byte {
                msg_type::NOTIFICATION_RESPONSE => {
                    let n = NotificationResponse::parse(payload)?;
                    self.notifies.push_back(Notify {
                        channel: n.channel.to_string(),
                        payload: n.payload.to_string(),
                        pid: n.pid,
                    });
                }
                msg_type::NOTICE_RESPONSE => {
                    let notice = NoticeResponse::parse(payload)?;
                    self.notices.push_back(notice.0);
                }
                msg_type::PARAMETER_STATUS => {
                    let param = ParameterStatus::parse(payload)?;
                    set_param(&mut self.server_params, param.name, param.value);
                }
                _ => {
                    if type_byte == msg_type::READY_FOR_QUERY {
                        let ready = ReadyForQuery::parse(payload)?;
                        self.status = ready.transaction_status().ok_or_else(|| {
                            Error::Protocol(format!("Unknown transaction status: {}", ready.status))
                        })?;
                        self.pending_syncs = self.pending_syncs.saturating_sub(1);
                    }
                    self.inbox.push_back(Frame {
                        type_byte,
                        payload: payload.to_vec(),
                    });
                }
            }
            offset += frame_len;
        }
        self.read_buf.drain(..offset);
        Ok(())
    }

    /// Read what is available and parse it.
    pub fn fill(&mut self) -> Result<()> {
        self.consume_input()?;
        self.parse_input()
    }

    /// Next frame addressed to the foreground sequence.
    ///
    /// Fails with `ConnectionBroken` once the server closed the stream and
    /// every buffered frame was consumed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.inbox.pop_front() {
            return Ok(Some(frame));
        }
        if self.eof {
            self.mark_broken();
            return Err(Error::ConnectionBroken);
        }
        Ok(None)
    }

    pub fn take_notifies(&mut self) -> Vec<Notify> {
        self.notifies.drain(..).collect()
    }

    pub fn take_notices(&mut self) -> Vec<ErrorFields> {
        self.notices.drain(..).collect()
    }

    /// Best-effort Terminate, then shut the socket down.
    pub fn finish(&mut self) {
        if !self.broken {
            self.send_terminate();
            let _ = self.flush();
        }
        self.socket.shutdown();
        self.broken = true;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A connected pair: the driver side wrapped in a PgConn, and the raw
    /// server side left in blocking mode.
    pub(crate) fn pair() -> (PgConn, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        (PgConn::new(Socket::Unix(client)).unwrap(), server)
    }

    pub(crate) fn frame(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![type_byte];
        out.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn notification(pid: u32, channel: &str, payload: &str) -> Vec<u8> {
        let mut body = pid.to_be_bytes().to_vec();
        body.extend_from_slice(channel.as_bytes());
        body.push(0);
        body.extend_from_slice(payload.as_bytes());
        body.push(0);
        frame(b'A', &body)
    }

    /// Block until the client side has something buffered.
    pub(crate) fn fill_until(pgconn: &mut PgConn, mut done: impl FnMut(&PgConn) -> bool) {
        for _ in 0..200 {
            pgconn.fill().unwrap();
            if done(pgconn) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for input");
    }

    #[test]
    fn test_async_messages_are_split_out() {
        let (mut pgconn, mut server) = pair();
        let mut bytes = notification(9, "jobs", "1");
        bytes.extend(frame(b'S', b"TimeZone\0UTC\0"));
        bytes.extend(frame(b'N', b"SNOTICE\0Mhi\0\0"));
        bytes.extend(frame(b'C', b"SELECT 1\0"));
        server.write_all(&bytes).unwrap();

        fill_until(&mut pgconn, |c| !c.inbox.is_empty());
        let notifies = pgconn.take_notifies();
        assert_eq!(notifies.len(), 1);
        assert_eq!(notifies[0].channel, "jobs");
        assert_eq!(pgconn.server_param("TimeZone"), Some("UTC"));
        assert_eq!(pgconn.take_notices().len(), 1);
        let next = pgconn.next_frame().unwrap().unwrap();
        assert_eq!(next.type_byte, b'C');
        assert!(pgconn.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_rest() {
        let (mut pgconn, mut server) = pair();
        let bytes = frame(b'Z', b"I");
        server.write_all(&bytes[..3]).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        pgconn.fill().unwrap();
        assert!(pgconn.next_frame().unwrap().is_none());
        server.write_all(&bytes[3..]).unwrap();
        fill_until(&mut pgconn, |c| !c.inbox.is_empty());
        assert_eq!(pgconn.next_frame().unwrap().unwrap().type_byte, b'Z');
    }

    #[test]
    fn test_status_tracks_outstanding_replies() {
        let (mut pgconn, mut server) = pair();
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Idle);
        pgconn.send_query("BEGIN");
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Active);
        assert!(pgconn.flush().unwrap());

        server.write_all(&frame(b'Z', b"T")).unwrap();
        fill_until(&mut pgconn, |c| !c.inbox.is_empty());
        assert_eq!(pgconn.transaction_status(), TransactionStatus::InTransaction);
    }

    #[test]
    fn test_pipeline_bookkeeping() {
        let (mut pgconn, _server) = pair();
        let first = pgconn.send_extended("SELECT 1");
        let second = pgconn.send_extended("SELECT 2");
        assert_ne!(first, second);
        assert_eq!(pgconn.unsynced(), 2);
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Active);
        pgconn.send_sync();
        assert_eq!(pgconn.unsynced(), 0);
        assert_eq!(pgconn.pop_expected(), Some(Expect::Command(first)));
        assert!(pgconn.expects(second));
        pgconn.reset_expected();
        assert!(pgconn.expected_is_empty());
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Idle);
    }

    #[test]
    fn test_eof_after_buffered_frames() {
        let (mut pgconn, mut server) = pair();
        server.write_all(&frame(b'E', b"SFATAL\0C57P01\0Mbye\0\0")).unwrap();
        drop(server);
        fill_until(&mut pgconn, |c| c.eof);
        assert_eq!(pgconn.next_frame().unwrap().unwrap().type_byte, b'E');
        assert!(matches!(pgconn.next_frame(), Err(Error::ConnectionBroken)));
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Unknown);
    }

    #[test]
    fn test_dup_socket_and_cancel_target() {
        let (pgconn, _server) = pair();
        let dup = pgconn.dup_socket().unwrap();
        assert_ne!(dup.as_raw_fd(), pgconn.fd());
        // socketpair peers have no address to dial
        assert_eq!(pgconn.socket().cancel_target(), None);
    }
}
