//! Connection state shared by the blocking and tokio connections.
//!
//! [`ConnBase`] owns the session behind a short-held mutex. The mutex is
//! taken for a single resume of a step-sequence and released before the
//! driver blocks, so a notification listener on a duplicated descriptor can
//! make progress while a foreground operation waits. Ordering between
//! foreground operations is the job of the serialization lock kept by each
//! connection variant.

use std::io::{self, Read, Write};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, ErrorFields, Result};
use crate::notify::{HandlerId, NoticeHandler, Notify, NotifyHandler, Registry};
use crate::ops::SessionGen;
use crate::opts::Opts;
use crate::pgconn::{CancelTarget, PgConn, Socket};
use crate::pipeline::{PipelineState, Ticket};
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::write_cancel_request;
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;
use crate::state::pipeline::Harvest;
use crate::state::{Ready, Step};
use crate::tpc::Xid;
use crate::wait::InterruptHandle;

/// How long a cancel connection may take to establish.
pub(crate) const CANCEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl core::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TpcAction {
    Commit,
    Rollback,
}

impl TpcAction {
    fn sql(self) -> &'static str {
        match self {
            TpcAction::Commit => "COMMIT",
            TpcAction::Rollback => "ROLLBACK",
        }
    }

    fn method(self) -> &'static str {
        match self {
            TpcAction::Commit => "tpc_commit()",
            TpcAction::Rollback => "tpc_rollback()",
        }
    }
}

/// What finishing a two-phase transaction has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TpcEnd {
    /// The transaction was never prepared: plain commit or rollback
    OnePhase(TpcAction),
    /// `COMMIT PREPARED` / `ROLLBACK PREPARED`
    Prepared(String),
}

/// Everything guarded by the session mutex.
#[derive(Debug)]
pub(crate) struct Session {
    pub pgconn: PgConn,
    pub autocommit: bool,
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
    /// Open `Conn::transaction` blocks
    pub num_transactions: usize,
    /// Open two-phase transaction and whether it was prepared
    pub tpc: Option<(Xid, bool)>,
    pub pipeline: Option<PipelineState>,
}

impl Session {
    pub fn new(pgconn: PgConn, opts: &Opts) -> Self {
        Self {
            pgconn,
            autocommit: opts.autocommit,
            isolation_level: None,
            read_only: None,
            deferrable: None,
            num_transactions: 0,
            tpc: None,
            pipeline: None,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.pgconn.transaction_status()
    }

    pub fn pipeline_level(&self) -> usize {
        self.pipeline.as_ref().map_or(0, PipelineState::level)
    }

    /// Whether a statement has to be preceded by the transaction start command.
    pub fn needs_begin(&self) -> bool {
        !self.autocommit && self.status() == TransactionStatus::Idle
    }

    /// `BEGIN` with the configured transaction characteristics.
    pub fn begin_command(&self) -> String {
        let mut command = String::from("BEGIN");
        if let Some(level) = self.isolation_level {
            command.push_str(" ISOLATION LEVEL ");
            command.push_str(level.as_sql());
        }
        match self.read_only {
            Some(true) => command.push_str(" READ ONLY"),
            Some(false) => command.push_str(" READ WRITE"),
            None => {}
        }
        match self.deferrable {
            Some(true) => command.push_str(" DEFERRABLE"),
            Some(false) => command.push_str(" NOT DEFERRABLE"),
            None => {}
        }
        command
    }

    /// Refuse to change a session characteristic while a transaction is open.
    pub fn check_can_change(&self, attribute: &str) -> Result<()> {
        let status = self.status();
        if status == TransactionStatus::Idle {
            return Ok(());
        }
        if self.num_transactions > 0 {
            Err(Error::InvalidUsage(format!(
                "can't change '{}' now: connection.transaction() context in progress",
                attribute
            )))
        } else {
            Err(Error::InvalidUsage(format!(
                "can't change '{}' now: connection in transaction status {}",
                attribute, status
            )))
        }
    }

    pub fn check_commit(&self) -> Result<()> {
        if self.num_transactions > 0 {
            return Err(Error::InvalidUsage(
                "Explicit commit() forbidden within a Transaction context. \
                 (Transaction will be automatically committed on successful exit from context.)"
                    .into(),
            ));
        }
        if self.tpc.is_some() {
            return Err(Error::InvalidUsage(
                "commit() cannot be used during a two-phase transaction".into(),
            ));
        }
        Ok(())
    }

    pub fn check_rollback(&self) -> Result<()> {
        if self.num_transactions > 0 {
            return Err(Error::InvalidUsage(
                "Explicit rollback() forbidden within a Transaction context. \
                 (Return an error from the closure or use force_rollback to roll it back.)"
                    .into(),
            ));
        }
        if self.tpc.is_some() {
            return Err(Error::InvalidUsage(
                "rollback() cannot be used during a two-phase transaction".into(),
            ));
        }
        Ok(())
    }

    /// Record the start of a two-phase transaction and return the command
    /// that opens it.
    pub fn tpc_begin(&mut self, xid: Xid) -> Result<String> {
        if self.tpc.is_some() {
            return Err(Error::InvalidUsage(
                "this connection is already in a two-phase transaction".into(),
            ));
        }
        let status = self.status();
        if status != TransactionStatus::Idle {
            return Err(Error::InvalidUsage(format!(
                "can't start two-phase transaction: connection in status {}",
                status
            )));
        }
        if self.autocommit {
            return Err(Error::InvalidUsage(
                "can't use two-phase transactions in autocommit mode".into(),
            ));
        }
        self.tpc = Some((xid, false));
        Ok(self.begin_command())
    }

    /// Mark the two-phase transaction prepared and return the command that
    /// prepares it.
    pub fn tpc_prepare(&mut self) -> Result<String> {
        match &mut self.tpc {
            None => Err(Error::InvalidUsage(
                "'tpc_prepare()' must be called inside a two-phase transaction".into(),
            )),
            Some((_, true)) => Err(Error::InvalidUsage(
                "'tpc_prepare()' cannot be used during a prepared two-phase transaction".into(),
            )),
            Some((xid, prepared)) => {
                *prepared = true;
                Ok(format!("PREPARE TRANSACTION {}", xid.to_literal()))
            }
        }
    }

    /// Decide how to finish a two-phase transaction.
    ///
    /// Without `xid` the transaction begun with `tpc_begin` is finished; with
    /// one, a transaction prepared earlier, possibly by another session.
    pub fn tpc_end(&mut self, action: TpcAction, xid: Option<Xid>) -> Result<TpcEnd> {
        let xid = match xid {
            None => match &self.tpc {
                Some((xid, _)) => xid.clone(),
                None => {
                    return Err(Error::InvalidUsage(format!(
                        "{} without xid must be called inside a two-phase transaction",
                        action.method()
                    )));
                }
            },
            Some(xid) => {
                if self.tpc.is_some() {
                    return Err(Error::InvalidUsage(format!(
                        "{} with xid must be called outside a two-phase transaction",
                        action.method()
                    )));
                }
                xid
            }
        };
        if matches!(self.tpc, Some((_, false))) {
            self.tpc = None;
            return Ok(TpcEnd::OnePhase(action));
        }
        Ok(TpcEnd::Prepared(format!(
            "{} PREPARED {}",
            action.sql(),
            xid.to_literal()
        )))
    }

    /// Queue a command on the active pipeline.
    pub fn queue(&mut self, sql: &str) -> Ticket {
        Ticket(self.pgconn.send_extended(sql))
    }

    /// Queue a command issued by the driver itself. Its result is dropped
    /// on arrival; a failure is still reported by the next sync.
    pub fn queue_internal(&mut self, sql: &str) {
        let ticket = self.queue(sql);
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.ignore(ticket);
        }
    }

    pub fn enter_pipeline(&mut self) {
        match &mut self.pipeline {
            Some(pipeline) => pipeline.enter(),
            None => self.pipeline = Some(PipelineState::new()),
        }
    }

    pub fn leave_pipeline(&mut self) {
        if let Some(pipeline) = &mut self.pipeline {
            if pipeline.leave() == 0 {
                self.pipeline = None;
            }
        }
    }

    pub fn leave_transaction(&mut self) {
        self.num_transactions = self.num_transactions.saturating_sub(1);
    }

    /// Store harvested pipeline results, returning the first failure.
    ///
    /// Results arriving when no pipeline is active belong to an operation
    /// that was given up on and are dropped.
    pub fn store(&mut self, harvest: Harvest) -> Option<Error> {
        match &mut self.pipeline {
            Some(pipeline) => pipeline.store(harvest),
            None => None,
        }
    }

    pub fn take_result(&mut self, ticket: Ticket) -> Option<Result<QueryResult>> {
        self.pipeline.as_mut().and_then(|p| p.take(ticket))
    }

    /// Forget state left behind by an abandoned operation.
    ///
    /// Returns true if a transaction opened by a scope has to be rolled back.
    pub fn reset_after_abandon(&mut self) -> bool {
        let scoped = self.num_transactions > 0 || self.tpc.is_some();
        self.pipeline = None;
        self.num_transactions = 0;
        self.tpc = None;
        scoped && self.status() != TransactionStatus::Idle
    }
}

/// Marks the connection for recovery if dropped before [`InFlight::done`].
///
/// A future dropped mid-operation, or a panic unwinding through one, leaves
/// unread replies on the wire. The next operation drains them first.
pub(crate) struct InFlight<'a> {
    abandoned: &'a AtomicBool,
    done: bool,
}

impl InFlight<'_> {
    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }
}

/// Session, handlers and flags of one connection.
pub(crate) struct ConnBase {
    session: Mutex<Session>,
    notify_handlers: Registry<Notify>,
    notice_handlers: Registry<ErrorFields>,
    interrupt: Arc<AtomicBool>,
    closed: AtomicBool,
    abandoned: AtomicBool,
    opts: Opts,
    fd: RawFd,
    backend_key: Option<BackendKeyData>,
    cancel_target: Option<CancelTarget>,
}

impl ConnBase {
    /// Wrap a session that completed startup.
    pub fn new(pgconn: PgConn, opts: Opts) -> Self {
        let fd = pgconn.fd();
        let backend_key = pgconn.backend_key().copied();
        let cancel_target = pgconn.socket().cancel_target();
        tracing::debug!(
            "connection established (backend pid {:?})",
            backend_key.map(|k| k.process_id())
        );
        Self {
            session: Mutex::new(Session::new(pgconn, &opts)),
            notify_handlers: Registry::default(),
            notice_handlers: Registry::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            opts,
            fd,
            backend_key,
            cancel_target,
        }
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    /// Descriptor of the primary socket.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    pub fn cancel_target(&self) -> Option<&CancelTarget> {
        self.cancel_target.as_ref()
    }

    pub fn session(&self) -> Result<MutexGuard<'_, Session>> {
        Ok(self.session.lock()?)
    }

    pub fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        Ok(f(&mut *self.session()?))
    }

    /// Resume an operation once with the session locked.
    ///
    /// Notifications and notices read during the resume are dispatched to
    /// their handlers after the session is unlocked.
    pub fn resume<G: SessionGen>(&self, op: &mut G, ready: Ready) -> Result<Step<G::Output>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut session = self.session()?;
        let step = op.resume(&mut session, ready);
        if let Err(err) = &step {
            if err.is_connection_broken() || matches!(err, Error::Protocol(_)) {
                session.pgconn.mark_broken();
            }
        }
        let notifies = session.pgconn.take_notifies();
        let notices = session.pgconn.take_notices();
        drop(session);

        for notify in &notifies {
            self.notify_handlers.dispatch(notify);
        }
        for notice in &notices {
            if self.notice_handlers.is_empty() {
                tracing::debug!("server notice: {}", notice);
            } else {
                self.notice_handlers.dispatch(notice);
            }
        }
        step
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True if the connection failed without being closed by the caller.
    pub fn is_broken(&self) -> bool {
        !self.is_closed() && self.session().map_or(true, |s| s.pgconn.is_broken())
    }

    pub fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.session()?.pgconn.is_broken() {
            return Err(Error::ConnectionBroken);
        }
        Ok(())
    }

    /// Send Terminate and shut the socket down. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut session) = self.session() {
            session.pgconn.finish();
        }
        tracing::debug!("connection closed");
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        if self.is_closed() {
            return TransactionStatus::Unknown;
        }
        self.session()
            .map_or(TransactionStatus::Unknown, |s| s.status())
    }

    pub fn server_params(&self) -> Vec<(String, String)> {
        self.session()
            .map(|s| s.pgconn.server_params().to_vec())
            .unwrap_or_default()
    }

    pub fn dup_socket(&self) -> Result<OwnedFd> {
        self.session()?.pgconn.dup_socket()
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle::new(Arc::clone(&self.interrupt))
    }

    pub fn interrupt_flag(&self) -> &AtomicBool {
        &self.interrupt
    }

    /// Forget an interruption requested before the current operation.
    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> InFlight<'_> {
        InFlight {
            abandoned: &self.abandoned,
            done: false,
        }
    }

    pub fn take_abandoned(&self) -> bool {
        self.abandoned.swap(false, Ordering::SeqCst)
    }

    /// Leave the session to the recovery of the next operation.
    pub fn mark_abandoned(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    /// Whether the cancel of an interrupted command reached the server.
    ///
    /// If it did not, the command may run on for a long time, so the
    /// session is marked for recovery instead of being waited on.
    pub fn cancel_sent(&self, cancel: Result<()>) -> bool {
        match cancel {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("cancel failed, the session will be recovered before reuse: {}", err);
                self.mark_abandoned();
                false
            }
        }
    }

    pub fn add_notify_handler(&self, handler: NotifyHandler) -> HandlerId {
        self.notify_handlers.add(handler)
    }

    pub fn remove_notify_handler(&self, id: HandlerId) -> bool {
        self.notify_handlers.remove(id)
    }

    pub fn add_notice_handler(&self, handler: NoticeHandler) -> HandlerId {
        self.notice_handlers.add(handler)
    }

    pub fn remove_notice_handler(&self, id: HandlerId) -> bool {
        self.notice_handlers.remove(id)
    }
}

impl core::fmt::Debug for ConnBase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnBase")
            .field("fd", &self.fd)
            .field("backend_key", &self.backend_key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Combine the result of a scoped block with the result of leaving it.
///
/// An error from leaving is returned only if the block itself succeeded;
/// otherwise it is logged and the block's error wins.
pub(crate) fn merge_exit<R>(result: Result<R>, exit: Result<()>, scope: &str) -> Result<R> {
    match (result, exit) {
        (Err(err), Err(exit_err)) => {
            tracing::warn!("error ignored exiting {}: {}", scope, exit_err);
            Err(err)
        }
        (Ok(_), Err(exit_err)) => Err(exit_err),
        (result, Ok(())) => result,
    }
}

/// Outcome of an interrupted operation that was driven on after its
/// command was cancelled. Only an error other than the cancellation itself
/// is worth reporting.
pub(crate) fn interrupted<T>(redrive: Result<T>) -> Result<T> {
    match redrive {
        Err(err) if !err.is_query_canceled() => Err(err),
        _ => Err(Error::Interrupted),
    }
}

/// Cancel the running command over a new blocking connection to the server.
///
/// This is the fallback when the peer address of the session socket is
/// unknown. It uses the connection options, so it reaches the server the
/// session was opened against.
pub(crate) fn blocking_cancel(opts: &Opts, key: BackendKeyData) -> Result<()> {
    let mut socket = Socket::connect_blocking(opts)?;
    socket.set_read_timeout(Some(CANCEL_CONNECT_TIMEOUT))?;
    let mut packet = Vec::with_capacity(16);
    write_cancel_request(&mut packet, key.process_id(), key.secret());
    socket.write_all(&packet)?;

    let mut scratch = [0u8; 64];
    loop {
        match socket.read(&mut scratch) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
