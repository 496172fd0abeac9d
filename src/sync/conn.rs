//! Synchronous PostgreSQL connection.

use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use std_semaphore::{Semaphore, SemaphoreGuard};

use crate::base::{
    CANCEL_CONNECT_TIMEOUT, ConnBase, IsolationLevel, Session, TpcAction, blocking_cancel,
    interrupted, merge_exit,
};
use crate::error::{Error, ErrorFields, Result};
use crate::notify::{HandlerId, Notify};
use crate::ops::{self, OnWire, SessionGen, SyncWhen};
use crate::opts::Opts;
use crate::pgconn::{PgConn, Socket};
use crate::pipeline::Ticket;
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;
use crate::state::PgGen;
use crate::state::cancel::CancelRequest;
use crate::state::connection::Connect;
use crate::state::notifies;
use crate::tpc::Xid;
use crate::transaction::Transaction;
use crate::wait::{Interrupt, InterruptHandle};

use super::notifies::Notifies;
use super::pipeline::{Pipeline, PipelineScope};
use super::wait::drive;

/// Synchronous PostgreSQL connection.
///
/// All methods take `&self`: the connection can be shared between threads,
/// and operations issued concurrently run one after the other in the order
/// they acquire the connection lock. A notification listener started with
/// [`Conn::notifies`] runs alongside them.
pub struct Conn {
    base: ConnBase,
    lock: Semaphore,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    pub fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let socket = Socket::connect_blocking(&opts)?;
        let mut pgconn = PgConn::new(socket)?;
        let fd = pgconn.fd();
        let mut connect = Connect::new(&opts);
        drive(
            |ready| connect.resume(&mut pgconn, ready),
            fd,
            Some(opts.wait_interval),
            Interrupt::Ignore,
        )?;
        Ok(Self {
            base: ConnBase::new(pgconn, opts),
            lock: Semaphore::new(1),
        })
    }

    /// Close the connection. Further operations fail with [`Error::Closed`].
    pub fn close(&self) {
        let _guard = self.lock.access();
        self.base.close();
    }

    pub fn closed(&self) -> bool {
        self.base.is_closed()
    }

    /// True if the connection was lost without [`Conn::close`] being called.
    pub fn broken(&self) -> bool {
        self.base.is_broken()
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.base.backend_key().map(|k| k.process_id())
    }

    pub fn server_params(&self) -> Vec<(String, String)> {
        self.base.server_params()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.base.transaction_status()
    }

    /// Handle used to interrupt the operation running on this connection
    /// from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.base.interrupt_handle()
    }

    pub fn autocommit(&self) -> bool {
        self.base.with_session(|s| s.autocommit).unwrap_or_default()
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.base.with_session(|s| s.isolation_level).ok().flatten()
    }

    pub fn read_only(&self) -> Option<bool> {
        self.base.with_session(|s| s.read_only).ok().flatten()
    }

    pub fn deferrable(&self) -> Option<bool> {
        self.base.with_session(|s| s.deferrable).ok().flatten()
    }

    /// Execute a single statement.
    ///
    /// Unless autocommit is on, a transaction is started first if none is
    /// open. In pipeline mode the statement is queued and its result fetched
    /// right away; use [`Pipeline::execute`] to batch statements.
    pub fn execute(&self, sql: &str) -> Result<QueryResult> {
        let _guard = self.lock()?;
        self.wait(ops::Query::new(sql))
    }

    /// Execute one or more `;`-separated statements with the simple query
    /// protocol. Not available in pipeline mode.
    pub fn simple_query(&self, sql: &str) -> Result<Vec<QueryResult>> {
        let _guard = self.lock()?;
        self.wait(ops::SimpleQuery::new(sql))
    }

    /// Commit the pending transaction. A no-op when no transaction is open.
    pub fn commit(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::Commit::default())
    }

    /// Roll back the pending transaction. A no-op when no transaction is open.
    pub fn rollback(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::Rollback::default())
    }

    /// Cancel the running command, if any.
    ///
    /// Sends the cancel request from a new connection to the address the
    /// session is connected to, and falls back to [`Conn::cancel`] when that
    /// address is unknown.
    pub fn cancel_safe(&self) -> Result<()> {
        if self.base.transaction_status() != TransactionStatus::Active {
            return Ok(());
        }
        match self.cancel_nonblocking() {
            Err(Error::NotSupported(reason)) => {
                tracing::debug!("falling back to blocking cancel: {}", reason);
                self.cancel()
            }
            other => other,
        }
    }

    /// Cancel the running command over a new connection made from the
    /// connection options. Blocks until the server handled the request.
    pub fn cancel(&self) -> Result<()> {
        let key = self
            .base
            .backend_key()
            .ok_or_else(|| Error::NotSupported("server sent no backend key data".into()))?;
        blocking_cancel(self.base.opts(), key)
    }

    fn cancel_nonblocking(&self) -> Result<()> {
        let key = self
            .base
            .backend_key()
            .ok_or_else(|| Error::NotSupported("server sent no backend key data".into()))?;
        let target = self
            .base
            .cancel_target()
            .ok_or_else(|| Error::NotSupported("session socket has no peer address".into()))?;
        let socket = Socket::connect_target(target, CANCEL_CONNECT_TIMEOUT)?;
        let mut request = CancelRequest::new(socket, &key)?;
        let fd = request.fd();
        drive(
            |ready| request.resume(ready),
            fd,
            Some(self.base.opts().wait_interval),
            Interrupt::Ignore,
        )
    }

    /// Run `f` in a transaction block.
    ///
    /// The block commits if `f` returns `Ok` and `force_rollback` is false,
    /// and rolls back otherwise. Blocks can nest; inner blocks use
    /// savepoints, named `savepoint_name` or automatically.
    pub fn transaction<F, R>(&self, savepoint_name: Option<&str>, force_rollback: bool, f: F) -> Result<R>
    where
        F: FnOnce(&Conn, &Transaction) -> Result<R>,
    {
        if self.pipeline_level() > 0 {
            return self.pipeline(|_| {
                self.transaction_scope(savepoint_name, force_rollback, |conn, tx| {
                    conn.pipeline(|_| f(conn, tx))
                })
            });
        }
        self.transaction_scope(savepoint_name, force_rollback, f)
    }

    fn transaction_scope<F, R>(&self, savepoint_name: Option<&str>, force_rollback: bool, f: F) -> Result<R>
    where
        F: FnOnce(&Conn, &Transaction) -> Result<R>,
    {
        let tx = {
            let _guard = self.lock()?;
            self.wait(ops::TransactionEnter::new(savepoint_name, force_rollback))?
        };

        let in_flight = self.base.in_flight();
        let result = f(self, &tx);
        let outcome = self.transaction_exit(&tx, result);
        in_flight.done();
        outcome
    }

    fn transaction_exit<R>(&self, tx: &Transaction, result: Result<R>) -> Result<R> {
        let _guard = self.lock.access();
        let exit = self
            .base
            .with_session(Session::leave_transaction)
            .and_then(|()| self.prepare())
            .and_then(|()| self.wait(ops::TransactionExit::new(tx, result.is_ok())));
        merge_exit(result, exit, "transaction")
    }

    /// Iterate over notifications received from the server.
    ///
    /// The iterator ends once `timeout` elapsed (checked after each batch, so
    /// a zero timeout polls exactly once) or after at least `stop_after`
    /// notifications. Other operations may run on the connection meanwhile.
    pub fn notifies(&self, timeout: Option<Duration>, stop_after: Option<usize>) -> Result<Notifies<'_>> {
        self.base.check_open()?;
        Notifies::new(self, timeout, stop_after)
    }

    /// Register a callback for every notification received.
    pub fn add_notify_handler(&self, handler: impl Fn(&Notify) + Send + Sync + 'static) -> HandlerId {
        self.base.add_notify_handler(Arc::new(handler))
    }

    pub fn remove_notify_handler(&self, id: HandlerId) -> bool {
        self.base.remove_notify_handler(id)
    }

    /// Register a callback for every notice received.
    ///
    /// Notices are logged at debug level while no handler is registered.
    pub fn add_notice_handler(&self, handler: impl Fn(&ErrorFields) + Send + Sync + 'static) -> HandlerId {
        self.base.add_notice_handler(Arc::new(handler))
    }

    pub fn remove_notice_handler(&self, id: HandlerId) -> bool {
        self.base.remove_notice_handler(id)
    }

    /// Run `f` in pipeline mode.
    ///
    /// Statements are sent without waiting for their results. Every exit
    /// from a pipeline block, including an error exit, syncs and reads all
    /// outstanding results. Blocks can nest.
    pub fn pipeline<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Pipeline<'_>) -> Result<R>,
    {
        self.pipeline_enter()?;
        let scope = PipelineScope::new(self);
        let result = f(&Pipeline::new(self));
        scope.exit(result)
    }

    /// Current pipeline nesting depth; 0 when not pipelining.
    pub fn pipeline_level(&self) -> usize {
        self.base.with_session(|s| s.pipeline_level()).unwrap_or_default()
    }

    pub fn set_autocommit(&self, value: bool) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::Configure::new("autocommit", |s: &mut Session| s.autocommit = value))
    }

    pub fn set_isolation_level(&self, value: Option<IsolationLevel>) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::Configure::new("isolation_level", |s: &mut Session| {
            s.isolation_level = value;
        }))
    }

    pub fn set_read_only(&self, value: Option<bool>) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::Configure::new("read_only", |s: &mut Session| s.read_only = value))
    }

    pub fn set_deferrable(&self, value: Option<bool>) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::Configure::new("deferrable", |s: &mut Session| s.deferrable = value))
    }

    /// Begin a two-phase transaction.
    pub fn tpc_begin(&self, xid: impl Into<Xid>) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::TpcBegin::new(xid.into()))
    }

    /// Prepare the two-phase transaction begun with [`Conn::tpc_begin`].
    ///
    /// Fails with [`Error::NotSupported`] if the server has prepared
    /// transactions disabled.
    pub fn tpc_prepare(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::TpcPrepare::default())
    }

    /// Commit a two-phase transaction.
    ///
    /// Without `xid`, finishes the transaction begun on this connection
    /// (in one phase if it was never prepared). With `xid`, commits a
    /// transaction prepared earlier, possibly by another session.
    pub fn tpc_commit(&self, xid: Option<Xid>) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::TpcFinish::new(TpcAction::Commit, xid))
    }

    /// Roll back a two-phase transaction. See [`Conn::tpc_commit`].
    pub fn tpc_rollback(&self, xid: Option<Xid>) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::TpcFinish::new(TpcAction::Rollback, xid))
    }

    /// List the prepared transactions visible to the session.
    ///
    /// If the connection was idle before, it is idle afterwards too. The
    /// connection stays locked throughout, so no other operation can slip
    /// in between the query and the rollback.
    pub fn tpc_recover(&self) -> Result<Vec<Xid>> {
        let _guard = self.lock()?;
        self.wait(ops::TpcRecover::default())
    }

    /// Acquire the connection lock and get the session ready for a new
    /// operation.
    fn lock(&self) -> Result<SemaphoreGuard<'_>> {
        let guard = self.lock.access();
        self.prepare()?;
        Ok(guard)
    }

    fn prepare(&self) -> Result<()> {
        self.base.check_open()?;
        self.base.clear_interrupt();
        if self.base.take_abandoned() {
            self.recover();
        }
        Ok(())
    }

    /// Bring the session back after an operation was abandoned midway.
    fn recover(&self) {
        tracing::warn!("recovering connection after an abandoned operation");
        if self.base.transaction_status() == TransactionStatus::Active {
            if let Err(err) = self.cancel_safe() {
                tracing::warn!("cancel during recovery failed: {}", err);
            }
        }
        if let Err(err) = self.drive_to_end(ops::Recover::default()) {
            tracing::warn!("failed to recover connection: {}", err);
        }
    }

    pub(super) fn pipeline_enter(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::PipelineEnter::default())
    }

    /// Leave one pipeline level, syncing first.
    pub(super) fn pipeline_exit(&self) -> Result<()> {
        let _guard = self.lock.access();
        let result = self
            .prepare()
            .and_then(|()| self.wait(ops::SyncPipeline::new(SyncWhen::Always)));
        let left = self.base.with_session(Session::leave_pipeline);
        result.and(left)
    }

    pub(super) fn pipeline_queue(&self, sql: &str) -> Result<Ticket> {
        let _guard = self.lock()?;
        self.wait(ops::PipelineQueue::new(sql))
    }

    pub(super) fn pipeline_sync(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.wait(ops::SyncPipeline::new(SyncWhen::Always))
    }

    pub(super) fn pipeline_claim(&self, ticket: Ticket) -> Result<QueryResult> {
        let _guard = self.lock()?;
        self.wait(ops::Claim::new(ticket))
    }

    pub(super) fn dup_socket(&self) -> Result<OwnedFd> {
        self.base.dup_socket()
    }

    pub(super) fn wait_interval(&self) -> Duration {
        self.base.opts().wait_interval
    }

    /// Wait for one batch of notifications on the duplicated descriptor.
    ///
    /// `interrupt` is the listener's own flag. Interrupting the listener
    /// does not touch a command running in the foreground.
    pub(super) fn poll_notifies(&self, fd: RawFd, interval: Duration, interrupt: &AtomicBool) -> Result<()> {
        let base = &self.base;
        let mut poll = OnWire(notifies::Notifies::default());
        drive(
            |ready| base.resume(&mut poll, ready),
            fd,
            Some(interval),
            Interrupt::Observe(interrupt),
        )
    }

    /// Drive an operation on the session socket.
    ///
    /// The caller holds the connection lock.
    fn wait<G: SessionGen>(&self, mut op: G) -> Result<G::Output> {
        let in_flight = self.base.in_flight();
        let result = self.drive_interruptible(&mut op);
        in_flight.done();
        result
    }

    /// Drive `op`, honouring interruption.
    ///
    /// On interruption while a command is running, the command is cancelled
    /// and `op` is driven on until the server acknowledged the cancel, so the
    /// session is not left busy. If the cancel could not be sent, the session
    /// is left to the recovery of the next operation instead. The result is
    /// [`Error::Interrupted`] unless the re-drive failed for another reason.
    fn drive_interruptible<G: SessionGen>(&self, op: &mut G) -> Result<G::Output> {
        let base = &self.base;
        let fd = base.fd();
        let interval = Some(self.wait_interval());
        match drive(
            |ready| base.resume(&mut *op, ready),
            fd,
            interval,
            Interrupt::Observe(base.interrupt_flag()),
        ) {
            Err(Error::Interrupted) => {}
            other => return other,
        }

        if base.transaction_status() == TransactionStatus::Active {
            tracing::warn!("operation interrupted, cancelling the running command");
            if base.cancel_sent(self.cancel_safe()) {
                return interrupted(drive(
                    |ready| base.resume(&mut *op, ready),
                    fd,
                    interval,
                    Interrupt::Ignore,
                ));
            }
        }
        Err(Error::Interrupted)
    }

    /// Drive an operation to its end, ignoring interruption.
    fn drive_to_end<G: SessionGen>(&self, mut op: G) -> Result<G::Output> {
        let base = &self.base;
        drive(
            |ready| base.resume(&mut op, ready),
            base.fd(),
            Some(self.wait_interval()),
            Interrupt::Ignore,
        )
    }
}

impl core::fmt::Debug for Conn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Conn").field("base", &self.base).finish()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.base.close();
    }
}
