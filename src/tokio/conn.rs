//! Asynchronous PostgreSQL connection.

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::base::{
    CANCEL_CONNECT_TIMEOUT, ConnBase, IsolationLevel, Session, TpcAction, blocking_cancel,
    interrupted, merge_exit,
};
use crate::error::{Error, ErrorFields, Result};
use crate::notify::{HandlerId, Notify};
use crate::ops::{self, OnWire, SessionGen, SyncWhen};
use crate::opts::Opts;
use crate::pgconn::{CancelTarget, PgConn, Socket};
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
use super::pipeline::Pipeline;
use super::wait::drive;

fn timed_out(elapsed: tokio::time::error::Elapsed) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::TimedOut, elapsed))
}

async fn connect_socket(opts: &Opts) -> Result<Socket> {
    if let Some(path) = &opts.socket {
        return Ok(Socket::Unix(UnixStream::connect(path).await?.into_std()?));
    }
    let connect = TcpStream::connect((opts.host.as_str(), opts.port));
    let tcp = match opts.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(timed_out)??,
        None => connect.await?,
    };
    tcp.set_nodelay(true)?;
    Ok(Socket::Tcp(tcp.into_std()?))
}

async fn connect_target(target: &CancelTarget) -> Result<Socket> {
    let connect = async {
        Ok::<_, Error>(match target {
            CancelTarget::Tcp(addr) => Socket::Tcp(TcpStream::connect(addr).await?.into_std()?),
            CancelTarget::Unix(path) => Socket::Unix(UnixStream::connect(path).await?.into_std()?),
        })
    };
    tokio::time::timeout(CANCEL_CONNECT_TIMEOUT, connect)
        .await
        .map_err(timed_out)?
}

/// Asynchronous PostgreSQL connection.
///
/// All methods take `&self`. Operations issued concurrently, e.g. from
/// `tokio::join!`, run one after the other in the order they acquire the
/// connection lock. A notification listener started with [`Conn::notifies`]
/// runs alongside them.
///
/// Dropping the future of an operation midway is safe: the next operation
/// first cancels what is still running on the server and discards the
/// replies left on the wire.
pub struct Conn {
    base: ConnBase,
    lock: Semaphore,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    pub async fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let socket = connect_socket(&opts).await?;
        let mut pgconn = PgConn::new(socket)?;
        let fd = pgconn.fd();
        let mut connect = Connect::new(&opts);
        drive(
            |ready| connect.resume(&mut pgconn, ready),
            fd,
            Some(opts.wait_interval),
            Interrupt::Ignore,
        )
        .await?;
        Ok(Self {
            base: ConnBase::new(pgconn, opts),
            lock: Semaphore::new(1),
        })
    }

    /// Close the connection. Further operations fail with [`Error::Closed`].
    pub async fn close(&self) {
        let _permit = self.lock.acquire().await;
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
    /// from another task or thread.
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
    pub async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let _permit = self.lock().await?;
        self.wait(ops::Query::new(sql)).await
    }

    /// Execute one or more `;`-separated statements with the simple query
    /// protocol. Not available in pipeline mode.
    pub async fn simple_query(&self, sql: &str) -> Result<Vec<QueryResult>> {
        let _permit = self.lock().await?;
        self.wait(ops::SimpleQuery::new(sql)).await
    }

    /// Commit the pending transaction. A no-op when no transaction is open.
    pub async fn commit(&self) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::Commit::default()).await
    }

    /// Roll back the pending transaction. A no-op when no transaction is open.
    pub async fn rollback(&self) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::Rollback::default()).await
    }

    /// Cancel the running command, if any.
    ///
    /// Sends the cancel request from a new connection to the address the
    /// session is connected to, and falls back to [`Conn::cancel`] on a
    /// blocking thread when that address is unknown.
    pub async fn cancel_safe(&self) -> Result<()> {
        if self.base.transaction_status() != TransactionStatus::Active {
            return Ok(());
        }
        match self.cancel_nonblocking().await {
            Err(Error::NotSupported(reason)) => {
                tracing::debug!("falling back to blocking cancel: {}", reason);
                self.cancel().await
            }
            other => other,
        }
    }

    /// Cancel the running command over a new connection made from the
    /// connection options, on the blocking thread pool.
    pub async fn cancel(&self) -> Result<()> {
        let key = self
            .base
            .backend_key()
            .ok_or_else(|| Error::NotSupported("server sent no backend key data".into()))?;
        let opts = self.base.opts().clone();
        tokio::task::spawn_blocking(move || blocking_cancel(&opts, key))
            .await
            .map_err(|join| Error::Io(io::Error::other(join)))?
    }

    async fn cancel_nonblocking(&self) -> Result<()> {
        let key = self
            .base
            .backend_key()
            .ok_or_else(|| Error::NotSupported("server sent no backend key data".into()))?;
        let target = self
            .base
            .cancel_target()
            .ok_or_else(|| Error::NotSupported("session socket has no peer address".into()))?;
        let socket = connect_target(target).await?;
        let mut request = CancelRequest::new(socket, &key)?;
        let fd = request.fd();
        drive(
            |ready| request.resume(ready),
            fd,
            Some(self.wait_interval()),
            Interrupt::Ignore,
        )
        .await
    }

    /// Run `f` in a transaction block.
    ///
    /// The block commits if `f` returns `Ok` and `force_rollback` is false,
    /// and rolls back otherwise. Blocks can nest; inner blocks use
    /// savepoints, named `savepoint_name` or automatically.
    pub async fn transaction<F, R>(&self, savepoint_name: Option<&str>, force_rollback: bool, f: F) -> Result<R>
    where
        F: AsyncFnOnce(&Conn, &Transaction) -> Result<R>,
    {
        if self.pipeline_level() == 0 {
            return self.transaction_scope(savepoint_name, force_rollback, false, f).await;
        }
        // pipeline, transaction, pipeline
        self.pipeline_enter().await?;
        let in_flight = self.base.in_flight();
        let result = self
            .transaction_scope(savepoint_name, force_rollback, true, f)
            .await;
        let outcome = merge_exit(result, self.pipeline_exit().await, "pipeline");
        in_flight.done();
        outcome
    }

    async fn transaction_scope<F, R>(
        &self,
        savepoint_name: Option<&str>,
        force_rollback: bool,
        inner_pipeline: bool,
        f: F,
    ) -> Result<R>
    where
        F: AsyncFnOnce(&Conn, &Transaction) -> Result<R>,
    {
        let tx = {
            let _permit = self.lock().await?;
            self.wait(ops::TransactionEnter::new(savepoint_name, force_rollback))
                .await?
        };

        let in_flight = self.base.in_flight();
        let result = if inner_pipeline {
            match self.pipeline_enter().await {
                Ok(()) => {
                    let result = f(self, &tx).await;
                    merge_exit(result, self.pipeline_exit().await, "pipeline")
                }
                Err(err) => Err(err),
            }
        } else {
            f(self, &tx).await
        };
        let outcome = self.transaction_exit(&tx, result).await;
        in_flight.done();
        outcome
    }

    async fn transaction_exit<R>(&self, tx: &Transaction, result: Result<R>) -> Result<R> {
        let _permit = self.lock.acquire().await.map_err(|_closed| Error::Closed)?;
        let exit = match self.base.with_session(Session::leave_transaction) {
            Ok(()) => match self.prepare().await {
                Ok(()) => {
                    self.wait(ops::TransactionExit::new(tx, result.is_ok()))
                        .await
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        merge_exit(result, exit, "transaction")
    }

    /// Stream notifications received from the server.
    ///
    /// The stream ends once `timeout` elapsed (checked after each batch, so
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
    pub async fn pipeline<F, R>(&self, f: F) -> Result<R>
    where
        F: AsyncFnOnce(&Pipeline<'_>) -> Result<R>,
    {
        self.pipeline_enter().await?;
        let in_flight = self.base.in_flight();
        let result = f(&Pipeline::new(self)).await;
        let outcome = merge_exit(result, self.pipeline_exit().await, "pipeline");
        in_flight.done();
        outcome
    }

    /// Current pipeline nesting depth; 0 when not pipelining.
    pub fn pipeline_level(&self) -> usize {
        self.base.with_session(|s| s.pipeline_level()).unwrap_or_default()
    }

    pub async fn set_autocommit(&self, value: bool) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::Configure::new("autocommit", move |s: &mut Session| {
            s.autocommit = value;
        }))
        .await
    }

    pub async fn set_isolation_level(&self, value: Option<IsolationLevel>) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::Configure::new("isolation_level", move |s: &mut Session| {
            s.isolation_level = value;
        }))
        .await
    }

    pub async fn set_read_only(&self, value: Option<bool>) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::Configure::new("read_only", move |s: &mut Session| {
            s.read_only = value;
        }))
        .await
    }

    pub async fn set_deferrable(&self, value: Option<bool>) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::Configure::new("deferrable", move |s: &mut Session| {
            s.deferrable = value;
        }))
        .await
    }

    /// Begin a two-phase transaction.
    pub async fn tpc_begin(&self, xid: impl Into<Xid>) -> Result<()> {
        let xid = xid.into();
        let _permit = self.lock().await?;
        self.wait(ops::TpcBegin::new(xid)).await
    }

    /// Prepare the two-phase transaction begun with [`Conn::tpc_begin`].
    ///
    /// Fails with [`Error::NotSupported`] if the server has prepared
    /// transactions disabled.
    pub async fn tpc_prepare(&self) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::TpcPrepare::default()).await
    }

    /// Commit a two-phase transaction.
    ///
    /// Without `xid`, finishes the transaction begun on this connection
    /// (in one phase if it was never prepared). With `xid`, commits a
    /// transaction prepared earlier, possibly by another session.
    pub async fn tpc_commit(&self, xid: Option<Xid>) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::TpcFinish::new(TpcAction::Commit, xid)).await
    }

    /// Roll back a two-phase transaction. See [`Conn::tpc_commit`].
    pub async fn tpc_rollback(&self, xid: Option<Xid>) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::TpcFinish::new(TpcAction::Rollback, xid)).await
    }

    /// List the prepared transactions visible to the session.
    ///
    /// If the connection was idle before, it is idle afterwards too. The
    /// connection stays locked throughout, so no other operation can slip
    /// in between the query and the rollback.
    pub async fn tpc_recover(&self) -> Result<Vec<Xid>> {
        let _permit = self.lock().await?;
        self.wait(ops::TpcRecover::default()).await
    }

    /// Acquire the connection lock and get the session ready for a new
    /// operation.
    async fn lock(&self) -> Result<SemaphorePermit<'_>> {
        let permit = self
            .lock
            .acquire()
            .await
            .map_err(|_closed| Error::Closed)?;
        self.prepare().await?;
        Ok(permit)
    }

    async fn prepare(&self) -> Result<()> {
        self.base.check_open()?;
        self.base.clear_interrupt();
        if self.base.take_abandoned() {
            self.recover().await;
        }
        Ok(())
    }

    /// Bring the session back after an operation future was dropped midway.
    async fn recover(&self) {
        tracing::warn!("recovering connection after an abandoned operation");
        if self.base.transaction_status() == TransactionStatus::Active {
            if let Err(err) = self.cancel_safe().await {
                tracing::warn!("cancel during recovery failed: {}", err);
            }
        }
        if let Err(err) = self.drive_to_end(ops::Recover::default()).await {
            tracing::warn!("failed to recover connection: {}", err);
        }
    }

    async fn pipeline_enter(&self) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::PipelineEnter::default()).await
    }

    /// Leave one pipeline level, syncing first.
    async fn pipeline_exit(&self) -> Result<()> {
        let _permit = self.lock.acquire().await.map_err(|_closed| Error::Closed)?;
        let result = match self.prepare().await {
            Ok(()) => self.wait(ops::SyncPipeline::new(SyncWhen::Always)).await,
            Err(err) => Err(err),
        };
        let left = self.base.with_session(Session::leave_pipeline);
        result.and(left)
    }

    pub(super) async fn pipeline_queue(&self, sql: &str) -> Result<Ticket> {
        let _permit = self.lock().await?;
        self.wait(ops::PipelineQueue::new(sql)).await
    }

    pub(super) async fn pipeline_sync(&self) -> Result<()> {
        let _permit = self.lock().await?;
        self.wait(ops::SyncPipeline::new(SyncWhen::Always)).await
    }

    pub(super) async fn pipeline_claim(&self, ticket: Ticket) -> Result<QueryResult> {
        let _permit = self.lock().await?;
        self.wait(ops::Claim::new(ticket)).await
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
    pub(super) async fn poll_notifies(
        &self,
        fd: RawFd,
        interval: Duration,
        interrupt: &AtomicBool,
    ) -> Result<()> {
        let base = &self.base;
        let mut poll = OnWire(notifies::Notifies::default());
        drive(
            |ready| base.resume(&mut poll, ready),
            fd,
            Some(interval),
            Interrupt::Observe(interrupt),
        )
        .await
    }

    /// Drive an operation on the session socket.
    ///
    /// The caller holds the connection lock.
    async fn wait<G: SessionGen>(&self, mut op: G) -> Result<G::Output> {
        let in_flight = self.base.in_flight();
        let result = self.drive_interruptible(&mut op).await;
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
    async fn drive_interruptible<G: SessionGen>(&self, op: &mut G) -> Result<G::Output> {
        let base = &self.base;
        let fd = base.fd();
        let interval = Some(self.wait_interval());
        match drive(
            |ready| base.resume(&mut *op, ready),
            fd,
            interval,
            Interrupt::Observe(base.interrupt_flag()),
        )
        .await
        {
            Err(Error::Interrupted) => {}
            other => return other,
        }

        if base.transaction_status() == TransactionStatus::Active {
            tracing::warn!("operation interrupted, cancelling the running command");
            if base.cancel_sent(self.cancel_safe().await) {
                return interrupted(
                    drive(
                        |ready| base.resume(&mut *op, ready),
                        fd,
                        interval,
                        Interrupt::Ignore,
                    )
                    .await,
                );
            }
        }
        Err(Error::Interrupted)
    }

    /// Drive an operation to its end, ignoring interruption.
    async fn drive_to_end<G: SessionGen>(&self, mut op: G) -> Result<G::Output> {
        let base = &self.base;
        drive(
            |ready| base.resume(&mut op, ready),
            base.fd(),
            Some(self.wait_interval()),
            Interrupt::Ignore,
        )
        .await
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
