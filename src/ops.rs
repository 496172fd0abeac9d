//! Connection operations as step-sequences over the whole session.
//!
//! Every public operation of the blocking and tokio connections is one value
//! here. It reads and updates the session bookkeeping (settings, pipeline,
//! two-phase state) between the protocol step-sequences it runs, so a
//! connection variant only takes its lock and drives the operation with its
//! own waiter. The lock is held for the whole operation.

use crate::base::{Session, TpcAction, TpcEnd};
use crate::error::{Error, Result, sqlstate};
use crate::pipeline::Ticket;
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;
use crate::state::drain::Drain;
use crate::state::execute::Execute;
use crate::state::pipeline::{FetchUntil, PipelineFetch};
use crate::state::{PgGen, Ready, Step};
use crate::tpc::{RECOVER_QUERY, Xid};
use crate::transaction::Transaction;

/// A resumable operation on a session.
///
/// Same contract as [`PgGen`], with the session bookkeeping at hand.
pub(crate) trait SessionGen {
    type Output;

    fn resume(&mut self, session: &mut Session, ready: Ready) -> Result<Step<Self::Output>>;
}

/// Unwrap a finished step, or hand its wait back to the driver.
macro_rules! step {
    ($step:expr) => {
        match $step {
            Step::Done(value) => value,
            Step::Wait(wait) => return Ok(Step::Wait(wait)),
        }
    };
}

/// Resume the part kept in `slot`, planning it from the session first if
/// this is the first resume. A plan that fails leaves the slot empty.
fn planned<G: SessionGen>(
    slot: &mut Option<G>,
    s: &mut Session,
    ready: Ready,
    plan: impl FnOnce(&mut Session) -> Result<G>,
) -> Result<Step<G::Output>> {
    let mut part = match slot.take() {
        Some(part) => part,
        None => plan(s)?,
    };
    let step = part.resume(s, ready);
    *slot = Some(part);
    step
}

/// A protocol step-sequence run on the session's connection.
#[derive(Debug)]
pub(crate) struct OnWire<G>(pub G);

impl<G: PgGen> SessionGen for OnWire<G> {
    type Output = G::Output;

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<G::Output>> {
        self.0.resume(&mut s.pgconn, ready)
    }
}

/// Commands whose results are not needed.
///
/// While pipelining they are only queued and their results are dropped as
/// they arrive. Otherwise they run as one simple query.
#[derive(Debug)]
pub(crate) struct RunCommands {
    commands: Vec<String>,
    exec: Option<Execute>,
}

impl RunCommands {
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            commands,
            exec: None,
        }
    }
}

impl SessionGen for RunCommands {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        if let Some(exec) = &mut self.exec {
            step!(exec.resume(&mut s.pgconn, ready)?);
            return Ok(Step::Done(()));
        }
        if self.commands.is_empty() {
            return Ok(Step::Done(()));
        }
        let commands = core::mem::take(&mut self.commands);
        if s.pipeline.is_some() {
            for command in &commands {
                s.queue_internal(command);
            }
            return Ok(Step::Done(()));
        }
        self.exec = Some(Execute::new(commands.join("; ")));
        self.resume(s, ready)
    }
}

/// Issue the transaction start command if the session needs one.
#[derive(Debug, Default)]
pub(crate) struct StartQuery {
    run: Option<RunCommands>,
}

impl SessionGen for StartQuery {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        planned(&mut self.run, s, ready, |s| {
            let begin = s.needs_begin().then(|| s.begin_command());
            Ok(RunCommands::new(begin.into_iter().collect()))
        })
    }
}

/// When a [`SyncPipeline`] sends its Sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncWhen {
    Always,
    /// Only in pipeline mode
    Pipelining,
    /// Only in pipeline mode with commands outstanding
    Pending,
}

/// Send a Sync and read every outstanding pipeline result.
///
/// Completes with the first error reported since the previous sync.
#[derive(Debug)]
pub(crate) struct SyncPipeline {
    when: SyncWhen,
    fetch: Option<OnWire<PipelineFetch>>,
}

impl SyncPipeline {
    pub fn new(when: SyncWhen) -> Self {
        Self { when, fetch: None }
    }

    fn skip(&self, s: &Session) -> bool {
        match self.when {
            SyncWhen::Always => false,
            SyncWhen::Pipelining => s.pipeline.is_none(),
            SyncWhen::Pending => s.pipeline.is_none() || !s.pgconn.has_pending(),
        }
    }
}

impl SessionGen for SyncPipeline {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        if self.fetch.is_none() && self.skip(s) {
            return Ok(Step::Done(()));
        }
        let harvest = step!(planned(&mut self.fetch, s, ready, |s| {
            s.pgconn.send_sync();
            Ok(OnWire(PipelineFetch::new(FetchUntil::Drained, false)))
        })?);
        match s.store(harvest) {
            Some(err) => Err(err),
            None => Ok(Step::Done(())),
        }
    }
}

/// Commands followed by a sync when pipelining. Nothing to run, no sync.
#[derive(Debug)]
pub(crate) struct RunAndSync {
    run: Option<RunCommands>,
    sync: Option<SyncPipeline>,
}

impl RunAndSync {
    pub fn new(commands: Vec<String>) -> Self {
        let sync = (!commands.is_empty()).then(|| SyncPipeline::new(SyncWhen::Pipelining));
        Self {
            run: Some(RunCommands::new(commands)),
            sync,
        }
    }
}

impl SessionGen for RunAndSync {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        if let Some(run) = &mut self.run {
            step!(run.resume(s, ready)?);
            self.run = None;
        }
        match &mut self.sync {
            Some(sync) => sync.resume(s, ready),
            None => Ok(Step::Done(())),
        }
    }
}

/// Take the result of a pipeline ticket, reading up to it if needed.
#[derive(Debug)]
pub(crate) struct Claim {
    ticket: Ticket,
    fetch: Option<OnWire<PipelineFetch>>,
}

impl Claim {
    pub fn new(ticket: Ticket) -> Self {
        Self {
            ticket,
            fetch: None,
        }
    }
}

impl SessionGen for Claim {
    type Output = QueryResult;

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<QueryResult>> {
        let ticket = self.ticket;
        if self.fetch.is_none() {
            if let Some(result) = s.take_result(ticket) {
                return result.map(Step::Done);
            }
        }
        let harvest = step!(planned(&mut self.fetch, s, ready, |s| {
            if !s.pgconn.expects(ticket.0) {
                return Err(Error::InvalidUsage(
                    "pipeline result was already claimed or never queued".into(),
                ));
            }
            // replies of commands not followed by a Sync need a Flush
            let flush = s.pgconn.unsynced() > 0;
            Ok(OnWire(PipelineFetch::new(FetchUntil::Ticket(ticket.0), flush)))
        })?);
        let _ = s.store(harvest);
        s.take_result(ticket)
            .unwrap_or_else(|| Err(Error::Protocol("pipeline result went missing".into())))
            .map(Step::Done)
    }
}

#[derive(Debug)]
enum QueryStage {
    Start(StartQuery),
    Claim(Claim),
    Fetch(u64, PipelineFetch),
}

/// Execute one statement with the extended protocol.
///
/// Outside a pipeline the statement is followed by a Sync and its result
/// read at once. In pipeline mode it is queued and claimed right away.
#[derive(Debug)]
pub(crate) struct Query<'a> {
    sql: &'a str,
    stage: QueryStage,
}

impl<'a> Query<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            stage: QueryStage::Start(StartQuery::default()),
        }
    }
}

impl SessionGen for Query<'_> {
    type Output = QueryResult;

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<QueryResult>> {
        loop {
            match &mut self.stage {
                QueryStage::Start(start) => {
                    step!(start.resume(s, ready)?);
                    let ticket = s.queue(self.sql);
                    self.stage = if s.pipeline.is_some() {
                        QueryStage::Claim(Claim::new(ticket))
                    } else {
                        s.pgconn.send_sync();
                        QueryStage::Fetch(ticket.0, PipelineFetch::new(FetchUntil::Drained, false))
                    };
                }
                QueryStage::Claim(claim) => return claim.resume(s, ready),
                QueryStage::Fetch(id, fetch) => {
                    let id = *id;
                    let harvest = step!(fetch.resume(&mut s.pgconn, ready)?);
                    return harvest
                        .into_iter()
                        .find(|(harvested, _)| *harvested == id)
                        .map_or_else(
                            || Err(Error::Protocol("no reply for statement".into())),
                            |(_, result)| result,
                        )
                        .map(Step::Done);
                }
            }
        }
    }
}

/// Run `;`-separated statements with the simple query protocol.
#[derive(Debug)]
pub(crate) struct SimpleQuery<'a> {
    sql: &'a str,
    start: StartQuery,
    exec: Option<Execute>,
}

impl<'a> SimpleQuery<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            start: StartQuery::default(),
            exec: None,
        }
    }
}

impl SessionGen for SimpleQuery<'_> {
    type Output = Vec<QueryResult>;

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<Vec<QueryResult>>> {
        if self.exec.is_none() {
            if s.pipeline.is_some() {
                return Err(Error::InvalidUsage(
                    "simple_query() cannot be used in pipeline mode".into(),
                ));
            }
            step!(self.start.resume(s, ready)?);
        }
        let sql = self.sql;
        self.exec
            .get_or_insert_with(|| Execute::new(sql))
            .resume(&mut s.pgconn, ready)
    }
}

/// Commit the pending transaction; a no-op when idle.
#[derive(Debug, Default)]
pub(crate) struct Commit(Option<RunAndSync>);

impl SessionGen for Commit {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        planned(&mut self.0, s, ready, |s| {
            s.check_commit()?;
            Ok(RunAndSync::new(match s.status() {
                TransactionStatus::Idle => Vec::new(),
                _ => vec!["COMMIT".into()],
            }))
        })
    }
}

/// Roll back the pending transaction; a no-op when idle.
///
/// In pipeline mode the aborted segment, if any, is synced away first and
/// its errors ignored.
#[derive(Debug, Default)]
pub(crate) struct Rollback {
    leave: Option<SyncPipeline>,
    run: Option<RunAndSync>,
}

impl SessionGen for Rollback {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        if self.run.is_none() {
            let left = planned(&mut self.leave, s, ready, |s| {
                s.check_rollback()?;
                Ok(SyncPipeline::new(SyncWhen::Pipelining))
            });
            match left {
                Ok(Step::Wait(wait)) => return Ok(Step::Wait(wait)),
                Ok(Step::Done(())) => {}
                Err(err @ (Error::Server(_) | Error::PipelineAborted)) => {
                    tracing::debug!("pipeline error before rollback: {}", err);
                }
                Err(err) => return Err(err),
            }
        }
        planned(&mut self.run, s, ready, |s| {
            Ok(RunAndSync::new(match s.status() {
                TransactionStatus::Idle => Vec::new(),
                _ => vec!["ROLLBACK".into()],
            }))
        })
    }
}

/// Change a session characteristic, refused while a transaction is open.
pub(crate) struct Configure<F> {
    attribute: &'static str,
    apply: Option<F>,
    sync: SyncPipeline,
}

impl<F: FnOnce(&mut Session)> Configure<F> {
    pub fn new(attribute: &'static str, apply: F) -> Self {
        Self {
            attribute,
            apply: Some(apply),
            sync: SyncPipeline::new(SyncWhen::Pipelining),
        }
    }
}

impl<F: FnOnce(&mut Session)> SessionGen for Configure<F> {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        step!(self.sync.resume(s, ready)?);
        s.check_can_change(self.attribute)?;
        if let Some(apply) = self.apply.take() {
            apply(s);
        }
        Ok(Step::Done(()))
    }
}

#[derive(Debug)]
struct Entering {
    tx: Transaction,
    run: RunCommands,
}

impl SessionGen for Entering {
    type Output = Transaction;

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<Transaction>> {
        step!(self.run.resume(s, ready)?);
        Ok(Step::Done(self.tx.clone()))
    }
}

/// Open a transaction block: `BEGIN` and/or `SAVEPOINT`.
#[derive(Debug)]
pub(crate) struct TransactionEnter<'a> {
    savepoint_name: Option<&'a str>,
    force_rollback: bool,
    entering: Option<Entering>,
}

impl<'a> TransactionEnter<'a> {
    pub fn new(savepoint_name: Option<&'a str>, force_rollback: bool) -> Self {
        Self {
            savepoint_name,
            force_rollback,
            entering: None,
        }
    }
}

impl SessionGen for TransactionEnter<'_> {
    type Output = Transaction;

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<Transaction>> {
        let (savepoint_name, force_rollback) = (self.savepoint_name, self.force_rollback);
        let step = planned(&mut self.entering, s, ready, |s| {
            let tx = Transaction::plan(s.status(), s.num_transactions, savepoint_name, force_rollback)?;
            s.num_transactions += 1;
            let run = RunCommands::new(tx.enter_commands(s.begin_command()));
            Ok(Entering { tx, run })
        });
        if step.is_err() && self.entering.is_some() {
            s.leave_transaction();
        }
        step
    }
}

/// Close a transaction block. Errors while rolling back are logged only.
#[derive(Debug)]
pub(crate) struct TransactionExit {
    commit: bool,
    run: RunCommands,
}

impl TransactionExit {
    /// `succeeded` is whether the block itself returned `Ok`.
    pub fn new(tx: &Transaction, succeeded: bool) -> Self {
        let commit = succeeded && !tx.force_rollback();
        let commands = if commit {
            tx.commit_commands()
        } else {
            tx.rollback_commands()
        };
        Self {
            commit,
            run: RunCommands::new(commands),
        }
    }
}

impl SessionGen for TransactionExit {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        match self.run.resume(s, ready) {
            Err(err) if !self.commit => {
                tracing::warn!("error ignored in rollback of transaction: {}", err);
                Ok(Step::Done(()))
            }
            other => other,
        }
    }
}

/// Enter one pipeline level, syncing first if commands are outstanding.
#[derive(Debug)]
pub(crate) struct PipelineEnter(SyncPipeline);

impl Default for PipelineEnter {
    fn default() -> Self {
        Self(SyncPipeline::new(SyncWhen::Pending))
    }
}

impl SessionGen for PipelineEnter {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        step!(self.0.resume(s, ready)?);
        s.enter_pipeline();
        Ok(Step::Done(()))
    }
}

/// Queue a statement on the pipeline and return its ticket.
#[derive(Debug)]
pub(crate) struct PipelineQueue<'a> {
    sql: &'a str,
    start: StartQuery,
}

impl<'a> PipelineQueue<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            start: StartQuery::default(),
        }
    }
}

impl SessionGen for PipelineQueue<'_> {
    type Output = Ticket;

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<Ticket>> {
        if s.pipeline.is_none() {
            return Err(Error::InvalidUsage("the pipeline is closed".into()));
        }
        step!(self.start.resume(s, ready)?);
        Ok(Step::Done(s.queue(self.sql)))
    }
}

/// Begin a two-phase transaction.
#[derive(Debug)]
pub(crate) struct TpcBegin {
    xid: Xid,
    run: Option<RunCommands>,
}

impl TpcBegin {
    pub fn new(xid: Xid) -> Self {
        Self { xid, run: None }
    }
}

impl SessionGen for TpcBegin {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        let xid = &self.xid;
        planned(&mut self.run, s, ready, |s| {
            Ok(RunCommands::new(vec![s.tpc_begin(xid.clone())?]))
        })
    }
}

/// `PREPARE TRANSACTION`. A server with prepared transactions disabled
/// yields [`Error::NotSupported`].
#[derive(Debug, Default)]
pub(crate) struct TpcPrepare(Option<RunAndSync>);

impl SessionGen for TpcPrepare {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        planned(&mut self.0, s, ready, |s| Ok(RunAndSync::new(vec![s.tpc_prepare()?])))
            .map_err(|err| {
                if err.sqlstate() == Some(sqlstate::OBJECT_NOT_IN_PREREQUISITE_STATE) {
                    Error::NotSupported(err.to_string())
                } else {
                    err
                }
            })
    }
}

#[derive(Debug)]
enum Ending {
    Commit(Commit),
    Rollback(Rollback),
    Prepared(RunAndSync),
}

impl SessionGen for Ending {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        match self {
            Ending::Commit(commit) => commit.resume(s, ready),
            Ending::Rollback(rollback) => rollback.resume(s, ready),
            Ending::Prepared(run) => {
                step!(run.resume(s, ready)?);
                s.tpc = None;
                Ok(Step::Done(()))
            }
        }
    }
}

/// Commit or roll back a two-phase transaction.
#[derive(Debug)]
pub(crate) struct TpcFinish {
    action: TpcAction,
    xid: Option<Xid>,
    ending: Option<Ending>,
}

impl TpcFinish {
    pub fn new(action: TpcAction, xid: Option<Xid>) -> Self {
        Self {
            action,
            xid,
            ending: None,
        }
    }
}

impl SessionGen for TpcFinish {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        let (action, xid) = (self.action, &mut self.xid);
        planned(&mut self.ending, s, ready, |s| {
            Ok(match s.tpc_end(action, xid.take())? {
                TpcEnd::OnePhase(TpcAction::Commit) => Ending::Commit(Commit::default()),
                TpcEnd::OnePhase(TpcAction::Rollback) => Ending::Rollback(Rollback::default()),
                TpcEnd::Prepared(command) => Ending::Prepared(RunAndSync::new(vec![command])),
            })
        })
    }
}

/// List prepared transactions. A transaction opened only for the query is
/// rolled back, so an idle session stays idle.
#[derive(Debug, Default)]
pub(crate) struct TpcRecover {
    idle_before: bool,
    query: Option<Query<'static>>,
    xids: Vec<Xid>,
    rollback: Option<Rollback>,
}

impl SessionGen for TpcRecover {
    type Output = Vec<Xid>;

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<Vec<Xid>>> {
        if self.rollback.is_none() {
            let idle_before = &mut self.idle_before;
            let result = step!(planned(&mut self.query, s, ready, |s| {
                *idle_before = s.status() == TransactionStatus::Idle;
                Ok(Query::new(RECOVER_QUERY))
            })?);
            self.xids = result
                .rows()
                .iter()
                .map(|row| Xid::from_record(row))
                .collect::<Result<Vec<_>>>()?;
            if !(self.idle_before && s.status() == TransactionStatus::InTransaction) {
                return Ok(Step::Done(core::mem::take(&mut self.xids)));
            }
            self.rollback = Some(Rollback::default());
        }
        if let Some(rollback) = &mut self.rollback {
            step!(rollback.resume(s, ready)?);
        }
        Ok(Step::Done(core::mem::take(&mut self.xids)))
    }
}

/// Bring the session back after an operation was abandoned midway.
///
/// Discards the replies left on the wire, forgets pipeline and scope
/// bookkeeping, and rolls back a transaction a scope had opened. Runs
/// after the running command, if any, was cancelled.
#[derive(Debug, Default)]
pub(crate) struct Recover {
    drain: Drain,
    rollback: Option<Execute>,
}

impl SessionGen for Recover {
    type Output = ();

    fn resume(&mut self, s: &mut Session, ready: Ready) -> Result<Step<()>> {
        if self.rollback.is_none() {
            if let Some(err) = step!(self.drain.resume(&mut s.pgconn, ready)?) {
                if !err.is_query_canceled() {
                    tracing::debug!("error discarded while draining: {}", err);
                }
            }
            if !s.reset_after_abandon() {
                return Ok(Step::Done(()));
            }
            self.rollback = Some(Execute::new("ROLLBACK"));
        }
        if let Some(rollback) = &mut self.rollback {
            match rollback.resume(&mut s.pgconn, ready) {
                Ok(Step::Wait(wait)) => return Ok(Step::Wait(wait)),
                Ok(Step::Done(_)) => {}
                Err(err) => tracing::warn!("rollback during recovery failed: {}", err),
            }
        }
        Ok(Step::Done(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::opts::Opts;
    use crate::pgconn::tests::{frame, pair};

    fn session() -> (Session, UnixStream) {
        let (pgconn, server) = pair();
        (Session::new(pgconn, &Opts::default()), server)
    }

    fn run<G: SessionGen>(op: &mut G, s: &mut Session) -> Result<G::Output> {
        let mut ready = Ready::NONE;
        for _ in 0..500 {
            match op.resume(s, ready)? {
                Step::Done(value) => return Ok(value),
                Step::Wait(_) => {
                    std::thread::sleep(std::time::Duration::from_millis(2));
                    ready = Ready::RW;
                }
            }
        }
        panic!("operation did not finish");
    }

    fn sent(server: &mut UnixStream) -> Vec<u8> {
        let mut bytes = Vec::new();
        server.set_nonblocking(true).unwrap();
        let _ = server.read_to_end(&mut bytes);
        server.set_nonblocking(false).unwrap();
        bytes
    }

    fn command_ok(tag: &str) -> Vec<u8> {
        let mut out = frame(b'1', b"");
        out.extend(frame(b'2', b""));
        out.extend(frame(b'n', b""));
        let mut payload = tag.as_bytes().to_vec();
        payload.push(0);
        out.extend(frame(b'C', &payload));
        out
    }

    #[test]
    fn test_commit_on_idle_sends_nothing() {
        let (mut s, mut server) = session();
        run(&mut Commit::default(), &mut s).unwrap();
        assert!(sent(&mut server).is_empty());
    }

    #[test]
    fn test_internal_commands_leave_no_results() {
        let (mut s, mut server) = session();
        s.enter_pipeline();
        run(&mut RunCommands::new(vec!["BEGIN".into()]), &mut s).unwrap();
        let ticket = s.queue("SELECT 1");
        s.pgconn.send_sync();
        let mut reply = command_ok("BEGIN");
        reply.extend(command_ok("SELECT 1"));
        reply.extend(frame(b'Z', b"T"));
        server.write_all(&reply).unwrap();

        let harvest = run(&mut OnWire(PipelineFetch::new(FetchUntil::Drained, false)), &mut s).unwrap();
        assert_eq!(harvest.len(), 2);
        assert!(s.store(harvest).is_none());
        assert_eq!(s.pipeline.as_ref().map(|p| p.stored()), Some(1));
        assert!(s.take_result(ticket).is_some());
    }

    #[test]
    fn test_internal_command_error_is_reported() {
        let (mut s, mut server) = session();
        s.enter_pipeline();
        run(&mut RunCommands::new(vec!["COMMIT".into()]), &mut s).unwrap();
        let mut reply = frame(b'1', b"");
        reply.extend(frame(b'2', b""));
        reply.extend(frame(b'E', b"SERROR\0C40001\0Mserialization failure\0\0"));
        reply.extend(frame(b'Z', b"I"));
        server.write_all(&reply).unwrap();

        let err = run(&mut SyncPipeline::new(SyncWhen::Always), &mut s).unwrap_err();
        assert_eq!(err.sqlstate(), Some("40001"));
        assert_eq!(s.pipeline.as_ref().map(|p| p.stored()), Some(0));
    }

    #[test]
    fn test_pipeline_enter_skips_sync_when_nothing_pending() {
        let (mut s, mut server) = session();
        run(&mut PipelineEnter::default(), &mut s).unwrap();
        run(&mut PipelineEnter::default(), &mut s).unwrap();
        assert_eq!(s.pipeline_level(), 2);
        assert!(sent(&mut server).is_empty());
    }

    #[test]
    fn test_transaction_enter_failure_restores_depth() {
        let (mut s, mut server) = session();
        server
            .write_all(&[frame(b'E', b"SERROR\0C08P01\0Mnope\0\0"), frame(b'Z', b"I")].concat())
            .unwrap();
        let err = run(&mut TransactionEnter::new(None, false), &mut s).unwrap_err();
        assert_eq!(err.sqlstate(), Some("08P01"));
        assert_eq!(s.num_transactions, 0);
    }

    #[test]
    fn test_recover_rolls_back_open_scope() {
        let (mut s, mut server) = session();
        s.pgconn.send_query("SELECT pg_sleep(10)");
        s.num_transactions = 1;
        let mut reply = frame(b'E', b"SERROR\0C57014\0Mcanceled\0\0");
        reply.extend(frame(b'Z', b"E"));
        server.write_all(&reply).unwrap();

        let mut recover = Recover::default();
        let mut ready = Ready::NONE;
        let mut answered = false;
        for _ in 0..500 {
            if let Step::Done(()) = recover.resume(&mut s, ready).unwrap() {
                break;
            }
            if !answered && recover.rollback.is_some() {
                server.write_all(&[frame(b'C', b"ROLLBACK\0"), frame(b'Z', b"I")].concat()).unwrap();
                answered = true;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
            ready = Ready::RW;
        }
        assert!(answered);
        assert_eq!(s.num_transactions, 0);
        assert_eq!(s.status(), TransactionStatus::Idle);
    }
}
