//! Pipeline mode for the synchronous connection.

use crate::base::merge_exit;
use crate::error::Result;
use crate::pipeline::Ticket;
use crate::result::QueryResult;

use super::Conn;

/// Handle passed to the closure of [`Conn::pipeline`].
///
/// # Example
///
/// ```no_run
/// # fn run(conn: &pgdriver::sync::Conn) -> pgdriver::Result<()> {
/// let _count = conn.pipeline(|p| {
///     let insert = p.execute("INSERT INTO jobs (name) VALUES ('a')")?;
///     let count = p.execute("SELECT count(*) FROM jobs")?;
///     p.sync()?;
///     p.claim(insert)?;
///     Ok(p.claim(count)?.get(0, 0).map(String::from))
/// })?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Pipeline<'a> {
    conn: &'a Conn,
}

impl<'a> Pipeline<'a> {
    pub(super) fn new(conn: &'a Conn) -> Self {
        Self { conn }
    }

    /// Queue a statement without waiting for its result.
    pub fn execute(&self, sql: &str) -> Result<Ticket> {
        self.conn.pipeline_queue(sql)
    }

    /// Send a Sync and read all outstanding results.
    ///
    /// Returns the first error reported by the statements synced. Each
    /// ticket keeps its own result.
    pub fn sync(&self) -> Result<()> {
        self.conn.pipeline_sync()
    }

    /// Take the result of a queued statement, reading up to it if needed.
    pub fn claim(&self, ticket: Ticket) -> Result<QueryResult> {
        self.conn.pipeline_claim(ticket)
    }

    /// Nesting depth of the pipeline.
    pub fn level(&self) -> usize {
        self.conn.pipeline_level()
    }

    /// The connection the pipeline runs on.
    pub fn conn(&self) -> &'a Conn {
        self.conn
    }
}

/// Leaves the pipeline level when the block ends, including by panic.
pub(super) struct PipelineScope<'a> {
    conn: &'a Conn,
    exited: bool,
}

impl<'a> PipelineScope<'a> {
    pub fn new(conn: &'a Conn) -> Self {
        Self {
            conn,
            exited: false,
        }
    }

    /// Leave the level. An exit error does not replace the block's own error.
    pub fn exit<R>(mut self, result: Result<R>) -> Result<R> {
        self.exited = true;
        merge_exit(result, self.conn.pipeline_exit(), "pipeline")
    }
}

impl Drop for PipelineScope<'_> {
    fn drop(&mut self) {
        if !self.exited {
            if let Err(err) = self.conn.pipeline_exit() {
                tracing::warn!("error ignored exiting pipeline: {}", err);
            }
        }
    }
}
