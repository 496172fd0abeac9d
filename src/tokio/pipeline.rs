//! Pipeline mode for the asynchronous connection.

use crate::error::Result;
use crate::pipeline::Ticket;
use crate::result::QueryResult;

use super::Conn;

/// Handle passed to the closure of [`Conn::pipeline`].
///
/// # Example
///
/// ```no_run
/// # async fn run(conn: &pgdriver::tokio::Conn) -> pgdriver::Result<()> {
/// let _count = conn
///     .pipeline(async |p| {
///         let insert = p.execute("INSERT INTO jobs (name) VALUES ('a')").await?;
///         let count = p.execute("SELECT count(*) FROM jobs").await?;
///         p.sync().await?;
///         p.claim(insert).await?;
///         Ok(p.claim(count).await?.get(0, 0).map(String::from))
///     })
///     .await?;
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
    pub async fn execute(&self, sql: &str) -> Result<Ticket> {
        self.conn.pipeline_queue(sql).await
    }

    /// Send a Sync and read all outstanding results.
    ///
    /// Returns the first error reported by the statements synced.
    pub async fn sync(&self) -> Result<()> {
        self.conn.pipeline_sync().await
    }

    /// Take the result of a queued statement, reading up to it if needed.
    pub async fn claim(&self, ticket: Ticket) -> Result<QueryResult> {
        self.conn.pipeline_claim(ticket).await
    }

    pub fn level(&self) -> usize {
        self.conn.pipeline_level()
    }

    pub fn conn(&self) -> &'a Conn {
        self.conn
    }
}
