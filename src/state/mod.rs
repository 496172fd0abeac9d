//! Sans-I/O step-sequences for PostgreSQL protocol operations.
//!
//! A step-sequence performs only non-blocking I/O on the [`PgConn`] it is
//! handed. When it cannot make progress it returns [`Step::Wait`] and the
//! driver resumes it once the descriptor is ready or the wait interval
//! elapsed. Resuming with [`Ready::NONE`] must be harmless: sequences
//! re-check what is already buffered and ask to wait again.

pub mod action;
pub mod cancel;
pub mod connection;
pub mod drain;
pub mod execute;
pub mod notifies;
pub mod pipeline;

pub use action::{Ready, Step, Wait};

use crate::error::Result;
use crate::pgconn::PgConn;

/// A resumable protocol operation.
pub trait PgGen {
    /// Value produced on completion.
    type Output;

    /// Advance the sequence as far as possible without blocking.
    fn resume(&mut self, pgconn: &mut PgConn, ready: Ready) -> Result<Step<Self::Output>>;
}

/// Flush pending output. Returns the wait needed to finish, if any.
pub(crate) fn flush_step(pgconn: &mut PgConn) -> Result<Option<Wait>> {
    if pgconn.flush()? {
        Ok(None)
    } else {
        // Keep reading while the server's send buffer may be full too.
        Ok(Some(Wait::RW))
    }
}
