//! Discard outstanding replies until the session is idle again.

use crate::error::{Error, Result};
use crate::pgconn::PgConn;
use crate::protocol::backend::{ErrorResponse, msg_type};

use super::action::{Ready, Step, Wait};
use super::{PgGen, flush_step};

/// Bring the session back to a state where a new command can be sent.
///
/// Pipelined commands without a Sync get one. Every reply up to the last
/// owed ReadyForQuery is discarded. Completes with the first server error
/// seen, which callers log or ignore.
#[derive(Debug, Default)]
pub struct Drain {
    first_error: Option<Error>,
}

impl PgGen for Drain {
    type Output = Option<Error>;

    fn resume(&mut self, pgconn: &mut PgConn, _ready: Ready) -> Result<Step<Option<Error>>> {
        if pgconn.unsynced() > 0 {
            pgconn.send_sync();
        }
        let pending_write = flush_step(pgconn)?;
        pgconn.fill()?;

        while let Some(frame) = pgconn.next_frame()? {
            if frame.type_byte == msg_type::ERROR_RESPONSE && self.first_error.is_none() {
                self.first_error = Some(ErrorResponse::parse(&frame.payload)?.into_error());
            }
        }
        if pending_write.is_none() && !pgconn.has_pending() {
            pgconn.reset_expected();
            return Ok(Step::Done(self.first_error.take()));
        }
        Ok(Step::Wait(pending_write.unwrap_or(Wait::R)))
    }
}
