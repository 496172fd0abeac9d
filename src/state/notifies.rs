//! One polling round for asynchronous notifications.

use crate::error::{Error, Result};
use crate::pgconn::PgConn;

use super::PgGen;
use super::action::{Ready, Step, Wait};

/// Wait once for the socket to become readable, then read and parse
/// whatever arrived. Notifications end up in the session's notify queue and
/// are handed to the registered handlers by the driver.
#[derive(Debug, Default)]
pub struct Notifies {
    polled: bool,
}

impl PgGen for Notifies {
    type Output = ();

    fn resume(&mut self, pgconn: &mut PgConn, _ready: Ready) -> Result<Step<()>> {
        if !self.polled {
            self.polled = true;
            return Ok(Step::Wait(Wait::R));
        }
        pgconn.fill()?;
        if pgconn.is_eof() {
            pgconn.mark_broken();
            return Err(Error::ConnectionBroken);
        }
        Ok(Step::Done(()))
    }
}
