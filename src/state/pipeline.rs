//! Reconcile pipelined replies with the queue of expected reply groups.

use crate::error::{Error, Result};
use crate::pgconn::{Expect, PgConn};
use crate::result::QueryResult;

use super::action::{Ready, Step, Wait};
use super::execute::{Feed, ResultCollector};
use super::{PgGen, flush_step};

/// When a [`PipelineFetch`] stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchUntil {
    /// Stop once the given reply group was harvested
    Ticket(u64),
    /// Stop once nothing is expected anymore
    Drained,
}

/// Results harvested from the pipeline, in queue order.
pub type Harvest = Vec<(u64, Result<QueryResult>)>;

/// Read pipelined replies in order until the stop condition holds.
///
/// After a server error the server skips everything up to the next Sync;
/// the skipped commands are harvested as [`Error::PipelineAborted`].
#[derive(Debug)]
pub struct PipelineFetch {
    until: FetchUntil,
    flush: bool,
    collector: ResultCollector,
    aborted: bool,
    harvested: Harvest,
    reached: bool,
}

impl PipelineFetch {
    /// `flush` asks the server to deliver replies for commands not yet
    /// followed by a Sync.
    pub fn new(until: FetchUntil, flush: bool) -> Self {
        Self {
            until,
            flush,
            collector: ResultCollector::default(),
            aborted: false,
            harvested: Vec::new(),
            reached: false,
        }
    }

    fn harvest(&mut self, id: u64, result: Result<QueryResult>) {
        if self.until == FetchUntil::Ticket(id) {
            self.reached = true;
        }
        self.harvested.push((id, result));
    }

    fn finished(&self, pgconn: &PgConn) -> bool {
        match self.until {
            FetchUntil::Ticket(_) => self.reached,
            FetchUntil::Drained => pgconn.expected_is_empty(),
        }
    }
}

impl PgGen for PipelineFetch {
    type Output = Harvest;

    fn resume(&mut self, pgconn: &mut PgConn, _ready: Ready) -> Result<Step<Harvest>> {
        if self.flush {
            pgconn.send_flush();
            self.flush = false;
        }
        let pending_write = flush_step(pgconn)?;
        pgconn.fill()?;

        loop {
            if self.finished(pgconn) {
                return Ok(Step::Done(core::mem::take(&mut self.harvested)));
            }
            let Some(expect) = pgconn.expected_front() else {
                return Ok(Step::Done(core::mem::take(&mut self.harvested)));
            };
            if let Expect::Command(id) = expect {
                if self.aborted {
                    pgconn.pop_expected();
                    self.harvest(id, Err(Error::PipelineAborted));
                    continue;
                }
            }
            let Some(frame) = pgconn.next_frame()? else {
                break;
            };
            match (expect, self.collector.feed(&frame)?) {
                (_, Feed::Continue) => {}
                (_, Feed::Failed(err)) if err.is_connection_broken() => {
                    pgconn.mark_broken();
                    return Err(err);
                }
                (Expect::Command(id), Feed::Complete(result)) => {
                    pgconn.pop_expected();
                    self.harvest(id, Ok(result));
                }
                // the server did not fail, so the segment goes on
                (Expect::Command(id), Feed::Undecodable(err)) => {
                    pgconn.pop_expected();
                    self.harvest(id, Err(err));
                }
                (Expect::Command(id), Feed::Failed(err)) => {
                    pgconn.pop_expected();
                    self.aborted = true;
                    self.harvest(id, Err(err));
                }
                (Expect::Sync, Feed::Ready) => {
                    pgconn.pop_expected();
                    self.aborted = false;
                }
                (Expect::Sync, Feed::Failed(err)) => {
                    tracing::warn!("error reported at pipeline sync: {}", err);
                }
                (expect, feed) => {
                    pgconn.mark_broken();
                    return Err(Error::Protocol(format!(
                        "pipeline out of step: expected {:?}, got {:?}",
                        expect, feed
                    )));
                }
            }
        }

        Ok(Step::Wait(pending_write.unwrap_or(Wait::R)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgconn::tests::{frame, pair};
    use crate::protocol::types::TransactionStatus;
    use std::io::Write;

    fn run(fetch: &mut PipelineFetch, pgconn: &mut PgConn) -> Result<Harvest> {
        for _ in 0..500 {
            if let Step::Done(v) = fetch.resume(pgconn, Ready::RW)? {
                return Ok(v);
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("fetch did not finish");
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
    fn test_error_aborts_rest_of_segment() {
        let (mut pgconn, mut server) = pair();
        let a = pgconn.send_extended("INSERT INTO t VALUES (1)");
        let b = pgconn.send_extended("INSERT INTO nope VALUES (1)");
        let c = pgconn.send_extended("INSERT INTO t VALUES (2)");
        pgconn.send_sync();
        let d = pgconn.send_extended("SELECT 1");
        pgconn.send_sync();

        let mut reply = command_ok("INSERT 0 1");
        reply.extend(frame(b'1', b""));
        reply.extend(frame(b'2', b""));
        reply.extend(frame(b'E', b"SERROR\0C42P01\0Mmissing\0\0"));
        reply.extend(frame(b'Z', b"I"));
        reply.extend(command_ok("SELECT 1"));
        reply.extend(frame(b'Z', b"I"));
        server.write_all(&reply).unwrap();

        let harvest = run(&mut PipelineFetch::new(FetchUntil::Drained, false), &mut pgconn).unwrap();
        let ids: Vec<_> = harvest.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, b, c, d]);
        assert!(harvest[0].1.is_ok());
        assert_eq!(harvest[1].1.as_ref().unwrap_err().sqlstate(), Some("42P01"));
        assert!(matches!(harvest[2].1, Err(Error::PipelineAborted)));
        assert_eq!(harvest[3].1.as_ref().unwrap().command_tag(), Some("SELECT 1"));
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Idle);
    }

    #[test]
    fn test_undecodable_row_does_not_abort_segment() {
        let (mut pgconn, mut server) = pair();
        let a = pgconn.send_extended("SELECT t FROM latin");
        let b = pgconn.send_extended("SELECT 1");
        pgconn.send_sync();

        let mut bad = 1_u16.to_be_bytes().to_vec();
        bad.extend_from_slice(&2_i32.to_be_bytes());
        bad.extend_from_slice(&[0xC3, 0x28]);
        let mut reply = frame(b'1', b"");
        reply.extend(frame(b'2', b""));
        reply.extend(frame(b'n', b""));
        reply.extend(frame(b'D', &bad));
        reply.extend(frame(b'C', b"SELECT 1\0"));
        reply.extend(command_ok("SELECT 1"));
        reply.extend(frame(b'Z', b"I"));
        server.write_all(&reply).unwrap();

        let harvest = run(&mut PipelineFetch::new(FetchUntil::Drained, false), &mut pgconn).unwrap();
        assert_eq!(harvest[0].0, a);
        assert!(matches!(harvest[0].1, Err(Error::Decode(_))));
        assert_eq!(harvest[1].0, b);
        assert!(harvest[1].1.is_ok());
        assert!(!pgconn.is_broken());
    }

    #[test]
    fn test_fetch_single_ticket_with_flush() {
        let (mut pgconn, mut server) = pair();
        let a = pgconn.send_extended("SELECT 1");
        let b = pgconn.send_extended("SELECT 2");
        server.write_all(&command_ok("SELECT 1")).unwrap();

        let harvest = run(&mut PipelineFetch::new(FetchUntil::Ticket(a), true), &mut pgconn).unwrap();
        assert_eq!(harvest.len(), 1);
        assert_eq!(harvest[0].0, a);
        assert!(pgconn.expects(b));
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Active);
    }
}
