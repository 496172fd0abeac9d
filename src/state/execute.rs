//! Simple query step-sequence and the reply collector shared with pipelines.

use crate::error::{Error, Result};
use crate::pgconn::{Frame, PgConn};
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, RowDescription, msg_type,
};
use crate::result::QueryResult;

use super::action::{Ready, Step, Wait};
use super::{PgGen, flush_step};

/// What a reply frame meant for the statement being collected.
#[derive(Debug)]
pub(crate) enum Feed {
    /// More frames needed
    Continue,
    /// The statement finished
    Complete(QueryResult),
    /// The statement failed
    Failed(Error),
    /// The statement finished but a value in its rows could not be decoded
    Undecodable(Error),
    /// ReadyForQuery
    Ready,
}

/// Builds a [`QueryResult`] out of RowDescription / DataRow / CommandComplete.
#[derive(Debug, Default)]
pub(crate) struct ResultCollector {
    current: QueryResult,
    decode_error: Option<Error>,
}

impl ResultCollector {
    pub fn feed(&mut self, frame: &Frame) -> Result<Feed> {
        let payload = frame.payload.as_slice();
        match frame.type_byte {
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(payload)?;
                self.current
                    .set_columns(desc.fields().iter().map(|f| f.name.to_string()).collect());
                Ok(Feed::Continue)
            }
            msg_type::DATA_ROW => {
                let row = DataRow::parse(payload)?;
                if self.decode_error.is_some() {
                    return Ok(Feed::Continue);
                }
                let decoded: core::result::Result<Vec<_>, _> = row
                    .iter()
                    .map(|value| {
                        value
                            .map(|bytes| simdutf8::compat::from_utf8(bytes).map(str::to_string))
                            .transpose()
                    })
                    .collect();
                match decoded {
                    Ok(values) => self.current.push_row(values),
                    // the frame itself is sound, so keep reading the reply
                    Err(e) => {
                        self.decode_error = Some(Error::Decode(format!("invalid UTF-8 in row: {e}")));
                    }
                }
                Ok(Feed::Continue)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                self.current.set_command_tag(complete.tag);
                Ok(self.finish())
            }
            msg_type::EMPTY_QUERY_RESPONSE => Ok(self.finish()),
            msg_type::ERROR_RESPONSE => {
                self.current = QueryResult::default();
                self.decode_error = None;
                Ok(Feed::Failed(ErrorResponse::parse(payload)?.into_error()))
            }
            msg_type::READY_FOR_QUERY => Ok(Feed::Ready),
            msg_type::PARSE_COMPLETE | msg_type::BIND_COMPLETE | msg_type::NO_DATA => {
                Ok(Feed::Continue)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message '{}' in query reply",
                other as char
            ))),
        }
    }
}

impl ResultCollector {
    fn finish(&mut self) -> Feed {
        let result = core::mem::take(&mut self.current);
        match self.decode_error.take() {
            Some(err) => Feed::Undecodable(err),
            None => Feed::Complete(result),
        }
    }
}

/// Run one simple Query and collect every statement's result.
///
/// The first server error is returned once ReadyForQuery arrived, so the
/// connection is left ready for the next command.
#[derive(Debug)]
pub struct Execute {
    sql: Option<String>,
    collector: ResultCollector,
    results: Vec<QueryResult>,
    error: Option<Error>,
}

impl Execute {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: Some(sql.into()),
            collector: ResultCollector::default(),
            results: Vec::new(),
            error: None,
        }
    }
}

impl PgGen for Execute {
    type Output = Vec<QueryResult>;

    fn resume(&mut self, pgconn: &mut PgConn, _ready: Ready) -> Result<Step<Self::Output>> {
        if let Some(sql) = self.sql.take() {
            pgconn.send_query(&sql);
        }
        let pending_write = flush_step(pgconn)?;
        pgconn.fill()?;

        while let Some(frame) = pgconn.next_frame()? {
            match self.collector.feed(&frame)? {
                Feed::Continue => {}
                Feed::Complete(result) => self.results.push(result),
                Feed::Failed(err) if err.is_connection_broken() => {
                    pgconn.mark_broken();
                    return Err(err);
                }
                Feed::Failed(err) | Feed::Undecodable(err) => {
                    if self.error.is_none() {
                        self.error = Some(err);
                    }
                }
                Feed::Ready => {
                    return match self.error.take() {
                        Some(err) => Err(err),
                        None => Ok(Step::Done(core::mem::take(&mut self.results))),
                    };
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
    use std::io::{Read, Write};

    fn run<G: PgGen>(gen_: &mut G, pgconn: &mut PgConn) -> Result<G::Output> {
        let mut ready = Ready::NONE;
        for _ in 0..500 {
            match gen_.resume(pgconn, ready)? {
                Step::Done(value) => return Ok(value),
                Step::Wait(_) => {
                    std::thread::sleep(std::time::Duration::from_millis(2));
                    ready = Ready::RW;
                }
            }
        }
        panic!("step-sequence did not finish");
    }

    fn row_description(name: &str) -> Vec<u8> {
        let mut payload = 1_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&[0u8; 18]);
        frame(b'T', &payload)
    }

    fn data_row(value: &str) -> Vec<u8> {
        let mut payload = 1_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&(value.len() as i32).to_be_bytes());
        payload.extend_from_slice(value.as_bytes());
        frame(b'D', &payload)
    }

    #[test]
    fn test_execute_collects_rows() {
        let (mut pgconn, mut server) = pair();
        let mut reply = row_description("n");
        reply.extend(data_row("1"));
        reply.extend(data_row("2"));
        reply.extend(frame(b'C', b"SELECT 2\0"));
        reply.extend(frame(b'Z', b"I"));
        server.write_all(&reply).unwrap();

        let mut exec = Execute::new("SELECT n FROM t");
        let results = run(&mut exec, &mut pgconn).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].columns(), ["n"]);
        assert_eq!(results[0].get(1, 0), Some("2"));
        assert_eq!(results[0].rows_affected(), Some(2));
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Idle);

        let mut sent = [0u8; 5];
        server.read_exact(&mut sent).unwrap();
        assert_eq!(sent[0], b'Q');
    }

    #[test]
    fn test_error_waits_for_ready() {
        let (mut pgconn, mut server) = pair();
        let mut reply = frame(b'E', b"SERROR\0C42P01\0Mno such table\0\0");
        reply.extend(frame(b'Z', b"E"));
        server.write_all(&reply).unwrap();

        let mut exec = Execute::new("SELECT * FROM missing");
        let err = run(&mut exec, &mut pgconn).unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert_eq!(pgconn.transaction_status(), TransactionStatus::InError);
        assert!(pgconn.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_invalid_utf8_fails_statement_only() {
        let (mut pgconn, mut server) = pair();
        let mut bad = 1_u16.to_be_bytes().to_vec();
        bad.extend_from_slice(&2_i32.to_be_bytes());
        bad.extend_from_slice(&[0xC3, 0x28]);
        let mut reply = row_description("t");
        reply.extend(frame(b'D', &bad));
        reply.extend(data_row("fine"));
        reply.extend(frame(b'C', b"SELECT 2\0"));
        reply.extend(frame(b'Z', b"I"));
        server.write_all(&reply).unwrap();

        let mut exec = Execute::new("SELECT t FROM latin");
        let err = run(&mut exec, &mut pgconn).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(!pgconn.is_broken());
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Idle);

        server.write_all(&[data_row("1"), frame(b'C', b"SELECT 1\0"), frame(b'Z', b"I")].concat()).unwrap();
        let results = run(&mut Execute::new("SELECT 1"), &mut pgconn).unwrap();
        assert_eq!(results[0].get(0, 0), Some("1"));
    }

    #[test]
    fn test_resume_without_readiness_is_harmless() {
        let (mut pgconn, _server) = pair();
        let mut exec = Execute::new("SELECT 1");
        assert!(matches!(
            exec.resume(&mut pgconn, Ready::NONE).unwrap(),
            Step::Wait(Wait::R)
        ));
        assert!(matches!(
            exec.resume(&mut pgconn, Ready::NONE).unwrap(),
            Step::Wait(Wait::R)
        ));
        assert_eq!(pgconn.transaction_status(), TransactionStatus::Active);
    }
}
