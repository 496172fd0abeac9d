//! Shared pipeline types.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::result::QueryResult;
use crate::state::pipeline::Harvest;

/// A ticket for a queued pipeline operation.
///
/// Created by `Pipeline::execute`. Claim the result with `Pipeline::claim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub struct Ticket(pub(crate) u64);

/// Pipeline bookkeeping owned by the connection while pipelining.
///
/// Exists iff the nesting level is at least one.
#[derive(Debug)]
pub(crate) struct PipelineState {
    level: usize,
    results: HashMap<u64, Result<QueryResult>>,
    /// Commands queued by the driver itself; nobody claims their results
    internal: HashSet<u64>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            level: 1,
            results: HashMap::new(),
            internal: HashSet::new(),
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn enter(&mut self) {
        self.level += 1;
    }

    /// Returns the level after leaving.
    pub fn leave(&mut self) -> usize {
        self.level = self.level.saturating_sub(1);
        self.level
    }

    /// Drop the result of `ticket` when it arrives. Its failure is still
    /// reported by [`PipelineState::store`].
    pub fn ignore(&mut self, ticket: Ticket) {
        self.internal.insert(ticket.0);
    }

    /// Store harvested results. Returns a copy of the first failure among
    /// them so the caller can report it.
    pub fn store(&mut self, harvest: Harvest) -> Option<Error> {
        let mut first_error = None;
        for (id, result) in harvest {
            if first_error.is_none() {
                if let Err(err) = &result {
                    first_error = Some(replay(err));
                }
            }
            if !self.internal.remove(&id) {
                self.results.insert(id, result);
            }
        }
        first_error
    }

    pub fn take(&mut self, ticket: Ticket) -> Option<Result<QueryResult>> {
        self.results.remove(&ticket.0)
    }

    #[cfg(test)]
    pub fn stored(&self) -> usize {
        self.results.len()
    }
}

/// Reproduce an error stored for a ticket so it can be reported twice.
fn replay(err: &Error) -> Error {
    match err {
        Error::Server(fields) => Error::Server(fields.clone()),
        Error::PipelineAborted => Error::PipelineAborted,
        Error::Decode(msg) => Error::Decode(msg.clone()),
        other => Error::Protocol(other.to_string()),
    }
}
