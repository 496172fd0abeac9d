//! Transaction scopes and savepoints.

use crate::error::{Error, Result};
use crate::protocol::types::TransactionStatus;

/// A transaction block opened with `Conn::transaction`.
///
/// The outermost block on an idle session issues `BEGIN` and finishes with
/// `COMMIT` or `ROLLBACK`. A block opened inside another one (or while the
/// session is already in a transaction) works on a savepoint instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    savepoint_name: Option<String>,
    outer: bool,
    force_rollback: bool,
}

impl Transaction {
    /// Plan a block entered at the given session state.
    ///
    /// `depth` is the number of blocks already open on the connection.
    pub(crate) fn plan(
        status: TransactionStatus,
        depth: usize,
        savepoint_name: Option<&str>,
        force_rollback: bool,
    ) -> Result<Self> {
        if !matches!(status, TransactionStatus::Idle | TransactionStatus::InTransaction) {
            return Err(Error::InvalidUsage(format!(
                "can't start a transaction from a connection in status {}",
                status
            )));
        }
        let outer = status == TransactionStatus::Idle;
        let savepoint_name = match savepoint_name {
            Some(name) => Some(name.to_string()),
            None if outer => None,
            None => Some(format!("_pg3_{}", depth + 1)),
        };
        Ok(Self {
            savepoint_name,
            outer,
            force_rollback,
        })
    }

    /// Savepoint used by this block, if any.
    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint_name.as_deref()
    }

    /// Whether this block started the server transaction.
    pub fn is_outer(&self) -> bool {
        self.outer
    }

    pub fn force_rollback(&self) -> bool {
        self.force_rollback
    }

    pub(crate) fn enter_commands(&self, begin: String) -> Vec<String> {
        let mut commands = Vec::with_capacity(2);
        if self.outer {
            commands.push(begin);
        }
        if let Some(name) = &self.savepoint_name {
            commands.push(format!("SAVEPOINT {}", quote_ident(name)));
        }
        commands
    }

    pub(crate) fn commit_commands(&self) -> Vec<String> {
        match (&self.savepoint_name, self.outer) {
            (_, true) => vec!["COMMIT".to_string()],
            (Some(name), false) => vec![format!("RELEASE SAVEPOINT {}", quote_ident(name))],
            (None, false) => Vec::new(),
        }
    }

    pub(crate) fn rollback_commands(&self) -> Vec<String> {
        match (&self.savepoint_name, self.outer) {
            (_, true) => vec!["ROLLBACK".to_string()],
            (Some(name), false) => {
                let name = quote_ident(name);
                vec![
                    format!("ROLLBACK TO SAVEPOINT {}", name),
                    format!("RELEASE SAVEPOINT {}", name),
                ]
            }
            (None, false) => Vec::new(),
        }
    }
}

/// Quote an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
