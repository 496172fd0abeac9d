//! Common PostgreSQL wire protocol types.

/// PostgreSQL Object Identifier (OID)
pub type Oid = u32;

/// Session transaction status.
///
/// `Idle`, `InTransaction` and `InError` come from the last ReadyForQuery.
/// `Active` is reported while a command has been sent and its replies are
/// still outstanding. `Unknown` is reported once the connection is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in transaction block)
    #[default]
    Idle,
    /// A command is in progress
    Active,
    /// In transaction block
    InTransaction,
    /// In failed transaction block (queries will be rejected until rollback)
    InError,
    /// Connection is bad
    Unknown,
}

impl TransactionStatus {
    /// Create a TransactionStatus from a ReadyForQuery status byte.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::InError),
            _ => None,
        }
    }

    /// Returns true if currently in a transaction block (either healthy or failed).
    pub fn in_transaction(self) -> bool {
        matches!(
            self,
            TransactionStatus::InTransaction | TransactionStatus::InError
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionStatus::Idle => "IDLE",
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::InTransaction => "INTRANS",
            TransactionStatus::InError => "INERROR",
            TransactionStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}
