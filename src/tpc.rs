//! Two-phase commit transaction identifiers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Error, Result};

/// Query listing the prepared transactions visible to the session.
pub(crate) const RECOVER_QUERY: &str =
    "SELECT gid, prepared, owner, database FROM pg_catalog.pg_prepared_xacts";

const MAX_PART_LEN: usize = 64;

/// A two-phase commit transaction identifier.
///
/// An XA-style xid has a format id, a global transaction id and a branch
/// qualifier, and is sent to the server as `<format_id>_<b64 gtrid>_<b64 bqual>`.
/// A transaction prepared outside this driver may have any id; it is then
/// represented with only `gtrid` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    format_id: Option<i32>,
    gtrid: String,
    bqual: Option<String>,
    prepared: Option<String>,
    owner: Option<String>,
    database: Option<String>,
}

impl Xid {
    /// Build an XA-style xid.
    pub fn new(format_id: i32, gtrid: impl Into<String>, bqual: impl Into<String>) -> Result<Self> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if format_id < 0 {
            return Err(Error::InvalidUsage(format!(
                "format_id must be non-negative, got {}",
                format_id
            )));
        }
        if gtrid.len() > MAX_PART_LEN {
            return Err(Error::InvalidUsage("gtrid must be at most 64 characters".into()));
        }
        if bqual.len() > MAX_PART_LEN {
            return Err(Error::InvalidUsage("bqual must be at most 64 characters".into()));
        }
        Ok(Self {
            format_id: Some(format_id),
            gtrid,
            bqual: Some(bqual),
            prepared: None,
            owner: None,
            database: None,
        })
    }

    /// Parse a transaction id as found in `pg_prepared_xacts.gid`.
    ///
    /// Ids not in the XA format become an unstructured xid.
    pub fn from_string(s: &str) -> Self {
        Self::parse_xa(s).unwrap_or_else(|| Self {
            format_id: None,
            gtrid: s.to_string(),
            bqual: None,
            prepared: None,
            owner: None,
            database: None,
        })
    }

    fn parse_xa(s: &str) -> Option<Self> {
        let mut parts = s.split('_');
        let (format_id, gtrid, bqual) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || !format_id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let format_id: i32 = format_id.parse().ok()?;
        let decode = |part: &str| {
            BASE64
                .decode(part)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        };
        Some(Self {
            format_id: Some(format_id),
            gtrid: decode(gtrid)?,
            bqual: Some(decode(bqual)?),
            prepared: None,
            owner: None,
            database: None,
        })
    }

    /// Build from a `pg_prepared_xacts` row: gid, prepared, owner, database.
    pub(crate) fn from_record(row: &[Option<String>]) -> Result<Self> {
        let field = |i: usize| row.get(i).cloned().flatten();
        let gid = field(0).ok_or_else(|| Error::Protocol("prepared transaction without gid".into()))?;
        let mut xid = Self::from_string(&gid);
        xid.prepared = field(1);
        xid.owner = field(2);
        xid.database = field(3);
        Ok(xid)
    }

    pub fn format_id(&self) -> Option<i32> {
        self.format_id
    }

    pub fn gtrid(&self) -> &str {
        &self.gtrid
    }

    pub fn bqual(&self) -> Option<&str> {
        self.bqual.as_deref()
    }

    /// When the transaction was prepared, as reported by recovery.
    pub fn prepared(&self) -> Option<&str> {
        self.prepared.as_deref()
    }

    /// Role that prepared the transaction, as reported by recovery.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Database the transaction was prepared in, as reported by recovery.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// The id as a quoted SQL literal.
    pub(crate) fn to_literal(&self) -> String {
        quote_literal(&self.to_string())
    }
}

impl core::fmt::Display for Xid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.format_id {
            None => f.write_str(&self.gtrid),
            Some(format_id) => write!(
                f,
                "{}_{}_{}",
                format_id,
                BASE64.encode(&self.gtrid),
                BASE64.encode(self.bqual.as_deref().unwrap_or_default())
            ),
        }
    }
}

impl From<&str> for Xid {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

/// Quote a string as an SQL literal.
pub(crate) fn quote_literal(s: &str) -> String {
    let doubled = s.replace('\'', "''");
    if doubled.contains('\\') {
        format!("E'{}'", doubled.replace('\\', "\\\\"))
    } else {
        format!("'{}'", doubled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xa_string_form() {
        let xid = Xid::new(42, "gtrid", "bqual").unwrap();
        assert_eq!(xid.to_string(), "42_Z3RyaWQ=_YnF1YWw=");
        let parsed = Xid::from_string("42_Z3RyaWQ=_YnF1YWw=");
        assert_eq!(parsed, xid);
        assert_eq!(parsed.bqual(), Some("bqual"));
    }

    #[test]
    fn test_unstructured() {
        for gid in ["dbapi-tx", "1_not base64_x", "a_b_c", "1_2_3_4"] {
            let xid = Xid::from_string(gid);
            assert_eq!(xid.format_id(), None, "{gid}");
            assert_eq!(xid.gtrid(), gid);
            assert_eq!(xid.to_string(), gid);
        }
    }

    #[test]
    fn test_validation() {
        assert!(Xid::new(-1, "g", "b").is_err());
        assert!(Xid::new(1, "g".repeat(65), "b").is_err());
        assert!(Xid::new(1, "g", "b".repeat(64)).is_ok());
    }

    #[test]
    fn test_from_record() {
        let row = vec![
            Some("7_YQ==_Yg==".to_string()),
            Some("2024-01-01 00:00:00+00".to_string()),
            Some("alice".to_string()),
            Some("app".to_string()),
        ];
        let xid = Xid::from_record(&row).unwrap();
        assert_eq!(xid.format_id(), Some(7));
        assert_eq!(xid.gtrid(), "a");
        assert_eq!(xid.owner(), Some("alice"));
        assert_eq!(xid.database(), Some("app"));
        assert!(Xid::from_record(&[None]).is_err());
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(r"a\b"), r"E'a\\b'");
    }
}
