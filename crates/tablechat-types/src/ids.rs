//! Row identifiers.
//!
//! A [`RowId`] is the opaque token the backend issues for each physical row
//! (Postgres `ctid` text such as `"(0,1)"`). It is stable across re-pagination
//! of the same table and is never computed on the client. Two rows are the
//! same entity iff their identifiers are equal; nothing else about the token
//! is interpreted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default name of the identifier field inside row objects.
pub const DEFAULT_ROW_ID_FIELD: &str = "ctid";

/// Opaque, pagination-stable row identifier.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    /// Wrap a backend-issued identifier.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token as sent by the backend.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the identifier field out of a JSON row object.
    ///
    /// Returns `None` when the field is missing or not a string.
    pub fn from_row(
        row: &serde_json::Map<String, serde_json::Value>,
        field: &str,
    ) -> Option<Self> {
        row.get(field).and_then(|v| v.as_str()).map(Self::new)
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_is_token_equality() {
        assert_eq!(RowId::new("(0,1)"), RowId::from("(0,1)"));
        assert_ne!(RowId::new("(0,1)"), RowId::new("(0,10)"));
    }

    #[test]
    fn test_serializes_as_bare_string() {
        let json = serde_json::to_string(&RowId::new("(3,7)")).unwrap();
        assert_eq!(json, "\"(3,7)\"");
    }

    #[test]
    fn test_from_row() {
        let row = json!({ "ctid": "(0,4)", "price": 10 });
        let obj = row.as_object().unwrap();
        assert_eq!(RowId::from_row(obj, "ctid"), Some(RowId::new("(0,4)")));
        assert_eq!(RowId::from_row(obj, "id"), None);

        let numeric = json!({ "ctid": 4 });
        assert_eq!(RowId::from_row(numeric.as_object().unwrap(), "ctid"), None);
    }
}
