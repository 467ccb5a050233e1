//! Selection entity shapes.
//!
//! These are the value types the selection store hands out. The store keeps
//! its own indexed representation; these shapes exist for iteration, display,
//! and tests.

use serde::{Deserialize, Serialize};

use crate::ids::RowId;

/// A single selected cell. Identity is `(row_id, column)`; `value` is carried
/// for display only and never participates in deduplication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellSelection {
    pub row_id: RowId,
    pub column: String,
    pub value: serde_json::Value,
}

impl CellSelection {
    pub fn new(row_id: RowId, column: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            row_id,
            column: column.into(),
            value,
        }
    }

    /// Deduplication key.
    pub fn key(&self) -> (&RowId, &str) {
        (&self.row_id, &self.column)
    }
}

/// A whole-row selection: every non-identifier column of the row is selected.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RowSelection {
    pub row_id: RowId,
}

/// A column header selection. Independent of cell and row state.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ColumnSelection {
    pub column: String,
    pub column_index: usize,
    pub page: u32,
}

impl ColumnSelection {
    pub fn new(column: impl Into<String>, column_index: usize, page: u32) -> Self {
        Self {
            column: column.into(),
            column_index,
            page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_key_ignores_value() {
        let a = CellSelection::new(RowId::new("(0,1)"), "price", json!(42));
        let b = CellSelection::new(RowId::new("(0,1)"), "price", json!("42"));
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
    }
}
