//! Table and query DTOs for the backend's request/response endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::RowId;

/// Query type the backend runs when none is attached to the message.
pub const DEFAULT_QUERY_TYPE: &str = "retrieval";

/// One page of table data (`POST /get-table`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TablePage {
    /// Column name to display type. Does not include the row id field.
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    /// Row objects, each carrying the row id field plus column values.
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    pub page: u32,
    pub page_size: u32,
    pub total_rows: u64,
    pub total_pages: u64,
}

impl TablePage {
    /// Data columns of the page, excluding `row_id_field`.
    ///
    /// Taken from the header when present, otherwise from the first row.
    pub fn data_columns(&self, row_id_field: &str) -> Vec<String> {
        let names: Vec<&String> = if self.header.is_empty() {
            self.rows.first().map(|r| r.keys().collect()).unwrap_or_default()
        } else {
            self.header.keys().collect()
        };
        names
            .into_iter()
            .filter(|name| name.as_str() != row_id_field)
            .cloned()
            .collect()
    }
}

/// Body of `POST /get-table`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRequest {
    pub table_name: String,
    pub page: u32,
    pub page_size: u32,
}

/// Body of `POST /sql-query`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlQueryRequest {
    pub query: String,
    pub table_name: String,
    pub role: String,
    pub query_type: String,
}

/// Response of `POST /sql-query`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SqlQueryResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<Value>,
}

/// Body of `POST /reinitiate-thread`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadResetRequest {
    pub table_name: String,
}

// ============================================================================
// Query matches
// ============================================================================

/// A malformed entry in a query result list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("result {index} is not an object")]
    NotAnObject { index: usize },
    #[error("result {index} has no string {field:?} field")]
    MissingRowId { index: usize, field: String },
}

/// One entry of a query result list, classified.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryMatch {
    /// Only the row identifier came back: the whole row matched.
    FullRow(RowId),
    /// The identifier plus some column values.
    Cells {
        row_id: RowId,
        values: Map<String, Value>,
    },
}

impl QueryMatch {
    pub fn row_id(&self) -> &RowId {
        match self {
            Self::FullRow(row_id) => row_id,
            Self::Cells { row_id, .. } => row_id,
        }
    }

    /// Classify one result object. `index` is only used in the error.
    pub fn classify(index: usize, value: &Value, row_id_field: &str) -> Result<Self, MatchError> {
        let obj = value.as_object().ok_or(MatchError::NotAnObject { index })?;
        let row_id = RowId::from_row(obj, row_id_field).ok_or_else(|| MatchError::MissingRowId {
            index,
            field: row_id_field.to_string(),
        })?;

        let values: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| k.as_str() != row_id_field)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if values.is_empty() {
            Ok(Self::FullRow(row_id))
        } else {
            Ok(Self::Cells { row_id, values })
        }
    }

    /// Classify a whole result list, failing on the first malformed entry.
    pub fn classify_all(data: &[Value], row_id_field: &str) -> Result<Vec<Self>, MatchError> {
        data.iter()
            .enumerate()
            .map(|(i, v)| Self::classify(i, v, row_id_field))
            .collect()
    }
}
