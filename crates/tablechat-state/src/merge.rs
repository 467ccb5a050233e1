//! Query result merger.
//!
//! Runs an attached SQL query through a [`QueryExecutor`] and folds the
//! returned matches into the [`SelectionStore`]. The merge is strictly
//! additive and idempotent, and all-or-nothing: it is computed on a copy of
//! the table's selection and swapped in only when every result entry was
//! well-formed.

use async_trait::async_trait;
use serde_json::Value;
use tablechat_types::{
    DEFAULT_QUERY_TYPE, DEFAULT_ROW_ID_FIELD, MatchError, QueryMatch, RowId, SqlQueryRequest,
    SqlQueryResponse,
};

use crate::selection::SelectionStore;

/// Errors from executing or merging a query.
#[derive(Debug, thiserror::Error)]
pub enum QueryExecutionError {
    #[error("query execution failed: {0}")]
    Execution(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("backend rejected the query")]
    Rejected,
    #[error("malformed query result: {0}")]
    Malformed(#[from] MatchError),
}

/// Executes SQL against the backend.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn run_sql(&self, request: &SqlQueryRequest)
    -> Result<SqlQueryResponse, QueryExecutionError>;
}

/// Who is asking and what kind of query it is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryContext {
    pub role: String,
    pub query_type: String,
}

impl QueryContext {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            query_type: DEFAULT_QUERY_TYPE.to_string(),
        }
    }

    pub fn with_query_type(mut self, query_type: Option<&str>) -> Self {
        if let Some(qt) = query_type {
            self.query_type = qt.to_string();
        }
        self
    }
}

/// What a merge changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Row selections created, including cell sets promoted to rows.
    pub rows_added: usize,
    /// Cell selections inserted.
    pub cells_added: usize,
    /// Matched rows that are not on the cached page.
    pub off_page_rows: Vec<RowId>,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.rows_added == 0 && self.cells_added == 0
    }
}

/// Folds query results into a selection store.
#[derive(Clone, Debug)]
pub struct QueryMerger {
    row_id_field: String,
}

impl Default for QueryMerger {
    fn default() -> Self {
        Self::new(DEFAULT_ROW_ID_FIELD)
    }
}

impl QueryMerger {
    pub fn new(row_id_field: impl Into<String>) -> Self {
        Self {
            row_id_field: row_id_field.into(),
        }
    }

    /// Execute `sql` and merge its results into `table`'s selection.
    #[tracing::instrument(skip(self, executor, store, sql), name = "merge.query")]
    pub async fn merge_query<E>(
        &self,
        executor: &E,
        store: &mut SelectionStore,
        table: &str,
        sql: &str,
        ctx: &QueryContext,
    ) -> Result<MergeReport, QueryExecutionError>
    where
        E: QueryExecutor + ?Sized,
    {
        let request = SqlQueryRequest {
            query: sql.to_string(),
            table_name: table.to_string(),
            role: ctx.role.clone(),
            query_type: ctx.query_type.clone(),
        };
        let response = executor.run_sql(&request).await?;
        if !response.success {
            tracing::warn!(table, "backend reported query failure");
            return Err(QueryExecutionError::Rejected);
        }
        self.merge_results(store, table, &response.data)
    }

    /// Merge an already-fetched result list.
    pub fn merge_results(
        &self,
        store: &mut SelectionStore,
        table: &str,
        data: &[Value],
    ) -> Result<MergeReport, QueryExecutionError> {
        let matches = QueryMatch::classify_all(data, &self.row_id_field)?;

        let mut working = store.table(table).cloned().unwrap_or_default();
        let schema = store.schema(table);
        let mut report = MergeReport::default();

        for m in &matches {
            match m {
                QueryMatch::FullRow(row_id) => {
                    if working.insert_row(row_id) {
                        report.rows_added += 1;
                    }
                }
                QueryMatch::Cells { row_id, values } => {
                    for (column, value) in values {
                        if working.insert_cell(row_id, column, value) {
                            report.cells_added += 1;
                        }
                    }
                    if working.promote(row_id, schema) {
                        report.rows_added += 1;
                    }
                }
            }
            if let Some(schema) = schema {
                let row_id = m.row_id();
                if !schema.has_row(row_id) && !report.off_page_rows.contains(row_id) {
                    report.off_page_rows.push(row_id.clone());
                }
            }
        }

        if !report.is_noop() {
            store.replace(table, working);
        }
        tracing::info!(
            table,
            matches = matches.len(),
            rows_added = report.rows_added,
            cells_added = report.cells_added,
            off_page = report.off_page_rows.len(),
            "merged query results"
        );
        Ok(report)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tablechat_types::TablePage;

    use crate::selection::TableSchema;

    /// Executor that replays a canned response and records requests.
    struct CannedExecutor {
        response: Result<SqlQueryResponse, String>,
        seen: Mutex<Vec<SqlQueryRequest>>,
    }

    impl CannedExecutor {
        fn ok(data: Vec<Value>) -> Self {
            Self {
                response: Ok(SqlQueryResponse { success: true, data }),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(msg: &str) -> Self {
            Self {
                response: Err(msg.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QueryExecutor for CannedExecutor {
        async fn run_sql(
            &self,
            request: &SqlQueryRequest,
        ) -> Result<SqlQueryResponse, QueryExecutionError> {
            self.seen.lock().unwrap().push(request.clone());
            match &self.response {
                Ok(resp) => Ok(resp.clone()),
                Err(msg) => Err(QueryExecutionError::Execution(msg.clone().into())),
            }
        }
    }

    fn row(id: &str) -> RowId {
        RowId::new(id)
    }

    fn cars_store() -> SelectionStore {
        let mut store = SelectionStore::new();
        let page: TablePage = serde_json::from_value(json!({
            "header": { "make": "string", "price": "number" },
            "rows": [
                { "ctid": "(0,1)", "make": "Volvo", "price": 100 },
                { "ctid": "(0,2)", "make": "Saab", "price": 42 }
            ],
            "page": 1, "page_size": 2, "total_rows": 4, "total_pages": 2
        }))
        .unwrap();
        store.observe_page("cars", &page, "ctid");
        store
    }

    #[tokio::test]
    async fn test_full_row_and_cell_matches() {
        let exec = CannedExecutor::ok(vec![
            json!({ "ctid": "(0,1)" }),
            json!({ "ctid": "(0,2)", "price": 42 }),
        ]);
        let mut store = SelectionStore::new();
        let merger = QueryMerger::default();

        let report = merger
            .merge_query(&exec, &mut store, "cars", "SELECT ...", &QueryContext::new("sql_agent"))
            .await
            .unwrap();

        assert_eq!(report.rows_added, 1);
        assert_eq!(report.cells_added, 1);
        let sel = store.table("cars").unwrap();
        assert_eq!(sel.row_ids().collect::<Vec<_>>(), vec![&row("(0,1)")]);
        let cells: Vec<_> = sel.cells().collect();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].key(), (&row("(0,2)"), "price"));
        assert_eq!(cells[0].value, json!(42));

        let seen = exec.seen.lock().unwrap();
        assert_eq!(seen[0].table_name, "cars");
        assert_eq!(seen[0].role, "sql_agent");
        assert_eq!(seen[0].query_type, "retrieval");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let data = vec![
            json!({ "ctid": "(0,1)" }),
            json!({ "ctid": "(0,2)", "price": 42 }),
        ];
        let merger = QueryMerger::default();
        let mut store = cars_store();

        merger.merge_results(&mut store, "cars", &data).unwrap();
        let once = store.snapshot("cars").unwrap();
        let report = merger.merge_results(&mut store, "cars", &data).unwrap();

        assert!(report.is_noop());
        assert_eq!(*once, *store.snapshot("cars").unwrap());
    }

    #[test]
    fn test_cells_skip_selected_rows_and_existing_cells() {
        let merger = QueryMerger::default();
        let mut store = cars_store();
        store.toggle_row("cars", &row("(0,1)"));
        store
            .toggle_cell("cars", &row("(0,2)"), "make", json!("Saab"))
            .unwrap();

        let report = merger
            .merge_results(
                &mut store,
                "cars",
                &[
                    json!({ "ctid": "(0,1)", "price": 100 }),
                    json!({ "ctid": "(0,2)", "make": "Saab" }),
                ],
            )
            .unwrap();

        assert!(report.is_noop());
        assert!(store.is_row_selected("cars", &row("(0,1)")));
        assert_eq!(store.table("cars").unwrap().cell_count(), 1);
    }

    #[test]
    fn test_cells_completing_a_row_promote() {
        let merger = QueryMerger::default();
        let mut store = cars_store();
        store
            .toggle_cell("cars", &row("(0,2)"), "make", json!("Saab"))
            .unwrap();

        let report = merger
            .merge_results(&mut store, "cars", &[json!({ "ctid": "(0,2)", "price": 42 })])
            .unwrap();

        assert_eq!(report.cells_added, 1);
        assert_eq!(report.rows_added, 1);
        let sel = store.table("cars").unwrap();
        assert!(sel.is_row_selected(&row("(0,2)")));
        assert_eq!(sel.cell_count(), 0);
    }

    #[test]
    fn test_full_row_match_drops_partial_cells() {
        let merger = QueryMerger::default();
        let mut store = cars_store();
        store
            .toggle_cell("cars", &row("(0,2)"), "make", json!("Saab"))
            .unwrap();

        merger
            .merge_results(&mut store, "cars", &[json!({ "ctid": "(0,2)" })])
            .unwrap();

        let sel = store.table("cars").unwrap();
        assert!(sel.is_row_selected(&row("(0,2)")));
        assert!(sel.cells_in_row(&row("(0,2)")).is_empty());
    }

    #[test]
    fn test_reports_off_page_rows() {
        let merger = QueryMerger::default();
        let mut store = cars_store();
        let report = merger
            .merge_results(
                &mut store,
                "cars",
                &[
                    json!({ "ctid": "(0,1)" }),
                    json!({ "ctid": "(1,7)" }),
                    json!({ "ctid": "(1,7)", "price": 1 }),
                ],
            )
            .unwrap();
        assert_eq!(report.off_page_rows, vec![row("(1,7)")]);
    }

    #[test]
    fn test_malformed_result_leaves_store_untouched() {
        let merger = QueryMerger::default();
        let mut store = cars_store();
        store.toggle_row("cars", &row("(0,1)"));
        let before = store.snapshot("cars").unwrap();

        let err = merger
            .merge_results(
                &mut store,
                "cars",
                &[json!({ "ctid": "(0,2)" }), json!({ "price": 42 })],
            )
            .unwrap_err();

        assert!(matches!(err, QueryExecutionError::Malformed(MatchError::MissingRowId { index: 1, .. })));
        assert!(Arc::ptr_eq(&before, &store.snapshot("cars").unwrap()));
    }

    #[tokio::test]
    async fn test_rejected_and_failed_queries() {
        let merger = QueryMerger::default();
        let mut store = cars_store();
        let ctx = QueryContext::new("sql_agent").with_query_type(Some("manipulation"));

        let rejected = CannedExecutor {
            response: Ok(SqlQueryResponse { success: false, data: vec![json!({ "ctid": "(0,1)" })] }),
            seen: Mutex::new(Vec::new()),
        };
        let err = merger
            .merge_query(&rejected, &mut store, "cars", "DELETE ...", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryExecutionError::Rejected));
        assert_eq!(rejected.seen.lock().unwrap()[0].query_type, "manipulation");

        let failing = CannedExecutor::failing("connection refused");
        let err = merger
            .merge_query(&failing, &mut store, "cars", "SELECT 1", &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(store.table("cars").is_none());
    }

    #[test]
    fn test_custom_row_id_field() {
        let merger = QueryMerger::new("id");
        let mut store = SelectionStore::new();
        store.set_schema("t", TableSchema::with_columns(["a"]));
        let report = merger
            .merge_results(&mut store, "t", &[json!({ "id": "7", "a": 1 })])
            .unwrap();
        // The only column got selected, so the row promotes.
        assert_eq!(report.rows_added, 1);
        assert!(store.is_row_selected("t", &row("7")));
    }
}
