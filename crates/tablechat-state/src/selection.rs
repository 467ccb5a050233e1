//! Per-table selection store.
//!
//! Each table owns an independent [`TableSelection`] behind an `Arc`. Every
//! mutation goes through `Arc::make_mut` on exactly one table's entry, so a
//! snapshot taken before a mutation stays valid and other tables' entries are
//! never reallocated.
//!
//! # Canonical form
//!
//! For a given row the store holds either a row selection or a strict,
//! non-empty subset of the data columns as cell selections, never both:
//!
//! ```text
//!   cells {a}      ──toggle b──▶  cells {a,b}
//!   cells {a,b}    ──toggle c──▶  row            (promotion: every column picked)
//!   row            ──toggle b──▶  cells {a,c}    (demotion: complement of b)
//!   cells {a}      ──toggle a──▶  (nothing)
//! ```
//!
//! Promotion and demotion need the table's data columns. They are learned
//! from the last fetched page via [`SelectionStore::observe_page`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tablechat_types::{CellSelection, ColumnSelection, RowId, RowSelection, TablePage};

/// Errors from selection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("no schema known for table {table:?}; fetch a page first")]
    UnknownSchema { table: String },
    #[error("table {table:?} has no data column {column:?}")]
    UnknownColumn { table: String, column: String },
}

// ============================================================================
// Schema
// ============================================================================

/// Data columns of a table plus a cache of the most recently fetched page.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableSchema {
    columns: Vec<String>,
    page_rows: HashMap<RowId, Map<String, Value>>,
}

impl TableSchema {
    /// Build a schema from a fetched page.
    pub fn from_page(page: &TablePage, row_id_field: &str) -> Self {
        let mut page_rows = HashMap::with_capacity(page.rows.len());
        for row in &page.rows {
            match RowId::from_row(row, row_id_field) {
                Some(row_id) => {
                    page_rows.insert(row_id, row.clone());
                }
                None => tracing::debug!(field = row_id_field, "page row without identifier skipped"),
            }
        }
        Self {
            columns: page.data_columns(row_id_field),
            page_rows,
        }
    }

    /// Schema with columns only (no cached rows).
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            page_rows: HashMap::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Check if the row is on the cached page.
    pub fn has_row(&self, row_id: &RowId) -> bool {
        self.page_rows.contains_key(row_id)
    }

    /// Cached value of a cell, or null when the row is off-page.
    pub fn cell_value(&self, row_id: &RowId, column: &str) -> Value {
        self.page_rows
            .get(row_id)
            .and_then(|row| row.get(column))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

// ============================================================================
// TableSelection
// ============================================================================

/// Selection state of one table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableSelection {
    cells: BTreeMap<RowId, BTreeMap<String, Value>>,
    rows: BTreeSet<RowId>,
    columns: BTreeSet<ColumnSelection>,
}

impl TableSelection {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.rows.is_empty() && self.columns.is_empty()
    }

    /// Selected cells in row order, excluding cells implied by row selections.
    pub fn cells(&self) -> impl Iterator<Item = CellSelection> + '_ {
        self.cells.iter().flat_map(|(row_id, cols)| {
            cols.iter()
                .map(move |(col, v)| CellSelection::new(row_id.clone(), col.clone(), v.clone()))
        })
    }

    pub fn cell_count(&self) -> usize {
        self.cells.values().map(BTreeMap::len).sum()
    }

    /// Selected cell columns of one row (empty for unselected or whole rows).
    pub fn cells_in_row(&self, row_id: &RowId) -> Vec<&str> {
        self.cells
            .get(row_id)
            .map(|cols| cols.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn rows(&self) -> impl Iterator<Item = RowSelection> + '_ {
        self.rows.iter().map(|row_id| RowSelection {
            row_id: row_id.clone(),
        })
    }

    pub fn row_ids(&self) -> impl Iterator<Item = &RowId> {
        self.rows.iter()
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnSelection> {
        self.columns.iter()
    }

    pub fn is_row_selected(&self, row_id: &RowId) -> bool {
        self.rows.contains(row_id)
    }

    /// A cell of a selected row counts as selected.
    pub fn is_cell_selected(&self, row_id: &RowId, column: &str) -> bool {
        self.rows.contains(row_id)
            || self
                .cells
                .get(row_id)
                .is_some_and(|cols| cols.contains_key(column))
    }

    pub fn is_column_selected(&self, column: &ColumnSelection) -> bool {
        self.columns.contains(column)
    }

    /// Toggle one cell. Returns whether the cell is selected afterwards.
    pub(crate) fn toggle_cell(
        &mut self,
        row_id: &RowId,
        column: &str,
        value: Value,
        schema: Option<&TableSchema>,
        table: &str,
    ) -> Result<bool, SelectionError> {
        if self.rows.contains(row_id) {
            let schema = schema.ok_or_else(|| SelectionError::UnknownSchema {
                table: table.to_string(),
            })?;
            self.rows.remove(row_id);
            let remaining: BTreeMap<String, Value> = schema
                .columns()
                .iter()
                .filter(|c| c.as_str() != column)
                .map(|c| (c.clone(), schema.cell_value(row_id, c)))
                .collect();
            if !remaining.is_empty() {
                self.cells.insert(row_id.clone(), remaining);
            }
            self.promote(row_id, Some(schema));
            return Ok(self.is_cell_selected(row_id, column));
        }

        let cols = self.cells.entry(row_id.clone()).or_default();
        let selected = if cols.remove(column).is_some() {
            false
        } else {
            cols.insert(column.to_string(), value);
            true
        };
        if cols.is_empty() {
            self.cells.remove(row_id);
        }
        self.promote(row_id, schema);
        Ok(selected)
    }

    /// Toggle a whole row. Returns whether the row is selected afterwards.
    pub(crate) fn toggle_row(&mut self, row_id: &RowId) -> bool {
        self.cells.remove(row_id);
        if self.rows.remove(row_id) {
            false
        } else {
            self.rows.insert(row_id.clone());
            true
        }
    }

    pub(crate) fn toggle_column(&mut self, column: ColumnSelection) -> bool {
        if self.columns.remove(&column) {
            false
        } else {
            self.columns.insert(column);
            true
        }
    }

    /// Insert a row selection if absent, dropping partial cells.
    pub(crate) fn insert_row(&mut self, row_id: &RowId) -> bool {
        self.cells.remove(row_id);
        self.rows.insert(row_id.clone())
    }

    /// Insert a cell if neither it nor its row is already selected.
    pub(crate) fn insert_cell(&mut self, row_id: &RowId, column: &str, value: &Value) -> bool {
        if self.rows.contains(row_id) {
            return false;
        }
        let cols = self.cells.entry(row_id.clone()).or_default();
        if cols.contains_key(column) {
            return false;
        }
        cols.insert(column.to_string(), value.clone());
        true
    }

    /// Collapse a row's cells into a row selection once every column is picked.
    pub(crate) fn promote(&mut self, row_id: &RowId, schema: Option<&TableSchema>) -> bool {
        let Some(schema) = schema else {
            return false;
        };
        if schema.columns().is_empty() {
            return false;
        }
        let complete = self
            .cells
            .get(row_id)
            .is_some_and(|cols| schema.columns().iter().all(|c| cols.contains_key(c)));
        if complete {
            tracing::trace!(row = %row_id, "all columns selected, promoting to row");
            self.cells.remove(row_id);
            self.rows.insert(row_id.clone());
        }
        complete
    }
}

// ============================================================================
// SelectionStore
// ============================================================================

/// Selection state for every table, keyed by table name.
#[derive(Clone, Debug, Default)]
pub struct SelectionStore {
    tables: HashMap<String, Arc<TableSelection>>,
    schemas: HashMap<String, TableSchema>,
}

impl SelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the columns and cached rows of a freshly fetched page.
    pub fn observe_page(&mut self, table: &str, page: &TablePage, row_id_field: &str) {
        let schema = TableSchema::from_page(page, row_id_field);
        tracing::debug!(
            table,
            columns = schema.columns().len(),
            rows = page.rows.len(),
            page = page.page,
            "observed table page"
        );
        self.schemas.insert(table.to_string(), schema);
    }

    /// Register a schema directly.
    pub fn set_schema(&mut self, table: &str, schema: TableSchema) {
        self.schemas.insert(table.to_string(), schema);
    }

    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.schemas.get(table)
    }

    /// Shared snapshot of one table's selection.
    pub fn snapshot(&self, table: &str) -> Option<Arc<TableSelection>> {
        self.tables.get(table).cloned()
    }

    pub fn table(&self, table: &str) -> Option<&TableSelection> {
        self.tables.get(table).map(Arc::as_ref)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Toggle one cell. Returns whether the cell is selected afterwards.
    ///
    /// A column outside the known data columns is rejected and nothing changes.
    #[tracing::instrument(skip(self, value), name = "selection.toggle_cell")]
    pub fn toggle_cell(
        &mut self,
        table: &str,
        row_id: &RowId,
        column: &str,
        value: Value,
    ) -> Result<bool, SelectionError> {
        let schema = self.schemas.get(table);
        if let Some(schema) = schema
            && !schema.columns().is_empty()
            && !schema.columns().iter().any(|c| c == column)
        {
            return Err(SelectionError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        let is_row = self
            .tables
            .get(table)
            .is_some_and(|sel| sel.is_row_selected(row_id));
        if is_row && schema.is_none() {
            return Err(SelectionError::UnknownSchema {
                table: table.to_string(),
            });
        }
        let entry = self.tables.entry(table.to_string()).or_default();
        Arc::make_mut(entry).toggle_cell(row_id, column, value, schema, table)
    }

    /// Toggle a whole row. Returns whether the row is selected afterwards.
    #[tracing::instrument(skip(self), name = "selection.toggle_row")]
    pub fn toggle_row(&mut self, table: &str, row_id: &RowId) -> bool {
        let entry = self.tables.entry(table.to_string()).or_default();
        Arc::make_mut(entry).toggle_row(row_id)
    }

    /// Toggle a column header. Independent of cell and row state.
    #[tracing::instrument(skip(self), name = "selection.toggle_column")]
    pub fn toggle_column(
        &mut self,
        table: &str,
        column: &str,
        column_index: usize,
        page: u32,
    ) -> bool {
        let entry = self.tables.entry(table.to_string()).or_default();
        Arc::make_mut(entry).toggle_column(ColumnSelection::new(column, column_index, page))
    }

    pub fn is_cell_selected(&self, table: &str, row_id: &RowId, column: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|sel| sel.is_cell_selected(row_id, column))
    }

    pub fn is_row_selected(&self, table: &str, row_id: &RowId) -> bool {
        self.tables
            .get(table)
            .is_some_and(|sel| sel.is_row_selected(row_id))
    }

    pub fn is_column_selected(
        &self,
        table: &str,
        column: &str,
        column_index: usize,
        page: u32,
    ) -> bool {
        let probe = ColumnSelection::new(column, column_index, page);
        self.tables
            .get(table)
            .is_some_and(|sel| sel.is_column_selected(&probe))
    }

    /// Drop every selection in one table, keeping its schema.
    pub fn clear_table(&mut self, table: &str) {
        if let Some(entry) = self.tables.get_mut(table) {
            *entry = Arc::new(TableSelection::default());
        }
    }

    /// Forget a table entirely (selection and schema).
    pub fn remove_table(&mut self, table: &str) -> Option<Arc<TableSelection>> {
        self.schemas.remove(table);
        self.tables.remove(table)
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.schemas.clear();
    }

    /// Swap in a fully computed selection for one table.
    pub(crate) fn replace(&mut self, table: &str, selection: TableSelection) {
        self.tables.insert(table.to_string(), Arc::new(selection));
    }
}

// ============================================================================
// Tests
// ============================================================================
