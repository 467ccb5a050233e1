//! Shared row identity, selection, message, and wire types for tablechat.
//!
//! This crate is the leaf of the workspace: it has **no internal tablechat
//! dependencies** and no I/O. Everything the state reducers and the client
//! exchange is defined here.
//!
//! # Overview
//!
//! ```text
//! Table (table_name)
//!     └── Row (RowId ← backend ctid, stable across pages)
//!         └── Cell (RowId + column)
//!
//! Conversation
//!     └── Message (role, content, attached query, usage)
//!         └── TokenUsage (one per model invocation)
//!
//! Stream frame ──parse──▶ ServerEvent ──reduce──▶ Message
//! ```
//!
//! # Key Types
//!
//! |----------------------|--------------------------------------------|
//! | Type                 | Purpose                                    |
//! |----------------------|--------------------------------------------|
//! | [`RowId`]            | Opaque, pagination-stable row identifier   |
//! | [`CellSelection`]    | Selected cell (identity = row + column)    |
//! | [`RowSelection`]     | Whole-row selection                        |
//! | [`ColumnSelection`]  | Column header selection                    |
//! | [`Message`]          | One chat message                           |
//! | [`TokenUsage`]       | Usage of one model invocation              |
//! | [`ServerEvent`]      | Typed incoming stream event                |
//! | [`ChatRequest`]      | Outgoing user request frame                |
//! | [`TablePage`]        | One fetched page of table rows             |
//! | [`QueryMatch`]       | Classified SQL result entry                |
//! |----------------------|--------------------------------------------|

pub mod ids;
pub mod message;
pub mod protocol;
pub mod selection;
pub mod table;

pub use ids::{DEFAULT_ROW_ID_FIELD, RowId};
pub use message::{Message, MessageStatus, Role, TokenUsage, USER_ROLE};
pub use protocol::{ChatRequest, EventKind, ProtocolError, REQUEST_EVENT, ServerEvent};
pub use selection::{CellSelection, ColumnSelection, RowSelection};
pub use table::{
    DEFAULT_QUERY_TYPE, MatchError, QueryMatch, SqlQueryRequest, SqlQueryResponse, TablePage,
    TableRequest, ThreadResetRequest,
};
