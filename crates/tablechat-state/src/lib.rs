//! Synchronous state containers for tablechat.
//!
//! Nothing in this crate does I/O except through the [`QueryExecutor`]
//! seam. Each container has a single writer; reads are snapshots as of the
//! last applied mutation.
//!
//! - [`SelectionStore`]: per-table cell/row/column selection with
//!   promotion and demotion between cells and whole rows
//! - [`Conversation`]: folds server stream events into chat messages
//! - [`QueryMerger`]: executes attached queries and merges their matches
//!   into the selection store

pub mod conversation;
pub mod merge;
pub mod selection;

pub use conversation::{Applied, Conversation, DeltaMode, MessageGroup};
pub use merge::{MergeReport, QueryContext, QueryExecutionError, QueryExecutor, QueryMerger};
pub use selection::{SelectionError, SelectionStore, TableSchema, TableSelection};
