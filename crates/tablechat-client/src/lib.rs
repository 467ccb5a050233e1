//! tablechat client library
//!
//! Connects the state containers in `tablechat-state` to the backend: a
//! reconnecting chat stream over websocket, the backend's HTTP endpoints,
//! configuration loading, and [`ChatSession`], which wires stream events
//! into the conversation and query results into the selection store.

pub mod backend;
pub mod config;
pub mod connection;
pub mod constants;
pub mod session;

pub use backend::{BackendClient, RequestError};
pub use config::{Config, ConfigError};
pub use connection::{
    ConnectionError, ConnectionHandle, ConnectionStatus, Connector, Duplex, FrameSink,
    FrameStream, LinkState, SessionBootstrap, WsConnector, spawn_connection,
};
pub use session::{ChatSession, OpenTable, SessionError};
