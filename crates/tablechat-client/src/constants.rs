//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default backend base URL for local development.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Default chat stream endpoint.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/chat-client";

/// Fixed delay between a lost connection and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Default page size for table fetches.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Capacity of the incoming event broadcast. Slow subscribers past this
/// many queued events see `RecvError::Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the connection status broadcast.
pub const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "TABLECHAT_CONFIG";

/// Directory name under the platform config dir.
pub const APP_NAME: &str = "tablechat";
