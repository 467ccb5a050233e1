//! Chat session glue.
//!
//! [`ChatSession`] is the single writer of the [`Conversation`] and the
//! [`SelectionStore`]. It sends user requests through the connection
//! manager, folds incoming events into the conversation, fetches table
//! pages, and merges attached queries into the selection.

use std::sync::Arc;

use tablechat_state::{
    Applied, Conversation, MergeReport, QueryContext, QueryExecutionError, QueryMerger,
    SelectionStore,
};
use tablechat_types::{ChatRequest, Message, ServerEvent, TablePage};
use tokio::sync::broadcast;

use crate::backend::{BackendClient, RequestError};
use crate::config::{Config, ConfigError};
use crate::connection::{
    ConnectionError, ConnectionHandle, Connector, SessionBootstrap, WsConnector, spawn_connection,
};

/// Errors from session-level actions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a response is still streaming")]
    TurnInProgress,
    #[error("no table selected")]
    NoTable,
    #[error("no message carries a query")]
    NoAttachedQuery,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Query(#[from] QueryExecutionError),
}

/// The currently open table page.
#[derive(Clone, Debug)]
pub struct OpenTable {
    pub name: String,
    pub page: TablePage,
}

pub struct ChatSession {
    backend: BackendClient,
    connection: ConnectionHandle,
    conversation: Conversation,
    selection: SelectionStore,
    merger: QueryMerger,
    table: Option<OpenTable>,
    /// Link generation the outstanding request went out on.
    request_generation: Option<u64>,
    pdf_name: String,
    page_size: u32,
    row_id_field: String,
}

impl ChatSession {
    /// Establish the cookie session, then open the chat stream with the
    /// session cookie attached.
    pub async fn connect(config: &Config) -> Result<Self, SessionError> {
        config.validate()?;
        let backend = BackendClient::new(config.base_url()?)?;
        backend.ensure_session().await?;

        let connector = WsConnector::new(config.ws_url()?)
            .with_cookies(backend.cookie_jar(), backend.base_url().clone());
        let bootstrap: Arc<dyn SessionBootstrap> = Arc::new(backend.clone());
        let connection = spawn_connection(
            Arc::new(connector) as Arc<dyn Connector>,
            Some(bootstrap),
            config.reconnect_delay(),
        );
        Ok(Self::new(backend, connection, config))
    }

    /// Wrap an already spawned connection.
    pub fn new(backend: BackendClient, connection: ConnectionHandle, config: &Config) -> Self {
        Self {
            backend,
            connection,
            conversation: Conversation::new(config.chat.delta_mode),
            selection: SelectionStore::new(),
            merger: QueryMerger::new(config.table.row_id_field.clone()),
            table: None,
            request_generation: None,
            pdf_name: config.pdf_name().to_string(),
            page_size: config.table.page_size,
            row_id_field: config.table.row_id_field.clone(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn selection(&self) -> &SelectionStore {
        &self.selection
    }

    /// Mutable selection access for manual toggles.
    pub fn selection_mut(&mut self) -> &mut SelectionStore {
        &mut self.selection
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn table(&self) -> Option<&OpenTable> {
        self.table.as_ref()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.connection.subscribe_events()
    }

    // ── Tables ───────────────────────────────────────────────────────────

    /// Fetch a page of `table_name` and make it the open table.
    pub async fn open_table(&mut self, table_name: &str, page: u32) -> Result<&OpenTable, SessionError> {
        let page = self
            .backend
            .fetch_table(table_name, page.max(1), self.page_size)
            .await?;
        self.selection.observe_page(table_name, &page, &self.row_id_field);
        tracing::info!(
            table = table_name,
            page = page.page,
            total_pages = page.total_pages,
            "opened table page"
        );
        Ok(self.table.insert(OpenTable {
            name: table_name.to_string(),
            page,
        }))
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.backend.list_tables().await?)
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    /// Append the user's message and send it. Refuses while a reply is
    /// outstanding, from the send until its turn-end.
    ///
    /// A reply whose link dropped is abandoned first, so a reconnect never
    /// leaves the session stuck. The message is appended before sending and
    /// stays in the conversation when the send fails.
    pub async fn send(&mut self, text: &str) -> Result<(), SessionError> {
        self.release_lost_reply();
        if self.conversation.turn_open() {
            return Err(SessionError::TurnInProgress);
        }
        let table = self.table.as_ref().ok_or(SessionError::NoTable)?;
        let request = ChatRequest::new(table.name.clone(), self.pdf_name.clone(), text);

        self.conversation.push_user_message(text);
        self.request_generation = Some(self.connection.state().generation);
        if let Err(e) = self.connection.send(&request).await {
            self.conversation.abandon_turn();
            self.request_generation = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Abandon the outstanding reply if the link it was requested on is gone.
    fn release_lost_reply(&mut self) {
        if !self.conversation.turn_open() {
            return;
        }
        let link = self.connection.state();
        let lost = !link.connected
            || self
                .request_generation
                .is_some_and(|sent_on| sent_on != link.generation);
        if lost {
            tracing::info!(generation = link.generation, "reply lost with its link");
            self.conversation.abandon_turn();
            self.request_generation = None;
        }
    }

    /// Fold one server event into the conversation.
    pub fn apply_event(&mut self, event: &ServerEvent) -> Applied {
        let applied = self.conversation.apply(event);
        match applied {
            // Server-initiated turns are tied to the link they arrived on.
            Applied::Opened if self.request_generation.is_none() => {
                self.request_generation = Some(self.connection.state().generation);
            }
            Applied::Completed => self.request_generation = None,
            _ => {}
        }
        applied
    }

    /// Reset the backend thread for the open table and clear the history.
    pub async fn reset_thread(&mut self) -> Result<(), SessionError> {
        let table = self.table.as_ref().ok_or(SessionError::NoTable)?;
        self.backend.reinitiate_thread(&table.name).await?;
        self.conversation.clear();
        self.request_generation = None;
        tracing::info!(table = %table.name, "conversation thread reset");
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Run the most recent attached query against the open table.
    pub async fn run_attached_query(&mut self) -> Result<MergeReport, SessionError> {
        let message = self
            .conversation
            .last_attached_query()
            .ok_or(SessionError::NoAttachedQuery)?;
        let (sql, ctx) = query_of(message).ok_or(SessionError::NoAttachedQuery)?;
        self.run_query(&sql, &ctx).await
    }

    /// Run a SQL string against the open table and merge the matches.
    pub async fn run_query(&mut self, sql: &str, ctx: &QueryContext) -> Result<MergeReport, SessionError> {
        let table = self.table.as_ref().ok_or(SessionError::NoTable)?;
        let report = self
            .merger
            .merge_query(&self.backend, &mut self.selection, &table.name, sql, ctx)
            .await?;
        Ok(report)
    }
}

fn query_of(message: &Message) -> Option<(String, QueryContext)> {
    let sql = message.attached_query.clone()?;
    let ctx = QueryContext::new(message.role.as_str()).with_query_type(message.query_type.as_deref());
    Some((sql, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablechat_types::Role;

    #[test]
    fn test_query_context_from_message() {
        let mut msg = Message::streaming(Role::new("sql_agent"));
        assert!(query_of(&msg).is_none());

        msg.attached_query = Some("SELECT ctid FROM cars".into());
        let (sql, ctx) = query_of(&msg).unwrap();
        assert_eq!(sql, "SELECT ctid FROM cars");
        assert_eq!(ctx.role, "sql_agent");
        assert_eq!(ctx.query_type, "retrieval");

        msg.query_type = Some("manipulation".into());
        assert_eq!(query_of(&msg).unwrap().1.query_type, "manipulation");
    }
}
