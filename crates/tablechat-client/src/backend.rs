//! Backend HTTP client.
//!
//! Request/response calls against the backend's REST endpoints. Every call
//! shares one cookie jar so the session cookie set by `/set-session` rides
//! along on later requests and on the websocket handshake. There is no
//! automatic retry; failures surface to the caller as [`RequestError`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::cookie::Jar;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tablechat_state::{QueryExecutionError, QueryExecutor};
use tablechat_types::{
    SqlQueryRequest, SqlQueryResponse, TablePage, TableRequest, ThreadResetRequest,
};
use url::Url;

use crate::connection::SessionBootstrap;

/// Errors from backend HTTP calls.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("invalid endpoint {path:?}: {source}")]
    Url {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request to {url} failed: {source}")]
    Http {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Status {
        url: Url,
        status: StatusCode,
        body: String,
    },
    #[error("decode response from {url}: {source}")]
    Decode {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
}

/// HTTP client for the backend's request/response endpoints.
#[derive(Clone, Debug)]
pub struct BackendClient {
    base_url: Url,
    http: reqwest::Client,
    jar: Arc<Jar>,
}

impl BackendClient {
    pub fn new(base_url: Url) -> Result<Self, RequestError> {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .build()
            .map_err(RequestError::Build)?;
        Ok(Self {
            base_url,
            http,
            jar,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The shared cookie jar. The websocket connector reads the session
    /// cookie from here.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url, RequestError> {
        self.base_url.join(path).map_err(|source| RequestError::Url {
            path: path.to_string(),
            source,
        })
    }

    // ── Session ──────────────────────────────────────────────────────────

    /// Look up the cookie session, creating one when the backend has none.
    ///
    /// Returns the backend's session payload.
    #[tracing::instrument(skip(self), name = "backend.ensure_session")]
    pub async fn ensure_session(&self) -> Result<serde_json::Value, RequestError> {
        let url = self.endpoint("get-session")?;
        let response = self.send(self.http.get(url.clone()), &url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::info!("no session found, creating one");
            let url = self.endpoint("set-session")?;
            let response = self.send(self.http.get(url.clone()), &url).await?;
            return decode(check(response, &url).await?, &url).await;
        }
        decode(check(response, &url).await?, &url).await
    }

    /// Start the server-side chat task for this session.
    #[tracing::instrument(skip(self), name = "backend.start_chat")]
    pub async fn start_chat(&self) -> Result<(), RequestError> {
        let url = self.endpoint("chat-server")?;
        let response = self.send(self.http.post(url.clone()), &url).await?;
        check(response, &url).await?;
        Ok(())
    }

    /// Reset the conversation thread for a table.
    #[tracing::instrument(skip(self), name = "backend.reinitiate_thread")]
    pub async fn reinitiate_thread(&self, table_name: &str) -> Result<(), RequestError> {
        let body = ThreadResetRequest {
            table_name: table_name.to_string(),
        };
        let _: serde_json::Value = self.post_json("reinitiate-thread", &body).await?;
        Ok(())
    }

    // ── Tables ───────────────────────────────────────────────────────────

    #[tracing::instrument(skip(self), name = "backend.list_tables")]
    pub async fn list_tables(&self) -> Result<Vec<String>, RequestError> {
        let url = self.endpoint("get-tables")?;
        let response = self.send(self.http.get(url.clone()), &url).await?;
        decode(check(response, &url).await?, &url).await
    }

    #[tracing::instrument(skip(self), name = "backend.fetch_table")]
    pub async fn fetch_table(
        &self,
        table_name: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TablePage, RequestError> {
        let body = TableRequest {
            table_name: table_name.to_string(),
            page,
            page_size,
        };
        self.post_json("get-table", &body).await
    }

    #[tracing::instrument(skip(self, request), fields(table = %request.table_name), name = "backend.run_sql")]
    pub async fn run_sql(&self, request: &SqlQueryRequest) -> Result<SqlQueryResponse, RequestError> {
        self.post_json("sql-query", request).await
    }

    // ── Plumbing ─────────────────────────────────────────────────────────

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let response = self.send(self.http.post(url.clone()).json(body), &url).await?;
        decode(check(response, &url).await?, &url).await
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url,
    ) -> Result<reqwest::Response, RequestError> {
        request.send().await.map_err(|source| RequestError::Http {
            url: url.clone(),
            source,
        })
    }
}

async fn check(response: reqwest::Response, url: &Url) -> Result<reqwest::Response, RequestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(%url, %status, "backend request failed");
    Err(RequestError::Status {
        url: url.clone(),
        status,
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, url: &Url) -> Result<T, RequestError> {
    response.json().await.map_err(|source| RequestError::Decode {
        url: url.clone(),
        source,
    })
}

#[async_trait]
impl QueryExecutor for BackendClient {
    async fn run_sql(
        &self,
        request: &SqlQueryRequest,
    ) -> Result<SqlQueryResponse, QueryExecutionError> {
        BackendClient::run_sql(self, request)
            .await
            .map_err(|e| QueryExecutionError::Execution(Box::new(e)))
    }
}

#[async_trait]
impl SessionBootstrap for BackendClient {
    async fn start_session(&self) -> Result<(), RequestError> {
        self.start_chat().await
    }
}
