//! Request gateway: bearer attachment and transparent recovery from 401s.
//!
//! Requests that hit a 401 wait in a pending queue for the session
//! manager's single refresh, then either retry once with the new token or
//! fail together with the refresh error.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ApiError, AuthError};
use crate::manager::SessionManager;
use crate::session::Session;

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Status code that triggers a session refresh.
const UNAUTHORIZED: u16 = 401;

// ============================================================================
// Request / response
// ============================================================================

/// An outbound API call, relative to the transport's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Unserializable body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into the matching `ApiError`.
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.body))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Executes a single request. The gateway adds the bearer token; the
/// transport must not retry on its own.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError>;
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);
        debug!(method = %request.method, url = %url, authenticated = bearer.is_some(), "API request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.text().await?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

// ============================================================================
// Gateway
// ============================================================================

type Waiter = oneshot::Sender<Result<Session, AuthError>>;

#[derive(Default)]
struct PendingQueue {
    waiters: Vec<Waiter>,
    /// A driver task is awaiting the manager's refresh.
    draining: bool,
}

/// Clone is cheap; clones share the pending queue.
#[derive(Clone)]
pub struct RequestGateway {
    manager: SessionManager,
    transport: Arc<dyn HttpTransport>,
    queue: Arc<Mutex<PendingQueue>>,
}

impl RequestGateway {
    pub fn new(manager: SessionManager, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            manager,
            transport,
            queue: Arc::new(Mutex::new(PendingQueue::default())),
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Requests currently waiting on a refresh.
    pub fn pending_len(&self) -> usize {
        self.lock_queue().waiters.len()
    }

    fn lock_queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a request with the current bearer token.
    ///
    /// A 401 on an authenticated request parks it until the session manager's
    /// refresh resolves; it is then retried once with the new token. If the
    /// refresh fails the caller gets `ApiError::Auth` with the refresh's
    /// error kind. Every other response is returned unchanged, including
    /// 4xx/5xx ones.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if self.manager.is_refreshing() {
            // Queue behind the in-flight refresh instead of sending a token
            // that is about to be replaced
            self.wait_for_refresh().await?;
        } else if self.manager.needs_refresh() {
            if let Err(e) = self.wait_for_refresh().await {
                // Still usable if the failure was transient and the token has not expired
                if !e.kind.is_transient() || self.manager.token_store().get().is_none() {
                    return Err(e.into());
                }
            }
        }

        let sent_token = self
            .manager
            .token_store()
            .get()
            .map(|s| s.access_token);
        let response = self
            .transport
            .execute(&request, sent_token.as_deref())
            .await?;

        let Some(sent_token) = sent_token else {
            return Ok(response);
        };
        if response.status != UNAUTHORIZED {
            return Ok(response);
        }

        debug!(path = %request.path, "Request unauthorized, recovering session");
        let current = self.manager.token_store().get();
        let session = match current {
            Some(session) if session.access_token != sent_token => {
                debug!("Session already renewed, retrying without refresh");
                session
            }
            _ => self.wait_for_refresh().await?,
        };

        // Exactly one retry; a second 401 is the caller's to handle
        self.transport
            .execute(&request, Some(&session.access_token))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path))
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).json(body)?)
            .await?
            .error_for_status()?
            .json()
    }

    /// Join the pending queue and wait for the refresh outcome.
    async fn wait_for_refresh(&self) -> Result<Session, AuthError> {
        let (tx, rx) = oneshot::channel();
        let start_driver = {
            let mut queue = self.lock_queue();
            queue.waiters.push(tx);
            !std::mem::replace(&mut queue.draining, true)
        };

        if start_driver {
            let gateway = self.clone();
            tokio::spawn(async move { gateway.drain().await });
        }

        rx.await.unwrap_or_else(|_| Err(AuthError::session_expired()))
    }

    /// Run one refresh and settle every waiter queued before it resolved.
    async fn drain(&self) {
        let result = self.manager.refresh_session().await;

        let waiters = {
            let mut queue = self.lock_queue();
            queue.draining = false;
            std::mem::take(&mut queue.waiters)
        };
        debug!(
            waiters = waiters.len(),
            refreshed = result.is_ok(),
            "Releasing pending requests"
        );

        if let Err(e) = &result {
            if e.kind.is_transient() {
                warn!(kind = %e.kind, "Refresh failed transiently, pending requests rejected");
                self.manager.notifier().warning(
                    "Connection problem",
                    "Could not renew your session. Your request was not sent; please try again.",
                );
            }
        }

        for waiter in waiters {
            // Receiver gone means the caller was dropped
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let req = ApiRequest::get("units/1")
            .query("page", "2")
            .header("X-Trace", "abc");
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.query, vec![("page".to_string(), "2".to_string())]);
        assert_eq!(req.headers.len(), 1);
        assert!(req.body.is_none());

        let req = ApiRequest::post("items")
            .json(&serde_json::json!({"name": "tent"}))
            .expect("serializable");
        assert_eq!(req.body.expect("body")["name"], "tent");
    }

    #[test]
    fn test_response_helpers() {
        let ok = ApiResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: r#"{"id": 3}"#.to_string(),
        };
        assert_eq!(ok.header("content-type"), Some("application/json"));
        let value: serde_json::Value = ok.clone().error_for_status().unwrap().json().unwrap();
        assert_eq!(value["id"], 3);

        let missing = ApiResponse {
            status: 404,
            headers: Vec::new(),
            body: "gone".to_string(),
        };
        assert!(matches!(missing.error_for_status(), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn test_invalid_json_is_invalid_response() {
        let resp = ApiResponse {
            status: 200,
            headers: Vec::new(),
            body: "<html>".to_string(),
        };
        let result: Result<serde_json::Value, _> = resp.json();
        assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
    }

    #[test]
    fn test_transport_url_joining() {
        let transport = ReqwestTransport::with_client(Client::new(), "http://localhost:8000/api/v1/");
        assert_eq!(transport.url("/users/me"), "http://localhost:8000/api/v1/users/me");
        assert_eq!(transport.url("https://other.host/x"), "https://other.host/x");
    }
}
