use log::{debug, warn};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;

use crate::config::{AppConfig, RetryConfig, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::model::{Body, Entity, EntityId, Method};
use crate::store::traits::EntityStore;

pub const CSRF_HEADER: &str = "x-csrftoken";

/// Entity store reached over REST.
///
/// Transient failures (connectivity, timeouts, 5xx, 429) are retried with
/// exponential backoff; any other non-success answer is a [`StoreError::Conflict`]
/// carrying the store's own message.
#[derive(Debug)]
pub struct HttpEntityStore {
    client: Client,
    base_url: String,
    /// Attached to every call; replaceable while the store is in use
    headers: RwLock<HeaderMap>,
    retry: RetryConfig,
}

impl HttpEntityStore {
    pub fn new(base_url: impl Into<String>) -> StoreResult<Self> {
        Self::with_config(base_url, &StoreConfig::default(), RetryConfig::default())
    }

    /// Store at `config.store_base_url()` with the configured headers and retry policy.
    pub fn from_config(config: &AppConfig) -> StoreResult<Self> {
        Self::with_config(config.store_base_url(), &config.store, config.retry.clone())
    }

    pub fn with_config(
        base_url: impl Into<String>,
        config: &StoreConfig,
        retry: RetryConfig,
    ) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        let store = Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: RwLock::new(HeaderMap::new()),
            retry,
        };
        if let Some(token) = &config.csrf_token {
            store.set_header(CSRF_HEADER, token)?;
        }
        if let Some(cookie) = &config.session_cookie {
            store.set_header(COOKIE.as_str(), cookie)?;
        }
        Ok(store)
    }

    /// Attach `name: value` to every subsequent call, replacing an earlier value.
    pub fn set_header(&self, name: &str, value: &str) -> StoreResult<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| StoreError::Transport(format!("invalid header name: {}", err)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| StoreError::Transport(format!("invalid header value: {}", err)))?;
        self.headers.write().insert(name, value);
        Ok(())
    }

    pub fn remove_header(&self, name: &str) {
        self.headers.write().remove(name);
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Body>) -> StoreResult<Response> {
        let url = self.url(path);
        let attempts = self.retry.max_attempts.max(1);
        let mut retry = 0;
        loop {
            let result = self.send_once(method, &url, body).await;
            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if !err.is_transient() || retry + 1 >= attempts {
                return Err(err);
            }
            let delay = self.retry.backoff(retry);
            warn!(
                "{} {} failed ({}), retrying in {:?} ({}/{})",
                method,
                url,
                err,
                delay,
                retry + 1,
                attempts - 1
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn send_once(&self, method: Method, url: &str, body: Option<&Body>) -> StoreResult<Response> {
        let request = match method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Patch => self.client.patch(url),
            Method::Delete => self.client.delete(url),
        };
        let headers = self.headers.read().clone();
        let mut request = request.headers(headers);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!("{} {} -> {}", method, url, status);
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(StoreError::Conflict {
            status: status.as_u16(),
            message: remote_message(&text).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            }),
        })
    }
}

/// Message the store put in an error body: `message`, `detail` or `error`
/// when the body is JSON, otherwise the raw text.
fn remote_message(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(text) {
        for key in ["message", "detail", "error"] {
            if let Some(Value::String(message)) = fields.get(key) {
                return Some(message.clone());
            }
        }
    }
    Some(text.to_string())
}

#[async_trait::async_trait]
impl EntityStore for HttpEntityStore {
    async fn get(&self, collection: &str, id: EntityId) -> StoreResult<Entity> {
        let response = self
            .send(Method::Get, &format!("{}/{}", collection, id), None)
            .await?;
        Ok(response.json::<Entity>().await?)
    }

    async fn create(&self, collection: &str, body: &Body) -> StoreResult<Entity> {
        let response = self.send(Method::Post, collection, Some(body)).await?;
        let created = response.json::<Entity>().await?;
        if created.id().is_none() {
            return Err(StoreError::Decode(format!(
                "POST {} answered without an id",
                collection
            )));
        }
        Ok(created)
    }

    async fn update(&self, collection: &str, id: EntityId, patch: &Body) -> StoreResult<()> {
        self.send(Method::Patch, &format!("{}/{}", collection, id), Some(patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: EntityId) -> StoreResult<()> {
        self.send(Method::Delete, &format!("{}/{}", collection, id), None)
            .await?;
        Ok(())
    }

    async fn list(&self, path: &str) -> StoreResult<Vec<Entity>> {
        let response = self.send(Method::Get, path, None).await?;
        Ok(response.json::<Vec<Entity>>().await?)
    }
}
