//! One-shot cache for the backend's feature configuration.

use std::future::Future;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use micropath_core::errors::ClientError;

use crate::inference::InferenceClient;

/// Feature switches served by `GET /config`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub need_code: bool,
    #[serde(default)]
    pub hide_user_api_key: bool,
    #[serde(default)]
    pub hide_balance_query: bool,
    #[serde(default)]
    pub custom_models: String,
    #[serde(default)]
    pub default_model: String,
}

/// Explicit fetch lifecycle. A failure is not cached, so the next caller
/// retries.
#[derive(Clone, Debug)]
enum FetchState {
    Idle,
    Fetched(ServerConfig),
    Failed(String),
}

/// Caches the server configuration after the first successful fetch.
/// Concurrent callers coalesce onto one in-flight request because the lock
/// is held across the fetch.
#[derive(Debug, Default)]
pub struct ServerConfigStore {
    state: Mutex<FetchState>,
}

impl Default for FetchState {
    fn default() -> Self {
        Self::Idle
    }
}

impl ServerConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached configuration or run `fetch` to populate it.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<ServerConfig, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ServerConfig, ClientError>>,
    {
        let mut state = self.state.lock().await;
        if let FetchState::Fetched(config) = &*state {
            return Ok(config.clone());
        }

        match fetch().await {
            Ok(config) => {
                debug!(default_model = %config.default_model, "server config fetched");
                *state = FetchState::Fetched(config.clone());
                Ok(config)
            }
            Err(e) => {
                warn!(error = %e, "server config fetch failed");
                *state = FetchState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Fetch through the HTTP client.
    pub async fn get_or_fetch_from(
        &self,
        client: &InferenceClient,
    ) -> Result<ServerConfig, ClientError> {
        self.get_or_fetch(|| client.server_config()).await
    }

    /// The cached configuration, if a fetch has succeeded.
    pub async fn cached(&self) -> Option<ServerConfig> {
        match &*self.state.lock().await {
            FetchState::Fetched(config) => Some(config.clone()),
            _ => None,
        }
    }

    /// Message of the most recent failed fetch, if that is the current
    /// state.
    pub async fn last_error(&self) -> Option<String> {
        match &*self.state.lock().await {
            FetchState::Failed(message) => Some(message.clone()),
            _ => None,
        }
    }

    pub async fn state_name(&self) -> &'static str {
        match &*self.state.lock().await {
            FetchState::Idle => "idle",
            FetchState::Fetched(_) => "fetched",
            FetchState::Failed(_) => "failed",
        }
    }

    /// Drop any cached value so the next caller fetches again.
    pub async fn reset(&self) {
        *self.state.lock().await = FetchState::Idle;
    }
}
