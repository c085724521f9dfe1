use url::Url;

use crate::errors::ClientError;

/// Environment variable naming the full backend URL (overrides the host).
pub const ENV_BACKEND_URL: &str = "DEEPMICROPATH_URL";
/// Environment variable naming the realtime host when no URL override is set.
pub const ENV_WS_HOST: &str = "DEEPMICROPATH_WS_HOST";
/// Environment variable carrying the optional bearer key.
pub const ENV_API_KEY: &str = "DEEPMICROPATH_API_KEY";

const DEFAULT_HOST: &str = "localhost:8000";
const WS_PATH: &str = "/api/v1/ws/analysis";
const API_PATH: &str = "/api/v1";

/// Resolved backend endpoint. Resolution order: explicit backend URL
/// override, else configured host. The transport scheme mirrors the
/// `secure` flag (wss/https vs ws/http).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub secure: bool,
    pub api_key: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            secure: false,
            api_key: None,
        }
    }

    /// Parse an explicit backend URL override; only its host (and scheme,
    /// for the secure flag) are used.
    pub fn from_base_url(base: &str) -> Result<Self, ClientError> {
        let url = Url::parse(base)
            .map_err(|e| ClientError::InvalidRequest(format!("bad backend url {base:?}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::InvalidRequest(format!("backend url has no host: {base:?}")))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let secure = matches!(url.scheme(), "https" | "wss");
        Ok(Self {
            host,
            secure,
            api_key: None,
        })
    }

    /// Resolve from the environment: `DEEPMICROPATH_URL` wins, then
    /// `DEEPMICROPATH_WS_HOST`, then the default local host. An unparsable
    /// URL override is an error, not a silent fallback.
    pub fn from_env() -> Result<Self, ClientError> {
        let mut endpoint = match std::env::var(ENV_BACKEND_URL) {
            Ok(base) => Self::from_base_url(&base)?,
            Err(_) => {
                let host = std::env::var(ENV_WS_HOST).unwrap_or_else(|_| DEFAULT_HOST.to_string());
                Self::new(host)
            }
        };
        endpoint.api_key = std::env::var(ENV_API_KEY).ok().filter(|k| !k.is_empty());
        Ok(endpoint)
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// URL of the realtime analysis socket.
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{WS_PATH}", self.host)
    }

    /// Base URL of the HTTP API.
    pub fn api_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}{API_PATH}", self.host)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST)
    }
}
