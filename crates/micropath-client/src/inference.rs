//! HTTP client for the inference/job API.
//!
//! Covers the synchronous inference endpoint, job status/result/cancel,
//! polling until a terminal state, and file upload. The realtime path lives
//! in [`crate::session`]; this client is the request/response counterpart.

use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use micropath_core::config::Endpoint;
use micropath_core::errors::ClientError;
use micropath_core::events::{AnalysisMode, AnalysisRequest};
use micropath_core::ids::JobId;

const DEFAULT_TEMPERATURE: f64 = 0.6;
const DEFAULT_TOP_P: f64 = 0.95;
const DEFAULT_PRESENCE_PENALTY: f64 = 1.1;
const DEFAULT_PLANNING_PORT: u16 = 6001;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 300;

/// Lifecycle of a backend inference job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Status record returned by `GET /agent/inference/{id}`.
#[derive(Clone, Debug, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub status: JobState,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload of a finished inference. Every field is optional on the wire;
/// some runs produce only a report or metadata.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InferenceOutcome {
    #[serde(default)]
    pub prediction: Option<String>,
    #[serde(default)]
    pub report: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Result record returned by `GET /agent/inference/{id}/result`.
#[derive(Clone, Debug, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    #[serde(default)]
    pub status: Option<JobState>,
    #[serde(default)]
    pub result: InferenceOutcome,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

/// One file queued for upload.
#[derive(Clone, Debug)]
pub struct FileUpload {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Build an upload from base64 content, tolerating a data-URL prefix
    /// (`data:<mime>;base64,...`).
    pub fn from_base64(
        name: impl Into<String>,
        content_type: impl Into<String>,
        encoded: &str,
    ) -> Result<Self, ClientError> {
        let payload = match encoded.find("base64,") {
            Some(idx) => &encoded[idx + "base64,".len()..],
            None => encoded,
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| ClientError::InvalidRequest(format!("bad base64 file content: {e}")))?;
        Ok(Self::new(name, content_type, bytes))
    }
}

/// A stored file as listed by `GET /files`.
#[derive(Clone, Debug, Deserialize)]
pub struct FileEntry {
    #[serde(rename = "filename")]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub upload_time: Option<String>,
}

#[derive(Serialize)]
struct SyncPayload<'a> {
    question: &'a str,
    mode: AnalysisMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<&'a [String]>,
    // Sampling parameters travel nested, not at the top level.
    config: SyncConfig,
}

#[derive(Serialize)]
struct SyncConfig {
    temperature: f64,
    top_p: f64,
    presence_penalty: f64,
    planning_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct SyncResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    result: InferenceOutcome,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    uploaded: Vec<UploadedEntry>,
}

#[derive(Deserialize)]
struct UploadedEntry {
    #[serde(default)]
    public_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct ListFilesResponse {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the backend HTTP API. Cheap to clone.
#[derive(Clone, Debug)]
pub struct InferenceClient {
    http: reqwest::Client,
    base: String,
    api_key: Option<String>,
}

impl InferenceClient {
    pub fn new(endpoint: &Endpoint) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: endpoint.api_url(),
            api_key: endpoint.api_key.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Run one inference synchronously; the call blocks until the backend
    /// finishes. Missing sampling parameters get the backend defaults.
    pub async fn submit_sync(
        &self,
        request: &AnalysisRequest,
    ) -> Result<InferenceOutcome, ClientError> {
        let config = request.config.clone().unwrap_or_default();
        let payload = SyncPayload {
            question: &request.question,
            mode: request.mode,
            files: request.files.as_deref(),
            config: SyncConfig {
                temperature: config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                top_p: config.top_p.unwrap_or(DEFAULT_TOP_P),
                presence_penalty: config.presence_penalty.unwrap_or(DEFAULT_PRESENCE_PENALTY),
                planning_port: DEFAULT_PLANNING_PORT,
                max_tokens: config.max_tokens,
            },
        };

        debug!(mode = request.mode.as_str(), "submitting sync inference");
        let response = self
            .request(reqwest::Method::POST, "/agent/inference/sync")
            .json(&payload)
            .send()
            .await
            .map_err(net_err)?;
        let body: SyncResponse = parse_json(response).await?;

        match body.status.as_str() {
            "completed" => Ok(body.result),
            "error" => Err(ClientError::JobFailed(
                body.error.unwrap_or_else(|| "inference failed".into()),
            )),
            other => Err(ClientError::JobFailed(format!(
                "inference ended with status {other:?}"
            ))),
        }
    }

    pub async fn job_status(&self, job_id: &JobId) -> Result<JobStatus, ClientError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/agent/inference/{job_id}"))
            .send()
            .await
            .map_err(net_err)?;
        parse_json(response).await
    }

    /// Fetch the result of a finished job. A 400 means the job has not
    /// completed yet.
    pub async fn job_result(&self, job_id: &JobId) -> Result<JobResult, ClientError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/agent/inference/{job_id}/result"),
            )
            .send()
            .await
            .map_err(net_err)?;
        if response.status().as_u16() == 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::JobNotReady(extract_message(&body)));
        }
        parse_json(response).await
    }

    /// Ask the backend to cancel a job. Returns true only when the backend
    /// confirms the canceled state.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool, ClientError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/agent/inference/{job_id}"),
            )
            .send()
            .await
            .map_err(net_err)?;
        let status: JobStatus = parse_json(response).await?;
        Ok(status.status == JobState::Canceled)
    }

    /// Poll a job until it reaches a terminal state, invoking `on_update`
    /// with each status record.
    pub async fn poll_job(
        &self,
        job_id: &JobId,
        mut on_update: impl FnMut(&JobStatus),
    ) -> Result<JobResult, ClientError> {
        for _ in 0..MAX_POLL_ATTEMPTS {
            let status = self.job_status(job_id).await?;
            on_update(&status);
            match status.status {
                JobState::Completed => return self.job_result(job_id).await,
                JobState::Failed => {
                    return Err(ClientError::JobFailed(
                        status.error.unwrap_or_else(|| "job failed".into()),
                    ))
                }
                JobState::Canceled => return Err(ClientError::JobCanceled),
                JobState::Pending | JobState::Running => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
        warn!(%job_id, "gave up polling job");
        Err(ClientError::Timeout(POLL_INTERVAL * MAX_POLL_ATTEMPTS))
    }

    /// Upload files and return their public URLs.
    pub async fn upload_files(&self, files: Vec<FileUpload>) -> Result<Vec<String>, ClientError> {
        let sent = files.len();
        let mut form = reqwest::multipart::Form::new();
        for file in files {
            let part = reqwest::multipart::Part::bytes(file.bytes)
                .file_name(file.name)
                .mime_str(&file.content_type)
                .map_err(|e| ClientError::InvalidRequest(format!("bad content type: {e}")))?;
            form = form.part("files", part);
        }

        let response = self
            .request(reqwest::Method::POST, "/files/upload")
            .multipart(form)
            .send()
            .await
            .map_err(net_err)?;
        let body: UploadResponse = parse_json(response).await?;

        let urls: Vec<String> = body
            .uploaded
            .into_iter()
            .filter_map(|entry| entry.public_url.or(entry.url))
            .collect();
        if urls.is_empty() && sent > 0 {
            return Err(ClientError::Protocol(
                "no file URLs returned from upload".into(),
            ));
        }
        Ok(urls)
    }

    pub async fn list_files(&self) -> Result<Vec<FileEntry>, ClientError> {
        let response = self
            .request(reqwest::Method::GET, "/files")
            .send()
            .await
            .map_err(net_err)?;
        let body: ListFilesResponse = parse_json(response).await?;
        Ok(body.files)
    }

    /// Fetch the server's feature configuration. Usually consumed through
    /// [`crate::store::ServerConfigStore`].
    pub async fn server_config(&self) -> Result<crate::store::ServerConfig, ClientError> {
        let response = self
            .request(reqwest::Method::GET, "/config")
            .send()
            .await
            .map_err(net_err)?;
        parse_json(response).await
    }
}

fn net_err(e: reqwest::Error) -> ClientError {
    ClientError::NetworkError(e.to_string())
}

/// Map a non-success status through the error taxonomy, otherwise decode
/// the body as JSON.
async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::from_status(
            status.as_u16(),
            extract_message(&body),
        ));
    }
    response.json().await.map_err(net_err)
}

/// Pull a human-readable message out of an error body, which may be a JSON
/// object or plain text.
fn extract_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.detail.or(parsed.error) {
            return message;
        }
    }
    body.to_string()
}
