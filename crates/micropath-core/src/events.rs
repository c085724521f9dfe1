use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::ClientError;
use crate::ids::{ConnectionId, JobId};

/// Inference mode understood by the analysis backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Auto,
    Chat,
    Microbiology,
    Deepresearch,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Chat => "chat",
            Self::Microbiology => "microbiology",
            Self::Deepresearch => "deepresearch",
        }
    }
}

impl FromStr for AnalysisMode {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "chat" => Ok(Self::Chat),
            "microbiology" => Ok(Self::Microbiology),
            "deepresearch" => Ok(Self::Deepresearch),
            other => Err(ClientError::InvalidRequest(format!(
                "unknown analysis mode: {other}"
            ))),
        }
    }
}

/// Sampling parameters forwarded to the backend. All optional; the backend
/// (or the HTTP client) fills in defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

/// One analysis request, as sent on the realtime connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub question: String,
    pub mode: AnalysisMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<GenerationConfig>,
}

impl AnalysisRequest {
    pub fn new(question: impl Into<String>, mode: AnalysisMode) -> Self {
        Self {
            question: question.into(),
            mode,
            files: None,
            config: None,
        }
    }
}

/// Terminal payload of a completed analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub prediction: String,
    pub execution_time: f64,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub rounds: u32,
    #[serde(default)]
    pub termination: String,
}

/// Events sent from client to server on the realtime connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Ping,
    Analyze {
        question: String,
        mode: AnalysisMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        files: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        config: Option<GenerationConfig>,
    },
    Cancel {
        job_id: JobId,
    },
}

impl ClientEvent {
    pub fn analyze(request: AnalysisRequest) -> Self {
        Self::Analyze {
            question: request.question,
            mode: request.mode,
            files: request.files,
            config: request.config,
        }
    }
}

/// Events received from the server, discriminated by a `type` field.
/// Kinds the client does not recognize deserialize as `Unknown` and are
/// dropped after logging.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
    },
    Progress {
        #[serde(default)]
        job_id: Option<JobId>,
        progress: f32,
        #[serde(default)]
        step: String,
        #[serde(default)]
        message: String,
    },
    Thinking {
        #[serde(default)]
        job_id: Option<JobId>,
        message: String,
    },
    Chunk {
        #[serde(default)]
        job_id: Option<JobId>,
        content: String,
        #[serde(default)]
        is_final: bool,
    },
    Complete {
        #[serde(default)]
        job_id: Option<JobId>,
        result: AnalysisResult,
    },
    Error {
        #[serde(default)]
        job_id: Option<JobId>,
        error: String,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Progress { .. } => "progress",
            Self::Thinking { .. } => "thinking",
            Self::Chunk { .. } => "chunk",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }
}
