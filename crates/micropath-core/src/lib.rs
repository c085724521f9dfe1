//! Shared types for the DeepMicroPath client: identifiers, wire events,
//! the error taxonomy, and endpoint resolution.

pub mod config;
pub mod errors;
pub mod events;
pub mod ids;

pub use config::Endpoint;
pub use errors::ClientError;
pub use events::{AnalysisMode, AnalysisRequest, AnalysisResult, ClientEvent, ServerEvent};
pub use ids::{ConnectionId, JobId};
