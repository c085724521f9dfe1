//! Client runtime for the DeepMicroPath analysis backend: the realtime
//! WebSocket session, the HTTP inference API, and the server-config cache.

pub mod inference;
pub mod mock;
pub mod session;
pub mod store;
pub mod transport;

pub use inference::{
    FileEntry, FileUpload, InferenceClient, InferenceOutcome, JobResult, JobState, JobStatus,
};
pub use session::{
    ConnectionState, RealtimeSession, SessionHooks, SessionOptions, SessionSnapshot,
};
pub use store::{ServerConfig, ServerConfigStore};
pub use transport::{Transport, WsTransport};
