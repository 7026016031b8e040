//! Request scheduling and execution: the dispatcher resolves where a request
//! goes, the task engine carries it there and streams the answer back.

pub mod auth;
pub mod dispatcher;
pub mod stream;
pub mod task;

pub use auth::{Authenticator, CredentialEndpoint, CredentialEndpoints, OutboundRequest};
pub use dispatcher::{
    resolve_model, Candidates, Dispatcher, InboundRequest, PolicySelector, TargetSelector,
};
pub use stream::{ChunkDecoder, Framing, StreamMode};
pub use task::{EngineConfig, ResultSink, ServiceTask, TaskEngine};
