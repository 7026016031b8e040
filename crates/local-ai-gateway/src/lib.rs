// local-ai-gateway/crates/local-ai-gateway/src/lib.rs

pub mod api;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod flavor;
pub mod manager;
pub mod metrics;
pub mod schedule;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod types;

// Public API exports
pub use config::Config;
pub use error::{GatewayError, GatewayResult, HttpErrorResponse, LifecycleError};
pub use flavor::{DefinitionSource, Flavor, FlavorRegistry, CANONICAL_FLAVOR};
pub use manager::{ManagerConfig, ModelLease, ModelManager};
pub use schedule::{Dispatcher, EngineConfig, InboundRequest, TaskEngine};
pub use server::{build_router, run_server, AppState};
pub use store::{MemoryStore, ServiceStore};
pub use types::{
    HttpContent, ResultKind, ServiceProvider, ServiceRequest, ServiceResult, ServiceTarget,
};
