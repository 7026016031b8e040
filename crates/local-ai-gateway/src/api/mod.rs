//! HTTP handlers mounted by the server router.

pub mod admin_api;
pub mod service_api;

pub use admin_api::{health, model_states, reload_flavor, unload_model};
pub use service_api::{error_response, handle_service};
