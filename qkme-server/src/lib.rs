//! qkme server: ETSI GS QKD 014 REST API over mutual TLS

pub mod config;
pub mod handlers;
pub mod server;
pub mod tls;

pub use config::KmeConfig;
pub use handlers::{handle_request, AppState};
pub use server::{build_state, KmeServer};
