// Batchrun HTTP host
//
// Serves one background process: wake-ups from its own runs and health
// check, plus a small JSON control surface.

pub mod api;
pub mod config;
pub mod countdown;
pub mod telemetry;

pub use api::{routes, AppState};
pub use config::ServerConfig;
