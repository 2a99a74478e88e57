pub mod analytics;
pub mod api;
pub mod config;
pub mod flags;
pub mod health;
pub mod metrics_consts;
pub mod metrics_utils;
pub mod recorder;
pub mod router;
pub mod server;
pub mod store;

// Integration tests link against the library, so the in-memory store has to be
// compiled in rather than gated on cfg(test).
pub mod test_utils;
