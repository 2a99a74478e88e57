pub mod admin_endpoint;
pub mod endpoint;
pub mod errors;
pub mod types;
