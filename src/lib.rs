pub mod config;
pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod openapi;
pub mod rate_limit; // in-memory rate limiting
pub mod repo;
pub mod routes;
pub mod storage;

// Re-export commonly used items for tests / external users
pub use lifecycle::{LifecycleError, PostService};
pub use routes::{config, AppState};
