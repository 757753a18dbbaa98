pub mod breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod retry;
pub mod sanitize;
pub mod sse;
pub mod tokens;
