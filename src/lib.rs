// Core modules
pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod feed;
pub mod models;

// Re-export commonly used types
pub use error::{ConfigError, ExchangeError, FeedError, SignalError};
pub use models::*;
