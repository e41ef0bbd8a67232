// Core modules
pub mod aggregation;
pub mod api;
pub mod backtest;
pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod strategy;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use models::*;
pub use strategy::SignalSource;
