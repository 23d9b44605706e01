pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, EngineConfig};
pub use error::ErrorClass;
