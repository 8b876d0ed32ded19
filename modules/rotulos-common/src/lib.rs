pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, MonitorConfig};
pub use error::ConfigError;
pub use types::*;
