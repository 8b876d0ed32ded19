pub mod atomic;
pub mod cleanup;
pub mod download;
pub mod error;
pub mod labels;
pub mod manifest;
pub mod pipeline;
pub mod rate_limit;
pub mod resolver;
pub mod retry;
pub mod snapshot;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use error::{
    CleanupError, CycleError, DownloadError, ParseError, PersistenceError, ResolutionError,
};
pub use pipeline::{CycleStats, Monitor, MonitorSettings};
