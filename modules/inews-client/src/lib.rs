pub mod error;
pub mod ftp;
pub mod listing;

pub use error::{InewsError, Result};
pub use ftp::{FtpSettings, FtpStoryServer};
pub use listing::{parse_list_line, parse_listing, DirEntry};

use async_trait::async_trait;

/// Read-only access to story documents on the newsroom server.
///
/// The polling monitor and the interactive browser both consume this
/// capability; neither owns the other's session.
#[async_trait]
pub trait StoryServer: Send + Sync {
    /// List the entries of a directory, given as an absolute server path.
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>>;

    /// Read one story document from a directory.
    async fn read(&self, dir: &str, name: &str) -> Result<String>;
}

/// Split a server path into folders. Accepts `/` and `\` separators; empty
/// segments are dropped.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}
