//! On-disk removal of posts that left the rundown.
//!
//! Files may be held open by the graphics machine or scanned by antivirus
//! when we try to delete them. [`ForceRemover`] runs an ordered chain of
//! [`RemovalStrategy`]s and stops at the first one that works; platforms
//! without that locking behaviour get a shorter chain.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rotulos_common::PostId;
use tracing::{info, warn};

use crate::error::CleanupError;
use crate::store::ContentStateStore;

pub trait RemovalStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn remove(&self, path: &Path) -> io::Result<()>;
}

fn remove_any(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Plain recursive delete.
pub struct PlainRemove;

impl RemovalStrategy for PlainRemove {
    fn name(&self) -> &'static str {
        "remove"
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        remove_any(path)
    }
}

/// Clear read-only bits on the whole tree, then delete.
pub struct ClearAttributes;

impl ClearAttributes {
    fn make_writable(path: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Ok(());
        }

        let mut perms = meta.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let extra = if meta.is_dir() { 0o700 } else { 0o600 };
            perms.set_mode(perms.mode() | extra);
        }
        #[cfg(not(unix))]
        {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
        }
        fs::set_permissions(path, perms)?;

        if meta.is_dir() {
            for entry in fs::read_dir(path)? {
                Self::make_writable(&entry?.path())?;
            }
        }
        Ok(())
    }
}

impl RemovalStrategy for ClearAttributes {
    fn name(&self) -> &'static str {
        "clear-attributes"
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        Self::make_writable(path)?;
        remove_any(path)
    }
}

/// Take ownership of the tree and grant ourselves full control, then delete.
pub struct TakeOwnership;

impl RemovalStrategy for TakeOwnership {
    fn name(&self) -> &'static str {
        "take-ownership"
    }

    #[cfg(windows)]
    fn remove(&self, path: &Path) -> io::Result<()> {
        use std::process::Command;

        let target = path.as_os_str();
        let status = Command::new("takeown")
            .arg("/F")
            .arg(target)
            .args(["/R", "/D", "Y"])
            .status()?;
        if !status.success() {
            return Err(io::Error::other(format!("takeown exited with {status}")));
        }

        let user = std::env::var("USERNAME").unwrap_or_else(|_| "Administrators".into());
        let status = Command::new("icacls")
            .arg(target)
            .args(["/grant", &format!("{user}:F"), "/T", "/C", "/Q"])
            .status()?;
        if !status.success() {
            return Err(io::Error::other(format!("icacls exited with {status}")));
        }

        ClearAttributes.remove(path)
    }

    #[cfg(not(windows))]
    fn remove(&self, _path: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ownership reassignment is only implemented on Windows",
        ))
    }
}

/// Replace the directory's contents with an empty directory, then delete
/// the shell. Reaches entries a recursive delete gives up on.
pub struct MirrorEmpty;

impl RemovalStrategy for MirrorEmpty {
    fn name(&self) -> &'static str {
        "mirror-empty"
    }

    #[cfg(windows)]
    fn remove(&self, path: &Path) -> io::Result<()> {
        use std::process::Command;

        if !fs::symlink_metadata(path)?.is_dir() {
            return fs::remove_file(path);
        }
        let empty = tempfile::tempdir()?;
        let status = Command::new("robocopy")
            .arg(empty.path())
            .arg(path)
            .args(["/MIR", "/NFL", "/NDL", "/NJH", "/NJS", "/NP", "/R:1", "/W:1"])
            .status()?;
        // robocopy exit codes below 8 mean success with varying amounts of work.
        match status.code() {
            Some(code) if code < 8 => fs::remove_dir(path),
            _ => Err(io::Error::other(format!("robocopy exited with {status}"))),
        }
    }

    #[cfg(not(windows))]
    fn remove(&self, path: &Path) -> io::Result<()> {
        if !fs::symlink_metadata(path)?.is_dir() {
            return fs::remove_file(path);
        }
        let mut first_err = None;
        for entry in fs::read_dir(path)? {
            let result = entry.and_then(|e| remove_any(&e.path()));
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => fs::remove_dir(path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed { strategy: &'static str },
    AlreadyGone,
    Failed { errors: Vec<String> },
}

/// `ForceRemove(path) -> outcome` over an ordered strategy chain.
pub struct ForceRemover {
    chain: Vec<Box<dyn RemovalStrategy>>,
}

impl ForceRemover {
    pub fn new(chain: Vec<Box<dyn RemovalStrategy>>) -> Self {
        Self { chain }
    }

    /// Full chain on Windows; elsewhere ownership reassignment is skipped.
    pub fn platform_default() -> Self {
        let mut chain: Vec<Box<dyn RemovalStrategy>> =
            vec![Box::new(PlainRemove), Box::new(ClearAttributes)];
        if cfg!(windows) {
            chain.push(Box::new(TakeOwnership));
        }
        chain.push(Box::new(MirrorEmpty));
        Self::new(chain)
    }

    pub fn remove(&self, path: &Path) -> RemovalOutcome {
        if !exists(path) {
            return RemovalOutcome::AlreadyGone;
        }

        let mut errors = Vec::new();
        for strategy in &self.chain {
            match strategy.remove(path) {
                Ok(()) if !exists(path) => {
                    return RemovalOutcome::Removed {
                        strategy: strategy.name(),
                    }
                }
                Ok(()) => errors.push(format!("{}: path still present", strategy.name())),
                Err(e) if e.kind() == io::ErrorKind::NotFound && !exists(path) => {
                    return RemovalOutcome::Removed {
                        strategy: strategy.name(),
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), strategy = strategy.name(), error = %e, "Removal attempt failed");
                    errors.push(format!("{}: {e}", strategy.name()));
                }
            }
        }
        RemovalOutcome::Failed { errors }
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed: u32,
    pub already_gone: u32,
    pub failed: u32,
}

/// Deletes the directories of REMOVED posts and settles their entries.
pub struct Reconciler {
    remover: Arc<ForceRemover>,
    base_dir: PathBuf,
}

impl Reconciler {
    pub fn new(remover: ForceRemover, base_dir: PathBuf) -> Self {
        Self {
            remover: Arc::new(remover),
            base_dir,
        }
    }

    pub fn post_dir(&self, id: &PostId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    /// Remove each post's directory. Success destroys the entry; failure
    /// leaves it REMOVED with its failure counter bumped.
    pub async fn reconcile(&self, store: &ContentStateStore, ids: Vec<PostId>) -> CleanupStats {
        let mut stats = CleanupStats::default();

        for id in ids {
            let dir = self.post_dir(&id);
            let remover = self.remover.clone();
            let target = dir.clone();
            let outcome = tokio::task::spawn_blocking(move || remover.remove(&target))
                .await
                .unwrap_or_else(|e| RemovalOutcome::Failed {
                    errors: vec![format!("removal task failed: {e}")],
                });

            match outcome {
                RemovalOutcome::Removed { strategy } => {
                    info!(post_id = %id, path = %dir.display(), strategy, "Post directory removed");
                    stats.removed += 1;
                    store.finish_removal(&id).await;
                }
                RemovalOutcome::AlreadyGone => {
                    stats.already_gone += 1;
                    store.finish_removal(&id).await;
                }
                RemovalOutcome::Failed { errors } => {
                    let err = CleanupError {
                        path: dir,
                        attempts: errors,
                    };
                    warn!(post_id = %id, error = %err, "Cleanup failed, will retry on next reap");
                    stats.failed += 1;
                    store.record_cleanup_failure(&id, &err.to_string()).await;
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysLocked;

    impl RemovalStrategy for AlwaysLocked {
        fn name(&self) -> &'static str {
            "locked"
        }

        fn remove(&self, _path: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "file in use"))
        }
    }

    struct Counting(Arc<AtomicU32>);

    impl RemovalStrategy for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            remove_any(path)
        }
    }

    fn populated_dir() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let post = root.path().join("12345");
        fs::create_dir_all(post.join("nested")).unwrap();
        fs::write(post.join("FotoPost.jpg"), b"x").unwrap();
        fs::write(post.join("nested").join("a.bin"), b"y").unwrap();
        (root, post)
    }

    #[test]
    fn first_working_strategy_wins() {
        let (_root, post) = populated_dir();
        let calls = Arc::new(AtomicU32::new(0));
        let remover = ForceRemover::new(vec![
            Box::new(AlwaysLocked),
            Box::new(Counting(calls.clone())),
            Box::new(Counting(calls.clone())),
        ]);

        assert_eq!(
            remover.remove(&post),
            RemovalOutcome::Removed {
                strategy: "counting"
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!post.exists());
    }

    #[test]
    fn every_failure_is_reported() {
        let (_root, post) = populated_dir();
        let remover = ForceRemover::new(vec![Box::new(AlwaysLocked), Box::new(AlwaysLocked)]);

        match remover.remove(&post) {
            RemovalOutcome::Failed { errors } => assert_eq!(errors.len(), 2),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(post.exists());
    }

    #[test]
    fn missing_path_is_already_gone() {
        let root = tempfile::tempdir().unwrap();
        let remover = ForceRemover::platform_default();
        assert_eq!(
            remover.remove(&root.path().join("nope")),
            RemovalOutcome::AlreadyGone
        );
    }

    #[cfg(unix)]
    #[test]
    fn read_only_tree_is_cleared() {
        use std::os::unix::fs::PermissionsExt;

        let (_root, post) = populated_dir();
        fs::set_permissions(post.join("nested"), fs::Permissions::from_mode(0o500)).unwrap();

        assert_eq!(
            ForceRemover::new(vec![Box::new(ClearAttributes)]).remove(&post),
            RemovalOutcome::Removed {
                strategy: "clear-attributes"
            }
        );
    }

    #[test]
    fn mirror_empty_purges_contents() {
        let (_root, post) = populated_dir();
        MirrorEmpty.remove(&post).unwrap();
        assert!(!post.exists());
    }

    #[tokio::test]
    async fn reconcile_settles_entries() {
        use chrono::Utc;
        use rotulos_common::{EntryStatus, LabelClass};
        use std::collections::BTreeSet;
        use std::time::Duration;

        let (root, post) = populated_dir();
        let store = ContentStateStore::open(root.path().join("state.json")).unwrap();
        let ok = PostId::parse("12345").unwrap();
        let locked = PostId::parse("777").unwrap();
        fs::create_dir_all(root.path().join("777")).unwrap();
        for id in [&ok, &locked] {
            store.upsert_seen(id, LabelClass::Total, "u", Utc::now()).await;
        }
        store.sweep_stale(&BTreeSet::new(), Utc::now()).await;
        let ids = store.reap(Duration::ZERO, Utc::now()).await;

        let reconciler = Reconciler::new(
            ForceRemover::new(vec![Box::new(LockedDir("777"))]),
            root.path().to_path_buf(),
        );
        let stats = reconciler.reconcile(&store, ids).await;

        assert_eq!(stats.removed, 1);
        assert_eq!(stats.failed, 1);
        assert!(!post.exists());
        assert!(store.get(&ok).await.is_none());
        let entry = store.get(&locked).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Removed);
        assert_eq!(entry.cleanup_failures, 1);
    }

    /// Simulates a directory held open by another process.
    struct LockedDir(&'static str);

    impl RemovalStrategy for LockedDir {
        fn name(&self) -> &'static str {
            "locked-dir"
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            if path.ends_with(self.0) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file in use"));
            }
            remove_any(path)
        }
    }
}
