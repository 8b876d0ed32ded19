//! Manifest for the graphics system, rebuilt from the state store.
//!
//! Two files, both regenerated whole and atomically replaced:
//! - `manifest.json`: one entry per DOWNLOADED post, sorted by id. It has no
//!   generation timestamp, so identical state gives identical bytes.
//! - `index.csv`: the semicolon-separated `URL;RUTA LOCAL` table the
//!   graphics templates already read. `RUTA LOCAL` is the absolute path of
//!   the post's `tweet_api.json`; posts without one are left out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rotulos_common::{EntryStatus, LabelClass, PostId};
use serde::Serialize;
use tracing::debug;

use crate::atomic::write_atomic;
use crate::download::METADATA_FILE;
use crate::error::PersistenceError;
use crate::store::{ContentStateEntry, ContentStateStore};

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub id: PostId,
    pub source_url: String,
    pub label_class: LabelClass,
    pub directory: String,
    /// Absolute path of `tweet_api.json`, when it exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub media: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

pub fn build_manifest(entries: &BTreeMap<PostId, ContentStateEntry>, base_dir: &Path) -> Manifest {
    let entries = entries
        .iter()
        .filter(|(_, e)| e.status == EntryStatus::Downloaded)
        .map(|(id, e)| {
            let dir = base_dir.join(id.as_str());
            let metadata = dir.join(METADATA_FILE);
            ManifestEntry {
                id: id.clone(),
                source_url: e.source_url.clone(),
                label_class: e.label_class,
                directory: display_path(&dir),
                metadata: metadata.is_file().then(|| {
                    display_path(&std::path::absolute(&metadata).unwrap_or(metadata.clone()))
                }),
                media: e.media.iter().map(|p| display_path(p)).collect(),
                first_seen: e.first_seen,
                last_seen: e.last_seen,
                downloaded_at: e.downloaded_at,
            }
        })
        .collect();

    Manifest {
        version: MANIFEST_VERSION,
        entries,
    }
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn render_json(manifest: &Manifest) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(manifest)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// `URL;RUTA LOCAL` rows for posts whose metadata file exists.
pub fn render_index_csv(manifest: &Manifest) -> String {
    let mut out = String::from("URL;RUTA LOCAL\n");
    for entry in &manifest.entries {
        let Some(metadata) = &entry.metadata else { continue };
        out.push_str(&entry.source_url);
        out.push(';');
        out.push_str(metadata);
        out.push('\n');
    }
    out
}

pub struct ManifestWriter {
    manifest_path: PathBuf,
    index_path: PathBuf,
    base_dir: PathBuf,
}

impl ManifestWriter {
    pub fn new(manifest_path: PathBuf, index_path: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            manifest_path,
            index_path,
            base_dir,
        }
    }

    /// Regenerate both files from the store. Returns the entry count.
    pub async fn write(&self, store: &ContentStateStore) -> Result<usize, PersistenceError> {
        let manifest = build_manifest(&store.entries().await, &self.base_dir);

        write_atomic(&self.manifest_path, &render_json(&manifest)?).map_err(|source| {
            PersistenceError::Write {
                path: self.manifest_path.clone(),
                source,
            }
        })?;
        write_atomic(&self.index_path, render_index_csv(&manifest).as_bytes()).map_err(
            |source| PersistenceError::Write {
                path: self.index_path.clone(),
                source,
            },
        )?;

        debug!(
            manifest = %self.manifest_path.display(),
            entries = manifest.entries.len(),
            "Manifest written"
        );
        Ok(manifest.entries.len())
    }
}
