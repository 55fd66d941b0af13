//! Asset manifest: what to download and where it lands
//!
//! All destinations are relative to the provisioning root and are checked
//! against it when resolved (see [`WorkspaceLayout::resolve`]).

use crate::config::DetectorConfig;
use crate::layout::{ARCHIVE_STAGING, MODEL_DIR, SCRIPTS_DIR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single downloadable file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub url: String,
    /// Destination relative to the provisioning root
    pub destination: PathBuf,
}

/// The script archive: downloaded to a staging path, then extracted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub url: String,
    /// Where the archive itself is stored, relative to the root
    pub staging: PathBuf,
    /// Extraction root, relative to the provisioning root
    pub extract_to: PathBuf,
}

/// Ordered list of assets a detection job depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub files: Vec<AssetEntry>,
    pub archive: ArchiveEntry,
}

impl AssetManifest {
    /// Manifest for the configured model weights and script archive.
    ///
    /// Each weight file keeps the last path segment of its URL as its name.
    pub fn from_config(config: &DetectorConfig) -> Self {
        let model_dir = Path::new(MODEL_DIR);
        let files = config
            .model_urls
            .iter()
            .map(|url| AssetEntry {
                url: url.clone(),
                destination: model_dir.join(file_name_from_url(url)),
            })
            .collect();

        AssetManifest {
            files,
            archive: ArchiveEntry {
                url: config.archive_url.clone(),
                staging: model_dir.join(ARCHIVE_STAGING),
                extract_to: model_dir.join(SCRIPTS_DIR),
            },
        }
    }
}

/// Last non-empty path segment of a URL, ignoring query and fragment
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("download")
        .to_string()
}
