//! Asset provisioning: download on first use, extract the script archive
//!
//! Existence of a destination file is the only completion signal, so bodies
//! are written to a `.part` sibling and renamed into place once complete.

use crate::error::DetectionError;
use crate::fetch::{AssetFetcher, FetchOutcome};
use crate::layout::{resolve_within, set_open_permissions, WorkspaceLayout};
use crate::manifest::AssetManifest;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded retry with exponential backoff for transient download failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = try once)
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further one
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// What a provisioning pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionSummary {
    /// Files fetched over the network (archive included)
    pub downloaded: usize,
    /// Files already present
    pub skipped: usize,
    /// Files written by archive extraction
    pub extracted: usize,
}

/// Ensures every manifest entry exists under the provisioning root
pub struct AssetProvisioner {
    fetcher: Arc<dyn AssetFetcher>,
    retry: RetryPolicy,
}

impl AssetProvisioner {
    pub fn new(fetcher: Arc<dyn AssetFetcher>, retry: RetryPolicy) -> Self {
        AssetProvisioner { fetcher, retry }
    }

    /// Download missing files and unpack the script archive.
    ///
    /// Any failure aborts the whole pass; files completed before it stay in
    /// place and are skipped next time.
    pub async fn ensure_assets(
        &self,
        manifest: &AssetManifest,
        layout: &WorkspaceLayout,
        cancel: &CancellationToken,
    ) -> Result<ProvisionSummary> {
        layout.ensure()?;

        // Resolve everything up front so a bad entry fails before any traffic
        let files = manifest
            .files
            .iter()
            .map(|entry| Ok((entry.url.as_str(), layout.resolve(&entry.destination)?)))
            .collect::<Result<Vec<_>>>()?;
        let staging = layout.resolve(&manifest.archive.staging)?;
        let extract_root = layout.resolve(&manifest.archive.extract_to)?;

        let mut summary = ProvisionSummary::default();

        for (url, dest) in files {
            check_cancelled(cancel)?;
            if self.ensure_file(url, &dest).await? {
                summary.downloaded += 1;
            } else {
                summary.skipped += 1;
            }
        }

        check_cancelled(cancel)?;
        let fresh_archive = self.ensure_file(&manifest.archive.url, &staging).await?;
        if fresh_archive {
            summary.downloaded += 1;
        } else {
            summary.skipped += 1;
        }

        if fresh_archive || !extract_root.exists() {
            check_cancelled(cancel)?;
            let (archive, root) = (staging.clone(), extract_root.clone());
            summary.extracted = tokio::task::spawn_blocking(move || extract_archive(&archive, &root))
                .await
                .map_err(|e| DetectionError::Archive(e.to_string()))??;
            set_open_permissions(&extract_root)?;
            info!(
                archive = %staging.display(),
                files = summary.extracted,
                "Extracted script archive"
            );
        }

        info!(
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            "Assets provisioned"
        );
        Ok(summary)
    }

    /// Returns `true` if the file had to be downloaded
    async fn ensure_file(&self, url: &str, dest: &Path) -> Result<bool> {
        if dest.exists() {
            debug!(path = %dest.display(), "File already exists");
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.download_with_retry(url, dest).await?;
        set_open_permissions(dest)?;
        info!(url, path = %dest.display(), "Downloaded");
        Ok(true)
    }

    async fn download_with_retry(&self, url: &str, dest: &Path) -> Result<()> {
        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 1;

        loop {
            match self.download(url, dest).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(url, attempt, ?delay, error = %e, "Download failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch `url` into `dest`, following at most one redirect
    pub async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let part = part_path(dest);

        match self.fetch_following_one_redirect(url, &part).await {
            Ok(()) => {
                tokio::fs::rename(&part, dest).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn fetch_following_one_redirect(&self, url: &str, part: &Path) -> Result<()> {
        let location = match self.fetcher.fetch_to(url, part).await? {
            FetchOutcome::Written { .. } => return Ok(()),
            FetchOutcome::Rejected { status } => return Err(bad_status(url, status)),
            FetchOutcome::Redirect { status, location } => {
                resolve_location(url, &location, status)?
            }
        };

        debug!(from = url, to = %location, "Following redirect");
        match self.fetcher.fetch_to(&location, part).await? {
            FetchOutcome::Written { .. } => Ok(()),
            FetchOutcome::Redirect { status, .. } | FetchOutcome::Rejected { status } => {
                Err(bad_status(&location, status))
            }
        }
    }
}

/// Extract `archive` under `root`, returning the number of files written.
///
/// Every entry name is checked before anything touches the disk, so a single
/// escaping entry leaves the extraction root untouched. Files are written to a
/// `<root>.part` sibling that replaces `root` only once every entry is out; a
/// failure part way through removes the staging tree and leaves `root` as it was.
pub fn extract_archive(archive: &Path, root: &Path) -> Result<usize> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))?;
    let staging = part_path(root);

    let mut targets: Vec<(PathBuf, bool)> = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        let target = resolve_within(&staging, entry.name()).ok_or_else(|| {
            DetectionError::UnsafeArchiveEntry {
                entry: entry.name().to_string(),
            }
        })?;
        targets.push((target, entry.is_dir()));
    }

    // Leftover from an interrupted run
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let written = match write_entries(&mut zip, targets) {
        Ok(written) => written,
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove partial extraction");
            }
            return Err(e);
        }
    };

    if root.exists() {
        std::fs::remove_dir_all(root)?;
    }
    std::fs::rename(&staging, root)?;
    Ok(written)
}

fn write_entries<R>(zip: &mut zip::ZipArchive<R>, targets: Vec<(PathBuf, bool)>) -> Result<usize>
where
    R: std::io::Read + std::io::Seek,
{
    let mut written = 0;
    for (index, (target, is_dir)) in targets.into_iter().enumerate() {
        if is_dir {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        // Windows-built archives may omit directory entries
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entry = zip.by_index(index)?;
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o777))?;
        }

        written += 1;
    }
    Ok(written)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn resolve_location(base: &str, location: &str, status: u16) -> Result<String> {
    reqwest::Url::parse(base)
        .and_then(|base| base.join(location))
        .map(|url| url.to_string())
        .map_err(|e| DetectionError::NetworkFailure {
            url: base.to_string(),
            status: Some(status),
            reason: format!("invalid redirect location {:?}: {}", location, e),
        })
}

fn bad_status(url: &str, status: u16) -> DetectionError {
    DetectionError::NetworkFailure {
        url: url.to_string(),
        status: Some(status),
        reason: format!("Failed to download file: {}", status),
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(DetectionError::Cancelled)
    } else {
        Ok(())
    }
}
