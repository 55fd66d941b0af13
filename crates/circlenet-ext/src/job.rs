//! Per-invocation job specification

use crate::layout::WorkspaceLayout;
use crate::locator::{result_directory, result_file_name};
use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static SERIES_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[--series, \d+\]$").expect("valid series regex"));

/// Resolved paths and parameters for one detection run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Image path on local storage
    pub image_path: PathBuf,
    /// Image base name without extension
    pub output_name: String,
    /// File the script is expected to write inside `result_dir`
    pub result_file_name: String,
    pub model_dir: PathBuf,
    pub demo_dir: PathBuf,
    pub target_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl JobSpec {
    /// Build the spec from the host's image server path.
    ///
    /// Fails with `UnsupportedImageFormat` before anything is provisioned or
    /// launched if the image is not a recognized whole-slide format.
    pub fn resolve(server_path: &str, layout: &WorkspaceLayout) -> Result<Self> {
        let image_path = PathBuf::from(normalize_image_path(server_path));
        let result_file_name = result_file_name(&image_path)?;
        let output_name = image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target_dir = layout.target_dir();

        Ok(JobSpec {
            output_name,
            result_file_name,
            model_dir: layout.model_dir(),
            demo_dir: layout.demo_dir(),
            result_dir: result_directory(&target_dir),
            target_dir,
            image_path,
        })
    }

    pub fn result_path(&self) -> PathBuf {
        self.result_dir.join(&self.result_file_name)
    }

    /// Script arguments in the order the detector expects
    pub fn script_args(&self, arch: &str) -> Vec<String> {
        vec![
            "circledet".to_string(),
            "--circle_fusion".to_string(),
            "--generate_geojson".to_string(),
            "--arch".to_string(),
            arch.to_string(),
            "--demo".to_string(),
            path_arg(&self.image_path),
            "--load_model_dir".to_string(),
            path_arg(&self.model_dir),
            "--filter_boarder".to_string(),
            "--demo_dir".to_string(),
            path_arg(&self.demo_dir),
            "--target_dir".to_string(),
            path_arg(&self.target_dir),
        ]
    }
}

/// Strip a `file:` scheme prefix and a trailing viewer series qualifier.
///
/// `BioFormatsImageServer: file:/data/s.svs[--series, 0]` → `/data/s.svs`
pub fn normalize_image_path(raw: &str) -> String {
    let path = match raw.split_once("file:") {
        Some((_, rest)) => rest.trim(),
        None => raw.trim(),
    };
    // file:///data/x and file:/data/x name the same path
    let path = match path.strip_prefix("//") {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    };
    SERIES_SUFFIX.replace(path, "").trim_end().to_string()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
