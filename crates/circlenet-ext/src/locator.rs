//! Where the detection script leaves its result

use crate::error::DetectionError;
use crate::Result;
use std::path::{Path, PathBuf};

/// Whole-slide image extensions the script can process
pub const WSI_EXTENSIONS: &[&str] = &["svs", "scn"];

pub const RESULT_EXTENSION: &str = "geojson";

/// Sibling of `target_dir` named `<basename>_geojson`
pub fn result_directory(target_dir: &Path) -> PathBuf {
    let base = target_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target_dir.with_file_name(format!("{}_{}", base, RESULT_EXTENSION))
}

/// `slide1.svs` → `slide1.geojson`; anything but a known WSI extension is rejected
pub fn result_file_name(image_path: &Path) -> Result<String> {
    let unsupported = || DetectionError::UnsupportedImageFormat {
        path: image_path.display().to_string(),
    };

    let extension = image_path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(unsupported)?;
    if !WSI_EXTENSIONS.contains(&extension) {
        return Err(unsupported());
    }

    let stem = image_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(unsupported)?;
    Ok(format!("{}.{}", stem, RESULT_EXTENSION))
}
