//! Provisioning root and the fixed directory layout beneath it
//!
//! ```text
//! <root>/models_and_pythonfiles/
//!     model*_best.pth
//!     zip/python_scripts.zip
//!     python_scripts/                (archive extraction target)
//!     test_result/                   (--demo_dir)
//!     test_only_result/              (--target_dir)
//!     test_only_result_geojson/      (results)
//! ```

use crate::config::DetectorConfig;
use crate::error::DetectionError;
use crate::Result;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const MODEL_DIR: &str = "models_and_pythonfiles";
pub const ARCHIVE_STAGING: &str = "zip/python_scripts.zip";
pub const SCRIPTS_DIR: &str = "python_scripts";
pub const DEMO_DIR: &str = "test_result";
pub const TARGET_DIR: &str = "test_only_result";

/// Directory layout rooted at the provisioning root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkspaceLayout { root: root.into() }
    }

    /// Configured root, or the user's desktop directory
    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        match &config.root {
            Some(root) => Ok(Self::new(root)),
            None => desktop_dir().map(Self::new),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join(MODEL_DIR)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.model_dir().join(ARCHIVE_STAGING)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.model_dir().join(SCRIPTS_DIR)
    }

    pub fn demo_dir(&self) -> PathBuf {
        self.model_dir().join(DEMO_DIR)
    }

    pub fn target_dir(&self) -> PathBuf {
        self.model_dir().join(TARGET_DIR)
    }

    /// Create the root and model directory, opening up their permissions
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.root.clone(), self.model_dir()] {
            std::fs::create_dir_all(&dir).map_err(|source| DetectionError::PermissionFailure {
                path: dir.clone(),
                source,
            })?;
        }
        set_open_permissions(&self.model_dir())?;
        debug!(root = %self.root.display(), "Workspace layout ready");
        Ok(())
    }

    /// Resolve a manifest-relative path, refusing anything that leaves the root
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        resolve_within(&self.root, &relative.to_string_lossy()).ok_or_else(|| {
            DetectionError::InvalidManifest(relative.to_string_lossy().into_owned())
        })
    }
}

/// Join `name` onto `root` lexically, returning `None` if the result would
/// not stay strictly inside `root`.
///
/// Backslashes count as separators so archives built on Windows are judged
/// the same way as everywhere else.
pub fn resolve_within(root: &Path, name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    // Windows drive letters are not a Prefix component on Unix hosts
    if parts.first().is_some_and(|p| p.len() == 2 && p.ends_with(':')) {
        return None;
    }
    if parts.is_empty() {
        return None;
    }

    let mut path = root.to_path_buf();
    path.extend(parts);
    Some(path)
}

/// Give owner, group and others full access, as the extension always has
#[cfg(unix)]
pub fn set_open_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)).map_err(|source| {
        DetectionError::PermissionFailure {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
pub fn set_open_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn desktop_dir() -> Result<PathBuf> {
    dirs::desktop_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Desktop")))
        .ok_or_else(|| {
            DetectionError::RootUnavailable("cannot determine the user's desktop".to_string())
        })
}
