//! Detector configuration
//!
//! Everything that used to be a literal path or URL in the extension lives
//! here, with defaults matching the published CircleNet assets.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const ASSET_BASE_URL: &str =
    "https://raw.githubusercontent.com/JLY0814/qupath_wcf_extension/refs/heads/main/WCF";

/// Script location inside the extracted archive.
pub const DEFAULT_SCRIPT_PATH: &str = "CircleNet_Zip/src/run_detection_for_scn.py";

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Provisioning root; the user's desktop when unset
    pub root: Option<PathBuf>,
    /// Explicit interpreter path; discovered on the search path when unset
    pub interpreter: Option<PathBuf>,
    /// Interpreter name used for discovery
    pub interpreter_name: String,
    /// Value for PYTHONPATH; asked from the interpreter when unset
    pub library_path: Option<PathBuf>,
    /// Detection script, relative to the extracted scripts directory
    pub script_path: PathBuf,
    /// Network architecture passed as `--arch`
    pub arch: String,
    /// Individually downloaded model weights
    pub model_urls: Vec<String>,
    /// Zip archive holding the detection scripts
    pub archive_url: String,
    /// Retries for transient download failures
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries
    pub backoff_base_ms: u64,
    /// Time limit for the detection script (0 = none)
    pub timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            root: None,
            interpreter: None,
            interpreter_name: "python3".to_string(),
            library_path: None,
            script_path: PathBuf::from(DEFAULT_SCRIPT_PATH),
            arch: "dla_34".to_string(),
            model_urls: (1..=5)
                .map(|i| format!("{}/model/model{}_best.pth", ASSET_BASE_URL, i))
                .collect(),
            archive_url: format!("{}/CircleNet_Zip.zip", ASSET_BASE_URL),
            max_retries: 2,
            backoff_base_ms: 500,
            timeout_secs: 0,
        }
    }
}

impl DetectorConfig {
    /// Defaults overlaid with `CIRCLENET_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(root) = env_path("CIRCLENET_ROOT") {
            config.root = Some(root);
        }
        if let Some(python) = env_path("CIRCLENET_PYTHON") {
            config.interpreter = Some(python);
        }
        if let Ok(name) = std::env::var("CIRCLENET_PYTHON_NAME") {
            config.interpreter_name = name;
        }
        if let Some(lib) = env_path("CIRCLENET_PYTHONPATH") {
            config.library_path = Some(lib);
        }
        if let Ok(arch) = std::env::var("CIRCLENET_ARCH") {
            config.arch = arch;
        }
        if let Some(secs) = env_parse("CIRCLENET_TIMEOUT_SECS") {
            config.timeout_secs = secs;
        }
        if let Some(retries) = env_parse("CIRCLENET_MAX_RETRIES") {
            config.max_retries = retries;
        }

        config
    }

    /// Use a fixed provisioning root
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Use a fixed interpreter instead of discovery
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    /// Use a fixed PYTHONPATH instead of asking the interpreter
    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    /// Replace the asset sources
    pub fn with_assets(mut self, model_urls: Vec<String>, archive_url: impl Into<String>) -> Self {
        self.model_urls = model_urls;
        self.archive_url = archive_url.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
