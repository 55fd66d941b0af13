//! Detection job orchestration
//!
//! provision → resolve job → run script → locate result → import.
//! One job at a time per orchestrator; a second request while one is in flight
//! gets `DetectionError::Busy`.

use crate::config::DetectorConfig;
use crate::error::DetectionError;
use crate::extension::ActiveImage;
use crate::fetch::{AssetFetcher, HttpFetcher};
use crate::import;
use crate::job::JobSpec;
use crate::layout::WorkspaceLayout;
use crate::manifest::AssetManifest;
use crate::provision::{AssetProvisioner, ProvisionSummary, RetryPolicy};
use crate::runner::{
    discover_interpreter, discover_library_path, Invocation, JobOutcome, ProcessEnv,
    ProcessRunner,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Where the current (or last) job is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Provisioning,
    Running,
    Importing,
    Done,
    Failed,
}

/// Summary of a finished detection job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub job_id: Uuid,
    pub image_path: PathBuf,
    pub result_path: PathBuf,
    /// Objects added to the hierarchy
    pub imported: usize,
    /// Script succeeded but left no result file
    pub result_missing: bool,
    /// Merged stdout/stderr of the script
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Clears the busy flag when the job ends, however it ends
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DetectionError::Busy)?;
        Ok(BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Public entry point for running detection on an image
pub struct DetectionOrchestrator {
    config: DetectorConfig,
    layout: WorkspaceLayout,
    manifest: AssetManifest,
    provisioner: AssetProvisioner,
    runner: ProcessRunner,
    state: Mutex<JobState>,
    busy: AtomicBool,
}

impl DetectionOrchestrator {
    /// Orchestrator downloading over HTTP
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new()?);
        Self::with_fetcher(config, fetcher)
    }

    pub fn with_fetcher(config: DetectorConfig, fetcher: Arc<dyn AssetFetcher>) -> Result<Self> {
        let layout = WorkspaceLayout::from_config(&config)?;
        let manifest = AssetManifest::from_config(&config);
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
        };

        Ok(DetectionOrchestrator {
            layout,
            manifest,
            provisioner: AssetProvisioner::new(fetcher, retry),
            runner: ProcessRunner::new(config.timeout()),
            config,
            state: Mutex::new(JobState::Idle),
            busy: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Fetch and unpack assets without running a job
    pub async fn provision(&self, cancel: &CancellationToken) -> Result<ProvisionSummary> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        self.provisioner
            .ensure_assets(&self.manifest, &self.layout, cancel)
            .await
    }

    /// Run detection for `image` and import the result into its hierarchy
    #[instrument(skip_all, fields(image = %image.server_path))]
    pub async fn run_detection(
        &self,
        image: &ActiveImage,
        cancel: &CancellationToken,
    ) -> Result<DetectionReport> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        let job_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%job_id, "Running glomerulus detection");

        match self.execute(image, cancel, job_id, started_at).await {
            Ok(report) => {
                self.set_state(JobState::Done);
                info!(%job_id, imported = report.imported, "Detection finished");
                Ok(report)
            }
            Err(e) => {
                self.set_state(JobState::Failed);
                error!(%job_id, error = %e, "Detection failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        image: &ActiveImage,
        cancel: &CancellationToken,
        job_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<DetectionReport> {
        // Format check happens here, before any traffic
        let spec = JobSpec::resolve(&image.server_path, &self.layout)?;
        info!(image = %spec.image_path.display(), output = %spec.output_name, "Resolved job");

        self.set_state(JobState::Provisioning);
        self.provisioner
            .ensure_assets(&self.manifest, &self.layout, cancel)
            .await?;

        self.set_state(JobState::Running);
        let invocation = self.invocation(&spec).await?;
        let output = match self.runner.run(&invocation, cancel).await? {
            JobOutcome::Success { output } => output,
            JobOutcome::Failure { exit_code, output } => {
                return Err(DetectionError::ProcessNonZeroExit { exit_code, output });
            }
        };

        if cancel.is_cancelled() {
            return Err(DetectionError::Cancelled);
        }

        self.set_state(JobState::Importing);
        let result_dir = spec.result_dir.clone();
        let file_name = spec.result_file_name.clone();
        let hierarchy = image.hierarchy.clone();
        let imported = tokio::task::spawn_blocking(move || {
            import::import(&result_dir, &file_name, hierarchy.as_ref())
        })
        .await
        .map_err(|e| DetectionError::Io(std::io::Error::other(e)))?;

        let (imported, result_missing) = match imported {
            Ok(count) => (count, false),
            Err(e) if !e.is_fatal() => {
                warn!(%job_id, error = %e, "Detection produced no result file");
                (0, true)
            }
            Err(e) => return Err(e),
        };

        Ok(DetectionReport {
            job_id,
            result_path: spec.result_path(),
            image_path: spec.image_path,
            imported,
            result_missing,
            output,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn invocation(&self, spec: &JobSpec) -> Result<Invocation> {
        let interpreter = match &self.config.interpreter {
            Some(path) => path.clone(),
            None => discover_interpreter(&self.config.interpreter_name).await?,
        };
        let library_path = match &self.config.library_path {
            Some(path) => Some(path.clone()),
            None => discover_library_path(&interpreter).await,
        };

        Ok(Invocation {
            script: self.layout.scripts_dir().join(&self.config.script_path),
            args: spec.script_args(&self.config.arch),
            env: ProcessEnv::for_interpreter(&interpreter, library_path),
            interpreter,
        })
    }
}
