//! CircleNet glomerulus detection for whole-slide images
//!
//! Runs the CircleNet detector as an external interpreter process and brings
//! its GeoJSON output back into the host's annotation hierarchy.
//!
//! ## Pipeline
//!
//! 1. `AssetProvisioner` downloads model weights and the script archive on first use
//! 2. `JobSpec` resolves paths for the open image (unsupported formats stop here)
//! 3. `ProcessRunner` launches the script and captures its merged output
//! 4. `locator` derives where the result lands
//! 5. `import` parses the result and adds it to the hierarchy
//!
//! `DetectionOrchestrator` drives the steps; `CircleNetExtension` plugs it into
//! a host through `HostHandle`.

pub mod config;
mod error;
pub mod extension;
pub mod fakes;
pub mod fetch;
pub mod hierarchy;
pub mod import;
pub mod job;
pub mod layout;
pub mod locator;
pub mod manifest;
pub mod orchestrator;
pub mod provision;
pub mod runner;
pub mod telemetry;

pub use config::DetectorConfig;
pub use error::DetectionError;
pub use extension::{
    ActionHandler, ActiveImage, CircleNetExtension, HostExtension, HostHandle, MENU_PATH,
    RUN_ACTION_LABEL,
};
pub use fetch::{AssetFetcher, FetchOutcome, HttpFetcher};
pub use hierarchy::{AnnotationHierarchy, Geometry, ObjectKind, PathClass, PathObject, SharedHierarchy};
pub use job::JobSpec;
pub use layout::WorkspaceLayout;
pub use manifest::{ArchiveEntry, AssetEntry, AssetManifest};
pub use orchestrator::{DetectionOrchestrator, DetectionReport, JobState};
pub use provision::{AssetProvisioner, ProvisionSummary, RetryPolicy};
pub use runner::{Invocation, JobOutcome, ProcessEnv, ProcessRunner};

/// Result type for detection operations
pub type Result<T> = std::result::Result<T, DetectionError>;
