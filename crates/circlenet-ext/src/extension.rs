//! Host capability interface and the CircleNet extension

use crate::error::DetectionError;
use crate::hierarchy::AnnotationHierarchy;
use crate::orchestrator::{DetectionOrchestrator, DetectionReport};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Menu the extension's actions live under
pub const MENU_PATH: &str = "Extensions>CircleNet Extension";

pub const RUN_ACTION_LABEL: &str = "Run Glo Detection";

/// Callback bound to a menu action
pub type ActionHandler = Arc<dyn Fn() + Send + Sync>;

/// The image currently open in the host viewer
#[derive(Clone)]
pub struct ActiveImage {
    /// Server path as reported by the host, e.g. `file:/data/slide1.svs`
    pub server_path: String,
    pub hierarchy: Arc<dyn AnnotationHierarchy>,
}

impl std::fmt::Debug for ActiveImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveImage")
            .field("server_path", &self.server_path)
            .field("objects", &self.hierarchy.object_count())
            .finish()
    }
}

/// What the host exposes to an extension
pub trait HostHandle: Send + Sync {
    fn active_image(&self) -> Option<ActiveImage>;

    fn register_action(&self, menu_path: &str, label: &str, handler: ActionHandler);

    /// Show an error to the user
    fn show_error(&self, title: &str, message: &str);
}

/// An installable host extension
pub trait HostExtension: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Wire the extension into `host`. Installing twice is a no-op.
    fn install(&self, host: Arc<dyn HostHandle>);
}

/// Adds "Run Glo Detection" to the host and runs jobs off the UI thread
pub struct CircleNetExtension {
    orchestrator: Arc<DetectionOrchestrator>,
    runtime: Handle,
    shutdown: CancellationToken,
    installed: AtomicBool,
}

impl CircleNetExtension {
    pub const NAME: &'static str = "CircleNet Extension";
    pub const DESCRIPTION: &'static str = "QuPath extension for CircleNet";

    pub fn new(orchestrator: Arc<DetectionOrchestrator>, runtime: Handle) -> Self {
        CircleNetExtension {
            orchestrator,
            runtime,
            shutdown: CancellationToken::new(),
            installed: AtomicBool::new(false),
        }
    }

    pub fn orchestrator(&self) -> &Arc<DetectionOrchestrator> {
        &self.orchestrator
    }

    /// Cancel every running job; jobs submitted afterwards start cancelled
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run detection for the host's active image on the runtime.
    ///
    /// Errors are shown through `host` and also returned from the handle.
    pub fn submit(&self, host: Arc<dyn HostHandle>) -> JoinHandle<Result<DetectionReport>> {
        submit_job(
            &self.runtime,
            self.orchestrator.clone(),
            host,
            self.shutdown.child_token(),
        )
    }
}

fn submit_job(
    runtime: &Handle,
    orchestrator: Arc<DetectionOrchestrator>,
    host: Arc<dyn HostHandle>,
    cancel: CancellationToken,
) -> JoinHandle<Result<DetectionReport>> {
    runtime.spawn(async move {
        let result = match host.active_image() {
            Some(image) => orchestrator.run_detection(&image, &cancel).await,
            None => Err(DetectionError::NoActiveImage),
        };
        if let Err(e) = &result {
            error!(error = %e, "Failed to run Glo Command");
            host.show_error(
                CircleNetExtension::NAME,
                &format!("Failed to run Glo Command: {}", e.user_message()),
            );
        }
        result
    })
}

impl HostExtension for CircleNetExtension {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn install(&self, host: Arc<dyn HostHandle>) {
        if self.installed.swap(true, Ordering::AcqRel) {
            debug!("Extension already installed");
            return;
        }

        // The host owns the handler; a strong reference back would be a cycle
        let weak_host: Weak<dyn HostHandle> = Arc::downgrade(&host);
        let orchestrator = self.orchestrator.clone();
        let runtime = self.runtime.clone();
        let shutdown = self.shutdown.clone();

        let handler: ActionHandler = Arc::new(move || {
            if let Some(host) = weak_host.upgrade() {
                // Fire and forget; failures surface through show_error
                drop(submit_job(
                    &runtime,
                    orchestrator.clone(),
                    host,
                    shutdown.child_token(),
                ));
            }
        });
        host.register_action(MENU_PATH, RUN_ACTION_LABEL, handler);
    }
}
