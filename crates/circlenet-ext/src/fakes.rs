//! In-memory fakes for host and network seams (testing only)
//!
//! Provides `MemoryFetcher`, which serves canned responses and records every
//! request, and `RecordingHost`, a `HostHandle` that keeps registered actions
//! and error dialogs in memory.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::DetectionError;
use crate::extension::{ActionHandler, ActiveImage, HostHandle};
use crate::fetch::{AssetFetcher, FetchOutcome};
use crate::hierarchy::SharedHierarchy;
use crate::Result;

// ---------------------------------------------------------------------------
// MemoryFetcher
// ---------------------------------------------------------------------------

/// Canned response for one URL
#[derive(Debug, Clone)]
pub enum FakeResponse {
    /// 200 with this body
    Body(Vec<u8>),
    /// 3xx pointing elsewhere
    Redirect { status: u16, location: String },
    /// Bare status, no body
    Status(u16),
    /// Connection-level failure
    Unreachable,
    /// Fail as unreachable this many times, then serve the body
    Flaky { failures: u32, body: Vec<u8> },
}

/// Fetcher backed by a `HashMap<url, FakeResponse>`
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    routes: Mutex<HashMap<String, FakeResponse>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, response: FakeResponse) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
        self
    }

    pub fn body(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.route(url, FakeResponse::Body(body.into()))
    }

    /// Every URL requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AssetFetcher for MemoryFetcher {
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        self.requests.lock().unwrap().push(url.to_string());

        let response = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(url) {
                Some(FakeResponse::Flaky { failures, .. }) if *failures > 0 => {
                    *failures -= 1;
                    FakeResponse::Unreachable
                }
                Some(FakeResponse::Flaky { body, .. }) => FakeResponse::Body(body.clone()),
                Some(other) => other.clone(),
                None => FakeResponse::Status(404),
            }
        };

        match response {
            FakeResponse::Body(body) => {
                tokio::fs::write(dest, &body).await?;
                Ok(FetchOutcome::Written {
                    bytes: body.len() as u64,
                })
            }
            FakeResponse::Redirect { status, location } => {
                Ok(FetchOutcome::Redirect { status, location })
            }
            FakeResponse::Status(status) => Ok(FetchOutcome::Rejected { status }),
            FakeResponse::Unreachable | FakeResponse::Flaky { .. } => {
                Err(DetectionError::NetworkFailure {
                    url: url.to_string(),
                    status: None,
                    reason: "connection refused".to_string(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingHost
// ---------------------------------------------------------------------------

/// Host stand-in with one open image and an in-memory hierarchy
#[derive(Default)]
pub struct RecordingHost {
    image: Mutex<Option<String>>,
    hierarchy: Arc<SharedHierarchy>,
    actions: Mutex<Vec<(String, String, ActionHandler)>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(server_path: &str) -> Self {
        let host = Self::default();
        *host.image.lock().unwrap() = Some(server_path.to_string());
        host
    }

    pub fn hierarchy(&self) -> Arc<SharedHierarchy> {
        self.hierarchy.clone()
    }

    /// (menu, label) of every registered action
    pub fn action_labels(&self) -> Vec<(String, String)> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .map(|(menu, label, _)| (menu.clone(), label.clone()))
            .collect()
    }

    /// Invoke the action registered under `label`; returns false if absent
    pub fn trigger(&self, label: &str) -> bool {
        let handler = self
            .actions
            .lock()
            .unwrap()
            .iter()
            .find(|(_, l, _)| l == label)
            .map(|(_, _, h)| h.clone());
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }
}

impl HostHandle for RecordingHost {
    fn active_image(&self) -> Option<ActiveImage> {
        self.image.lock().unwrap().clone().map(|server_path| ActiveImage {
            server_path,
            hierarchy: self.hierarchy.clone(),
        })
    }

    fn register_action(&self, menu_path: &str, label: &str, handler: ActionHandler) {
        self.actions
            .lock()
            .unwrap()
            .push((menu_path.to_string(), label.to_string(), handler));
    }

    fn show_error(&self, title: &str, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string()));
    }
}
