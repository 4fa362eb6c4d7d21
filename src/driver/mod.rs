//! Page-level capabilities the item pipeline is built from.
//!
//! Every operation runs on the worker thread that owns the driver; the
//! underlying browser session is not safe for concurrent use.

pub mod live;
pub mod scripted;

use crate::models::{ContextId, ItemId};
use crate::session::StoredCookie;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub use live::LiveDriver;
pub use scripted::{AttemptScript, CallLog, DriverCall, ScriptedDriver};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Ordinary failure of one step; the attempt can be retried.
    #[error("{0}")]
    Step(String),
    /// The automation session itself is gone.
    #[error("session lost: {0}")]
    SessionLost(String),
}

impl DriverError {
    pub fn step(message: impl Into<String>) -> Self {
        Self::Step(message.into())
    }
}

/// The fixed per-item step sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Navigate,
    WaitForPreviews,
    OpenGallery,
    ExtractLatestSource,
    Download,
    SubmitReplacement,
    ConfirmAndSave,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::Navigate,
        Step::WaitForPreviews,
        Step::OpenGallery,
        Step::ExtractLatestSource,
        Step::Download,
        Step::SubmitReplacement,
        Step::ConfirmAndSave,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Navigate => "navigate",
            Step::WaitForPreviews => "wait_for_previews",
            Step::OpenGallery => "open_gallery",
            Step::ExtractLatestSource => "extract_latest_source",
            Step::Download => "download",
            Step::SubmitReplacement => "submit_replacement",
            Step::ConfirmAndSave => "confirm_and_save",
        }
    }

    /// Steps after which a challenge page may appear.
    pub fn is_risky(self) -> bool {
        matches!(
            self,
            Step::Navigate | Step::OpenGallery | Step::SubmitReplacement | Step::ConfirmAndSave
        )
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub trait CapabilityDriver: Send {
    /// True when the current page shows a human-verification challenge.
    fn detect_interrupt(&mut self) -> Result<bool, DriverError>;

    fn navigate_to_item(&mut self, context: &ContextId, item: &ItemId) -> Result<(), DriverError>;

    fn wait_for_preview_images(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    fn open_image_gallery(&mut self) -> Result<bool, DriverError>;

    /// Source of the last gallery image in display order, once at least one
    /// large image has finished loading.
    fn latest_image_source(&mut self) -> Result<Option<String>, DriverError>;

    /// Fetches `url` with the session's credentials and returns the local copy.
    fn download_image(&mut self, url: &str) -> Result<PathBuf, DriverError>;

    /// Injects `path` into the second file input on the page.
    fn submit_replacement_file(&mut self, path: &Path) -> Result<bool, DriverError>;

    /// Closes the gallery and activates the save control.
    fn confirm_and_save(&mut self) -> Result<bool, DriverError>;

    fn open_home(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Current session cookies, when the driver has any to persist.
    fn export_credentials(&mut self) -> Result<Option<Vec<StoredCookie>>, DriverError> {
        Ok(None)
    }
}

/// Builds a driver on the worker thread.
pub type DriverFactory =
    Box<dyn Fn() -> Result<Box<dyn CapabilityDriver>, DriverError> + Send + 'static>;
