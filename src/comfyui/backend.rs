//! The seam between the job client and a ComfyUI server.
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::comfyui::types::{HistoryEntry, ImageRef, QueueSnapshot, SubmitResponse};

#[derive(Debug, Error)]
pub enum BackendError {
    /// The request never got an HTTP answer (refused, reset, DNS, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-2xx status.
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_transport(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            BackendError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// Everything the job client needs from an execution backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// `POST /prompt`.
    async fn submit_prompt(&self, graph: &Value, client_id: &str) -> Result<SubmitResponse, BackendError>;

    /// `POST /upload/image`; returns the name the backend stored the file under.
    async fn upload_image(&self, bytes: Vec<u8>, filename: &str) -> Result<String, BackendError>;

    /// `GET /history/{id}`; `None` until the backend has finished with the prompt.
    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, BackendError>;

    /// `GET /queue`.
    async fn queue(&self) -> Result<QueueSnapshot, BackendError>;

    /// `GET /view`.
    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, BackendError>;

    /// Remove a prompt from the pending queue.
    async fn cancel(&self, prompt_id: &str) -> Result<(), BackendError>;

    /// Stop whatever is executing right now.
    async fn interrupt(&self) -> Result<(), BackendError>;

    /// `GET /system_stats`.
    async fn system_stats(&self) -> Result<Value, BackendError>;
}
