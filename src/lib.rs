//! ComfyUI image generation core.
//!
//! Modules:
//! - `workflow`: Loading API-format workflow files and inferring node roles.
//! - `prompt`: Prompt composition and payload construction.
//! - `comfyui`: The backend seam and its HTTP client.
//! - `job`: Job submission/polling and the concurrency gate.
//! - `service`: The command surface tying the pieces together.
//! - `api`: Axum HTTP handlers and router setup used by the binary.
//! - `config`: Env-driven configuration loader.
//! - `error`: Common error type and alias.
//!
//! Re-exports are provided for common types: `Config`, `ComfyUIClient`,
//! `ImageService`, `WorkflowManager`, `AppError`.
pub mod api;
pub mod comfyui;
pub mod config;
pub mod error;
pub mod job;
pub mod prompt;
pub mod service;
pub mod workflow;

pub use comfyui::client::ComfyUIClient;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use service::ImageService;
pub use workflow::manager::WorkflowManager;
