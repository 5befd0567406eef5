//! Thin HTTP client for ComfyUI endpoints.
//!
//! - `submit_prompt` posts an API-format graph to `/prompt`.
//! - `history` reads `/history/{id}`; `queue` reads `/queue`.
//! - `fetch_image` proxies to `/view?filename=...` and returns raw bytes.
//! - `upload_image` posts multipart form data to `/upload/image`.
//! - `cancel` / `interrupt` post to `/queue` and `/interrupt`.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::comfyui::backend::{Backend, BackendError};
use crate::comfyui::types::{HistoryEntry, ImageRef, QueueSnapshot, SubmitResponse, UploadResponse};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ComfyUIClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ComfyUIClient {
    pub fn new(base_url: String, request_timeout: Duration) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        ComfyUIClient {
            client: Client::new(),
            base_url: base,
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn ensure_success(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error body".to_string());
        tracing::error!(status = status.as_u16(), %body, "ComfyUI request failed");
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Backend for ComfyUIClient {
    async fn submit_prompt(&self, graph: &Value, client_id: &str) -> Result<SubmitResponse, BackendError> {
        let url = self.url("/prompt");
        tracing::info!("Sending prompt to ComfyUI at URL: {}", url);
        tracing::debug!("Prompt payload: {}", graph);

        let body = json!({ "prompt": graph, "client_id": client_id });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let submitted: SubmitResponse = Self::parse(response).await?;
        tracing::info!(prompt_id = %submitted.prompt_id, number = submitted.number, "Queued prompt");
        Ok(submitted)
    }

    async fn upload_image(&self, bytes: Vec<u8>, filename: &str) -> Result<String, BackendError> {
        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("image/png")?;
        let form = Form::new().part("image", part).text("overwrite", "true");
        let response = self
            .client
            .post(self.url("/upload/image"))
            .multipart(form)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let uploaded: UploadResponse = Self::parse(response).await?;
        tracing::info!(name = %uploaded.name, "Uploaded reference image");
        Ok(uploaded.name)
    }

    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/history/{prompt_id}")))
            .timeout(HISTORY_TIMEOUT.min(self.request_timeout))
            .send()
            .await?;
        let mut entries: HashMap<String, HistoryEntry> = Self::parse(response).await?;
        Ok(entries.remove(prompt_id))
    }

    async fn queue(&self) -> Result<QueueSnapshot, BackendError> {
        let response = self
            .client
            .get(self.url("/queue"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, BackendError> {
        let response = self
            .client
            .get(self.url("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("/queue"))
            .json(&json!({ "delete": [prompt_id] }))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        Self::ensure_success(response).await.map(drop)
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("/interrupt"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        Self::ensure_success(response).await.map(drop)
    }

    async fn system_stats(&self) -> Result<Value, BackendError> {
        let response = self
            .client
            .get(self.url("/system_stats"))
            .timeout(HEALTH_TIMEOUT.min(self.request_timeout))
            .send()
            .await?;
        Self::parse(response).await
    }
}
