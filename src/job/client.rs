//! Submits payloads to the backend and tracks each job to a terminal state.
//!
//! A job moves `Queued -> Running -> {Succeeded, Failed, TimedOut, Cancelled}`.
//! Completion is detected by polling history at a fixed interval; the wait
//! between polls is a cancellable timer, so withdrawing the request stops the
//! loop immediately.
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::comfyui::backend::{Backend, BackendError};
use crate::comfyui::types::ImageRef;
use crate::prompt::injector::SubmissionPayload;

const REMOTE_CANCEL_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    /// Infrastructure problem: the backend could not be reached or kept failing.
    #[error("{0}")]
    BackendUnreachable(String),

    /// The backend ran the job and reported an error.
    #[error("{0}")]
    Failed(String),

    #[error("no result within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl From<BackendError> for JobError {
    fn from(err: BackendError) -> Self {
        if err.is_transport() {
            JobError::BackendUnreachable(err.to_string())
        } else {
            JobError::Failed(err.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// Consecutive failed polls tolerated before giving up.
    pub max_poll_failures: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            interval: Duration::from_secs(1),
            max_poll_failures: 3,
        }
    }
}

#[derive(Debug)]
pub struct JobHandle {
    prompt_id: String,
    submitted_at: Instant,
    status: JobStatus,
    output_nodes: Vec<String>,
}

impl JobHandle {
    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    fn transition(&mut self, next: JobStatus) {
        if self.status != next {
            tracing::info!(prompt_id = %self.prompt_id, from = ?self.status, to = ?next, "Job status changed");
            self.status = next;
        }
    }
}

/// Result image of a finished job.
#[derive(Clone)]
pub struct Artifact {
    pub image: ImageRef,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("image", &self.image)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

pub struct JobClient {
    backend: Arc<dyn Backend>,
    client_id: String,
    settings: PollSettings,
}

impl JobClient {
    pub fn new(backend: Arc<dyn Backend>, settings: PollSettings) -> Self {
        JobClient {
            backend,
            client_id: Uuid::new_v4().to_string(),
            settings,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Upload the reference image if there is one, then queue the graph.
    pub async fn submit(&self, mut payload: SubmissionPayload) -> Result<JobHandle, JobError> {
        if let Some(upload) = payload.upload.take() {
            let stored = self.backend.upload_image(upload.bytes, &upload.filename).await?;
            payload.set_field(&upload.target, Value::String(stored));
        }

        let submitted = self.backend.submit_prompt(&payload.graph, &self.client_id).await?;
        tracing::info!(
            prompt_id = %submitted.prompt_id,
            workflow = %payload.workflow,
            seed = ?payload.seed,
            "Job submitted"
        );
        Ok(JobHandle {
            prompt_id: submitted.prompt_id,
            submitted_at: Instant::now(),
            status: JobStatus::Queued,
            output_nodes: payload.output_nodes,
        })
    }

    /// Poll until the job finishes, `timeout` passes since submission, or
    /// `cancel` fires. On timeout and cancel the remote job is withdrawn on a
    /// best-effort basis.
    pub async fn await_completion(
        &self,
        handle: &mut JobHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Artifact, JobError> {
        let deadline = handle.submitted_at + timeout;
        let mut failures = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abandon(handle, JobStatus::TimedOut).await;
                return Err(JobError::TimedOut(timeout));
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = tokio::time::timeout(remaining, self.poll(handle)) => Some(res),
            };
            match polled {
                None => {
                    self.abandon(handle, JobStatus::Cancelled).await;
                    return Err(JobError::Cancelled);
                }
                // deadline reached mid-poll; the check above ends the loop
                Some(Err(_)) => continue,
                Some(Ok(Ok(Some(outcome)))) => return outcome,
                Some(Ok(Ok(None))) => failures = 0,
                Some(Ok(Err(err))) if !err.is_transport() => {
                    tracing::warn!(prompt_id = %handle.prompt_id, error = %err, "Backend rejected status poll");
                    handle.transition(JobStatus::Failed);
                    return Err(err.into());
                }
                Some(Ok(Err(err))) => {
                    failures += 1;
                    tracing::warn!(
                        prompt_id = %handle.prompt_id,
                        attempt = failures,
                        error = %err,
                        "Status poll failed"
                    );
                    if failures > self.settings.max_poll_failures {
                        handle.transition(JobStatus::Failed);
                        return Err(JobError::BackendUnreachable(err.to_string()));
                    }
                }
            }

            let wait = self
                .settings
                .interval
                .min(deadline.saturating_duration_since(Instant::now()));
            let interrupted = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(wait) => false,
            };
            if interrupted {
                self.abandon(handle, JobStatus::Cancelled).await;
                return Err(JobError::Cancelled);
            }
        }
    }

    /// `Ok(None)` means still in progress.
    async fn poll(&self, handle: &mut JobHandle) -> Result<Option<Result<Artifact, JobError>>, BackendError> {
        if let Some(entry) = self.backend.history(&handle.prompt_id).await? {
            if entry.is_error() {
                handle.transition(JobStatus::Failed);
                return Ok(Some(Err(JobError::Failed(entry.error_message()))));
            }
            if entry.is_complete() {
                let Some(image) = entry.pick_image(&handle.output_nodes).cloned() else {
                    handle.transition(JobStatus::Failed);
                    return Ok(Some(Err(JobError::Failed("job finished without an output image".into()))));
                };
                let bytes = self.backend.fetch_image(&image).await?;
                handle.transition(JobStatus::Succeeded);
                return Ok(Some(Ok(Artifact { image, bytes })));
            }
        }

        if handle.status == JobStatus::Queued && self.backend.queue().await?.is_running(&handle.prompt_id) {
            handle.transition(JobStatus::Running);
        }
        Ok(None)
    }

    async fn abandon(&self, handle: &mut JobHandle, status: JobStatus) {
        let was_running = handle.status == JobStatus::Running;
        handle.transition(status);

        let withdraw = async {
            if let Err(err) = self.backend.cancel(&handle.prompt_id).await {
                tracing::warn!(prompt_id = %handle.prompt_id, error = %err, "Failed to remove job from backend queue");
            }
            if was_running {
                if let Err(err) = self.backend.interrupt().await {
                    tracing::warn!(prompt_id = %handle.prompt_id, error = %err, "Failed to interrupt running job");
                }
            }
        };
        if tokio::time::timeout(REMOTE_CANCEL_BUDGET, withdraw).await.is_err() {
            tracing::warn!(prompt_id = %handle.prompt_id, "Remote cancel did not answer in time");
        }
    }
}
