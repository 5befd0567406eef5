//! The command surface: everything a front end (HTTP, CLI, chat adapter) can
//! ask of the core.
//!
//! Which workflow a user is on lives in a [`Session`] the caller owns and
//! passes in; the service itself holds no per-user state.
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::comfyui::backend::Backend;
use crate::comfyui::types::ImageRef;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::job::client::{JobClient, PollSettings};
use crate::job::gate::{ConcurrencyGate, GateStats};
use crate::prompt::compose::PromptComposer;
use crate::prompt::injector::{PromptInjector, PromptInputs};
use crate::workflow::classify::NodeClassifier;
use crate::workflow::manager::{WorkflowDetails, WorkflowManager, WorkflowSummary};

/// Per-user selection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Session {
    workflow_index: usize,
}

impl Session {
    pub fn new(workflow_index: usize) -> Self {
        Session { workflow_index }
    }

    pub fn workflow_index(&self) -> usize {
        self.workflow_index
    }
}

#[derive(Clone, Serialize)]
pub struct GenerationResult {
    #[serde(skip)]
    pub image: Vec<u8>,
    pub image_ref: ImageRef,
    pub prompt_id: String,
    pub workflow: String,
    pub seed: Option<u64>,
    pub positive_prompt: String,
    #[serde(serialize_with = "as_secs_f64")]
    pub queued_for: Duration,
    #[serde(serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
}

impl std::fmt::Debug for GenerationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationResult")
            .field("image", &self.image.len())
            .field("prompt_id", &self.prompt_id)
            .field("workflow", &self.workflow)
            .field("seed", &self.seed)
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

fn as_secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub reachable: bool,
    pub detail: String,
    pub system: Option<Value>,
    pub queue_running: Option<usize>,
    pub queue_pending: Option<usize>,
    pub gate: GateStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub index: usize,
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    pub loaded: usize,
    pub failed: Vec<FailedFile>,
}

pub struct ImageService {
    workflows: WorkflowManager,
    injector: PromptInjector,
    jobs: JobClient,
    gate: ConcurrencyGate,
    request_timeout: Duration,
    default_workflow: usize,
}

impl ImageService {
    pub fn new(
        workflows: WorkflowManager,
        injector: PromptInjector,
        jobs: JobClient,
        gate: ConcurrencyGate,
        request_timeout: Duration,
        default_workflow: usize,
    ) -> Self {
        ImageService {
            workflows,
            injector,
            jobs,
            gate,
            request_timeout,
            default_workflow,
        }
    }

    /// Wire the core from configuration. Workflows are not loaded yet; call
    /// [`ImageService::reload_workflows`].
    pub fn from_config(config: &Config, backend: Arc<dyn Backend>) -> Self {
        let classifier = NodeClassifier::new().with_order(config.candidate_order);
        let composer = PromptComposer::new(
            config.positive_prompt_global.clone(),
            config.positive_prompt_placement,
            config.negative_prompt_global.clone(),
        );
        let poll = PollSettings {
            interval: config.poll_interval,
            max_poll_failures: config.max_poll_failures,
        };
        ImageService::new(
            WorkflowManager::new(config.workflows_dir.clone(), classifier),
            PromptInjector::new(composer),
            JobClient::new(backend, poll),
            ConcurrencyGate::new(
                config.max_concurrent_jobs,
                config.max_queued_requests,
                config.queue_timeout,
            ),
            config.request_timeout,
            config.default_workflow_index,
        )
    }

    pub fn new_session(&self) -> Session {
        Session::new(self.default_workflow)
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn workflows(&self) -> &WorkflowManager {
        &self.workflows
    }

    pub async fn generate(
        &self,
        session: &Session,
        prompt: &str,
        seed: Option<u64>,
        cancel: &CancellationToken,
    ) -> AppResult<GenerationResult> {
        let inputs = PromptInputs {
            prompt: prompt.to_string(),
            seed,
            ..Default::default()
        };
        self.generate_with(session, inputs, cancel).await
    }

    pub async fn generate_from_image(
        &self,
        session: &Session,
        prompt: &str,
        reference_image: Vec<u8>,
        cancel: &CancellationToken,
    ) -> AppResult<GenerationResult> {
        let inputs = PromptInputs {
            prompt: prompt.to_string(),
            reference_image: Some(reference_image),
            ..Default::default()
        };
        self.generate_with(session, inputs, cancel).await
    }

    /// Full form of [`generate`](Self::generate): negative override, seed and
    /// reference image all optional.
    pub async fn generate_with(
        &self,
        session: &Session,
        inputs: PromptInputs,
        cancel: &CancellationToken,
    ) -> AppResult<GenerationResult> {
        let arrived = Instant::now();
        let index = session.workflow_index();
        let workflow = self
            .workflows
            .get(index)
            .await
            .ok_or(AppError::WorkflowNotFound(index))?;
        let roles = workflow.roles()?;
        let payload = self.injector.build_payload(workflow.graph(), roles, &inputs)?;
        let (seed, positive_prompt) = (payload.seed, payload.positive_prompt.clone());

        let ticket = self.gate.acquire_cancellable(cancel).await?;
        tracing::info!(
            workflow = workflow.name(),
            sequence = ticket.sequence(),
            waited_ms = ticket.waited().as_millis() as u64,
            "Admitted generation request"
        );

        let mut handle = self.jobs.submit(payload).await?;
        let outcome = self
            .jobs
            .await_completion(&mut handle, self.request_timeout, cancel)
            .await;
        drop(ticket);

        let artifact = outcome.map_err(|err| {
            tracing::warn!(prompt_id = handle.prompt_id(), status = ?handle.status(), error = %err, "Generation did not succeed");
            AppError::from(err)
        })?;
        tracing::info!(
            prompt_id = handle.prompt_id(),
            elapsed_ms = handle.elapsed().as_millis() as u64,
            bytes = artifact.bytes.len(),
            "Generation finished"
        );

        Ok(GenerationResult {
            image: artifact.bytes,
            image_ref: artifact.image,
            prompt_id: handle.prompt_id().to_string(),
            workflow: workflow.name().to_string(),
            seed,
            positive_prompt,
            queued_for: handle.submitted_at().saturating_duration_since(arrived),
            elapsed: arrived.elapsed(),
        })
    }

    /// Never fails: an unreachable backend is part of the report.
    pub async fn check_backend_health(&self) -> HealthReport {
        let backend = self.jobs.backend();
        let gate = self.gate.stats();
        match backend.system_stats().await {
            Ok(system) => {
                let queue = backend.queue().await.ok();
                HealthReport {
                    reachable: true,
                    detail: "ok".to_string(),
                    system: Some(system),
                    queue_running: queue.as_ref().map(|q| q.running.len()),
                    queue_pending: queue.as_ref().map(|q| q.pending.len()),
                    gate,
                }
            }
            Err(err) => HealthReport {
                reachable: false,
                detail: err.to_string(),
                system: None,
                queue_running: None,
                queue_pending: None,
                gate,
            },
        }
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.workflows.list().await
    }

    pub async fn select_workflow(&self, session: &mut Session, index: usize) -> AppResult<WorkflowSummary> {
        let workflow = self
            .workflows
            .get(index)
            .await
            .ok_or(AppError::WorkflowNotFound(index))?;
        session.workflow_index = index;
        Ok(workflow.summary())
    }

    pub async fn describe_workflow(&self, index: usize) -> AppResult<WorkflowDetails> {
        let workflow = self
            .workflows
            .get(index)
            .await
            .ok_or(AppError::WorkflowNotFound(index))?;
        Ok(workflow.details()?)
    }

    pub async fn reload_workflows(&self) -> AppResult<ReloadSummary> {
        let report = self.workflows.reload().await?;
        Ok(ReloadSummary {
            loaded: report.loaded,
            failed: report
                .failures
                .into_iter()
                .map(|f| FailedFile {
                    index: f.index,
                    file: f
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    error: f.error.to_string(),
                })
                .collect(),
        })
    }
}
