//! Shared fixtures: workflow files and a scripted in-process backend.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use comfy_sdl::comfyui::backend::{Backend, BackendError};
use comfy_sdl::comfyui::types::{HistoryEntry, ImageRef, QueueSnapshot, SubmitResponse};
use comfy_sdl::job::client::{JobClient, PollSettings};
use comfy_sdl::job::gate::ConcurrencyGate;
use comfy_sdl::prompt::injector::PromptInjector;
use comfy_sdl::workflow::classify::NodeClassifier;
use comfy_sdl::{ImageService, WorkflowManager};

pub const TXT2IMG: &str = r#"{
    "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd15.safetensors"}},
    "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "a cat", "clip": ["4", 1]}},
    "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "blurry", "clip": ["4", 1]}},
    "5": {"class_type": "EmptyLatentImage", "inputs": {"width": 512, "height": 512, "batch_size": 1}},
    "3": {"class_type": "KSampler", "inputs": {"seed": 8, "steps": 20, "model": ["4", 0], "positive": ["6", 0], "negative": ["7", 0], "latent_image": ["5", 0]}},
    "8": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0], "vae": ["4", 2]}},
    "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0], "filename_prefix": "ComfyUI"}}
}"#;

pub const REFINER: &str = r#"{"prompt": {
    "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sdxl_base.safetensors"}},
    "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
    "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
    "10": {"class_type": "KSamplerAdvanced", "inputs": {"noise_seed": 1, "positive": ["6", 0], "negative": ["7", 0]}},
    "11": {"class_type": "KSamplerAdvanced", "inputs": {"noise_seed": 2, "positive": ["6", 0], "negative": ["7", 0], "latent_image": ["10", 0]}},
    "17": {"class_type": "VAEDecode", "inputs": {"samples": ["11", 0]}},
    "9": {"class_type": "SaveImage", "inputs": {"images": ["17", 0]}}
}}"#;

pub const IMG2IMG: &str = r#"{
    "6": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}},
    "7": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}},
    "10": {"class_type": "LoadImage", "inputs": {"image": "example.png"}},
    "12": {"class_type": "VAEEncode", "inputs": {"pixels": ["10", 0]}},
    "3": {"class_type": "KSampler", "inputs": {"seed": 5, "denoise": 0.6, "positive": ["6", 0], "negative": ["7", 0], "latent_image": ["12", 0]}},
    "8": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0]}},
    "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0]}}
}"#;

pub const IMAGE_BYTES: &[u8] = b"\x89PNG fake image";

/// Fresh directory under the system temp dir holding `files`.
pub fn workflow_dir(files: &[(&str, &str)]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("comfy-sdl-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
    dir
}

pub fn standard_workflows() -> PathBuf {
    workflow_dir(&[
        ("01_txt2img.json", TXT2IMG),
        ("02_refiner.json", REFINER),
        ("03_img2img.json", IMG2IMG),
    ])
}

#[derive(Debug, Clone)]
pub enum Script {
    /// Pending for `pending` polls, running for `running` more, then done.
    Complete { pending: usize, running: usize },
    /// Finishes with an execution error.
    Fail(&'static str),
    /// Never finishes; queue reports it pending.
    Stall,
    /// Never finishes; queue reports it running.
    StallRunning,
    /// History requests never answer.
    Hang,
    /// First `failures` history polls fail at the transport level.
    Flaky { failures: usize },
    /// History reports success but `/view` answers 404.
    MissingImage,
    Unreachable,
}

pub struct ScriptedBackend {
    script: Script,
    pub submits: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub fetches: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub uploads: Mutex<Vec<String>>,
    pub cancels: Mutex<Vec<String>>,
    pub graphs: Mutex<Vec<Value>>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            script,
            submits: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            graphs: Mutex::new(Vec::new()),
        })
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn last_graph(&self) -> Value {
        self.graphs.lock().unwrap().last().cloned().unwrap_or(Value::Null)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }

    fn current_id(&self) -> String {
        format!("job-{}", self.submits.load(Ordering::SeqCst))
    }
}

fn unreachable() -> BackendError {
    BackendError::Transport("connection refused".into())
}

fn done_entry() -> HistoryEntry {
    serde_json::from_value(json!({
        "status": {"status_str": "success", "completed": true, "messages": []},
        "outputs": {
            "9": {"images": [{"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"}]}
        }
    }))
    .unwrap()
}

fn error_entry(message: &str) -> HistoryEntry {
    serde_json::from_value(json!({
        "status": {"status_str": "error", "completed": false, "messages": [
            ["execution_error", {"node_type": "KSampler", "exception_message": message}]
        ]},
        "outputs": {}
    }))
    .unwrap()
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn submit_prompt(&self, graph: &Value, _client_id: &str) -> Result<SubmitResponse, BackendError> {
        if matches!(self.script, Script::Unreachable) {
            return Err(unreachable());
        }
        self.graphs.lock().unwrap().push(graph.clone());
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmitResponse {
            prompt_id: format!("job-{n}"),
            number: n as i64,
        })
    }

    async fn upload_image(&self, _bytes: Vec<u8>, filename: &str) -> Result<String, BackendError> {
        if matches!(self.script, Script::Unreachable) {
            return Err(unreachable());
        }
        self.uploads.lock().unwrap().push(filename.to_string());
        Ok(format!("stored_{filename}"))
    }

    async fn history(&self, _prompt_id: &str) -> Result<Option<HistoryEntry>, BackendError> {
        let call = self.history_calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Unreachable => Err(unreachable()),
            Script::Hang => std::future::pending::<Result<Option<HistoryEntry>, BackendError>>().await,
            Script::Stall | Script::StallRunning => Ok(None),
            Script::Fail(message) => Ok(Some(error_entry(message))),
            Script::Flaky { failures } if call < *failures => Err(unreachable()),
            Script::Flaky { .. } | Script::MissingImage => Ok(Some(done_entry())),
            Script::Complete { pending, running } if call < pending + running => Ok(None),
            Script::Complete { .. } => Ok(Some(done_entry())),
        }
    }

    async fn queue(&self) -> Result<QueueSnapshot, BackendError> {
        let polls = self.history_calls.load(Ordering::SeqCst);
        let id = vec![self.current_id()];
        let running = match &self.script {
            Script::Unreachable => return Err(unreachable()),
            Script::StallRunning => true,
            Script::Complete { pending, .. } => polls > *pending,
            _ => false,
        };
        Ok(if running {
            QueueSnapshot { running: id, pending: Vec::new() }
        } else {
            QueueSnapshot { running: Vec::new(), pending: id }
        })
    }

    async fn fetch_image(&self, _image: &ImageRef) -> Result<Vec<u8>, BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::MissingImage => Err(BackendError::Status {
                status: 404,
                body: "not found".into(),
            }),
            _ => Ok(IMAGE_BYTES.to_vec()),
        }
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), BackendError> {
        self.cancels.lock().unwrap().push(prompt_id.to_string());
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn system_stats(&self) -> Result<Value, BackendError> {
        match self.script {
            Script::Unreachable => Err(unreachable()),
            _ => Ok(json!({"system": {"os": "posix", "comfyui_version": "0.3.10"}, "devices": []})),
        }
    }
}

pub fn fast_poll() -> PollSettings {
    PollSettings {
        interval: Duration::from_millis(10),
        max_poll_failures: 3,
    }
}

pub struct ServiceOptions {
    pub max_concurrent: usize,
    pub max_waiting: usize,
    pub request_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            max_concurrent: 2,
            max_waiting: 8,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Service over `backend` with the workflows in `dir` already loaded.
pub async fn service_with(backend: Arc<ScriptedBackend>, dir: PathBuf, options: ServiceOptions) -> ImageService {
    let service = ImageService::new(
        WorkflowManager::new(dir, NodeClassifier::new()),
        PromptInjector::default(),
        JobClient::new(backend, fast_poll()),
        ConcurrencyGate::new(options.max_concurrent, options.max_waiting, None),
        options.request_timeout,
        1,
    );
    service.reload_workflows().await.unwrap();
    service
}
