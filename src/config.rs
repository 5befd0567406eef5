//! Env-driven configuration for the service and CLI.
//!
//! Values are read from the process environment; `dotenv` is loaded on demand
//! by the binaries. The library itself never reads the environment: a
//! [`Config`] is built once at startup and handed to the core.
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::prompt::compose::Placement;
use crate::workflow::classify::CandidateOrder;

#[derive(Debug, Clone)]
pub struct Config {
    pub comfyui_url: String,
    pub workflows_dir: PathBuf,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_failures: u32,
    pub max_concurrent_jobs: usize,
    pub max_queued_requests: usize,
    /// `None` waits for a ticket indefinitely.
    pub queue_timeout: Option<Duration>,
    pub positive_prompt_global: String,
    pub positive_prompt_placement: Placement,
    pub negative_prompt_global: String,
    pub default_workflow_index: usize,
    pub candidate_order: CandidateOrder,
    pub api_host: String,
    pub api_port: u16,
}

const VARS: &[&str] = &[
    "COMFYUI_URL",
    "WORKFLOWS_DIR",
    "REQUEST_TIMEOUT_SECS",
    "POLL_INTERVAL_MS",
    "MAX_POLL_FAILURES",
    "MAX_CONCURRENT_JOBS",
    "MAX_QUEUED_REQUESTS",
    "QUEUE_TIMEOUT_SECS",
    "POSITIVE_PROMPT_GLOBAL",
    "POSITIVE_PROMPT_PLACEMENT",
    "NEGATIVE_PROMPT_GLOBAL",
    "DEFAULT_WORKFLOW_INDEX",
    "CANDIDATE_ORDER",
    "API_HOST",
    "API_PORT",
];

impl Config {
    pub fn dotenv_load() {
        dotenv::dotenv().ok();
    }

    pub fn new() -> AppResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset and empty values take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let comfyui_url = base_url(
            "COMFYUI_URL",
            &get("COMFYUI_URL").unwrap_or_else(|| "http://localhost:8188".to_string()),
        )?;

        let max_concurrent_jobs: usize = parse(&get, "MAX_CONCURRENT_JOBS", 3)?;
        if max_concurrent_jobs == 0 {
            return Err(AppError::Config("MAX_CONCURRENT_JOBS must be at least 1".into()));
        }
        let default_workflow_index: usize = parse(&get, "DEFAULT_WORKFLOW_INDEX", 1)?;
        if default_workflow_index == 0 {
            return Err(AppError::Config("DEFAULT_WORKFLOW_INDEX is 1-based".into()));
        }
        let queue_timeout_secs: u64 = parse(&get, "QUEUE_TIMEOUT_SECS", 300)?;

        Ok(Config {
            comfyui_url,
            workflows_dir: PathBuf::from(get("WORKFLOWS_DIR").unwrap_or_else(|| "./workflows".into())),
            request_timeout: Duration::from_secs(parse(&get, "REQUEST_TIMEOUT_SECS", 120)?),
            poll_interval: Duration::from_millis(parse(&get, "POLL_INTERVAL_MS", 1000)?),
            max_poll_failures: parse(&get, "MAX_POLL_FAILURES", 3)?,
            max_concurrent_jobs,
            max_queued_requests: parse(&get, "MAX_QUEUED_REQUESTS", 16)?,
            queue_timeout: (queue_timeout_secs > 0).then(|| Duration::from_secs(queue_timeout_secs)),
            positive_prompt_global: lookup("POSITIVE_PROMPT_GLOBAL").unwrap_or_default().trim().to_string(),
            positive_prompt_placement: parse(&get, "POSITIVE_PROMPT_PLACEMENT", Placement::Head)?,
            negative_prompt_global: lookup("NEGATIVE_PROMPT_GLOBAL").unwrap_or_default().trim().to_string(),
            default_workflow_index,
            candidate_order: parse(&get, "CANDIDATE_ORDER", CandidateOrder::Declaration)?,
            api_host: get("API_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            api_port: parse(&get, "API_PORT", 8189)?,
        })
    }

    /// Replace the backend url, applying the same checks as `COMFYUI_URL`.
    pub fn set_comfyui_url(&mut self, raw: &str) -> AppResult<()> {
        self.comfyui_url = base_url("--comfyui-url", raw)?;
        Ok(())
    }

    pub fn print_env_vars() {
        for key in VARS {
            let value = env::var(key).unwrap_or_else(|_| "<unset>".to_string());
            println!("{key}: {value}");
        }
    }
}

fn base_url(source: &str, raw: &str) -> AppResult<String> {
    let url = raw.trim().trim_end_matches('/').to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(AppError::Config(format!(
            "{source} must start with http:// or https:// (got '{url}')"
        )));
    }
    Ok(url)
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key}='{raw}': {e}"))),
    }
}
