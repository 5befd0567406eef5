//! Typed views of the ComfyUI REST documents the job client reads.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response of `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Response of `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// One image reference as listed under a node's outputs; also the query of `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "output_kind")]
    pub kind: String,
}

fn output_kind() -> String {
    "output".to_string()
}

impl ImageRef {
    pub fn is_output(&self) -> bool {
        self.kind == "output"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, data]` pairs, e.g. `["execution_error", {...}]`.
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Entry of `GET /history/{prompt_id}`. Present only once the backend has
/// finished with the prompt, successfully or not.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub status: Option<HistoryStatus>,
    #[serde(default)]
    pub outputs: Option<BTreeMap<String, NodeOutput>>,
}

impl HistoryEntry {
    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .map_or(false, |s| s == "error")
    }

    pub fn is_complete(&self) -> bool {
        self.outputs.is_some() || self.status.as_ref().map_or(false, |s| s.completed)
    }

    /// Best diagnostic the backend left for a failed run.
    pub fn error_message(&self) -> String {
        let messages = self.status.iter().flat_map(|s| s.messages.iter());
        for message in messages {
            let Some([event, data]) = message.as_array().map(Vec::as_slice) else {
                continue;
            };
            if event.as_str() != Some("execution_error") {
                continue;
            }
            let exception = data.get("exception_message").and_then(Value::as_str).unwrap_or("unknown error");
            return match data.get("node_type").and_then(Value::as_str) {
                Some(node_type) => format!("{node_type}: {}", exception.trim()),
                None => exception.trim().to_string(),
            };
        }
        "execution error".to_string()
    }

    /// Image to return as the result: designated output nodes first, and
    /// within a group `type == "output"` beats temp/preview images.
    pub fn pick_image(&self, preferred_nodes: &[String]) -> Option<&ImageRef> {
        let outputs = self.outputs.as_ref()?;
        best_image(preferred_nodes.iter().filter_map(|id| outputs.get(id)))
            .or_else(|| best_image(outputs.values()))
    }
}

fn best_image<'a>(nodes: impl Iterator<Item = &'a NodeOutput>) -> Option<&'a ImageRef> {
    let mut fallback = None;
    for image in nodes.flat_map(|n| n.images.iter()) {
        if image.is_output() {
            return Some(image);
        }
        fallback.get_or_insert(image);
    }
    fallback
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    #[serde(default)]
    queue_running: Vec<Value>,
    #[serde(default)]
    queue_pending: Vec<Value>,
}

/// Prompt ids in `GET /queue`, running and pending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawQueue")]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl From<RawQueue> for QueueSnapshot {
    fn from(raw: RawQueue) -> Self {
        // entries are [number, prompt_id, prompt, extra_data, outputs_to_execute]
        let ids = |items: Vec<Value>| {
            items
                .iter()
                .filter_map(|item| item.get(1)?.as_str().map(str::to_string))
                .collect()
        };
        QueueSnapshot {
            running: ids(raw.queue_running),
            pending: ids(raw.queue_pending),
        }
    }
}

impl QueueSnapshot {
    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.running.iter().any(|id| id == prompt_id)
    }

    pub fn is_pending(&self, prompt_id: &str) -> bool {
        self.pending.iter().any(|id| id == prompt_id)
    }
}
