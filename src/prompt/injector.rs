//! Turns a classified workflow plus the caller's inputs into the graph that is
//! actually submitted.
//!
//! The payload is built from [`GraphModel::to_api_value`], a fresh deep copy,
//! so the loaded graph can back any number of concurrent requests.
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::prompt::compose::PromptComposer;
use crate::workflow::classify::{FieldTarget, RoleAssignment};
use crate::workflow::graph::GraphModel;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InjectionError {
    #[error("workflow '{workflow}' has no image input node; pick a workflow that supports image-to-image")]
    UnsupportedMode { workflow: String },
}

/// What the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub prompt: String,
    pub negative: Option<String>,
    pub seed: Option<u64>,
    pub reference_image: Option<Vec<u8>>,
}

/// Reference image bytes waiting to be uploaded right before submission.
#[derive(Clone)]
pub struct PendingUpload {
    pub target: FieldTarget,
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for PendingUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingUpload")
            .field("target", &self.target)
            .field("filename", &self.filename)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionPayload {
    pub workflow: String,
    /// API-format graph, ready for `POST /prompt`.
    pub graph: Value,
    /// Nodes whose images count as the result, best first.
    pub output_nodes: Vec<String>,
    pub upload: Option<PendingUpload>,
    /// Seed that will be used: the requested one, else the graph's own literal.
    pub seed: Option<u64>,
    pub positive_prompt: String,
    pub negative_prompt: String,
}

impl SubmissionPayload {
    /// Overwrite one input field; returns false if the node has no inputs object.
    pub fn set_field(&mut self, target: &FieldTarget, value: Value) -> bool {
        set_field(&mut self.graph, target, value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptInjector {
    composer: PromptComposer,
}

impl PromptInjector {
    pub fn new(composer: PromptComposer) -> Self {
        PromptInjector { composer }
    }

    pub fn composer(&self) -> &PromptComposer {
        &self.composer
    }

    pub fn build_payload(
        &self,
        graph: &GraphModel,
        roles: &RoleAssignment,
        inputs: &PromptInputs,
    ) -> Result<SubmissionPayload, InjectionError> {
        let upload_target = match (&inputs.reference_image, roles.image_input()) {
            (Some(_), None) => {
                return Err(InjectionError::UnsupportedMode {
                    workflow: graph.name().to_string(),
                })
            }
            (Some(_), Some(target)) => Some(target.clone()),
            (None, _) => None,
        };

        let mut api = graph.to_api_value();

        let positive = self.composer.positive(&inputs.prompt);
        if !positive.is_empty() {
            for target in &roles.positive().targets {
                set_field(&mut api, target, Value::String(positive.clone()));
            }
        }

        let negative = self.composer.negative(inputs.negative.as_deref());
        match roles.negative() {
            Some(slot) if !negative.is_empty() || slot.detached => {
                for target in &slot.targets {
                    set_field(&mut api, target, Value::String(negative.clone()));
                }
            }
            None if !negative.is_empty() => {
                tracing::debug!(workflow = graph.name(), "No negative prompt node; negative text dropped");
            }
            _ => {}
        }

        if let Some(seed) = inputs.seed {
            for target in roles.seed_targets() {
                set_field(&mut api, target, Value::from(seed));
            }
        }
        let seed = inputs.seed.or_else(|| literal_seed(graph, roles));

        let upload = upload_target.zip(inputs.reference_image.clone()).map(|(target, bytes)| {
            let filename = format!("i2i_{}.png", Uuid::new_v4().simple());
            set_field(&mut api, &target, Value::String(filename.clone()));
            PendingUpload { target, filename, bytes }
        });

        tracing::debug!(workflow = graph.name(), payload = %api, "Built submission payload");

        Ok(SubmissionPayload {
            workflow: graph.name().to_string(),
            graph: api,
            output_nodes: roles.outputs().to_vec(),
            upload,
            seed,
            positive_prompt: positive,
            negative_prompt: negative,
        })
    }
}

fn set_field(api: &mut Value, target: &FieldTarget, value: Value) -> bool {
    match api
        .get_mut(&target.node)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
    {
        Some(inputs) => {
            inputs.insert(target.field.clone(), value);
            true
        }
        None => false,
    }
}

fn literal_seed(graph: &GraphModel, roles: &RoleAssignment) -> Option<u64> {
    roles
        .seed_targets()
        .iter()
        .find_map(|t| graph.node(&t.node)?.literal(&t.field)?.as_u64())
}
