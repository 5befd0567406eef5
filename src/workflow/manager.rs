//! Loading, listing and reloading the workflow files in the workflows directory.
//!
//! Files are sorted by name and numbered from 1; a file that fails to parse
//! keeps its number reserved so the other numbers do not shift. A reload
//! builds a complete new [`WorkflowSet`] and swaps it in; requests already
//! holding the previous set keep using it until they finish.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

use crate::workflow::classify::{
    NodeClassifier, PromptSource, RoleAssignment, UnsupportedWorkflowError,
};
use crate::workflow::graph::{GraphModel, ParseError};
use crate::workflow::patterns::NodeFamily;

/// A loaded graph plus its lazily computed role table.
#[derive(Debug)]
pub struct Workflow {
    graph: GraphModel,
    path: PathBuf,
    description: String,
    classifier: Arc<NodeClassifier>,
    roles: OnceCell<Result<RoleAssignment, UnsupportedWorkflowError>>,
}

impl Workflow {
    pub fn new(graph: GraphModel, path: PathBuf, classifier: Arc<NodeClassifier>) -> Self {
        let description = describe(&graph, &classifier);
        Workflow {
            graph,
            path,
            description,
            classifier,
            roles: OnceCell::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.graph.index()
    }

    pub fn name(&self) -> &str {
        self.graph.name()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn graph(&self) -> &GraphModel {
        &self.graph
    }

    /// Classified on first use, then cached for the lifetime of this workflow.
    pub fn roles(&self) -> Result<&RoleAssignment, UnsupportedWorkflowError> {
        self.roles
            .get_or_init(|| self.classifier.classify(&self.graph))
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn has_image_input(&self) -> bool {
        self.roles().map_or(false, RoleAssignment::has_image_input)
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            index: self.index(),
            name: self.name().to_string(),
            description: self.description.clone(),
            has_image_input: self.has_image_input(),
            supported: self.roles().is_ok(),
        }
    }

    /// Everything the inspector shows about this workflow.
    pub fn details(&self) -> Result<WorkflowDetails, UnsupportedWorkflowError> {
        let roles = self.roles()?;
        let graph = &self.graph;
        let literal = |node: Option<&str>, field: &str| -> Option<Value> {
            graph.node(node?)?.literal(field).cloned()
        };
        let primary = roles.primary_sampler();
        Ok(WorkflowDetails {
            summary: self.summary(),
            positive_node: roles.positive().node.clone(),
            positive_source: source_label(roles.positive().source),
            negative_node: roles.negative().map(|s| s.node.clone()),
            samplers: roles.samplers().to_vec(),
            seed: literal(primary, "seed").or_else(|| literal(primary, "noise_seed")),
            steps: literal(primary, "steps"),
            image_input_node: roles.image_input().map(|t| t.node.clone()),
            output_nodes: roles.outputs().to_vec(),
            latent_size: roles.latent_image().and_then(|id| {
                let w = literal(Some(id), "width")?.as_u64()?;
                let h = literal(Some(id), "height")?.as_u64()?;
                Some((w, h))
            }),
        })
    }
}

fn describe(graph: &GraphModel, classifier: &NodeClassifier) -> String {
    graph
        .nodes()
        .iter()
        .filter(|n| classifier.registry().family_of(n.class_type()) == Some(NodeFamily::CheckpointLoader))
        .find_map(|n| n.literal("ckpt_name").and_then(Value::as_str))
        .filter(|ckpt| !ckpt.is_empty())
        .map(|ckpt| format!("model: {ckpt}"))
        .unwrap_or_else(|| graph.name().to_string())
}

fn source_label(source: PromptSource) -> &'static str {
    match source {
        PromptSource::OnlyEncoder => "only encoder",
        PromptSource::TitleHint => "node title",
        PromptSource::SamplerLink => "sampler link",
        PromptSource::TextKeyword => "existing text",
        PromptSource::Precedence => "node order",
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkflowSummary {
    pub index: usize,
    pub name: String,
    pub description: String,
    pub has_image_input: bool,
    pub supported: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDetails {
    #[serde(flatten)]
    pub summary: WorkflowSummary,
    pub positive_node: String,
    pub positive_source: &'static str,
    pub negative_node: Option<String>,
    pub samplers: Vec<String>,
    pub seed: Option<Value>,
    pub steps: Option<Value>,
    pub image_input_node: Option<String>,
    pub output_nodes: Vec<String>,
    pub latent_size: Option<(u64, u64)>,
}

/// One immutable generation of loaded workflows.
#[derive(Debug, Default)]
pub struct WorkflowSet {
    entries: BTreeMap<usize, Arc<Workflow>>,
}

impl WorkflowSet {
    pub fn get(&self, index: usize) -> Option<Arc<Workflow>> {
        self.entries.get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Workflow>> {
        self.entries.values()
    }

    pub fn summaries(&self) -> Vec<WorkflowSummary> {
        self.iter().map(|w| w.summary()).collect()
    }
}

#[derive(Debug)]
pub struct LoadFailure {
    pub index: usize,
    pub path: PathBuf,
    pub error: ParseError,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub failures: Vec<LoadFailure>,
}

pub struct WorkflowManager {
    dir: PathBuf,
    classifier: Arc<NodeClassifier>,
    current: RwLock<Arc<WorkflowSet>>,
}

impl WorkflowManager {
    /// A manager with nothing loaded yet; call [`WorkflowManager::reload`].
    pub fn new(dir: impl Into<PathBuf>, classifier: NodeClassifier) -> Self {
        WorkflowManager {
            dir: dir.into(),
            classifier: Arc::new(classifier),
            current: RwLock::new(Arc::new(WorkflowSet::default())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The set in effect right now. Cheap; holds no lock after returning.
    pub async fn snapshot(&self) -> Arc<WorkflowSet> {
        self.current.read().await.clone()
    }

    pub async fn get(&self, index: usize) -> Option<Arc<Workflow>> {
        self.snapshot().await.get(index)
    }

    pub async fn list(&self) -> Vec<WorkflowSummary> {
        self.snapshot().await.summaries()
    }

    /// Re-scan the directory and swap the new set in. Only a failure to read
    /// the directory itself is an error; bad files are reported per file.
    pub async fn reload(&self) -> std::io::Result<LoadReport> {
        let (set, report) = scan(&self.dir, &self.classifier).await?;
        *self.current.write().await = Arc::new(set);
        tracing::info!(
            dir = %self.dir.display(),
            loaded = report.loaded,
            failed = report.failures.len(),
            "Workflows reloaded"
        );
        Ok(report)
    }
}

async fn scan(dir: &Path, classifier: &Arc<NodeClassifier>) -> std::io::Result<(WorkflowSet, LoadReport)> {
    fs::create_dir_all(dir).await?;

    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_json = path.extension().map_or(false, |e| e.eq_ignore_ascii_case("json"));
        if is_json && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut set = WorkflowSet::default();
    let mut report = LoadReport::default();
    for (i, path) in files.into_iter().enumerate() {
        let index = i + 1;
        match load_file(&path, index).await {
            Ok(graph) => {
                tracing::info!(index, name = graph.name(), "Loaded workflow");
                let workflow = Workflow::new(graph, path, classifier.clone());
                set.entries.insert(index, Arc::new(workflow));
                report.loaded += 1;
            }
            Err(error) => {
                tracing::warn!(index, path = %path.display(), %error, "Failed to load workflow");
                report.failures.push(LoadFailure { index, path, error });
            }
        }
    }
    Ok((set, report))
}

async fn load_file(path: &Path, index: usize) -> Result<GraphModel, ParseError> {
    let raw = fs::read_to_string(path).await?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    GraphModel::load(name, index, &raw)
}
