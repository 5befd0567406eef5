//! Infers which nodes of a [`GraphModel`] receive the prompt, the seed and the
//! reference image, and which produce the result.
//!
//! The output is a side table ([`RoleAssignment`]); the graph is never touched.
use std::collections::{HashSet, VecDeque};
use std::str::FromStr;

use thiserror::Error;

use crate::workflow::graph::{GraphModel, GraphNode, LinkRef, DEFAULT_MAX_HOPS};
use crate::workflow::patterns::{NodeFamily, PatternRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    PositivePrompt,
    NegativePrompt,
    Sampler,
    ImageInput,
    ImageOutput,
}

/// Tie-break among equally good candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidateOrder {
    /// Order the nodes appear in the exported file.
    #[default]
    Declaration,
    /// Ascending node id, numeric ids compared as numbers.
    NodeId,
}

impl FromStr for CandidateOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "declaration" => Ok(CandidateOrder::Declaration),
            "node-id" | "node_id" | "id" => Ok(CandidateOrder::NodeId),
            other => Err(format!("unknown candidate order '{other}' (expected declaration|node-id)")),
        }
    }
}

/// A single input field that gets overwritten at injection time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldTarget {
    pub node: String,
    pub field: String,
}

impl FieldTarget {
    fn new(node: &str, field: &str) -> Self {
        FieldTarget {
            node: node.to_string(),
            field: field.to_string(),
        }
    }
}

/// Which signal settled a prompt node's polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    OnlyEncoder,
    TitleHint,
    SamplerLink,
    TextKeyword,
    Precedence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSlot {
    pub node: String,
    pub targets: Vec<FieldTarget>,
    pub source: PromptSource,
    /// A target replaces a link shared with the other prompt node, so it must
    /// be written even when the text is empty.
    pub detached: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleAssignment {
    positive: PromptSlot,
    negative: Option<PromptSlot>,
    samplers: Vec<String>,
    seed_targets: Vec<FieldTarget>,
    image_input: Option<FieldTarget>,
    outputs: Vec<String>,
    latent_image: Option<String>,
}

impl RoleAssignment {
    pub fn positive(&self) -> &PromptSlot {
        &self.positive
    }

    pub fn negative(&self) -> Option<&PromptSlot> {
        self.negative.as_ref()
    }

    /// Every sampler found, the one closest to an output first.
    pub fn samplers(&self) -> &[String] {
        &self.samplers
    }

    pub fn primary_sampler(&self) -> Option<&str> {
        self.samplers.first().map(String::as_str)
    }

    /// Fields a requested seed is written into, deduplicated.
    pub fn seed_targets(&self) -> &[FieldTarget] {
        &self.seed_targets
    }

    pub fn image_input(&self) -> Option<&FieldTarget> {
        self.image_input.as_ref()
    }

    pub fn has_image_input(&self) -> bool {
        self.image_input.is_some()
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn latent_image(&self) -> Option<&str> {
        self.latent_image.as_deref()
    }

    pub fn nodes_for(&self, role: Role) -> Vec<&str> {
        match role {
            Role::PositivePrompt => vec![self.positive.node.as_str()],
            Role::NegativePrompt => self.negative.iter().map(|s| s.node.as_str()).collect(),
            Role::Sampler => self.samplers.iter().map(String::as_str).collect(),
            Role::ImageInput => self.image_input.iter().map(|t| t.node.as_str()).collect(),
            Role::ImageOutput => self.outputs.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("workflow '{workflow}' has no text-encode node to receive the prompt")]
pub struct UnsupportedWorkflowError {
    pub workflow: String,
}

const TEXT_FIELDS: &[&str] = &["text", "text_g", "text_l"];
const TEXT_SOURCE_FIELDS: &[&str] = &["text", "string", "value", "text_g", "prompt"];
const SEED_FIELDS: &[&str] = &["seed", "noise_seed"];
const SEED_SOURCE_FIELDS: &[&str] = &["seed", "noise_seed", "value"];
const IMAGE_FIELDS: &[&str] = &["image", "url"];

const NEGATIVE_KEYWORDS: &[&str] = &["worst quality", "low quality", "bad anatomy", "ugly"];
const POSITIVE_KEYWORDS: &[&str] = &["masterpiece", "best quality", "beautiful", "detailed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Positive,
    Negative,
}

#[derive(Debug, Clone)]
pub struct NodeClassifier {
    registry: PatternRegistry,
    order: CandidateOrder,
    max_hops: usize,
}

impl Default for NodeClassifier {
    fn default() -> Self {
        NodeClassifier {
            registry: PatternRegistry::default(),
            order: CandidateOrder::default(),
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

impl NodeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(mut self, registry: PatternRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_order(mut self, order: CandidateOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    pub fn classify(&self, graph: &GraphModel) -> Result<RoleAssignment, UnsupportedWorkflowError> {
        let encoders = self.candidates(graph, NodeFamily::TextEncode);
        if encoders.is_empty() {
            return Err(UnsupportedWorkflowError {
                workflow: graph.name().to_string(),
            });
        }

        let samplers = self.rank_samplers(graph, self.candidates(graph, NodeFamily::Sampler));
        let (positive, negative) = self.split_prompts(graph, &encoders, &samplers);

        let mut seen = HashSet::new();
        let seed_targets = samplers
            .iter()
            .flat_map(|s| self.seed_targets(graph, s))
            .filter(|t| seen.insert(t.clone()))
            .collect();

        let image_input = self
            .candidates(graph, NodeFamily::ImageLoad)
            .first()
            .map(|n| {
                let field = IMAGE_FIELDS
                    .iter()
                    .find(|f| n.input(f).is_some())
                    .unwrap_or(&IMAGE_FIELDS[0]);
                FieldTarget::new(n.id(), field)
            });

        let positive = self.prompt_slot(graph, positive.0, positive.1, &[]);
        let negative = negative.map(|(n, source)| self.prompt_slot(graph, n, source, &positive.targets));

        Ok(RoleAssignment {
            positive,
            negative,
            samplers: samplers.iter().map(|n| n.id().to_string()).collect(),
            seed_targets,
            image_input,
            outputs: self
                .candidates(graph, NodeFamily::ImageOutput)
                .iter()
                .map(|n| n.id().to_string())
                .collect(),
            latent_image: self
                .candidates(graph, NodeFamily::LatentImage)
                .first()
                .map(|n| n.id().to_string()),
        })
    }

    fn family(&self, node: &GraphNode) -> Option<NodeFamily> {
        self.registry.family_of(node.class_type())
    }

    fn follow<'g>(&self, graph: &'g GraphModel, link: &LinkRef) -> Option<&'g GraphNode> {
        graph.follow_link_with(link, self.max_hops, |tag| self.registry.is_pass_through(tag))
    }

    /// Nodes of `family` in precedence order.
    fn candidates<'g>(&self, graph: &'g GraphModel, family: NodeFamily) -> Vec<&'g GraphNode> {
        let mut nodes: Vec<&GraphNode> = graph
            .nodes()
            .iter()
            .filter(|n| self.family(n) == Some(family))
            .collect();
        if self.order == CandidateOrder::NodeId {
            nodes.sort_by(|a, b| match (a.id().parse::<u64>(), b.id().parse::<u64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => a.id().cmp(b.id()),
            });
        }
        nodes
    }

    /// Closest to an output first; unreachable samplers last; ties keep precedence.
    fn rank_samplers<'g>(&self, graph: &'g GraphModel, mut samplers: Vec<&'g GraphNode>) -> Vec<&'g GraphNode> {
        samplers.sort_by_key(|s| self.distance_to_output(graph, s).unwrap_or(usize::MAX));
        samplers
    }

    fn distance_to_output(&self, graph: &GraphModel, start: &GraphNode) -> Option<usize> {
        let mut visited: HashSet<&str> = HashSet::from([start.id()]);
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((node, depth)) = queue.pop_front() {
            if self.family(node) == Some(NodeFamily::ImageOutput) {
                return Some(depth);
            }
            for consumer in node.consumers() {
                if visited.insert(consumer.node.as_str()) {
                    if let Some(next) = graph.node(&consumer.node) {
                        queue.push_back((next, depth + 1));
                    }
                }
            }
        }
        None
    }

    fn split_prompts<'g>(
        &self,
        graph: &'g GraphModel,
        encoders: &[&'g GraphNode],
        samplers: &[&'g GraphNode],
    ) -> ((&'g GraphNode, PromptSource), Pick<'g>) {
        if let [only] = encoders {
            return ((*only, PromptSource::OnlyEncoder), None);
        }

        let mut pos: Pick<'g> = None;
        let mut neg: Pick<'g> = None;

        for &node in encoders {
            match title_hint(node) {
                Some(Polarity::Negative) if neg.is_none() => neg = Some((node, PromptSource::TitleHint)),
                Some(Polarity::Positive) if pos.is_none() => pos = Some((node, PromptSource::TitleHint)),
                _ => {}
            }
        }

        for &sampler in samplers {
            if pos.is_none() {
                if let Some(node) = self.trace_conditioning(graph, sampler, Polarity::Positive) {
                    if !taken(node, pos, neg) {
                        pos = Some((node, PromptSource::SamplerLink));
                    }
                }
            }
            if neg.is_none() {
                if let Some(node) = self.trace_conditioning(graph, sampler, Polarity::Negative) {
                    if !taken(node, pos, neg) {
                        neg = Some((node, PromptSource::SamplerLink));
                    }
                }
            }
            if pos.is_some() && neg.is_some() {
                break;
            }
        }

        for &node in encoders {
            if taken(node, pos, neg) {
                continue;
            }
            let text = node
                .literal("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_lowercase();
            if neg.is_none() && NEGATIVE_KEYWORDS.iter().any(|k| text.contains(k)) {
                neg = Some((node, PromptSource::TextKeyword));
            } else if pos.is_none() && POSITIVE_KEYWORDS.iter().any(|k| text.contains(k)) {
                pos = Some((node, PromptSource::TextKeyword));
            }
        }

        for &node in encoders {
            if taken(node, pos, neg) {
                continue;
            }
            if pos.is_none() {
                pos = Some((node, PromptSource::Precedence));
            } else if neg.is_none() {
                neg = Some((node, PromptSource::Precedence));
            }
        }

        // Two or more encoders always leave one free for the positive role.
        let pos = pos.unwrap_or((encoders[0], PromptSource::Precedence));
        (pos, neg)
    }

    /// Follow a sampler's positive/negative conditioning back to its encoder,
    /// crossing pass-throughs, guiders and conditioning modifiers (ControlNet
    /// apply and friends) within the hop budget.
    fn trace_conditioning<'g>(
        &self,
        graph: &'g GraphModel,
        sampler: &'g GraphNode,
        polarity: Polarity,
    ) -> Option<&'g GraphNode> {
        let start = match conditioning_input(sampler, polarity) {
            Some(link) => link,
            None => {
                let guider = self.follow(graph, sampler.link("guider")?)?;
                conditioning_input(guider, polarity)?
            }
        };

        let mut link = start.clone();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut budget = self.max_hops;
        loop {
            let node = self.follow(graph, &link)?;
            if self.family(node) == Some(NodeFamily::TextEncode) {
                return Some(node);
            }
            if budget == 0 || !visited.insert(node.id()) {
                return None;
            }
            budget -= 1;
            link = conditioning_input(node, polarity)?.clone();
        }
    }

    /// Text targets for a prompt node. A linked field whose source is already
    /// in `claimed` is written on the node itself, cutting the shared link.
    fn prompt_slot(
        &self,
        graph: &GraphModel,
        node: &GraphNode,
        source: PromptSource,
        claimed: &[FieldTarget],
    ) -> PromptSlot {
        let mut targets = Vec::new();
        let mut detached = false;
        for field in TEXT_FIELDS {
            match node.input(field) {
                Some(value) if value.as_literal().is_some() => {
                    targets.push(FieldTarget::new(node.id(), field))
                }
                Some(value) => {
                    match value
                        .as_link()
                        .and_then(|l| self.literal_source(graph, l, TEXT_SOURCE_FIELDS))
                    {
                        Some(t) if claimed.contains(&t) => {
                            tracing::debug!(
                                workflow = graph.name(),
                                node = node.id(),
                                shared = %t.node,
                                "Prompt nodes share a text source; writing on the encoder"
                            );
                            targets.push(FieldTarget::new(node.id(), field));
                            detached = true;
                        }
                        Some(t) => targets.push(t),
                        None => {}
                    }
                }
                None => {}
            }
        }
        if targets.is_empty() {
            targets.push(FieldTarget::new(node.id(), TEXT_FIELDS[0]));
        }
        PromptSlot {
            node: node.id().to_string(),
            targets,
            source,
            detached,
        }
    }

    fn seed_targets(&self, graph: &GraphModel, sampler: &GraphNode) -> Vec<FieldTarget> {
        let mut targets = Vec::new();
        for field in SEED_FIELDS {
            match node_field(sampler, field) {
                Some(FieldRef::Literal) => targets.push(FieldTarget::new(sampler.id(), field)),
                Some(FieldRef::Link(link)) => {
                    targets.extend(self.literal_source(graph, link, SEED_SOURCE_FIELDS))
                }
                None => {}
            }
        }
        if targets.is_empty() {
            if let Some(noise) = sampler.link("noise") {
                targets.extend(self.literal_source(graph, noise, SEED_FIELDS));
            }
        }
        if targets.is_empty() {
            targets.push(FieldTarget::new(sampler.id(), SEED_FIELDS[0]));
        }
        targets
    }

    /// First literal among `fields` on the node `link` resolves to.
    fn literal_source(&self, graph: &GraphModel, link: &LinkRef, fields: &[&str]) -> Option<FieldTarget> {
        let node = self.follow(graph, link)?;
        fields
            .iter()
            .find(|f| node.literal(f).is_some())
            .map(|f| FieldTarget::new(node.id(), f))
    }
}

type Pick<'g> = Option<(&'g GraphNode, PromptSource)>;

fn taken(node: &GraphNode, pos: Pick<'_>, neg: Pick<'_>) -> bool {
    [pos, neg]
        .iter()
        .flatten()
        .any(|(picked, _)| picked.id() == node.id())
}

enum FieldRef<'a> {
    Literal,
    Link(&'a LinkRef),
}

fn node_field<'a>(node: &'a GraphNode, field: &str) -> Option<FieldRef<'a>> {
    let value = node.input(field)?;
    Some(match value.as_link() {
        Some(link) => FieldRef::Link(link),
        None => FieldRef::Literal,
    })
}

fn conditioning_input(node: &GraphNode, polarity: Polarity) -> Option<&LinkRef> {
    let name = match polarity {
        Polarity::Positive => "positive",
        Polarity::Negative => "negative",
    };
    if let Some(link) = node.link(name) {
        return Some(link);
    }
    if node.link("positive").is_some() || node.link("negative").is_some() {
        return None;
    }
    // single-conditioning nodes (BasicGuider, ControlNetApply) pass one side through
    node.inputs()
        .filter(|(k, _)| k.contains("conditioning"))
        .find_map(|(_, v)| v.as_link())
}

fn title_hint(node: &GraphNode) -> Option<Polarity> {
    let title = node.title()?.to_lowercase();
    if title.contains("negative") || title.contains('负') {
        Some(Polarity::Negative)
    } else if title.contains("positive") || title.contains('正') {
        Some(Polarity::Positive)
    } else {
        None
    }
}
