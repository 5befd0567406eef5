//! In-memory node graph loaded from an API-format workflow export.
//!
//! The export is an object keyed by node id:
//!
//! ```json
//! { "3": { "class_type": "KSampler",
//!          "inputs": { "seed": 5, "positive": ["6", 0] },
//!          "_meta": { "title": "KSampler" } } }
//! ```
//!
//! An input whose value is a two-element `[node_id, slot]` array is a link to
//! output `slot` of `node_id`; anything else is a literal. Nodes are addressed
//! by id through an index table, never by reference, so traversal over
//! malformed or cyclic graphs stays bounded.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workflow::patterns;

/// Hop budget used by [`GraphModel::follow_link`] callers that have no better idea.
pub const DEFAULT_MAX_HOPS: usize = 8;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("could not read file: {0}")]
    Read(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("workflow must be a JSON object keyed by node id")]
    NotAnObject,

    #[error("this is a UI-format export (nodes/links arrays); re-export it with \"Save (API Format)\"")]
    UiFormat,

    #[error("workflow contains no nodes")]
    Empty,

    #[error("node id '{0}' appears more than once")]
    DuplicateId(String),

    #[error("node '{0}' is not an object")]
    MalformedNode(String),

    #[error("node '{node}' is missing '{field}'")]
    MissingField { node: String, field: &'static str },

    #[error("input '{input}' of node '{node}' links to unknown node '{target}'")]
    DanglingLink {
        node: String,
        input: String,
        target: String,
    },
}

/// Reference to output `slot` of node `node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkRef {
    pub node: String,
    pub slot: u32,
}

/// A consumer endpoint: input `input` of node `node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSlot {
    pub node: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Link(LinkRef),
    Literal(Value),
}

impl FieldValue {
    fn from_json(value: Value) -> Self {
        match as_link(&value) {
            Some(link) => FieldValue::Link(link),
            None => FieldValue::Literal(value),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FieldValue::Link(link) => Value::Array(vec![
                Value::String(link.node.clone()),
                Value::from(link.slot),
            ]),
            FieldValue::Literal(v) => v.clone(),
        }
    }

    pub fn as_link(&self) -> Option<&LinkRef> {
        match self {
            FieldValue::Link(link) => Some(link),
            FieldValue::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            FieldValue::Literal(v) => Some(v),
            FieldValue::Link(_) => None,
        }
    }
}

/// Directed edge from a producer output slot to a consumer input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphLink {
    pub from: LinkRef,
    pub to: InputSlot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    id: String,
    class_type: String,
    title: Option<String>,
    inputs: Vec<(String, FieldValue)>,
    outputs: BTreeMap<u32, Vec<InputSlot>>,
    extra: Map<String, Value>,
}

impl GraphNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class_type(&self) -> &str {
        &self.class_type
    }

    /// Title from `_meta.title`, when the exporter wrote one.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.inputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn input(&self, name: &str) -> Option<&FieldValue> {
        self.inputs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn literal(&self, name: &str) -> Option<&Value> {
        self.input(name).and_then(FieldValue::as_literal)
    }

    pub fn link(&self, name: &str) -> Option<&LinkRef> {
        self.input(name).and_then(FieldValue::as_link)
    }

    /// First linked input in declaration order; what a pass-through node forwards.
    pub fn first_link(&self) -> Option<&LinkRef> {
        self.inputs.iter().find_map(|(_, v)| v.as_link())
    }

    /// Output slot -> consumers of that slot.
    pub fn outputs(&self) -> &BTreeMap<u32, Vec<InputSlot>> {
        &self.outputs
    }

    pub fn consumers(&self) -> impl Iterator<Item = &InputSlot> {
        self.outputs.values().flatten()
    }

    fn to_json(&self) -> Value {
        let mut node = Map::new();
        let inputs: Map<String, Value> = self
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        node.insert("inputs".to_string(), Value::Object(inputs));
        node.insert("class_type".to_string(), Value::String(self.class_type.clone()));
        for (k, v) in &self.extra {
            node.insert(k.clone(), v.clone());
        }
        Value::Object(node)
    }
}

/// A loaded workflow graph. Never mutated after [`GraphModel::load`].
#[derive(Debug, Clone, PartialEq)]
pub struct GraphModel {
    name: String,
    index: usize,
    nodes: Vec<GraphNode>,
    positions: HashMap<String, usize>,
    links: Vec<GraphLink>,
}

impl GraphModel {
    /// Parse a raw API-format definition.
    pub fn load(name: impl Into<String>, index: usize, raw: &str) -> Result<Self, ParseError> {
        let doc: Value = serde_json::from_str(raw)?;
        let obj = doc.as_object().ok_or(ParseError::NotAnObject)?;
        if obj.get("nodes").map_or(false, Value::is_array) && obj.contains_key("links") {
            return Err(ParseError::UiFormat);
        }
        // Re-read entry by entry: a plain JSON map would silently drop duplicate ids.
        let NodeEntries(entries) = if obj.get("prompt").map_or(false, Value::is_object) {
            serde_json::from_str::<Wrapped>(raw)?.prompt
        } else {
            serde_json::from_str::<NodeEntries>(raw)?
        };
        Self::from_entries(name.into(), index, entries)
    }

    fn from_entries(
        name: String,
        index: usize,
        entries: Vec<(String, Value)>,
    ) -> Result<Self, ParseError> {
        if entries.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut nodes = Vec::with_capacity(entries.len());
        let mut positions = HashMap::with_capacity(entries.len());
        for (id, value) in entries {
            if positions.contains_key(&id) {
                return Err(ParseError::DuplicateId(id));
            }
            let node = parse_node(&id, value)?;
            positions.insert(id, nodes.len());
            nodes.push(node);
        }

        let mut links = Vec::new();
        for node in &nodes {
            for (input, value) in &node.inputs {
                if let FieldValue::Link(link) = value {
                    if !positions.contains_key(&link.node) {
                        return Err(ParseError::DanglingLink {
                            node: node.id.clone(),
                            input: input.clone(),
                            target: link.node.clone(),
                        });
                    }
                    links.push(GraphLink {
                        from: link.clone(),
                        to: InputSlot {
                            node: node.id.clone(),
                            input: input.clone(),
                        },
                    });
                }
            }
        }
        for link in &links {
            let producer = positions[&link.from.node];
            nodes[producer]
                .outputs
                .entry(link.from.slot)
                .or_default()
                .push(link.to.clone());
        }

        Ok(GraphModel {
            name,
            index,
            nodes,
            positions,
            links,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn links(&self) -> &[GraphLink] {
        &self.links
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.positions.get(id).map(|&i| &self.nodes[i])
    }

    /// Declaration position of `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn nodes_by_type(&self, predicate: impl Fn(&str) -> bool) -> Vec<&GraphNode> {
        self.nodes
            .iter()
            .filter(|n| predicate(n.class_type()))
            .collect()
    }

    /// Resolve `link` to its logical producer, skipping built-in pass-through
    /// nodes. See [`GraphModel::follow_link_with`].
    pub fn follow_link(&self, link: &LinkRef, max_hops: usize) -> Option<&GraphNode> {
        self.follow_link_with(link, max_hops, |tag| patterns::builtin().is_pass_through(tag))
    }

    /// Walk from the node `link` points at through pass-through nodes, taking
    /// each one's first linked input, and return the first node that is not a
    /// pass-through. At most `max_hops` pass-through nodes are crossed; a longer
    /// chain, a cycle, a pass-through with nothing linked, or an unknown node
    /// yields `None`.
    pub fn follow_link_with(
        &self,
        link: &LinkRef,
        max_hops: usize,
        is_pass_through: impl Fn(&str) -> bool,
    ) -> Option<&GraphNode> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = self.node(&link.node)?;
        let mut hops = 0;
        loop {
            if !is_pass_through(current.class_type()) {
                return Some(current);
            }
            if hops == max_hops || !visited.insert(current.id()) {
                return None;
            }
            hops += 1;
            let next = current.first_link()?;
            current = self.node(&next.node)?;
        }
    }

    /// Render back to the API format; the returned value is an independent deep copy.
    pub fn to_api_value(&self) -> Value {
        let map: Map<String, Value> = self
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.to_json()))
            .collect();
        Value::Object(map)
    }
}

fn parse_node(id: &str, value: Value) -> Result<GraphNode, ParseError> {
    let Value::Object(mut obj) = value else {
        return Err(ParseError::MalformedNode(id.to_string()));
    };
    let class_type = match obj.remove("class_type") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => {
            return Err(ParseError::MissingField {
                node: id.to_string(),
                field: "class_type",
            })
        }
    };
    let inputs = match obj.remove("inputs") {
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| (k, FieldValue::from_json(v)))
            .collect(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => {
            return Err(ParseError::MissingField {
                node: id.to_string(),
                field: "inputs",
            })
        }
    };
    let title = obj
        .get("_meta")
        .and_then(|m| m.get("title"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(GraphNode {
        id: id.to_string(),
        class_type,
        title,
        inputs,
        outputs: BTreeMap::new(),
        extra: obj,
    })
}

fn as_link(value: &Value) -> Option<LinkRef> {
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let node = match &arr[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => return None,
    };
    let slot = u32::try_from(arr[1].as_u64()?).ok()?;
    Some(LinkRef { node, slot })
}

/// Top-level node entries in file order, duplicates kept.
struct NodeEntries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for NodeEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = NodeEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object keyed by node id")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<NodeEntries, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((k, v)) = map.next_entry::<String, Value>()? {
                    entries.push((k, v));
                }
                Ok(NodeEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[derive(serde::Deserialize)]
struct Wrapped {
    prompt: NodeEntries,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TXT2IMG: &str = r#"{
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd15.safetensors"}},
        "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "a cat", "clip": ["4", 1]}},
        "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "blurry", "clip": ["4", 1]}},
        "3": {"class_type": "KSampler", "inputs": {"seed": 1, "model": ["4", 0], "positive": ["6", 0], "negative": ["7", 0]}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["3", 0]}, "_meta": {"title": "Save"}}
    }"#;

    /// `n` reroutes between an encoder and a sampler.
    fn reroute_chain(n: usize) -> String {
        let mut nodes = vec![r#""enc": {"class_type": "CLIPTextEncode", "inputs": {"text": "x"}}"#.to_string()];
        let mut prev = "enc".to_string();
        for i in 0..n {
            nodes.push(format!(r#""r{i}": {{"class_type": "Reroute", "inputs": {{"": ["{prev}", 0]}}}}"#));
            prev = format!("r{i}");
        }
        nodes.push(format!(r#""ks": {{"class_type": "KSampler", "inputs": {{"positive": ["{prev}", 0]}}}}"#));
        format!("{{{}}}", nodes.join(","))
    }

    #[test]
    fn loads_nodes_in_declaration_order() {
        let g = GraphModel::load("txt2img", 1, TXT2IMG).unwrap();
        let ids: Vec<_> = g.nodes().iter().map(GraphNode::id).collect();
        assert_eq!(ids, ["4", "6", "7", "3", "9"]);
        assert_eq!(g.node("9").unwrap().title(), Some("Save"));
        assert_eq!(g.links().len(), 6);
    }

    #[test]
    fn records_downstream_consumers() {
        let g = GraphModel::load("txt2img", 1, TXT2IMG).unwrap();
        let clip_users = &g.node("4").unwrap().outputs()[&1];
        assert_eq!(clip_users.len(), 2);
        let sampler_users: Vec<_> = g.node("3").unwrap().consumers().collect();
        assert_eq!(sampler_users[0].node, "9");
        assert_eq!(sampler_users[0].input, "images");
    }

    #[test]
    fn accepts_prompt_wrapper_and_numeric_link_ids() {
        let raw = r#"{"prompt": {"1": {"class_type": "A", "inputs": {}}, "2": {"class_type": "B", "inputs": {"x": [1, 0]}}}}"#;
        let g = GraphModel::load("w", 1, raw).unwrap();
        assert_eq!(g.node("2").unwrap().link("x").unwrap().node, "1");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let raw = r#"{"1": {"class_type": "A", "inputs": {}}, "1": {"class_type": "B", "inputs": {}}}"#;
        assert_matches!(GraphModel::load("w", 1, raw), Err(ParseError::DuplicateId(id)) if id == "1");
    }

    #[test]
    fn rejects_dangling_links_and_missing_fields() {
        let dangling = r#"{"1": {"class_type": "A", "inputs": {"x": ["99", 0]}}}"#;
        assert_matches!(
            GraphModel::load("w", 1, dangling),
            Err(ParseError::DanglingLink { target, .. }) if target == "99"
        );
        let no_type = r#"{"1": {"inputs": {}}}"#;
        assert_matches!(
            GraphModel::load("w", 1, no_type),
            Err(ParseError::MissingField { field: "class_type", .. })
        );
        assert_matches!(GraphModel::load("w", 1, "{}"), Err(ParseError::Empty));
        assert_matches!(GraphModel::load("w", 1, "[1, 2]"), Err(ParseError::NotAnObject));
        assert_matches!(GraphModel::load("w", 1, "{"), Err(ParseError::Json(_)));
    }

    #[test]
    fn rejects_ui_format_exports() {
        let raw = r#"{"last_node_id": 9, "nodes": [], "links": []}"#;
        assert_matches!(GraphModel::load("w", 1, raw), Err(ParseError::UiFormat));
    }

    #[test]
    fn follow_link_stops_at_hop_limit() {
        let limit = 3;
        let within = GraphModel::load("w", 1, &reroute_chain(limit)).unwrap();
        let link = within.node("ks").unwrap().link("positive").unwrap().clone();
        assert_eq!(within.follow_link(&link, limit).map(GraphNode::id), Some("enc"));

        let beyond = GraphModel::load("w", 1, &reroute_chain(limit + 1)).unwrap();
        let link = beyond.node("ks").unwrap().link("positive").unwrap().clone();
        assert!(beyond.follow_link(&link, limit).is_none());
        assert_eq!(beyond.follow_link(&link, limit + 1).map(GraphNode::id), Some("enc"));
    }

    #[test]
    fn follow_link_terminates_on_cycles_and_dead_ends() {
        let cyclic = r#"{
            "a": {"class_type": "Reroute", "inputs": {"": ["b", 0]}},
            "b": {"class_type": "Reroute", "inputs": {"": ["a", 0]}}
        }"#;
        let g = GraphModel::load("w", 1, cyclic).unwrap();
        let link = LinkRef { node: "a".into(), slot: 0 };
        assert!(g.follow_link(&link, 100).is_none());

        let dead_end = r#"{"a": {"class_type": "Reroute", "inputs": {}}}"#;
        let g = GraphModel::load("w", 1, dead_end).unwrap();
        assert!(g.follow_link(&link, 5).is_none());
    }

    #[test]
    fn api_value_round_trips_fields() {
        let g = GraphModel::load("txt2img", 1, TXT2IMG).unwrap();
        let api = g.to_api_value();
        assert_eq!(api["3"]["inputs"]["positive"], serde_json::json!(["6", 0]));
        assert_eq!(api["9"]["_meta"]["title"], "Save");
        let again = GraphModel::load("txt2img", 1, &api.to_string()).unwrap();
        assert_eq!(again, g);
    }
}
