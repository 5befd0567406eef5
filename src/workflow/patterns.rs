//! Declarative table of node type-tag patterns.
//!
//! Each rule pairs a [`NodeFamily`] with a [`MatchRule`]; rules are evaluated in
//! priority order and the first match wins, so more specific rules (pass-through
//! nodes whose names contain `CLIPTextEncode`, for instance) sit above broader
//! ones.
use self::MatchKind::{Contains, Exact, Prefix};

/// Semantic family a node type belongs to, independent of graph position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeFamily {
    /// Forwards its input unchanged (reroutes).
    PassThrough,
    /// Turns prompt text into conditioning.
    TextEncode,
    /// Consumes a seed and runs denoising.
    Sampler,
    /// Loads a reference image from the backend's input folder.
    ImageLoad,
    /// Saves or previews the generated image.
    ImageOutput,
    /// Creates the empty latent canvas (width/height live here).
    LatentImage,
    /// Loads the checkpoint; used for the workflow description.
    CheckpointLoader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRule {
    Exact(String),
    Prefix(String),
    Contains(String),
}

impl MatchRule {
    pub fn matches(&self, type_tag: &str) -> bool {
        match self {
            MatchRule::Exact(s) => type_tag == s,
            MatchRule::Prefix(s) => type_tag.starts_with(s.as_str()),
            MatchRule::Contains(s) => type_tag.contains(s.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternRule {
    pub family: NodeFamily,
    pub rule: MatchRule,
}

#[derive(Clone, Copy)]
enum MatchKind {
    Exact,
    Prefix,
    Contains,
}

impl MatchKind {
    fn rule(self, pattern: &str) -> MatchRule {
        let pattern = pattern.to_string();
        match self {
            MatchKind::Exact => MatchRule::Exact(pattern),
            MatchKind::Prefix => MatchRule::Prefix(pattern),
            MatchKind::Contains => MatchRule::Contains(pattern),
        }
    }
}

const BUILTIN: &[(NodeFamily, MatchKind, &str)] = &[
    (NodeFamily::PassThrough, Exact, "Reroute"),
    (NodeFamily::PassThrough, Exact, "RerouteTextForCLIPTextEncodeForSDXL"),
    (NodeFamily::PassThrough, Prefix, "Reroute"),
    (NodeFamily::TextEncode, Exact, "CLIPTextEncode"),
    (NodeFamily::TextEncode, Exact, "CLIPTextEncodeSDXL"),
    (NodeFamily::TextEncode, Exact, "CLIPTextEncodeSD3"),
    (NodeFamily::TextEncode, Exact, "AdvancedCLIPTextEncode"),
    (NodeFamily::TextEncode, Exact, "BNK_CLIPTextEncodeAdvanced"),
    (NodeFamily::TextEncode, Prefix, "CLIPTextEncode"),
    (NodeFamily::Sampler, Exact, "KSampler"),
    (NodeFamily::Sampler, Exact, "KSamplerAdvanced"),
    (NodeFamily::Sampler, Exact, "KSampler (Efficient)"),
    (NodeFamily::Sampler, Exact, "SamplerCustom"),
    (NodeFamily::Sampler, Exact, "SamplerCustomAdvanced"),
    (NodeFamily::ImageLoad, Exact, "LoadImage"),
    (NodeFamily::ImageLoad, Exact, "LoadImageMask"),
    (NodeFamily::ImageLoad, Exact, "LoadImageFromUrl"),
    (NodeFamily::ImageOutput, Exact, "SaveImage"),
    (NodeFamily::ImageOutput, Exact, "PreviewImage"),
    (NodeFamily::ImageOutput, Exact, "SaveImageWebsocket"),
    (NodeFamily::ImageOutput, Contains, "SaveImage"),
    (NodeFamily::LatentImage, Exact, "EmptyLatentImage"),
    (NodeFamily::LatentImage, Exact, "EmptySD3LatentImage"),
    (NodeFamily::LatentImage, Exact, "EmptyLatentImagePresets"),
    (NodeFamily::CheckpointLoader, Contains, "Checkpoint"),
];

/// Ordered, extensible set of [`PatternRule`]s.
#[derive(Debug, Clone)]
pub struct PatternRegistry {
    rules: Vec<PatternRule>,
}

impl PatternRegistry {
    /// An empty registry; nothing classifies.
    pub fn empty() -> Self {
        PatternRegistry { rules: Vec::new() }
    }

    /// Prepend a rule so it takes priority over everything already registered.
    pub fn with_priority_rule(mut self, family: NodeFamily, rule: MatchRule) -> Self {
        self.rules.insert(0, PatternRule { family, rule });
        self
    }

    /// Append a rule at the lowest priority.
    pub fn with_rule(mut self, family: NodeFamily, rule: MatchRule) -> Self {
        self.rules.push(PatternRule { family, rule });
        self
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    pub fn family_of(&self, type_tag: &str) -> Option<NodeFamily> {
        self.rules
            .iter()
            .find(|r| r.rule.matches(type_tag))
            .map(|r| r.family)
    }

    pub fn is_pass_through(&self, type_tag: &str) -> bool {
        self.family_of(type_tag) == Some(NodeFamily::PassThrough)
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        let rules = BUILTIN
            .iter()
            .map(|&(family, kind, pattern)| PatternRule {
                family,
                rule: kind.rule(pattern),
            })
            .collect();
        PatternRegistry { rules }
    }
}

/// Family of `type_tag` under the built-in table.
pub fn family_of(type_tag: &str) -> Option<NodeFamily> {
    builtin().family_of(type_tag)
}

pub(crate) fn builtin() -> &'static PatternRegistry {
    static REGISTRY: once_cell::sync::Lazy<PatternRegistry> =
        once_cell::sync::Lazy::new(PatternRegistry::default);
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_encoders_classify() {
        for tag in ["CLIPTextEncode", "CLIPTextEncodeSDXL", "CLIPTextEncodeFlux", "BNK_CLIPTextEncodeAdvanced"] {
            assert_eq!(family_of(tag), Some(NodeFamily::TextEncode), "{tag}");
        }
    }

    #[test]
    fn sdxl_text_reroute_is_pass_through_not_encoder() {
        assert_eq!(
            family_of("RerouteTextForCLIPTextEncodeForSDXL"),
            Some(NodeFamily::PassThrough)
        );
        assert_eq!(family_of("Reroute"), Some(NodeFamily::PassThrough));
    }

    #[test]
    fn sampler_family() {
        assert_eq!(family_of("KSampler"), Some(NodeFamily::Sampler));
        assert_eq!(family_of("KSampler (Efficient)"), Some(NodeFamily::Sampler));
        assert_eq!(family_of("SamplerCustomAdvanced"), Some(NodeFamily::Sampler));
        // picks a sampler name, carries no seed
        assert_eq!(family_of("KSamplerSelect"), None);
    }

    #[test]
    fn image_families() {
        assert_eq!(family_of("LoadImage"), Some(NodeFamily::ImageLoad));
        assert_eq!(family_of("PreviewImage"), Some(NodeFamily::ImageOutput));
        assert_eq!(family_of("Image SaveImage Extended"), Some(NodeFamily::ImageOutput));
        assert_eq!(family_of("EmptySD3LatentImage"), Some(NodeFamily::LatentImage));
        assert_eq!(family_of("CheckpointLoaderSimple"), Some(NodeFamily::CheckpointLoader));
        assert_eq!(family_of("VAEDecode"), None);
    }

    #[test]
    fn custom_rules_respect_priority() {
        let registry = PatternRegistry::default()
            .with_rule(NodeFamily::TextEncode, MatchRule::Exact("MyPromptNode".into()))
            .with_priority_rule(NodeFamily::PassThrough, MatchRule::Exact("CLIPTextEncodeRelay".into()));
        assert_eq!(registry.family_of("MyPromptNode"), Some(NodeFamily::TextEncode));
        assert!(registry.is_pass_through("CLIPTextEncodeRelay"));
        assert!(PatternRegistry::empty().family_of("KSampler").is_none());
    }

    #[test]
    fn builtin_table_keeps_prefix_and_contains_rules() {
        let rules = PatternRegistry::default();
        assert!(rules.rules().contains(&PatternRule {
            family: NodeFamily::PassThrough,
            rule: MatchRule::Prefix("Reroute".into()),
        }));
        assert_eq!(family_of("RerouteLatent"), Some(NodeFamily::PassThrough));
        assert_eq!(family_of("CheckpointLoader|pysssss"), Some(NodeFamily::CheckpointLoader));
    }
}
