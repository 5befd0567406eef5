//! Merging the caller's prompt text with the configured global fragments.
use std::str::FromStr;

/// Where the global positive fragment goes relative to the caller's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Head,
    Tail,
}

impl FromStr for Placement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "head" | "prefix" => Ok(Placement::Head),
            "tail" | "suffix" => Ok(Placement::Tail),
            other => Err(format!("unknown placement '{other}' (expected head|tail)")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptComposer {
    global_positive: String,
    placement: Placement,
    global_negative: String,
}

impl PromptComposer {
    pub fn new(global_positive: impl Into<String>, placement: Placement, global_negative: impl Into<String>) -> Self {
        PromptComposer {
            global_positive: global_positive.into(),
            placement,
            global_negative: global_negative.into(),
        }
    }

    pub fn positive(&self, user: &str) -> String {
        match self.placement {
            Placement::Head => join(&self.global_positive, user),
            Placement::Tail => join(user, &self.global_positive),
        }
    }

    /// Global negative first, then whatever the caller adds.
    pub fn negative(&self, user: Option<&str>) -> String {
        join(&self.global_negative, user.unwrap_or_default())
    }
}

fn join(first: &str, second: &str) -> String {
    let (first, second) = (first.trim(), second.trim());
    match (first.is_empty(), second.is_empty()) {
        (true, _) => second.to_string(),
        (_, true) => first.to_string(),
        _ => format!("{first}, {second}"),
    }
}
