use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How configured tags combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// At least one configured tag is present.
    #[default]
    Some,
    /// Every configured tag is present.
    Every,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Some => write!(f, "some"),
            Self::Every => write!(f, "every"),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "some" => Ok(Self::Some),
            "every" => Ok(Self::Every),
            other => Err(format!(
                "match value must be 'some' or 'every', not '{other}'"
            )),
        }
    }
}

/// Tag-based test selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    tags: BTreeSet<String>,
    mode: MatchMode,
}

impl TagFilter {
    pub fn new<I: IntoIterator<Item = String>>(tags: I, mode: MatchMode) -> Self {
        Self {
            tags: tags.into_iter().collect(),
            mode,
        }
    }

    /// No tags configured: everything matches.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Whether a test carrying `test_tags` is selected.
    pub fn matches(&self, test_tags: &BTreeSet<String>) -> bool {
        if self.tags.is_empty() {
            return true;
        }
        if test_tags.is_empty() {
            return false;
        }
        match self.mode {
            MatchMode::Some => self.tags.iter().any(|t| test_tags.contains(t)),
            MatchMode::Every => self.tags.iter().all(|t| test_tags.contains(t)),
        }
    }
}
