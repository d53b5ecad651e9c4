use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kinds of entities whose changes are pushed to live clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Section,
    Task,
    Comment,
    Group,
}

impl EntityKind {
    pub const ALL: [Self; 5] = [
        Self::Project,
        Self::Section,
        Self::Task,
        Self::Comment,
        Self::Group,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Section => "section",
            Self::Task => "task",
            Self::Comment => "comment",
            Self::Group => "group",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

/// Field set carried by a mutation (column name -> new value)
pub type MutationFields = serde_json::Map<String, serde_json::Value>;
