pub mod history;
pub mod layout;
pub mod navigator;
pub mod store;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl StoryId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for StoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// One step of the narrative: the text shown while the node is active and the
/// actions offered from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryNode {
    pub id: NodeId,
    pub text: String,
    /// `None` only for the root.
    pub parent_id: Option<NodeId>,
    /// The choice that led from the parent to this node.
    pub choice_label: Option<String>,
    /// Empty means the node is a dead end.
    pub candidate_choices: Vec<String>,
}

impl StoryNode {
    pub fn root(text: impl Into<String>, choices: Vec<String>) -> Self {
        Self {
            id: NodeId::random(),
            text: text.into(),
            parent_id: None,
            choice_label: None,
            candidate_choices: choices,
        }
    }

    pub fn branch(
        parent: &NodeId,
        label: impl Into<String>,
        text: impl Into<String>,
        choices: Vec<String>,
    ) -> Self {
        Self {
            id: NodeId::random(),
            text: text.into(),
            parent_id: Some(parent.clone()),
            choice_label: Some(label.into()),
            candidate_choices: choices,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.candidate_choices.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Story
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub description: String,
}

/// Scene-setting metadata, fixed when the story is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryMeta {
    pub title: String,
    pub genre: String,
    #[serde(default)]
    pub characters: Vec<Character>,
}

/// Fields merged into a story when it is concluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closing {
    pub text: String,
    pub title: Option<String>,
    pub summary: Option<String>,
}

/// A branching story: an arena of nodes linked only through `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    #[serde(flatten)]
    pub meta: StoryMeta,
    pub nodes: HashMap<NodeId, StoryNode>,
    pub root_node_id: NodeId,
    pub current_node_id: NodeId,
    pub is_complete: bool,
    #[serde(default)]
    pub closing: Option<Closing>,
    /// Bumped on every committed mutation.
    #[serde(default)]
    pub version: u64,
}

impl Story {
    pub fn get(&self, id: &NodeId) -> Option<&StoryNode> {
        self.nodes.get(id)
    }

    pub fn root(&self) -> Option<&StoryNode> {
        self.nodes.get(&self.root_node_id)
    }

    pub fn current_node(&self) -> Option<&StoryNode> {
        self.nodes.get(&self.current_node_id)
    }

    pub fn parts_explored(&self) -> usize {
        self.nodes.len()
    }

    /// The child of `parent` reached through `label`, if it was already explored.
    pub fn find_child(&self, parent: &NodeId, label: &str) -> Option<&StoryNode> {
        self.nodes.values().find(|node| {
            node.parent_id.as_ref() == Some(parent) && node.choice_label.as_deref() == Some(label)
        })
    }

    /// Child adjacency for the whole tree, keyed by parent id.
    pub fn adjacency(&self) -> HashMap<&NodeId, Vec<&StoryNode>> {
        let mut adjacency: HashMap<&NodeId, Vec<&StoryNode>> = HashMap::new();
        for node in self.nodes.values() {
            if let Some(parent) = &node.parent_id {
                adjacency.entry(parent).or_default().push(node);
            }
        }
        for (parent, children) in adjacency.iter_mut() {
            let offered = self
                .nodes
                .get(*parent)
                .map(|p| p.candidate_choices.as_slice())
                .unwrap_or_default();
            children.sort_by_cached_key(|node| child_sort_key(node, offered));
        }
        adjacency
    }
}

fn child_sort_key(node: &StoryNode, offered: &[String]) -> (usize, String, NodeId) {
    let label = node.choice_label.clone().unwrap_or_default();
    let rank = offered
        .iter()
        .position(|choice| *choice == label)
        .unwrap_or(offered.len());
    (rank, label, node.id.clone())
}
