use thiserror::Error;

use crate::story::{NodeId, StoryId};

/// Everything the story engine can refuse to do.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("story not found: {0}")]
    StoryNotFound(StoryId),
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("parent node not found: {0}")]
    ParentNotFound(NodeId),
    #[error("node {parent} already has a branch for choice \"{label}\"")]
    DuplicateChoice { parent: NodeId, label: String },
    #[error("story {0} is already complete")]
    AlreadyComplete(StoryId),
    #[error("story path has {len} parts, at least {min} are needed to end it")]
    TooShort { len: usize, min: usize },
    /// The generation collaborator failed. The tree is untouched.
    #[error("generation failed: {0:#}")]
    GenerationFailed(anyhow::Error),
    /// A parent pointer did not resolve while walking towards the root.
    #[error("broken parent chain at node {0}")]
    BrokenChain(NodeId),
    #[error("story {0} already has a generation request in flight")]
    Busy(StoryId),
    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),
}

pub type Result<T, E = StoryError> = std::result::Result<T, E>;
