use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use log::{info, warn};

use crate::error::{Result, StoryError};
use crate::llm::Generator;
use crate::story::history::{project_path, transcript};
use crate::story::store::StoryStore;
use crate::story::{Closing, NodeId, Story, StoryId, StoryMeta, StoryNode};

/// Story lifecycle policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationPolicy {
    /// Minimum number of parts from root to current node before a story may end.
    pub min_path_len: usize,
}

impl Default for NavigationPolicy {
    fn default() -> Self {
        Self { min_path_len: 5 }
    }
}

/// How a choice was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The branch already existed and was revisited.
    Replayed(NodeId),
    /// The branch was generated and added.
    Created(NodeId),
}

impl Resolution {
    pub fn node_id(&self) -> &NodeId {
        match self {
            Resolution::Replayed(id) | Resolution::Created(id) => id,
        }
    }
}

/// Turns reader choices into tree changes, asking the generator only for
/// branches that have not been explored yet.
pub struct Navigator {
    store: Arc<StoryStore>,
    generator: Box<dyn Generator>,
    policy: NavigationPolicy,
    in_flight: Mutex<HashSet<StoryId>>,
}

impl Navigator {
    pub fn new(
        store: Arc<StoryStore>,
        generator: Box<dyn Generator>,
        policy: NavigationPolicy,
    ) -> Self {
        Self {
            store,
            generator,
            policy,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &StoryStore {
        &self.store
    }

    /// Create a story whose opening scene comes from the generator.
    pub fn begin_story(&self, meta: StoryMeta) -> Result<Story> {
        if meta.title.trim().is_empty() {
            return Err(StoryError::InvalidInput("story title is empty".into()));
        }
        let opening = self
            .generator
            .open(&meta)
            .and_then(|opening| check_choices(&opening.choices).map(|()| opening))
            .map_err(StoryError::GenerationFailed)?;
        self.store
            .create_story(meta, &opening.text, opening.choices)
    }

    /// Follow `label` from the story's current node.
    ///
    /// An explored branch is replayed without generation. Otherwise the
    /// generator is asked for the next part and the new node is committed;
    /// if generation fails the tree is left as it was.
    pub fn choose(&self, story_id: &StoryId, label: &str) -> Result<Resolution> {
        let label = label.trim();
        if label.is_empty() {
            return Err(StoryError::InvalidInput("choice label is blank".into()));
        }
        let _slot = self.claim(story_id)?;

        let story = self.store.get_story(story_id)?;
        let current = story
            .current_node()
            .ok_or_else(|| StoryError::NodeNotFound(story.current_node_id.clone()))?;

        if let Some(existing) = story.find_child(&current.id, label) {
            info!(
                "Replaying \"{label}\": {} -> {} (story {story_id})",
                current.id, existing.id
            );
            self.store.set_current_node(story_id, &existing.id)?;
            return Ok(Resolution::Replayed(existing.id.clone()));
        }

        if story.is_complete {
            return Err(StoryError::AlreadyComplete(story_id.clone()));
        }

        let continuation = self
            .generator
            .continue_story(&story, label)
            .and_then(|next| check_choices(&next.choices).map(|()| next))
            .map_err(|e| {
                warn!("Continuation for \"{label}\" failed: {e:#}");
                StoryError::GenerationFailed(e)
            })?;

        let node = StoryNode::branch(&current.id, label, continuation.text, continuation.choices);
        let node_id = node.id.clone();
        self.store.add_node(story_id, node)?;
        info!(
            "Created branch \"{label}\": {} -> {node_id} (story {story_id})",
            current.id
        );
        Ok(Resolution::Created(node_id))
    }

    /// Conclude the story from its current node.
    pub fn end_story(&self, story_id: &StoryId) -> Result<Story> {
        let _slot = self.claim(story_id)?;

        let story = self.store.get_story(story_id)?;
        if story.is_complete {
            return Err(StoryError::AlreadyComplete(story_id.clone()));
        }
        let path = project_path(&story)?;
        if path.len() < self.policy.min_path_len {
            return Err(StoryError::TooShort {
                len: path.len(),
                min: self.policy.min_path_len,
            });
        }

        let history = transcript(&path);
        let conclusion = self
            .generator
            .conclude(&story, &history)
            .map_err(|e| {
                warn!("Ending for story {story_id} failed: {e:#}");
                StoryError::GenerationFailed(e)
            })?;

        self.store.mark_complete(
            story_id,
            Closing {
                text: conclusion.text,
                title: conclusion.title,
                summary: conclusion.summary,
            },
        )
    }

    /// Reserve the story's single generation slot until the guard drops.
    fn claim(&self, story_id: &StoryId) -> Result<InFlight<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(story_id.clone()) {
            return Err(StoryError::Busy(story_id.clone()));
        }
        Ok(InFlight {
            slots: &self.in_flight,
            story_id: story_id.clone(),
        })
    }
}

/// Generated choices must be non-blank and distinct before they become a node.
fn check_choices(choices: &[String]) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for choice in choices {
        let choice = choice.trim();
        if choice.is_empty() {
            return Err(anyhow!("generator offered a blank choice"));
        }
        if !seen.insert(choice) {
            return Err(anyhow!("generator offered \"{choice}\" twice"));
        }
    }
    Ok(())
}

/// Held while a story has a request outstanding. Released on every exit path,
/// including unwinding out of a generator call.
struct InFlight<'a> {
    slots: &'a Mutex<HashSet<StoryId>>,
    story_id: StoryId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.story_id);
    }
}
