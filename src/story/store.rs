use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info, warn};

use crate::error::{Result, StoryError};
use crate::persist::Persistence;
use crate::story::history::check_tree;
use crate::story::{Closing, NodeId, Story, StoryId, StoryMeta, StoryNode};

/// What a committed mutation did.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEventKind {
    Created,
    Navigated(NodeId),
    NodeAdded(NodeId),
    Completed,
}

/// Published to subscribers after every committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub story_id: StoryId,
    pub version: u64,
    pub kind: StoreEventKind,
}

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Owner of every story tree. All mutation goes through here.
///
/// Mutations are applied to a copy of the story, written to persistence, and
/// only then swapped in, so readers never observe a half-applied change and a
/// failed save leaves the previous state in place.
pub struct StoryStore {
    persistence: Box<dyn Persistence>,
    stories: RwLock<HashMap<StoryId, Story>>,
    listeners: Mutex<Vec<Listener>>,
}

impl StoryStore {
    pub fn new(persistence: Box<dyn Persistence>) -> Self {
        Self {
            persistence,
            stories: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback run after each committed mutation. Listeners may
    /// call back into the store, including `subscribe`.
    pub fn subscribe(&self, listener: impl Fn(&StoreEvent) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub fn create_story(
        &self,
        meta: StoryMeta,
        opening_text: &str,
        opening_choices: Vec<String>,
    ) -> Result<Story> {
        if meta.title.trim().is_empty() {
            return Err(StoryError::InvalidInput("story title is empty".into()));
        }
        if opening_text.trim().is_empty() {
            return Err(StoryError::InvalidInput("opening text is empty".into()));
        }
        let choices = validate_choices(opening_choices)?;

        let root = StoryNode::root(opening_text, choices);
        let story = Story {
            id: StoryId::random(),
            meta,
            nodes: HashMap::from([(root.id.clone(), root.clone())]),
            root_node_id: root.id.clone(),
            current_node_id: root.id,
            is_complete: false,
            closing: None,
            version: 1,
        };

        let mut stories = self.stories.write().unwrap_or_else(PoisonError::into_inner);
        self.persistence
            .save(&story)
            .map_err(StoryError::Persistence)?;
        stories.insert(story.id.clone(), story.clone());
        drop(stories);

        info!("Created story {} \"{}\"", story.id, story.meta.title);
        self.notify(&story, StoreEventKind::Created);
        Ok(story)
    }

    /// A snapshot of the story's latest committed state.
    pub fn get_story(&self, id: &StoryId) -> Result<Story> {
        if let Some(story) = self
            .stories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return Ok(story.clone());
        }

        let mut stories = self.stories.write().unwrap_or_else(PoisonError::into_inner);
        self.cached(&mut stories, id).cloned()
    }

    /// Ids of every known story, in-memory and persisted, sorted.
    pub fn list_stories(&self) -> Result<Vec<StoryId>> {
        let persisted = self.persistence.list().map_err(StoryError::Persistence)?;
        let stories = self.stories.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: HashSet<StoryId> = persisted.into_iter().collect();
        ids.extend(stories.keys().cloned());
        let mut ids: Vec<StoryId> = ids.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn set_current_node(&self, story_id: &StoryId, node_id: &NodeId) -> Result<Story> {
        self.mutate(story_id, StoreEventKind::Navigated(node_id.clone()), |story| {
            if !story.nodes.contains_key(node_id) {
                return Err(StoryError::NodeNotFound(node_id.clone()));
            }
            story.current_node_id = node_id.clone();
            Ok(())
        })
    }

    /// Attach `node` under its parent and make it the current node.
    pub fn add_node(&self, story_id: &StoryId, node: StoryNode) -> Result<Story> {
        let node_id = node.id.clone();
        self.mutate(story_id, StoreEventKind::NodeAdded(node_id.clone()), |story| {
            if story.is_complete {
                return Err(StoryError::AlreadyComplete(story.id.clone()));
            }
            let (Some(parent_id), Some(label)) = (&node.parent_id, &node.choice_label) else {
                return Err(StoryError::InvalidInput(
                    "a branch needs both a parent and a choice label".into(),
                ));
            };
            if story.nodes.contains_key(&node.id) {
                return Err(StoryError::InvalidInput(format!(
                    "node id {} is already in use",
                    node.id
                )));
            }
            if !story.nodes.contains_key(parent_id) {
                return Err(StoryError::ParentNotFound(parent_id.clone()));
            }
            if story.find_child(parent_id, label).is_some() {
                return Err(StoryError::DuplicateChoice {
                    parent: parent_id.clone(),
                    label: label.clone(),
                });
            }
            let mut node = node;
            node.candidate_choices = validate_choices(node.candidate_choices)?;
            story.nodes.insert(node_id.clone(), node);
            story.current_node_id = node_id.clone();
            Ok(())
        })
    }

    pub fn mark_complete(&self, story_id: &StoryId, closing: Closing) -> Result<Story> {
        self.mutate(story_id, StoreEventKind::Completed, |story| {
            if story.is_complete {
                return Err(StoryError::AlreadyComplete(story.id.clone()));
            }
            story.closing = Some(closing);
            story.is_complete = true;
            Ok(())
        })
        .inspect(|story| info!("Story {} is complete", story.id))
    }

    /// Apply `change` to a copy of the story and commit it.
    fn mutate<F>(&self, story_id: &StoryId, kind: StoreEventKind, change: F) -> Result<Story>
    where
        F: FnOnce(&mut Story) -> Result<()>,
    {
        let mut stories = self.stories.write().unwrap_or_else(PoisonError::into_inner);
        let mut draft = self.cached(&mut stories, story_id)?.clone();

        change(&mut draft)?;
        draft.version += 1;

        self.persistence
            .save(&draft)
            .map_err(StoryError::Persistence)?;
        stories.insert(story_id.clone(), draft.clone());
        drop(stories);

        debug!(
            "Committed {:?} to story {} (version {})",
            kind, draft.id, draft.version
        );
        self.notify(&draft, kind);
        Ok(draft)
    }

    /// The cached story, loading it from persistence on first access. A loaded
    /// story whose parent links do not form a tree is refused.
    fn cached<'a>(
        &self,
        stories: &'a mut HashMap<StoryId, Story>,
        id: &StoryId,
    ) -> Result<&'a Story> {
        if !stories.contains_key(id) {
            let loaded = self
                .persistence
                .load(id)
                .map_err(StoryError::Persistence)?
                .ok_or_else(|| StoryError::StoryNotFound(id.clone()))?;
            if let Err(e) = check_tree(&loaded) {
                warn!("Stored story {id} is damaged: {e}");
                return Err(e);
            }
            debug!("Loaded story {id} from persistence");
            stories.insert(id.clone(), loaded);
        }
        stories
            .get(id)
            .ok_or_else(|| StoryError::StoryNotFound(id.clone()))
    }

    fn notify(&self, story: &Story, kind: StoreEventKind) {
        let event = StoreEvent {
            story_id: story.id.clone(),
            version: story.version,
            kind,
        };
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener(&event);
        }
    }
}

/// Trim choices and reject blank or repeated labels.
fn validate_choices(choices: Vec<String>) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut cleaned = Vec::with_capacity(choices.len());
    for choice in choices {
        let choice = choice.trim().to_string();
        if choice.is_empty() {
            return Err(StoryError::InvalidInput("choice label is blank".into()));
        }
        if !seen.insert(choice.clone()) {
            return Err(StoryError::InvalidInput(format!(
                "choice \"{choice}\" is offered twice"
            )));
        }
        cleaned.push(choice);
    }
    Ok(cleaned)
}
