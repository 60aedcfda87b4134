use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use log::debug;

use crate::story::{Story, StoryId};

/// Where stories live between sessions. Calls complete before returning.
pub trait Persistence: Send + Sync {
    fn load(&self, id: &StoryId) -> Result<Option<Story>>;
    fn save(&self, story: &Story) -> Result<()>;
    /// Ids of every stored story, sorted.
    fn list(&self) -> Result<Vec<StoryId>>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPersistence {
    stories: Mutex<HashMap<StoryId, Story>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self, id: &StoryId) -> Result<Option<Story>> {
        let stories = self.stories.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(stories.get(id).cloned())
    }

    fn save(&self, story: &Story) -> Result<()> {
        let mut stories = self.stories.lock().unwrap_or_else(PoisonError::into_inner);
        stories.insert(story.id.clone(), story.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<StoryId>> {
        let stories = self.stories.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<StoryId> = stories.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

/// One pretty-printed `<id>.json` file per story.
pub struct JsonDirPersistence {
    dir: PathBuf,
}

impl JsonDirPersistence {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create story directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// `<data dir>/branchtale`, or `./branchtale` when the platform has none.
    pub fn default_dir() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("branchtale");
        path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &StoryId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl Persistence for JsonDirPersistence {
    fn load(&self, id: &StoryId) -> Result<Option<Story>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let story = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(story))
    }

    fn save(&self, story: &Story) -> Result<()> {
        let path = self.path_for(&story.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(story).context("failed to serialize story")?;
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;
        debug!("Saved story {} (version {})", story.id, story.version);
        Ok(())
    }

    fn list(&self) -> Result<Vec<StoryId>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(StoryId(stem.to_string()));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::fixtures::story;

    #[test]
    fn json_dir_round_trips_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirPersistence::open(dir.path()).unwrap();
        let story = story(&[("root", None, None), ("a", Some("root"), Some("Go"))]);

        assert!(store.load(&story.id).unwrap().is_none());
        store.save(&story).unwrap();

        assert_eq!(store.load(&story.id).unwrap(), Some(story.clone()));
        assert_eq!(store.list().unwrap(), vec![story.id.clone()]);
        assert!(!dir.path().join("story.json.tmp").exists());
    }

    #[test]
    fn json_dir_reports_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let store = JsonDirPersistence::open(dir.path()).unwrap();

        let err = store.load(&"broken".into()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse"));
    }

    #[test]
    fn memory_lists_sorted_ids() {
        let store = MemoryPersistence::new();
        let mut first = story(&[("root", None, None)]);
        first.id = "b".into();
        let mut second = first.clone();
        second.id = "a".into();
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        assert_eq!(store.list().unwrap(), vec![StoryId::from("a"), StoryId::from("b")]);
    }
}
