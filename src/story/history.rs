use crate::error::{Result, StoryError};
use crate::story::{NodeId, Story, StoryNode};

/// The path from the root to the current node, root first.
///
/// Walks `parent_id` pointers upwards from the current node. A pointer that
/// does not resolve, or a chain longer than the node count (a cycle), is
/// reported as `BrokenChain` instead of being truncated.
pub fn project_path(story: &Story) -> Result<Vec<&StoryNode>> {
    path_to(story, &story.current_node_id)
}

/// The path from the root to `target`, root first.
pub fn path_to<'a>(story: &'a Story, target: &NodeId) -> Result<Vec<&'a StoryNode>> {
    let mut path = Vec::new();
    let mut cursor = story
        .get(target)
        .ok_or_else(|| StoryError::BrokenChain(target.clone()))?;

    loop {
        path.push(cursor);
        if path.len() > story.nodes.len() {
            return Err(StoryError::BrokenChain(cursor.id.clone()));
        }
        match &cursor.parent_id {
            None => break,
            Some(parent_id) => {
                cursor = story
                    .get(parent_id)
                    .ok_or_else(|| StoryError::BrokenChain(cursor.id.clone()))?;
            }
        }
    }

    if cursor.id != story.root_node_id {
        return Err(StoryError::BrokenChain(cursor.id.clone()));
    }

    path.reverse();
    Ok(path)
}

/// Check a story read back from storage: the root exists and has no parent,
/// the current node resolves, and every node chains back to the root.
pub fn check_tree(story: &Story) -> Result<()> {
    let root = story
        .root()
        .ok_or_else(|| StoryError::BrokenChain(story.root_node_id.clone()))?;
    if root.parent_id.is_some() {
        return Err(StoryError::BrokenChain(root.id.clone()));
    }
    for id in story.nodes.keys() {
        path_to(story, id)?;
    }
    project_path(story).map(|_| ())
}

/// Render a path as transcript entries: the chosen action, then the text.
pub fn transcript(path: &[&StoryNode]) -> Vec<String> {
    path.iter()
        .map(|node| match &node.choice_label {
            Some(choice) => format!("> {choice}\n{}", node.text),
            None => node.text.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::fixtures::story;

    fn branching() -> Story {
        story(&[
            ("root", None, None),
            ("a", Some("root"), Some("Open the door")),
            ("b", Some("root"), Some("Look around")),
            ("aa", Some("a"), Some("Climb the stairs")),
        ])
    }

    #[test]
    fn path_runs_from_root_to_current() {
        let mut story = branching();
        story.current_node_id = "aa".into();

        let ids: Vec<&str> = project_path(&story)
            .unwrap()
            .iter()
            .map(|n| n.id.0.as_str())
            .collect();
        assert_eq!(ids, vec!["root", "a", "aa"]);
    }

    #[test]
    fn path_length_is_depth_plus_one_for_every_node() {
        let mut story = branching();
        for (id, depth) in [("root", 0), ("a", 1), ("b", 1), ("aa", 2)] {
            story.current_node_id = id.into();
            let path = project_path(&story).unwrap();
            assert_eq!(path.len(), depth + 1);
            assert_eq!(path.first().unwrap().id, story.root_node_id);
            assert_eq!(path.last().unwrap().id, NodeId::from(id));
        }
    }

    #[test]
    fn dangling_parent_is_broken_chain() {
        let mut story = branching();
        story.nodes.get_mut(&NodeId::from("a")).unwrap().parent_id = Some("ghost".into());
        story.current_node_id = "aa".into();

        match project_path(&story) {
            Err(StoryError::BrokenChain(at)) => assert_eq!(at, NodeId::from("a")),
            other => panic!("expected BrokenChain, got {other:?}"),
        }
    }

    #[test]
    fn cycle_is_broken_chain_not_a_hang() {
        let mut story = branching();
        story.nodes.get_mut(&NodeId::from("a")).unwrap().parent_id = Some("aa".into());
        story.current_node_id = "aa".into();

        assert!(matches!(
            project_path(&story),
            Err(StoryError::BrokenChain(_))
        ));
    }

    #[test]
    fn sound_tree_passes_the_check() {
        let mut story = branching();
        story.current_node_id = "aa".into();
        assert!(check_tree(&story).is_ok());
    }

    #[test]
    fn root_with_a_parent_fails_the_check() {
        let mut story = branching();
        story.nodes.get_mut(&NodeId::from("root")).unwrap().parent_id = Some("a".into());

        match check_tree(&story) {
            Err(StoryError::BrokenChain(at)) => assert_eq!(at, NodeId::from("root")),
            other => panic!("expected BrokenChain, got {other:?}"),
        }
    }

    #[test]
    fn detached_branch_fails_the_check() {
        let mut story = branching();
        // The current node is fine, but "b" no longer reaches the root.
        story.nodes.get_mut(&NodeId::from("b")).unwrap().parent_id = Some("ghost".into());
        assert!(matches!(check_tree(&story), Err(StoryError::BrokenChain(_))));

        let mut story = branching();
        story.current_node_id = "ghost".into();
        assert!(matches!(check_tree(&story), Err(StoryError::BrokenChain(_))));
    }

    #[test]
    fn transcript_prefixes_choices() {
        let mut story = branching();
        story.current_node_id = "a".into();
        let path = project_path(&story).unwrap();

        assert_eq!(
            transcript(&path),
            vec![
                "text of root".to_string(),
                "> Open the door\ntext of a".to_string()
            ]
        );
    }
}
