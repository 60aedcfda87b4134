pub mod http;
#[cfg(feature = "llama")]
pub mod llama;

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::story::history::{project_path, transcript};
use crate::story::{Story, StoryMeta};

// ---------------------------------------------------------------------------
// Generation results
// ---------------------------------------------------------------------------

/// New narrative text and the actions offered after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub text: String,
    pub choices: Vec<String>,
}

/// Closing text for a finished story.
#[derive(Debug, Clone, PartialEq)]
pub struct Conclusion {
    pub text: String,
    pub title: Option<String>,
    pub summary: Option<String>,
}

/// The text generation collaborator. Any call may fail.
pub trait Generator: Send + Sync {
    /// Opening scene for a new story.
    fn open(&self, meta: &StoryMeta) -> Result<Continuation>;
    /// What happens when the reader takes `choice` at the story's current node.
    fn continue_story(&self, story: &Story, choice: &str) -> Result<Continuation>;
    /// Ending for the story, given the transcript from root to current node.
    fn conclude(&self, story: &Story, history: &[String]) -> Result<Conclusion>;
}

// ---------------------------------------------------------------------------
// Chat message helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

impl std::fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.role, self.content)
    }
}

/// Anything that turns a chat transcript into a reply.
pub trait ChatBackend: Send + Sync {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Prompt construction
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "\
You are a storyteller writing an interactive branching story together with a reader. \
Write vivid second-person prose of two or three short paragraphs. \
Never decide for the reader; end each part at a moment of choice.";

const CONTINUE_FORMAT: &str = "\
Reply with JSON only: {\"story\": \"<the next part>\", \"choices\": [\"<option>\", \"<option>\", \"<option>\"]}. \
Offer two to four short options. JSON must be valid.";

const CONCLUDE_FORMAT: &str = "\
Reply with JSON only: {\"ending\": \"<the final part>\", \"title\": \"<a fitting title>\", \"summary\": \"<one or two sentences>\"}. \
JSON must be valid.";

fn describe_setting(meta: &StoryMeta) -> String {
    let mut s = format!("Title: {}\nGenre: {}\n", meta.title, meta.genre);
    if !meta.characters.is_empty() {
        s.push_str("Characters:\n");
        for c in &meta.characters {
            s.push_str(&format!("- {}: {}\n", c.name, c.description));
        }
    }
    s
}

fn build_open_messages(meta: &StoryMeta) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!("{SYSTEM_PROMPT}\n\n{}", describe_setting(meta))),
        ChatMessage::user(format!("Write the opening of the story.\n{CONTINUE_FORMAT}")),
    ]
}

fn build_continue_messages(story: &Story, choice: &str) -> Result<Vec<ChatMessage>> {
    let path = project_path(story).context("cannot build prompt from a broken story")?;
    let so_far = transcript(&path).join("\n\n");
    Ok(vec![
        ChatMessage::system(format!("{SYSTEM_PROMPT}\n\n{}", describe_setting(&story.meta))),
        ChatMessage::user(format!(
            "The story so far:\n\n{so_far}\n\nThe reader chooses: {choice}\n\n\
             Write what happens next.\n{CONTINUE_FORMAT}"
        )),
    ])
}

fn build_conclude_messages(story: &Story, history: &[String]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!("{SYSTEM_PROMPT}\n\n{}", describe_setting(&story.meta))),
        ChatMessage::user(format!(
            "The story so far:\n\n{}\n\nBring the story to a satisfying end.\n{CONCLUDE_FORMAT}",
            history.join("\n\n")
        )),
    ]
}

// ---------------------------------------------------------------------------
// Prompted generator
// ---------------------------------------------------------------------------

/// A `Generator` that prompts a chat model and parses its JSON reply.
pub struct PromptGenerator<B> {
    backend: B,
}

impl<B: ChatBackend> PromptGenerator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    fn ask(&self, messages: &[ChatMessage]) -> Result<String> {
        debug!(
            "Prompt ({} messages):\n{}",
            messages.len(),
            messages
                .iter()
                .enumerate()
                .map(|(i, m)| format!("  msg[{i}] {m}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        self.backend.chat(messages)
    }
}

impl<B: ChatBackend> Generator for PromptGenerator<B> {
    fn open(&self, meta: &StoryMeta) -> Result<Continuation> {
        let raw = self.ask(&build_open_messages(meta))?;
        parse_continuation(&raw)
    }

    fn continue_story(&self, story: &Story, choice: &str) -> Result<Continuation> {
        info!("Generating continuation for \"{choice}\" in story {}", story.id);
        let raw = self.ask(&build_continue_messages(story, choice)?)?;
        parse_continuation(&raw)
    }

    fn conclude(&self, story: &Story, history: &[String]) -> Result<Conclusion> {
        info!("Generating ending for story {}", story.id);
        let raw = self.ask(&build_conclude_messages(story, history))?;
        parse_conclusion(&raw)
    }
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("valid think regex"));
static JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{[^{}]*\}").expect("valid json regex"));

#[derive(Debug, Deserialize)]
struct RawContinuation {
    story: String,
    #[serde(default)]
    choices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawConclusion {
    ending: String,
    title: Option<String>,
    summary: Option<String>,
}

/// Strip `<think>` blocks and return the first flat JSON object in `raw`.
fn extract_json(raw: &str) -> Result<String> {
    for cap in THINK_RE.captures_iter(raw) {
        let thought = cap.get(1).map_or("", |m| m.as_str()).trim();
        if !thought.is_empty() {
            debug!("Model thinking:\n{thought}");
        }
    }

    let cleaned = THINK_RE.replace_all(raw, "");
    let json = JSON_RE
        .find(&cleaned)
        .map(|m| m.as_str().to_string())
        .with_context(|| format!("no JSON object found in model output. Raw output:\n{raw}"))?;
    debug!("Extracted JSON: {json}");
    Ok(json)
}

pub fn parse_continuation(raw: &str) -> Result<Continuation> {
    let json = extract_json(raw)?;
    let parsed: RawContinuation =
        serde_json::from_str(&json).with_context(|| format!("failed to parse JSON: {json}"))?;

    let text = parsed.story.trim().to_string();
    if text.is_empty() {
        warn!("Model returned an empty story part");
        bail!("model returned an empty story part");
    }

    Ok(Continuation {
        text,
        choices: clean_choices(parsed.choices),
    })
}

pub fn parse_conclusion(raw: &str) -> Result<Conclusion> {
    let json = extract_json(raw)?;
    let parsed: RawConclusion =
        serde_json::from_str(&json).with_context(|| format!("failed to parse JSON: {json}"))?;

    let text = parsed.ending.trim().to_string();
    if text.is_empty() {
        warn!("Model returned an empty ending");
        bail!("model returned an empty ending");
    }

    Ok(Conclusion {
        text,
        title: non_blank(parsed.title),
        summary: non_blank(parsed.summary),
    })
}

/// Trim, drop blanks, and drop repeats while keeping the offered order.
fn clean_choices(choices: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    choices
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && seen.insert(c.clone()))
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::story::fixtures::story;

    #[test]
    fn parse_continuation_clean() {
        let raw = r#"{"story": "The door creaks open.", "choices": ["Step inside", "Call out"]}"#;
        let c = parse_continuation(raw).unwrap();
        assert_eq!(c.text, "The door creaks open.");
        assert_eq!(c.choices, vec!["Step inside", "Call out"]);
    }

    #[test]
    fn parse_continuation_with_think_and_chatter() {
        let raw = r#"<think>The reader wants tension {maybe}.</think>
Sure! Here it is: {"story": "  Wind howls.  ", "choices": [" Run ", "", "Run", "Hide"]} Enjoy."#;
        let c = parse_continuation(raw).unwrap();
        assert_eq!(c.text, "Wind howls.");
        assert_eq!(c.choices, vec!["Run", "Hide"]);
    }

    #[test]
    fn parse_continuation_allows_dead_ends() {
        let c = parse_continuation(r#"{"story": "You fall."}"#).unwrap();
        assert!(c.choices.is_empty());
    }

    #[test]
    fn parse_continuation_rejects_empty_text_and_missing_json() {
        assert!(parse_continuation(r#"{"story": "   ", "choices": ["a"]}"#).is_err());
        let err = parse_continuation("no json here").unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn parse_conclusion_drops_blank_optionals() {
        let raw = r#"{"ending": "The lamp is lit again.", "title": "  ", "summary": "A keeper returns."}"#;
        let c = parse_conclusion(raw).unwrap();
        assert_eq!(c.text, "The lamp is lit again.");
        assert_eq!(c.title, None);
        assert_eq!(c.summary.as_deref(), Some("A keeper returns."));
    }

    struct Recording {
        reply: String,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ChatBackend for Recording {
        fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn continue_prompt_carries_path_and_choice() {
        let mut story = story(&[
            ("root", None, None),
            ("a", Some("root"), Some("Open the door")),
        ]);
        story.current_node_id = "a".into();
        let generator = PromptGenerator::new(Recording {
            reply: r#"{"story": "Stairs.", "choices": ["Climb"]}"#.into(),
            seen: Mutex::new(Vec::new()),
        });

        let c = generator.continue_story(&story, "Climb the stairs").unwrap();
        assert_eq!(c.choices, vec!["Climb"]);

        let seen = generator.backend.seen.lock().unwrap();
        let prompt = &seen[0][1].content;
        assert!(prompt.contains("text of root"));
        assert!(prompt.contains("> Open the door\ntext of a"));
        assert!(prompt.contains("The reader chooses: Climb the stairs"));
        assert!(seen[0][0].content.contains("Genre: Mystery"));
    }
}
