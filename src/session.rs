use std::io::{self, BufRead, Write};

use anyhow::Result;
use log::{info, warn};

use crate::error::StoryError;
use crate::story::history::project_path;
use crate::story::layout::{layout, LayoutConfig};
use crate::story::navigator::{Navigator, Resolution};
use crate::story::{Character, NodeId, Story, StoryId, StoryMeta};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One line of reader input while a story is open.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    /// Take the n-th offered choice (1-based).
    Choose(usize),
    /// Take a free-form action.
    Act(String),
    Back,
    Root,
    Jump(String),
    Map,
    /// Write the map as an SVG file.
    Export(String),
    End,
    Help,
    Leave,
}

fn parse_command(input: &str) -> Option<Command> {
    let input = input.trim();
    if let Ok(n) = input.parse::<usize>() {
        return Some(Command::Choose(n));
    }
    if let Some(action) = input.strip_prefix('>') {
        let action = action.trim();
        return (!action.is_empty()).then(|| Command::Act(action.to_string()));
    }
    let (word, rest) = input
        .split_once(char::is_whitespace)
        .map_or((input, ""), |(w, r)| (w, r.trim()));
    match word.to_lowercase().as_str() {
        "b" | "back" => Some(Command::Back),
        "r" | "root" => Some(Command::Root),
        "j" | "jump" if !rest.is_empty() => Some(Command::Jump(rest.to_string())),
        "m" | "map" => Some(Command::Map),
        "x" | "export" if !rest.is_empty() => Some(Command::Export(rest.to_string())),
        "e" | "end" => Some(Command::End),
        "h" | "help" | "?" => Some(Command::Help),
        "q" | "quit" | "exit" => Some(Command::Leave),
        _ => None,
    }
}

/// Resolve a node-id prefix, as shown on the map, to a single node.
fn resolve_prefix(story: &Story, prefix: &str) -> Option<NodeId> {
    let mut matches = story.nodes.keys().filter(|id| id.0.starts_with(prefix));
    let first = matches.next()?.clone();
    matches.next().is_none().then_some(first)
}

fn short(id: &NodeId) -> &str {
    id.0.get(..8).unwrap_or(&id.0)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn show_story(story: &Story) {
    println!("\n========================================");
    println!("  {}", story.meta.title);
    println!("  Genre: {}", story.meta.genre);
    for c in &story.meta.characters {
        println!("  {} - {}", c.name, c.description);
    }
    println!("========================================");

    match project_path(story) {
        Ok(path) => {
            for node in path {
                if let Some(choice) = &node.choice_label {
                    println!("\n  > {choice}");
                }
                println!("\n{}", node.text);
            }
        }
        Err(e) => println!("\n(The story is damaged: {e})"),
    }

    if let Some(closing) = &story.closing {
        println!("\n--- THE END ---\n{}", closing.text);
        if let Some(title) = &closing.title {
            println!("\n  Final title: {title}");
        }
        if let Some(summary) = &closing.summary {
            println!("  Summary: {summary}");
        }
    }
}

fn show_choices(story: &Story) {
    let Some(node) = story.current_node() else {
        return;
    };
    if node.is_terminal() {
        println!("\n(A dead end. Go [b]ack, to the [r]oot, or [e]nd the story.)");
        return;
    }
    println!("\nWhat do you do next?");
    for (i, choice) in node.candidate_choices.iter().enumerate() {
        let explored = if story.find_child(&node.id, choice).is_some() {
            " (explored)"
        } else {
            ""
        };
        println!("  [{}] {choice}{explored}", i + 1);
    }
}

fn show_map(story: &Story, config: &LayoutConfig) {
    let map = layout(story, config);
    let slot = config.node_width + config.h_gap;
    let row = config.node_height + config.v_gap;

    println!(
        "\n--- Narrative map: {} parts, {} branches, {:.0} x {:.0} ---",
        story.parts_explored(),
        map.edges.len(),
        map.bounds.width,
        map.bounds.height
    );

    let mut placed: Vec<(&NodeId, f64, f64)> =
        map.positions.iter().map(|(id, p)| (id, p.x, p.y)).collect();
    placed.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.1.total_cmp(&b.1)));

    let mut last_depth = None;
    for (id, x, y) in placed {
        let depth = (y / row).round() as usize;
        if last_depth != Some(depth) {
            println!("\n  Depth {depth}");
            last_depth = Some(depth);
        }
        let label = story
            .get(id)
            .and_then(|n| n.choice_label.as_deref())
            .unwrap_or("The Beginning");
        let marker = if *id == story.current_node_id { "*" } else { " " };
        // Column in slots from the left edge of the map.
        let column = ((x - map.bounds.min_x) / slot).round() as usize;
        println!(
            "{marker} {:indent$}[{}] {label}",
            "",
            short(id),
            indent = column * 2
        );
    }
    println!("\n  (* = you are here; [j]ump <id> to revisit a part)");
}

/// The map as a standalone SVG document: boxes labelled with their choice and
/// curved connectors, with the view box framing the whole tree.
fn render_svg(story: &Story, config: &LayoutConfig) -> String {
    let map = layout(story, config);
    let dx = -map.bounds.min_x + config.node_width / 2.0;
    let mut svg = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"{vx} 0 {w} {h}\">\n",
        w = map.bounds.width,
        h = map.bounds.height,
        vx = -dx,
    );
    for edge in &map.edges {
        svg.push_str(&format!(
            "  <path d=\"{}\" fill=\"none\" stroke=\"#888\" stroke-width=\"2\"/>\n",
            edge.curve(config).svg_path()
        ));
    }
    for (id, pos) in &map.positions {
        let label = story
            .get(id)
            .and_then(|n| n.choice_label.as_deref())
            .unwrap_or("The Beginning");
        let fill = if *id == story.current_node_id { "#6d5bd0" } else { "#f4f1ea" };
        svg.push_str(&format!(
            "  <rect x=\"{}\" y=\"{}\" width=\"{}\" height=\"{}\" rx=\"8\" fill=\"{fill}\" stroke=\"#444\"/>\n",
            pos.x - config.node_width / 2.0,
            pos.y,
            config.node_width,
            config.node_height
        ));
        svg.push_str(&format!(
            "  <text x=\"{}\" y=\"{}\" font-size=\"12\" text-anchor=\"middle\">{}</text>\n",
            pos.x,
            pos.y + config.node_height / 2.0,
            escape_xml(label)
        ));
    }
    svg.push_str("</svg>\n");
    svg
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn show_help() {
    println!(
        "\n  <n>        take choice n\n  > <text>   take your own action\n  b          back one step\n  r          back to the beginning\n  j <id>     jump to a part shown on the map\n  m          show the narrative map\n  x <file>   export the map as SVG\n  e          end the story\n  q          back to the library"
    );
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

fn read_line(prompt: &str) -> Result<Option<String>> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut input = String::new();
    if io::stdin().lock().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim().to_string()))
}

// ---------------------------------------------------------------------------
// Story loop
// ---------------------------------------------------------------------------

/// Applies one command. Returns `false` when the reader leaves the story.
fn apply(nav: &Navigator, config: &LayoutConfig, story_id: &StoryId, cmd: Command) -> Result<bool> {
    let story = nav.store().get_story(story_id)?;
    let outcome = match cmd {
        Command::Leave => return Ok(false),
        Command::Help => {
            show_help();
            return Ok(true);
        }
        Command::Map => {
            show_map(&story, config);
            return Ok(true);
        }
        Command::Export(path) => {
            match std::fs::write(&path, render_svg(&story, config)) {
                Ok(()) => println!("  (Map written to {path}.)"),
                Err(e) => println!("  (Could not write {path}: {e})"),
            }
            return Ok(true);
        }
        Command::Choose(n) => {
            let choice = story
                .current_node()
                .and_then(|node| n.checked_sub(1).and_then(|i| node.candidate_choices.get(i)))
                .cloned();
            match choice {
                Some(label) => choose(nav, story_id, &label),
                None => {
                    println!("  (No choice number {n}.)");
                    return Ok(true);
                }
            }
        }
        Command::Act(action) => choose(nav, story_id, &action),
        Command::Back => match story.current_node().and_then(|n| n.parent_id.clone()) {
            Some(parent) => nav.store().set_current_node(story_id, &parent).map(|_| ()),
            None => {
                println!("  (You are already at the beginning.)");
                return Ok(true);
            }
        },
        Command::Root => nav
            .store()
            .set_current_node(story_id, &story.root_node_id)
            .map(|_| ()),
        Command::Jump(prefix) => match resolve_prefix(&story, &prefix) {
            Some(id) => nav.store().set_current_node(story_id, &id).map(|_| ()),
            None => {
                println!("  (No single part matches '{prefix}'.)");
                return Ok(true);
            }
        },
        Command::End => {
            println!("\n(Writing the ending...)");
            nav.end_story(story_id).map(|_| ())
        }
    };

    match outcome {
        Ok(()) => {
            let story = nav.store().get_story(story_id)?;
            show_story(&story);
            show_choices(&story);
        }
        Err(e) => report(e)?,
    }
    Ok(true)
}

fn choose(nav: &Navigator, story_id: &StoryId, label: &str) -> Result<(), StoryError> {
    println!("\n(Thinking...)");
    let resolution = nav.choose(story_id, label)?;
    if let Resolution::Replayed(_) = resolution {
        println!("(You have been here before.)");
    }
    info!("Reader is now at {}", resolution.node_id());
    Ok(())
}

/// Explain recoverable failures to the reader; anything else ends the session.
fn report(err: StoryError) -> Result<()> {
    match err {
        StoryError::GenerationFailed(e) => {
            warn!("Generation failed: {e:#}");
            println!("\n  An unexpected twist! The story could not proceed. Try again or pick another path.");
        }
        StoryError::TooShort { len, min } => {
            println!("\n  The story is only {len} parts long; explore at least {min} before ending it.");
        }
        StoryError::AlreadyComplete(_) => {
            println!("\n  This story has ended. You can still revisit the parts you explored.");
        }
        StoryError::Busy(_) => println!("\n  Still writing the previous part..."),
        StoryError::InvalidInput(msg) => println!("\n  {msg}"),
        other => return Err(other.into()),
    }
    Ok(())
}

fn play_story(nav: &Navigator, config: &LayoutConfig, story_id: &StoryId) -> Result<()> {
    let story = nav.store().get_story(story_id)?;
    info!("Opened story {} ({} parts)", story.id, story.parts_explored());
    show_story(&story);
    show_choices(&story);
    println!("\n  (type h for help)");

    loop {
        let Some(input) = read_line("\n[You]: ")? else {
            return Ok(());
        };
        if input.is_empty() {
            continue;
        }
        let Some(cmd) = parse_command(&input) else {
            println!("  (Unknown command. Type h for help.)");
            continue;
        };
        if !apply(nav, config, story_id, cmd)? {
            return Ok(());
        }
    }
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

fn new_story(nav: &Navigator) -> Result<Option<StoryId>> {
    let Some(title) = read_line("  Title: ")? else {
        return Ok(None);
    };
    let Some(genre) = read_line("  Genre: ")? else {
        return Ok(None);
    };
    let mut characters = Vec::new();
    println!("  Characters as 'name: description' (empty line to finish)");
    while let Some(line) = read_line("  + ")? {
        let Some((name, description)) = line.split_once(':') else {
            break;
        };
        characters.push(Character {
            name: name.trim().to_string(),
            description: description.trim().to_string(),
        });
    }

    println!("\n(Setting the scene...)");
    let meta = StoryMeta {
        title,
        genre,
        characters,
    };
    match nav.begin_story(meta) {
        Ok(story) => Ok(Some(story.id)),
        Err(e) => {
            report(e)?;
            Ok(None)
        }
    }
}

/// Run the library menu until the reader quits.
pub fn run(nav: &Navigator, config: &LayoutConfig) -> Result<()> {
    loop {
        println!("\n========================================");
        println!("          YOUR STORY LIBRARY");
        println!("========================================");

        let ids = nav.store().list_stories()?;
        let mut stories = Vec::new();
        for id in ids {
            match nav.store().get_story(&id) {
                Ok(story) => stories.push(story),
                Err(e) => warn!("Skipping story {id}: {e}"),
            }
        }
        if stories.is_empty() {
            println!("  No stories yet. Time to create one!");
        }
        for (i, story) in stories.iter().enumerate() {
            let status = if story.is_complete { ", finished" } else { "" };
            println!(
                "  [{}] {} ({}) - {} parts explored{status}",
                i + 1,
                story.meta.title,
                story.meta.genre,
                story.parts_explored()
            );
        }
        println!("\n  [n] New story    [q] Quit\n");

        let Some(input) = read_line("> ")? else {
            return Ok(());
        };
        match input.to_lowercase().as_str() {
            "q" | "quit" => {
                println!("Thanks for playing!");
                return Ok(());
            }
            "n" | "new" => {
                if let Some(id) = new_story(nav)? {
                    play_story(nav, config, &id)?;
                }
            }
            other => match other.parse::<usize>().ok().and_then(|n| stories.get(n.wrapping_sub(1))) {
                Some(story) => play_story(nav, config, &story.id)?,
                None => println!("  Pick a story number, [n] or [q]."),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::fixtures::story;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("2"), Some(Command::Choose(2)));
        assert_eq!(
            parse_command("> whistle a tune "),
            Some(Command::Act("whistle a tune".into()))
        );
        assert_eq!(parse_command(">"), None);
        assert_eq!(parse_command("B"), Some(Command::Back));
        assert_eq!(parse_command("jump 3fa8"), Some(Command::Jump("3fa8".into())));
        assert_eq!(parse_command("j"), None);
        assert_eq!(parse_command("map"), Some(Command::Map));
        assert_eq!(parse_command("x map.svg"), Some(Command::Export("map.svg".into())));
        assert_eq!(parse_command("dance"), None);
    }

    #[test]
    fn svg_has_a_box_per_node_and_a_path_per_edge() {
        let mut story = story(&[
            ("root", None, None),
            ("a", Some("root"), Some("Open <the> door")),
            ("b", Some("root"), Some("Look around")),
        ]);
        story.current_node_id = "a".into();
        let svg = render_svg(&story, &LayoutConfig::default());

        assert_eq!(svg.matches("<rect").count(), 3);
        assert_eq!(svg.matches("<path").count(), 2);
        assert!(svg.contains("Open &lt;the&gt; door"));
        assert!(svg.contains("The Beginning"));
        assert_eq!(svg.matches("#6d5bd0").count(), 1);
    }

    #[test]
    fn prefix_must_be_unambiguous() {
        let story = story(&[
            ("root", None, None),
            ("abc1", Some("root"), Some("Left")),
            ("abc2", Some("root"), Some("Right")),
        ]);
        assert_eq!(resolve_prefix(&story, "abc1"), Some(NodeId::from("abc1")));
        assert_eq!(resolve_prefix(&story, "abc"), None);
        assert_eq!(resolve_prefix(&story, "zzz"), None);
    }
}
