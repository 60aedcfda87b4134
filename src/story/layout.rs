//! Tree drawing: every node gets a horizontal band proportional to the number
//! of leaves below it, so sibling subtrees never overlap and each parent sits
//! centred over its children.

use std::collections::{BTreeMap, HashMap};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::story::{NodeId, Story, StoryNode};

/// Node box size and the gaps between boxes, in renderer units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub node_width: f64,
    pub node_height: f64,
    pub h_gap: f64,
    pub v_gap: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            node_width: 150.0,
            node_height: 70.0,
            h_gap: 30.0,
            v_gap: 50.0,
        }
    }
}

impl LayoutConfig {
    fn slot_width(&self) -> f64 {
        self.node_width + self.h_gap
    }

    fn row_height(&self) -> f64 {
        self.node_height + self.v_gap
    }
}

/// Anchor of a node: `x` is the horizontal centre, `y` the top edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub from_pos: Point,
    pub to_pos: Point,
}

/// A cubic Bézier connector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CubicCurve {
    pub start: Point,
    pub control1: Point,
    pub control2: Point,
    pub end: Point,
}

impl Edge {
    /// Connector from the bottom centre of the parent box to the top centre
    /// of the child box, bending halfway through the vertical gap.
    pub fn curve(&self, config: &LayoutConfig) -> CubicCurve {
        let start = Point {
            x: self.from_pos.x,
            y: self.from_pos.y + config.node_height,
        };
        let end = self.to_pos;
        CubicCurve {
            start,
            control1: Point {
                x: start.x,
                y: start.y + config.v_gap / 2.0,
            },
            control2: Point {
                x: end.x,
                y: end.y - config.v_gap / 2.0,
            },
            end,
        }
    }
}

impl CubicCurve {
    /// SVG path data for this curve.
    pub fn svg_path(&self) -> String {
        format!(
            "M {} {} C {} {}, {} {}, {} {}",
            self.start.x,
            self.start.y,
            self.control1.x,
            self.control1.y,
            self.control2.x,
            self.control2.y,
            self.end.x,
            self.end.y
        )
    }
}

/// Bounding box of the placed nodes, widened by one node box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub positions: BTreeMap<NodeId, Point>,
    pub edges: Vec<Edge>,
    pub bounds: Bounds,
}

/// Compute positions, edges, and bounds for the whole story tree.
///
/// The result depends only on the tree's topology and the offered-choice
/// order of each node, so it is recomputed from scratch after every change.
pub fn layout(story: &Story, config: &LayoutConfig) -> Layout {
    let adjacency = story.adjacency();
    let mut positions = BTreeMap::new();
    let mut edges = Vec::new();

    if let Some(root) = story.root() {
        let mut spans = HashMap::new();
        let root_span = subtree_span(root, &adjacency, &mut spans);

        // The root band is centred on x = 0.
        let mut placer = Placer {
            adjacency: &adjacency,
            spans: &spans,
            config,
            positions: &mut positions,
            edges: &mut edges,
        };
        placer.place(root, 0, -(root_span as f64) / 2.0);
    }

    if positions.len() < story.nodes.len() {
        warn!(
            "Layout of story {} skipped {} node(s) unreachable from the root",
            story.id,
            story.nodes.len() - positions.len()
        );
    }

    let bounds = bounds_of(&positions, config);
    Layout {
        positions,
        edges,
        bounds,
    }
}

/// Number of leaf slots the subtree under `node` needs. Memoised in `spans`.
/// A node met a second time (a parent link looping back) counts as nothing.
fn subtree_span<'a>(
    node: &'a StoryNode,
    adjacency: &HashMap<&'a NodeId, Vec<&'a StoryNode>>,
    spans: &mut HashMap<&'a NodeId, usize>,
) -> usize {
    if spans.contains_key(&node.id) {
        return 0;
    }
    spans.insert(&node.id, 1);
    let span = match adjacency.get(&node.id) {
        None => 1,
        Some(children) => children
            .iter()
            .map(|child| subtree_span(*child, adjacency, spans))
            .sum::<usize>()
            .max(1),
    };
    spans.insert(&node.id, span);
    span
}

struct Placer<'a, 'b> {
    adjacency: &'b HashMap<&'a NodeId, Vec<&'a StoryNode>>,
    spans: &'b HashMap<&'a NodeId, usize>,
    config: &'b LayoutConfig,
    positions: &'b mut BTreeMap<NodeId, Point>,
    edges: &'b mut Vec<Edge>,
}

impl<'a, 'b> Placer<'a, 'b> {
    /// Place `node` centred in the band starting at `band_left` (in slot units)
    /// and lay its children out left to right inside that band.
    fn place(&mut self, node: &'a StoryNode, depth: usize, band_left: f64) -> Point {
        let span = self.span(&node.id);
        let pos = Point {
            x: (band_left + span / 2.0) * self.config.slot_width(),
            y: depth as f64 * self.config.row_height(),
        };
        self.positions.insert(node.id.clone(), pos);

        let adjacency = self.adjacency;
        let mut cursor = band_left;
        if let Some(children) = adjacency.get(&node.id) {
            for child in children {
                if self.positions.contains_key(&child.id) {
                    warn!("Layout found a parent link looping back to {}", child.id);
                    continue;
                }
                let child_pos = self.place(*child, depth + 1, cursor);
                self.edges.push(Edge {
                    from: node.id.clone(),
                    to: child.id.clone(),
                    from_pos: pos,
                    to_pos: child_pos,
                });
                cursor += self.span(&child.id);
            }
        }
        pos
    }

    fn span(&self, id: &NodeId) -> f64 {
        self.spans.get(id).copied().unwrap_or(1) as f64
    }
}

fn bounds_of(positions: &BTreeMap<NodeId, Point>, config: &LayoutConfig) -> Bounds {
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for pos in positions.values() {
        min_x = min_x.min(pos.x);
        max_x = max_x.max(pos.x);
        max_y = max_y.max(pos.y);
    }
    if positions.is_empty() {
        return Bounds {
            min_x: 0.0,
            width: 0.0,
            height: 0.0,
        };
    }
    Bounds {
        min_x,
        width: max_x - min_x + config.node_width,
        height: max_y + config.node_height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::fixtures::story;

    fn cfg() -> LayoutConfig {
        LayoutConfig::default()
    }

    fn pos(layout: &Layout, id: &str) -> Point {
        layout.positions[&NodeId::from(id)]
    }

    fn sample() -> Story {
        story(&[
            ("root", None, None),
            ("a", Some("root"), Some("Open the door")),
            ("b", Some("root"), Some("Look around")),
            ("a1", Some("a"), Some("Go upstairs")),
            ("a2", Some("a"), Some("Go downstairs")),
            ("a3", Some("a"), Some("Wait")),
            ("b1", Some("b"), Some("Search the desk")),
            ("a11", Some("a1"), Some("Knock")),
        ])
    }

    #[test]
    fn root_only_covers_one_slot() {
        let story = story(&[("root", None, None)]);
        let layout = layout(&story, &cfg());

        assert_eq!(layout.positions.len(), 1);
        assert!(layout.edges.is_empty());
        assert_eq!(pos(&layout, "root"), Point { x: 0.0, y: 0.0 });
        assert_eq!(layout.bounds.width, cfg().node_width);
        assert_eq!(layout.bounds.height, cfg().node_height);
    }

    #[test]
    fn single_chain_is_a_vertical_line() {
        let story = story(&[
            ("root", None, None),
            ("1", Some("root"), Some("on")),
            ("2", Some("1"), Some("on")),
            ("3", Some("2"), Some("on")),
        ]);
        let layout = layout(&story, &cfg());

        for (depth, id) in ["root", "1", "2", "3"].iter().enumerate() {
            let p = pos(&layout, id);
            assert_eq!(p.x, 0.0);
            assert_eq!(p.y, depth as f64 * 120.0);
        }
        assert_eq!(layout.bounds.width, 150.0);
        assert_eq!(layout.bounds.height, 3.0 * 120.0 + 70.0);
    }

    #[test]
    fn root_is_centred_at_origin() {
        let layout = layout(&sample(), &cfg());
        assert_eq!(pos(&layout, "root").x, 0.0);
    }

    #[test]
    fn parents_are_centred_over_their_band() {
        let layout = layout(&sample(), &cfg());
        // spans: a = 3, b = 1, root = 4; slot = 180
        assert_eq!(pos(&layout, "a").x, -0.5 * 180.0);
        assert_eq!(pos(&layout, "b").x, 1.5 * 180.0);
        assert_eq!(pos(&layout, "a1").x, -1.5 * 180.0);
        assert_eq!(pos(&layout, "a2").x, -0.5 * 180.0);
        assert_eq!(pos(&layout, "a3").x, 0.5 * 180.0);
        assert_eq!(pos(&layout, "a11").x, pos(&layout, "a1").x);
    }

    #[test]
    fn every_node_gets_a_unique_anchor() {
        let layout = layout(&sample(), &cfg());
        let mut seen: Vec<(i64, i64)> = layout
            .positions
            .values()
            .map(|p| (p.x as i64, p.y as i64))
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), sample().nodes.len());
    }

    #[test]
    fn nodes_on_a_row_are_at_least_one_slot_apart() {
        let layout = layout(&sample(), &cfg());
        let mut rows: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for p in layout.positions.values() {
            rows.entry(p.y as i64).or_default().push(p.x);
        }
        for xs in rows.values_mut() {
            xs.sort_by(f64::total_cmp);
            for pair in xs.windows(2) {
                assert!(pair[1] - pair[0] >= 180.0);
            }
        }
    }

    #[test]
    fn one_edge_per_non_root_node() {
        let story = sample();
        let layout = layout(&story, &cfg());

        assert_eq!(layout.edges.len(), story.nodes.len() - 1);
        for edge in &layout.edges {
            let child = &story.nodes[&edge.to];
            assert_eq!(child.parent_id.as_ref(), Some(&edge.from));
            assert_eq!(edge.from_pos, layout.positions[&edge.from]);
            assert_eq!(edge.to_pos, layout.positions[&edge.to]);
        }
    }

    #[test]
    fn layout_is_deterministic() {
        let first = layout(&sample(), &cfg());
        for _ in 0..5 {
            assert_eq!(layout(&sample(), &cfg()), first);
        }
    }

    #[test]
    fn unreachable_nodes_are_left_out() {
        let mut story = sample();
        story
            .nodes
            .get_mut(&NodeId::from("b1"))
            .unwrap()
            .parent_id = Some("ghost".into());
        let layout = layout(&story, &cfg());

        assert!(!layout.positions.contains_key(&NodeId::from("b1")));
        assert_eq!(layout.edges.len(), layout.positions.len() - 1);
    }

    #[test]
    fn curve_bends_through_the_gap() {
        let layout = layout(&sample(), &cfg());
        let edge = layout
            .edges
            .iter()
            .find(|e| e.to == NodeId::from("b"))
            .unwrap();
        let curve = edge.curve(&cfg());

        assert_eq!(curve.start, Point { x: 0.0, y: 70.0 });
        assert_eq!(curve.control1, Point { x: 0.0, y: 95.0 });
        assert_eq!(curve.control2, Point { x: 270.0, y: 95.0 });
        assert_eq!(curve.end, Point { x: 270.0, y: 120.0 });
        assert_eq!(curve.svg_path(), "M 0 70 C 0 95, 270 95, 270 120");
    }

    #[test]
    fn looping_parent_links_do_not_recurse_forever() {
        let mut story = sample();
        story.nodes.get_mut(&NodeId::from("root")).unwrap().parent_id = Some("a".into());
        let layout = layout(&story, &cfg());

        assert_eq!(layout.positions.len(), story.nodes.len());
        assert_eq!(pos(&layout, "root"), Point { x: 0.0, y: 0.0 });
        assert!(layout.edges.iter().all(|e| e.to != NodeId::from("root")));
        assert_eq!(layout.edges.len(), story.nodes.len() - 1);
    }
}
