//! Hierarchical auto-layout and grid snapping.
//!
//! Both entry points read nodes/edges and return `update_node` position
//! patches. Nothing is mutated; the caller feeds the patches through the same
//! apply path as any other edit.
//!
//! The layered layout follows the usual Sugiyama phases: break cycles by
//! reversing DFS back edges, assign ranks by longest path, order each rank with
//! barycenter sweeps, then place fixed-size boxes rank by rank.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::models::{Edge, Node, NodeId, Position};
use crate::patch::DiagramPatch;

pub const NODE_WIDTH: f64 = 200.0;
pub const NODE_HEIGHT: f64 = 80.0;
/// Positions closer than this on both axes count as unchanged.
pub const MOVE_THRESHOLD: f64 = 1.0;
const ORDERING_SWEEPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RankDirection {
    #[default]
    #[serde(rename = "TB")]
    TopBottom,
    #[serde(rename = "BT")]
    BottomTop,
    #[serde(rename = "LR")]
    LeftRight,
    #[serde(rename = "RL")]
    RightLeft,
}

impl RankDirection {
    const fn is_horizontal(self) -> bool {
        matches!(self, RankDirection::LeftRight | RankDirection::RightLeft)
    }

    const fn is_reversed(self) -> bool {
        matches!(self, RankDirection::BottomTop | RankDirection::RightLeft)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutOptions {
    pub direction: RankDirection,
    /// Gap between neighbouring nodes of the same rank.
    pub node_separation: f64,
    /// Gap between consecutive ranks.
    pub rank_separation: f64,
    pub respect_locks: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            direction: RankDirection::TopBottom,
            node_separation: 50.0,
            rank_separation: 100.0,
            respect_locks: true,
        }
    }
}

impl LayoutOptions {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("nodeSeparation", self.node_separation),
            ("rankSeparation", self.rank_separation),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(LibError::invalid(
                    "Layout separations must be finite and non-negative",
                    anyhow!("invalid {name}: {value}"),
                ));
            }
        }
        Ok(())
    }
}

pub fn layout_patches(
    nodes: &[Node],
    edges: &[Edge],
    options: &LayoutOptions,
) -> Result<Vec<DiagramPatch>> {
    options.validate()?;

    let participants: Vec<&Node> = nodes
        .iter()
        .filter(|node| !(options.respect_locks && node.is_locked()))
        .collect();
    if participants.is_empty() {
        return Ok(Vec::new());
    }

    let graph = LayeredGraph::new(&participants, edges);
    let ranks = graph.ranks();
    let ordering = graph.order(&ranks);
    let computed = place(&ordering, options);

    let offset = anchor_offset(&participants, &computed);
    let mut patches = Vec::new();
    for (index, node) in participants.iter().enumerate() {
        let target = Position::new(computed[index].x + offset.x, computed[index].y + offset.y);
        if !target.is_valid() {
            tracing::warn!(
                node_id = %node.id,
                x = target.x,
                y = target.y,
                "layout target is out of range; leaving node in place"
            );
            continue;
        }
        if has_moved(node.position, target) {
            patches.push(DiagramPatch::move_node(node.id.clone(), target));
        }
    }

    tracing::debug!(
        participants = participants.len(),
        moved = patches.len(),
        "computed layered layout"
    );
    Ok(patches)
}

pub fn snap_to_grid(
    nodes: &[Node],
    grid_size: f64,
    respect_locks: bool,
) -> Result<Vec<DiagramPatch>> {
    if !grid_size.is_finite() || grid_size <= 0.0 {
        return Err(LibError::invalid(
            "Grid size must be a positive number",
            anyhow!("invalid grid size {grid_size}"),
        ));
    }

    Ok(nodes
        .iter()
        .filter(|node| !(respect_locks && node.is_locked()))
        .filter(|node| node.position.is_valid())
        .filter_map(|node| {
            let snapped = Position::new(
                (node.position.x / grid_size).round() * grid_size,
                (node.position.y / grid_size).round() * grid_size,
            );
            (snapped.is_valid() && has_moved(node.position, snapped))
                .then(|| DiagramPatch::move_node(node.id.clone(), snapped))
        })
        .collect())
}

/// Moved when either axis differs by more than [`MOVE_THRESHOLD`]. A non-finite
/// current coordinate always counts as moved.
pub fn has_moved(current: Position, next: Position) -> bool {
    let within = |a: f64, b: f64| (a - b).abs() <= MOVE_THRESHOLD;
    !(within(current.x, next.x) && within(current.y, next.y))
}

/// Participants indexed by input order, with edges reduced to a DAG.
struct LayeredGraph {
    size: usize,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl LayeredGraph {
    fn new(participants: &[&Node], edges: &[Edge]) -> Self {
        let index: HashMap<&NodeId, usize> = participants
            .iter()
            .enumerate()
            .map(|(idx, node)| (&node.id, idx))
            .collect();

        let size = participants.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); size];
        let mut seen = HashSet::new();
        for edge in edges {
            // Edges touching a locked (or unknown) node are not part of the layout graph.
            let (Some(&from), Some(&to)) = (index.get(&edge.source), index.get(&edge.target))
            else {
                continue;
            };
            if from != to && seen.insert((from, to)) {
                adjacency[from].push(to);
            }
        }

        let back_edges = back_edges(&adjacency);
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); size];
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); size];
        let mut dag_edges = HashSet::new();
        for (from, targets) in adjacency.iter().enumerate() {
            for &to in targets {
                let (from, to) = if back_edges.contains(&(from, to)) {
                    (to, from)
                } else {
                    (from, to)
                };
                if dag_edges.insert((from, to)) {
                    successors[from].push(to);
                    predecessors[to].push(from);
                }
            }
        }

        Self {
            size,
            successors,
            predecessors,
        }
    }

    /// Longest-path ranking over a topological order.
    fn ranks(&self) -> Vec<usize> {
        let mut indegree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.size).filter(|&n| indegree[n] == 0).collect();
        let mut ranks = vec![0usize; self.size];

        while let Some(node) = queue.pop_front() {
            for &child in &self.successors[node] {
                ranks[child] = ranks[child].max(ranks[node] + 1);
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        ranks
    }

    /// Groups nodes per rank and reduces crossings with barycenter sweeps.
    fn order(&self, ranks: &[usize]) -> Vec<Vec<usize>> {
        let rank_count = ranks.iter().copied().max().map_or(0, |max| max + 1);
        let mut layers: Vec<Vec<usize>> = vec![Vec::new(); rank_count];
        for node in 0..self.size {
            layers[ranks[node]].push(node);
        }

        let mut slot = vec![0usize; self.size];
        reindex(&layers, &mut slot);

        for _ in 0..ORDERING_SWEEPS {
            for rank in 1..layers.len() {
                sort_by_barycenter(&mut layers[rank], &self.predecessors, &slot);
                reindex(&layers[rank..=rank], &mut slot);
            }
            for rank in (0..layers.len().saturating_sub(1)).rev() {
                sort_by_barycenter(&mut layers[rank], &self.successors, &slot);
                reindex(&layers[rank..=rank], &mut slot);
            }
        }

        layers
    }
}

fn back_edges(adjacency: &[Vec<usize>]) -> HashSet<(usize, usize)> {
    let size = adjacency.len();
    let mut visited = vec![false; size];
    let mut on_stack = vec![false; size];
    let mut back = HashSet::new();

    for root in 0..size {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        on_stack[root] = true;
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some((node, next_child)) = stack.last_mut() {
            let node = *node;
            let Some(&child) = adjacency[node].get(*next_child) else {
                on_stack[node] = false;
                stack.pop();
                continue;
            };
            *next_child += 1;
            if on_stack[child] {
                back.insert((node, child));
            } else if !visited[child] {
                visited[child] = true;
                on_stack[child] = true;
                stack.push((child, 0));
            }
        }
    }

    back
}

fn reindex(layers: &[Vec<usize>], slot: &mut [usize]) {
    for layer in layers {
        for (position, &node) in layer.iter().enumerate() {
            slot[node] = position;
        }
    }
}

fn sort_by_barycenter(layer: &mut [usize], neighbours: &[Vec<usize>], slot: &[usize]) {
    let barycenter = |node: usize| -> f64 {
        let linked = &neighbours[node];
        if linked.is_empty() {
            slot[node] as f64
        } else {
            linked.iter().map(|&n| slot[n] as f64).sum::<f64>() / linked.len() as f64
        }
    };
    let mut keyed: Vec<(f64, usize, usize)> = layer
        .iter()
        .map(|&node| (barycenter(node), slot[node], node))
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    for (target, (_, _, node)) in layer.iter_mut().zip(keyed) {
        *target = node;
    }
}

/// Top-left positions indexed like the participants, before anchoring.
fn place(layers: &[Vec<usize>], options: &LayoutOptions) -> Vec<Position> {
    let horizontal = options.direction.is_horizontal();
    let (rank_extent, cross_extent) = if horizontal {
        (NODE_WIDTH, NODE_HEIGHT)
    } else {
        (NODE_HEIGHT, NODE_WIDTH)
    };
    let rank_sign = if options.direction.is_reversed() { -1.0 } else { 1.0 };

    let size = layers.iter().map(Vec::len).sum();
    let mut positions = vec![Position::default(); size];
    for (rank, layer) in layers.iter().enumerate() {
        let rank_center = rank_sign * (rank as f64 * (rank_extent + options.rank_separation));
        let span = layer.len() as f64 * cross_extent
            + layer.len().saturating_sub(1) as f64 * options.node_separation;
        for (slot, &node) in layer.iter().enumerate() {
            let cross_center = slot as f64 * (cross_extent + options.node_separation) - span / 2.0
                + cross_extent / 2.0;
            let (center_x, center_y) = if horizontal {
                (rank_center, cross_center)
            } else {
                (cross_center, rank_center)
            };
            positions[node] = Position::new(
                center_x - NODE_WIDTH / 2.0,
                center_y - NODE_HEIGHT / 2.0,
            );
        }
    }
    positions
}

/// Shift that puts the layout's top-left corner on the participants' current
/// top-left corner, so re-running the layout is stable.
fn anchor_offset(participants: &[&Node], computed: &[Position]) -> Position {
    let current = top_left(participants.iter().map(|node| node.position))
        .unwrap_or_default();
    let laid_out = top_left(computed.iter().copied()).unwrap_or_default();
    Position::new(current.x - laid_out.x, current.y - laid_out.y)
}

fn top_left(positions: impl Iterator<Item = Position>) -> Option<Position> {
    positions
        .filter(Position::is_valid)
        .fold(None, |acc: Option<Position>, position| {
            Some(match acc {
                Some(acc) => Position::new(acc.x.min(position.x), acc.y.min(position.y)),
                None => position,
            })
        })
}
