//! The conflict graph built from an unsatisfiable solve, and the merge pass
//! that collapses equivalent nodes for reporting.

use std::{collections::HashMap, rc::Rc};

use itertools::Itertools;
use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
    Direction,
};

use crate::{
    id::{SolvableId, SpecId},
    pool::Pool,
    solver::SolveProblem,
};

/// A node of the problem graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProblemNode {
    /// The synthetic root standing in for the user's jobs.
    Root,
    /// A package that exists in the pool.
    ResolvedPackage(SolvableId),
    /// A dependency nothing provides.
    ProblematicPackage(SpecId),
}

/// An edge of the problem graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ProblemEdge {
    /// The source requires the target through the given spec.
    Require(SpecId),
    /// The source constrains the target through the given spec; constraints
    /// are never a reason to install the target.
    Constraint(SpecId),
}

/// A group of solvables that were collapsed into one reported node.
#[derive(Debug)]
pub struct MergedNode {
    /// The solvables of the group, in insertion order.
    pub ids: Vec<SolvableId>,
}

/// The assembled conflict/requirement graph of one unsatisfiable solve.
pub struct ProblemGraph {
    graph: DiGraph<ProblemNode, ProblemEdge>,
    root: NodeIndex,
    /// Unordered conflict pairs between nodes.
    conflicts: Vec<(NodeIndex, NodeIndex)>,
    /// Per-node problem tags (`not-installable` reasons, lock markers).
    tags: HashMap<NodeIndex, Vec<String>>,
}

impl ProblemGraph {
    /// Builds the graph from the solver's rule-level problems, mapping each
    /// rule kind onto nodes and edges.
    pub fn from_problems(pool: &Pool, problems: &[SolveProblem]) -> Self {
        let mut graph = DiGraph::new();
        let root = graph.add_node(ProblemNode::Root);
        let mut solvable_nodes: HashMap<SolvableId, NodeIndex> = HashMap::new();
        let mut spec_nodes: HashMap<SpecId, NodeIndex> = HashMap::new();
        let mut conflicts = Vec::new();
        let mut tags: HashMap<NodeIndex, Vec<String>> = HashMap::new();

        let mut solvable_node = |graph: &mut DiGraph<ProblemNode, ProblemEdge>, id| {
            *solvable_nodes
                .entry(id)
                .or_insert_with(|| graph.add_node(ProblemNode::ResolvedPackage(id)))
        };

        for problem in problems {
            match problem {
                SolveProblem::Job { spec } | SolveProblem::Requires { source: None, spec } => {
                    let candidates = pool.candidates(*spec).unwrap_or_default();
                    if candidates.is_empty() {
                        let target = *spec_nodes.entry(*spec).or_insert_with(|| {
                            graph.add_node(ProblemNode::ProblematicPackage(*spec))
                        });
                        graph.add_edge(root, target, ProblemEdge::Require(*spec));
                    } else {
                        for candidate in candidates {
                            let target = solvable_node(&mut graph, candidate);
                            graph.add_edge(root, target, ProblemEdge::Require(*spec));
                        }
                    }
                }
                SolveProblem::Requires {
                    source: Some(source),
                    spec,
                } => {
                    let source_node = solvable_node(&mut graph, *source);
                    let candidates = pool.candidates(*spec).unwrap_or_default();
                    if candidates.is_empty() {
                        let target = *spec_nodes.entry(*spec).or_insert_with(|| {
                            graph.add_node(ProblemNode::ProblematicPackage(*spec))
                        });
                        graph.add_edge(source_node, target, ProblemEdge::Require(*spec));
                    } else {
                        for candidate in candidates {
                            let target = solvable_node(&mut graph, candidate);
                            graph.add_edge(source_node, target, ProblemEdge::Require(*spec));
                        }
                    }
                }
                SolveProblem::NothingProvides { source, spec } => {
                    let source_node = match source {
                        Some(source) => solvable_node(&mut graph, *source),
                        None => root,
                    };
                    let target = *spec_nodes
                        .entry(*spec)
                        .or_insert_with(|| graph.add_node(ProblemNode::ProblematicPackage(*spec)));
                    graph.add_edge(source_node, target, ProblemEdge::Require(*spec));
                }
                SolveProblem::Constrains {
                    source,
                    spec,
                    target,
                } => {
                    let source_node = match source {
                        Some(source) => solvable_node(&mut graph, *source),
                        None => root,
                    };
                    let target_node = solvable_node(&mut graph, *target);
                    graph.add_edge(source_node, target_node, ProblemEdge::Constraint(*spec));
                    conflicts.push((source_node, target_node));
                }
                SolveProblem::SameNameConflict { a, b } => {
                    let a = solvable_node(&mut graph, *a);
                    let b = solvable_node(&mut graph, *b);
                    conflicts.push((a, b));
                    conflicts.push((b, a));
                }
                SolveProblem::Locked { solvable } => {
                    let node = solvable_node(&mut graph, *solvable);
                    conflicts.push((root, node));
                    tags.entry(node).or_default().push("locked".to_owned());
                }
                SolveProblem::NotInstallable { solvable, reason } => {
                    let node = solvable_node(&mut graph, *solvable);
                    tags.entry(node).or_default().push((*reason).to_owned());
                }
                SolveProblem::NamespaceError { spec, message } => {
                    let target = *spec_nodes
                        .entry(*spec)
                        .or_insert_with(|| graph.add_node(ProblemNode::ProblematicPackage(*spec)));
                    tags.entry(target).or_default().push(message.clone());
                }
            }
        }

        Self {
            graph,
            root,
            conflicts,
            tags,
        }
    }

    /// The number of nodes, including the root.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Groups equivalent nodes: same package name, same incoming edges and
    /// same outgoing edges. Returns the merged groups keyed by member.
    ///
    /// Nodes that are the target of a conflict never merge, so the report
    /// keeps conflicting versions distinct.
    pub fn merge(&self, pool: &Pool) -> HashMap<SolvableId, Rc<MergedNode>> {
        let conflict_targets: Vec<NodeIndex> =
            self.conflicts.iter().map(|&(_, target)| target).collect();

        let mut groups: HashMap<(u32, Vec<_>, Vec<_>), Vec<(NodeIndex, SolvableId)>> =
            HashMap::new();
        for node in self.graph.node_indices() {
            let ProblemNode::ResolvedPackage(solvable_id) = self.graph[node] else {
                continue;
            };
            if conflict_targets.contains(&node) {
                continue;
            }

            let incoming: Vec<_> = self
                .graph
                .edges_directed(node, Direction::Incoming)
                .map(|e| (e.source(), *e.weight()))
                .sorted_unstable()
                .collect();
            let outgoing: Vec<_> = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .map(|e| (e.target(), *e.weight()))
                .sorted_unstable()
                .collect();

            let name = pool.resolve_solvable(solvable_id).name;
            groups
                .entry((name.0, incoming, outgoing))
                .or_default()
                .push((node, solvable_id));
        }

        let mut merged = HashMap::new();
        for mut members in groups.into_values() {
            if members.len() < 2 {
                continue;
            }
            members.sort_unstable_by(|&(_, a), &(_, b)| {
                pool.resolve_solvable(a)
                    .record
                    .package_record
                    .version
                    .cmp(&pool.resolve_solvable(b).record.package_record.version)
            });
            let node = Rc::new(MergedNode {
                ids: members.iter().map(|&(_, id)| id).collect(),
            });
            for &(_, id) in &members {
                merged.insert(id, node.clone());
            }
        }
        merged
    }

    /// Renders an indented, human-readable report of the graph, using the
    /// merged groups to collapse equivalent versions.
    pub fn to_report(&self, pool: &Pool) -> String {
        use std::fmt::Write;

        let merged = self.merge(pool);
        let mut reported: std::collections::HashSet<SolvableId> = std::collections::HashSet::new();
        let mut out = String::from("The following packages are incompatible:\n");

        let mut stack: Vec<(NodeIndex, usize)> = self
            .graph
            .edges(self.root)
            .map(|e| (e.target(), 1))
            .sorted_by_key(|&(target, _)| target)
            .dedup()
            .collect();
        while let Some((node, depth)) = stack.pop() {
            let indent = "    ".repeat(depth);
            match self.graph[node] {
                ProblemNode::Root => {}
                ProblemNode::ProblematicPackage(spec) => {
                    let _ = writeln!(
                        out,
                        "{indent}|-- {}, for which no candidates were found",
                        pool.resolve_spec(spec)
                    );
                }
                ProblemNode::ResolvedPackage(solvable_id) => {
                    if reported.contains(&solvable_id) {
                        continue;
                    }
                    let solvable = pool.resolve_solvable(solvable_id);
                    let name = &solvable.record.package_record.name;
                    let versions = match merged.get(&solvable_id) {
                        Some(group) => {
                            reported.extend(group.ids.iter().copied());
                            group
                                .ids
                                .iter()
                                .map(|&id| {
                                    pool.resolve_solvable(id)
                                        .record
                                        .package_record
                                        .version
                                        .to_string()
                                })
                                .join(" | ")
                        }
                        None => solvable.record.package_record.version.to_string(),
                    };
                    let tags = self
                        .tags
                        .get(&node)
                        .map(|tags| format!(" ({})", tags.join(", ")))
                        .unwrap_or_default();
                    let _ = writeln!(out, "{indent}|-- {name} {versions}{tags}");
                    stack.extend(self.graph.edges(node).map(|e| (e.target(), depth + 1)));
                }
            }
        }

        for &(a, b) in &self.conflicts {
            if let (ProblemNode::ResolvedPackage(a), ProblemNode::ResolvedPackage(b)) =
                (self.graph[a], self.graph[b])
            {
                let a = &pool.resolve_solvable(a).record.package_record;
                let b = &pool.resolve_solvable(b).record.package_record;
                let _ = writeln!(
                    out,
                    "|-- {} {} conflicts with {} {}",
                    a.name, a.version, b.name, b.version
                );
            }
        }

        out
    }
}
