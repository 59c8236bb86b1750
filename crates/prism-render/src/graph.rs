//! Pass graph planning.
//!
//! Passes declare the resources they read and write. A reader depends on
//! the single writer of each resource it reads; the graph is ordered by
//! those dependencies, with declaration order breaking ties, and the
//! destination pass always last.
//!
//! Each frame, the dependencies between the passes that actually run are
//! reduced to the minimal edge set and turned into GPU-kind wait/signal
//! assignments. A submission signals at most one primitive and each
//! primitive is waited once, so a producer with several consumers signals
//! the first edge itself and every further edge through a relay
//! submission placed right after it.

use crate::error::{RenderError, Result};
use bitflags::bitflags;
use hashbrown::HashMap;

/// Name of a resource passed between frame passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub &'static str);

impl ResourceId {
    pub fn name(self) -> &'static str {
        self.0
    }
}

bitflags! {
    /// Scheduling flags of a frame pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PassFlags: u8 {
        /// Records into the caller's destination command buffer.
        const DESTINATION = 0b0000_0001;
        /// Runs only when scene geometry changed since the last build.
        const ON_GEOMETRY_CHANGE = 0b0000_0010;
    }
}

/// Declared name, reads, writes and flags of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassDecl {
    pub name: String,
    pub reads: Vec<ResourceId>,
    pub writes: Vec<ResourceId>,
    pub flags: PassFlags,
}

impl PassDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            flags: PassFlags::empty(),
        }
    }

    pub fn reads(mut self, resources: impl IntoIterator<Item = ResourceId>) -> Self {
        self.reads.extend(resources);
        self
    }

    pub fn writes(mut self, resources: impl IntoIterator<Item = ResourceId>) -> Self {
        self.writes.extend(resources);
        self
    }

    pub fn flags(mut self, flags: PassFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// A "producer finishes before consumer starts" dependency between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub producer: usize,
    pub consumer: usize,
}

/// One entry of a frame's submission list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedSubmission {
    /// A pass's own command buffer.
    Pass {
        pass: usize,
        waits: Vec<Edge>,
        signal: Option<Edge>,
    },
    /// An empty command buffer that signals an extra outgoing edge of the
    /// pass submitted just before it.
    Relay { signal: Edge },
}

/// Ordered submissions for one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramePlan {
    pub submissions: Vec<PlannedSubmission>,
    pub skipped: Vec<usize>,
}

impl FramePlan {
    /// Every edge that needs a GPU-kind primitive this frame.
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.submissions.iter().filter_map(|entry| match entry {
            PlannedSubmission::Pass { signal, .. } => *signal,
            PlannedSubmission::Relay { signal } => Some(*signal),
        })
    }

    /// Edges signaled through relays.
    pub fn relays(&self) -> impl Iterator<Item = Edge> + '_ {
        self.submissions.iter().filter_map(|entry| match entry {
            PlannedSubmission::Relay { signal } => Some(*signal),
            PlannedSubmission::Pass { .. } => None,
        })
    }

    /// Passes in submission order.
    pub fn passes(&self) -> impl Iterator<Item = usize> + '_ {
        self.submissions.iter().filter_map(|entry| match entry {
            PlannedSubmission::Pass { pass, .. } => Some(*pass),
            PlannedSubmission::Relay { .. } => None,
        })
    }
}

/// Validated, ordered pass graph.
#[derive(Debug, Clone)]
pub struct PassGraph {
    passes: Vec<PassDecl>,
    order: Vec<usize>,
    // reach[a][b]: a must finish before b starts, directly or transitively
    reach: Vec<Vec<bool>>,
    destination: usize,
}

impl PassGraph {
    pub fn new(passes: Vec<PassDecl>) -> Result<Self> {
        let destination = find_destination(&passes)?;
        let count = passes.len();

        let mut writers: HashMap<ResourceId, usize> = HashMap::new();
        for (index, pass) in passes.iter().enumerate() {
            for &resource in &pass.writes {
                if let Some(&first) = writers.get(&resource) {
                    if first != index {
                        return Err(RenderError::DuplicateWriter {
                            resource: resource.name(),
                            first: passes[first].name.clone(),
                            second: pass.name.clone(),
                        });
                    }
                }
                writers.insert(resource, index);
            }
        }

        let mut direct = vec![vec![false; count]; count];
        for (reader, pass) in passes.iter().enumerate() {
            for resource in &pass.reads {
                // Reading a resource nobody writes is an external input
                if let Some(&writer) = writers.get(resource) {
                    if writer != reader {
                        direct[writer][reader] = true;
                    }
                }
            }
        }
        if direct[destination].iter().any(|&d| d) {
            return Err(RenderError::DestinationHasConsumers(
                passes[destination].name.clone(),
            ));
        }

        let order = topological_order(&passes, &direct, destination)?;

        let mut reach = direct;
        for k in 0..count {
            for i in 0..count {
                if reach[i][k] {
                    for j in 0..count {
                        if reach[k][j] {
                            reach[i][j] = true;
                        }
                    }
                }
            }
        }

        Ok(Self {
            passes,
            order,
            reach,
            destination,
        })
    }

    pub fn passes(&self) -> &[PassDecl] {
        &self.passes
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Pass indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn destination(&self) -> usize {
        self.destination
    }

    /// Whether `producer` must finish before `consumer` starts.
    pub fn depends_on(&self, consumer: usize, producer: usize) -> bool {
        self.reach[producer][consumer]
    }

    /// Which passes run this frame. The destination always runs.
    pub fn active_passes(&self, geometry_changed: bool) -> Vec<bool> {
        self.passes
            .iter()
            .enumerate()
            .map(|(index, pass)| {
                index == self.destination
                    || geometry_changed
                    || !pass.flags.contains(PassFlags::ON_GEOMETRY_CHANGE)
            })
            .collect()
    }

    /// Minimal edges among active passes.
    ///
    /// An inactive pass between two active ones does not remove the
    /// dependency between them.
    pub fn edges(&self, active: &[bool]) -> Vec<Edge> {
        let is_active = |index: usize| active.get(index).copied().unwrap_or(false);
        let mut edges = Vec::new();
        for &consumer in self.order.iter().filter(|&&i| is_active(i)) {
            for &producer in self.order.iter().filter(|&&i| is_active(i)) {
                if !self.reach[producer][consumer] {
                    continue;
                }
                let implied = self.order.iter().any(|&mid| {
                    is_active(mid)
                        && mid != producer
                        && mid != consumer
                        && self.reach[producer][mid]
                        && self.reach[mid][consumer]
                });
                if !implied {
                    edges.push(Edge { producer, consumer });
                }
            }
        }
        edges
    }

    /// Submission list for the active passes.
    pub fn plan_frame(&self, active: &[bool]) -> FramePlan {
        let mut active = active.to_vec();
        active.resize(self.passes.len(), false);
        active[self.destination] = true;

        let edges = self.edges(&active);
        let mut submissions = Vec::with_capacity(self.order.len() + edges.len());
        let mut skipped = Vec::new();
        for &pass in &self.order {
            if !active[pass] {
                skipped.push(pass);
                continue;
            }
            let waits = edges.iter().copied().filter(|e| e.consumer == pass).collect();
            let mut outgoing = edges.iter().copied().filter(|e| e.producer == pass);
            submissions.push(PlannedSubmission::Pass {
                pass,
                waits,
                signal: outgoing.next(),
            });
            submissions.extend(outgoing.map(|signal| PlannedSubmission::Relay { signal }));
        }

        tracing::trace!(
            submissions = submissions.len(),
            edges = edges.len(),
            skipped = skipped.len(),
            "Planned frame"
        );
        FramePlan {
            submissions,
            skipped,
        }
    }
}

fn find_destination(passes: &[PassDecl]) -> Result<usize> {
    let destinations: Vec<usize> = passes
        .iter()
        .enumerate()
        .filter(|(_, p)| p.flags.contains(PassFlags::DESTINATION))
        .map(|(i, _)| i)
        .collect();
    match destinations.as_slice() {
        [] => Err(RenderError::MissingDestination),
        [single] => Ok(*single),
        many => Err(RenderError::MultipleDestinations(
            many.iter().map(|&i| passes[i].name.clone()).collect(),
        )),
    }
}

/// Kahn's algorithm, lowest declaration index first, destination last.
fn topological_order(
    passes: &[PassDecl],
    direct: &[Vec<bool>],
    destination: usize,
) -> Result<Vec<usize>> {
    let count = passes.len();
    let mut indegree: Vec<usize> = (0..count)
        .map(|j| (0..count).filter(|&i| direct[i][j]).count())
        .collect();
    let mut scheduled = vec![false; count];
    let mut order = Vec::with_capacity(count);

    while order.len() < count {
        let remaining = count - order.len();
        let next = (0..count).find(|&i| {
            !scheduled[i] && indegree[i] == 0 && (i != destination || remaining == 1)
        });
        let Some(next) = next else {
            let stuck = (0..count)
                .filter(|&i| !scheduled[i] && indegree[i] > 0)
                .map(|i| passes[i].name.clone())
                .collect();
            return Err(RenderError::Cycle(stuck));
        };
        scheduled[next] = true;
        order.push(next);
        for (j, degree) in indegree.iter_mut().enumerate() {
            if direct[next][j] {
                *degree -= 1;
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLAS: ResourceId = ResourceId("blas");
    const TLAS: ResourceId = ResourceId("tlas");
    const GBUFFER: ResourceId = ResourceId("gbuffer");
    const AO: ResourceId = ResourceId("ao");
    const SHADOWS: ResourceId = ResourceId("shadows");
    const REFLECTIONS: ResourceId = ResourceId("reflections");
    const FILTERED: ResourceId = ResourceId("filtered");
    const OUTPUT: ResourceId = ResourceId("output");

    // Deliberately declared out of dependency order
    fn frame_passes() -> Vec<PassDecl> {
        vec![
            PassDecl::new("composition")
                .reads([GBUFFER, FILTERED])
                .writes([OUTPUT])
                .flags(PassFlags::DESTINATION),
            PassDecl::new("temporal")
                .reads([AO, SHADOWS, REFLECTIONS, FILTERED])
                .writes([FILTERED]),
            PassDecl::new("ao").reads([TLAS, GBUFFER]).writes([AO]),
            PassDecl::new("shadows").reads([TLAS, GBUFFER]).writes([SHADOWS]),
            PassDecl::new("reflections")
                .reads([TLAS, GBUFFER])
                .writes([REFLECTIONS]),
            PassDecl::new("primary").reads([TLAS]).writes([GBUFFER]),
            PassDecl::new("tlas")
                .reads([BLAS])
                .writes([TLAS])
                .flags(PassFlags::ON_GEOMETRY_CHANGE),
            PassDecl::new("blas")
                .writes([BLAS])
                .flags(PassFlags::ON_GEOMETRY_CHANGE),
        ]
    }

    fn index(graph: &PassGraph, name: &str) -> usize {
        graph.passes().iter().position(|p| p.name == name).unwrap()
    }

    fn names(graph: &PassGraph, order: impl IntoIterator<Item = usize>) -> Vec<String> {
        order
            .into_iter()
            .map(|i| graph.passes()[i].name.clone())
            .collect()
    }

    fn edge(graph: &PassGraph, producer: &str, consumer: &str) -> Edge {
        Edge {
            producer: index(graph, producer),
            consumer: index(graph, consumer),
        }
    }

    #[test]
    fn orders_by_dependency_not_declaration() {
        let graph = PassGraph::new(frame_passes()).unwrap();
        assert_eq!(
            names(&graph, graph.order().iter().copied()),
            vec![
                "blas",
                "tlas",
                "primary",
                "ao",
                "shadows",
                "reflections",
                "temporal",
                "composition"
            ]
        );
        assert_eq!(graph.destination(), 0);
        assert!(graph.depends_on(index(&graph, "composition"), index(&graph, "blas")));
        assert!(!graph.depends_on(index(&graph, "shadows"), index(&graph, "ao")));
    }

    #[test]
    fn edges_are_transitively_reduced() {
        let graph = PassGraph::new(frame_passes()).unwrap();
        let edges = graph.edges(&graph.active_passes(true));
        let expected = [
            ("blas", "tlas"),
            ("tlas", "primary"),
            ("primary", "ao"),
            ("primary", "shadows"),
            ("primary", "reflections"),
            ("ao", "temporal"),
            ("shadows", "temporal"),
            ("reflections", "temporal"),
            ("temporal", "composition"),
        ];
        assert_eq!(edges.len(), expected.len());
        for (producer, consumer) in expected {
            assert!(edges.contains(&edge(&graph, producer, consumer)));
        }
        // Implied through primary rays
        assert!(!edges.contains(&edge(&graph, "tlas", "ao")));
    }

    #[test]
    fn fan_out_uses_relays() {
        let graph = PassGraph::new(frame_passes()).unwrap();
        let plan = graph.plan_frame(&graph.active_passes(true));
        let primary = index(&graph, "primary");

        let at = plan
            .submissions
            .iter()
            .position(|s| matches!(s, PlannedSubmission::Pass { pass, .. } if *pass == primary))
            .unwrap();
        assert_eq!(
            plan.submissions[at],
            PlannedSubmission::Pass {
                pass: primary,
                waits: vec![edge(&graph, "tlas", "primary")],
                signal: Some(edge(&graph, "primary", "ao")),
            }
        );
        assert_eq!(
            plan.submissions[at + 1],
            PlannedSubmission::Relay {
                signal: edge(&graph, "primary", "shadows")
            }
        );
        assert_eq!(
            plan.submissions[at + 2],
            PlannedSubmission::Relay {
                signal: edge(&graph, "primary", "reflections")
            }
        );
        assert_eq!(plan.relays().count(), 2);
        assert_eq!(plan.submissions.len(), 10);
    }

    #[test]
    fn every_edge_signaled_once_and_waited_once_after_its_signal() {
        let graph = PassGraph::new(frame_passes()).unwrap();
        let plan = graph.plan_frame(&graph.active_passes(true));

        let mut signaled_at = HashMap::new();
        for (position, entry) in plan.submissions.iter().enumerate() {
            let signal = match entry {
                PlannedSubmission::Pass { signal, .. } => *signal,
                PlannedSubmission::Relay { signal } => Some(*signal),
            };
            if let Some(signal) = signal {
                assert!(signaled_at.insert(signal, position).is_none());
            }
        }
        let mut waited = 0;
        for (position, entry) in plan.submissions.iter().enumerate() {
            if let PlannedSubmission::Pass { waits, .. } = entry {
                for wait in waits {
                    assert!(signaled_at[wait] < position);
                    waited += 1;
                }
            }
        }
        assert_eq!(waited, signaled_at.len());
    }

    #[test]
    fn unchanged_geometry_skips_builds() {
        let graph = PassGraph::new(frame_passes()).unwrap();
        let plan = graph.plan_frame(&graph.active_passes(false));

        assert_eq!(names(&graph, plan.skipped.iter().copied()), vec!["blas", "tlas"]);
        assert_eq!(
            names(&graph, plan.passes()),
            vec!["primary", "ao", "shadows", "reflections", "temporal", "composition"]
        );
        let first = &plan.submissions[0];
        assert!(matches!(first, PlannedSubmission::Pass { waits, .. } if waits.is_empty()));
        // Destination stays last and signals nothing of its own
        assert!(matches!(
            plan.submissions.last(),
            Some(PlannedSubmission::Pass { signal: None, .. })
        ));
    }

    #[test]
    fn inactive_middle_pass_keeps_dependency() {
        let a = ResourceId("a");
        let b = ResourceId("b");
        let graph = PassGraph::new(vec![
            PassDecl::new("first").writes([a]),
            PassDecl::new("middle")
                .reads([a])
                .writes([b])
                .flags(PassFlags::ON_GEOMETRY_CHANGE),
            PassDecl::new("last").reads([b]).flags(PassFlags::DESTINATION),
        ])
        .unwrap();

        let edges = graph.edges(&graph.active_passes(false));
        assert_eq!(edges, vec![Edge { producer: 0, consumer: 2 }]);
    }

    #[test]
    fn independent_passes_keep_declaration_order() {
        let graph = PassGraph::new(vec![
            PassDecl::new("out").flags(PassFlags::DESTINATION),
            PassDecl::new("x"),
            PassDecl::new("y"),
        ])
        .unwrap();
        assert_eq!(graph.order(), &[1, 2, 0]);
        assert!(graph.edges(&graph.active_passes(true)).is_empty());
    }

    #[test]
    fn self_read_write_is_allowed() {
        let history = ResourceId("history");
        let graph = PassGraph::new(vec![PassDecl::new("accumulate")
            .reads([history])
            .writes([history])
            .flags(PassFlags::DESTINATION)])
        .unwrap();
        assert_eq!(graph.order(), &[0]);
    }

    #[test]
    fn rejects_cycles() {
        let a = ResourceId("a");
        let b = ResourceId("b");
        let err = PassGraph::new(vec![
            PassDecl::new("ping").reads([b]).writes([a]),
            PassDecl::new("pong").reads([a]).writes([b]),
            PassDecl::new("present").flags(PassFlags::DESTINATION),
        ])
        .unwrap_err();
        match err {
            RenderError::Cycle(names) => assert_eq!(names, vec!["ping", "pong"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_report_names_blocked_consumers() {
        let a = ResourceId("a");
        let b = ResourceId("b");
        let err = PassGraph::new(vec![
            PassDecl::new("ping").reads([b]).writes([a]),
            PassDecl::new("pong").reads([a]).writes([b]),
            PassDecl::new("seed").writes([OUTPUT]),
            PassDecl::new("present")
                .reads([a, OUTPUT])
                .flags(PassFlags::DESTINATION),
        ])
        .unwrap_err();
        match err {
            RenderError::Cycle(names) => assert_eq!(names, vec!["ping", "pong", "present"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_two_writers() {
        let err = PassGraph::new(vec![
            PassDecl::new("ao").writes([AO]),
            PassDecl::new("ao_again").writes([AO]),
            PassDecl::new("present").flags(PassFlags::DESTINATION),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            RenderError::DuplicateWriter { resource: "ao", .. }
        ));
    }

    #[test]
    fn destination_rules() {
        assert!(matches!(
            PassGraph::new(vec![PassDecl::new("a")]),
            Err(RenderError::MissingDestination)
        ));
        assert!(matches!(
            PassGraph::new(vec![
                PassDecl::new("a").flags(PassFlags::DESTINATION),
                PassDecl::new("b").flags(PassFlags::DESTINATION),
            ]),
            Err(RenderError::MultipleDestinations(_))
        ));
        assert!(matches!(
            PassGraph::new(vec![
                PassDecl::new("present")
                    .writes([OUTPUT])
                    .flags(PassFlags::DESTINATION),
                PassDecl::new("late").reads([OUTPUT]),
            ]),
            Err(RenderError::DestinationHasConsumers(_))
        ));
    }

    #[test]
    fn destination_waits_for_unrelated_passes_in_order() {
        let graph = PassGraph::new(vec![
            PassDecl::new("present").flags(PassFlags::DESTINATION),
            PassDecl::new("side"),
        ])
        .unwrap();
        let plan = graph.plan_frame(&[true, true]);
        assert_eq!(plan.passes().collect::<Vec<_>>(), vec![1, 0]);
    }
}
