// schedule.rs — Deterministic execution-order scheduling for Loom graphs
//
// Per-diagram topological sort of nodes in dependency order, with nested
// diagrams fully ordered before their structure node completes. Ties are
// broken by node creation order, never by traversal order, so an unchanged
// graph always schedules identically. Borrowing uses of a wire are ordered
// before consuming uses, and terminate-lifetime tunnels after everything
// else, via implicit edges.
//
// Preconditions: `typed` is the successful inference output for `graph`.
// Postconditions: returns a `ScheduledFunction` with per-diagram orders and
//                 the global linearization used by the partitioner.
// Failure modes: wire cycles without a loop boundary produce `Diagnostic`
//                entries (`E0401`); sibling diagrams keep being scheduled.
// Side effects: none.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::cancel::{CancellationToken, Cancelled};
use crate::diag::{codes, DiagLevel, Diagnostic, Subject};
use crate::graph::{Graph, NodeKind, StructureKind};
use crate::id::{DiagramId, NodeId};
use crate::type_infer::{TypedGraph, UseKind};

// ── Public types ────────────────────────────────────────────────────────────

/// One step of the global linearization. `Enter`/`Exit` bracket every nested
/// diagram's steps; `StructureDone` marks a structure node's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Node(NodeId),
    Enter(DiagramId),
    Exit(DiagramId),
    StructureDone(NodeId),
}

/// Schedule for a single function graph.
#[derive(Debug, Clone)]
pub struct ScheduledFunction {
    /// Topological node order per diagram.
    pub diagram_order: HashMap<DiagramId, Vec<NodeId>>,
    /// Global linearization: depth-first over the diagram orders.
    pub steps: Vec<Step>,
    /// Node → its execution position (structure nodes: completion position).
    pub node_pos: HashMap<NodeId, usize>,
    /// Diagram → position of its `Exit` step (scope-exit drop point).
    pub exit_pos: HashMap<DiagramId, usize>,
}

/// Result of scheduling.
pub struct ScheduleResult {
    pub schedule: Option<ScheduledFunction>,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for schedule postconditions (S1-S2).
#[derive(Debug, Clone)]
pub struct ScheduleCert {
    /// S1: every node appears exactly once in its diagram's order.
    pub s1_nodes_scheduled_once: bool,
    /// S2: every wire's source position precedes all of its sink positions.
    pub s2_sources_precede_sinks: bool,
}

impl crate::pass::StageCert for ScheduleCert {
    fn all_pass(&self) -> bool {
        self.s1_nodes_scheduled_once && self.s2_sources_precede_sinks
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("S1_nodes_scheduled_once", self.s1_nodes_scheduled_once),
            ("S2_sources_precede_sinks", self.s2_sources_precede_sinks),
        ]
    }
}

/// Verify schedule postconditions against the graph.
pub fn verify_schedule(graph: &Graph, sched: &ScheduledFunction) -> ScheduleCert {
    let mut s1 = true;
    for d in graph.diagrams() {
        match sched.diagram_order.get(&d.id) {
            Some(order) => {
                if order.len() != d.nodes.len() {
                    s1 = false;
                }
                let set: HashSet<NodeId> = order.iter().copied().collect();
                if set.len() != order.len() || d.nodes.iter().any(|n| !set.contains(n)) {
                    s1 = false;
                }
            }
            None => s1 = false,
        }
    }

    let mut s2 = true;
    for wire in graph.wires() {
        let src_node = graph.term(wire.source).node;
        let src_pos = match sched.node_pos.get(&src_node) {
            Some(p) => *p,
            None => {
                s2 = false;
                continue;
            }
        };
        for sink in &wire.sinks {
            let sink_node = graph.term(*sink).node;
            if sink_node == src_node || is_loop_back_sink(graph, *sink) {
                // Loop-carried dependency: crosses the back-edge boundary,
                // not part of the in-iteration order.
                continue;
            }
            match sched.node_pos.get(&sink_node) {
                Some(p) if *p > src_pos => {}
                _ => s2 = false,
            }
        }
    }

    ScheduleCert {
        s1_nodes_scheduled_once: s1,
        s2_sources_precede_sinks: s2,
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Produce the deterministic execution order for a typed graph.
pub fn schedule(
    graph: &Graph,
    typed: &TypedGraph,
    token: &CancellationToken,
) -> Result<ScheduleResult, Cancelled> {
    token.check()?;
    let mut ctx = ScheduleCtx {
        graph,
        typed,
        diagnostics: Vec::new(),
        diagram_order: HashMap::new(),
    };

    for d in graph.diagrams() {
        token.check()?;
        ctx.sort_diagram(d.id);
    }

    if crate::diag::has_errors(&ctx.diagnostics) {
        return Ok(ScheduleResult {
            schedule: None,
            diagnostics: ctx.diagnostics,
        });
    }

    let mut steps = Vec::new();
    steps.push(Step::Enter(graph.root()));
    linearize(graph, &ctx.diagram_order, graph.root(), &mut steps);
    steps.push(Step::Exit(graph.root()));

    let mut node_pos = HashMap::new();
    let mut exit_pos = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        match step {
            Step::Node(n) => {
                node_pos.insert(*n, i);
            }
            Step::StructureDone(n) => {
                node_pos.insert(*n, i);
            }
            Step::Exit(d) => {
                exit_pos.insert(*d, i);
            }
            Step::Enter(_) => {}
        }
    }

    Ok(ScheduleResult {
        schedule: Some(ScheduledFunction {
            diagram_order: ctx.diagram_order,
            steps,
            node_pos,
            exit_pos,
        }),
        diagnostics: ctx.diagnostics,
    })
}

/// True if `term` is the next-iteration input of a loop tunnel.
fn is_loop_back_sink(graph: &Graph, term: crate::id::TermId) -> bool {
    let t = graph.term(term);
    matches!(
        graph.node(t.node).kind,
        NodeKind::Border(crate::graph::BorderKind::LoopTunnel { .. })
    ) && t.dir == crate::graph::Direction::Input
}

fn linearize(
    graph: &Graph,
    order: &HashMap<DiagramId, Vec<NodeId>>,
    diagram: DiagramId,
    steps: &mut Vec<Step>,
) {
    let empty = Vec::new();
    let nodes = order.get(&diagram).unwrap_or(&empty);
    for &nid in nodes {
        match &graph.node(nid).kind {
            NodeKind::Structure(kind) => {
                let bodies: Vec<DiagramId> = match kind {
                    StructureKind::Frame { body } | StructureKind::Loop { body } => vec![*body],
                    StructureKind::Case { branches } => branches.clone(),
                };
                for body in bodies {
                    steps.push(Step::Enter(body));
                    linearize(graph, order, body, steps);
                    steps.push(Step::Exit(body));
                }
                steps.push(Step::StructureDone(nid));
            }
            _ => steps.push(Step::Node(nid)),
        }
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct ScheduleCtx<'a> {
    graph: &'a Graph,
    typed: &'a TypedGraph,
    diagnostics: Vec<Diagnostic>,
    diagram_order: HashMap<DiagramId, Vec<NodeId>>,
}

impl<'a> ScheduleCtx<'a> {
    /// Ordering rank of a use: borrows run first, moves after them,
    /// terminate-lifetime tunnels last.
    fn use_rank(kind: UseKind) -> u8 {
        match kind {
            UseKind::BorrowImm | UseKind::BorrowMut => 0,
            UseKind::Consume | UseKind::Transfer => 1,
            UseKind::EndLifetime => 2,
        }
    }

    fn sink_kind(&self, term: crate::id::TermId) -> UseKind {
        for var in &self.typed.vars {
            for u in &var.uses {
                if u.term == term {
                    return u.kind;
                }
            }
        }
        UseKind::Consume
    }

    // Kahn's algorithm with a BTreeSet ready set: the minimum node id is
    // always picked first, so independent nodes order by creation.
    fn sort_diagram(&mut self, diagram: DiagramId) {
        let d = self.graph.diagram(diagram);
        if d.nodes.is_empty() {
            self.diagram_order.insert(diagram, Vec::new());
            return;
        }

        let mut in_degree: HashMap<NodeId, u32> = HashMap::new();
        let mut adj: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &n in &d.nodes {
            in_degree.entry(n).or_insert(0);
            adj.entry(n).or_default();
        }

        let mut edges: HashSet<(NodeId, NodeId)> = HashSet::new();
        for &wid in &d.wires {
            let wire = self.graph.wire(wid);
            let src = self.graph.term(wire.source).node;
            let mut ranked: Vec<(NodeId, u8)> = Vec::new();
            for sink in &wire.sinks {
                // The next-iteration input of a loop tunnel is the loop's
                // back edge; it orders across iterations, not within one.
                if is_loop_back_sink(self.graph, *sink) {
                    continue;
                }
                let node = self.graph.term(*sink).node;
                if node != src {
                    edges.insert((src, node));
                }
                ranked.push((node, Self::use_rank(self.sink_kind(*sink))));
            }
            // Implicit edges among sinks: lower rank before higher rank.
            for &(a, ra) in &ranked {
                for &(b, rb) in &ranked {
                    if ra < rb && a != b {
                        edges.insert((a, b));
                    }
                }
            }
        }

        for (a, b) in &edges {
            *in_degree.entry(*b).or_insert(0) += 1;
            adj.entry(*a).or_default().push(*b);
        }

        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut order = Vec::with_capacity(d.nodes.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(next);
            if let Some(neigh) = adj.get(&next) {
                for n in neigh.clone() {
                    if let Some(deg) = in_degree.get_mut(&n) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(n);
                        }
                    }
                }
            }
        }

        if order.len() < d.nodes.len() {
            let placed: HashSet<NodeId> = order.iter().copied().collect();
            let stuck: Vec<NodeId> = d
                .nodes
                .iter()
                .copied()
                .filter(|n| !placed.contains(n))
                .collect();
            let mut diag = Diagnostic::new(
                DiagLevel::Error,
                Subject::Diagram(diagram),
                format!(
                    "cyclic data dependency: {} node(s) form a wire cycle with no loop boundary",
                    stuck.len()
                ),
            )
            .with_code(codes::E0401)
            .with_hint("route the feedback through a loop structure's tunnels");
            for n in &stuck {
                diag = diag.with_related(Subject::Node(*n), "participates in the cycle");
            }
            self.diagnostics.push(diag);
            return;
        }

        self.diagram_order.insert(diagram, order);
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for ScheduledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ScheduledFunction ({} diagrams)", self.diagram_order.len())?;
        let mut ids: Vec<&DiagramId> = self.diagram_order.keys().collect();
        ids.sort();
        for id in ids {
            let order = &self.diagram_order[id];
            let list: Vec<String> = order.iter().map(|n| n.0.to_string()).collect();
            writeln!(f, "  diagram {}: [{}]", id.0, list.join(", "))?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::pass::StageCert;
    use crate::signature::{Literal, OpCode};
    use crate::type_infer::infer;

    fn typed_of(g: &Graph) -> TypedGraph {
        let res = infer(g, &CancellationToken::new()).unwrap();
        assert!(res.diagnostics.is_empty(), "{:?}", res.diagnostics);
        res.typed.unwrap()
    }

    fn chain_graph() -> Graph {
        let mut b = GraphBuilder::new("t");
        let root = b.root();
        let c1 = b.add_const(root, Literal::Int(2));
        let c2 = b.add_const(root, Literal::Int(3));
        let add = b.add_op(root, OpCode::Add).unwrap();
        let inspect = b.add_op(root, OpCode::Inspect).unwrap();
        b.wire(b.out(c1, 0), &[b.inp(add, 0)]).unwrap();
        b.wire(b.out(c2, 0), &[b.inp(add, 1)]).unwrap();
        b.wire(b.out(add, 0), &[b.inp(inspect, 0)]).unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn chain_schedules_in_dependency_order() {
        let g = chain_graph();
        let typed = typed_of(&g);
        let res = schedule(&g, &typed, &CancellationToken::new()).unwrap();
        let sched = res.schedule.unwrap();
        let cert = verify_schedule(&g, &sched);
        assert!(cert.all_pass(), "{:?}", cert.obligations());
        let order = &sched.diagram_order[&g.root()];
        assert_eq!(order.len(), 4);
        // Constants (ids 0, 1) precede add (2) which precedes inspect (3).
        assert_eq!(order[0].0, 0);
        assert_eq!(order[1].0, 1);
        assert_eq!(order[2].0, 2);
        assert_eq!(order[3].0, 3);
    }

    #[test]
    fn two_runs_produce_identical_orders() {
        let g = chain_graph();
        let typed = typed_of(&g);
        let a = schedule(&g, &typed, &CancellationToken::new())
            .unwrap()
            .schedule
            .unwrap();
        let b = schedule(&g, &typed, &CancellationToken::new())
            .unwrap()
            .schedule
            .unwrap();
        assert_eq!(a.steps, b.steps);
        assert_eq!(
            a.diagram_order[&g.root()],
            b.diagram_order[&g.root()]
        );
    }

    #[test]
    fn borrowing_structure_precedes_consumer() {
        // A string is borrowed by a frame and also consumed by a drop; the
        // frame must run first.
        let mut b = GraphBuilder::new("t");
        let root = b.root();
        let c = b.add_const(root, Literal::Str("s".into()));
        let drop_op = b.add_op(root, OpCode::Drop).unwrap();
        let (frame, body) = b.add_frame(root);
        let ids = b
            .add_borrow_tunnel(frame, crate::signature::BorrowMode::Immutable)
            .unwrap();
        // Wire the const to both the drop (consume) and the borrow tunnel.
        b.wire(b.out(c, 0), &[b.inp(drop_op, 0), ids.outer_in])
            .unwrap();
        let inspect = b.add_op(body, OpCode::Inspect).unwrap();
        b.wire(b.out(ids.borrow, 0), &[b.inp(inspect, 0), b.inp(ids.terminate, 0)])
            .unwrap();
        // The owner re-emerges; leave the structure output unwired.
        let g = b.finish().unwrap();
        let typed = typed_of(&g);
        let sched = schedule(&g, &typed, &CancellationToken::new())
            .unwrap()
            .schedule
            .unwrap();
        let order = &sched.diagram_order[&g.root()];
        let frame_idx = order.iter().position(|n| *n == frame).unwrap();
        let drop_idx = order.iter().position(|n| *n == drop_op).unwrap();
        assert!(
            frame_idx < drop_idx,
            "borrowing frame must be scheduled before the consuming drop"
        );
    }

    #[test]
    fn wire_cycle_reports_participants() {
        // add1 and add2 feed each other: a cycle with no loop boundary.
        let mut b = GraphBuilder::new("t");
        let root = b.root();
        let c = b.add_const(root, Literal::Int(1));
        let add1 = b.add_op(root, OpCode::Add).unwrap();
        let add2 = b.add_op(root, OpCode::Add).unwrap();
        b.wire(b.out(c, 0), &[b.inp(add1, 0)]).unwrap();
        b.wire(b.out(add1, 0), &[b.inp(add2, 0)]).unwrap();
        b.wire(b.out(add2, 0), &[b.inp(add1, 1)]).unwrap();
        let c2 = b.add_const(root, Literal::Int(2));
        b.wire(b.out(c2, 0), &[b.inp(add2, 1)]).unwrap();
        let g = b.finish().unwrap();

        let typed = typed_of(&g);
        let res = schedule(&g, &typed, &CancellationToken::new()).unwrap();
        assert!(res.schedule.is_none());
        let diag = res
            .diagnostics
            .iter()
            .find(|d| d.code == Some(codes::E0401))
            .expect("cycle diagnostic");
        let related: Vec<_> = diag
            .related
            .iter()
            .filter_map(|r| match r.subject {
                Subject::Node(n) => Some(n),
                _ => None,
            })
            .collect();
        assert!(related.contains(&add1));
        assert!(related.contains(&add2));
    }

    #[test]
    fn nested_diagram_nodes_precede_structure_completion() {
        let mut b = GraphBuilder::new("t");
        let root = b.root();
        let c = b.add_const(root, Literal::Int(1));
        let (frame, body) = b.add_frame(root);
        let tun = b.add_input_tunnel(frame).unwrap();
        b.wire(b.out(c, 0), &[tun.outer]).unwrap();
        let inspect = b.add_op(body, OpCode::Inspect).unwrap();
        b.wire(b.out(tun.inner[0], 0), &[b.inp(inspect, 0)]).unwrap();
        let g = b.finish().unwrap();

        let typed = typed_of(&g);
        let sched = schedule(&g, &typed, &CancellationToken::new())
            .unwrap()
            .schedule
            .unwrap();
        let frame_pos = sched.node_pos[&frame];
        let inspect_pos = sched.node_pos[&inspect];
        assert!(inspect_pos < frame_pos);
    }

    #[test]
    fn cancellation_is_honored() {
        let g = chain_graph();
        let typed = typed_of(&g);
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(schedule(&g, &typed, &token), Err(Cancelled)));
    }
}
