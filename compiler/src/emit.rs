// emit.rs — Backend-agnostic emission driver and the CodeEmitter contract
//
// Both backends receive the same (graph, schedule, state groups, allocation)
// tuple through this driver. The driver resolves every variable to a slot
// reference once — aliases collapse to their target's slot here — and walks
// the state groups dispatching per node kind. Backends translate slot-level
// operations; they never re-derive or override an allocation decision.
//
// Preconditions: all upstream stages succeeded on the same graph.
// Postconditions: the emitter saw every group exactly once, in order, with
//   moves for suspension transfer, loop initialization, and back edges, and
//   a drop call at each owned value's death position.
// Failure modes: none beyond cancellation (upstream output is trusted).
// Side effects: whatever the backend records.

use std::collections::HashMap;

use crate::allocate::{AllocationMap, FrameLayout, StateLayout, ValueSource};
use crate::cancel::{CancellationToken, Cancelled};
use crate::graph::{BorderKind, Graph, NodeKind, StructureKind};
use crate::id::{GroupId, NodeId, TermId, VarId};
use crate::partition::{StateGroups, Transition};
use crate::schedule::{ScheduledFunction, Step};
use crate::signature::{Literal, OpCode};
use crate::type_infer::TypedGraph;

// ── Contract types ──────────────────────────────────────────────────────────

/// A resolved storage reference. Aliases are already collapsed: a reference
/// variable's slot is its owner's slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotRef {
    Constant(Literal),
    Immutable { index: u32 },
    Local { group: GroupId, index: u32 },
    State { index: u32 },
}

/// Primitive binary operations after signature resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    AddI32,
    MulI32,
    ConcatStr,
}

/// Group hand-off, with the loop condition already resolved to a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupTransition {
    Advance,
    LoopBack { target: GroupId, cond: SlotRef },
    Complete,
}

/// The per-node-kind emission contract each backend implements.
///
/// The driver guarantees: `begin_function` first; groups begin/end in id
/// order exactly once; case branches bracket as begin_case / begin_else /
/// end_case; `finish_function` last.
pub trait CodeEmitter {
    fn begin_function(
        &mut self,
        name: &str,
        layout: &StateLayout,
        frames: &HashMap<GroupId, FrameLayout>,
    );
    fn begin_group(&mut self, group: GroupId);
    fn emit_binary(&mut self, op: BinaryOp, a: &SlotRef, b: &SlotRef, dst: &SlotRef);
    fn emit_move(&mut self, src: &SlotRef, dst: &SlotRef);
    fn emit_inspect(&mut self, src: &SlotRef);
    fn emit_drop(&mut self, slot: &SlotRef);
    fn begin_case(&mut self, cond: &SlotRef);
    fn begin_else(&mut self);
    fn end_case(&mut self);
    fn end_group(&mut self, transition: &GroupTransition);
    fn finish_function(&mut self);
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Drive one backend over the compiled function.
pub fn emit_function<E: CodeEmitter>(
    graph: &Graph,
    typed: &TypedGraph,
    sched: &ScheduledFunction,
    groups: &StateGroups,
    alloc: &AllocationMap,
    emitter: &mut E,
    token: &CancellationToken,
) -> Result<(), Cancelled> {
    token.check()?;
    let driver = Driver {
        graph,
        typed,
        sched,
        groups,
        alloc,
    };
    driver.run(emitter, token)
}

struct Driver<'a> {
    graph: &'a Graph,
    typed: &'a TypedGraph,
    sched: &'a ScheduledFunction,
    groups: &'a StateGroups,
    alloc: &'a AllocationMap,
}

impl<'a> Driver<'a> {
    fn slot_of(&self, var: VarId) -> SlotRef {
        match self.alloc.source(var) {
            ValueSource::Constant { literal } => SlotRef::Constant(literal.clone()),
            ValueSource::Immutable { index } => SlotRef::Immutable { index: *index },
            ValueSource::LocalAllocation { group, index, .. } => SlotRef::Local {
                group: *group,
                index: *index,
            },
            ValueSource::StateField { index, .. } => SlotRef::State { index: *index },
            ValueSource::ReferenceToSingleValueSource { target } => self.slot_of(*target),
        }
    }

    fn term_slot(&self, term: TermId) -> Option<SlotRef> {
        self.typed.var_of(term).map(|v| self.slot_of(v))
    }

    /// Variables whose death position is a scope-exit step: dropped there.
    /// Baked constants own no storage and are exempt.
    fn drops_at_exits(&self) -> HashMap<usize, Vec<VarId>> {
        let mut map: HashMap<usize, Vec<VarId>> = HashMap::new();
        for var in &self.typed.vars {
            if !var.ty.needs_drop() || var.consumed {
                continue;
            }
            if matches!(self.alloc.source(var.id), ValueSource::Constant { .. }) {
                continue;
            }
            let range = self.groups.range(var.id);
            if matches!(self.sched.steps.get(range.last_pos), Some(Step::Exit(_))) {
                map.entry(range.last_pos).or_default().push(var.id);
            }
        }
        map
    }

    fn run<E: CodeEmitter>(&self, emitter: &mut E, token: &CancellationToken) -> Result<(), Cancelled> {
        emitter.begin_function(&self.graph.name, &self.alloc.state_layout, &self.alloc.frames);

        let drops = self.drops_at_exits();
        let boundary: std::collections::HashSet<usize> =
            self.groups.boundaries.iter().copied().collect();
        let mut cur_group = 0usize;
        emitter.begin_group(GroupId(0));

        for (i, step) in self.sched.steps.iter().enumerate() {
            token.check()?;
            if boundary.contains(&i) {
                // Moves belonging to the closing group: loop initialization
                // right before the body starts, carried-slot updates right
                // before the back edge.
                match step {
                    Step::Enter(d) if self.is_loop_body(*d) => {
                        self.emit_loop_init(*d, emitter);
                    }
                    Step::StructureDone(n) => {
                        if let NodeKind::Structure(StructureKind::Loop { body }) =
                            &self.graph.node(*n).kind
                        {
                            self.emit_back_edge_moves(*body, emitter);
                        }
                    }
                    _ => {}
                }
                emitter.end_group(&self.transition_of(cur_group));
                cur_group += 1;
                emitter.begin_group(GroupId(cur_group as u32));
            }

            match step {
                Step::Node(n) => self.emit_node(*n, emitter),
                Step::Enter(d) => {
                    if let Some((case, branch)) = self.case_branch(*d) {
                        if branch == 0 {
                            let cond = self
                                .term_slot(self.graph.node(case).inputs[0])
                                .unwrap_or(SlotRef::Constant(Literal::Bool(true)));
                            emitter.begin_case(&cond);
                        } else {
                            emitter.begin_else();
                        }
                    }
                }
                Step::Exit(_) => {
                    if let Some(vars) = drops.get(&i) {
                        for v in vars {
                            let slot = self.slot_of(*v);
                            emitter.emit_drop(&slot);
                        }
                    }
                }
                Step::StructureDone(n) => {
                    if matches!(
                        self.graph.node(*n).kind,
                        NodeKind::Structure(StructureKind::Case { .. })
                    ) {
                        emitter.end_case();
                    }
                }
            }
        }

        emitter.end_group(&self.transition_of(cur_group));
        emitter.finish_function();
        Ok(())
    }

    fn transition_of(&self, group: usize) -> GroupTransition {
        match self.groups.groups[group].terminator {
            Transition::Advance => GroupTransition::Advance,
            Transition::Complete => GroupTransition::Complete,
            Transition::LoopBack { target, cond } => GroupTransition::LoopBack {
                target,
                cond: self.slot_of(cond),
            },
        }
    }

    fn is_loop_body(&self, d: crate::id::DiagramId) -> bool {
        matches!(
            self.graph.owner_of(d).map(|n| &self.graph.node(n).kind),
            Some(NodeKind::Structure(StructureKind::Loop { .. }))
        )
    }

    fn case_branch(&self, d: crate::id::DiagramId) -> Option<(NodeId, usize)> {
        let owner = self.graph.owner_of(d)?;
        match &self.graph.node(owner).kind {
            NodeKind::Structure(StructureKind::Case { branches }) => branches
                .iter()
                .position(|b| *b == d)
                .map(|i| (owner, i)),
            _ => None,
        }
    }

    /// Initial values move into carried slots in the group before the loop.
    fn emit_loop_init<E: CodeEmitter>(&self, body: crate::id::DiagramId, emitter: &mut E) {
        for &nid in &self.graph.diagram(body).nodes {
            if let NodeKind::Border(BorderKind::LoopTunnel { outer_in, .. }) =
                &self.graph.node(nid).kind
            {
                let init = self.term_slot(*outer_in);
                let carried = self.term_slot(self.graph.node(nid).outputs[0]);
                if let (Some(src), Some(dst)) = (init, carried) {
                    if src != dst {
                        emitter.emit_move(&src, &dst);
                    }
                }
            }
        }
    }

    /// Next-iteration values move into carried slots right before the jump.
    fn emit_back_edge_moves<E: CodeEmitter>(&self, body: crate::id::DiagramId, emitter: &mut E) {
        for &nid in &self.graph.diagram(body).nodes {
            if let NodeKind::Border(BorderKind::LoopTunnel { .. }) = &self.graph.node(nid).kind {
                let next = self.term_slot(self.graph.node(nid).inputs[0]);
                let carried = self.term_slot(self.graph.node(nid).outputs[0]);
                if let (Some(src), Some(dst)) = (next, carried) {
                    if src != dst {
                        emitter.emit_move(&src, &dst);
                    }
                }
            }
        }
    }

    fn emit_node<E: CodeEmitter>(&self, nid: NodeId, emitter: &mut E) {
        let node = self.graph.node(nid);
        match &node.kind {
            NodeKind::Op { code, literal } => {
                self.emit_op(nid, *code, literal.as_ref(), emitter)
            }
            NodeKind::Border(BorderKind::OutputTunnel { outer }) => {
                // Case branches converge by moving their result into the
                // structure output's slot; frame tunnels are identity.
                let owner = self.graph.owner_of(node.diagram);
                let is_case = matches!(
                    owner.map(|o| &self.graph.node(o).kind),
                    Some(NodeKind::Structure(StructureKind::Case { .. }))
                );
                if is_case {
                    let src = self.term_slot(node.inputs[0]);
                    match (src, self.term_slot(*outer)) {
                        (Some(src), Some(dst)) => {
                            if src != dst {
                                emitter.emit_move(&src, &dst);
                            }
                        }
                        (Some(src), None) => {
                            // Unwired structure output: the branch result
                            // dies here.
                            let droppable = self
                                .typed
                                .var_of(node.inputs[0])
                                .map(|v| self.typed.var(v).ty.needs_drop())
                                .unwrap_or(false);
                            if droppable {
                                emitter.emit_drop(&src);
                            }
                        }
                        _ => {}
                    }
                }
            }
            // Identity tunnels and statically resolved borrows emit nothing.
            NodeKind::Border(_) => {}
            NodeKind::Structure(_) => {}
        }
    }

    fn emit_op<E: CodeEmitter>(
        &self,
        nid: NodeId,
        code: OpCode,
        literal: Option<&Literal>,
        emitter: &mut E,
    ) {
        let node = self.graph.node(nid);
        match code {
            OpCode::Const => {
                // Materialize only when the allocator demoted the literal to
                // a mutable slot (e.g. it is mutably borrowed later).
                if let Some(dst) = self.term_slot(node.outputs[0]) {
                    if !matches!(dst, SlotRef::Constant(_)) {
                        let lit = literal.cloned().unwrap_or(Literal::Int(0));
                        emitter.emit_move(&SlotRef::Constant(lit), &dst);
                    }
                }
            }
            OpCode::Add | OpCode::Mul => {
                let op = match (code, self.typed.chosen_sigs.get(&nid).copied()) {
                    (OpCode::Add, Some(1)) => BinaryOp::ConcatStr,
                    (OpCode::Add, _) => BinaryOp::AddI32,
                    _ => BinaryOp::MulI32,
                };
                let a = self.term_slot(node.inputs[0]);
                let b = self.term_slot(node.inputs[1]);
                let dst = self.term_slot(node.outputs[0]);
                if let (Some(a), Some(b), Some(dst)) = (a, b, dst) {
                    emitter.emit_binary(op, &a, &b, &dst);
                }
            }
            OpCode::Inspect => {
                if let Some(src) = self.term_slot(node.inputs[0]) {
                    emitter.emit_inspect(&src);
                }
            }
            OpCode::Assign => {
                // The reference slot already resolves to the owner's slot.
                let target = self.term_slot(node.inputs[0]);
                let value = self.term_slot(node.inputs[1]);
                if let (Some(dst), Some(src)) = (target, value) {
                    emitter.emit_move(&src, &dst);
                }
            }
            OpCode::Deref => {
                let src = self.term_slot(node.inputs[0]);
                let dst = self.term_slot(node.outputs[0]);
                if let (Some(src), Some(dst)) = (src, dst) {
                    emitter.emit_move(&src, &dst);
                }
            }
            OpCode::Drop => {
                if let Some(slot) = self.term_slot(node.inputs[0]) {
                    emitter.emit_drop(&slot);
                }
            }
            OpCode::Yield => {
                // Transfer into the resume slot happens before suspension;
                // identity-merged values already share storage.
                let src = self.term_slot(node.inputs[0]);
                let dst = self.term_slot(node.outputs[0]);
                if let (Some(src), Some(dst)) = (src, dst) {
                    if src != dst {
                        emitter.emit_move(&src, &dst);
                    }
                }
            }
            OpCode::ContinueIf => {
                // Feeds the group transition; no instruction of its own.
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocate::{allocate, collect_inputs};
    use crate::graph::GraphBuilder;
    use crate::partition::partition;
    use crate::schedule::schedule;
    use crate::type_infer::infer;

    /// Records the driver's calls for contract assertions.
    #[derive(Default)]
    struct RecordingEmitter {
        pub events: Vec<String>,
    }

    impl CodeEmitter for RecordingEmitter {
        fn begin_function(
            &mut self,
            name: &str,
            layout: &StateLayout,
            _frames: &HashMap<GroupId, FrameLayout>,
        ) {
            self.events
                .push(format!("fn {} state={}", name, layout.fields.len()));
        }
        fn begin_group(&mut self, group: GroupId) {
            self.events.push(format!("group {}", group.0));
        }
        fn emit_binary(&mut self, op: BinaryOp, _a: &SlotRef, _b: &SlotRef, _dst: &SlotRef) {
            self.events.push(format!("binary {:?}", op));
        }
        fn emit_move(&mut self, _src: &SlotRef, _dst: &SlotRef) {
            self.events.push("move".into());
        }
        fn emit_inspect(&mut self, _src: &SlotRef) {
            self.events.push("inspect".into());
        }
        fn emit_drop(&mut self, _slot: &SlotRef) {
            self.events.push("drop".into());
        }
        fn begin_case(&mut self, _cond: &SlotRef) {
            self.events.push("case".into());
        }
        fn begin_else(&mut self) {
            self.events.push("else".into());
        }
        fn end_case(&mut self) {
            self.events.push("endcase".into());
        }
        fn end_group(&mut self, transition: &GroupTransition) {
            let t = match transition {
                GroupTransition::Advance => "advance",
                GroupTransition::Complete => "complete",
                GroupTransition::LoopBack { .. } => "loopback",
            };
            self.events.push(format!("endgroup {}", t));
        }
        fn finish_function(&mut self) {
            self.events.push("finish".into());
        }
    }

    fn drive(g: &Graph) -> Vec<String> {
        let token = CancellationToken::new();
        let typed = infer(g, &token).unwrap().typed.expect("typed");
        let sched = schedule(g, &typed, &token).unwrap().schedule.expect("sched");
        let part = partition(g, &typed, &sched, &token).unwrap();
        let groups = part.groups.expect("groups");
        let vars = collect_inputs(&typed, &groups);
        let alloc = allocate(&vars, &token).unwrap();
        let mut rec = RecordingEmitter::default();
        emit_function(g, &typed, &sched, &groups, &alloc, &mut rec, &token).unwrap();
        rec.events
    }

    #[test]
    fn straight_line_emits_one_group() {
        let mut b = GraphBuilder::new("f");
        let root = b.root();
        let c1 = b.add_const(root, Literal::Int(2));
        let c2 = b.add_const(root, Literal::Int(3));
        let add = b.add_op(root, OpCode::Add).unwrap();
        let ins = b.add_op(root, OpCode::Inspect).unwrap();
        b.wire(b.out(c1, 0), &[b.inp(add, 0)]).unwrap();
        b.wire(b.out(c2, 0), &[b.inp(add, 1)]).unwrap();
        b.wire(b.out(add, 0), &[b.inp(ins, 0)]).unwrap();
        let g = b.finish().unwrap();

        let events = drive(&g);
        assert_eq!(
            events,
            vec![
                "fn f state=0",
                "group 0",
                "binary AddI32",
                "inspect",
                "endgroup complete",
                "finish",
            ]
        );
    }

    #[test]
    fn case_brackets_branches() {
        let mut b = GraphBuilder::new("f");
        let root = b.root();
        let cond = b.add_const(root, Literal::Bool(true));
        let (case, branches) = b.add_case(root, 2).unwrap();
        b.wire(b.out(cond, 0), &[b.inp(case, 0)]).unwrap();
        let tun = b.add_input_tunnel(case).unwrap();
        let v = b.add_const(root, Literal::Int(9));
        b.wire(b.out(v, 0), &[tun.outer]).unwrap();
        let i0 = b.add_op(branches[0], OpCode::Inspect).unwrap();
        b.wire(b.out(tun.inner[0], 0), &[b.inp(i0, 0)]).unwrap();
        let i1 = b.add_op(branches[1], OpCode::Inspect).unwrap();
        b.wire(b.out(tun.inner[1], 0), &[b.inp(i1, 0)]).unwrap();
        let g = b.finish().unwrap();

        let events = drive(&g);
        let case_pos = events.iter().position(|e| e == "case").unwrap();
        let else_pos = events.iter().position(|e| e == "else").unwrap();
        let end_pos = events.iter().position(|e| e == "endcase").unwrap();
        assert!(case_pos < else_pos && else_pos < end_pos);
        assert_eq!(events.iter().filter(|e| *e == "inspect").count(), 2);
    }

    #[test]
    fn unconsumed_string_drops_at_scope_exit() {
        let mut b = GraphBuilder::new("f");
        let root = b.root();
        let c1 = b.add_const(root, Literal::Str("a".into()));
        let c2 = b.add_const(root, Literal::Str("b".into()));
        let cat = b.add_op(root, OpCode::Add).unwrap();
        let ins = b.add_op(root, OpCode::Inspect).unwrap();
        b.wire(b.out(c1, 0), &[b.inp(cat, 0)]).unwrap();
        b.wire(b.out(c2, 0), &[b.inp(cat, 1)]).unwrap();
        b.wire(b.out(cat, 0), &[b.inp(ins, 0)]).unwrap();
        let g = b.finish().unwrap();

        let events = drive(&g);
        // Only the concatenation result owns heap storage at scope exit;
        // the consumed literal operands do not drop again.
        assert_eq!(events.iter().filter(|e| *e == "drop").count(), 1);
        let ins_pos = events.iter().position(|e| e == "inspect").unwrap();
        let drop_pos = events.iter().position(|e| e == "drop").unwrap();
        assert!(drop_pos > ins_pos);
    }
}
