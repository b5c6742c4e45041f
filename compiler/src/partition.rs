// partition.rs — Async state-group partitioning for scheduled Loom graphs
//
// Walks the global linearization and cuts it into state groups at every
// suspension point and at loop entry / back-edge positions, forming the
// resumable state machine both backends emit. Also computes the per-variable
// live ranges and boundary-crossing flags the allocator consumes; the
// partitioner itself never allocates storage.
//
// Preconditions: `sched` is the schedule for `graph`; `typed` its inference.
// Postconditions: groups partition the step sequence contiguously; every
//   variable has a live range and a crossing flag.
// Failure modes: suspension or loop boundaries inside a case branch, and
//   loops without a continuation flag, produce `Diagnostic` entries (E0501).
// Side effects: none.

use std::fmt;

use crate::cancel::{CancellationToken, Cancelled};
use crate::diag::{codes, DiagLevel, Diagnostic, Subject};
use crate::graph::{Graph, NodeKind, StructureKind};
use crate::id::{DiagramId, GroupId, NodeId, VarId};
use crate::schedule::{ScheduledFunction, Step};
use crate::signature::{self, OpCode};
use crate::type_infer::TypedGraph;

// ── Public types ────────────────────────────────────────────────────────────

/// How a group hands control off when its nodes have run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Enter the next group.
    Advance,
    /// Loop back edge: jump to `target` while `cond` holds, else advance.
    LoopBack { target: GroupId, cond: VarId },
    /// Function complete.
    Complete,
}

/// A maximal run of steps executable without suspension.
#[derive(Debug, Clone)]
pub struct AsyncStateGroup {
    pub id: GroupId,
    /// Inclusive step range in the schedule's linearization.
    pub first_step: usize,
    pub last_step: usize,
    /// Primitive/border nodes executing in this group, in order.
    pub nodes: Vec<NodeId>,
    pub terminator: Transition,
}

/// Live range of one variable over step positions.
#[derive(Debug, Clone, Copy)]
pub struct VarRange {
    pub var: VarId,
    pub def_pos: usize,
    pub last_pos: usize,
    /// True if a group boundary falls strictly after the definition and at
    /// or before the last use — the sole trigger for `StateField` storage.
    pub crosses: bool,
    pub def_group: GroupId,
}

/// The partitioned state machine plus the allocator's boundary annotations.
#[derive(Debug, Clone)]
pub struct StateGroups {
    pub groups: Vec<AsyncStateGroup>,
    /// Sorted positions `b`: a new group starts at step `b`.
    pub boundaries: Vec<usize>,
    /// Indexed by VarId.
    pub ranges: Vec<VarRange>,
    /// Step index → owning group.
    pub group_of_step: Vec<GroupId>,
}

impl StateGroups {
    pub fn range(&self, var: VarId) -> &VarRange {
        &self.ranges[var.0 as usize]
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Result of partitioning.
pub struct PartitionResult {
    pub groups: Option<StateGroups>,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for partition postconditions (P1-P3).
#[derive(Debug, Clone)]
pub struct PartitionCert {
    /// P1: groups tile the step sequence contiguously with no gap.
    pub p1_groups_tile_steps: bool,
    /// P2: every non-crossing variable lives inside a single group.
    pub p2_noncrossing_single_group: bool,
    /// P3: loop back-edges target the first group of their body.
    pub p3_backedges_target_body: bool,
}

impl crate::pass::StageCert for PartitionCert {
    fn all_pass(&self) -> bool {
        self.p1_groups_tile_steps && self.p2_noncrossing_single_group && self.p3_backedges_target_body
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("P1_groups_tile_steps", self.p1_groups_tile_steps),
            ("P2_noncrossing_single_group", self.p2_noncrossing_single_group),
            ("P3_backedges_target_body", self.p3_backedges_target_body),
        ]
    }
}

/// Verify partition postconditions.
pub fn verify_partition(sched: &ScheduledFunction, groups: &StateGroups) -> PartitionCert {
    let mut p1 = true;
    let mut next = 0usize;
    for g in &groups.groups {
        if g.first_step != next || g.last_step < g.first_step {
            p1 = false;
        }
        next = g.last_step + 1;
    }
    if next != sched.steps.len() {
        p1 = false;
    }

    let mut p2 = true;
    for r in &groups.ranges {
        if !r.crosses {
            let dg = groups.group_of_step[r.def_pos];
            let lg = groups.group_of_step[r.last_pos];
            if dg != lg {
                p2 = false;
            }
        }
    }

    let mut p3 = true;
    for g in &groups.groups {
        if let Transition::LoopBack { target, .. } = g.terminator {
            // A single-group body jumps to its own start; targets never lie
            // forward of the back edge.
            if target.0 as usize >= groups.groups.len() || target > g.id {
                p3 = false;
            }
        }
    }

    PartitionCert {
        p1_groups_tile_steps: p1,
        p2_noncrossing_single_group: p2,
        p3_backedges_target_body: p3,
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Partition a scheduled graph into async state groups.
pub fn partition(
    graph: &Graph,
    typed: &TypedGraph,
    sched: &ScheduledFunction,
    token: &CancellationToken,
) -> Result<PartitionResult, Cancelled> {
    token.check()?;
    let mut ctx = PartitionCtx {
        graph,
        typed,
        sched,
        diagnostics: Vec::new(),
    };

    let boundaries = ctx.find_boundaries(token)?;
    if crate::diag::has_errors(&ctx.diagnostics) {
        return Ok(PartitionResult {
            groups: None,
            diagnostics: ctx.diagnostics,
        });
    }

    let (groups, group_of_step) = ctx.build_groups(&boundaries);
    let ranges = ctx.compute_ranges(&boundaries, &group_of_step, token)?;

    Ok(PartitionResult {
        groups: Some(StateGroups {
            groups,
            boundaries,
            ranges,
            group_of_step,
        }),
        diagnostics: ctx.diagnostics,
    })
}

// ── Internal context ────────────────────────────────────────────────────────

struct PartitionCtx<'a> {
    graph: &'a Graph,
    typed: &'a TypedGraph,
    sched: &'a ScheduledFunction,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> PartitionCtx<'a> {
    fn owner_kind(&self, d: DiagramId) -> Option<&StructureKind> {
        self.graph.owner_of(d).map(|n| match &self.graph.node(n).kind {
            NodeKind::Structure(k) => k,
            _ => unreachable!("diagram owner is always a structure"),
        })
    }

    fn is_loop_body(&self, d: DiagramId) -> bool {
        matches!(self.owner_kind(d), Some(StructureKind::Loop { .. }))
    }

    fn is_case_branch(&self, d: DiagramId) -> bool {
        matches!(self.owner_kind(d), Some(StructureKind::Case { .. }))
    }

    /// Boundary positions: a new group starts at each returned step index.
    fn find_boundaries(&mut self, token: &CancellationToken) -> Result<Vec<usize>, Cancelled> {
        let mut boundaries = Vec::new();
        let mut case_depth = 0usize;

        for (i, step) in self.sched.steps.iter().enumerate() {
            token.check()?;
            match step {
                Step::Enter(d) => {
                    if self.is_case_branch(*d) {
                        case_depth += 1;
                    }
                    if self.is_loop_body(*d) {
                        if case_depth > 0 {
                            self.case_boundary_error(Subject::Diagram(*d));
                        }
                        boundaries.push(i);
                    }
                }
                Step::Exit(d) => {
                    if self.is_case_branch(*d) {
                        case_depth = case_depth.saturating_sub(1);
                    }
                }
                Step::StructureDone(n) => {
                    if matches!(
                        self.graph.node(*n).kind,
                        NodeKind::Structure(StructureKind::Loop { .. })
                    ) {
                        // Post-loop code resumes in a fresh group so the
                        // back edge has a well-defined fall-through.
                        boundaries.push(i);
                    }
                }
                Step::Node(n) => {
                    let suspends = self
                        .graph
                        .node(*n)
                        .op_code()
                        .map(signature::suspends)
                        .unwrap_or(false);
                    if suspends {
                        if case_depth > 0 {
                            self.case_boundary_error(Subject::Node(*n));
                        }
                        boundaries.push(i + 1);
                    }
                }
            }
        }
        boundaries.sort_unstable();
        boundaries.dedup();
        boundaries.retain(|b| *b > 0 && *b < self.sched.steps.len());
        Ok(boundaries)
    }

    fn case_boundary_error(&mut self, subject: Subject) {
        self.diagnostics.push(
            Diagnostic::new(
                DiagLevel::Error,
                subject,
                "suspension or loop boundary inside a case branch is not supported",
            )
            .with_code(codes::E0501)
            .with_hint("hoist the suspending operation out of the conditional"),
        );
    }

    fn build_groups(&mut self, boundaries: &[usize]) -> (Vec<AsyncStateGroup>, Vec<GroupId>) {
        let n_steps = self.sched.steps.len();
        let mut starts = vec![0usize];
        starts.extend_from_slice(boundaries);

        let mut group_of_step = vec![GroupId(0); n_steps];
        let mut groups = Vec::new();
        for (gi, &start) in starts.iter().enumerate() {
            let end = starts.get(gi + 1).map(|s| s - 1).unwrap_or(n_steps - 1);
            let id = GroupId(gi as u32);
            for pos in start..=end {
                group_of_step[pos] = id;
            }
            let nodes = (start..=end)
                .filter_map(|pos| match self.sched.steps[pos] {
                    Step::Node(n) => Some(n),
                    _ => None,
                })
                .collect();
            groups.push(AsyncStateGroup {
                id,
                first_step: start,
                last_step: end,
                nodes,
                terminator: Transition::Advance,
            });
        }

        // Terminators: a group ending at a loop body's exit jumps back to
        // the body's first group; the final group completes the function.
        let last = groups.len() - 1;
        for g in &mut groups {
            let is_last = g.id.0 as usize == last;
            let ends_loop_body = match self.sched.steps[g.last_step] {
                Step::Exit(d) => self.is_loop_body(d),
                _ => false,
            };
            if ends_loop_body {
                if let Step::Exit(d) = self.sched.steps[g.last_step] {
                    let target = self.body_entry_group(d, &group_of_step);
                    let cond = self.loop_condition_var(d);
                    match (target, cond) {
                        (Some(target), Some(cond)) => {
                            g.terminator = Transition::LoopBack { target, cond };
                        }
                        _ => {
                            // loop_condition_var already reported.
                        }
                    }
                }
            } else if is_last {
                g.terminator = Transition::Complete;
            }
        }

        (groups, group_of_step)
    }

    fn body_entry_group(&self, body: DiagramId, group_of_step: &[GroupId]) -> Option<GroupId> {
        self.sched
            .steps
            .iter()
            .position(|s| *s == Step::Enter(body))
            .map(|i| group_of_step[i])
    }

    /// The boolean variable feeding the body's `continue_if` node.
    fn loop_condition_var(&mut self, body: DiagramId) -> Option<VarId> {
        let mut found = None;
        for &nid in &self.graph.diagram(body).nodes {
            if self.graph.node(nid).op_code() == Some(OpCode::ContinueIf) {
                if found.is_some() {
                    self.diagnostics.push(
                        Diagnostic::new(
                            DiagLevel::Error,
                            Subject::Node(nid),
                            "loop body has more than one continue_if node",
                        )
                        .with_code(codes::E0501),
                    );
                    return None;
                }
                found = Some(nid);
            }
        }
        let node = match found {
            Some(n) => n,
            None => {
                self.diagnostics.push(
                    Diagnostic::new(
                        DiagLevel::Error,
                        Subject::Diagram(body),
                        "loop body has no continue_if node",
                    )
                    .with_code(codes::E0501)
                    .with_hint("wire a boolean into a continue_if to bound the loop"),
                );
                return None;
            }
        };
        self.typed.var_of(self.graph.node(node).inputs[0])
    }

    /// Per-variable live ranges over step positions. The range runs from the
    /// definition to the last use, extended to the scope-exit drop point for
    /// droppable variables that nothing consumes.
    fn compute_ranges(
        &mut self,
        boundaries: &[usize],
        group_of_step: &[GroupId],
        token: &CancellationToken,
    ) -> Result<Vec<VarRange>, Cancelled> {
        let mut ranges = Vec::with_capacity(self.typed.vars.len());
        for var in &self.typed.vars {
            token.check()?;
            let def_pos = self
                .sched
                .node_pos
                .get(&var.def_node)
                .copied()
                .unwrap_or(0);
            let mut last_pos = def_pos;
            let mut outermost: DiagramId = self.graph.node(var.def_node).diagram;
            for u in &var.uses {
                if let Some(p) = self.sched.node_pos.get(&u.node) {
                    last_pos = last_pos.max(*p);
                }
                let ud = self.graph.node(u.node).diagram;
                if self.graph.diagram(ud).depth < self.graph.diagram(outermost).depth {
                    outermost = ud;
                }
            }
            if var.ty.needs_drop() && !var.consumed {
                if let Some(exit) = self.sched.exit_pos.get(&outermost) {
                    last_pos = last_pos.max(*exit);
                }
            }
            let crosses = boundaries
                .iter()
                .any(|b| def_pos < *b && *b <= last_pos);
            ranges.push(VarRange {
                var: var.id,
                def_pos,
                last_pos,
                crosses,
                def_group: group_of_step[def_pos],
            });
        }
        Ok(ranges)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for StateGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StateGroups ({} groups)", self.groups.len())?;
        for g in &self.groups {
            let nodes: Vec<String> = g.nodes.iter().map(|n| n.0.to_string()).collect();
            let term = match g.terminator {
                Transition::Advance => "advance".to_string(),
                Transition::LoopBack { target, cond } => {
                    format!("loop-back -> group {} while var {}", target.0, cond.0)
                }
                Transition::Complete => "complete".to_string(),
            };
            writeln!(
                f,
                "  group {} (steps {}..={}): nodes [{}], {}",
                g.id.0,
                g.first_step,
                g.last_step,
                nodes.join(", "),
                term
            )?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
