// allocate.rs — Variable storage allocation for partitioned Loom graphs
//
// Assigns exactly one ValueSource to every variable, in fixed policy order:
// baked constants, immutable values, persisted state fields for anything
// crossing a group boundary, resolved aliases for borrow references, and
// first-fit-reused local frame slots for the rest. State field indices are
// dense and depend only on variable creation order, so an unchanged graph
// always produces the same persisted layout.
//
// Preconditions: `vars` assembled from a typed graph and its state groups
//   (`collect_inputs`), or constructed directly by tests.
// Postconditions: every variable has one ValueSource; aliases point at
//   non-alias sources; overlapping locals never share a slot.
// Failure modes: alias cycles are an internal invariant violation — fatal,
//   never downgraded to a user diagnostic.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use crate::cancel::{CancellationToken, Cancelled};
use crate::id::{GroupId, VarId};
use crate::partition::StateGroups;
use crate::signature::{Literal, Type};
use crate::type_infer::TypedGraph;

// ── Public types ────────────────────────────────────────────────────────────

/// The storage-class decision for one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSource {
    /// Baked literal; no runtime storage.
    Constant { literal: Literal },
    /// Write-once value in the function's immutable pool.
    Immutable { index: u32 },
    /// Frame slot scoped to one state group; indices reuse across
    /// non-overlapping live ranges.
    LocalAllocation { group: GroupId, index: u32, size: u32 },
    /// Slot in the persisted continuation record; survives suspension.
    StateField { index: u32, size: u32 },
    /// Alias of another variable's storage, resolved to a non-alias target.
    ReferenceToSingleValueSource { target: VarId },
}

/// One persisted field of the continuation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFieldInfo {
    pub var: VarId,
    pub index: u32,
    pub size: u32,
}

/// Dense, zero-based persisted record layout. Stable for a fixed topology;
/// both backends must reproduce it byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateLayout {
    pub fields: Vec<StateFieldInfo>,
}

impl StateLayout {
    pub fn total_size(&self) -> u32 {
        self.fields.iter().map(|f| f.size).sum()
    }
}

/// Local slot sizes for one group's frame.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    pub slots: Vec<u32>,
}

/// The allocator's complete output.
#[derive(Debug, Clone)]
pub struct AllocationMap {
    /// Indexed by VarId.
    pub sources: Vec<ValueSource>,
    pub state_layout: StateLayout,
    pub frames: HashMap<GroupId, FrameLayout>,
    /// Number of immutable pool entries.
    pub immutable_count: u32,
}

impl AllocationMap {
    pub fn source(&self, var: VarId) -> &ValueSource {
        &self.sources[var.0 as usize]
    }
}

/// Allocator input: one record per variable, in VarId order.
#[derive(Debug, Clone)]
pub struct AllocVar {
    pub id: VarId,
    pub ty: Type,
    pub literal: Option<Literal>,
    pub read_only: bool,
    pub alias_of: Option<VarId>,
    /// Mutably borrowed or written through an alias.
    pub mutated: bool,
    pub crosses: bool,
    pub def_pos: usize,
    pub last_pos: usize,
    pub def_group: GroupId,
}

/// Internal invariant violation. Aborts the compilation of this unit; the
/// pipeline must not present it as a user-facing diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    Invariant {
        message: String,
        first: VarId,
        second: VarId,
    },
    Cancelled,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Invariant {
                message,
                first,
                second,
            } => write!(
                f,
                "allocator invariant violation: {} (variables {} and {})",
                message, first.0, second.0
            ),
            AllocError::Cancelled => write!(f, "allocation cancelled"),
        }
    }
}

impl From<Cancelled> for AllocError {
    fn from(_: Cancelled) -> Self {
        AllocError::Cancelled
    }
}

// ── Input assembly ──────────────────────────────────────────────────────────

/// Assemble the allocator's input from inference and partition output.
pub fn collect_inputs(typed: &TypedGraph, groups: &StateGroups) -> Vec<AllocVar> {
    typed
        .vars
        .iter()
        .map(|v| {
            let r = groups.range(v.id);
            AllocVar {
                id: v.id,
                ty: v.ty.clone(),
                literal: v.literal.clone(),
                read_only: v.read_only,
                alias_of: v.alias_of,
                mutated: v.mut_borrowed || v.assigned_through,
                crosses: r.crosses,
                def_pos: r.def_pos,
                last_pos: r.last_pos,
                def_group: r.def_group,
            }
        })
        .collect()
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Assign one ValueSource to every variable.
pub fn allocate(vars: &[AllocVar], token: &CancellationToken) -> Result<AllocationMap, AllocError> {
    token.check()?;

    // Alias targets cannot take the Immutable shortcut: the alias must be
    // able to observe in-place mutation of the target's slot.
    let mut alias_targets: Vec<bool> = vec![false; vars.len()];
    for v in vars {
        if let Some(t) = v.alias_of {
            let resolved = resolve_alias(vars, v.id, t)?;
            alias_targets[resolved.0 as usize] = true;
        }
    }

    let mut sources: Vec<Option<ValueSource>> = vec![None; vars.len()];
    let mut state_layout = StateLayout::default();
    let mut immutable_count = 0u32;
    let mut locals: Vec<(VarId, GroupId)> = Vec::new();

    for v in vars {
        token.check()?;
        let src = if v.alias_of.is_none() && v.literal.is_some() && !v.mutated {
            ValueSource::Constant {
                literal: v.literal.clone().unwrap_or(Literal::Int(0)),
            }
        } else if v.alias_of.is_none()
            && v.read_only
            && !v.crosses
            && !alias_targets[v.id.0 as usize]
        {
            let index = immutable_count;
            immutable_count += 1;
            ValueSource::Immutable { index }
        } else if v.crosses {
            let index = state_layout.fields.len() as u32;
            let size = v.ty.byte_size();
            state_layout.fields.push(StateFieldInfo {
                var: v.id,
                index,
                size,
            });
            ValueSource::StateField { index, size }
        } else if let Some(target) = v.alias_of {
            let resolved = resolve_alias(vars, v.id, target)?;
            ValueSource::ReferenceToSingleValueSource { target: resolved }
        } else {
            locals.push((v.id, v.def_group));
            ValueSource::LocalAllocation {
                group: v.def_group,
                index: u32::MAX, // patched below
                size: v.ty.byte_size(),
            }
        };
        sources[v.id.0 as usize] = Some(src);
    }

    // First-fit local slot reuse per group frame: ascending index, never
    // sharing a slot between overlapping live ranges.
    let mut frames: HashMap<GroupId, FrameLayout> = HashMap::new();
    let mut occupancy: HashMap<GroupId, Vec<Vec<(usize, usize)>>> = HashMap::new();
    for (var, group) in locals {
        token.check()?;
        let v = &vars[var.0 as usize];
        let range = (v.def_pos, v.last_pos);
        let slots = occupancy.entry(group).or_default();
        let frame = frames.entry(group).or_default();
        let mut chosen = None;
        for (i, occupants) in slots.iter().enumerate() {
            if occupants.iter().all(|o| disjoint(*o, range)) {
                chosen = Some(i);
                break;
            }
        }
        let idx = match chosen {
            Some(i) => i,
            None => {
                slots.push(Vec::new());
                frame.slots.push(0);
                slots.len() - 1
            }
        };
        slots[idx].push(range);
        let size = v.ty.byte_size();
        frame.slots[idx] = frame.slots[idx].max(size);
        if let Some(ValueSource::LocalAllocation { index, .. }) = &mut sources[var.0 as usize] {
            *index = idx as u32;
        }
    }

    let sources: Vec<ValueSource> = sources
        .into_iter()
        .map(|s| s.unwrap_or(ValueSource::Immutable { index: 0 }))
        .collect();

    Ok(AllocationMap {
        sources,
        state_layout,
        frames,
        immutable_count,
    })
}

fn disjoint(a: (usize, usize), b: (usize, usize)) -> bool {
    a.1 < b.0 || b.1 < a.0
}

/// Follow an alias chain to its ultimate non-alias source. A cycle means an
/// earlier stage produced garbage; abort with both endpoints named.
fn resolve_alias(vars: &[AllocVar], start: VarId, first: VarId) -> Result<VarId, AllocError> {
    let mut seen = vec![start];
    let mut cur = first;
    loop {
        if seen.contains(&cur) {
            let witness = *seen.last().unwrap_or(&cur);
            return Err(AllocError::Invariant {
                message: "alias cycle detected".into(),
                first: start,
                second: witness,
            });
        }
        seen.push(cur);
        match vars[cur.0 as usize].alias_of {
            Some(next) => cur = next,
            None => return Ok(cur),
        }
    }
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for allocation postconditions (A1-A4).
#[derive(Debug, Clone)]
pub struct AllocCert {
    /// A1: exactly one ValueSource per variable.
    pub a1_one_source_per_var: bool,
    /// A2: boundary-crossing variables (other than baked constants) are
    /// state fields, and only they are.
    pub a2_statefield_iff_crossing: bool,
    /// A3: alias sources point at non-alias targets.
    pub a3_aliases_resolved: bool,
    /// A4: locals sharing a (group, index) slot have disjoint live ranges.
    pub a4_no_local_overlap: bool,
}

impl crate::pass::StageCert for AllocCert {
    fn all_pass(&self) -> bool {
        self.a1_one_source_per_var
            && self.a2_statefield_iff_crossing
            && self.a3_aliases_resolved
            && self.a4_no_local_overlap
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("A1_one_source_per_var", self.a1_one_source_per_var),
            ("A2_statefield_iff_crossing", self.a2_statefield_iff_crossing),
            ("A3_aliases_resolved", self.a3_aliases_resolved),
            ("A4_no_local_overlap", self.a4_no_local_overlap),
        ]
    }
}

/// Verify allocation postconditions against the input records.
pub fn verify_allocation(vars: &[AllocVar], map: &AllocationMap) -> AllocCert {
    let a1 = map.sources.len() == vars.len();

    let mut a2 = true;
    for v in vars {
        let src = &map.sources[v.id.0 as usize];
        let is_state = matches!(src, ValueSource::StateField { .. });
        let is_const = matches!(src, ValueSource::Constant { .. });
        if v.crosses && !is_state && !is_const {
            a2 = false;
        }
        if !v.crosses && is_state {
            a2 = false;
        }
    }

    let mut a3 = true;
    for src in &map.sources {
        if let ValueSource::ReferenceToSingleValueSource { target } = src {
            if vars[target.0 as usize].alias_of.is_some() {
                a3 = false;
            }
        }
    }

    let mut a4 = true;
    let mut by_slot: HashMap<(GroupId, u32), Vec<(usize, usize)>> = HashMap::new();
    for v in vars {
        if let ValueSource::LocalAllocation { group, index, .. } = &map.sources[v.id.0 as usize] {
            by_slot
                .entry((*group, *index))
                .or_default()
                .push((v.def_pos, v.last_pos));
        }
    }
    for ranges in by_slot.values() {
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if !disjoint(*a, *b) {
                    a4 = false;
                }
            }
        }
    }

    AllocCert {
        a1_one_source_per_var: a1,
        a2_statefield_iff_crossing: a2,
        a3_aliases_resolved: a3,
        a4_no_local_overlap: a4,
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for AllocationMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AllocationMap ({} variables)", self.sources.len())?;
        for (i, src) in self.sources.iter().enumerate() {
            let desc = match src {
                ValueSource::Constant { literal } => format!("constant {}", literal),
                ValueSource::Immutable { index } => format!("immutable #{}", index),
                ValueSource::LocalAllocation { group, index, size } => {
                    format!("local g{}[{}] ({}B)", group.0, index, size)
                }
                ValueSource::StateField { index, size } => {
                    format!("state[{}] ({}B)", index, size)
                }
                ValueSource::ReferenceToSingleValueSource { target } => {
                    format!("alias -> var {}", target.0)
                }
            };
            writeln!(f, "  var {}: {}", i, desc)?;
        }
        if !self.state_layout.fields.is_empty() {
            writeln!(
                f,
                "  state record: {} fields, {} bytes",
                self.state_layout.fields.len(),
                self.state_layout.total_size()
            )?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::StageCert;

    fn var(id: u32) -> AllocVar {
        AllocVar {
            id: VarId(id),
            ty: Type::Int32,
            literal: None,
            read_only: true,
            alias_of: None,
            mutated: false,
            crosses: false,
            def_pos: id as usize,
            last_pos: id as usize + 1,
            def_group: GroupId(0),
        }
    }

    #[test]
    fn literal_gets_constant_source() {
        let mut v = var(0);
        v.literal = Some(Literal::Int(5));
        let map = allocate(&[v.clone()], &CancellationToken::new()).unwrap();
        assert_eq!(
            map.source(VarId(0)),
            &ValueSource::Constant {
                literal: Literal::Int(5)
            }
        );
        let cert = verify_allocation(&[v], &map);
        assert!(cert.all_pass(), "{:?}", cert.obligations());
    }

    #[test]
    fn mutated_literal_is_not_constant() {
        let mut v = var(0);
        v.literal = Some(Literal::Int(5));
        v.mutated = true;
        v.read_only = false;
        let map = allocate(&[v], &CancellationToken::new()).unwrap();
        assert!(matches!(
            map.source(VarId(0)),
            ValueSource::LocalAllocation { .. }
        ));
    }

    #[test]
    fn read_only_value_is_immutable() {
        let map = allocate(&[var(0)], &CancellationToken::new()).unwrap();
        assert_eq!(map.source(VarId(0)), &ValueSource::Immutable { index: 0 });
    }

    #[test]
    fn crossing_variable_is_state_field_with_dense_indices() {
        let mut a = var(0);
        a.crosses = true;
        a.read_only = false;
        let mut b = var(1);
        b.crosses = true;
        b.read_only = false;
        b.ty = Type::Str;
        let vars = vec![a, b];
        let map = allocate(&vars, &CancellationToken::new()).unwrap();
        assert_eq!(
            map.source(VarId(0)),
            &ValueSource::StateField { index: 0, size: 4 }
        );
        assert_eq!(
            map.source(VarId(1)),
            &ValueSource::StateField { index: 1, size: 16 }
        );
        assert_eq!(map.state_layout.total_size(), 20);
        let cert = verify_allocation(&vars, &map);
        assert!(cert.all_pass(), "{:?}", cert.obligations());
    }

    #[test]
    fn state_indices_are_stable_across_runs() {
        let mut vars = Vec::new();
        for i in 0..6 {
            let mut v = var(i);
            v.crosses = i % 2 == 0;
            v.read_only = false;
            vars.push(v);
        }
        let m1 = allocate(&vars, &CancellationToken::new()).unwrap();
        let m2 = allocate(&vars, &CancellationToken::new()).unwrap();
        assert_eq!(m1.state_layout, m2.state_layout);
    }

    #[test]
    fn alias_chain_resolves_to_ultimate_source() {
        let mut owner = var(0);
        owner.read_only = false;
        owner.mutated = true;
        let mut r1 = var(1);
        r1.alias_of = Some(VarId(0));
        let mut r2 = var(2);
        r2.alias_of = Some(VarId(1));
        let vars = vec![owner, r1, r2];
        let map = allocate(&vars, &CancellationToken::new()).unwrap();
        assert_eq!(
            map.source(VarId(2)),
            &ValueSource::ReferenceToSingleValueSource { target: VarId(0) }
        );
        let cert = verify_allocation(&vars, &map);
        assert!(cert.all_pass(), "{:?}", cert.obligations());
    }

    #[test]
    fn alias_cycle_is_fatal_and_names_both() {
        let mut a = var(0);
        a.alias_of = Some(VarId(1));
        let mut b = var(1);
        b.alias_of = Some(VarId(0));
        let err = allocate(&[a, b], &CancellationToken::new()).unwrap_err();
        match err {
            AllocError::Invariant { first, second, .. } => {
                assert_eq!(first, VarId(0));
                assert_eq!(second, VarId(1));
            }
            other => panic!("expected invariant violation, got {:?}", other),
        }
    }

    #[test]
    fn local_slots_reuse_only_disjoint_ranges() {
        // a: [0,2], b: [3,5] → same slot; c: [1,4] overlaps both → new slot.
        let mk = |id: u32, def: usize, last: usize| {
            let mut v = var(id);
            v.read_only = false;
            v.def_pos = def;
            v.last_pos = last;
            v
        };
        let vars = vec![mk(0, 0, 2), mk(1, 3, 5), mk(2, 1, 4)];
        let map = allocate(&vars, &CancellationToken::new()).unwrap();
        let idx = |i: u32| match map.source(VarId(i)) {
            ValueSource::LocalAllocation { index, .. } => *index,
            other => panic!("expected local, got {:?}", other),
        };
        assert_eq!(idx(0), 0);
        assert_eq!(idx(1), 0);
        assert_eq!(idx(2), 1);
        let cert = verify_allocation(&vars, &map);
        assert!(cert.all_pass(), "{:?}", cert.obligations());
    }

    #[test]
    fn alias_target_is_never_immutable() {
        let owner = var(0); // read-only, but aliased
        let mut r = var(1);
        r.alias_of = Some(VarId(0));
        let vars = vec![owner, r];
        let map = allocate(&vars, &CancellationToken::new()).unwrap();
        assert!(matches!(
            map.source(VarId(0)),
            ValueSource::LocalAllocation { .. }
        ));
    }

    #[test]
    fn cancelled_allocation_stops() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            allocate(&[var(0)], &token),
            Err(AllocError::Cancelled)
        ));
    }
}
