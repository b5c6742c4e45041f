// pass.rs — Pass descriptor module: metadata, dependency resolution
//
// Declares the compiler's semantic passes (graph construction is outside
// the runner — the editor hands us a finalized graph), their dependency
// edges, and the artifacts they produce. Used by the pipeline runner to
// compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Infer,
    Schedule,
    Partition,
    Allocate,
    EmitBytecode,
    EmitNative,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type in
/// the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Typed,     // TypedGraph
    Schedule,  // ScheduledFunction
    Groups,    // StateGroups
    Alloc,     // AllocationMap
    Bytecode,  // BytecodeFunction
    NativeIr,  // NativeArtifact
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable postcondition evidence produced by a stage verifier.
pub trait StageCert {
    fn all_pass(&self) -> bool;
    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Infer => PassDescriptor {
            name: "infer",
            inputs: &[],
            outputs: &[ArtifactId::Typed],
            invalidation_key: "graph topology + signature tables",
            invariants: "every terminal typed, borrows well-formed",
        },
        PassId::Schedule => PassDescriptor {
            name: "schedule",
            inputs: &[PassId::Infer],
            outputs: &[ArtifactId::Schedule],
            invalidation_key: "graph + typed",
            invariants: "every node ordered once, sources precede sinks",
        },
        PassId::Partition => PassDescriptor {
            name: "partition",
            inputs: &[PassId::Schedule],
            outputs: &[ArtifactId::Groups],
            invalidation_key: "graph + schedule",
            invariants: "groups tile the linearization, live ranges computed",
        },
        PassId::Allocate => PassDescriptor {
            name: "allocate",
            inputs: &[PassId::Partition],
            outputs: &[ArtifactId::Alloc],
            invalidation_key: "typed + groups",
            invariants: "one ValueSource per variable, aliases resolved",
        },
        PassId::EmitBytecode => PassDescriptor {
            name: "emit_bytecode",
            inputs: &[PassId::Allocate],
            outputs: &[ArtifactId::Bytecode],
            invalidation_key: "schedule + groups + alloc",
            invariants: "state layout identical to the allocation map",
        },
        PassId::EmitNative => PassDescriptor {
            name: "emit_native",
            inputs: &[PassId::Allocate],
            outputs: &[ArtifactId::NativeIr],
            invalidation_key: "schedule + groups + alloc",
            invariants: "state layout identical to the allocation map",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 6] = [
    PassId::Infer,
    PassId::Schedule,
    PassId::Partition,
    PassId::Allocate,
    PassId::EmitBytecode,
    PassId::EmitNative,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
