// pipeline.rs — Compilation orchestration for one function graph
//
// Runs the stage chain (infer → schedule → partition → allocate → emit) with
// cooperative cancellation, verifying each stage's certificate before the
// next stage consumes its output. User-facing diagnostics fail the compile
// as `CompileError::Diagnostics`; stage-certificate and allocator invariant
// failures abort as `CompileError::Invariant` and are never presented as
// user diagnostics.
//
// Preconditions: `graph` passed `Graph::validate`.
// Postconditions: on success, every requested artifact is populated and the
//   two backends embed identical state layouts.
// Failure modes: diagnostics, internal invariant violations, cancellation.
// Side effects: stage timing goes to the `log` crate at debug level.

use std::time::Instant;

use thiserror::Error;

use crate::allocate::{self, AllocError, AllocationMap};
use crate::bytecode::{BytecodeEmitter, BytecodeFunction};
use crate::cancel::{CancellationToken, Cancelled};
use crate::diag::{DiagLevel, Diagnostic};
use crate::emit::emit_function;
use crate::graph::Graph;
use crate::native::{NativeArtifact, NativeEmitter};
use crate::partition::{self, StateGroups};
use crate::pass::{PassId, StageCert};
use crate::schedule::{self, ScheduledFunction};
use crate::type_infer::{self, TypedGraph};

// ── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub emit_bytecode: bool,
    pub emit_native: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            emit_bytecode: true,
            emit_native: true,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Top-level compilation failure.
#[derive(Debug, Error)]
pub enum CompileError {
    /// User-facing diagnostics; all independent diagrams were checked
    /// before reporting, so one compile surfaces every independent error.
    #[error("{failing_pass:?} produced {} error diagnostic(s)", diagnostics.iter().filter(|d| d.level == DiagLevel::Error).count())]
    Diagnostics {
        failing_pass: PassId,
        diagnostics: Vec<Diagnostic>,
    },
    /// Internal defect in a compiler stage. Fatal for this unit; never
    /// downgraded to a user diagnostic.
    #[error("internal invariant violation in {pass:?}: {message}")]
    Invariant { pass: PassId, message: String },
    #[error("compilation cancelled")]
    Cancelled,
}

impl From<Cancelled> for CompileError {
    fn from(_: Cancelled) -> Self {
        CompileError::Cancelled
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Topology fingerprint for hermetic-layout guarantees: the same graph
/// topology always produces the same persisted state record.
///
/// `topology_hash`: SHA-256 of the canonical graph encoding.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub topology_hash: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the topology hash (64 characters).
    pub fn topology_hash_hex(&self) -> String {
        bytes_to_hex(&self.topology_hash)
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Compute the topology fingerprint of a graph.
///
/// The encoding walks arenas in id order (never hash-map order): diagrams
/// with owners and depths, nodes with kind tags and terminal counts, wires
/// with endpoints, and the tunnel pairing table sorted by begin id.
pub fn compute_provenance(graph: &Graph) -> Provenance {
    use sha2::{Digest, Sha256};

    let mut bytes: Vec<u8> = Vec::new();
    for d in graph.diagrams() {
        bytes.extend_from_slice(&d.id.0.to_le_bytes());
        bytes.extend_from_slice(&d.owner.map(|n| n.0 + 1).unwrap_or(0).to_le_bytes());
        bytes.extend_from_slice(&d.depth.to_le_bytes());
    }
    for n in graph.nodes() {
        bytes.extend_from_slice(&n.id.0.to_le_bytes());
        bytes.extend_from_slice(&n.diagram.0.to_le_bytes());
        bytes.push(kind_tag(&n.kind));
        bytes.extend_from_slice(&(n.inputs.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(n.outputs.len() as u32).to_le_bytes());
    }
    for w in graph.wires() {
        bytes.extend_from_slice(&w.id.0.to_le_bytes());
        bytes.extend_from_slice(&w.source.0.to_le_bytes());
        for s in &w.sinks {
            bytes.extend_from_slice(&s.0.to_le_bytes());
        }
        bytes.push(0xff);
    }
    let mut pairs: Vec<(u32, u32)> = graph
        .nodes()
        .filter_map(|n| graph.paired_tunnel(n.id).map(|p| (n.id.0, p.0)))
        .collect();
    pairs.sort_unstable();
    for (a, b) in pairs {
        bytes.extend_from_slice(&a.to_le_bytes());
        bytes.extend_from_slice(&b.to_le_bytes());
    }

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    Provenance {
        topology_hash: hash,
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

fn kind_tag(kind: &crate::graph::NodeKind) -> u8 {
    use crate::graph::{BorderKind, NodeKind, StructureKind};
    match kind {
        NodeKind::Op { code, .. } => 0x10 + *code as u8,
        NodeKind::Structure(StructureKind::Frame { .. }) => 0x40,
        NodeKind::Structure(StructureKind::Loop { .. }) => 0x41,
        NodeKind::Structure(StructureKind::Case { .. }) => 0x42,
        NodeKind::Border(BorderKind::InputTunnel { .. }) => 0x50,
        NodeKind::Border(BorderKind::OutputTunnel { .. }) => 0x51,
        NodeKind::Border(BorderKind::BorrowTunnel { .. }) => 0x52,
        NodeKind::Border(BorderKind::TerminateLifetime { .. }) => 0x53,
        NodeKind::Border(BorderKind::LoopTunnel { .. }) => 0x54,
    }
}

// ── Compiled output ────────────────────────────────────────────────────────

/// The read-only tuple both backends were driven from, plus their artifacts.
pub struct CompiledFunction {
    pub typed: TypedGraph,
    pub schedule: ScheduledFunction,
    pub groups: StateGroups,
    pub alloc: AllocationMap,
    pub provenance: Provenance,
    pub bytecode: Option<BytecodeFunction>,
    pub native: Option<NativeArtifact>,
    pub warnings: Vec<Diagnostic>,
}

// ── Entry point ────────────────────────────────────────────────────────────

/// Compile one function graph. This is the operation the host build layer
/// consumes; dependency and caching machinery live outside this crate.
pub fn compile(
    graph: &Graph,
    options: &CompileOptions,
    token: &CancellationToken,
) -> Result<CompiledFunction, CompileError> {
    let mut warnings: Vec<Diagnostic> = Vec::new();

    // ── Infer ──
    let start = Instant::now();
    let infer_res = type_infer::infer(graph, token)?;
    log::debug!(
        "infer: {} diagnostics, {:.1?}",
        infer_res.diagnostics.len(),
        start.elapsed()
    );
    let typed = match split_stage(infer_res.diagnostics, infer_res.typed, &mut warnings) {
        Ok(t) => t,
        Err(diags) => {
            return Err(CompileError::Diagnostics {
                failing_pass: PassId::Infer,
                diagnostics: diags,
            })
        }
    };

    // ── Schedule ──
    let start = Instant::now();
    let sched_res = schedule::schedule(graph, &typed, token)?;
    log::debug!("schedule: {:.1?}", start.elapsed());
    let sched = match split_stage(sched_res.diagnostics, sched_res.schedule, &mut warnings) {
        Ok(s) => s,
        Err(diags) => {
            return Err(CompileError::Diagnostics {
                failing_pass: PassId::Schedule,
                diagnostics: diags,
            })
        }
    };
    require_cert(
        PassId::Schedule,
        &schedule::verify_schedule(graph, &sched),
    )?;

    // ── Partition ──
    let start = Instant::now();
    let part_res = partition::partition(graph, &typed, &sched, token)?;
    log::debug!("partition: {:.1?}", start.elapsed());
    let groups = match split_stage(part_res.diagnostics, part_res.groups, &mut warnings) {
        Ok(g) => g,
        Err(diags) => {
            return Err(CompileError::Diagnostics {
                failing_pass: PassId::Partition,
                diagnostics: diags,
            })
        }
    };
    require_cert(
        PassId::Partition,
        &partition::verify_partition(&sched, &groups),
    )?;

    // ── Allocate ──
    let start = Instant::now();
    let alloc_vars = allocate::collect_inputs(&typed, &groups);
    let alloc = match allocate::allocate(&alloc_vars, token) {
        Ok(map) => map,
        Err(AllocError::Cancelled) => return Err(CompileError::Cancelled),
        Err(err @ AllocError::Invariant { .. }) => {
            return Err(CompileError::Invariant {
                pass: PassId::Allocate,
                message: err.to_string(),
            })
        }
    };
    log::debug!(
        "allocate: {} variables, {} state fields, {:.1?}",
        alloc.sources.len(),
        alloc.state_layout.fields.len(),
        start.elapsed()
    );
    require_cert(
        PassId::Allocate,
        &allocate::verify_allocation(&alloc_vars, &alloc),
    )?;

    // ── Emit ──
    let bytecode = if options.emit_bytecode {
        let mut emitter = BytecodeEmitter::new();
        emit_function(graph, &typed, &sched, &groups, &alloc, &mut emitter, token)?;
        Some(emitter.into_function())
    } else {
        None
    };
    let native = if options.emit_native {
        let mut emitter = NativeEmitter::new();
        emit_function(graph, &typed, &sched, &groups, &alloc, &mut emitter, token)?;
        Some(emitter.into_artifact())
    } else {
        None
    };

    // Both backends must carry the allocator's layout verbatim.
    if let (Some(bc), Some(ir)) = (&bytecode, &native) {
        if bc.state_layout != ir.state_layout || bc.state_layout != alloc.state_layout {
            return Err(CompileError::Invariant {
                pass: PassId::EmitNative,
                message: "backends disagree on the persisted state layout".into(),
            });
        }
    }

    Ok(CompiledFunction {
        typed,
        schedule: sched,
        groups,
        alloc,
        provenance: compute_provenance(graph),
        bytecode,
        native,
        warnings,
    })
}

/// Split a stage result: errors fail the stage with all its diagnostics,
/// warnings accumulate across stages.
fn split_stage<T>(
    diagnostics: Vec<Diagnostic>,
    output: Option<T>,
    warnings: &mut Vec<Diagnostic>,
) -> Result<T, Vec<Diagnostic>> {
    if crate::diag::has_errors(&diagnostics) || output.is_none() {
        return Err(diagnostics);
    }
    warnings.extend(diagnostics);
    Ok(output.expect("checked above"))
}

fn require_cert(pass: PassId, cert: &dyn StageCert) -> Result<(), CompileError> {
    if cert.all_pass() {
        return Ok(());
    }
    let failed: Vec<&'static str> = cert
        .obligations()
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| *name)
        .collect();
    Err(CompileError::Invariant {
        pass,
        message: format!("stage certificate failed: {}", failed.join(", ")),
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
