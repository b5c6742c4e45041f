// units.rs — Parallel compilation of independent function graphs
//
// Each unit compiles on its own scoped thread once the signatures of its
// dependencies are published. Waiting is a condvar sleep, not a busy poll;
// cancellation wakes every waiter and propagates as a cancelled unit, never
// as a partial result. Dependency cycles and unknown dependencies are
// rejected before any thread starts.
//
// Preconditions: unit names are unique; graphs passed validation.
// Postconditions: every unit has exactly one outcome; a unit observed its
//   dependencies' signatures before its own pipeline ran.
// Failure modes: per-unit compile errors, failed/unknown dependencies,
//   dependency cycles, cancellation.
// Side effects: spawns one thread per unit for the duration of the call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::graph::Graph;
use crate::pipeline::{self, CompileError, CompileOptions, CompiledFunction, Provenance};

// ── Public types ────────────────────────────────────────────────────────────

/// One compilable unit: a function graph plus the unit names it depends on.
pub struct CompileUnit {
    pub name: String,
    pub graph: Graph,
    pub deps: Vec<String>,
}

/// Why a unit did not produce a compiled function.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Compile(CompileError),
    #[error("dependency '{dep}' failed to compile")]
    DependencyFailed { dep: String },
    #[error("dependency '{dep}' is not a unit in this build")]
    UnknownDependency { dep: String },
    #[error("unit participates in a dependency cycle")]
    DependencyCycle,
}

pub type UnitOutcome = Result<CompiledFunction, UnitError>;

// ── Signature store ─────────────────────────────────────────────────────────

enum SigState {
    Ready(Provenance),
    Failed,
}

/// Published unit signatures. Waiters sleep on the condvar until their
/// dependency publishes or the build is cancelled.
struct SignatureStore {
    inner: Mutex<HashMap<String, SigState>>,
    cond: Condvar,
}

enum WaitOutcome {
    Ready(Provenance),
    DepFailed,
    Cancelled,
}

impl SignatureStore {
    fn new() -> Self {
        SignatureStore {
            inner: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    fn publish(&self, name: &str, state: SigState) {
        let mut guard = self.inner.lock();
        guard.insert(name.to_string(), state);
        self.cond.notify_all();
    }

    fn wait(&self, name: &str, token: &CancellationToken) -> WaitOutcome {
        let mut guard = self.inner.lock();
        loop {
            if token.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            match guard.get(name) {
                Some(SigState::Ready(p)) => return WaitOutcome::Ready(p.clone()),
                Some(SigState::Failed) => return WaitOutcome::DepFailed,
                None => {
                    // Bounded sleep so a cancellation with no further
                    // publishes still wakes the waiter.
                    self.cond.wait_for(&mut guard, Duration::from_millis(20));
                }
            }
        }
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Compile all units, independent ones in parallel, respecting dependency
/// order through signature waits.
pub fn compile_units(
    units: &[CompileUnit],
    options: &CompileOptions,
    token: &CancellationToken,
) -> BTreeMap<String, UnitOutcome> {
    let mut results: BTreeMap<String, UnitOutcome> = BTreeMap::new();
    let store = SignatureStore::new();

    let names: HashSet<&str> = units.iter().map(|u| u.name.as_str()).collect();
    let cyclic = cyclic_units(units);

    // Reject ill-formed units up front and publish their failure so that
    // dependents do not wait forever.
    let mut runnable: Vec<&CompileUnit> = Vec::new();
    for unit in units {
        if cyclic.contains(unit.name.as_str()) {
            store.publish(&unit.name, SigState::Failed);
            results.insert(unit.name.clone(), Err(UnitError::DependencyCycle));
            continue;
        }
        if let Some(dep) = unit.deps.iter().find(|d| !names.contains(d.as_str())) {
            store.publish(&unit.name, SigState::Failed);
            results.insert(
                unit.name.clone(),
                Err(UnitError::UnknownDependency { dep: dep.clone() }),
            );
            continue;
        }
        runnable.push(unit);
    }

    let collected: Mutex<BTreeMap<String, UnitOutcome>> = Mutex::new(BTreeMap::new());
    thread::scope(|s| {
        for &unit in &runnable {
            let store = &store;
            let collected = &collected;
            s.spawn(move || {
                let outcome = run_unit(unit, store, options, token);
                match &outcome {
                    Ok(out) => store.publish(&unit.name, SigState::Ready(out.provenance.clone())),
                    Err(_) => store.publish(&unit.name, SigState::Failed),
                }
                collected.lock().insert(unit.name.clone(), outcome);
            });
        }
    });

    results.extend(collected.into_inner());
    results
}

fn run_unit(
    unit: &CompileUnit,
    store: &SignatureStore,
    options: &CompileOptions,
    token: &CancellationToken,
) -> UnitOutcome {
    for dep in &unit.deps {
        match store.wait(dep, token) {
            WaitOutcome::Ready(_signature) => {
                // Shared, immutable signature data from an already-compiled
                // dependency; nothing else crosses unit boundaries.
            }
            WaitOutcome::DepFailed => {
                return Err(UnitError::DependencyFailed { dep: dep.clone() })
            }
            WaitOutcome::Cancelled => {
                return Err(UnitError::Compile(CompileError::Cancelled))
            }
        }
    }
    pipeline::compile(&unit.graph, options, token).map_err(UnitError::Compile)
}

/// Names of units involved in dependency cycles (Kahn's residue).
fn cyclic_units(units: &[CompileUnit]) -> HashSet<&str> {
    let names: HashSet<&str> = units.iter().map(|u| u.name.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for u in units {
        in_degree.entry(u.name.as_str()).or_insert(0);
        for d in &u.deps {
            if names.contains(d.as_str()) {
                *in_degree.entry(u.name.as_str()).or_insert(0) += 1;
                dependents.entry(d.as_str()).or_default().push(u.name.as_str());
            }
        }
    }
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut seen = 0usize;
    while let Some(n) = ready.pop() {
        seen += 1;
        if let Some(deps) = dependents.get(n) {
            for &d in deps {
                let e = in_degree.get_mut(d).expect("known unit");
                *e -= 1;
                if *e == 0 {
                    ready.push(d);
                }
            }
        }
    }
    if seen == units.len() {
        return HashSet::new();
    }
    in_degree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(n, _)| n)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
