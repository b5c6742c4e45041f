// type_infer.rs — Type & lifetime inference for Loom graphs
//
// Union-find unification over per-terminal type variables, extended with a
// lifetime variable namespace for references. Wires unify endpoint types;
// borrow tunnels introduce lifetimes scoped to their body diagram; borrow
// well-formedness (escape, exclusivity, single-move) is checked after the
// solve. Polymorphic operations resolve by candidate declaration order,
// never by graph traversal order.
//
// Preconditions: `graph` passed `Graph::validate` (editor-guaranteed).
// Postconditions: on success, every terminal has a concrete type, every
//   reference a lifetime scope, and the variable table is complete.
// Failure modes: type mismatches, unresolved signatures, escaping borrows,
//   borrow conflicts, repeated moves produce `Diagnostic` entries.
// Side effects: none.

use std::collections::HashMap;

use crate::cancel::{CancellationToken, Cancelled};
use crate::diag::{codes, DiagLevel, Diagnostic, Subject};
use crate::graph::{BorderKind, Direction, Graph, NodeKind, StructureKind};
use crate::id::{DiagramId, LifetimeVarId, NodeId, TermId, TypeVarId, VarId, WireId};
use crate::signature::{
    self, BorrowMode, Literal, OpCode, OpSignature, ScalarType, SigType, Type,
};

// ── Output types ────────────────────────────────────────────────────────────

/// Result of inference for one function graph.
pub struct InferResult {
    /// Present only when no error-level diagnostics were produced.
    pub typed: Option<TypedGraph>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Fully resolved types, lifetimes, and the variable table.
pub struct TypedGraph {
    pub term_types: HashMap<TermId, Type>,
    pub term_vars: HashMap<TermId, VarId>,
    pub vars: Vec<VarInfo>,
    /// Op node → index of the chosen candidate signature.
    pub chosen_sigs: HashMap<NodeId, usize>,
    /// Canonical lifetime variable → the diagram scope it is bound to.
    pub lifetime_scopes: HashMap<LifetimeVarId, DiagramId>,
}

impl TypedGraph {
    pub fn var(&self, id: VarId) -> &VarInfo {
        &self.vars[id.0 as usize]
    }

    pub fn var_of(&self, term: TermId) -> Option<VarId> {
        self.term_vars.get(&term).copied()
    }

    pub fn sig_of(&self, node: NodeId, code: OpCode) -> &'static OpSignature {
        let idx = self.chosen_sigs.get(&node).copied().unwrap_or(0);
        &signature::candidates(code)[idx]
    }
}

/// How a use site takes the variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseKind {
    /// Ownership moves to the user (a read for copyable types).
    Consume,
    BorrowImm,
    BorrowMut,
    /// Border-node move that preserves variable identity (tunnels).
    Transfer,
    /// Terminate-lifetime tunnel closing a reference; neither a move nor a
    /// borrow, always ordered after every other use of the wire.
    EndLifetime,
}

#[derive(Debug, Clone, Copy)]
pub struct VarUse {
    pub node: NodeId,
    pub term: TermId,
    pub kind: UseKind,
}

/// One logical variable: the unit of ownership and storage allocation.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub id: VarId,
    pub ty: Type,
    pub def_node: NodeId,
    pub def_term: TermId,
    /// Set when the definition is a `Const` node.
    pub literal: Option<Literal>,
    pub uses: Vec<VarUse>,
    /// Borrow-tunnel reference variables alias their owner's storage.
    pub alias_of: Option<VarId>,
    pub mut_borrowed: bool,
    /// A mutable alias of this variable is written through.
    pub assigned_through: bool,
    /// Some use takes ownership away (suppresses the scope-exit drop).
    pub consumed: bool,
    pub read_only: bool,
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Run type and lifetime inference over a validated graph.
pub fn infer(graph: &Graph, token: &CancellationToken) -> Result<InferResult, Cancelled> {
    token.check()?;
    let mut eng = Engine::new(graph);
    eng.seed_terminals();
    eng.apply_wire_constraints();
    eng.apply_structural_constraints();
    eng.apply_op_constraints(token)?;

    if crate::diag::has_errors(&eng.diagnostics) {
        return Ok(InferResult {
            typed: None,
            diagnostics: eng.diagnostics,
        });
    }

    eng.resolve_terminals(token)?;
    eng.check_escapes();
    eng.build_variables();
    eng.check_borrow_rules();
    eng.check_compatibility();

    let diagnostics = std::mem::take(&mut eng.diagnostics);
    let typed = if crate::diag::has_errors(&diagnostics) {
        None
    } else {
        Some(eng.into_typed())
    };
    Ok(InferResult { typed, diagnostics })
}

// ── Unification store ───────────────────────────────────────────────────────

/// Bound form of a type variable. `Ref` points at further variables, so the
/// store is a shallow term graph resolved recursively at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TyTerm {
    Int32,
    Bool,
    Str,
    Unit,
    Ref {
        mode: BorrowMode,
        inner: TypeVarId,
        lifetime: LifetimeVarId,
    },
}

impl TyTerm {
    fn describe(&self) -> &'static str {
        match self {
            TyTerm::Int32 => "i32",
            TyTerm::Bool => "bool",
            TyTerm::Str => "str",
            TyTerm::Unit => "unit",
            TyTerm::Ref {
                mode: BorrowMode::Immutable,
                ..
            } => "&_",
            TyTerm::Ref {
                mode: BorrowMode::Mutable,
                ..
            } => "&mut _",
        }
    }

    fn scalar(s: ScalarType) -> TyTerm {
        match s {
            ScalarType::Int32 => TyTerm::Int32,
            ScalarType::Bool => TyTerm::Bool,
            ScalarType::Str => TyTerm::Str,
            ScalarType::Unit => TyTerm::Unit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnifyErrKind {
    Type,
    Lifetime,
}

#[derive(Debug, Clone)]
struct UnifyErr {
    kind: UnifyErrKind,
    message: String,
}

/// Disjoint sets for type and lifetime variables. Cloneable so candidate
/// signatures can be tried on a snapshot and committed only on success.
#[derive(Clone, Default)]
struct VarStore {
    ty_parent: Vec<u32>,
    ty_term: Vec<Option<TyTerm>>,
    lt_parent: Vec<u32>,
    lt_scope: Vec<Option<DiagramId>>,
}

impl VarStore {
    fn new_ty(&mut self) -> TypeVarId {
        let id = TypeVarId(self.ty_parent.len() as u32);
        self.ty_parent.push(id.0);
        self.ty_term.push(None);
        id
    }

    fn new_lt(&mut self) -> LifetimeVarId {
        let id = LifetimeVarId(self.lt_parent.len() as u32);
        self.lt_parent.push(id.0);
        self.lt_scope.push(None);
        id
    }

    fn find_ty(&mut self, t: TypeVarId) -> u32 {
        let mut i = t.0;
        while self.ty_parent[i as usize] != i {
            let p = self.ty_parent[i as usize];
            self.ty_parent[i as usize] = self.ty_parent[p as usize];
            i = self.ty_parent[i as usize];
        }
        i
    }

    fn find_lt(&mut self, l: LifetimeVarId) -> u32 {
        let mut i = l.0;
        while self.lt_parent[i as usize] != i {
            let p = self.lt_parent[i as usize];
            self.lt_parent[i as usize] = self.lt_parent[p as usize];
            i = self.lt_parent[i as usize];
        }
        i
    }

    fn bind_ty(&mut self, g: &Graph, t: TypeVarId, term: TyTerm) -> Result<(), UnifyErr> {
        let r = self.find_ty(t);
        match self.ty_term[r as usize] {
            None => {
                self.ty_term[r as usize] = Some(term);
                Ok(())
            }
            Some(existing) => self.unify_terms(g, existing, term),
        }
    }

    fn bind_lt_scope(&mut self, g: &Graph, l: LifetimeVarId, scope: DiagramId) -> Result<(), UnifyErr> {
        let r = self.find_lt(l);
        match self.lt_scope[r as usize] {
            None => {
                self.lt_scope[r as usize] = Some(scope);
                Ok(())
            }
            Some(existing) => {
                let merged = merge_scopes(g, existing, scope)?;
                self.lt_scope[r as usize] = Some(merged);
                Ok(())
            }
        }
    }

    fn unify_ty(&mut self, g: &Graph, a: TypeVarId, b: TypeVarId) -> Result<(), UnifyErr> {
        let ra = self.find_ty(a);
        let rb = self.find_ty(b);
        if ra == rb {
            return Ok(());
        }
        // Smaller index wins the root so merge order never affects identity.
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        let tr = self.ty_term[root as usize];
        let tc = self.ty_term[child as usize];
        self.ty_parent[child as usize] = root;
        match (tr, tc) {
            (None, None) | (Some(_), None) => Ok(()),
            (None, Some(c)) => {
                self.ty_term[root as usize] = Some(c);
                Ok(())
            }
            (Some(r), Some(c)) => self.unify_terms(g, r, c),
        }
    }

    fn unify_terms(&mut self, g: &Graph, x: TyTerm, y: TyTerm) -> Result<(), UnifyErr> {
        match (x, y) {
            (TyTerm::Int32, TyTerm::Int32)
            | (TyTerm::Bool, TyTerm::Bool)
            | (TyTerm::Str, TyTerm::Str)
            | (TyTerm::Unit, TyTerm::Unit) => Ok(()),
            (
                TyTerm::Ref {
                    mode: ma,
                    inner: ia,
                    lifetime: la,
                },
                TyTerm::Ref {
                    mode: mb,
                    inner: ib,
                    lifetime: lb,
                },
            ) => {
                if ma != mb {
                    return Err(UnifyErr {
                        kind: UnifyErrKind::Type,
                        message: format!(
                            "reference mode mismatch: {} vs {}",
                            x.describe(),
                            y.describe()
                        ),
                    });
                }
                self.unify_ty(g, ia, ib)?;
                self.unify_lt(g, la, lb)
            }
            _ => Err(UnifyErr {
                kind: UnifyErrKind::Type,
                message: format!("type mismatch: {} vs {}", x.describe(), y.describe()),
            }),
        }
    }

    fn unify_lt(&mut self, g: &Graph, a: LifetimeVarId, b: LifetimeVarId) -> Result<(), UnifyErr> {
        let ra = self.find_lt(a);
        let rb = self.find_lt(b);
        if ra == rb {
            return Ok(());
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        let sr = self.lt_scope[root as usize];
        let sc = self.lt_scope[child as usize];
        self.lt_parent[child as usize] = root;
        match (sr, sc) {
            (None, None) | (Some(_), None) => Ok(()),
            (None, Some(s)) => {
                self.lt_scope[root as usize] = Some(s);
                Ok(())
            }
            (Some(s1), Some(s2)) => {
                let merged = merge_scopes(g, s1, s2)?;
                self.lt_scope[root as usize] = Some(merged);
                Ok(())
            }
        }
    }
}

/// Two lifetime scopes unify to the inner one; unrelated scopes cannot
/// unify — that is exactly a borrow escaping sideways.
fn merge_scopes(g: &Graph, s1: DiagramId, s2: DiagramId) -> Result<DiagramId, UnifyErr> {
    if s1 == s2 || g.is_within(s1, s2) {
        Ok(s1)
    } else if g.is_within(s2, s1) {
        Ok(s2)
    } else {
        Err(UnifyErr {
            kind: UnifyErrKind::Lifetime,
            message: format!(
                "lifetime scopes of diagrams {} and {} are unrelated",
                s1.0, s2.0
            ),
        })
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

struct Engine<'a> {
    graph: &'a Graph,
    store: VarStore,
    /// Terminal id → its type variable. Dense, indexed by TermId.
    term_tv: Vec<TypeVarId>,
    /// Borrow tunnel node → the lifetime it introduced.
    borrow_lt: HashMap<NodeId, LifetimeVarId>,
    chosen_sigs: HashMap<NodeId, usize>,
    diagnostics: Vec<Diagnostic>,

    term_types: HashMap<TermId, Type>,
    lifetime_scopes: HashMap<LifetimeVarId, DiagramId>,
    term_vars: HashMap<TermId, VarId>,
    vars: Vec<VarInfo>,
}

impl<'a> Engine<'a> {
    fn new(graph: &'a Graph) -> Self {
        Engine {
            graph,
            store: VarStore::default(),
            term_tv: Vec::new(),
            borrow_lt: HashMap::new(),
            chosen_sigs: HashMap::new(),
            diagnostics: Vec::new(),
            term_types: HashMap::new(),
            lifetime_scopes: HashMap::new(),
            term_vars: HashMap::new(),
            vars: Vec::new(),
        }
    }

    fn error(&mut self, code: crate::diag::DiagCode, subject: Subject, message: String) {
        self.diagnostics
            .push(Diagnostic::new(DiagLevel::Error, subject, message).with_code(code));
    }

    fn tv(&self, term: TermId) -> TypeVarId {
        self.term_tv[term.0 as usize]
    }

    // ── Constraint collection ───────────────────────────────────────────

    fn seed_terminals(&mut self) {
        for _ in 0..self.graph.term_count() {
            let tv = self.store.new_ty();
            self.term_tv.push(tv);
        }
    }

    fn apply_wire_constraints(&mut self) {
        for wire in self.graph.wires() {
            for sink in &wire.sinks {
                let (a, b) = (self.tv(wire.source), self.tv(*sink));
                if let Err(e) = self.store.unify_ty(self.graph, a, b) {
                    let code = match e.kind {
                        UnifyErrKind::Type => codes::E0201,
                        UnifyErrKind::Lifetime => codes::E0302,
                    };
                    self.diagnostics.push(
                        Diagnostic::new(DiagLevel::Error, Subject::Wire(wire.id), e.message)
                            .with_code(code)
                            .with_related(Subject::Terminal(wire.source), "source terminal")
                            .with_related(Subject::Terminal(*sink), "sink terminal"),
                    );
                }
            }
        }
    }

    fn apply_structural_constraints(&mut self) {
        // Borrow tunnels first: their lifetimes must exist before the
        // terminate side is constrained, and copied graphs may renumber a
        // terminate tunnel below its begin partner.
        for node in self.graph.nodes() {
            if let NodeKind::Border(BorderKind::BorrowTunnel { mode, outer }) = &node.kind {
                let lt = self.store.new_lt();
                self.borrow_lt.insert(node.id, lt);
                let scope = node.diagram;
                let inner_tv = self.tv(*outer);
                let ref_term = TyTerm::Ref {
                    mode: *mode,
                    inner: inner_tv,
                    lifetime: lt,
                };
                let out_tv = self.tv(node.outputs[0]);
                let result = self
                    .store
                    .bind_lt_scope(self.graph, lt, scope)
                    .and_then(|_| self.store.bind_ty(self.graph, out_tv, ref_term));
                if let Err(e) = result {
                    let code = match e.kind {
                        UnifyErrKind::Type => codes::E0201,
                        UnifyErrKind::Lifetime => codes::E0302,
                    };
                    self.error(code, Subject::Node(node.id), e.message);
                }
            }
        }

        for node in self.graph.nodes() {
            let result = match &node.kind {
                NodeKind::Op {
                    code: OpCode::Const,
                    literal,
                } => {
                    let term = match literal {
                        Some(l) => match l.ty() {
                            Type::Int32 => TyTerm::Int32,
                            Type::Bool => TyTerm::Bool,
                            Type::Str => TyTerm::Str,
                            _ => TyTerm::Unit,
                        },
                        None => TyTerm::Unit,
                    };
                    let tv = self.tv(node.outputs[0]);
                    self.store.bind_ty(self.graph, tv, term)
                }
                NodeKind::Border(BorderKind::InputTunnel { outer }) => {
                    let (a, b) = (self.tv(*outer), self.tv(node.outputs[0]));
                    self.store.unify_ty(self.graph, a, b)
                }
                NodeKind::Border(BorderKind::OutputTunnel { outer }) => {
                    let (a, b) = (self.tv(node.inputs[0]), self.tv(*outer));
                    self.store.unify_ty(self.graph, a, b)
                }
                // Handled in the pre-pass above.
                NodeKind::Border(BorderKind::BorrowTunnel { .. }) => Ok(()),
                NodeKind::Border(BorderKind::TerminateLifetime { outer }) => {
                    match self.graph.paired_tunnel(node.id) {
                        Some(begin) => {
                            let (mode, begin_outer) = match &self.graph.node(begin).kind {
                                NodeKind::Border(BorderKind::BorrowTunnel { mode, outer }) => {
                                    (*mode, *outer)
                                }
                                _ => {
                                    self.error(
                                        codes::E0901,
                                        Subject::Node(node.id),
                                        "terminate tunnel paired with a non-borrow node".into(),
                                    );
                                    continue;
                                }
                            };
                            let lt = match self.borrow_lt.get(&begin) {
                                Some(l) => *l,
                                None => {
                                    self.error(
                                        codes::E0901,
                                        Subject::Node(node.id),
                                        "terminate tunnel's begin partner has no lifetime".into(),
                                    );
                                    continue;
                                }
                            };
                            let owner_tv = self.tv(begin_outer);
                            let ref_term = TyTerm::Ref {
                                mode,
                                inner: owner_tv,
                                lifetime: lt,
                            };
                            let in_tv = self.tv(node.inputs[0]);
                            let out_tv = self.tv(*outer);
                            self.store
                                .bind_ty(self.graph, in_tv, ref_term)
                                .and_then(|_| self.store.unify_ty(self.graph, out_tv, owner_tv))
                        }
                        None => {
                            self.error(
                                codes::E0901,
                                Subject::Node(node.id),
                                "terminate tunnel has no begin partner".into(),
                            );
                            continue;
                        }
                    }
                }
                NodeKind::Border(BorderKind::LoopTunnel { outer_in, outer_out }) => {
                    let start = self.tv(node.outputs[0]);
                    let next = self.tv(node.inputs[0]);
                    let init = self.tv(*outer_in);
                    let mut r = self.store.unify_ty(self.graph, init, start);
                    if r.is_ok() {
                        r = self.store.unify_ty(self.graph, start, next);
                    }
                    if r.is_ok() {
                        if let Some(out) = outer_out {
                            let out_tv = self.tv(*out);
                            r = self.store.unify_ty(self.graph, start, out_tv);
                        }
                    }
                    r
                }
                NodeKind::Structure(StructureKind::Case { .. }) => {
                    let cond = self.tv(node.inputs[0]);
                    self.store.bind_ty(self.graph, cond, TyTerm::Bool)
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                let code = match e.kind {
                    UnifyErrKind::Type => codes::E0201,
                    UnifyErrKind::Lifetime => codes::E0302,
                };
                self.error(code, Subject::Node(node.id), e.message);
            }
        }
    }

    /// Resolve primitive-operation signatures. Single-candidate operations
    /// constrain directly; multi-candidate operations are tried in candidate
    /// declaration order on a store snapshot, in node id order.
    fn apply_op_constraints(&mut self, token: &CancellationToken) -> Result<(), Cancelled> {
        let mut deferred: Vec<NodeId> = Vec::new();
        for node in self.graph.nodes() {
            token.check()?;
            let code = match node.op_code() {
                Some(c) if c != OpCode::Const => c,
                _ => continue,
            };
            let cands = signature::candidates(code);
            if cands.len() == 1 {
                let mut trial = self.store.clone();
                match instantiate(&mut trial, self.graph, &cands[0], node) {
                    Ok(()) => {
                        self.store = trial;
                        self.chosen_sigs.insert(node.id, 0);
                    }
                    Err(e) => {
                        self.error(
                            codes::E0202,
                            Subject::Node(node.id),
                            format!(
                                "operation '{}' rejects the connected types: {}",
                                cands[0].name, e.message
                            ),
                        );
                    }
                }
            } else {
                deferred.push(node.id);
            }
        }

        for node_id in deferred {
            token.check()?;
            let node = self.graph.node(node_id);
            let code = node.op_code().unwrap_or(OpCode::Const);
            let cands = signature::candidates(code);
            let mut chosen = None;
            for (idx, cand) in cands.iter().enumerate() {
                let mut trial = self.store.clone();
                if instantiate(&mut trial, self.graph, cand, node).is_ok() {
                    self.store = trial;
                    chosen = Some(idx);
                    break;
                }
            }
            match chosen {
                Some(idx) => {
                    self.chosen_sigs.insert(node_id, idx);
                }
                None => {
                    let names: Vec<&str> = cands.iter().map(|c| c.name).collect();
                    self.error(
                        codes::E0202,
                        Subject::Node(node_id),
                        format!(
                            "no candidate signature of '{}' matches the connected types",
                            code.name()
                        ),
                    );
                    if let Some(d) = self.diagnostics.last_mut() {
                        d.hint = Some(format!("candidates tried in order: {}", names.join(", ")));
                    }
                }
            }
        }
        Ok(())
    }

    // ── Resolution ──────────────────────────────────────────────────────

    fn resolve_terminals(&mut self, token: &CancellationToken) -> Result<(), Cancelled> {
        for idx in 0..self.term_tv.len() {
            token.check()?;
            let term = TermId(idx as u32);
            let tv = self.term_tv[idx];
            match self.resolve_type(tv, 0) {
                Some(ty) => {
                    self.term_types.insert(term, ty);
                }
                None => {
                    self.error(
                        codes::E0201,
                        Subject::Terminal(term),
                        "could not resolve a concrete type for this terminal".into(),
                    );
                }
            }
        }
        Ok(())
    }

    fn resolve_type(&mut self, tv: TypeVarId, depth: u32) -> Option<Type> {
        if depth > 32 {
            return None;
        }
        let root = self.store.find_ty(tv);
        let term = self.store.ty_term[root as usize]?;
        Some(match term {
            TyTerm::Int32 => Type::Int32,
            TyTerm::Bool => Type::Bool,
            TyTerm::Str => Type::Str,
            TyTerm::Unit => Type::Unit,
            TyTerm::Ref {
                mode,
                inner,
                lifetime,
            } => {
                let inner_ty = self.resolve_type(inner, depth + 1)?;
                let lt_root = LifetimeVarId(self.store.find_lt(lifetime));
                let scope = self.store.lt_scope[lt_root.0 as usize]
                    .unwrap_or_else(|| self.graph.root());
                self.lifetime_scopes.insert(lt_root, scope);
                Type::Ref {
                    mode,
                    inner: Box::new(inner_ty),
                    lifetime: lt_root,
                }
            }
        })
    }

    /// A reference may only appear on terminals inside the diagram subtree
    /// its lifetime is scoped to.
    fn check_escapes(&mut self) {
        let mut violations: Vec<(TermId, DiagramId, DiagramId)> = Vec::new();
        for (term, ty) in &self.term_types {
            let mut lifetimes = Vec::new();
            collect_lifetimes(ty, &mut lifetimes);
            if lifetimes.is_empty() {
                continue;
            }
            let node = self.graph.term(*term).node;
            let diagram = self.graph.node(node).diagram;
            for lt in lifetimes {
                let scope = match self.lifetime_scopes.get(&lt) {
                    Some(s) => *s,
                    None => continue,
                };
                if !self.graph.is_within(diagram, scope) {
                    violations.push((*term, diagram, scope));
                }
            }
        }
        violations.sort_by_key(|(t, _, _)| *t);
        for (term, _, scope) in violations {
            self.diagnostics.push(
                Diagnostic::new(
                    DiagLevel::Error,
                    Subject::Terminal(term),
                    "borrowed reference escapes the scope that created it",
                )
                .with_code(codes::E0302)
                .with_related(Subject::Diagram(scope), "borrow lifetime scope"),
            );
        }
    }

    // ── Variable construction ───────────────────────────────────────────

    /// Wires sharing storage identity (tunnels, terminate re-emission,
    /// non-copy suspension passthrough) are merged into one variable via a
    /// union-find over wire ids; each class becomes one `VarInfo`.
    fn build_variables(&mut self) {
        let n_wires = self.graph.wire_count();
        let mut uf: Vec<u32> = (0..n_wires as u32).collect();

        fn find(uf: &mut [u32], w: u32) -> u32 {
            let mut i = w;
            while uf[i as usize] != i {
                let p = uf[i as usize];
                uf[i as usize] = uf[p as usize];
                i = uf[i as usize];
            }
            i
        }
        fn union(uf: &mut [u32], a: u32, b: u32) {
            let ra = find(uf, a);
            let rb = find(uf, b);
            if ra != rb {
                // Smallest wire id becomes the representative, so the class
                // definition point is the earliest wire.
                let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
                uf[child as usize] = root;
            }
        }

        let wire_at = |term: TermId| self.graph.wire_of(term).map(|w| w.id);

        for node in self.graph.nodes() {
            match &node.kind {
                NodeKind::Border(BorderKind::InputTunnel { outer }) => {
                    if let (Some(a), Some(b)) = (wire_at(*outer), wire_at(node.outputs[0])) {
                        union(&mut uf, a.0, b.0);
                    }
                }
                NodeKind::Border(BorderKind::OutputTunnel { outer }) => {
                    // Frame outputs preserve identity; case outputs converge
                    // into a fresh variable (one slot fed by every branch).
                    let owner = self.graph.owner_of(node.diagram);
                    let is_frame = matches!(
                        owner.map(|o| &self.graph.node(o).kind),
                        Some(NodeKind::Structure(StructureKind::Frame { .. }))
                    );
                    if is_frame {
                        if let (Some(a), Some(b)) = (wire_at(node.inputs[0]), wire_at(*outer)) {
                            union(&mut uf, a.0, b.0);
                        }
                    }
                }
                NodeKind::Border(BorderKind::TerminateLifetime { outer }) => {
                    if let Some(begin) = self.graph.paired_tunnel(node.id) {
                        if let NodeKind::Border(BorderKind::BorrowTunnel {
                            outer: begin_outer,
                            ..
                        }) = &self.graph.node(begin).kind
                        {
                            if let (Some(a), Some(b)) = (wire_at(*begin_outer), wire_at(*outer)) {
                                union(&mut uf, a.0, b.0);
                            }
                        }
                    }
                }
                NodeKind::Border(BorderKind::LoopTunnel { outer_out, .. }) => {
                    if let Some(out) = outer_out {
                        if let (Some(a), Some(b)) = (wire_at(node.outputs[0]), wire_at(*out)) {
                            union(&mut uf, a.0, b.0);
                        }
                    }
                }
                NodeKind::Op { code, .. } if signature::suspends(*code) => {
                    let non_copy = self
                        .term_types
                        .get(&node.inputs[0])
                        .map(|t| !t.is_copy())
                        .unwrap_or(false);
                    if non_copy {
                        if let (Some(a), Some(b)) = (wire_at(node.inputs[0]), wire_at(node.outputs[0]))
                        {
                            union(&mut uf, a.0, b.0);
                        }
                    }
                }
                _ => {}
            }
        }

        // One variable per wire class, defined at the class's earliest wire.
        let mut var_of_class: HashMap<u32, VarId> = HashMap::new();
        let mut wire_var: Vec<Option<VarId>> = vec![None; n_wires];
        for wire in self.graph.wires() {
            let root = find(&mut uf, wire.id.0);
            let var = *var_of_class.entry(root).or_insert_with(|| {
                let def_wire = self.graph.wire(WireId(root));
                let def_term = def_wire.source;
                let def_node = self.graph.term(def_term).node;
                let ty = self
                    .term_types
                    .get(&def_term)
                    .cloned()
                    .unwrap_or(Type::Unit);
                let literal = match &self.graph.node(def_node).kind {
                    NodeKind::Op {
                        code: OpCode::Const,
                        literal,
                    } => literal.clone(),
                    _ => None,
                };
                let id = VarId(self.vars.len() as u32);
                self.vars.push(VarInfo {
                    id,
                    ty,
                    def_node,
                    def_term,
                    literal,
                    uses: Vec::new(),
                    alias_of: None,
                    mut_borrowed: false,
                    assigned_through: false,
                    consumed: false,
                    read_only: true,
                });
                id
            });
            wire_var[wire.id.0 as usize] = Some(var);
            self.term_vars.insert(wire.source, var);
            for sink in &wire.sinks {
                self.term_vars.insert(*sink, var);
            }
        }

        // Dead values: unwired primitive outputs still own storage and need
        // drop bookkeeping.
        for idx in 0..self.graph.term_count() {
            let term = TermId(idx as u32);
            let t = self.graph.term(term);
            if t.dir != Direction::Output || self.graph.wire_of(term).is_some() {
                continue;
            }
            if !matches!(self.graph.node(t.node).kind, NodeKind::Op { .. }) {
                continue;
            }
            let ty = self.term_types.get(&term).cloned().unwrap_or(Type::Unit);
            let literal = match &self.graph.node(t.node).kind {
                NodeKind::Op {
                    code: OpCode::Const,
                    literal,
                } => literal.clone(),
                _ => None,
            };
            let id = VarId(self.vars.len() as u32);
            self.vars.push(VarInfo {
                id,
                ty,
                def_node: t.node,
                def_term: term,
                literal,
                uses: Vec::new(),
                alias_of: None,
                mut_borrowed: false,
                assigned_through: false,
                consumed: false,
                read_only: true,
            });
            self.term_vars.insert(term, id);
        }

        // Record uses.
        for wire in self.graph.wires() {
            let var = match wire_var[wire.id.0 as usize] {
                Some(v) => v,
                None => continue,
            };
            for sink in &wire.sinks {
                let mut kind = self.classify_sink(*sink);
                let node = self.graph.term(*sink).node;
                // A suspension passthrough whose input and output merged
                // into one variable transfers storage to itself: the owner
                // lives on past the resume and still needs its scope drop.
                if kind == UseKind::Consume && self.is_merged_passthrough(node) {
                    kind = UseKind::Transfer;
                }
                self.vars[var.0 as usize].uses.push(VarUse {
                    node,
                    term: *sink,
                    kind,
                });
                match kind {
                    UseKind::Consume => {
                        self.vars[var.0 as usize].consumed = true;
                        // Suspension machinery takes its operand through a
                        // mutable transfer slot, not a plain read.
                        let suspends = self
                            .graph
                            .node(node)
                            .op_code()
                            .map(signature::suspends)
                            .unwrap_or(false);
                        if suspends {
                            self.vars[var.0 as usize].read_only = false;
                        }
                    }
                    UseKind::BorrowMut => {
                        self.vars[var.0 as usize].mut_borrowed = true;
                        self.vars[var.0 as usize].read_only = false;
                    }
                    _ => {}
                }
            }
        }

        // Alias links: borrow-tunnel reference variables point at the
        // variable entering the paired outer terminal.
        for node in self.graph.nodes() {
            if let NodeKind::Border(BorderKind::BorrowTunnel { outer, .. }) = &node.kind {
                let ref_var = self
                    .graph
                    .wire_of(node.outputs[0])
                    .and_then(|w| wire_var[w.id.0 as usize]);
                let owner_var = self
                    .graph
                    .wire_of(*outer)
                    .and_then(|w| wire_var[w.id.0 as usize]);
                if let (Some(r), Some(o)) = (ref_var, owner_var) {
                    self.vars[r.0 as usize].alias_of = Some(o);
                }
            }
        }

        // Writes through mutable references mark the ultimate owner.
        for node in self.graph.nodes() {
            if node.op_code() == Some(OpCode::Assign) {
                if let Some(wire) = self.graph.wire_of(node.inputs[0]) {
                    if let Some(mut v) = wire_var[wire.id.0 as usize] {
                        let mut hops = 0;
                        while let Some(next) = self.vars[v.0 as usize].alias_of {
                            v = next;
                            hops += 1;
                            if hops > self.vars.len() {
                                break;
                            }
                        }
                        self.vars[v.0 as usize].assigned_through = true;
                        self.vars[v.0 as usize].read_only = false;
                    }
                }
            }
        }
    }

    /// True if `node` is a suspending op whose input and output resolved to
    /// the same variable (non-copy passthrough).
    fn is_merged_passthrough(&self, node: NodeId) -> bool {
        let n = self.graph.node(node);
        if !n.op_code().map(signature::suspends).unwrap_or(false) {
            return false;
        }
        match (
            n.inputs.first().and_then(|t| self.term_vars.get(t)),
            n.outputs.first().and_then(|t| self.term_vars.get(t)),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn classify_sink(&self, sink: TermId) -> UseKind {
        let node = self.graph.node(self.graph.term(sink).node);
        match &node.kind {
            NodeKind::Op { code, .. } => {
                let idx = self.chosen_sigs.get(&node.id).copied().unwrap_or(0);
                let sig = &signature::candidates(*code)[idx];
                let param = &sig.inputs[self.graph.term(sink).index as usize];
                match param.passing {
                    signature::Passing::Consume => UseKind::Consume,
                    signature::Passing::Borrow(BorrowMode::Immutable) => UseKind::BorrowImm,
                    signature::Passing::Borrow(BorrowMode::Mutable) => UseKind::BorrowMut,
                }
            }
            NodeKind::Structure(kind) => {
                // Outer terminal: role comes from the border node bridging it.
                if matches!(kind, StructureKind::Case { .. })
                    && self.graph.term(sink).index == 0
                {
                    return UseKind::Consume; // condition
                }
                for d in self.graph.nested_diagrams(node.id) {
                    for nid in &self.graph.diagram(d).nodes {
                        match &self.graph.node(*nid).kind {
                            NodeKind::Border(BorderKind::InputTunnel { outer })
                                if *outer == sink =>
                            {
                                return UseKind::Transfer;
                            }
                            NodeKind::Border(BorderKind::BorrowTunnel { mode, outer })
                                if *outer == sink =>
                            {
                                return match mode {
                                    BorrowMode::Immutable => UseKind::BorrowImm,
                                    BorrowMode::Mutable => UseKind::BorrowMut,
                                };
                            }
                            NodeKind::Border(BorderKind::LoopTunnel { outer_in, .. })
                                if *outer_in == sink =>
                            {
                                return UseKind::Consume;
                            }
                            _ => {}
                        }
                    }
                }
                UseKind::Consume
            }
            NodeKind::Border(border) => match border {
                BorderKind::OutputTunnel { .. } => {
                    let owner = self.graph.owner_of(node.diagram);
                    let is_frame = matches!(
                        owner.map(|o| &self.graph.node(o).kind),
                        Some(NodeKind::Structure(StructureKind::Frame { .. }))
                    );
                    if is_frame {
                        UseKind::Transfer
                    } else {
                        UseKind::Consume
                    }
                }
                BorderKind::TerminateLifetime { .. } => UseKind::EndLifetime,
                BorderKind::LoopTunnel { .. } => UseKind::Consume,
                _ => UseKind::Consume,
            },
        }
    }

    // ── Borrow rules ────────────────────────────────────────────────────

    /// Conflicts can only arise among sinks of one wire: uses on later
    /// segments of a merged variable are already sequenced by dataflow.
    fn check_borrow_rules(&mut self) {
        for wire in self.graph.wires() {
            let var = match self.term_vars.get(&wire.source) {
                Some(v) => *v,
                None => continue,
            };
            let ty = self.vars[var.0 as usize].ty.clone();
            let sinks: Vec<(TermId, UseKind)> = wire
                .sinks
                .iter()
                .map(|s| (*s, self.classify_sink(*s)))
                .collect();

            if let Some((mut_term, _)) = sinks
                .iter()
                .find(|(_, k)| *k == UseKind::BorrowMut)
                .copied()
            {
                if sinks.len() > 1 {
                    let other = sinks
                        .iter()
                        .find(|(t, _)| *t != mut_term)
                        .map(|(t, _)| *t)
                        .unwrap_or(mut_term);
                    self.diagnostics.push(
                        Diagnostic::new(
                            DiagLevel::Error,
                            Subject::Variable(var),
                            "variable is mutably borrowed while also used elsewhere",
                        )
                        .with_code(codes::E0303)
                        .with_related(Subject::Terminal(mut_term), "mutable borrow here")
                        .with_related(Subject::Terminal(other), "conflicting use here"),
                    );
                }
            }

            if !ty.is_copy() {
                let moves: Vec<TermId> = sinks
                    .iter()
                    .filter(|(_, k)| matches!(k, UseKind::Consume | UseKind::Transfer))
                    .map(|(t, _)| *t)
                    .collect();
                if moves.len() > 1 && !self.moves_target_one_case(&moves) {
                    self.diagnostics.push(
                        Diagnostic::new(
                            DiagLevel::Error,
                            Subject::Variable(var),
                            "variable is moved more than once on one execution path",
                        )
                        .with_code(codes::E0304)
                        .with_related(Subject::Terminal(moves[0]), "first move here")
                        .with_related(Subject::Terminal(moves[1]), "second move here"),
                    );
                }
            }
        }
    }

    /// Multiple moves are legal only when every sink is an input terminal of
    /// the same case structure: its branches are mutually exclusive.
    fn moves_target_one_case(&self, moves: &[TermId]) -> bool {
        let mut case_node = None;
        for term in moves {
            let node = self.graph.term(*term).node;
            match &self.graph.node(node).kind {
                NodeKind::Structure(StructureKind::Case { .. }) => match case_node {
                    None => case_node = Some(node),
                    Some(n) if n == node => {}
                    Some(_) => return false,
                },
                _ => return false,
            }
        }
        case_node.is_some()
    }

    /// Residual compatibility checks that unification does not express.
    fn check_compatibility(&mut self) {
        for node in self.graph.nodes() {
            if node.op_code() == Some(OpCode::Deref) {
                if let Some(out_ty) = self.term_types.get(&node.outputs[0]) {
                    if !out_ty.is_copy() {
                        self.error(
                            codes::E0202,
                            Subject::Node(node.id),
                            format!("deref would duplicate non-copyable type {}", out_ty),
                        );
                    }
                }
            }
        }
    }

    fn into_typed(self) -> TypedGraph {
        TypedGraph {
            term_types: self.term_types,
            term_vars: self.term_vars,
            vars: self.vars,
            chosen_sigs: self.chosen_sigs,
            lifetime_scopes: self.lifetime_scopes,
        }
    }
}

/// Apply one candidate signature's constraints to a store snapshot.
fn instantiate(
    store: &mut VarStore,
    graph: &Graph,
    cand: &OpSignature,
    node: &crate::graph::Node,
) -> Result<(), UnifyErr> {
    let params: Vec<TypeVarId> = (0..cand.type_params).map(|_| store.new_ty()).collect();
    let mut constrain = |store: &mut VarStore, term_tv: TypeVarId, sig: SigType| match sig {
        SigType::Concrete(s) => store.bind_ty(graph, term_tv, TyTerm::scalar(s)),
        SigType::Var(i) => store.unify_ty(graph, term_tv, params[i as usize]),
        SigType::RefTo(i, mode) => {
            let lt = store.new_lt();
            store.bind_ty(
                graph,
                term_tv,
                TyTerm::Ref {
                    mode,
                    inner: params[i as usize],
                    lifetime: lt,
                },
            )
        }
    };
    // Terminal type variables are seeded in terminal id order before any
    // other variable exists, so a terminal's variable index is its own id.
    for (i, p) in cand.inputs.iter().enumerate() {
        let term = node.inputs[i];
        constrain(store, TypeVarId(term.0), p.ty)?;
    }
    for (i, o) in cand.outputs.iter().enumerate() {
        let term = node.outputs[i];
        constrain(store, TypeVarId(term.0), *o)?;
    }
    Ok(())
}

fn collect_lifetimes(ty: &Type, out: &mut Vec<LifetimeVarId>) {
    if let Type::Ref {
        inner, lifetime, ..
    } = ty
    {
        out.push(*lifetime);
        collect_lifetimes(inner, out);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
