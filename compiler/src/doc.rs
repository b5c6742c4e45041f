// doc.rs — JSON interchange documents for finalized Loom graphs
//
// The external editor persists diagrams in its own format; what reaches the
// compiler is this flat document: nodes declare their diagram by name,
// structures introduce named body diagrams, tunnels alias both of their
// sides as named terminals, and wires reference "<node>.<terminal>" paths.
// Loading validates the document against the graph builder and returns the
// arena graph the pipeline consumes.
//
// Preconditions: none.
// Postconditions: a successful load returns a validated `Graph`.
// Failure modes: JSON syntax errors, unknown names, and builder rejections
//   produce `DocError`.
// Side effects: none.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{BuildError, Graph, GraphBuilder};
use crate::id::{DiagramId, TermId};
use crate::signature::{BorrowMode, Literal, OpCode};

// ── Document model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDoc {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeDoc>,
    #[serde(default)]
    pub wires: Vec<WireDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDoc {
    pub id: String,
    /// Diagram name: "root", "<structure>.body", "<case>.then", "<case>.else".
    #[serde(default = "default_diagram")]
    pub diagram: String,
    /// Opcode name, structure kind ("frame" | "loop" | "case"), or tunnel
    /// kind ("tunnel_in" | "tunnel_out" | "borrow" | "borrow_mut" |
    /// "loop_tunnel").
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<LiteralDoc>,
    /// For tunnels: the owning structure's node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<String>,
    /// For loop tunnels: whether the carried value exits the loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_output: Option<bool>,
}

fn default_diagram() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralDoc {
    Bool(bool),
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireDoc {
    /// Source terminal path, e.g. "sum.out0" or "t1.inner0".
    pub from: String,
    /// Sink terminal paths.
    pub to: Vec<String>,
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DocError {
    #[error("document parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Build(#[from] BuildError),
    #[error("unknown diagram '{0}' (structures must precede their contents)")]
    UnknownDiagram(String),
    #[error("unknown operation '{0}'")]
    UnknownOp(String),
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    #[error("node '{id}' needs {what}")]
    Missing { id: String, what: &'static str },
    #[error("unknown terminal path '{0}'")]
    UnknownTerminal(String),
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Parse a JSON document and build the graph.
pub fn from_json(text: &str) -> Result<Graph, DocError> {
    let doc: GraphDoc = serde_json::from_str(text)?;
    build(&doc)
}

/// Build a graph from a parsed document.
pub fn build(doc: &GraphDoc) -> Result<Graph, DocError> {
    let mut b = GraphBuilder::new(doc.name.clone());
    let mut diagrams: HashMap<String, DiagramId> = HashMap::new();
    diagrams.insert("root".to_string(), b.root());
    let mut terminals: HashMap<String, TermId> = HashMap::new();
    let mut seen: HashMap<String, ()> = HashMap::new();
    let mut structures: HashMap<String, crate::id::NodeId> = HashMap::new();

    for node in &doc.nodes {
        if seen.insert(node.id.clone(), ()).is_some() {
            return Err(DocError::DuplicateNode(node.id.clone()));
        }
        let diagram = *diagrams
            .get(&node.diagram)
            .ok_or_else(|| DocError::UnknownDiagram(node.diagram.clone()))?;

        match node.op.as_str() {
            "frame" | "loop" => {
                let (nid, body) = if node.op == "frame" {
                    b.add_frame(diagram)
                } else {
                    b.add_loop(diagram)
                };
                structures.insert(node.id.clone(), nid);
                diagrams.insert(format!("{}.body", node.id), body);
            }
            "case" => {
                let (nid, branches) = b.add_case(diagram, 2)?;
                structures.insert(node.id.clone(), nid);
                diagrams.insert(format!("{}.then", node.id), branches[0]);
                diagrams.insert(format!("{}.else", node.id), branches[1]);
                terminals.insert(format!("{}.cond", node.id), b.inp(nid, 0));
            }
            "tunnel_in" | "tunnel_out" => {
                let owner = node
                    .structure
                    .as_ref()
                    .and_then(|s| structures.get(s))
                    .copied()
                    .ok_or(DocError::Missing {
                        id: node.id.clone(),
                        what: "a 'structure' reference to an existing structure node",
                    })?;
                let ids = if node.op == "tunnel_in" {
                    b.add_input_tunnel(owner)?
                } else {
                    b.add_output_tunnel(owner)?
                };
                terminals.insert(format!("{}.outer", node.id), ids.outer);
                for (i, border) in ids.inner.iter().enumerate() {
                    let term = if node.op == "tunnel_in" {
                        b.out(*border, 0)
                    } else {
                        b.inp(*border, 0)
                    };
                    terminals.insert(format!("{}.inner{}", node.id, i), term);
                }
            }
            "borrow" | "borrow_mut" => {
                let owner = node
                    .structure
                    .as_ref()
                    .and_then(|s| structures.get(s))
                    .copied()
                    .ok_or(DocError::Missing {
                        id: node.id.clone(),
                        what: "a 'structure' reference to a frame node",
                    })?;
                let mode = if node.op == "borrow_mut" {
                    BorrowMode::Mutable
                } else {
                    BorrowMode::Immutable
                };
                let ids = b.add_borrow_tunnel(owner, mode)?;
                terminals.insert(format!("{}.outer_in", node.id), ids.outer_in);
                terminals.insert(format!("{}.outer_out", node.id), ids.outer_out);
                terminals.insert(format!("{}.ref", node.id), b.out(ids.borrow, 0));
                terminals.insert(format!("{}.terminate", node.id), b.inp(ids.terminate, 0));
            }
            "loop_tunnel" => {
                let owner = node
                    .structure
                    .as_ref()
                    .and_then(|s| structures.get(s))
                    .copied()
                    .ok_or(DocError::Missing {
                        id: node.id.clone(),
                        what: "a 'structure' reference to a loop node",
                    })?;
                let ids = b.add_loop_tunnel(owner, node.with_output.unwrap_or(false))?;
                terminals.insert(format!("{}.init", node.id), ids.outer_in);
                if let Some(out) = ids.outer_out {
                    terminals.insert(format!("{}.final", node.id), out);
                }
                terminals.insert(format!("{}.start", node.id), b.out(ids.node, 0));
                terminals.insert(format!("{}.next", node.id), b.inp(ids.node, 0));
            }
            "const" => {
                let lit = node.literal.clone().ok_or(DocError::Missing {
                    id: node.id.clone(),
                    what: "a literal value",
                })?;
                let nid = b.add_const(diagram, to_literal(lit));
                terminals.insert(format!("{}.out0", node.id), b.out(nid, 0));
            }
            other => {
                let code = OpCode::from_name(other)
                    .ok_or_else(|| DocError::UnknownOp(other.to_string()))?;
                let nid = b.add_op(diagram, code)?;
                let g = b.graph();
                let (ins, outs) = (g.node(nid).inputs.clone(), g.node(nid).outputs.clone());
                for (i, t) in ins.iter().enumerate() {
                    terminals.insert(format!("{}.in{}", node.id, i), *t);
                }
                for (i, t) in outs.iter().enumerate() {
                    terminals.insert(format!("{}.out{}", node.id, i), *t);
                }
            }
        }
    }

    for wire in &doc.wires {
        let from = *terminals
            .get(&wire.from)
            .ok_or_else(|| DocError::UnknownTerminal(wire.from.clone()))?;
        let mut sinks = Vec::with_capacity(wire.to.len());
        for t in &wire.to {
            sinks.push(
                *terminals
                    .get(t)
                    .ok_or_else(|| DocError::UnknownTerminal(t.clone()))?,
            );
        }
        b.wire(from, &sinks)?;
    }

    Ok(b.finish()?)
}

fn to_literal(doc: LiteralDoc) -> Literal {
    match doc {
        LiteralDoc::Int(n) => Literal::Int(n as i32),
        LiteralDoc::Bool(v) => Literal::Bool(v),
        LiteralDoc::Str(s) => Literal::Str(s),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
