// dot.rs — Graphviz rendering of Loom graphs
//
// Debug visualization: diagrams become clusters, nodes become boxes labeled
// with their kind, wires become edges. Output is deterministic (arena order
// only) so it can be snapshot-tested and diffed.
//
// Preconditions: none beyond a built graph.
// Postconditions: returns a complete `digraph` document.
// Failure modes: none.
// Side effects: none.

use std::fmt::Write as _;

use crate::graph::{BorderKind, Graph, NodeKind, StructureKind};
use crate::id::DiagramId;
use crate::signature::BorrowMode;

/// Render the graph as a Graphviz digraph.
pub fn render(graph: &Graph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", graph.name);
    let _ = writeln!(out, "  rankdir=LR;");
    let _ = writeln!(out, "  node [shape=box, fontsize=10];");
    render_diagram(graph, graph.root(), 1, &mut out);
    for wire in graph.wires() {
        let src = graph.term(wire.source).node;
        for sink in &wire.sinks {
            let dst = graph.term(*sink).node;
            let _ = writeln!(out, "  n{} -> n{} [label=\"w{}\"];", src.0, dst.0, wire.id.0);
        }
    }
    out.push_str("}\n");
    out
}

fn render_diagram(graph: &Graph, diagram: DiagramId, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for &nid in &graph.diagram(diagram).nodes {
        let node = graph.node(nid);
        let label = node_label(graph, nid);
        match &node.kind {
            NodeKind::Structure(kind) => {
                let _ = writeln!(out, "{}subgraph cluster_n{} {{", indent, nid.0);
                let _ = writeln!(out, "{}  label=\"{}\";", indent, label);
                let _ = writeln!(out, "{}  n{} [label=\"{}\", style=dashed];", indent, nid.0, label);
                let bodies: Vec<DiagramId> = match kind {
                    StructureKind::Frame { body } | StructureKind::Loop { body } => vec![*body],
                    StructureKind::Case { branches } => branches.clone(),
                };
                for body in bodies {
                    render_diagram(graph, body, depth + 1, out);
                }
                let _ = writeln!(out, "{}}}", indent);
            }
            _ => {
                let _ = writeln!(out, "{}n{} [label=\"{}\"];", indent, nid.0, label);
            }
        }
    }
}

fn node_label(graph: &Graph, nid: crate::id::NodeId) -> String {
    match &graph.node(nid).kind {
        NodeKind::Op { code, literal } => match literal {
            Some(lit) => format!("const {}", lit),
            None => code.name().to_string(),
        },
        NodeKind::Structure(StructureKind::Frame { .. }) => "frame".to_string(),
        NodeKind::Structure(StructureKind::Loop { .. }) => "loop".to_string(),
        NodeKind::Structure(StructureKind::Case { .. }) => "case".to_string(),
        NodeKind::Border(BorderKind::InputTunnel { .. }) => "tunnel in".to_string(),
        NodeKind::Border(BorderKind::OutputTunnel { .. }) => "tunnel out".to_string(),
        NodeKind::Border(BorderKind::BorrowTunnel { mode, .. }) => match mode {
            BorrowMode::Immutable => "borrow".to_string(),
            BorrowMode::Mutable => "borrow mut".to_string(),
        },
        NodeKind::Border(BorderKind::TerminateLifetime { .. }) => "terminate".to_string(),
        NodeKind::Border(BorderKind::LoopTunnel { .. }) => "loop tunnel".to_string(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::signature::{Literal, OpCode};

    #[test]
    fn renders_nodes_and_edges() {
        let mut b = GraphBuilder::new("viz");
        let root = b.root();
        let c = b.add_const(root, Literal::Int(5));
        let ins = b.add_op(root, OpCode::Inspect).unwrap();
        b.wire(b.out(c, 0), &[b.inp(ins, 0)]).unwrap();
        let g = b.finish().unwrap();

        let dot = render(&g);
        assert!(dot.starts_with("digraph \"viz\" {"));
        assert!(dot.contains("n0 [label=\"const 5\"];"));
        assert!(dot.contains("n1 [label=\"inspect\"];"));
        assert!(dot.contains("n0 -> n1 [label=\"w0\"];"));
        assert!(dot.ends_with("}\n"));
    }

    #[test]
    fn output_is_deterministic() {
        let mut b = GraphBuilder::new("viz");
        let root = b.root();
        let c = b.add_const(root, Literal::Int(5));
        let ins = b.add_op(root, OpCode::Inspect).unwrap();
        b.wire(b.out(c, 0), &[b.inp(ins, 0)]).unwrap();
        let g = b.finish().unwrap();
        assert_eq!(render(&g), render(&g));
    }
}
