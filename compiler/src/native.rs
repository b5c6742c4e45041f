// native.rs — Native-target backend (textual IR emission)
//
// Translates driver callbacks into the textual IR consumed by the native
// object pipeline (emission and linking live outside this crate). Groups
// become labeled blocks of a state machine; slot references print exactly
// as allocated, so the IR's persisted record matches the interpreter's
// byte for byte.
//
// Preconditions: driven by `emit::emit_function` only.
// Postconditions: the artifact embeds the allocator's state layout
//   unchanged.
// Failure modes: none.
// Side effects: none.

use std::collections::HashMap;

use crate::allocate::{FrameLayout, StateLayout};
use crate::emit::{BinaryOp, CodeEmitter, GroupTransition, SlotRef};
use crate::id::GroupId;
use crate::signature::Literal;

/// A compiled function for the native target.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeArtifact {
    pub ir: String,
    pub state_layout: StateLayout,
}

/// `CodeEmitter` implementation producing textual IR.
#[derive(Default)]
pub struct NativeEmitter {
    ir: String,
    state_layout: StateLayout,
    indent: usize,
    cur_group: u32,
}

impl NativeEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_artifact(self) -> NativeArtifact {
        NativeArtifact {
            ir: self.ir,
            state_layout: self.state_layout,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.ir.push_str("  ");
        }
        self.ir.push_str(text);
        self.ir.push('\n');
    }

    fn slot(s: &SlotRef) -> String {
        match s {
            SlotRef::Constant(Literal::Int(n)) => format!("{}", n),
            SlotRef::Constant(Literal::Bool(b)) => format!("{}", b),
            SlotRef::Constant(Literal::Str(v)) => format!("{:?}", v),
            SlotRef::Immutable { index } => format!("%m{}", index),
            SlotRef::Local { index, .. } => format!("%l{}", index),
            SlotRef::State { index } => format!("state[{}]", index),
        }
    }
}

impl CodeEmitter for NativeEmitter {
    fn begin_function(
        &mut self,
        name: &str,
        layout: &StateLayout,
        frames: &HashMap<GroupId, FrameLayout>,
    ) {
        self.state_layout = layout.clone();
        self.line(&format!("define @{} {{", name));
        self.indent += 1;
        let fields: Vec<String> = layout
            .fields
            .iter()
            .map(|f| format!("[{}] {}B", f.index, f.size))
            .collect();
        self.line(&format!("state {{ {} }}", fields.join(", ")));
        let mut group_ids: Vec<&GroupId> = frames.keys().collect();
        group_ids.sort();
        for g in group_ids {
            let slots: Vec<String> = frames[g].slots.iter().map(|s| format!("{}B", s)).collect();
            self.line(&format!("frame g{}: [{}]", g.0, slots.join(", ")));
        }
    }

    fn begin_group(&mut self, group: GroupId) {
        self.cur_group = group.0;
        self.line(&format!("g{}:", group.0));
        self.indent += 1;
    }

    fn emit_binary(&mut self, op: BinaryOp, a: &SlotRef, b: &SlotRef, dst: &SlotRef) {
        let name = match op {
            BinaryOp::AddI32 => "add.i32",
            BinaryOp::MulI32 => "mul.i32",
            BinaryOp::ConcatStr => "concat.str",
        };
        let text = format!(
            "{} = {} {}, {}",
            Self::slot(dst),
            name,
            Self::slot(a),
            Self::slot(b)
        );
        self.line(&text);
    }

    fn emit_move(&mut self, src: &SlotRef, dst: &SlotRef) {
        let text = format!("{} = {}", Self::slot(dst), Self::slot(src));
        self.line(&text);
    }

    fn emit_inspect(&mut self, src: &SlotRef) {
        let text = format!("inspect {}", Self::slot(src));
        self.line(&text);
    }

    fn emit_drop(&mut self, slot: &SlotRef) {
        let text = format!("drop {}", Self::slot(slot));
        self.line(&text);
    }

    fn begin_case(&mut self, cond: &SlotRef) {
        let text = format!("if {} {{", Self::slot(cond));
        self.line(&text);
        self.indent += 1;
    }

    fn begin_else(&mut self) {
        self.indent -= 1;
        self.line("} else {");
        self.indent += 1;
    }

    fn end_case(&mut self) {
        self.indent -= 1;
        self.line("}");
    }

    fn end_group(&mut self, transition: &GroupTransition) {
        let text = match transition {
            GroupTransition::Advance => format!("br g{}", self.cur_group + 1),
            GroupTransition::Complete => "ret".to_string(),
            GroupTransition::LoopBack { target, cond } => format!(
                "br {} ? g{} : g{}",
                Self::slot(cond),
                target.0,
                self.cur_group + 1
            ),
        };
        self.line(&text);
        self.indent -= 1;
    }

    fn finish_function(&mut self) {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
