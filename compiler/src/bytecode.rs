// bytecode.rs — Interpreter-target backend
//
// Translates driver callbacks into slot-addressed bytecode: one instruction
// sequence per state group plus a group-transition table, forming the
// resumable state machine the interpreter trampolines over. Storage indices
// come verbatim from the allocation map via SlotRef; this backend derives
// nothing on its own.
//
// Preconditions: driven by `emit::emit_function` only.
// Postconditions: the produced `BytecodeFunction` embeds the allocator's
//   state layout unchanged.
// Failure modes: none.
// Side effects: none.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::allocate::{FrameLayout, StateLayout};
use crate::emit::{BinaryOp, CodeEmitter, GroupTransition, SlotRef};
use crate::id::GroupId;
use crate::signature::Literal;

// ── Bytecode model ──────────────────────────────────────────────────────────

/// Runtime storage address. `Local` indices are relative to the executing
/// group's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Const(u32),
    Imm(u32),
    Local(u32),
    State(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinCode {
    AddI32,
    MulI32,
    ConcatStr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Move { src: Slot, dst: Slot },
    Binary { op: BinCode, a: Slot, b: Slot, dst: Slot },
    Inspect { src: Slot },
    DropVal { slot: Slot },
    /// Intra-group conditional jump (case branches).
    JumpIfFalse { cond: Slot, target: usize },
    Jump { target: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Advance,
    Complete,
    LoopBack { target: u32, cond: Slot },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupCode {
    pub code: Vec<Instr>,
    pub terminator: Terminator,
}

/// A compiled function for the interpreter target.
#[derive(Debug, Clone, PartialEq)]
pub struct BytecodeFunction {
    pub name: String,
    pub literals: Vec<Literal>,
    pub state_layout: StateLayout,
    /// Group id → local slot sizes, ordered for stable output.
    pub frames: BTreeMap<u32, Vec<u32>>,
    pub groups: Vec<GroupCode>,
}

// ── Emitter ─────────────────────────────────────────────────────────────────

struct CaseCtx {
    jz_at: usize,
    jmp_at: Option<usize>,
}

/// `CodeEmitter` implementation producing `BytecodeFunction`.
#[derive(Default)]
pub struct BytecodeEmitter {
    name: String,
    literals: Vec<Literal>,
    state_layout: StateLayout,
    frames: BTreeMap<u32, Vec<u32>>,
    groups: Vec<GroupCode>,
    case_stack: Vec<CaseCtx>,
}

impl BytecodeEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_function(self) -> BytecodeFunction {
        BytecodeFunction {
            name: self.name,
            literals: self.literals,
            state_layout: self.state_layout,
            frames: self.frames,
            groups: self.groups,
        }
    }

    fn intern(&mut self, lit: &Literal) -> u32 {
        if let Some(i) = self.literals.iter().position(|l| l == lit) {
            return i as u32;
        }
        self.literals.push(lit.clone());
        (self.literals.len() - 1) as u32
    }

    fn slot(&mut self, s: &SlotRef) -> Slot {
        match s {
            SlotRef::Constant(lit) => Slot::Const(self.intern(lit)),
            SlotRef::Immutable { index } => Slot::Imm(*index),
            SlotRef::Local { index, .. } => Slot::Local(*index),
            SlotRef::State { index } => Slot::State(*index),
        }
    }

    fn code(&mut self) -> &mut Vec<Instr> {
        &mut self
            .groups
            .last_mut()
            .expect("begin_group precedes emission")
            .code
    }

    fn push(&mut self, instr: Instr) {
        self.code().push(instr);
    }
}

impl CodeEmitter for BytecodeEmitter {
    fn begin_function(
        &mut self,
        name: &str,
        layout: &StateLayout,
        frames: &HashMap<GroupId, FrameLayout>,
    ) {
        self.name = name.to_string();
        self.state_layout = layout.clone();
        for (g, f) in frames {
            self.frames.insert(g.0, f.slots.clone());
        }
    }

    fn begin_group(&mut self, _group: GroupId) {
        self.groups.push(GroupCode {
            code: Vec::new(),
            terminator: Terminator::Advance,
        });
    }

    fn emit_binary(&mut self, op: BinaryOp, a: &SlotRef, b: &SlotRef, dst: &SlotRef) {
        let op = match op {
            BinaryOp::AddI32 => BinCode::AddI32,
            BinaryOp::MulI32 => BinCode::MulI32,
            BinaryOp::ConcatStr => BinCode::ConcatStr,
        };
        let (a, b, dst) = (self.slot(a), self.slot(b), self.slot(dst));
        self.push(Instr::Binary { op, a, b, dst });
    }

    fn emit_move(&mut self, src: &SlotRef, dst: &SlotRef) {
        let (src, dst) = (self.slot(src), self.slot(dst));
        self.push(Instr::Move { src, dst });
    }

    fn emit_inspect(&mut self, src: &SlotRef) {
        let src = self.slot(src);
        self.push(Instr::Inspect { src });
    }

    fn emit_drop(&mut self, slot: &SlotRef) {
        let slot = self.slot(slot);
        self.push(Instr::DropVal { slot });
    }

    fn begin_case(&mut self, cond: &SlotRef) {
        let cond = self.slot(cond);
        let jz_at = self.code().len();
        self.push(Instr::JumpIfFalse {
            cond,
            target: usize::MAX,
        });
        self.case_stack.push(CaseCtx { jz_at, jmp_at: None });
    }

    fn begin_else(&mut self) {
        let jmp_at = self.code().len();
        self.push(Instr::Jump { target: usize::MAX });
        let here = self.code().len();
        let ctx = self.case_stack.last_mut().expect("open case");
        ctx.jmp_at = Some(jmp_at);
        let jz_at = ctx.jz_at;
        if let Instr::JumpIfFalse { target, .. } = &mut self.code()[jz_at] {
            *target = here;
        }
    }

    fn end_case(&mut self) {
        let ctx = self.case_stack.pop().expect("open case");
        let here = self.code().len();
        if let Some(jmp_at) = ctx.jmp_at {
            if let Instr::Jump { target } = &mut self.code()[jmp_at] {
                *target = here;
            }
        }
    }

    fn end_group(&mut self, transition: &GroupTransition) {
        let terminator = match transition {
            GroupTransition::Advance => Terminator::Advance,
            GroupTransition::Complete => Terminator::Complete,
            GroupTransition::LoopBack { target, cond } => {
                let cond = self.slot(cond);
                Terminator::LoopBack {
                    target: target.0,
                    cond,
                }
            }
        };
        self.groups
            .last_mut()
            .expect("begin_group precedes end_group")
            .terminator = terminator;
    }

    fn finish_function(&mut self) {}
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Const(i) => write!(f, "c{}", i),
            Slot::Imm(i) => write!(f, "m{}", i),
            Slot::Local(i) => write!(f, "l{}", i),
            Slot::State(i) => write!(f, "s{}", i),
        }
    }
}

impl fmt::Display for BytecodeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bytecode function '{}'", self.name)?;
        if !self.literals.is_empty() {
            let lits: Vec<String> = self.literals.iter().map(|l| l.to_string()).collect();
            writeln!(f, "  literals: [{}]", lits.join(", "))?;
        }
        if !self.state_layout.fields.is_empty() {
            writeln!(
                f,
                "  state: {} fields / {} bytes",
                self.state_layout.fields.len(),
                self.state_layout.total_size()
            )?;
        }
        for (gi, group) in self.groups.iter().enumerate() {
            writeln!(f, "  group {}:", gi)?;
            for (pc, instr) in group.code.iter().enumerate() {
                let text = match instr {
                    Instr::Move { src, dst } => format!("move {} -> {}", src, dst),
                    Instr::Binary { op, a, b, dst } => {
                        let name = match op {
                            BinCode::AddI32 => "add.i32",
                            BinCode::MulI32 => "mul.i32",
                            BinCode::ConcatStr => "concat.str",
                        };
                        format!("{} {}, {} -> {}", name, a, b, dst)
                    }
                    Instr::Inspect { src } => format!("inspect {}", src),
                    Instr::DropVal { slot } => format!("drop {}", slot),
                    Instr::JumpIfFalse { cond, target } => {
                        format!("jz {} -> {}", cond, target)
                    }
                    Instr::Jump { target } => format!("jmp {}", target),
                };
                writeln!(f, "    {:>3}: {}", pc, text)?;
            }
            let term = match &group.terminator {
                Terminator::Advance => "advance".to_string(),
                Terminator::Complete => "complete".to_string(),
                Terminator::LoopBack { target, cond } => {
                    format!("loopback g{} while {}", target, cond)
                }
            };
            writeln!(f, "    => {}", term)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
