// Cross-backend equivalence.
//
// Both backends receive the same (schedule, state groups, allocation) tuple
// and must honor it identically: their persisted state layouts are equal,
// and the values a minimal interpreter harness observes match what the
// native IR text declares for the same slots. The interpreter here is a
// test harness only — the production VM lives outside this crate.

use std::collections::HashMap;

use loomc::bytecode::{BinCode, BytecodeFunction, Instr, Slot, Terminator};
use loomc::cancel::CancellationToken;
use loomc::graph::{Graph, GraphBuilder};
use loomc::pipeline::{compile, CompileOptions, CompiledFunction};
use loomc::signature::{BorrowMode, Literal, OpCode};

// ── Interpreter harness ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Val {
    I(i32),
    B(bool),
    S(String),
    Unset,
}

fn lit_val(lit: &Literal) -> Val {
    match lit {
        Literal::Int(n) => Val::I(*n),
        Literal::Bool(b) => Val::B(*b),
        Literal::Str(s) => Val::S(s.clone()),
    }
}

struct Machine<'a> {
    fun: &'a BytecodeFunction,
    imm: HashMap<u32, Val>,
    state: HashMap<u32, Val>,
    locals: HashMap<u32, Val>,
    observed: Vec<Val>,
    drops: usize,
}

impl<'a> Machine<'a> {
    fn new(fun: &'a BytecodeFunction) -> Self {
        Machine {
            fun,
            imm: HashMap::new(),
            state: HashMap::new(),
            locals: HashMap::new(),
            observed: Vec::new(),
            drops: 0,
        }
    }

    fn read(&self, slot: Slot) -> Val {
        match slot {
            Slot::Const(i) => lit_val(&self.fun.literals[i as usize]),
            Slot::Imm(i) => self.imm.get(&i).cloned().unwrap_or(Val::Unset),
            Slot::Local(i) => self.locals.get(&i).cloned().unwrap_or(Val::Unset),
            Slot::State(i) => self.state.get(&i).cloned().unwrap_or(Val::Unset),
        }
    }

    fn write(&mut self, slot: Slot, val: Val) {
        match slot {
            Slot::Const(_) => panic!("write to constant slot"),
            Slot::Imm(i) => {
                self.imm.insert(i, val);
            }
            Slot::Local(i) => {
                self.locals.insert(i, val);
            }
            Slot::State(i) => {
                self.state.insert(i, val);
            }
        }
    }

    fn run(mut self) -> (Vec<Val>, usize) {
        let mut group = 0usize;
        let mut budget = 100_000usize;
        loop {
            // Group entry resets the transient frame.
            self.locals.clear();
            let code = &self.fun.groups[group];
            let mut pc = 0usize;
            while pc < code.code.len() {
                budget = budget.checked_sub(1).expect("interpreter step budget");
                match &code.code[pc] {
                    Instr::Move { src, dst } => {
                        let v = self.read(*src);
                        self.write(*dst, v);
                        pc += 1;
                    }
                    Instr::Binary { op, a, b, dst } => {
                        let (va, vb) = (self.read(*a), self.read(*b));
                        let v = match (op, va, vb) {
                            (BinCode::AddI32, Val::I(x), Val::I(y)) => Val::I(x + y),
                            (BinCode::MulI32, Val::I(x), Val::I(y)) => Val::I(x * y),
                            (BinCode::ConcatStr, Val::S(x), Val::S(y)) => Val::S(x + &y),
                            (op, va, vb) => {
                                panic!("type confusion: {:?} on {:?}, {:?}", op, va, vb)
                            }
                        };
                        self.write(*dst, v);
                        pc += 1;
                    }
                    Instr::Inspect { src } => {
                        self.observed.push(self.read(*src));
                        pc += 1;
                    }
                    Instr::DropVal { .. } => {
                        self.drops += 1;
                        pc += 1;
                    }
                    Instr::JumpIfFalse { cond, target } => {
                        match self.read(*cond) {
                            Val::B(true) => pc += 1,
                            Val::B(false) => pc = *target,
                            other => panic!("non-boolean condition: {:?}", other),
                        }
                    }
                    Instr::Jump { target } => pc = *target,
                }
            }
            match &code.terminator {
                Terminator::Advance => group += 1,
                Terminator::Complete => break,
                Terminator::LoopBack { target, cond } => match self.read(*cond) {
                    Val::B(true) => group = *target as usize,
                    Val::B(false) => group += 1,
                    other => panic!("non-boolean loop condition: {:?}", other),
                },
            }
        }
        (self.observed, self.drops)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn compile_both(g: &Graph) -> CompiledFunction {
    let out = compile(g, &CompileOptions::default(), &CancellationToken::new())
        .expect("graph compiles");
    let bc = out.bytecode.as_ref().expect("bytecode");
    let ir = out.native.as_ref().expect("native ir");
    // The contract invariant: identical persisted layouts everywhere.
    assert_eq!(bc.state_layout, ir.state_layout);
    assert_eq!(bc.state_layout, out.alloc.state_layout);
    out
}

fn interpret(out: &CompiledFunction) -> (Vec<Val>, usize) {
    Machine::new(out.bytecode.as_ref().unwrap()).run()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn sum_graph_observes_five_on_both_backends() {
    let mut b = GraphBuilder::new("sum");
    let root = b.root();
    let c1 = b.add_const(root, Literal::Int(2));
    let c2 = b.add_const(root, Literal::Int(3));
    let add = b.add_op(root, OpCode::Add).unwrap();
    let ins = b.add_op(root, OpCode::Inspect).unwrap();
    b.wire(b.out(c1, 0), &[b.inp(add, 0)]).unwrap();
    b.wire(b.out(c2, 0), &[b.inp(add, 1)]).unwrap();
    b.wire(b.out(add, 0), &[b.inp(ins, 0)]).unwrap();
    let g = b.finish().unwrap();

    let out = compile_both(&g);
    let (observed, drops) = interpret(&out);
    assert_eq!(observed, vec![Val::I(5)]);
    assert_eq!(drops, 0);

    let ir = &out.native.as_ref().unwrap().ir;
    assert!(ir.contains("add.i32 2, 3"));
    assert!(ir.contains("inspect"));
    assert!(ir.contains("ret"));
}

#[test]
fn value_observed_after_resume_matches() {
    let mut b = GraphBuilder::new("resume");
    let root = b.root();
    let c1 = b.add_const(root, Literal::Int(20));
    let c2 = b.add_const(root, Literal::Int(22));
    let add = b.add_op(root, OpCode::Add).unwrap();
    let y = b.add_op(root, OpCode::Yield).unwrap();
    let ins = b.add_op(root, OpCode::Inspect).unwrap();
    b.wire(b.out(c1, 0), &[b.inp(add, 0)]).unwrap();
    b.wire(b.out(c2, 0), &[b.inp(add, 1)]).unwrap();
    b.wire(b.out(add, 0), &[b.inp(y, 0)]).unwrap();
    b.wire(b.out(y, 0), &[b.inp(ins, 0)]).unwrap();
    let g = b.finish().unwrap();

    let out = compile_both(&g);
    assert_eq!(out.groups.group_count(), 2);
    assert_eq!(out.alloc.state_layout.fields.len(), 1);

    let (observed, _) = interpret(&out);
    assert_eq!(observed, vec![Val::I(42)]);

    let ir = &out.native.as_ref().unwrap().ir;
    assert!(ir.contains("br g1"));
    assert!(ir.contains("state[0]"));
}

#[test]
fn write_through_mutable_borrow_is_visible_to_owner() {
    let mut b = GraphBuilder::new("borrow_mut");
    let root = b.root();
    let owner = b.add_const(root, Literal::Int(7));
    let (frame, body) = b.add_frame(root);
    let ids = b.add_borrow_tunnel(frame, BorrowMode::Mutable).unwrap();
    b.wire(b.out(owner, 0), &[ids.outer_in]).unwrap();
    let nine = b.add_const(body, Literal::Int(9));
    let assign = b.add_op(body, OpCode::Assign).unwrap();
    b.wire(b.out(ids.borrow, 0), &[b.inp(assign, 0), b.inp(ids.terminate, 0)])
        .unwrap();
    b.wire(b.out(nine, 0), &[b.inp(assign, 1)]).unwrap();
    let ins = b.add_op(root, OpCode::Inspect).unwrap();
    b.wire(ids.outer_out, &[b.inp(ins, 0)]).unwrap();
    let g = b.finish().unwrap();

    let out = compile_both(&g);
    let (observed, _) = interpret(&out);
    // The inspect reads the owner's slot after the borrow wrote through it.
    assert_eq!(observed, vec![Val::I(9)]);
}

#[test]
fn case_selects_exactly_one_branch() {
    for (flag, expected, expected_drops) in [
        (true, Val::S("sub".into()), 2),
        (false, Val::S("res".into()), 1),
    ] {
        let mut b = GraphBuilder::new("cond");
        let root = b.root();
        let cond = b.add_const(root, Literal::Bool(flag));
        let value = b.add_const(root, Literal::Str("res".into()));
        let (case, branches) = b.add_case(root, 2).unwrap();
        b.wire(b.out(cond, 0), &[b.inp(case, 0)]).unwrap();
        let tun_in = b.add_input_tunnel(case).unwrap();
        b.wire(b.out(value, 0), &[tun_in.outer]).unwrap();
        let tun_out = b.add_output_tunnel(case).unwrap();
        let drop_op = b.add_op(branches[0], OpCode::Drop).unwrap();
        b.wire(b.out(tun_in.inner[0], 0), &[b.inp(drop_op, 0)]).unwrap();
        let subst = b.add_const(branches[0], Literal::Str("sub".into()));
        b.wire(b.out(subst, 0), &[b.inp(tun_out.inner[0], 0)]).unwrap();
        b.wire(b.out(tun_in.inner[1], 0), &[b.inp(tun_out.inner[1], 0)])
            .unwrap();
        let ins = b.add_op(root, OpCode::Inspect).unwrap();
        b.wire(tun_out.outer, &[b.inp(ins, 0)]).unwrap();
        let g = b.finish().unwrap();

        let out = compile_both(&g);
        let (observed, drops) = interpret(&out);
        assert_eq!(observed, vec![expected], "flag = {}", flag);
        // Then-path: explicit drop plus the merged value's scope-exit drop.
        // Else-path: only the scope-exit drop.
        assert_eq!(drops, expected_drops, "flag = {}", flag);
    }
}

#[test]
fn loop_carried_value_updates_through_state() {
    let mut b = GraphBuilder::new("count");
    let root = b.root();
    let init = b.add_const(root, Literal::Int(0));
    let (lp, body) = b.add_loop(root);
    let tun = b.add_loop_tunnel(lp, true).unwrap();
    b.wire(b.out(init, 0), &[tun.outer_in]).unwrap();
    let one = b.add_const(body, Literal::Int(1));
    let add = b.add_op(body, OpCode::Add).unwrap();
    b.wire(b.out(tun.node, 0), &[b.inp(add, 0)]).unwrap();
    b.wire(b.out(one, 0), &[b.inp(add, 1)]).unwrap();
    b.wire(b.out(add, 0), &[b.inp(tun.node, 0)]).unwrap();
    let flag = b.add_const(body, Literal::Bool(false));
    let cont = b.add_op(body, OpCode::ContinueIf).unwrap();
    b.wire(b.out(flag, 0), &[b.inp(cont, 0)]).unwrap();
    let ins = b.add_op(root, OpCode::Inspect).unwrap();
    b.wire(tun.outer_out.unwrap(), &[b.inp(ins, 0)]).unwrap();
    let g = b.finish().unwrap();

    let out = compile_both(&g);
    // The carried value persists across iteration boundaries.
    assert!(!out.alloc.state_layout.fields.is_empty());

    let (observed, _) = interpret(&out);
    // One iteration (the continuation flag is false): 0 + 1.
    assert_eq!(observed, vec![Val::I(1)]);
}
