// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests: each scenario encodes a method as flat jump-based
//! instructions, structures it, and checks both the recovered shape and
//! that the structured tree behaves exactly like the flat program.

use std::collections::BTreeMap;

use anyhow::Result;
use flow_structurer::{
    structure_method, Addr, BlockId, BlockKind, CmpOp, Expr, FlowGraph, HandlerEntry, InstrOp,
    Instruction, LocalId, LoopKind, MatchingLoad, StructureOptions, StructuredMethod, Structurer,
};

// ---------------------------------------------------------------------
// instruction builders

fn eval(addr: Addr, expr: Expr) -> Instruction {
    Instruction {
        addr,
        length: 1,
        op: InstrOp::Eval(expr),
    }
}

fn goto(addr: Addr, target: i64) -> Instruction {
    Instruction {
        addr,
        length: 1,
        op: InstrOp::Goto { target },
    }
}

fn jump_if(addr: Addr, cond: Expr, target: i64) -> Instruction {
    Instruction {
        addr,
        length: 1,
        op: InstrOp::CondJump { cond, target },
    }
}

fn ret(addr: Addr, value: Option<Expr>) -> Instruction {
    Instruction {
        addr,
        length: 1,
        op: InstrOp::Return(value),
    }
}

fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        name: name.to_string(),
        args,
        returns_value: false,
    }
}

fn lt(lhs: Expr, rhs: Expr) -> Expr {
    Expr::compare(CmpOp::Lt, lhs, rhs)
}

fn ge(lhs: Expr, rhs: Expr) -> Expr {
    Expr::compare(CmpOp::Ge, lhs, rhs)
}

fn eq(lhs: Expr, rhs: Expr) -> Expr {
    Expr::compare(CmpOp::Eq, lhs, rhs)
}

fn v(n: u32) -> Expr {
    Expr::load(LocalId(n))
}

// ---------------------------------------------------------------------
// a tiny interpreter for both renderings

const FUEL: usize = 100_000;

#[derive(Default)]
struct State {
    locals: BTreeMap<LocalId, i64>,
    stack: Vec<i64>,
    calls: Vec<(String, Vec<i64>)>,
    steps: usize,
}

impl State {
    fn with_locals(init: &[(u32, i64)]) -> State {
        let mut s = State::default();
        for (n, val) in init {
            s.locals.insert(LocalId(*n), *val);
        }
        s
    }

    fn tick(&mut self) {
        self.steps += 1;
        assert!(self.steps < FUEL, "interpreter did not terminate");
    }
}

fn eval_expr(e: &Expr, st: &mut State) -> Option<i64> {
    use flow_structurer::{BinOp, UnOp};
    match e {
        Expr::Const(v) => Some(*v),
        Expr::Bool(b) => Some(*b as i64),
        Expr::Load(l) => Some(st.locals.get(l).copied().unwrap_or(0)),
        Expr::Stack => Some(st.stack.pop().expect("operand stack underflow")),
        Expr::Unary(UnOp::Neg, e) => Some(-eval_expr(e, st).unwrap()),
        Expr::Unary(UnOp::BitNot, e) => Some(!eval_expr(e, st).unwrap()),
        Expr::Not(e) => Some((eval_expr(e, st).unwrap() == 0) as i64),
        Expr::Binary(op, a, b) => {
            let a = eval_expr(a, st).unwrap();
            let b = eval_expr(b, st).unwrap();
            Some(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                BinOp::And => a & b,
                BinOp::Or => a | b,
                BinOp::Xor => a ^ b,
                BinOp::Shl => a << b,
                BinOp::Shr => a >> b,
            })
        }
        Expr::Compare(op, a, b) => {
            let a = eval_expr(a, st).unwrap();
            let b = eval_expr(b, st).unwrap();
            let r = match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            };
            Some(r as i64)
        }
        Expr::Store(l, e) => {
            let val = eval_expr(e, st).unwrap();
            st.locals.insert(*l, val);
            None
        }
        Expr::Inc(l, n) => {
            *st.locals.entry(*l).or_insert(0) += n;
            None
        }
        Expr::Call {
            name,
            args,
            returns_value,
        } => {
            let vals: Vec<i64> = args.iter().map(|a| eval_expr(a, st).unwrap()).collect();
            st.calls.push((name.clone(), vals));
            if *returns_value {
                Some(0)
            } else {
                None
            }
        }
    }
}

fn run_flat(instrs: &[Instruction], init: &[(u32, i64)]) -> (State, Option<i64>) {
    let mut st = State::with_locals(init);
    let mut pc: i64 = instrs[0].addr as i64;
    loop {
        st.tick();
        if pc < 0 {
            return (st, None);
        }
        let instr = instrs
            .iter()
            .find(|i| i.addr as i64 == pc)
            .expect("jump into the middle of an instruction");
        match &instr.op {
            InstrOp::Eval(e) => {
                if let Some(val) = eval_expr(e, &mut st) {
                    st.stack.push(val);
                }
                pc += 1;
            }
            InstrOp::Goto { target } => pc = *target,
            InstrOp::CondJump { cond, target } => {
                if eval_expr(cond, &mut st).unwrap() != 0 {
                    pc = *target;
                } else {
                    pc += 1;
                }
            }
            InstrOp::Switch {
                selector,
                cases,
                default,
            } => {
                let sel = eval_expr(selector, &mut st).unwrap();
                pc = cases
                    .iter()
                    .find(|(value, _)| *value == sel)
                    .map(|(_, target)| *target)
                    .unwrap_or(*default);
            }
            InstrOp::Return(value) => {
                let r = value.as_ref().and_then(|e| eval_expr(e, &mut st));
                return (st, r);
            }
            InstrOp::Throw(_) => panic!("unexpected throw"),
        }
    }
}

enum Signal {
    Normal,
    Break(u32),
    Continue(u32),
    Return(Option<i64>),
}

fn exec_block(g: &FlowGraph, b: BlockId, st: &mut State) -> Signal {
    st.tick();
    match &g.block(b).kind {
        BlockKind::Empty => Signal::Normal,
        BlockKind::Instruction { expr, .. } => {
            if let Some(val) = eval_expr(expr, st) {
                st.stack.push(val);
            }
            Signal::Normal
        }
        BlockKind::Sequential { first, second } => match exec_block(g, *first, st) {
            Signal::Normal => exec_block(g, *second, st),
            other => other,
        },
        BlockKind::Conditional {
            cond, true_branch, ..
        } => {
            if eval_expr(cond, st).unwrap() != 0 {
                exec_block(g, *true_branch, st)
            } else {
                Signal::Normal
            }
        }
        BlockKind::IfThenElse {
            cond,
            then_branch,
            else_branch,
        } => {
            if eval_expr(cond, st).unwrap() != 0 {
                exec_block(g, *then_branch, st)
            } else if let Some(else_branch) = else_branch {
                exec_block(g, *else_branch, st)
            } else {
                Signal::Normal
            }
        }
        BlockKind::Loop(data) => {
            if let Some(init) = data.init {
                match exec_block(g, init, st) {
                    Signal::Normal => {}
                    other => return other,
                }
            }
            loop {
                st.tick();
                if data.kind != LoopKind::DoWhile && eval_expr(&data.cond, st).unwrap() == 0 {
                    return Signal::Normal;
                }
                let sig = exec_block(g, data.body, st);
                match sig {
                    Signal::Normal | Signal::Continue(1) => {}
                    Signal::Break(1) => return Signal::Normal,
                    Signal::Break(n) => return Signal::Break(n - 1),
                    Signal::Continue(n) => return Signal::Continue(n - 1),
                    ret @ Signal::Return(_) => return ret,
                }
                if let Some(incr) = data.incr {
                    exec_block(g, incr, st);
                }
                if data.kind == LoopKind::DoWhile && eval_expr(&data.cond, st).unwrap() == 0 {
                    return Signal::Normal;
                }
            }
        }
        BlockKind::Switch(data) => {
            let sel = eval_expr(&data.selector, st).unwrap();
            let start = data
                .cases
                .iter()
                .position(|c| !c.is_default && c.values.contains(&sel))
                .or_else(|| data.cases.iter().position(|c| c.is_default));
            let Some(start) = start else {
                return Signal::Normal;
            };
            for case in &data.cases[start..] {
                match exec_block(g, case.body, st) {
                    Signal::Normal => {}
                    Signal::Break(1) => return Signal::Normal,
                    Signal::Break(n) => return Signal::Break(n - 1),
                    other => return other,
                }
            }
            Signal::Normal
        }
        BlockKind::Try { body, .. } => exec_block(g, *body, st),
        BlockKind::Catch { .. } => Signal::Normal,
        BlockKind::Finally { body } => exec_block(g, *body, st),
        BlockKind::Synchronized { body, .. } => exec_block(g, *body, st),
        BlockKind::Break { level, .. } => Signal::Break(*level),
        BlockKind::Continue { level, .. } => Signal::Continue(*level),
        BlockKind::Return { value, .. } => {
            Signal::Return(value.as_ref().and_then(|e| eval_expr(e, st)))
        }
        BlockKind::Throw { .. } => panic!("unexpected throw"),
    }
}

fn run_tree(m: &StructuredMethod, init: &[(u32, i64)]) -> (State, Option<i64>) {
    let mut st = State::with_locals(init);
    match exec_block(&m.graph, m.root, &mut st) {
        Signal::Return(r) => (st, r),
        Signal::Normal => (st, None),
        _ => panic!("break or continue escaped the method"),
    }
}

/// Structures `instrs` and checks the tree against the flat program for
/// every given initial state.
fn check_equivalent(
    instrs: &[Instruction],
    n_locals: u32,
    inits: &[&[(u32, i64)]],
) -> Result<StructuredMethod> {
    let options = StructureOptions {
        check_consistency: true,
        ..Default::default()
    };
    let m = structure_method(instrs, &[], n_locals, &options)?;
    for init in inits {
        let (flat, flat_ret) = run_flat(instrs, init);
        let (tree, tree_ret) = run_tree(&m, init);
        assert_eq!(flat.calls, tree.calls, "call traces differ for {:?}", init);
        assert_eq!(flat_ret, tree_ret, "return values differ for {:?}", init);
        let visible = |st: &State| -> BTreeMap<LocalId, i64> {
            st.locals
                .iter()
                .filter(|(l, _)| l.0 < n_locals)
                .map(|(l, v)| (*l, *v))
                .collect()
        };
        assert_eq!(visible(&flat), visible(&tree), "locals differ for {:?}", init);
    }
    Ok(m)
}

fn tree_blocks(g: &FlowGraph, root: BlockId) -> Vec<BlockId> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(b) = stack.pop() {
        out.push(b);
        stack.extend(g.children(b));
    }
    out
}

fn find_loop(m: &StructuredMethod, kind: LoopKind) -> Option<BlockId> {
    tree_blocks(&m.graph, m.root).into_iter().find(|b| {
        matches!(&m.graph.block(*b).kind, BlockKind::Loop(data) if data.kind == kind)
    })
}

// ---------------------------------------------------------------------
// scenarios

#[test]
fn nested_if_else() -> Result<()> {
    // if (v0 < 10) { if (v1 < 5) a() else b() } else c()
    let instrs = vec![
        jump_if(0, ge(v(0), Expr::Const(10)), 6),
        jump_if(1, ge(v(1), Expr::Const(5)), 4),
        eval(2, call("a", vec![])),
        goto(3, 5),
        eval(4, call("b", vec![])),
        goto(5, 7),
        eval(6, call("c", vec![])),
        ret(7, None),
    ];
    let m = check_equivalent(
        &instrs,
        2,
        &[
            &[(0, 3), (1, 2)],
            &[(0, 3), (1, 9)],
            &[(0, 20), (1, 2)],
        ],
    )?;
    let has_else = tree_blocks(&m.graph, m.root).into_iter().any(|b| {
        matches!(
            &m.graph.block(b).kind,
            BlockKind::IfThenElse {
                else_branch: Some(_),
                ..
            }
        )
    });
    assert!(has_else, "expected an if/else:\n{}", dump(&m));
    Ok(())
}

#[test]
fn while_loop_with_break() -> Result<()> {
    // while (v0 < 10) { if (v0 == 5) break; w(v0); v0 += 1 }
    let instrs = vec![
        jump_if(0, ge(v(0), Expr::Const(10)), 5),
        jump_if(1, eq(v(0), Expr::Const(5)), 5),
        eval(2, call("w", vec![v(0)])),
        eval(3, Expr::Inc(LocalId(0), 1)),
        goto(4, 0),
        ret(5, None),
    ];
    let m = check_equivalent(&instrs, 1, &[&[(0, 0)], &[(0, 7)], &[(0, 12)]])?;
    assert!(
        find_loop(&m, LoopKind::While).is_some() || find_loop(&m, LoopKind::For).is_some(),
        "expected a loop:\n{}",
        dump(&m)
    );
    let has_break = tree_blocks(&m.graph, m.root)
        .into_iter()
        .any(|b| matches!(&m.graph.block(b).kind, BlockKind::Break { .. }));
    assert!(has_break, "expected a break:\n{}", dump(&m));
    Ok(())
}

#[test]
fn while_loop_with_continue() -> Result<()> {
    // while (v0 < 4) { w(v0); v0 += 1; if (v0 == 2) continue-at-head }
    let instrs = vec![
        jump_if(0, ge(v(0), Expr::Const(4)), 5),
        eval(1, call("w", vec![v(0)])),
        eval(2, Expr::Inc(LocalId(0), 1)),
        jump_if(3, eq(v(0), Expr::Const(2)), 0),
        goto(4, 0),
        ret(5, None),
    ];
    check_equivalent(&instrs, 1, &[&[(0, 0)], &[(0, 3)], &[(0, 9)]])?;
    Ok(())
}

#[test]
fn do_while_loop() -> Result<()> {
    // do { w(v0); v0 += 1 } while (v0 < 3)
    let instrs = vec![
        eval(0, call("w", vec![v(0)])),
        eval(1, Expr::Inc(LocalId(0), 1)),
        jump_if(2, lt(v(0), Expr::Const(3)), 0),
        ret(3, None),
    ];
    let m = check_equivalent(&instrs, 1, &[&[(0, 0)], &[(0, 2)], &[(0, 8)]])?;
    assert!(
        find_loop(&m, LoopKind::DoWhile).is_some(),
        "expected a do-while:\n{}",
        dump(&m)
    );
    Ok(())
}

#[test]
fn for_loop_commits() -> Result<()> {
    // v0 = 0; while (v0 < 3) { w(v0); v0 += 1 }  ==>  for-loop
    let instrs = vec![
        eval(0, Expr::store(LocalId(0), Expr::Const(0))),
        jump_if(1, ge(v(0), Expr::Const(3)), 5),
        eval(2, call("w", vec![v(0)])),
        eval(3, Expr::Inc(LocalId(0), 1)),
        goto(4, 1),
        ret(5, None),
    ];
    let m = check_equivalent(&instrs, 1, &[&[], &[(0, 99)]])?;
    let for_loop = find_loop(&m, LoopKind::For).expect("expected a committed for-loop");
    let BlockKind::Loop(data) = &m.graph.block(for_loop).kind else {
        unreachable!()
    };
    assert!(data.incr.is_some(), "for-loop lost its increment");
    assert!(
        matches!(
            &m.graph.block(data.incr.unwrap()).kind,
            BlockKind::Instruction {
                expr: Expr::Inc(l, 1),
                ..
            } if *l == LocalId(0)
        ),
        "unexpected increment:\n{}",
        dump(&m)
    );
    Ok(())
}

#[test]
fn for_speculation_rolls_back() -> Result<()> {
    // the trailing increment touches v1 while the condition reads v0, so
    // the speculative for-loop must demote to a while-loop with the
    // increment still in the body
    let instrs = vec![
        eval(0, Expr::store(LocalId(1), Expr::Const(0))),
        jump_if(1, ge(v(0), Expr::Const(2)), 5),
        eval(2, Expr::Inc(LocalId(0), 1)),
        eval(3, Expr::Inc(LocalId(1), 1)),
        goto(4, 1),
        ret(5, None),
    ];
    let m = check_equivalent(&instrs, 2, &[&[(0, 0)], &[(0, 5)]])?;
    assert!(
        find_loop(&m, LoopKind::For).is_none(),
        "speculation should not commit:\n{}",
        dump(&m)
    );
    let w = find_loop(&m, LoopKind::While).expect("expected a while-loop");
    let BlockKind::Loop(data) = &m.graph.block(w).kind else {
        unreachable!()
    };
    let body_has_incr = tree_blocks(&m.graph, data.body).into_iter().any(|b| {
        matches!(
            &m.graph.block(b).kind,
            BlockKind::Instruction {
                expr: Expr::Inc(l, 1),
                ..
            } if *l == LocalId(1)
        )
    });
    assert!(body_has_incr, "increment left the body:\n{}", dump(&m));
    Ok(())
}

#[test]
fn switch_with_fall_through() -> Result<()> {
    // switch (v0) { case 0: a(); /* falls through */ case 1: b(); break;
    //               default: c() }
    let instrs = vec![
        Instruction {
            addr: 0,
            length: 1,
            op: InstrOp::Switch {
                selector: v(0),
                cases: vec![(0, 1), (1, 3)],
                default: 5,
            },
        },
        eval(1, call("a", vec![])),
        goto(2, 3),
        eval(3, call("b", vec![])),
        goto(4, 6),
        eval(5, call("c", vec![])),
        ret(6, None),
    ];
    let m = check_equivalent(&instrs, 1, &[&[(0, 0)], &[(0, 1)], &[(0, 7)]])?;
    let switch = tree_blocks(&m.graph, m.root)
        .into_iter()
        .find(|b| matches!(&m.graph.block(*b).kind, BlockKind::Switch(_)))
        .expect("expected a switch");
    let BlockKind::Switch(data) = &m.graph.block(switch).kind else {
        unreachable!()
    };
    assert_eq!(data.cases.len(), 3);
    assert!(
        data.cases.iter().any(|c| c.fall_through),
        "expected a fall-through case:\n{}",
        dump(&m)
    );
    Ok(())
}

#[test]
fn break_out_of_two_loops() -> Result<()> {
    // while (v0 < 3) { while (v1 < 3) { if (v0+v1 == 3) break both;
    //   w(v0, v1); v1 += 1 } v0 += 1 }
    let sum = Expr::Binary(
        flow_structurer::BinOp::Add,
        Box::new(v(0)),
        Box::new(v(1)),
    );
    let instrs = vec![
        jump_if(0, ge(v(0), Expr::Const(3)), 8),
        jump_if(1, ge(v(1), Expr::Const(3)), 6),
        jump_if(2, eq(sum, Expr::Const(3)), 8),
        eval(3, call("w", vec![v(0), v(1)])),
        eval(4, Expr::Inc(LocalId(1), 1)),
        goto(5, 1),
        eval(6, Expr::Inc(LocalId(0), 1)),
        goto(7, 0),
        ret(8, None),
    ];
    let m = check_equivalent(&instrs, 2, &[&[(0, 0), (1, 0)], &[(0, 2), (1, 0)]])?;
    let has_labeled_break = tree_blocks(&m.graph, m.root)
        .into_iter()
        .any(|b| matches!(&m.graph.block(b).kind, BlockKind::Break { level, .. } if *level > 1));
    assert!(
        has_labeled_break,
        "expected a multi-level break:\n{}",
        dump(&m)
    );
    Ok(())
}

#[test]
fn stack_value_fuses_across_instructions() -> Result<()> {
    // push v1; v0 = <stack> + 1; return v0
    let instrs = vec![
        eval(0, v(1)),
        eval(
            1,
            Expr::store(
                LocalId(0),
                Expr::Binary(
                    flow_structurer::BinOp::Add,
                    Box::new(Expr::Stack),
                    Box::new(Expr::Const(1)),
                ),
            ),
        ),
        ret(2, Some(v(0))),
    ];
    let m = check_equivalent(&instrs, 2, &[&[(1, 41)]])?;
    assert!(m.synthesized_locals.is_empty());
    let text = flow_structurer::dump_tree(&m.graph, m.root);
    assert!(
        text.contains("v0 = (v1 + 1)"),
        "expected the push to fuse:\n{}",
        text
    );
    Ok(())
}

#[test]
fn try_catch_structures() -> Result<()> {
    let instrs = vec![
        eval(0, call("work", vec![])),
        goto(1, 3),
        Instruction {
            addr: 2,
            length: 1,
            op: InstrOp::Throw(Expr::Stack),
        },
        ret(3, None),
    ];
    let handlers = vec![HandlerEntry {
        start: 0,
        end: 2,
        handler: 2,
        exception: Some("Failure".to_string()),
    }];
    let options = StructureOptions {
        check_consistency: true,
        ..Default::default()
    };
    let m = structure_method(&instrs, &handlers, 0, &options)?;
    let has_try = tree_blocks(&m.graph, m.root)
        .into_iter()
        .any(|b| matches!(&m.graph.block(b).kind, BlockKind::Try { .. }));
    assert!(has_try, "expected a try:\n{}", dump(&m));
    Ok(())
}

#[test]
fn branch_value_joins_after_if() -> Result<()> {
    // v0 = v1 >= 0 ? 9 : 7, encoded with a push on each arm that is
    // consumed only after the join
    let instrs = vec![
        jump_if(0, ge(v(1), Expr::Const(0)), 3),
        eval(1, Expr::Const(7)),
        goto(2, 4),
        eval(3, Expr::Const(9)),
        eval(4, Expr::store(LocalId(0), Expr::Stack)),
        ret(5, Some(v(0))),
    ];
    let m = check_equivalent(&instrs, 2, &[&[(1, -5)], &[(1, 5)]])?;
    assert_eq!(m.synthesized_locals, vec![LocalId(2)]);
    assert!(
        dump(&m).contains("v0 = v2"),
        "join should read the stack local:\n{}",
        dump(&m)
    );
    Ok(())
}

#[test]
fn straight_line_code_reduces() -> Result<()> {
    let mut instrs: Vec<Instruction> = (0..20)
        .map(|i| eval(i, call("w", vec![Expr::Const(i as i64)])))
        .collect();
    instrs.push(ret(20, None));
    let m = check_equivalent(&instrs, 0, &[&[]])?;
    let loops = tree_blocks(&m.graph, m.root)
        .into_iter()
        .filter(|b| matches!(&m.graph.block(*b).kind, BlockKind::Loop(_)))
        .count();
    assert_eq!(loops, 0, "straight-line code grew a loop:\n{}", dump(&m));
    Ok(())
}

#[test]
fn structuring_is_idempotent() -> Result<()> {
    // a second reduction pass over an already reduced graph changes nothing
    let instrs = vec![
        eval(0, Expr::store(LocalId(0), Expr::Const(1))),
        eval(1, call("w", vec![v(0)])),
        ret(2, None),
    ];
    let options = StructureOptions {
        check_consistency: true,
        ..Default::default()
    };
    let mut m = structure_method(&instrs, &[], 1, &options)?;
    let before = dump(&m);
    {
        let mut structurer = Structurer::new(&mut m.graph, &MatchingLoad);
        structurer.structure()?;
    }
    let entry = m.graph.entry();
    assert_eq!(m.graph.flow(entry).root, m.root);
    assert_eq!(before, dump(&m));
    Ok(())
}

#[test]
fn implicit_return_is_synthesized() -> Result<()> {
    // falling off the end of the method gets an explicit return
    let instrs = vec![
        eval(0, call("w", vec![])),
        Instruction {
            addr: 1,
            length: 1,
            op: InstrOp::Goto {
                target: flow_structurer::END_ADDR,
            },
        },
    ];
    let options = StructureOptions {
        check_consistency: true,
        ..Default::default()
    };
    let m = structure_method(&instrs, &[], 0, &options)?;
    let has_return = tree_blocks(&m.graph, m.root)
        .into_iter()
        .any(|b| matches!(&m.graph.block(b).kind, BlockKind::Return { value: None, .. }));
    assert!(has_return, "expected a synthesized return:\n{}", dump(&m));
    Ok(())
}

fn dump(m: &StructuredMethod) -> String {
    flow_structurer::dump_tree(&m.graph, m.root)
}
