// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Resolution of operand-stack placeholders after structuring.
//!
//! A single top-down pass walks the finished tree with an abstract stack.
//! A value pushed by one instruction and consumed by the next is fused into
//! the consumer's expression; anything that survives a control boundary is
//! materialized into a synthesized local keyed by its slot depth, so every
//! path reaching a merge point produces the same shape by construction.  A
//! cleanup pass afterwards folds locals written and read exactly once
//! back-to-back.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::block::{BlockId, BlockKind, LoopKind};
use crate::error::{Result, StructureError};
use crate::expr::Expr;
use crate::flow::FlowGraph;
use crate::variables::{LocalId, VariableStack};

#[derive(Clone, Debug)]
enum StackEntry {
    /// A value not yet bound anywhere: the producing instruction still
    /// holds the expression and can be rewritten into a store.
    Pending { expr: Expr, origin: BlockId },
    /// A value materialized into a synthesized local.
    Local(LocalId),
    /// The exception object delivered at a handler entry.
    Caught,
}

pub struct StackMapper<'a> {
    graph: &'a mut FlowGraph,
    /// Number of decoder-assigned locals; synthesized ones start above.
    n_locals: u32,
    synthesized: BTreeSet<LocalId>,
    /// Stack depth recorded at breaks, per breakable target.
    break_depths: BTreeMap<BlockId, usize>,
}

type Shape = Option<Vec<StackEntry>>;

impl<'a> StackMapper<'a> {
    pub fn new(graph: &'a mut FlowGraph, n_locals: u32) -> Self {
        StackMapper {
            graph,
            n_locals,
            synthesized: BTreeSet::new(),
            break_depths: BTreeMap::new(),
        }
    }

    /// Resolves every stack placeholder under `root`, starting from an
    /// empty stack.  Returns the synthesized locals, in slot order.
    pub fn run(mut self, root: BlockId) -> Result<Vec<LocalId>> {
        let exit = self.map_block(root, Vec::new())?;
        if let Some(stack) = exit {
            if !stack.is_empty() {
                return Err(StructureError::StackMerge(format!(
                    "{} operand(s) left on the stack at method exit",
                    stack.len()
                )));
            }
        }
        Ok(self.synthesized.into_iter().collect())
    }

    fn stack_local(&mut self, depth: usize) -> LocalId {
        let l = LocalId(self.n_locals + depth as u32);
        self.synthesized.insert(l);
        l
    }

    /// Turns the entry at `i` into a synthesized local, rewriting its
    /// producer into a store.
    fn materialize(&mut self, stack: &mut [StackEntry], i: usize) -> Result<()> {
        match stack[i].clone() {
            StackEntry::Local(_) => Ok(()),
            StackEntry::Caught => Err(StructureError::StackMerge(
                "caught exception crosses a control boundary".to_string(),
            )),
            StackEntry::Pending { expr, origin } => {
                let l = self.stack_local(i);
                match &mut self.graph.block_mut(origin).kind {
                    BlockKind::Instruction { expr: slot, .. } => {
                        *slot = Expr::store(l, expr);
                    }
                    _ => {
                        return Err(StructureError::consistency(
                            "pending stack value without a producing instruction",
                        ))
                    }
                }
                stack[i] = StackEntry::Local(l);
                Ok(())
            }
        }
    }

    fn materialize_range(&mut self, stack: &mut [StackEntry], upto: usize) -> Result<()> {
        for i in 0..upto {
            self.materialize(stack, i)?;
        }
        Ok(())
    }

    fn materialize_all(&mut self, stack: &mut Vec<StackEntry>) -> Result<()> {
        let len = stack.len();
        self.materialize_range(stack, len)
    }

    /// Pops the `n` values an expression consumes and yields them in
    /// evaluation order.  A consumer with side effects forces everything
    /// deeper on the stack into locals first, to keep effects in program
    /// order.
    fn consume(
        &mut self,
        stack: &mut Vec<StackEntry>,
        n: usize,
        effectful: bool,
    ) -> Result<Vec<Expr>> {
        if stack.len() < n {
            return Err(StructureError::StackMerge(format!(
                "operand stack underflow: need {}, have {}",
                n,
                stack.len()
            )));
        }
        let base = stack.len() - n;
        if effectful {
            self.materialize_range(stack, base)?;
        }
        let mut out = Vec::with_capacity(n);
        let group: Vec<(usize, StackEntry)> = stack
            .drain(base..)
            .enumerate()
            .map(|(off, e)| (base + off, e))
            .collect();
        for (depth, entry) in group {
            match entry {
                StackEntry::Local(l) => out.push(Expr::load(l)),
                StackEntry::Caught => out.push(Expr::Stack),
                StackEntry::Pending { expr, origin } => {
                    if self.graph.block(origin).jump.is_some() {
                        // the producer carries a jump and cannot be removed
                        let l = self.stack_local(depth);
                        if let BlockKind::Instruction { expr: slot, .. } =
                            &mut self.graph.block_mut(origin).kind
                        {
                            *slot = Expr::store(l, expr);
                        }
                        out.push(Expr::load(l));
                    } else {
                        self.graph.remove_block(origin)?;
                        out.push(expr);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Resolves the placeholders of one expression against the stack.
    fn fill_expr(&mut self, stack: &mut Vec<StackEntry>, expr: &mut Expr) -> Result<()> {
        let n = expr.stack_operands();
        if n == 0 {
            return Ok(());
        }
        let operands = self.consume(stack, n, expr.has_side_effect())?;
        let mut iter = operands.into_iter();
        expr.fill_stack_operands(&mut iter);
        Ok(())
    }

    /// Merges two shapes reaching the same point.  Values still pending on
    /// either side are materialized first, so every path leaves the same
    /// slot-keyed locals behind; only then must the shapes agree.
    fn merge_shapes(&mut self, a: Shape, b: Shape) -> Result<Shape> {
        match (a, b) {
            (None, s) | (s, None) => Ok(s),
            (Some(mut x), Some(mut y)) => {
                self.materialize_all(&mut x)?;
                self.materialize_all(&mut y)?;
                let sx = self.as_variable_stack(&x);
                let sy = self.as_variable_stack(&y);
                sx.merge(&sy)?;
                Ok(Some(x))
            }
        }
    }

    fn as_variable_stack(&self, stack: &[StackEntry]) -> VariableStack {
        let slots = stack
            .iter()
            .enumerate()
            .map(|(i, e)| match e {
                StackEntry::Local(l) => *l,
                _ => LocalId(self.n_locals + i as u32),
            })
            .collect();
        VariableStack::from_slots(slots)
    }

    /// Propagates the stack through one control node.  `None` means the
    /// node never falls through.
    fn map_block(&mut self, b: BlockId, mut stack: Vec<StackEntry>) -> Result<Shape> {
        match self.graph.block(b).kind.clone() {
            BlockKind::Empty => Ok(Some(stack)),
            BlockKind::Instruction { mut expr, addr } => {
                self.fill_expr(&mut stack, &mut expr)?;
                if expr.is_void() {
                    self.graph.block_mut(b).kind = BlockKind::Instruction { addr, expr };
                } else {
                    self.graph.block_mut(b).kind = BlockKind::Instruction {
                        addr,
                        expr: expr.clone(),
                    };
                    stack.push(StackEntry::Pending { expr, origin: b });
                }
                Ok(Some(stack))
            }
            BlockKind::Sequential { first, second } => {
                match self.map_block(first, stack)? {
                    Some(s) => self.map_block(second, s),
                    // unreachable continuation; resolve its placeholders
                    // against an empty stack so none survive
                    None => {
                        self.map_block(second, Vec::new())?;
                        Ok(None)
                    }
                }
            }
            BlockKind::Conditional {
                mut cond,
                addr,
                true_branch,
            } => {
                self.fill_expr(&mut stack, &mut cond)?;
                self.materialize_all(&mut stack)?;
                self.graph.block_mut(b).kind = BlockKind::Conditional {
                    cond,
                    addr,
                    true_branch,
                };
                let taken = self.map_block(true_branch, stack.clone())?;
                self.merge_shapes(taken, Some(stack))
            }
            BlockKind::IfThenElse {
                mut cond,
                then_branch,
                else_branch,
            } => {
                self.fill_expr(&mut stack, &mut cond)?;
                self.materialize_all(&mut stack)?;
                self.graph.block_mut(b).kind = BlockKind::IfThenElse {
                    cond,
                    then_branch,
                    else_branch,
                };
                let then_exit = self.map_block(then_branch, stack.clone())?;
                let else_exit = match else_branch {
                    Some(e) => self.map_block(e, stack.clone())?,
                    None => Some(stack),
                };
                self.merge_shapes(then_exit, else_exit)
            }
            BlockKind::Loop(mut data) => {
                self.materialize_all(&mut stack)?;
                if let Some(init) = data.init {
                    if let Some(s) = self.map_block(init, stack)? {
                        stack = s;
                    } else {
                        return Ok(None);
                    }
                    self.materialize_all(&mut stack)?;
                }
                let base = stack;
                if data.kind != LoopKind::DoWhile {
                    let mut head = base.clone();
                    self.fill_expr(&mut head, &mut data.cond)?;
                }
                let body_exit = self.map_block(data.body, base.clone())?;
                if data.kind == LoopKind::DoWhile {
                    if let Some(mut tail) = body_exit.clone() {
                        self.fill_expr(&mut tail, &mut data.cond)?;
                    }
                }
                if let Some(incr) = data.incr {
                    if let Some(exit) = body_exit.clone() {
                        self.map_block(incr, exit)?;
                    } else {
                        self.map_block(incr, base.clone())?;
                    }
                }
                let never_exits =
                    data.cond == Expr::Bool(true) && !self.break_depths.contains_key(&b);
                self.graph.block_mut(b).kind = BlockKind::Loop(data);
                if never_exits {
                    Ok(None)
                } else {
                    Ok(Some(base))
                }
            }
            BlockKind::Switch(mut data) => {
                self.fill_expr(&mut stack, &mut data.selector)?;
                self.materialize_all(&mut stack)?;
                let base = stack;
                let mut prev_exit: Shape = None;
                for case in &data.cases {
                    let entry = if case.fall_through {
                        match prev_exit.take() {
                            Some(s) => s,
                            None => base.clone(),
                        }
                    } else {
                        base.clone()
                    };
                    prev_exit = self.map_block(case.body, entry)?;
                }
                self.graph.block_mut(b).kind = BlockKind::Switch(data);
                let after = self.merge_shapes(prev_exit, Some(base))?;
                Ok(after)
            }
            BlockKind::Try { body, handlers } => {
                self.materialize_all(&mut stack)?;
                let base = stack;
                let mut exit = self.map_block(body, base.clone())?;
                for h in handlers {
                    let mut entry = base.clone();
                    entry.push(StackEntry::Caught);
                    let h_exit = self.map_block(h, entry)?;
                    // the handler consumed the exception slot
                    exit = self.merge_shapes(exit, h_exit)?;
                }
                Ok(exit.or(Some(base)))
            }
            BlockKind::Catch { body, .. }
            | BlockKind::Finally { body }
            | BlockKind::Synchronized { body, .. } => self.map_block(body, stack),
            BlockKind::Break { target, .. } => {
                self.materialize_all(&mut stack)?;
                self.break_depths.insert(target, stack.len());
                Ok(None)
            }
            BlockKind::Continue { .. } => {
                self.materialize_all(&mut stack)?;
                Ok(None)
            }
            BlockKind::Return { addr, value } => {
                let value = match value {
                    Some(mut v) => {
                        self.fill_expr(&mut stack, &mut v)?;
                        Some(v)
                    }
                    None => None,
                };
                self.graph.block_mut(b).kind = BlockKind::Return { addr, value };
                Ok(None)
            }
            BlockKind::Throw { addr, mut value } => {
                self.fill_expr(&mut stack, &mut value)?;
                self.graph.block_mut(b).kind = BlockKind::Throw { addr, value };
                Ok(None)
            }
        }
    }
}

/// Folds synthesized locals that are written and then read exactly once by
/// the immediately following statement.
pub fn remove_onetime_locals(
    graph: &mut FlowGraph,
    mut root: BlockId,
    n_locals: u32,
) -> Vec<LocalId> {
    loop {
        let (loads, stores) = count_uses(graph, root);
        let mut folded = false;
        for b in collect_blocks(graph, root) {
            let (first, second) = match &graph.block(b).kind {
                BlockKind::Sequential { first, second } => (*first, *second),
                _ => continue,
            };
            let store = match &graph.block(first).kind {
                BlockKind::Instruction {
                    expr: Expr::Store(l, value),
                    ..
                } if l.0 >= n_locals => Some((*l, (**value).clone())),
                _ => None,
            };
            let Some((local, value)) = store else { continue };
            if loads.get(&local).copied().unwrap_or(0) != 1
                || stores.get(&local).copied().unwrap_or(0) != 1
            {
                continue;
            }
            let Some(target) = first_statement_expr(graph, second) else {
                continue;
            };
            let reads_once = {
                let expr = statement_expr(graph, target);
                expr.map(|e| e.count_loads(local) == 1).unwrap_or(false)
            };
            if !reads_once {
                continue;
            }
            if graph.block(first).jump.is_some() {
                continue;
            }
            replace_in_statement(graph, target, local, &value);
            if graph.remove_block(first).is_ok() {
                // removing the store may have promoted the sibling into
                // the root slot
                if b == root {
                    root = second;
                }
                debug!("folded one-time local {}", local);
                folded = true;
                break;
            }
        }
        if !folded {
            break;
        }
    }
    let (loads, stores) = count_uses(graph, root);
    let mut live: BTreeSet<LocalId> = BTreeSet::new();
    for l in loads.keys().chain(stores.keys()) {
        if l.0 >= n_locals {
            live.insert(*l);
        }
    }
    live.into_iter().collect()
}

fn collect_blocks(graph: &FlowGraph, root: BlockId) -> Vec<BlockId> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(b) = stack.pop() {
        out.push(b);
        stack.extend(graph.children(b));
    }
    out
}

fn count_uses(
    graph: &FlowGraph,
    root: BlockId,
) -> (BTreeMap<LocalId, usize>, BTreeMap<LocalId, usize>) {
    let mut loads: BTreeMap<LocalId, usize> = BTreeMap::new();
    let mut stores: BTreeMap<LocalId, usize> = BTreeMap::new();
    for b in collect_blocks(graph, root) {
        for expr in block_exprs(graph, b) {
            count_expr(expr, &mut loads, &mut stores);
        }
    }
    (loads, stores)
}

fn block_exprs<'g>(graph: &'g FlowGraph, b: BlockId) -> Vec<&'g Expr> {
    match &graph.block(b).kind {
        BlockKind::Instruction { expr, .. } | BlockKind::Throw { value: expr, .. } => {
            vec![expr]
        }
        BlockKind::Conditional { cond, .. } | BlockKind::IfThenElse { cond, .. } => vec![cond],
        BlockKind::Loop(data) => vec![&data.cond],
        BlockKind::Switch(data) => vec![&data.selector],
        BlockKind::Return {
            value: Some(expr), ..
        } => vec![expr],
        BlockKind::Synchronized {
            monitor: Some(expr),
            ..
        } => vec![expr],
        _ => vec![],
    }
}

fn count_expr(
    expr: &Expr,
    loads: &mut BTreeMap<LocalId, usize>,
    stores: &mut BTreeMap<LocalId, usize>,
) {
    match expr {
        Expr::Load(l) => *loads.entry(*l).or_default() += 1,
        Expr::Store(l, e) => {
            *stores.entry(*l).or_default() += 1;
            count_expr(e, loads, stores);
        }
        Expr::Inc(l, _) => {
            *loads.entry(*l).or_default() += 1;
            *stores.entry(*l).or_default() += 1;
        }
        Expr::Unary(_, e) | Expr::Not(e) => count_expr(e, loads, stores),
        Expr::Binary(_, a, b) | Expr::Compare(_, a, b) => {
            count_expr(a, loads, stores);
            count_expr(b, loads, stores);
        }
        Expr::Call { args, .. } => {
            for a in args {
                count_expr(a, loads, stores);
            }
        }
        _ => {}
    }
}

/// The block whose expression executes first when control enters `b`.
fn first_statement_expr(graph: &FlowGraph, b: BlockId) -> Option<BlockId> {
    match &graph.block(b).kind {
        BlockKind::Sequential { first, .. } => first_statement_expr(graph, *first),
        BlockKind::Instruction { .. }
        | BlockKind::Conditional { .. }
        | BlockKind::IfThenElse { .. }
        | BlockKind::Switch(_)
        | BlockKind::Return { value: Some(_), .. }
        | BlockKind::Throw { .. } => Some(b),
        BlockKind::Loop(data)
            if data.kind != LoopKind::DoWhile && !matches!(data.cond, Expr::Bool(_)) =>
        {
            Some(b)
        }
        _ => None,
    }
}

fn statement_expr<'g>(graph: &'g FlowGraph, b: BlockId) -> Option<&'g Expr> {
    match &graph.block(b).kind {
        BlockKind::Instruction { expr, .. } | BlockKind::Throw { value: expr, .. } => Some(expr),
        BlockKind::Conditional { cond, .. } | BlockKind::IfThenElse { cond, .. } => Some(cond),
        BlockKind::Switch(data) => Some(&data.selector),
        BlockKind::Return {
            value: Some(expr), ..
        } => Some(expr),
        BlockKind::Loop(data) => Some(&data.cond),
        _ => None,
    }
}

fn replace_in_statement(graph: &mut FlowGraph, b: BlockId, local: LocalId, value: &Expr) {
    match &mut graph.block_mut(b).kind {
        BlockKind::Instruction { expr, .. } | BlockKind::Throw { value: expr, .. } => {
            expr.replace_load(local, value);
        }
        BlockKind::Conditional { cond, .. } | BlockKind::IfThenElse { cond, .. } => {
            cond.replace_load(local, value);
        }
        BlockKind::Switch(data) => {
            data.selector.replace_load(local, value);
        }
        BlockKind::Return {
            value: Some(expr), ..
        } => {
            expr.replace_load(local, value);
        }
        BlockKind::Loop(data) => {
            data.cond.replace_load(local, value);
        }
        _ => {}
    }
}
