// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! The reduction engine.
//!
//! Flow nodes are merged until a single node covers the whole method: a
//! successor with a unique predecessor is appended sequentially (the T1
//! step), a self-loop becomes a loop construct (the T2 step), and every
//! jump made internal by a merge is resolved into structured control flow,
//! falling back to breaks out of a synthetic `do {} while(false)` wrapper
//! when nothing nicer applies.

use std::collections::VecDeque;

use log::{debug, warn};

use crate::block::{BlockId, BlockKind, LoopData, LoopKind};
use crate::error::{Result, StructureError};
use crate::expr::Expr;
use crate::flow::{Destination, FlowGraph, FlowId, JumpId, Predecessor};
use crate::for_heuristic::{ForHeuristic, ForVerdict};
use crate::instr::Addr;

pub struct Structurer<'a> {
    pub(crate) graph: &'a mut FlowGraph,
    pub(crate) heuristic: &'a dyn ForHeuristic,
}

impl<'a> Structurer<'a> {
    pub fn new(graph: &'a mut FlowGraph, heuristic: &'a dyn ForHeuristic) -> Self {
        Structurer { graph, heuristic }
    }

    /// Reduces the whole graph into the entry node and resolves the jumps
    /// to the method end.  Fails if any flow node or jump survives, which
    /// only happens for irreducible or malformed input.
    pub fn structure(&mut self) -> Result<()> {
        let entry = self.graph.entry();
        self.analyze(entry, 0, Addr::MAX)?;
        self.merge_end_block(entry)?;
        for f in self.graph.live_flows().collect::<Vec<_>>() {
            if f != entry {
                return Err(StructureError::UnresolvedJump {
                    addr: self.graph.flow(f).addr,
                });
            }
        }
        if !self.graph.flow(entry).successors.is_empty() {
            return Err(StructureError::UnresolvedJump {
                addr: self.graph.flow(entry).addr,
            });
        }
        let root = self.graph.flow(entry).root;
        self.demote_unresolved_tentative(root);
        Ok(())
    }

    /// The main reduction loop over the address range `[start, end)`.
    /// Returns whether anything was merged.
    pub fn analyze(&mut self, flow: FlowId, start: Addr, end: Addr) -> Result<bool> {
        debug!("analyze {} in [{}, {})", flow, start, end);
        self.graph.check_consistent(flow)?;
        let mut changed = false;
        loop {
            let lm = self.graph.flow(flow).last_modified;
            if matches!(self.graph.block(lm).kind, BlockKind::Switch(_)) {
                self.analyze_switch(flow, start, end)?;
            }

            if self.do_t2(flow, start, end)? {
                debug!("T2 succeeded at {}", self.graph.flow(flow).addr);
                // a loop was formed; give the enclosing region a chance to
                // merge us before continuing
                if self.graph.flow(flow).addr != 0 {
                    return Ok(true);
                }
                changed = true;
            }

            let mut succ = self.graph.get_successor(flow, start, end);
            loop {
                let Some(s) = succ else {
                    return Ok(changed);
                };
                let adjacent = self.graph.flow(flow).next_by_addr == Some(s)
                    || self.graph.flow(s).next_by_addr == Some(flow);
                if adjacent && self.do_t1(flow, s)? {
                    debug!("T1 succeeded at {}", self.graph.flow(flow).addr);
                    changed = true;
                    break;
                }
                // if a predecessor of succ lies outside the region there is
                // no chance to merge it here
                for pred in self.graph.flow(s).predecessors.clone() {
                    let pred_addr = match pred {
                        Predecessor::Entry => 0,
                        Predecessor::Flow(p) => self.graph.flow(p).addr,
                    };
                    if pred_addr < start || pred_addr >= end {
                        return Ok(changed);
                    }
                }
                // recurse into the region succ belongs to: the part of
                // [start, end) on succ's side of this node
                let addr = self.graph.flow(flow).addr;
                let succ_addr = self.graph.flow(s).addr;
                let new_start = if succ_addr > addr {
                    self.graph.next_addr(flow)
                } else {
                    start
                };
                let new_end = if succ_addr > addr { end } else { addr };
                if self.analyze(s, new_start, new_end)? {
                    break;
                }
                let next_start = self.graph.flow(s).addr + 1;
                succ = self.graph.get_successor(flow, next_start, end);
            }
        }
    }

    /// T1: appends `succ` behind this node.  Requires `succ` to have this
    /// node as its only predecessor.
    pub fn do_t1(&mut self, this: FlowId, succ: FlowId) -> Result<bool> {
        if self.graph.flow(succ).predecessors != vec![Predecessor::Flow(this)] {
            return Ok(false);
        }
        self.graph.check_consistent(this)?;
        self.graph.check_consistent(succ)?;

        let jumps = self.graph.take_successor_jumps(this, Destination::Flow(succ));
        self.graph.update_in_out(this, succ, &jumps);
        let jumps = self.resolve_some_jumps(this, jumps, Destination::Flow(succ))?;
        self.resolve_remaining(this, jumps)?;

        let lm = self.graph.flow(this).last_modified;
        let succ_root = self.graph.flow(succ).root;
        let new_lm = self.graph.append_block(lm, succ_root)?;
        self.graph.flow_mut(this).last_modified = new_lm;
        self.graph.merge_successors(this, succ);
        self.do_transformations(this)?;
        self.graph.merge_addr(this, succ);
        self.graph.check_consistent(this)?;
        Ok(true)
    }

    /// T2: turns a self-loop into a loop construct.  Refuses while another
    /// predecessor inside the region could still be merged first, so that a
    /// continue does not force a fresh loop per back-edge.
    pub fn do_t2(&mut self, flow: FlowId, start: Addr, end: Addr) -> Result<bool> {
        if !self
            .graph
            .flow(flow)
            .predecessors
            .contains(&Predecessor::Flow(flow))
        {
            return Ok(false);
        }
        for pred in self.graph.flow(flow).predecessors.clone() {
            if let Predecessor::Flow(p) = pred {
                let pa = self.graph.flow(p).addr;
                if p != flow && pa >= start && pa < end {
                    return Ok(false);
                }
            }
        }
        self.graph.check_consistent(flow)?;

        let jumps = self.graph.take_successor_jumps(flow, Destination::Flow(flow));
        self.graph.update_in_out(flow, flow, &jumps);

        let body = self.graph.flow(flow).root;
        let lm = self.graph.flow(flow).last_modified;
        let mut created_for = false;

        // A single back-edge from a void instruction at the very end is the
        // shape of a for-loop increment.
        let lm_is_void_instr = matches!(
            &self.graph.block(lm).kind,
            BlockKind::Instruction { expr, .. } if expr.is_void()
        );
        if jumps.len() == 1 && self.graph.jump(jumps[0]).from == lm && lm_is_void_instr {
            let lm_outer = self.graph.block(lm).outer;
            let dowhile_false = lm_outer.and_then(|seq| {
                let BlockKind::Sequential { first, second } = self.graph.block(seq).kind
                else {
                    return None;
                };
                if second != lm {
                    return None;
                }
                match &self.graph.block(first).kind {
                    BlockKind::Loop(data)
                        if data.kind == LoopKind::DoWhile
                            && data.cond == Expr::Bool(false) =>
                    {
                        Some((seq, first))
                    }
                    _ => None,
                }
            });
            if let Some((seq, dwf)) = dowhile_false {
                // do { body } while(false); incr; goto top
                // becomes for(;; incr) { body }
                self.graph.detach_jump(lm);
                let for_block = self.graph.new_block(
                    flow,
                    BlockKind::Loop(LoopData {
                        kind: LoopKind::For,
                        cond: Expr::Bool(true),
                        body,
                        init: None,
                        incr: Some(lm),
                        incr_candidate: None,
                        may_change_jump: true,
                    }),
                );
                self.graph.replace_block(for_block, body)?;
                self.graph.block_mut(body).outer = Some(for_block);
                self.replace_break_continue(for_block, dwf, for_block);
                let dwf_body = match &self.graph.block(dwf).kind {
                    BlockKind::Loop(data) => data.body,
                    _ => unreachable!("checked above"),
                };
                self.graph.replace_block(dwf_body, seq)?;
                self.graph.block_mut(lm).outer = Some(for_block);
                created_for = true;
            } else {
                let lm_combinable = matches!(
                    &self.graph.block(lm).kind,
                    BlockKind::Instruction { expr, .. } if expr.is_combinable()
                );
                if lm_combinable {
                    // probably a for loop, but the condition has not been
                    // seen yet; speculate and leave the candidate increment
                    // in the body until the condition verdict
                    self.graph.detach_jump(lm);
                    let for_block = self.graph.new_block(
                        flow,
                        BlockKind::Loop(LoopData {
                            kind: LoopKind::TentativeFor,
                            cond: Expr::Bool(true),
                            body,
                            init: None,
                            incr: None,
                            incr_candidate: Some(lm),
                            may_change_jump: true,
                        }),
                    );
                    self.graph.replace_block(for_block, body)?;
                    self.graph.block_mut(body).outer = Some(for_block);
                    created_for = true;
                }
            }
        }

        if !created_for {
            let jumps = self.resolve_some_jumps(flow, jumps, Destination::Flow(flow))?;

            // the tree may have been rewritten above
            let body = self.graph.flow(flow).root;
            let while_block = self.graph.new_block(
                flow,
                BlockKind::Loop(LoopData {
                    kind: LoopKind::While,
                    cond: Expr::Bool(true),
                    body,
                    init: None,
                    incr: None,
                    incr_candidate: None,
                    may_change_jump: true,
                }),
            );
            self.graph.replace_block(while_block, body)?;
            self.graph.block_mut(body).outer = Some(while_block);

            let lm = self.graph.flow(flow).last_modified;
            for jump in jumps {
                let owner = self.graph.jump(jump).from;
                if owner == lm {
                    // handled below
                    continue;
                }
                let mut breaklevel = 0u32;
                let mut continuelevel = 0u32;
                let mut break_to = None;
                let mut sur = self.graph.block(owner).outer;
                while let Some(s) = sur {
                    if s == while_block {
                        break;
                    }
                    if self.graph.block(s).is_breakable() {
                        if matches!(self.graph.block(s).kind, BlockKind::Loop(_)) {
                            continuelevel += 1;
                        }
                        breaklevel += 1;
                        if self.graph.next_destination(s) == Some(Destination::Flow(flow)) {
                            break_to = Some(s);
                            break;
                        }
                    }
                    sur = self.graph.block(s).outer;
                }
                self.graph.detach_jump(owner);
                match break_to {
                    None => {
                        let cont = self.graph.new_block(
                            flow,
                            BlockKind::Continue {
                                target: while_block,
                                level: continuelevel + 1,
                            },
                        );
                        self.graph.append_block(owner, cont)?;
                    }
                    Some(target) => {
                        self.graph.set_breaked(target);
                        let brk = self.graph.new_block(
                            flow,
                            BlockKind::Break {
                                target,
                                level: breaklevel,
                            },
                        );
                        self.graph.append_block(owner, brk)?;
                    }
                }
            }
            let lm = self.graph.flow(flow).last_modified;
            if let Some(j) = self.graph.block(lm).jump {
                if self.graph.jump(j).destination == Destination::Flow(flow) {
                    self.graph.detach_jump(lm);
                }
            }
        }

        self.graph
            .flow_mut(flow)
            .predecessors
            .retain(|p| *p != Predecessor::Flow(flow));
        let root = self.graph.flow(flow).root;
        self.graph.flow_mut(flow).last_modified = root;
        self.do_transformations(flow)?;
        self.graph.check_consistent(flow)?;
        Ok(true)
    }

    /// Replaces breaks out of `old_target` inside `tree` with continues to
    /// `new_target`.
    fn replace_break_continue(&mut self, tree: BlockId, old_target: BlockId, new_target: BlockId) {
        let mut stack = vec![tree];
        while let Some(b) = stack.pop() {
            if let BlockKind::Break { target, level } = self.graph.block(b).kind {
                if target == old_target {
                    self.graph.block_mut(b).kind = BlockKind::Continue {
                        target: new_target,
                        level,
                    };
                }
            }
            stack.extend(self.graph.children(b));
        }
    }

    /// Attaches a loop condition, settling a pending for-loop speculation.
    fn set_loop_condition(&mut self, loop_id: BlockId, cond: Expr) -> Result<()> {
        let data = match &self.graph.block(loop_id).kind {
            BlockKind::Loop(data) => data.clone(),
            _ => {
                return Err(StructureError::consistency(format!(
                    "{} is not a loop",
                    loop_id
                )))
            }
        };
        if data.kind == LoopKind::TentativeFor {
            let cand = data.incr_candidate.ok_or_else(|| {
                StructureError::consistency("speculative for-loop without candidate increment")
            })?;
            let incr_expr = match &self.graph.block(cand).kind {
                BlockKind::Instruction { expr, .. } => expr.clone(),
                _ => {
                    return Err(StructureError::consistency(
                        "candidate increment is not an instruction",
                    ))
                }
            };
            match self.heuristic.judge(&cond, &incr_expr) {
                ForVerdict::Match => {
                    // commit: detach the increment from the body
                    self.graph.remove_block(cand)?;
                    self.graph.block_mut(cand).outer = Some(loop_id);
                    if let BlockKind::Loop(data) = &mut self.graph.block_mut(loop_id).kind {
                        data.kind = LoopKind::For;
                        data.incr = Some(cand);
                        data.incr_candidate = None;
                    }
                }
                verdict => {
                    if verdict == ForVerdict::Ambiguous {
                        warn!(
                            "for-loop heuristic undecided on condition {}; demoting to while",
                            cond
                        );
                    }
                    if let BlockKind::Loop(data) = &mut self.graph.block_mut(loop_id).kind {
                        data.kind = LoopKind::While;
                        data.incr_candidate = None;
                    }
                }
            }
        }
        if let BlockKind::Loop(data) = &mut self.graph.block_mut(loop_id).kind {
            data.cond = cond;
            data.may_change_jump = false;
        }
        Ok(())
    }

    /// Tries to turn the jumps to `succ` into structured control flow.
    /// Whatever cannot be handled is returned for `resolve_remaining`.
    fn resolve_some_jumps(
        &mut self,
        flow: FlowId,
        jumps: Vec<JumpId>,
        succ: Destination,
    ) -> Result<Vec<JumpId>> {
        let mut remaining: Vec<JumpId> = Vec::new();

        let lm = self.graph.flow(flow).last_modified;
        if self.graph.block(lm).jump.is_none() {
            // lastModified can be a breakable block with no break to it
            // yet; give it an explicit jump since the rules below rely on
            // the last block having one
            let j = self.graph.set_pending_jump(lm, succ)?;
            remaining.push(j);
        }

        // make sure that for conditionals with two pending jumps the jump
        // to succ sits on the conditional itself, not the branch
        for &jump in &jumps {
            let owner = self.graph.jump(jump).from;
            let Some(outer) = self.graph.block(owner).outer else {
                continue;
            };
            let is_two_jump_cond = matches!(
                self.graph.block(outer).kind,
                BlockKind::Conditional { .. }
            ) && self.graph.block(outer).jump.is_some();
            if is_two_jump_cond {
                if let BlockKind::Conditional { cond, .. } =
                    &mut self.graph.block_mut(outer).kind
                {
                    let negated = std::mem::replace(cond, Expr::Bool(false)).negate();
                    *cond = negated;
                }
                self.graph.swap_jump(outer, owner);
            }
        }

        let mut queue: VecDeque<JumpId> = jumps.into();
        'next_jump: while let Some(jump) = queue.pop_front() {
            let owner = self.graph.jump(jump).from;
            let lm = self.graph.flow(flow).last_modified;
            if owner == lm {
                remaining.push(jump);
                continue;
            }

            // owner has a parent, otherwise it would be lastModified
            let outer = self.graph.block(owner).outer.ok_or_else(|| {
                StructureError::consistency("dangling jump owner in resolution")
            })?;

            if let BlockKind::Conditional { cond, .. } = &self.graph.block(outer).kind {
                let cb = outer;
                let cond = cond.clone();

                if self.graph.block(cb).jump.is_some() {
                    // "if (cond) {}": both edges of the conditional reach
                    // succ; rewrite by hand
                    self.graph.detach_jump(owner);
                    let if_block = self.graph.new_block(
                        flow,
                        BlockKind::IfThenElse {
                            cond: cond.negate(),
                            then_branch: owner,
                            else_branch: None,
                        },
                    );
                    self.graph.replace_block(if_block, cb)?;
                    self.graph.block_mut(owner).outer = Some(if_block);
                    let cb_jump = self.graph.block(cb).jump.expect("checked above");
                    self.graph.block_mut(cb).jump = None;
                    self.graph.jump_mut(cb_jump).from = if_block;
                    self.graph.block_mut(if_block).jump = Some(cb_jump);
                    if self.graph.flow(flow).last_modified == cb {
                        self.graph.flow_mut(flow).last_modified = if_block;
                    }
                    continue;
                }

                // condition at a loop head becomes the loop condition
                let head_loop = {
                    let cb_outer = self.graph.block(cb).outer;
                    match cb_outer {
                        Some(o) if matches!(self.graph.block(o).kind, BlockKind::Loop(_)) => {
                            Some(o)
                        }
                        Some(o) => match self.graph.block(o).kind {
                            BlockKind::Sequential { first, .. } if first == cb => {
                                match self.graph.block(o).outer {
                                    Some(oo)
                                        if matches!(
                                            self.graph.block(oo).kind,
                                            BlockKind::Loop(_)
                                        ) =>
                                    {
                                        Some(oo)
                                    }
                                    _ => None,
                                }
                            }
                            _ => None,
                        },
                        None => None,
                    }
                };
                if let Some(loop_id) = head_loop {
                    let (loop_cond, loop_kind) = match &self.graph.block(loop_id).kind {
                        BlockKind::Loop(d) => (d.cond.clone(), d.kind),
                        _ => unreachable!("checked above"),
                    };
                    if loop_cond == Expr::Bool(true)
                        && loop_kind != LoopKind::DoWhile
                        && (self.graph.jump_may_be_changed(loop_id)
                            || self.graph.next_destination(loop_id) == Some(succ))
                    {
                        if self.graph.block(loop_id).jump.is_none() {
                            self.graph.move_jump(loop_id, jump)?;
                            queue.push_front(jump);
                        } else {
                            self.graph.detach_jump(owner);
                        }
                        self.set_loop_condition(loop_id, cond.negate())?;
                        self.graph.remove_block(cb)?;
                        continue;
                    }
                }

                // condition at the very end of a while(true) body turns it
                // into a do-while
                let tail_loop = {
                    let cb_outer = self.graph.block(cb).outer;
                    match cb_outer {
                        Some(o) => match self.graph.block(o).kind {
                            BlockKind::Sequential { second, .. } if second == cb => {
                                let mut sb = self.graph.block(o).outer;
                                while let Some(s) = sb {
                                    if matches!(
                                        self.graph.block(s).kind,
                                        BlockKind::Sequential { .. }
                                    ) {
                                        sb = self.graph.block(s).outer;
                                    } else {
                                        break;
                                    }
                                }
                                sb
                            }
                            _ => None,
                        },
                        None => None,
                    }
                };
                if let Some(loop_id) = tail_loop {
                    let qualifies = match &self.graph.block(loop_id).kind {
                        BlockKind::Loop(d) => {
                            d.cond == Expr::Bool(true) && d.kind == LoopKind::While
                        }
                        _ => false,
                    };
                    if qualifies
                        && (self.graph.jump_may_be_changed(loop_id)
                            || self.graph.next_destination(loop_id) == Some(succ))
                    {
                        if self.graph.block(loop_id).jump.is_none() {
                            self.graph.move_jump(loop_id, jump)?;
                            queue.push_front(jump);
                        } else {
                            self.graph.detach_jump(owner);
                        }
                        if let BlockKind::Loop(data) = &mut self.graph.block_mut(loop_id).kind {
                            data.kind = LoopKind::DoWhile;
                        }
                        self.set_loop_condition(loop_id, cond.negate())?;
                        self.graph.remove_block(cb)?;
                        continue;
                    }
                }

                //  /if cond goto succ          if (!cond)
                //  \block               ===>     block
                //  -> succ                     -> succ
                let seq_then = {
                    let cb_outer = self.graph.block(cb).outer;
                    match cb_outer {
                        Some(o) => match self.graph.block(o).kind {
                            BlockKind::Sequential { first, second } if first == cb => {
                                Some((o, second))
                            }
                            _ => None,
                        },
                        None => None,
                    }
                };
                if let Some((seq, then_block)) = seq_then {
                    if self.graph.next_destination(seq) == Some(succ)
                        || self.graph.jump_may_be_changed(seq)
                    {
                        let if_block = self.graph.new_block(
                            flow,
                            BlockKind::IfThenElse {
                                cond: cond.negate(),
                                then_branch: then_block,
                                else_branch: None,
                            },
                        );
                        self.graph.replace_block(if_block, seq)?;
                        self.graph.block_mut(then_block).outer = Some(if_block);

                        let lm = self.graph.flow(flow).last_modified;
                        if self.graph.block_contains(then_block, lm) {
                            let lm_jump = self.graph.block(lm).jump;
                            if let Some(lj) = lm_jump {
                                if self.graph.jump(lj).destination == succ {
                                    self.graph.move_jump(if_block, lj)?;
                                    self.graph.flow_mut(flow).last_modified = if_block;
                                    self.graph.detach_jump(owner);
                                    continue;
                                }
                            }
                            self.graph.flow_mut(flow).last_modified = if_block;
                        }
                        self.graph.move_jump(if_block, jump)?;
                        queue.push_front(jump);
                        continue;
                    }
                }
            } else {
                // a jump to where control would fall anyway is redundant
                if self.graph.natural_next_destination(owner)
                    == Some(self.graph.jump(jump).destination)
                {
                    self.graph.detach_jump(owner);
                    continue;
                }

                // ascend the sequential chain; only the last block of a
                // chain can carry a jump
                let mut sb = self.graph.block(owner).outer;
                while let Some(s) = sb {
                    if matches!(self.graph.block(s).kind, BlockKind::Sequential { .. }) {
                        sb = self.graph.block(s).outer;
                    } else {
                        break;
                    }
                }

                // a jump at the end of a then-branch while the if itself
                // has a jump: give the if an explicit else holding that
                // jump and lift this one onto the if
                if let Some(if_id) = sb {
                    if let BlockKind::IfThenElse {
                        else_branch: None, ..
                    } = self.graph.block(if_id).kind
                    {
                        if self.graph.block(if_id).jump.is_some() {
                            let else_block = self.graph.new_block(flow, BlockKind::Empty);
                            let if_jump =
                                self.graph.block(if_id).jump.expect("checked above");
                            self.graph.block_mut(if_id).jump = None;
                            self.graph.jump_mut(if_jump).from = else_block;
                            self.graph.block_mut(else_block).jump = Some(if_jump);
                            self.graph.block_mut(else_block).outer = Some(if_id);
                            if let BlockKind::IfThenElse { else_branch, .. } =
                                &mut self.graph.block_mut(if_id).kind
                            {
                                *else_branch = Some(else_block);
                            }
                            self.graph.move_jump(if_id, jump)?;
                            queue.push_front(jump);
                            continue;
                        }
                    }
                }

                // a then-branch jump where the if is followed by exactly
                // the code the else would hold: adopt it as the else branch
                if let Some(if_id) = sb {
                    let adoption = match self.graph.block(if_id).kind {
                        BlockKind::IfThenElse {
                            else_branch: None, ..
                        } => match self.graph.block(if_id).outer {
                            Some(seq) => match self.graph.block(seq).kind {
                                BlockKind::Sequential { first, second } if first == if_id => {
                                    Some((seq, second))
                                }
                                _ => None,
                            },
                            None => None,
                        },
                        _ => None,
                    };
                    if let Some((seq, else_block)) = adoption {
                        let eligible = self.graph.next_destination(else_block) == Some(succ)
                            || self.graph.block(else_block).jump.is_some()
                            || self.graph.jump_may_be_changed(else_block);
                        if eligible {
                            self.graph.replace_block(if_id, seq)?;
                            self.graph.block_mut(else_block).outer = Some(if_id);
                            if let BlockKind::IfThenElse { else_branch, .. } =
                                &mut self.graph.block_mut(if_id).kind
                            {
                                *else_branch = Some(else_block);
                            }

                            let lm = self.graph.flow(flow).last_modified;
                            if self.graph.block_contains(else_block, lm) {
                                let lm_jump = self.graph.block(lm).jump;
                                if let Some(lj) = lm_jump {
                                    if self.graph.jump(lj).destination == succ {
                                        self.graph.move_jump(if_id, lj)?;
                                        self.graph.flow_mut(flow).last_modified = if_id;
                                        self.graph.detach_jump(owner);
                                        continue;
                                    }
                                }
                                self.graph.flow_mut(flow).last_modified = if_id;
                            }
                            self.graph.move_jump(if_id, jump)?;
                            queue.push_front(jump);
                            continue;
                        }
                    }
                }
            }

            // a jump out of a breakable block whose next block is still
            // open: move the jump onto the breakable, the break itself is
            // generated later
            let mut sur = self.graph.block(owner).outer;
            while let Some(s) = sur {
                if self.graph.block(s).is_breakable() {
                    if self.graph.next_destination(s) == Some(succ) {
                        // we can break to that block; done later
                        break;
                    }
                    if self.graph.jump_may_be_changed(s) {
                        let new_jump = self.graph.set_pending_jump(s, succ)?;
                        self.graph.set_breaked(s);
                        queue.push_front(new_jump);
                        break;
                    }
                    if succ == Destination::EndOfMethod {
                        // prefer a plain return over a labeled break
                        break;
                    }
                }
                sur = self.graph.block(s).outer;
            }
            remaining.push(jump);
            continue 'next_jump;
        }
        Ok(remaining)
    }

    /// Resolves the leftover jumps with breaks, wrapping everything in a
    /// `do {} while(false)` as the last resort.
    fn resolve_remaining(&mut self, flow: FlowId, jumps: Vec<JumpId>) -> Result<()> {
        let mut dowhile_false: Option<BlockId> = None;
        let mut outer_most = self.graph.flow(flow).last_modified;
        let mut remove_last = false;
        for jump in jumps {
            let owner = self.graph.jump(jump).from;
            if owner == self.graph.flow(flow).last_modified {
                remove_last = true;
                continue;
            }
            let dest = self.graph.jump(jump).destination;
            let mut breaklevel = 0u32;
            let mut break_to = None;
            let mut sur = self.graph.block(owner).outer;
            while let Some(s) = sur {
                if self.graph.block(s).is_breakable() {
                    breaklevel += 1;
                    if self.graph.next_destination(s) == Some(dest) {
                        break_to = Some(s);
                        break;
                    }
                }
                sur = self.graph.block(s).outer;
            }
            self.graph.detach_jump(owner);
            match break_to {
                None => {
                    let dwf = match dowhile_false {
                        Some(d) => d,
                        None => {
                            // kind is completed once the wrapped region is
                            // known
                            let d = self.graph.new_block(flow, BlockKind::Empty);
                            dowhile_false = Some(d);
                            d
                        }
                    };
                    while !self.graph.block_contains(outer_most, owner) {
                        outer_most = self
                            .graph
                            .block(outer_most)
                            .outer
                            .ok_or_else(|| {
                                StructureError::consistency(
                                    "unresolved jump outside the flow tree",
                                )
                            })?;
                    }
                    let brk = self.graph.new_block(
                        flow,
                        BlockKind::Break {
                            target: dwf,
                            level: breaklevel + 1,
                        },
                    );
                    self.graph.append_block(owner, brk)?;
                }
                Some(target) => {
                    self.graph.set_breaked(target);
                    let brk = self.graph.new_block(
                        flow,
                        BlockKind::Break {
                            target,
                            level: breaklevel,
                        },
                    );
                    self.graph.append_block(owner, brk)?;
                }
            }
        }
        if remove_last {
            let lm = self.graph.flow(flow).last_modified;
            self.graph.detach_jump(lm);
        }
        if let Some(dwf) = dowhile_false {
            self.graph.replace_block(dwf, outer_most)?;
            self.graph.block_mut(outer_most).outer = Some(dwf);
            self.graph.block_mut(dwf).kind = BlockKind::Loop(LoopData {
                kind: LoopKind::DoWhile,
                cond: Expr::Bool(false),
                body: outer_most,
                init: None,
                incr: None,
                incr_candidate: None,
                may_change_jump: false,
            });
            self.graph.flow_mut(flow).last_modified = dwf;
        }
        Ok(())
    }

    /// Merges the cases of the switch at `last_modified`: the lowest
    /// not-yet-merged case whose body is a bare jump is analyzed and, if it
    /// ends up directly behind the already merged code, pulled into the
    /// case slot.  Fall-through between neighbouring cases is preserved.
    pub fn analyze_switch(&mut self, flow: FlowId, start: Addr, end: Addr) -> Result<bool> {
        let switch_block = self.graph.flow(flow).last_modified;
        let case_count = match &self.graph.block(switch_block).kind {
            BlockKind::Switch(data) => data.cases.len(),
            _ => return Ok(false),
        };
        let mut changed = false;
        let mut last: Option<usize> = None;
        let mut last_flow: Option<FlowId> = None;
        for i in 0..case_count {
            let body = match &self.graph.block(switch_block).kind {
                BlockKind::Switch(data) => data.cases[i].body,
                _ => unreachable!("checked above"),
            };
            if !self.graph.block(body).is_empty_kind() {
                continue;
            }
            let Some(case_jump) = self.graph.block(body).jump else {
                continue;
            };
            let next_flow = match self.graph.jump(case_jump).destination {
                Destination::Flow(f) => f,
                // the end-of-method target is beyond every region
                _ => break,
            };
            let next_addr = self.graph.flow(next_flow).addr;
            if next_addr >= end {
                break;
            }
            if next_addr < start {
                continue;
            }

            // reduce the case region first; analyze can return early after
            // a loop formation, so call it until nothing changes
            loop {
                let region_start = self.graph.next_addr(flow);
                if !self.analyze(next_flow, region_start, end)? {
                    break;
                }
            }
            if self.graph.flow(next_flow).addr != self.graph.next_addr(flow) {
                break;
            }

            // the case region must be private to this switch (and the
            // previous case, for fall-through)
            let preds = self.graph.flow(next_flow).predecessors.clone();
            let has_fall_through = preds.len() == 2;
            if preds.len() > 2
                || (preds.len() > 1
                    && !last_flow
                        .map(|lf| preds.contains(&Predecessor::Flow(lf)))
                        .unwrap_or(false))
            {
                break;
            }
            let jump_count = self
                .graph
                .flow(flow)
                .successors
                .get(&Destination::Flow(next_flow))
                .map(Vec::len)
                .unwrap_or(0);
            if jump_count > 1 {
                break;
            }

            self.graph.check_consistent(flow)?;
            let jumps = self
                .graph
                .take_successor_jumps(flow, Destination::Flow(next_flow));

            if has_fall_through {
                let lf = last_flow.expect("two predecessors imply a previous case");
                let last_jumps = self
                    .graph
                    .take_successor_jumps(lf, Destination::Flow(next_flow));
                let mut all = jumps.clone();
                all.extend(last_jumps.iter().copied());
                self.graph.update_in_out(flow, next_flow, &all);
                let rem = self.resolve_some_jumps(lf, last_jumps, Destination::Flow(next_flow))?;
                self.resolve_remaining(lf, rem)?;
                if let BlockKind::Switch(data) = &mut self.graph.block_mut(switch_block).kind {
                    data.cases[i].fall_through = true;
                }
            } else {
                self.graph.update_in_out(flow, next_flow, &jumps);
            }

            if let (Some(lf), Some(l)) = (last_flow, last) {
                let slot = match &self.graph.block(switch_block).kind {
                    BlockKind::Switch(data) => data.cases[l].body,
                    _ => unreachable!("checked above"),
                };
                let lf_root = self.graph.flow(lf).root;
                self.graph.replace_block(lf_root, slot)?;
                self.graph.merge_successors(flow, lf);
            }

            self.graph.detach_jump(body);
            self.graph.merge_addr(flow, next_flow);

            last_flow = Some(next_flow);
            last = Some(i);
            changed = true;
        }
        if let (Some(lf), Some(l)) = (last_flow, last) {
            let slot = match &self.graph.block(switch_block).kind {
                BlockKind::Switch(data) => data.cases[l].body,
                _ => unreachable!("checked above"),
            };
            let lf_root = self.graph.flow(lf).root;
            self.graph.replace_block(lf_root, slot)?;
            self.graph.merge_successors(flow, lf);
        }
        self.graph.check_consistent(flow)?;
        Ok(changed)
    }

    /// The final step: resolves the jumps to the method end.  Jumps from
    /// return and throw nodes are implicit and simply dropped; the others
    /// become breaks or synthesized returns.
    pub fn merge_end_block(&mut self, flow: FlowId) -> Result<()> {
        self.graph.check_consistent(flow)?;
        let all = self
            .graph
            .take_successor_jumps(flow, Destination::EndOfMethod);
        if all.is_empty() {
            return Ok(());
        }
        let mut jumps = Vec::new();
        for j in all {
            let owner = self.graph.jump(j).from;
            if matches!(
                self.graph.block(owner).kind,
                BlockKind::Return { .. } | BlockKind::Throw { .. }
            ) {
                self.graph.detach_jump(owner);
                continue;
            }
            jumps.push(j);
        }
        let jumps = self.resolve_some_jumps(flow, jumps, Destination::EndOfMethod)?;
        let end_addr = self.graph.next_addr(flow);
        for jump in jumps {
            let owner = self.graph.jump(jump).from;
            if owner == self.graph.flow(flow).last_modified {
                // handled below
                continue;
            }
            // only consider the innermost breakable: a labeled break is
            // never better than a plain return
            let mut break_to = None;
            let mut sur = self.graph.block(owner).outer;
            while let Some(s) = sur {
                if self.graph.block(s).is_breakable() {
                    if self.graph.next_destination(s) == Some(Destination::EndOfMethod) {
                        break_to = Some(s);
                    }
                    break;
                }
                sur = self.graph.block(s).outer;
            }
            self.graph.detach_jump(owner);
            match break_to {
                None => {
                    let ret = self.graph.new_block(
                        flow,
                        BlockKind::Return {
                            addr: end_addr,
                            value: None,
                        },
                    );
                    self.graph.append_block(owner, ret)?;
                }
                Some(target) => {
                    self.graph.set_breaked(target);
                    let brk = self
                        .graph
                        .new_block(flow, BlockKind::Break { target, level: 1 });
                    self.graph.append_block(owner, brk)?;
                }
            }
        }
        let lm = self.graph.flow(flow).last_modified;
        if let Some(j) = self.graph.block(lm).jump {
            if self.graph.jump(j).destination == Destination::EndOfMethod {
                self.graph.detach_jump(lm);
            }
        }
        self.do_transformations(flow)?;
        self.graph.check_consistent(flow)?;
        Ok(())
    }

    /// Tree-local cleanups after a merge, currently the attachment of
    /// for-loop initializers.  Also re-settles `last_modified` at the end
    /// of the sequential chain.
    fn do_transformations(&mut self, flow: FlowId) -> Result<()> {
        let mut lm = self.graph.flow(flow).last_modified;
        while let BlockKind::Sequential { first, second } = self.graph.block(lm).kind {
            if !self.transform_block(first, lm)? {
                lm = second;
            }
        }
        while self.transform_block(lm, lm)? {}
        self.graph.flow_mut(flow).last_modified = lm;
        Ok(())
    }

    /// Attaches the instruction right before a committed for-loop as its
    /// initializer.  `last` is the current end of the sequential chain;
    /// the candidate initializer is the block right before it.
    fn transform_block(&mut self, b: BlockId, last: BlockId) -> Result<bool> {
        let cond = match &self.graph.block(b).kind {
            BlockKind::Loop(data) if data.kind == LoopKind::For && data.init.is_none() => {
                data.cond.clone()
            }
            _ => return Ok(false),
        };
        let Some(parent) = self.graph.block(last).outer else {
            return Ok(false);
        };
        let BlockKind::Sequential { first, .. } = self.graph.block(parent).kind else {
            return Ok(false);
        };
        if first == last {
            return Ok(false);
        }
        let matches_init = matches!(
            &self.graph.block(first).kind,
            BlockKind::Instruction { expr, .. }
                if expr.is_void()
                    && expr.is_combinable()
                    && expr
                        .combinable_target()
                        .map(|t| cond.contains_load(t))
                        .unwrap_or(false)
        );
        if !matches_init || self.graph.block(first).jump.is_some() {
            return Ok(false);
        }
        // pull the initializer out of the chain into the loop
        self.graph.remove_block(first)?;
        self.graph.block_mut(first).outer = Some(b);
        if let BlockKind::Loop(data) = &mut self.graph.block_mut(b).kind {
            data.init = Some(first);
        }
        debug!("attached for-loop initializer at {}", b);
        Ok(true)
    }

    /// Demotes loops whose speculation was never settled because no
    /// condition ever reached them.
    fn demote_unresolved_tentative(&mut self, root: BlockId) {
        let mut stack = vec![root];
        while let Some(b) = stack.pop() {
            stack.extend(self.graph.children(b));
            if let BlockKind::Loop(data) = &mut self.graph.block_mut(b).kind {
                if data.kind == LoopKind::TentativeFor {
                    debug!("demoting undecided for-loop speculation at {}", b);
                    data.kind = LoopKind::While;
                    data.incr_candidate = None;
                }
            }
        }
    }
}
