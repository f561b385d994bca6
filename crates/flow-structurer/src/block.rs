// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Control nodes: the tagged tree the structurer grows inside each flow
//! node.  Nodes live in the arena owned by [`FlowGraph`] and reference each
//! other through [`BlockId`] handles; the `outer` back-reference always
//! mirrors the parent's child slot.

use std::fmt;

use crate::error::{Result, StructureError};
use crate::expr::Expr;
use crate::flow::{Destination, FlowGraph, FlowId, JumpId};
use crate::instr::Addr;
use crate::variables::VariableSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
    While,
    DoWhile,
    For,
    /// Speculatively promoted for-loop; demoted to `While` if the condition
    /// discovered later does not reference the candidate increment's target.
    TentativeFor,
}

#[derive(Clone, Debug)]
pub struct LoopData {
    pub kind: LoopKind,
    /// The loop condition; `Expr::Bool(true)` for a not-yet-conditioned
    /// loop, `Expr::Bool(false)` only for the `do {} while(false)` wrapper.
    pub cond: Expr,
    pub body: BlockId,
    /// Initializer instruction, only for `For`.
    pub init: Option<BlockId>,
    /// Increment instruction, detached from the body, only for `For`.
    pub incr: Option<BlockId>,
    /// For `TentativeFor`: the candidate increment, still inside the body.
    /// The body is not touched until the condition verdict commits it.
    pub incr_candidate: Option<BlockId>,
    /// False once a condition was attached or a break targets this loop.
    pub may_change_jump: bool,
}

#[derive(Clone, Debug)]
pub struct SwitchCase {
    pub values: Vec<i64>,
    pub is_default: bool,
    pub body: BlockId,
    /// True if execution of this case continues into the following case.
    pub fall_through: bool,
}

#[derive(Clone, Debug)]
pub struct SwitchData {
    pub selector: Expr,
    pub addr: Addr,
    /// Cases ordered by target address.
    pub cases: Vec<SwitchCase>,
    pub may_change_jump: bool,
}

#[derive(Clone, Debug)]
pub enum BlockKind {
    Empty,
    Instruction { addr: Addr, expr: Expr },
    Sequential { first: BlockId, second: BlockId },
    /// The not-yet-structured `if (cond) goto`: the true branch is an empty
    /// block owning the jump to the branch target.
    Conditional { addr: Addr, cond: Expr, true_branch: BlockId },
    IfThenElse {
        cond: Expr,
        then_branch: BlockId,
        else_branch: Option<BlockId>,
    },
    Loop(LoopData),
    Switch(SwitchData),
    Try { body: BlockId, handlers: Vec<BlockId> },
    Catch { exception: Option<String>, body: BlockId },
    Finally { body: BlockId },
    Synchronized { monitor: Option<Expr>, body: BlockId },
    /// Break out of `target`, crossing `level` breakable ancestors
    /// (1 = the innermost).
    Break { target: BlockId, level: u32 },
    Continue { target: BlockId, level: u32 },
    Return { addr: Addr, value: Option<Expr> },
    Throw { addr: Addr, value: Expr },
}

#[derive(Clone, Debug)]
pub struct Block {
    pub kind: BlockKind,
    pub outer: Option<BlockId>,
    pub flow: FlowId,
    pub jump: Option<JumpId>,
}

impl Block {
    pub fn is_empty_kind(&self) -> bool {
        matches!(self.kind, BlockKind::Empty)
    }

    pub fn is_breakable(&self) -> bool {
        matches!(self.kind, BlockKind::Loop(_) | BlockKind::Switch(_))
    }
}

impl FlowGraph {
    pub fn new_block(&mut self, flow: FlowId, kind: BlockKind) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            kind,
            outer: None,
            flow,
            jump: None,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    /// The direct children of a control node, in execution order.  Loop
    /// init/increment slots and switch case bodies are children too.
    pub fn children(&self, id: BlockId) -> Vec<BlockId> {
        match &self.block(id).kind {
            BlockKind::Sequential { first, second } => vec![*first, *second],
            BlockKind::Conditional { true_branch, .. } => vec![*true_branch],
            BlockKind::IfThenElse {
                then_branch,
                else_branch,
                ..
            } => {
                let mut kids = vec![*then_branch];
                kids.extend(else_branch.iter().copied());
                kids
            }
            BlockKind::Loop(data) => {
                let mut kids = Vec::new();
                kids.extend(data.init.iter().copied());
                kids.push(data.body);
                kids.extend(data.incr.iter().copied());
                kids
            }
            BlockKind::Switch(data) => data.cases.iter().map(|c| c.body).collect(),
            BlockKind::Try { body, handlers } => {
                let mut kids = vec![*body];
                kids.extend(handlers.iter().copied());
                kids
            }
            BlockKind::Catch { body, .. }
            | BlockKind::Finally { body }
            | BlockKind::Synchronized { body, .. } => vec![*body],
            _ => vec![],
        }
    }

    /// Replaces `old`'s child slot pointing at `from` with `to`.
    fn replace_child(&mut self, parent: BlockId, from: BlockId, to: BlockId) -> Result<()> {
        let kind = &mut self.blocks[parent.0 as usize].kind;
        let slot = match kind {
            BlockKind::Sequential { first, second } => {
                if *first == from {
                    Some(first)
                } else if *second == from {
                    Some(second)
                } else {
                    None
                }
            }
            BlockKind::Conditional { true_branch, .. } if *true_branch == from => {
                Some(true_branch)
            }
            BlockKind::IfThenElse {
                then_branch,
                else_branch,
                ..
            } => {
                if *then_branch == from {
                    Some(then_branch)
                } else if *else_branch == Some(from) {
                    else_branch.as_mut()
                } else {
                    None
                }
            }
            BlockKind::Loop(data) => {
                if data.body == from {
                    Some(&mut data.body)
                } else if data.init == Some(from) {
                    data.init.as_mut()
                } else if data.incr == Some(from) {
                    data.incr.as_mut()
                } else {
                    None
                }
            }
            BlockKind::Switch(data) => data
                .cases
                .iter_mut()
                .find(|c| c.body == from)
                .map(|c| &mut c.body),
            BlockKind::Try { body, handlers } => {
                if *body == from {
                    Some(body)
                } else {
                    handlers.iter_mut().find(|h| **h == from)
                }
            }
            BlockKind::Catch { body, .. }
            | BlockKind::Finally { body }
            | BlockKind::Synchronized { body, .. }
                if *body == from =>
            {
                Some(body)
            }
            _ => None,
        };
        match slot {
            Some(slot) => {
                *slot = to;
                Ok(())
            }
            None => Err(StructureError::consistency(format!(
                "{} is not a child of {}",
                from, parent
            ))),
        }
    }

    /// Transplants `this` into `old`'s position: copies `outer` and flow
    /// membership and updates the parent's child slot, or the flow node's
    /// root pointer if `old` was the root.
    pub fn replace_block(&mut self, this: BlockId, old: BlockId) -> Result<()> {
        let outer = self.block(old).outer;
        let flow = self.block(old).flow;
        self.block_mut(this).outer = outer;
        self.set_flow_recursive(this, flow);
        match outer {
            Some(parent) => self.replace_child(parent, old, this)?,
            None => self.flow_mut(flow).root = this,
        }
        Ok(())
    }

    /// Sets the owning flow node of a whole subtree.
    pub fn set_flow_recursive(&mut self, id: BlockId, flow: FlowId) {
        if self.block(id).flow == flow {
            return;
        }
        self.block_mut(id).flow = flow;
        for child in self.children(id) {
            self.set_flow_recursive(child, flow);
        }
    }

    /// True if `descendant` is `ancestor` or lies below it.
    pub fn block_contains(&self, ancestor: BlockId, mut descendant: BlockId) -> bool {
        loop {
            if descendant == ancestor {
                return true;
            }
            match self.block(descendant).outer {
                Some(outer) => descendant = outer,
                None => return false,
            }
        }
    }

    /// Moves a jump onto `to`.  Moving onto a node that already owns a jump
    /// is a programming error.
    pub fn move_jump(&mut self, to: BlockId, jump: JumpId) -> Result<()> {
        if self.block(to).jump.is_some() {
            return Err(StructureError::consistency(format!(
                "move_jump: {} already owns a jump",
                to
            )));
        }
        let old_owner = self.jumps[jump.0 as usize].from;
        if self.block(old_owner).jump == Some(jump) {
            self.block_mut(old_owner).jump = None;
        }
        self.jumps[jump.0 as usize].from = to;
        self.block_mut(to).jump = Some(jump);
        Ok(())
    }

    /// Swaps the jumps of two blocks.
    pub fn swap_jump(&mut self, a: BlockId, b: BlockId) {
        let ja = self.block(a).jump;
        let jb = self.block(b).jump;
        self.block_mut(a).jump = jb;
        self.block_mut(b).jump = ja;
        if let Some(j) = ja {
            self.jumps[j.0 as usize].from = b;
        }
        if let Some(j) = jb {
            self.jumps[j.0 as usize].from = a;
        }
    }

    /// Copies `jump` onto `to`, registering the copy in the successor map.
    pub fn copy_jump(&mut self, to: BlockId, jump: JumpId) -> Result<JumpId> {
        if self.block(to).jump.is_some() {
            return Err(StructureError::consistency(format!(
                "copy_jump: {} already owns a jump",
                to
            )));
        }
        let src = &self.jumps[jump.0 as usize];
        let dest = src.destination;
        let gen = src.gen.clone();
        let kill = src.kill.clone();
        let copy = self.new_jump(dest, to, gen, kill);
        self.block_mut(to).jump = Some(copy);
        let flow = self.block(to).flow;
        self.add_successor(flow, copy);
        Ok(copy)
    }

    /// Detaches a block's jump without touching the successor map; used
    /// while the jump list is already removed from the map.
    pub fn detach_jump(&mut self, id: BlockId) -> Option<JumpId> {
        self.block_mut(id).jump.take()
    }

    /// Gives `id` a fresh jump to `dest` (the jump is not added to the
    /// successor map; it belongs to the resolution worklist).
    pub fn set_pending_jump(&mut self, id: BlockId, dest: Destination) -> Result<JumpId> {
        if self.block(id).jump.is_some() {
            return Err(StructureError::consistency(format!(
                "set_pending_jump: {} already owns a jump",
                id
            )));
        }
        let jump = self.new_jump(dest, id, VariableSet::new(), VariableSet::new());
        self.block_mut(id).jump = Some(jump);
        Ok(jump)
    }

    /// Appends `next` after `this`.  An empty `next` only contributes its
    /// jump, an empty jump-free `this` is replaced by `next` outright, and
    /// otherwise the two are wrapped in a new `Sequential`.
    /// Returns the block that now occupies `this`'s position.
    pub fn append_block(&mut self, this: BlockId, next: BlockId) -> Result<BlockId> {
        if self.block(next).is_empty_kind() {
            if let Some(jump) = self.block(next).jump {
                self.move_jump(this, jump)?;
            }
            return Ok(this);
        }
        if self.block(this).is_empty_kind() && self.block(this).jump.is_none() {
            self.replace_block(next, this)?;
            return Ok(next);
        }
        let flow = self.block(this).flow;
        let seq = self.new_block(
            flow,
            BlockKind::Sequential {
                first: this,
                second: next,
            },
        );
        self.replace_block(seq, this)?;
        self.block_mut(this).outer = Some(seq);
        self.block_mut(next).outer = Some(seq);
        self.set_flow_recursive(next, flow);
        Ok(seq)
    }

    /// Removes a block from the tree: a `Sequential` child is replaced by
    /// its sibling, anything else by an `Empty` that inherits the jump.
    pub fn remove_block(&mut self, id: BlockId) -> Result<()> {
        let outer = self.block(id).outer;
        if let Some(parent) = outer {
            if let BlockKind::Sequential { first, second } = self.block(parent).kind {
                if second == id {
                    if let Some(jump) = self.detach_jump(id) {
                        self.move_jump(first, jump)?;
                    }
                    self.replace_block(first, parent)?;
                } else {
                    self.replace_block(second, parent)?;
                }
                return Ok(());
            }
        }
        let flow = self.block(id).flow;
        let empty = self.new_block(flow, BlockKind::Empty);
        if let Some(jump) = self.detach_jump(id) {
            self.move_jump(empty, jump)?;
        }
        self.replace_block(empty, id)?;
        Ok(())
    }

    /// The flow destination control reaches when it falls off the end of
    /// this block, ignoring the block's own jump.  `None` means control
    /// stays inside structured code (or loops).
    pub fn natural_next_destination(&self, mut child: BlockId) -> Option<Destination> {
        while let Some(parent) = self.block(child).outer {
            let pb = self.block(parent);
            match &pb.kind {
                BlockKind::Sequential { first, .. } if child == *first => return None,
                BlockKind::Loop(_) => return None,
                BlockKind::Switch(data) => {
                    let last = data.cases.last().map(|c| c.body);
                    if last != Some(child) {
                        return None;
                    }
                }
                _ => {}
            }
            if let Some(j) = pb.jump {
                return Some(self.jump(j).destination);
            }
            child = parent;
        }
        None
    }

    /// The flow destination control reaches after this block: the block's
    /// own jump, or the natural fall-through.
    pub fn next_destination(&self, id: BlockId) -> Option<Destination> {
        if let Some(j) = self.block(id).jump {
            return Some(self.jump(j).destination);
        }
        self.natural_next_destination(id)
    }

    /// Whether a jump may still be attached to this block: true only for a
    /// breakable block that neither carries a condition nor has been broken
    /// out of yet.
    pub fn jump_may_be_changed(&self, id: BlockId) -> bool {
        match &self.block(id).kind {
            BlockKind::Loop(data) => {
                data.may_change_jump && matches!(data.cond, Expr::Bool(true))
            }
            BlockKind::Switch(data) => data.may_change_jump,
            _ => false,
        }
    }

    /// Marks a breakable block as the target of a break.
    pub fn set_breaked(&mut self, id: BlockId) {
        match &mut self.block_mut(id).kind {
            BlockKind::Loop(data) => data.may_change_jump = false,
            BlockKind::Switch(data) => data.may_change_jump = false,
            _ => {}
        }
    }

    /// Accumulates the locals this subtree may read before writing into
    /// `in_vars` and the locals it writes into `gen_vars`.
    pub fn fill_in_gen(&self, id: BlockId, in_vars: &mut VariableSet, gen_vars: &mut VariableSet) {
        self.fill_in_gen_inner(id, in_vars, gen_vars, &mut VariableSet::new());
    }

    fn fill_in_gen_inner(
        &self,
        id: BlockId,
        in_vars: &mut VariableSet,
        gen_vars: &mut VariableSet,
        written: &mut VariableSet,
    ) {
        let mut reads = VariableSet::new();
        let mut writes = VariableSet::new();
        match &self.block(id).kind {
            BlockKind::Instruction { expr, .. } | BlockKind::Throw { value: expr, .. } => {
                expr.fill_reads_writes(&mut reads, &mut writes);
            }
            BlockKind::Conditional { cond, .. } | BlockKind::IfThenElse { cond, .. } => {
                cond.fill_reads_writes(&mut reads, &mut writes);
            }
            BlockKind::Loop(data) => {
                data.cond.fill_reads_writes(&mut reads, &mut writes);
            }
            BlockKind::Switch(data) => {
                data.selector.fill_reads_writes(&mut reads, &mut writes);
            }
            BlockKind::Return { value: Some(expr), .. } => {
                expr.fill_reads_writes(&mut reads, &mut writes);
            }
            BlockKind::Synchronized {
                monitor: Some(expr),
                ..
            } => {
                expr.fill_reads_writes(&mut reads, &mut writes);
            }
            _ => {}
        }
        for local in reads.iter() {
            if !written.contains(local) {
                in_vars.insert(local);
            }
        }
        gen_vars.union_with(&writes);
        written.union_with(&writes);
        for child in self.children(id) {
            self.fill_in_gen_inner(child, in_vars, gen_vars, written);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowGraph;
    use crate::variables::LocalId;

    fn empty_graph() -> (FlowGraph, FlowId, BlockId) {
        let mut g = FlowGraph::new(false);
        let root = g.new_block_floating(BlockKind::Empty);
        let flow = g.new_flow(0, 1, root);
        (g, flow, root)
    }

    #[test]
    fn test_append_empty_moves_jump() {
        let (mut g, flow, root) = empty_graph();
        let other = g.new_block(flow, BlockKind::Empty);
        let jump = g.set_pending_jump(other, Destination::EndOfMethod).unwrap();
        let combined = g.append_block(root, other).unwrap();
        assert_eq!(combined, root);
        assert_eq!(g.block(root).jump, Some(jump));
        assert_eq!(g.jump(jump).from, root);
    }

    #[test]
    fn test_append_wraps_in_sequential() {
        let mut g = FlowGraph::new(false);
        let first = g.new_block_floating(BlockKind::Instruction {
            addr: 0,
            expr: Expr::store(LocalId(0), Expr::Const(1)),
        });
        let flow = g.new_flow(0, 2, first);
        let second = g.new_block(
            flow,
            BlockKind::Instruction {
                addr: 1,
                expr: Expr::store(LocalId(1), Expr::Const(2)),
            },
        );
        let seq = g.append_block(first, second).unwrap();
        assert!(matches!(
            g.block(seq).kind,
            BlockKind::Sequential { first: f, second: s } if f == first && s == second
        ));
        assert_eq!(g.block(first).outer, Some(seq));
        assert_eq!(g.block(second).outer, Some(seq));
        assert_eq!(g.flow(flow).root, seq);
    }

    #[test]
    fn test_append_onto_empty_replaces() {
        let (mut g, flow, root) = empty_graph();
        let instr = g.new_block(
            flow,
            BlockKind::Instruction {
                addr: 1,
                expr: Expr::store(LocalId(0), Expr::Const(1)),
            },
        );
        let got = g.append_block(root, instr).unwrap();
        assert_eq!(got, instr);
        assert_eq!(g.flow(flow).root, instr);
        assert_eq!(g.block(instr).outer, None);
    }

    #[test]
    fn test_move_jump_rejects_double_ownership() {
        let (mut g, flow, root) = empty_graph();
        let a = g.new_block(flow, BlockKind::Empty);
        let j = g.set_pending_jump(a, Destination::EndOfMethod).unwrap();
        g.set_pending_jump(root, Destination::EndOfMethod).unwrap();
        assert!(g.move_jump(root, j).is_err());
    }

    #[test]
    fn test_remove_sequential_child_promotes_sibling() {
        let mut g = FlowGraph::new(false);
        let a = g.new_block_floating(BlockKind::Instruction {
            addr: 0,
            expr: Expr::store(LocalId(0), Expr::Const(1)),
        });
        let flow = g.new_flow(0, 2, a);
        let b = g.new_block(
            flow,
            BlockKind::Instruction {
                addr: 1,
                expr: Expr::store(LocalId(1), Expr::Const(2)),
            },
        );
        let seq = g.append_block(a, b).unwrap();
        assert_eq!(g.flow(flow).root, seq);
        g.remove_block(b).unwrap();
        assert_eq!(g.flow(flow).root, a);
        assert_eq!(g.block(a).outer, None);
    }

    #[test]
    fn test_fill_in_gen_orders_reads_and_writes() {
        let (mut g, flow, _) = empty_graph();
        // v0 = v1; use of v0 afterwards is not an "in".
        let first = g.new_block(
            flow,
            BlockKind::Instruction {
                addr: 0,
                expr: Expr::store(LocalId(0), Expr::load(LocalId(1))),
            },
        );
        let second = g.new_block(
            flow,
            BlockKind::Instruction {
                addr: 1,
                expr: Expr::store(LocalId(2), Expr::load(LocalId(0))),
            },
        );
        let seq = g.append_block(first, second).unwrap();
        let mut in_vars = VariableSet::new();
        let mut gen_vars = VariableSet::new();
        g.fill_in_gen(seq, &mut in_vars, &mut gen_vars);
        assert!(in_vars.contains(LocalId(1)));
        assert!(!in_vars.contains(LocalId(0)));
        assert!(gen_vars.contains(LocalId(0)));
        assert!(gen_vars.contains(LocalId(2)));
    }
}
