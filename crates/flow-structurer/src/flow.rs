// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Flow nodes and the graph arena.
//!
//! A [`Flow`] is one node of the reduction graph: a contiguous address range
//! with a tree of control nodes inside and explicit jump edges out.  The
//! whole graph lives in a single [`FlowGraph`] that owns three arenas
//! (blocks, flows, jumps); structural mutation goes through methods here so
//! that the successor map and the predecessor lists stay symmetric.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::block::{Block, BlockId, BlockKind};
use crate::error::{Result, StructureError};
use crate::instr::Addr;
use crate::variables::VariableSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowId(pub(crate) u32);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JumpId(pub(crate) u32);

/// Where a jump transfers control to.  Kept closed so every consumer has to
/// handle the end-of-method and dead cases explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Destination {
    Flow(FlowId),
    /// Falls off the end of the method (an implicit return).
    EndOfMethod,
    /// Points into code removed as unreachable.
    Dead,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Flow(id) => write!(f, "{}", id),
            Destination::EndOfMethod => write!(f, "end"),
            Destination::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Predecessor {
    /// The method entry reaches this flow node directly.
    Entry,
    Flow(FlowId),
}

/// One outgoing edge.  Carries the per-edge live-range approximation: `gen`
/// is what may have been assigned on some path to this jump, `kill` what is
/// definitely assigned on every path.
#[derive(Clone, Debug)]
pub struct Jump {
    pub destination: Destination,
    pub from: BlockId,
    pub gen: VariableSet,
    pub kill: VariableSet,
}

#[derive(Clone, Debug)]
pub struct Flow {
    /// Start address of the range this node currently covers.
    pub addr: Addr,
    pub length: u32,
    pub root: BlockId,
    /// The most recently appended block; new successors are always stitched
    /// on behind it.
    pub last_modified: BlockId,
    /// Locals that may be read before being written inside this node.
    pub in_vars: VariableSet,
    /// Locals assigned somewhere inside this node.
    pub gen_vars: VariableSet,
    pub successors: BTreeMap<Destination, Vec<JumpId>>,
    pub predecessors: Vec<Predecessor>,
    pub prev_by_addr: Option<FlowId>,
    pub next_by_addr: Option<FlowId>,
    pub reachable: bool,
    /// False once this node has been merged into another.
    pub live: bool,
}

pub struct FlowGraph {
    pub(crate) blocks: Vec<Block>,
    pub(crate) flows: Vec<Flow>,
    pub(crate) jumps: Vec<Jump>,
    pub(crate) entry: FlowId,
    check_consistency: bool,
}

/// Placeholder flow id for blocks created before their flow node exists.
const UNATTACHED: FlowId = FlowId(u32::MAX);

impl FlowGraph {
    pub fn new(check_consistency: bool) -> Self {
        FlowGraph {
            blocks: Vec::new(),
            flows: Vec::new(),
            jumps: Vec::new(),
            entry: FlowId(0),
            check_consistency,
        }
    }

    pub fn entry(&self) -> FlowId {
        self.entry
    }

    pub fn flow(&self, id: FlowId) -> &Flow {
        &self.flows[id.0 as usize]
    }

    pub fn flow_mut(&mut self, id: FlowId) -> &mut Flow {
        &mut self.flows[id.0 as usize]
    }

    pub fn jump(&self, id: JumpId) -> &Jump {
        &self.jumps[id.0 as usize]
    }

    pub fn jump_mut(&mut self, id: JumpId) -> &mut Jump {
        &mut self.jumps[id.0 as usize]
    }

    pub fn flow_ids(&self) -> impl Iterator<Item = FlowId> {
        (0..self.flows.len() as u32).map(FlowId)
    }

    pub fn live_flows(&self) -> impl Iterator<Item = FlowId> + '_ {
        self.flow_ids().filter(|id| self.flow(*id).live)
    }

    /// Creates a block before its flow node exists; `new_flow` adopts it.
    pub fn new_block_floating(&mut self, kind: BlockKind) -> BlockId {
        self.new_block(UNATTACHED, kind)
    }

    pub fn new_flow(&mut self, addr: Addr, length: u32, root: BlockId) -> FlowId {
        let id = FlowId(self.flows.len() as u32);
        let mut in_vars = VariableSet::new();
        let mut gen_vars = VariableSet::new();
        self.fill_in_gen(root, &mut in_vars, &mut gen_vars);
        self.flows.push(Flow {
            addr,
            length,
            root,
            last_modified: root,
            in_vars,
            gen_vars,
            successors: BTreeMap::new(),
            predecessors: Vec::new(),
            prev_by_addr: None,
            next_by_addr: None,
            reachable: false,
            live: true,
        });
        self.set_flow_recursive(root, id);
        id
    }

    /// Creates a jump edge; the caller registers it with `add_successor` or
    /// keeps it on a resolution worklist.
    pub fn new_jump(
        &mut self,
        destination: Destination,
        from: BlockId,
        gen: VariableSet,
        kill: VariableSet,
    ) -> JumpId {
        let id = JumpId(self.jumps.len() as u32);
        self.jumps.push(Jump {
            destination,
            from,
            gen,
            kill,
        });
        id
    }

    fn remove_predecessor(&mut self, of: FlowId, pred: Predecessor) {
        let preds = &mut self.flows[of.0 as usize].predecessors;
        if let Some(pos) = preds.iter().position(|p| *p == pred) {
            preds.remove(pos);
        }
    }

    fn add_predecessor(&mut self, of: FlowId, pred: Predecessor) {
        let preds = &mut self.flows[of.0 as usize].predecessors;
        if !preds.contains(&pred) {
            preds.push(pred);
        }
    }

    /// Registers a jump in its owning flow's successor map, maintaining the
    /// destination's predecessor list.
    pub fn add_successor(&mut self, from: FlowId, jump: JumpId) {
        let dest = self.jump(jump).destination;
        let entry = self.flows[from.0 as usize]
            .successors
            .entry(dest)
            .or_default();
        let first = entry.is_empty();
        entry.push(jump);
        if first {
            if let Destination::Flow(d) = dest {
                self.add_predecessor(d, Predecessor::Flow(from));
            }
        }
    }

    /// Unregisters a jump from its owning flow's successor map.
    pub fn remove_successor(&mut self, from: FlowId, jump: JumpId) -> Result<()> {
        let dest = self.jump(jump).destination;
        let entry = self.flows[from.0 as usize]
            .successors
            .get_mut(&dest)
            .ok_or_else(|| {
                StructureError::consistency(format!("no successor entry {} -> {}", from, dest))
            })?;
        let pos = entry.iter().position(|j| *j == jump).ok_or_else(|| {
            StructureError::consistency(format!("jump missing from {} -> {}", from, dest))
        })?;
        entry.remove(pos);
        if entry.is_empty() {
            self.flows[from.0 as usize].successors.remove(&dest);
            if let Destination::Flow(d) = dest {
                self.remove_predecessor(d, Predecessor::Flow(from));
            }
        }
        Ok(())
    }

    /// Detaches the whole jump list towards `dest` from the successor map.
    /// The jumps stay alive; they now belong to the caller's worklist.
    pub fn take_successor_jumps(&mut self, from: FlowId, dest: Destination) -> Vec<JumpId> {
        let jumps = self.flows[from.0 as usize]
            .successors
            .remove(&dest)
            .unwrap_or_default();
        if !jumps.is_empty() {
            if let Destination::Flow(d) = dest {
                self.remove_predecessor(d, Predecessor::Flow(from));
            }
        }
        jumps
    }

    /// Moves every remaining successor edge of `succ` onto `this`, rewriting
    /// the destinations' predecessor lists.  Jumps from `succ` back to
    /// `this` become self-edges of the merged node.
    pub fn merge_successors(&mut self, this: FlowId, succ: FlowId) {
        let moved = std::mem::take(&mut self.flows[succ.0 as usize].successors);
        for (dest, jumps) in moved {
            if let Destination::Flow(d) = dest {
                self.remove_predecessor(d, Predecessor::Flow(succ));
            }
            let entry = self.flows[this.0 as usize]
                .successors
                .entry(dest)
                .or_default();
            let first = entry.is_empty();
            entry.extend(jumps);
            if first {
                if let Destination::Flow(d) = dest {
                    self.add_predecessor(d, Predecessor::Flow(this));
                }
            }
        }
    }

    /// Retargets every jump of `from` aimed at `old` so that it aims at
    /// `new` instead, merging the jump lists in the successor map.
    pub fn retarget_successor(&mut self, from: FlowId, old: Destination, new: Destination) {
        let jumps = self.take_successor_jumps(from, old);
        for &j in &jumps {
            self.jumps[j.0 as usize].destination = new;
        }
        for j in jumps {
            self.add_successor(from, j);
        }
    }

    /// Absorbs `succ`'s address range into the chain after a merge and
    /// marks it dead.  The range is folded into the following node when the
    /// merged code precedes it, otherwise into the preceding node.
    pub fn merge_addr(&mut self, this: FlowId, succ: FlowId) {
        let prev = self.flow(succ).prev_by_addr;
        let next = self.flow(succ).next_by_addr;
        if next == Some(this) || prev.is_none() {
            let next = next.expect("address chain broken: no node after merged range");
            self.flows[next.0 as usize].addr = self.flow(succ).addr;
            self.flows[next.0 as usize].length += self.flow(succ).length;
            self.flows[next.0 as usize].prev_by_addr = prev;
            if let Some(p) = prev {
                self.flows[p.0 as usize].next_by_addr = Some(next);
            }
        } else {
            let prev = prev.expect("checked above");
            self.flows[prev.0 as usize].length += self.flow(succ).length;
            self.flows[prev.0 as usize].next_by_addr = next;
            if let Some(n) = next {
                self.flows[n.0 as usize].prev_by_addr = Some(prev);
            }
        }
        let sf = &mut self.flows[succ.0 as usize];
        sf.prev_by_addr = None;
        sf.next_by_addr = None;
        sf.live = false;
        debug!("merged address range of {} into {}", succ, this);
    }

    /// The address right after this flow node's current range.
    pub fn next_addr(&self, id: FlowId) -> Addr {
        let f = self.flow(id);
        f.addr + f.length
    }

    /// The live successor with the smallest start address within
    /// `[start, end)`, excluding `this` itself.
    pub fn get_successor(&self, this: FlowId, start: Addr, end: Addr) -> Option<FlowId> {
        let mut best: Option<FlowId> = None;
        for dest in self.flow(this).successors.keys() {
            let Destination::Flow(d) = *dest else { continue };
            if d == this || !self.flow(d).live {
                continue;
            }
            let addr = self.flow(d).addr;
            if addr < start || addr >= end {
                continue;
            }
            match best {
                Some(b) if self.flow(b).addr <= addr => {}
                _ => best = Some(d),
            }
        }
        best
    }

    /// Updates the live-range approximation when the jumps in `jumps`
    /// (all aimed at `succ`) are about to be resolved into `this`.
    pub fn update_in_out(&mut self, this: FlowId, succ: FlowId, jumps: &[JumpId]) {
        let mut gens = VariableSet::new();
        let mut kills: Option<VariableSet> = None;
        for &j in jumps {
            let jump = self.jump(j);
            gens.union_with(&jump.gen);
            kills = Some(match kills {
                None => jump.kill.clone(),
                Some(mut k) => {
                    k.intersect_with(&jump.kill);
                    k
                }
            });
        }
        let kills = kills.unwrap_or_default();
        // Everything killed on all paths is definitely assigned before the
        // successor runs, so it is no longer an "in" of the merged node.
        if succ != this {
            self.flows[succ.0 as usize].in_vars.subtract(&kills);
        }
        let succ_jumps: Vec<JumpId> = self.flows[succ.0 as usize]
            .successors
            .values()
            .flatten()
            .copied()
            .collect();
        for j in succ_jumps {
            let jump = &mut self.jumps[j.0 as usize];
            let jump_kill = jump.kill.clone();
            jump.gen.union_minus(&gens, &jump_kill);
            jump.kill.union_with(&kills);
        }
        let succ_in = self.flows[succ.0 as usize].in_vars.clone();
        let succ_gen = self.flows[succ.0 as usize].gen_vars.clone();
        let tf = &mut self.flows[this.0 as usize];
        tf.in_vars.union_with(&succ_in);
        tf.gen_vars.union_with(&succ_gen);
        debug!(
            "updated in/out of {}: in {} gen {}",
            this,
            self.flow(this).in_vars,
            self.flow(this).gen_vars
        );
    }

    /// Collects every block in a flow node's tree, preorder.
    pub fn tree_blocks(&self, flow: FlowId) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut stack = vec![self.flow(flow).root];
        while let Some(b) = stack.pop() {
            out.push(b);
            let mut kids = self.children(b);
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    /// Structural self-check of one flow node: tree linkage, flow
    /// membership, jump ownership, and successor/predecessor symmetry.
    /// A no-op unless consistency checking was requested.
    pub fn check_consistent(&self, flow: FlowId) -> Result<()> {
        if !self.check_consistency {
            return Ok(());
        }
        let f = self.flow(flow);
        if self.block(f.root).outer.is_some() {
            return Err(StructureError::consistency(format!(
                "root of {} has a parent",
                flow
            )));
        }
        let blocks = self.tree_blocks(flow);
        for &b in &blocks {
            let block = self.block(b);
            if block.flow != flow {
                return Err(StructureError::consistency(format!(
                    "{} in tree of {} belongs to {}",
                    b, flow, block.flow
                )));
            }
            for child in self.children(b) {
                if self.block(child).outer != Some(b) {
                    return Err(StructureError::consistency(format!(
                        "child {} of {} has wrong parent link",
                        child, b
                    )));
                }
            }
            if let Some(j) = block.jump {
                if self.jump(j).from != b {
                    return Err(StructureError::consistency(format!(
                        "jump of {} does not point back at it",
                        b
                    )));
                }
            }
        }
        for (dest, jumps) in &f.successors {
            if jumps.is_empty() {
                return Err(StructureError::consistency(format!(
                    "empty successor entry {} -> {}",
                    flow, dest
                )));
            }
            for &j in jumps {
                let owner = self.jump(j).from;
                if self.block(owner).flow != flow || self.block(owner).jump != Some(j) {
                    return Err(StructureError::consistency(format!(
                        "successor jump {} -> {} not owned by a block of {}",
                        flow, dest, flow
                    )));
                }
            }
            if let Destination::Flow(d) = dest {
                if !self
                    .flow(*d)
                    .predecessors
                    .contains(&Predecessor::Flow(flow))
                {
                    return Err(StructureError::consistency(format!(
                        "{} missing from predecessor list of {}",
                        flow, d
                    )));
                }
            }
        }
        Ok(())
    }
}
