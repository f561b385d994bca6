// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Installation of exception handlers.
//!
//! Each guarded range from the handler table is reduced to a single flow
//! node and wrapped in a `Try` with one `Catch` (or `Finally`) child per
//! table row; the compiler-generated monitor cleanup shape is recognized
//! and folded into a `Synchronized` node instead.  Runs before the main
//! reduction so that the structurer only ever sees the wrapped nodes.

use itertools::Itertools;
use log::debug;

use crate::block::{BlockId, BlockKind};
use crate::error::{Result, StructureError};
use crate::expr::Expr;
use crate::flow::{Destination, FlowId};
use crate::instr::{Addr, HandlerEntry};
use crate::structurer::Structurer;

impl<'a> Structurer<'a> {
    /// Wraps every guarded address range in the matching handler construct.
    /// Ranges are processed innermost first so nested guards structure
    /// correctly.
    pub fn install_handlers(&mut self, handlers: &[HandlerEntry]) -> Result<()> {
        if handlers.is_empty() {
            return Ok(());
        }
        for h in handlers {
            if h.end <= h.start {
                return Err(StructureError::consistency(format!(
                    "empty handler range [{}, {})",
                    h.start, h.end
                )));
            }
        }
        let ordered: Vec<((Addr, Addr), Vec<&HandlerEntry>)> = handlers
            .iter()
            .map(|h| ((h.start, h.end), h))
            .into_group_map()
            .into_iter()
            .sorted_by_key(|((start, end), _)| (end - start, *start))
            .collect();

        for ((start, end), entries) in ordered {
            self.install_group(start, end, &entries)?;
        }
        Ok(())
    }

    fn install_group(&mut self, start: Addr, end: Addr, entries: &[&HandlerEntry]) -> Result<()> {
        let try_flow = self.graph.flow_at_addr(start).ok_or_else(|| {
            StructureError::consistency(format!(
                "guarded range starts inside merged code at {}",
                start
            ))
        })?;
        while self.analyze(try_flow, start, end)? {}
        if self.graph.flow(try_flow).addr != start {
            return Err(StructureError::consistency(format!(
                "guarded range [{}, {}) did not reduce to one node",
                start, end
            )));
        }

        let mut catch_flows: Vec<(FlowId, &HandlerEntry)> = Vec::new();
        for e in entries {
            let catch_flow = self.graph.flow_at_addr(e.handler).ok_or_else(|| {
                StructureError::consistency(format!(
                    "handler entry inside merged code at {}",
                    e.handler
                ))
            })?;
            while self.analyze(catch_flow, e.handler, Addr::MAX)? {}
            catch_flows.push((catch_flow, e));
        }

        let body = self.graph.flow(try_flow).root;
        if let [(cleanup_flow, entry)] = catch_flows[..] {
            if entry.exception.is_none() && self.is_monitor_cleanup(cleanup_flow) {
                return self.install_synchronized(try_flow, body, cleanup_flow);
            }
        }

        let try_block = self.graph.new_block(
            try_flow,
            BlockKind::Try {
                body,
                handlers: Vec::new(),
            },
        );
        self.graph.replace_block(try_block, body)?;
        self.graph.block_mut(body).outer = Some(try_block);

        for (catch_flow, e) in catch_flows {
            let catch_root = self.graph.flow(catch_flow).root;
            let wrapper_kind = match &e.exception {
                Some(exception) => BlockKind::Catch {
                    exception: Some(exception.clone()),
                    body: catch_root,
                },
                None => BlockKind::Finally { body: catch_root },
            };
            let wrapper = self.graph.new_block(try_flow, wrapper_kind);
            self.graph.set_flow_recursive(catch_root, try_flow);
            self.graph.block_mut(catch_root).outer = Some(wrapper);
            self.graph.block_mut(wrapper).outer = Some(try_block);
            if let BlockKind::Try { handlers, .. } = &mut self.graph.block_mut(try_block).kind {
                handlers.push(wrapper);
            }
            // the handler's live-range and edges now belong to the try node
            let catch_in = self.graph.flow(catch_flow).in_vars.clone();
            let catch_gen = self.graph.flow(catch_flow).gen_vars.clone();
            self.graph.flow_mut(try_flow).in_vars.union_with(&catch_in);
            self.graph
                .flow_mut(try_flow)
                .gen_vars
                .union_with(&catch_gen);
            self.graph.merge_successors(try_flow, catch_flow);
            self.graph.merge_addr(try_flow, catch_flow);
        }
        self.graph.flow_mut(try_flow).last_modified = try_block;
        self.graph.check_consistent(try_flow)?;
        debug!("installed handler construct for [{}, {})", start, end);
        Ok(())
    }

    /// The `catch(any) { monitorexit; throw }` shape compilers emit for
    /// synchronized regions: nothing but the unlock call and the rethrow.
    fn is_monitor_cleanup(&self, flow: FlowId) -> bool {
        let mut saw_exit = false;
        let mut saw_throw = false;
        for b in self.graph.tree_blocks(flow) {
            match &self.graph.block(b).kind {
                BlockKind::Instruction { expr, .. } => match expr {
                    Expr::Call { name, .. } if name == "monitorexit" => saw_exit = true,
                    _ => return false,
                },
                BlockKind::Throw { .. } => saw_throw = true,
                BlockKind::Sequential { .. } | BlockKind::Empty => {}
                _ => return false,
            }
        }
        saw_exit && saw_throw
    }

    fn install_synchronized(
        &mut self,
        try_flow: FlowId,
        body: BlockId,
        cleanup_flow: FlowId,
    ) -> Result<()> {
        // drop the cleanup handler entirely; its only job was the unlock
        let dests: Vec<Destination> = self
            .graph
            .flow(cleanup_flow)
            .successors
            .keys()
            .copied()
            .collect();
        for dest in dests {
            for j in self.graph.take_successor_jumps(cleanup_flow, dest) {
                let owner = self.graph.jump(j).from;
                self.graph.detach_jump(owner);
            }
        }
        self.graph.flow_mut(cleanup_flow).predecessors.clear();

        let sync_block = self.graph.new_block(
            try_flow,
            BlockKind::Synchronized {
                monitor: None,
                body,
            },
        );
        self.graph.replace_block(sync_block, body)?;
        self.graph.block_mut(body).outer = Some(sync_block);
        self.extract_monitor_enter(sync_block, body)?;
        // the matching unlock at the end of the protected code is implied
        // by the construct
        self.strip_trailing_monitor_exit(sync_block)?;

        self.graph.merge_addr(try_flow, cleanup_flow);
        self.graph.flow_mut(try_flow).last_modified = sync_block;
        self.graph.check_consistent(try_flow)?;
        Ok(())
    }

    /// Pulls a leading `monitorenter(obj)` out of the protected body and
    /// binds `obj` as the monitor expression.
    fn extract_monitor_enter(&mut self, sync_block: BlockId, body: BlockId) -> Result<()> {
        let first_instr = match self.graph.block(body).kind {
            BlockKind::Sequential { first, .. } => first,
            _ => body,
        };
        let monitor = match &self.graph.block(first_instr).kind {
            BlockKind::Instruction { expr, .. } => match expr {
                Expr::Call { name, args, .. } if name == "monitorenter" && args.len() == 1 => {
                    Some(args[0].clone())
                }
                _ => None,
            },
            _ => None,
        };
        let Some(monitor) = monitor else {
            return Ok(());
        };
        self.graph.remove_block(first_instr)?;
        if let BlockKind::Synchronized { monitor: slot, .. } =
            &mut self.graph.block_mut(sync_block).kind
        {
            *slot = Some(monitor);
        }
        Ok(())
    }

    /// Removes the normal-path `monitorexit` at the end of the body.
    fn strip_trailing_monitor_exit(&mut self, sync_block: BlockId) -> Result<()> {
        let exits: Vec<BlockId> = self
            .graph
            .tree_blocks(self.graph.block(sync_block).flow)
            .into_iter()
            .filter(|b| {
                self.graph.block_contains(sync_block, *b)
                    && matches!(
                        &self.graph.block(*b).kind,
                        BlockKind::Instruction { expr: Expr::Call { name, .. }, .. }
                            if name == "monitorexit"
                    )
            })
            .collect();
        for b in exits {
            self.graph.remove_block(b)?;
        }
        Ok(())
    }
}
