// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Construction of the initial flow graph.
//!
//! Every decoded instruction becomes one flow node whose tree holds a single
//! control node; explicit jumps (including fall-throughs) connect the nodes.
//! The reduction pass then merges straight-line code back together, so the
//! builder does not try to form basic blocks itself.

use std::collections::{BTreeMap, VecDeque};

use log::debug;

use crate::block::{BlockId, BlockKind, SwitchCase, SwitchData};
use crate::error::{Result, StructureError};
use crate::flow::{Destination, FlowGraph, FlowId, Predecessor};
use crate::instr::{Addr, HandlerEntry, InstrOp, Instruction, END_ADDR};
use crate::variables::VariableSet;

/// A jump recorded during block construction, before targets can be
/// resolved to flow nodes.
struct PendingJump {
    flow: FlowId,
    owner: BlockId,
    target: i64,
    writes: VariableSet,
}

/// Builds the initial graph from a decoded instruction list.  Instructions
/// must be sorted by address and contiguous.  Handler entry points count as
/// roots for reachability.
pub fn build_graph(
    instrs: &[Instruction],
    handlers: &[HandlerEntry],
    check_consistency: bool,
) -> Result<FlowGraph> {
    if instrs.is_empty() {
        return Err(StructureError::consistency("empty instruction list"));
    }
    let mut graph = FlowGraph::new(check_consistency);
    let mut addr_to_flow: BTreeMap<Addr, FlowId> = BTreeMap::new();
    let mut pending: Vec<PendingJump> = Vec::new();
    let mut prev: Option<FlowId> = None;
    let mut expected_addr = instrs[0].addr;
    for ins in instrs {
        if ins.addr != expected_addr {
            return Err(StructureError::consistency(format!(
                "instruction list not contiguous at address {}",
                ins.addr
            )));
        }
        expected_addr = ins.next_addr();
        let flow = build_instruction(&mut graph, ins, &mut pending)?;
        addr_to_flow.insert(ins.addr, flow);
        if let Some(p) = prev {
            graph.flow_mut(p).next_by_addr = Some(flow);
            graph.flow_mut(flow).prev_by_addr = Some(p);
        }
        prev = Some(flow);
    }
    let code_end = i64::from(instrs.last().expect("checked non-empty").next_addr());

    for p in pending {
        let dest = if p.target == END_ADDR {
            Destination::EndOfMethod
        } else if p.target == code_end {
            // jumping past the last instruction is never reachable in
            // well-formed input; keep the edge but mark it dead
            Destination::Dead
        } else {
            let target = Addr::try_from(p.target).ok();
            match target.and_then(|t| addr_to_flow.get(&t)) {
                Some(f) => Destination::Flow(*f),
                None => {
                    return Err(StructureError::consistency(format!(
                        "jump target {} is not an instruction boundary",
                        p.target
                    )))
                }
            }
        };
        let jump = graph.new_jump(dest, p.owner, p.writes.clone(), p.writes);
        graph.block_mut(p.owner).jump = Some(jump);
        graph.add_successor(p.flow, jump);
    }

    let entry = addr_to_flow
        .get(&instrs[0].addr)
        .copied()
        .expect("entry flow exists");
    graph.entry = entry;
    graph.flow_mut(entry).predecessors.push(Predecessor::Entry);

    let mut roots = vec![entry];
    for h in handlers {
        match addr_to_flow.get(&h.handler) {
            Some(f) => roots.push(*f),
            None => {
                return Err(StructureError::consistency(format!(
                    "handler entry {} is not an instruction boundary",
                    h.handler
                )))
            }
        }
    }
    graph.mark_reachable(&roots);
    graph.remove_dead_code(code_end as Addr);
    Ok(graph)
}

fn expr_writes(expr: &crate::expr::Expr) -> VariableSet {
    let mut reads = VariableSet::new();
    let mut writes = VariableSet::new();
    expr.fill_reads_writes(&mut reads, &mut writes);
    writes
}

/// Builds the flow node for one instruction and records its outgoing jumps.
fn build_instruction(
    graph: &mut FlowGraph,
    ins: &Instruction,
    pending: &mut Vec<PendingJump>,
) -> Result<FlowId> {
    let next = i64::from(ins.next_addr());
    match &ins.op {
        InstrOp::Eval(expr) => {
            let writes = expr_writes(expr);
            let root = graph.new_block_floating(BlockKind::Instruction {
                addr: ins.addr,
                expr: expr.clone(),
            });
            let flow = graph.new_flow(ins.addr, ins.length, root);
            pending.push(PendingJump {
                flow,
                owner: root,
                target: next,
                writes,
            });
            Ok(flow)
        }
        InstrOp::Goto { target } => {
            let root = graph.new_block_floating(BlockKind::Empty);
            let flow = graph.new_flow(ins.addr, ins.length, root);
            pending.push(PendingJump {
                flow,
                owner: root,
                target: *target,
                writes: VariableSet::new(),
            });
            Ok(flow)
        }
        InstrOp::CondJump { cond, target } => {
            let writes = expr_writes(cond);
            let branch = graph.new_block_floating(BlockKind::Empty);
            let root = graph.new_block_floating(BlockKind::Conditional {
                addr: ins.addr,
                cond: cond.clone(),
                true_branch: branch,
            });
            graph.block_mut(branch).outer = Some(root);
            let flow = graph.new_flow(ins.addr, ins.length, root);
            pending.push(PendingJump {
                flow,
                owner: branch,
                target: *target,
                writes: writes.clone(),
            });
            pending.push(PendingJump {
                flow,
                owner: root,
                target: next,
                writes,
            });
            Ok(flow)
        }
        InstrOp::Switch {
            selector,
            cases,
            default,
        } => {
            let writes = expr_writes(selector);
            // group case values per target and order cases by target address
            let mut by_target: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
            for (value, target) in cases {
                by_target.entry(*target).or_default().push(*value);
            }
            by_target.entry(*default).or_default();
            let mut case_blocks = Vec::with_capacity(by_target.len());
            let mut case_targets = Vec::with_capacity(by_target.len());
            for (target, values) in by_target {
                let body = graph.new_block_floating(BlockKind::Empty);
                case_blocks.push(SwitchCase {
                    is_default: target == *default,
                    values,
                    body,
                    fall_through: false,
                });
                case_targets.push((body, target));
            }
            let root = graph.new_block_floating(BlockKind::Switch(SwitchData {
                selector: selector.clone(),
                addr: ins.addr,
                cases: case_blocks,
                may_change_jump: true,
            }));
            for (body, _) in &case_targets {
                graph.block_mut(*body).outer = Some(root);
            }
            let flow = graph.new_flow(ins.addr, ins.length, root);
            for (body, target) in case_targets {
                pending.push(PendingJump {
                    flow,
                    owner: body,
                    target,
                    writes: writes.clone(),
                });
            }
            Ok(flow)
        }
        InstrOp::Return(value) => {
            let root = graph.new_block_floating(BlockKind::Return {
                addr: ins.addr,
                value: value.clone(),
            });
            let flow = graph.new_flow(ins.addr, ins.length, root);
            pending.push(PendingJump {
                flow,
                owner: root,
                target: END_ADDR,
                writes: VariableSet::new(),
            });
            Ok(flow)
        }
        InstrOp::Throw(value) => {
            let root = graph.new_block_floating(BlockKind::Throw {
                addr: ins.addr,
                value: value.clone(),
            });
            let flow = graph.new_flow(ins.addr, ins.length, root);
            pending.push(PendingJump {
                flow,
                owner: root,
                target: END_ADDR,
                writes: VariableSet::new(),
            });
            Ok(flow)
        }
    }
}

impl FlowGraph {
    /// The live flow node starting exactly at `addr`.
    pub fn flow_at_addr(&self, addr: Addr) -> Option<FlowId> {
        self.live_flows()
            .find(|id| self.flow(*id).addr == addr)
    }

    /// Marks every flow node reachable from the given roots.
    pub fn mark_reachable(&mut self, roots: &[FlowId]) {
        let mut queue: VecDeque<FlowId> = roots.iter().copied().collect();
        while let Some(f) = queue.pop_front() {
            if self.flow(f).reachable {
                continue;
            }
            self.flow_mut(f).reachable = true;
            for dest in self.flow(f).successors.keys() {
                if let Destination::Flow(d) = dest {
                    if !self.flow(*d).reachable {
                        queue.push_back(*d);
                    }
                }
            }
        }
    }

    /// Drops unreachable flow nodes: their edges are unregistered, edges
    /// into them become [`Destination::Dead`], and their address ranges are
    /// folded into the preceding live node so the chain stays contiguous.
    pub fn remove_dead_code(&mut self, code_end: Addr) {
        let dead: Vec<FlowId> = self
            .flow_ids()
            .filter(|id| self.flow(*id).live && !self.flow(*id).reachable)
            .collect();
        if dead.is_empty() {
            return;
        }
        for &d in &dead {
            let dests: Vec<Destination> =
                self.flow(d).successors.keys().copied().collect();
            for dest in dests {
                self.take_successor_jumps(d, dest);
            }
            self.flow_mut(d).live = false;
            self.flow_mut(d).predecessors.clear();
            debug!("removed unreachable code at address {}", self.flow(d).addr);
        }
        for f in self.flow_ids().collect::<Vec<_>>() {
            if !self.flow(f).live {
                continue;
            }
            let dead_dests: Vec<Destination> = self
                .flow(f)
                .successors
                .keys()
                .copied()
                .filter(|dest| {
                    matches!(dest, Destination::Flow(d) if !self.flow(*d).live)
                })
                .collect();
            for dest in dead_dests {
                self.retarget_successor(f, dest, Destination::Dead);
            }
        }
        // rebuild the address chain over live nodes only
        let mut live: Vec<FlowId> = self.live_flows().collect();
        live.sort_by_key(|id| self.flow(*id).addr);
        for (i, &f) in live.iter().enumerate() {
            let prev = if i > 0 { Some(live[i - 1]) } else { None };
            let next = live.get(i + 1).copied();
            let end = next
                .map(|n| self.flow(n).addr)
                .unwrap_or(code_end);
            let flow = self.flow_mut(f);
            flow.prev_by_addr = prev;
            flow.next_by_addr = next;
            flow.length = end - flow.addr;
        }
        for &d in &dead {
            self.flow_mut(d).prev_by_addr = None;
            self.flow_mut(d).next_by_addr = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CmpOp, Expr};
    use crate::variables::LocalId;

    fn eval(addr: Addr, expr: Expr) -> Instruction {
        Instruction {
            addr,
            length: 1,
            op: InstrOp::Eval(expr),
        }
    }

    fn ret(addr: Addr) -> Instruction {
        Instruction {
            addr,
            length: 1,
            op: InstrOp::Return(None),
        }
    }

    #[test]
    fn test_straight_line_graph_shape() {
        let instrs = vec![
            eval(0, Expr::store(LocalId(0), Expr::Const(1))),
            eval(1, Expr::store(LocalId(1), Expr::Const(2))),
            ret(2),
        ];
        let g = build_graph(&instrs, &[], true).unwrap();
        assert_eq!(g.live_flows().count(), 3);
        let entry = g.entry();
        assert_eq!(g.flow(entry).addr, 0);
        assert!(g.flow(entry).predecessors.contains(&Predecessor::Entry));
        let next = g.get_successor(entry, 0, 100).unwrap();
        assert_eq!(g.flow(next).addr, 1);
        for f in g.live_flows() {
            g.check_consistent(f).unwrap();
        }
    }

    #[test]
    fn test_conditional_has_two_edges() {
        let cond = Expr::compare(CmpOp::Lt, Expr::load(LocalId(0)), Expr::Const(10));
        let instrs = vec![
            Instruction {
                addr: 0,
                length: 1,
                op: InstrOp::CondJump { cond, target: 2 },
            },
            ret(1),
            ret(2),
        ];
        let g = build_graph(&instrs, &[], true).unwrap();
        let entry = g.entry();
        assert_eq!(g.flow(entry).successors.len(), 2);
    }

    #[test]
    fn test_unreachable_code_is_removed() {
        let instrs = vec![
            Instruction {
                addr: 0,
                length: 1,
                op: InstrOp::Goto { target: 2 },
            },
            eval(1, Expr::store(LocalId(0), Expr::Const(7))),
            ret(2),
        ];
        let g = build_graph(&instrs, &[], true).unwrap();
        assert_eq!(g.live_flows().count(), 2);
        // the goto's range now extends over the removed instruction
        let entry = g.entry();
        assert_eq!(g.flow(entry).length, 2);
        assert_eq!(g.flow_at_addr(1), None);
    }

    #[test]
    fn test_handler_entry_keeps_code_alive() {
        let instrs = vec![
            Instruction {
                addr: 0,
                length: 1,
                op: InstrOp::Goto { target: 2 },
            },
            ret(1),
            ret(2),
        ];
        let handlers = vec![HandlerEntry {
            start: 0,
            end: 1,
            handler: 1,
            exception: None,
        }];
        let g = build_graph(&instrs, &handlers, true).unwrap();
        assert_eq!(g.live_flows().count(), 3);
    }

    #[test]
    fn test_bad_jump_target_is_rejected() {
        let instrs = vec![Instruction {
            addr: 0,
            length: 2,
            op: InstrOp::Goto { target: 1 },
        }];
        assert!(matches!(
            build_graph(&instrs, &[], true),
            Err(StructureError::Consistency(_))
        ));
    }

    #[test]
    fn test_switch_cases_grouped_and_ordered() {
        let instrs = vec![
            Instruction {
                addr: 0,
                length: 1,
                op: InstrOp::Switch {
                    selector: Expr::load(LocalId(0)),
                    cases: vec![(5, 3), (1, 1), (2, 1)],
                    default: 2,
                },
            },
            ret(1),
            ret(2),
            ret(3),
        ];
        let g = build_graph(&instrs, &[], true).unwrap();
        let entry = g.entry();
        let root = g.flow(entry).root;
        let BlockKind::Switch(data) = &g.block(root).kind else {
            panic!("expected switch root");
        };
        assert_eq!(data.cases.len(), 3);
        assert_eq!(data.cases[0].values, vec![1, 2]);
        assert!(data.cases[1].is_default);
        assert_eq!(data.cases[2].values, vec![5]);
    }
}
