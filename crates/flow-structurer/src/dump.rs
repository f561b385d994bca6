// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Debug output: a source-like dump of a structured tree and a dot
//! rendering of the flow graph while reduction is in progress.

use std::collections::BTreeMap;
use std::fmt;

use petgraph::dot::Dot;
use petgraph::graph::Graph;

use crate::block::{BlockId, BlockKind, LoopKind};
use crate::flow::{Destination, FlowGraph, FlowId};

/// Renders the tree under `root` as indented pseudo-source.
pub fn dump_tree(graph: &FlowGraph, root: BlockId) -> String {
    format!("{}", TreeDump { graph, root })
}

pub struct TreeDump<'a> {
    pub graph: &'a FlowGraph,
    pub root: BlockId,
}

impl fmt::Display for TreeDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dump_block(f, self.graph, self.root, 0)
    }
}

fn pad(f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    write!(f, "{:indent$}", "", indent = indent * 2)
}

fn dump_braced(
    f: &mut fmt::Formatter<'_>,
    graph: &FlowGraph,
    body: BlockId,
    indent: usize,
) -> fmt::Result {
    writeln!(f, "{{")?;
    dump_block(f, graph, body, indent + 1)?;
    pad(f, indent)?;
    write!(f, "}}")
}

fn dump_block(
    f: &mut fmt::Formatter<'_>,
    graph: &FlowGraph,
    b: BlockId,
    indent: usize,
) -> fmt::Result {
    match &graph.block(b).kind {
        BlockKind::Empty => Ok(()),
        BlockKind::Instruction { expr, .. } => {
            pad(f, indent)?;
            writeln!(f, "{};", expr)
        }
        BlockKind::Sequential { first, second } => {
            dump_block(f, graph, *first, indent)?;
            dump_block(f, graph, *second, indent)
        }
        BlockKind::Conditional {
            cond, true_branch, ..
        } => {
            pad(f, indent)?;
            write!(f, "if ({}) ", cond)?;
            dump_braced(f, graph, *true_branch, indent)?;
            writeln!(f)
        }
        BlockKind::IfThenElse {
            cond,
            then_branch,
            else_branch,
        } => {
            pad(f, indent)?;
            write!(f, "if ({}) ", cond)?;
            dump_braced(f, graph, *then_branch, indent)?;
            if let Some(else_branch) = else_branch {
                write!(f, " else ")?;
                dump_braced(f, graph, *else_branch, indent)?;
            }
            writeln!(f)
        }
        BlockKind::Loop(data) => {
            pad(f, indent)?;
            match data.kind {
                LoopKind::DoWhile => {
                    write!(f, "do ")?;
                    dump_braced(f, graph, data.body, indent)?;
                    writeln!(f, " while ({});", data.cond)
                }
                LoopKind::For => {
                    write!(f, "for (")?;
                    if let Some(init) = data.init {
                        write_statement_expr(f, graph, init)?;
                    }
                    write!(f, "; {}; ", data.cond)?;
                    if let Some(incr) = data.incr {
                        write_statement_expr(f, graph, incr)?;
                    }
                    write!(f, ") ")?;
                    dump_braced(f, graph, data.body, indent)?;
                    writeln!(f)
                }
                LoopKind::While | LoopKind::TentativeFor => {
                    write!(f, "while ({}) ", data.cond)?;
                    dump_braced(f, graph, data.body, indent)?;
                    writeln!(f)
                }
            }
        }
        BlockKind::Switch(data) => {
            pad(f, indent)?;
            writeln!(f, "switch ({}) {{", data.selector)?;
            for case in &data.cases {
                pad(f, indent)?;
                if case.is_default {
                    writeln!(f, "default:")?;
                } else {
                    for v in &case.values {
                        writeln!(f, "case {}:", v)?;
                        pad(f, indent)?;
                    }
                    writeln!(f)?;
                }
                dump_block(f, graph, case.body, indent + 1)?;
            }
            pad(f, indent)?;
            writeln!(f, "}}")
        }
        BlockKind::Try { body, handlers } => {
            pad(f, indent)?;
            write!(f, "try ")?;
            dump_braced(f, graph, *body, indent)?;
            for h in handlers {
                match &graph.block(*h).kind {
                    BlockKind::Catch { exception, body } => {
                        match exception {
                            Some(e) => write!(f, " catch ({}) ", e)?,
                            None => write!(f, " catch ")?,
                        }
                        dump_braced(f, graph, *body, indent)?;
                    }
                    BlockKind::Finally { body } => {
                        write!(f, " finally ")?;
                        dump_braced(f, graph, *body, indent)?;
                    }
                    _ => {}
                }
            }
            writeln!(f)
        }
        BlockKind::Catch { exception, body } => {
            pad(f, indent)?;
            match exception {
                Some(e) => write!(f, "catch ({}) ", e)?,
                None => write!(f, "catch ")?,
            }
            dump_braced(f, graph, *body, indent)?;
            writeln!(f)
        }
        BlockKind::Finally { body } => {
            pad(f, indent)?;
            write!(f, "finally ")?;
            dump_braced(f, graph, *body, indent)?;
            writeln!(f)
        }
        BlockKind::Synchronized { monitor, body } => {
            pad(f, indent)?;
            match monitor {
                Some(m) => write!(f, "synchronized ({}) ", m)?,
                None => write!(f, "synchronized ")?,
            }
            dump_braced(f, graph, *body, indent)?;
            writeln!(f)
        }
        BlockKind::Break { level, .. } => {
            pad(f, indent)?;
            if *level > 1 {
                writeln!(f, "break {};", level)
            } else {
                writeln!(f, "break;")
            }
        }
        BlockKind::Continue { level, .. } => {
            pad(f, indent)?;
            if *level > 1 {
                writeln!(f, "continue {};", level)
            } else {
                writeln!(f, "continue;")
            }
        }
        BlockKind::Return { value, .. } => {
            pad(f, indent)?;
            match value {
                Some(v) => writeln!(f, "return {};", v),
                None => writeln!(f, "return;"),
            }
        }
        BlockKind::Throw { value, .. } => {
            pad(f, indent)?;
            writeln!(f, "throw {};", value)
        }
    }
}

/// Writes a for-slot child without trailing punctuation.
fn write_statement_expr(f: &mut fmt::Formatter<'_>, graph: &FlowGraph, b: BlockId) -> fmt::Result {
    match &graph.block(b).kind {
        BlockKind::Instruction { expr, .. } => write!(f, "{}", expr),
        _ => write!(f, "..."),
    }
}

struct DotFlowNode {
    label: String,
}

impl fmt::Display for DotFlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

// A dummy struct to implement fmt required by petgraph::Dot
struct DotFlowEdge {}

impl fmt::Display for DotFlowEdge {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

/// Generate the dot representation of the live flow nodes (which can be
/// rendered by the dot program).  Useful for inspecting a partially
/// reduced graph.
pub fn generate_flow_in_dot_format(flow_graph: &FlowGraph) -> String {
    let mut graph = Graph::new();

    // add nodes
    let mut node_map = BTreeMap::new();
    for id in flow_graph.live_flows() {
        let flow = flow_graph.flow(id);
        let label = format!(
            "[{} @ {}..{}]\n{}",
            id,
            flow.addr,
            flow.addr + flow.length,
            dump_tree(flow_graph, flow.root)
        );
        let idx = graph.add_node(DotFlowNode { label });
        node_map.insert(Destination::Flow(id), idx);
    }
    let dummy = |graph: &mut Graph<DotFlowNode, DotFlowEdge>, dest: Destination| {
        graph.add_node(DotFlowNode {
            label: format!("{}", dest),
        })
    };

    // add edges
    let live: Vec<FlowId> = flow_graph.live_flows().collect();
    for id in live {
        let from = node_map[&Destination::Flow(id)];
        for dest in flow_graph.flow(id).successors.keys() {
            let to = match node_map.get(dest) {
                Some(idx) => *idx,
                None => {
                    let idx = dummy(&mut graph, *dest);
                    node_map.insert(*dest, idx);
                    idx
                }
            };
            graph.add_edge(from, to, DotFlowEdge {});
        }
    }

    // generate dot string
    format!(
        "{}",
        Dot::with_attr_getters(&graph, &[], &|_, _| "".to_string(), &|_, _| {
            "shape=box".to_string()
        })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CmpOp, Expr};
    use crate::variables::LocalId;

    #[test]
    fn test_dump_if_else() {
        let mut g = FlowGraph::new(false);
        let then_b = g.new_block_floating(BlockKind::Return {
            addr: 1,
            value: Some(Expr::Const(1)),
        });
        let else_b = g.new_block_floating(BlockKind::Return {
            addr: 2,
            value: Some(Expr::Const(0)),
        });
        let if_b = g.new_block_floating(BlockKind::IfThenElse {
            cond: Expr::compare(CmpOp::Lt, Expr::load(LocalId(0)), Expr::Const(10)),
            then_branch: then_b,
            else_branch: Some(else_b),
        });
        g.block_mut(then_b).outer = Some(if_b);
        g.block_mut(else_b).outer = Some(if_b);
        let flow = g.new_flow(0, 3, if_b);
        let text = dump_tree(&g, g.flow(flow).root);
        assert_eq!(
            text,
            "if ((v0 < 10)) {\n  return 1;\n} else {\n  return 0;\n}\n"
        );
    }

    #[test]
    fn test_dot_output_names_live_flows() {
        let mut g = FlowGraph::new(false);
        let root = g.new_block_floating(BlockKind::Return {
            addr: 0,
            value: None,
        });
        g.new_flow(0, 1, root);
        let dot = generate_flow_in_dot_format(&g);
        assert!(dot.contains("digraph"));
        assert!(dot.contains("f0"));
    }
}
