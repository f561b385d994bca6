// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Reconstruction of structured control flow from flat, jump-based code.
//!
//! The input is a list of decoded instructions addressed by byte offset,
//! plus an exception handler table.  [`structure_method`] builds one flow
//! node per instruction, wraps guarded ranges into handler constructs,
//! then reduces the graph by repeated interval analysis until a single
//! node holding a tree of `if`/`while`/`for`/`switch`/`try` blocks
//! remains.  A final pass maps leftover operand-stack values onto locals.
//!
//! The reduction follows the classic two-transformation scheme: a node
//! that jumps only to itself becomes a loop, and a node whose sole
//! in-range predecessor precedes it is merged sequentially.  Conditional
//! jumps are folded into the tree eagerly as each merge happens, so the
//! intermediate state is always a valid partial rendering of the method.

pub mod block;
pub mod builder;
pub mod dump;
pub mod error;
pub mod expr;
pub mod flow;
pub mod for_heuristic;
mod handlers;
pub mod instr;
pub mod stack_mapper;
pub mod structurer;
pub mod variables;

pub use crate::block::{BlockId, BlockKind, LoopData, LoopKind, SwitchCase, SwitchData};
pub use crate::builder::build_graph;
pub use crate::dump::{dump_tree, generate_flow_in_dot_format, TreeDump};
pub use crate::error::{Result, StructureError};
pub use crate::expr::{BinOp, CmpOp, Expr, UnOp};
pub use crate::flow::{Destination, FlowGraph, FlowId};
pub use crate::for_heuristic::{ForHeuristic, ForVerdict, MatchingLoad, StrictCompare};
pub use crate::instr::{Addr, HandlerEntry, InstrOp, Instruction, END_ADDR};
pub use crate::stack_mapper::{remove_onetime_locals, StackMapper};
pub use crate::structurer::Structurer;
pub use crate::variables::{LocalId, VariableSet, VariableStack};

/// Knobs for [`structure_method`].
pub struct StructureOptions<'a> {
    /// Verify graph invariants after every transformation.  Slow; meant
    /// for tests and debugging.
    pub check_consistency: bool,
    /// Decides whether a speculative for-loop commits.
    pub heuristic: &'a dyn ForHeuristic,
}

impl Default for StructureOptions<'static> {
    fn default() -> Self {
        StructureOptions {
            check_consistency: false,
            heuristic: &MatchingLoad,
        }
    }
}

/// The fully structured method.
pub struct StructuredMethod {
    pub graph: FlowGraph,
    /// Root of the structured tree.
    pub root: BlockId,
    /// Locals synthesized for stack values that crossed a control
    /// boundary, in slot order.  Callers declare these at method scope.
    pub synthesized_locals: Vec<LocalId>,
}

/// Runs the whole pipeline on one method.
///
/// `n_locals` is the number of locals the instruction decoder assigned;
/// synthesized locals are numbered above it.
pub fn structure_method(
    instrs: &[Instruction],
    handlers: &[HandlerEntry],
    n_locals: u32,
    options: &StructureOptions,
) -> Result<StructuredMethod> {
    let mut graph = build_graph(instrs, handlers, options.check_consistency)?;
    {
        let mut structurer = Structurer::new(&mut graph, options.heuristic);
        structurer.install_handlers(handlers)?;
        structurer.structure()?;
    }
    let entry = graph.entry();
    let root = graph.flow(entry).root;
    let mapper = StackMapper::new(&mut graph, n_locals);
    mapper.run(root)?;
    let root = graph.flow(entry).root;
    let synthesized_locals = remove_onetime_locals(&mut graph, root, n_locals);
    let root = graph.flow(entry).root;
    Ok(StructuredMethod {
        graph,
        root,
        synthesized_locals,
    })
}
