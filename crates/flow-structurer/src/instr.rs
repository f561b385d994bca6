// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Input contract with the instruction-decoding collaborator.
//!
//! The decoder delivers an ordered-by-address list of [`Instruction`]s.
//! Control transfers are expressed only as successor addresses; address `-1`
//! conventionally denotes the end-of-method sentinel.

use crate::expr::Expr;

pub type Addr = u32;

/// The conventional successor address for "falls off the end of the method".
pub const END_ADDR: i64 = -1;

/// One decoded instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub addr: Addr,
    /// Byte length; the next instruction starts at `addr + length`.
    pub length: u32,
    pub op: InstrOp,
}

/// The decoded operation of an instruction.
#[derive(Clone, Debug)]
pub enum InstrOp {
    /// Evaluate an expression; control falls through.  A non-void
    /// expression pushes its value onto the operand stack.
    Eval(Expr),
    /// Unconditional jump.
    Goto { target: i64 },
    /// Conditional jump: taken when `cond` is true, otherwise falls through.
    CondJump { cond: Expr, target: i64 },
    /// Table/lookup switch over `selector`.
    Switch {
        selector: Expr,
        cases: Vec<(i64, i64)>,
        default: i64,
    },
    /// Return, optionally with a value.
    Return(Option<Expr>),
    /// Throw an exception value.
    Throw(Expr),
}

impl Instruction {
    pub fn next_addr(&self) -> Addr {
        self.addr + self.length
    }

    /// The explicit successor addresses of this instruction, in decoder
    /// order: a conditional lists the branch target then the fall-through, a
    /// switch lists every case target then the default, a return or throw
    /// lists nothing.
    pub fn successors(&self) -> Vec<i64> {
        match &self.op {
            InstrOp::Eval(_) => vec![i64::from(self.next_addr())],
            InstrOp::Goto { target } => vec![*target],
            InstrOp::CondJump { target, .. } => {
                vec![*target, i64::from(self.next_addr())]
            }
            InstrOp::Switch { cases, default, .. } => {
                let mut succs: Vec<i64> = cases.iter().map(|(_, target)| *target).collect();
                succs.push(*default);
                succs
            }
            InstrOp::Return(_) | InstrOp::Throw(_) => vec![],
        }
    }
}

/// One row of the exception-handler table, provided by the container
/// decoder: the guarded `[start, end)` address range, the handler entry
/// address, and the caught type (`None` for catch-all / finally).
#[derive(Clone, Debug)]
pub struct HandlerEntry {
    pub start: Addr,
    pub end: Addr,
    pub handler: Addr,
    pub exception: Option<String>,
}
