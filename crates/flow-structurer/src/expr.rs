// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! The operand expression tree carried by decoded instructions.
//!
//! The instruction decoder hands the core a logical operation per
//! instruction.  Operands are either fully decoded sub-expressions or
//! [`Expr::Stack`] placeholders, meaning "taken from the implicit operand
//! stack".  The stack mapper replaces every placeholder with a fused
//! expression or a synthesized local after structuring is done.

use std::fmt;

use crate::variables::{LocalId, VariableSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    BitNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Const(i64),
    Bool(bool),
    /// Read of a local variable.
    Load(LocalId),
    /// A value taken from the operand stack.  Resolved by the stack mapper.
    Stack,
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Assignment to a local.  Void.
    Store(LocalId, Box<Expr>),
    /// Compound increment of a local by a constant.  Void and combinable
    /// into a for-loop increment slot.
    Inc(LocalId, i64),
    /// A call; void unless `returns_value`.
    Call {
        name: String,
        args: Vec<Expr>,
        returns_value: bool,
    },
}

impl Expr {
    pub fn load(local: LocalId) -> Expr {
        Expr::Load(local)
    }

    pub fn store(local: LocalId, value: Expr) -> Expr {
        Expr::Store(local, Box::new(value))
    }

    pub fn compare(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Compare(op, Box::new(lhs), Box::new(rhs))
    }

    /// True if evaluating this expression leaves nothing on the stack.
    pub fn is_void(&self) -> bool {
        match self {
            Expr::Store(..) | Expr::Inc(..) => true,
            Expr::Call { returns_value, .. } => !returns_value,
            _ => false,
        }
    }

    /// True if this expression is a compound-assignment-shaped side effect
    /// that can become a for-loop increment.
    pub fn is_combinable(&self) -> bool {
        matches!(self, Expr::Inc(..) | Expr::Store(..))
    }

    /// The local a combinable expression assigns to, if any.
    pub fn combinable_target(&self) -> Option<LocalId> {
        match self {
            Expr::Store(local, _) | Expr::Inc(local, _) => Some(*local),
            _ => None,
        }
    }

    /// True if evaluation can be observed (writes a local or calls out).
    pub fn has_side_effect(&self) -> bool {
        match self {
            Expr::Store(..) | Expr::Inc(..) | Expr::Call { .. } => true,
            Expr::Unary(_, e) | Expr::Not(e) => e.has_side_effect(),
            Expr::Binary(_, a, b) | Expr::Compare(_, a, b) => {
                a.has_side_effect() || b.has_side_effect()
            }
            _ => false,
        }
    }

    /// Logical negation, pushing the negation into comparisons where
    /// possible and cancelling a double negation.
    pub fn negate(self) -> Expr {
        match self {
            Expr::Bool(b) => Expr::Bool(!b),
            Expr::Not(inner) => *inner,
            Expr::Compare(op, lhs, rhs) => Expr::Compare(op.negate(), lhs, rhs),
            other => Expr::Not(Box::new(other)),
        }
    }

    /// Number of operand-stack values this expression consumes, i.e. the
    /// count of [`Expr::Stack`] placeholders in evaluation order.
    pub fn stack_operands(&self) -> usize {
        match self {
            Expr::Stack => 1,
            Expr::Const(_) | Expr::Bool(_) | Expr::Load(_) | Expr::Inc(..) => 0,
            Expr::Unary(_, e) | Expr::Not(e) => e.stack_operands(),
            Expr::Binary(_, a, b) | Expr::Compare(_, a, b) => {
                a.stack_operands() + b.stack_operands()
            }
            Expr::Store(_, e) => e.stack_operands(),
            Expr::Call { args, .. } => args.iter().map(Expr::stack_operands).sum(),
        }
    }

    /// Replaces the [`Expr::Stack`] placeholders with the given operands, in
    /// evaluation order.  The operand list must match `stack_operands`.
    pub fn fill_stack_operands(&mut self, operands: &mut std::vec::IntoIter<Expr>) {
        match self {
            Expr::Stack => {
                if let Some(op) = operands.next() {
                    *self = op;
                }
            }
            Expr::Unary(_, e) | Expr::Not(e) | Expr::Store(_, e) => {
                e.fill_stack_operands(operands)
            }
            Expr::Binary(_, a, b) | Expr::Compare(_, a, b) => {
                a.fill_stack_operands(operands);
                b.fill_stack_operands(operands);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.fill_stack_operands(operands);
                }
            }
            _ => {}
        }
    }

    /// True if this expression contains a read of the given local.  Used by
    /// the for-loop heuristic to check whether a candidate condition refers
    /// to the tentative increment's target.
    pub fn contains_load(&self, local: LocalId) -> bool {
        match self {
            Expr::Load(l) => *l == local,
            Expr::Unary(_, e) | Expr::Not(e) | Expr::Store(_, e) => e.contains_load(local),
            Expr::Binary(_, a, b) | Expr::Compare(_, a, b) => {
                a.contains_load(local) || b.contains_load(local)
            }
            Expr::Call { args, .. } => args.iter().any(|a| a.contains_load(local)),
            _ => false,
        }
    }

    /// Adds every local read by this expression to `reads` and every local
    /// written to `writes`.
    pub fn fill_reads_writes(&self, reads: &mut VariableSet, writes: &mut VariableSet) {
        match self {
            Expr::Load(l) => {
                reads.insert(*l);
            }
            Expr::Store(l, e) => {
                e.fill_reads_writes(reads, writes);
                writes.insert(*l);
            }
            Expr::Inc(l, _) => {
                reads.insert(*l);
                writes.insert(*l);
            }
            Expr::Unary(_, e) | Expr::Not(e) => e.fill_reads_writes(reads, writes),
            Expr::Binary(_, a, b) | Expr::Compare(_, a, b) => {
                a.fill_reads_writes(reads, writes);
                b.fill_reads_writes(reads, writes);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.fill_reads_writes(reads, writes);
                }
            }
            _ => {}
        }
    }

    /// Count of `Load(local)` occurrences.
    pub fn count_loads(&self, local: LocalId) -> usize {
        match self {
            Expr::Load(l) => usize::from(*l == local),
            Expr::Unary(_, e) | Expr::Not(e) | Expr::Store(_, e) => e.count_loads(local),
            Expr::Binary(_, a, b) | Expr::Compare(_, a, b) => {
                a.count_loads(local) + b.count_loads(local)
            }
            Expr::Call { args, .. } => args.iter().map(|a| a.count_loads(local)).sum(),
            _ => 0,
        }
    }

    /// Replaces the single `Load(local)` occurrence with `value`.  The
    /// caller must have checked `count_loads(local) == 1`.
    pub fn replace_load(&mut self, local: LocalId, value: &Expr) -> bool {
        match self {
            Expr::Load(l) if *l == local => {
                *self = value.clone();
                true
            }
            Expr::Unary(_, e) | Expr::Not(e) | Expr::Store(_, e) => e.replace_load(local, value),
            Expr::Binary(_, a, b) | Expr::Compare(_, a, b) => {
                a.replace_load(local, value) || b.replace_load(local, value)
            }
            Expr::Call { args, .. } => args.iter_mut().any(|a| a.replace_load(local, value)),
            _ => false,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Load(l) => write!(f, "{}", l),
            Expr::Stack => write!(f, "<stack>"),
            Expr::Unary(UnOp::Neg, e) => write!(f, "-{}", e),
            Expr::Unary(UnOp::BitNot, e) => write!(f, "~{}", e),
            Expr::Not(e) => write!(f, "!({})", e),
            Expr::Binary(op, a, b) => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Rem => "%",
                    BinOp::And => "&",
                    BinOp::Or => "|",
                    BinOp::Xor => "^",
                    BinOp::Shl => "<<",
                    BinOp::Shr => ">>",
                };
                write!(f, "({} {} {})", a, sym, b)
            }
            Expr::Compare(op, a, b) => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "({} {} {})", a, sym, b)
            }
            Expr::Store(l, e) => write!(f, "{} = {}", l, e),
            Expr::Inc(l, n) => {
                if *n >= 0 {
                    write!(f, "{} += {}", l, n)
                } else {
                    write!(f, "{} -= {}", l, -n)
                }
            }
            Expr::Call {
                name,
                args,
                ..
            } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}
