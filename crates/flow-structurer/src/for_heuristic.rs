// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Pluggable judgement for promoting a speculative for-loop.
//!
//! When a loop body ends in a combinable instruction the structurer
//! tentatively treats it as the for-loop increment.  Once the loop condition
//! is known the heuristic decides whether the speculation commits.

use crate::expr::Expr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForVerdict {
    /// Commit: detach the increment and emit a for-loop.
    Match,
    /// Abort: keep the instruction in the body and emit a while-loop.
    NoMatch,
    /// The heuristic cannot decide.  The structurer logs a warning and
    /// demotes the loop, which is always semantics-preserving.
    Ambiguous,
}

pub trait ForHeuristic {
    /// Judges whether `cond` is a plausible exit test for a loop whose last
    /// body instruction is `incr`.
    fn judge(&self, cond: &Expr, incr: &Expr) -> ForVerdict;
}

/// The default judgement: the condition must read the local the candidate
/// increment assigns to.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatchingLoad;

impl ForHeuristic for MatchingLoad {
    fn judge(&self, cond: &Expr, incr: &Expr) -> ForVerdict {
        match incr.combinable_target() {
            Some(target) if cond.contains_load(target) => ForVerdict::Match,
            Some(_) => ForVerdict::NoMatch,
            None => ForVerdict::NoMatch,
        }
    }
}

/// A stricter judgement: additionally requires the condition to be a
/// comparison whose left-hand side is exactly the increment target.  Reports
/// `Ambiguous` when the target is read somewhere else in the condition.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrictCompare;

impl ForHeuristic for StrictCompare {
    fn judge(&self, cond: &Expr, incr: &Expr) -> ForVerdict {
        let Some(target) = incr.combinable_target() else {
            return ForVerdict::NoMatch;
        };
        if let Expr::Compare(_, lhs, _) = cond {
            if **lhs == Expr::Load(target) {
                return ForVerdict::Match;
            }
        }
        if cond.contains_load(target) {
            ForVerdict::Ambiguous
        } else {
            ForVerdict::NoMatch
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinOp, CmpOp};
    use crate::variables::LocalId;

    #[test]
    fn test_matching_load_commits_on_reference() {
        let cond = Expr::compare(CmpOp::Lt, Expr::load(LocalId(1)), Expr::Const(10));
        let incr = Expr::Inc(LocalId(1), 1);
        assert_eq!(MatchingLoad.judge(&cond, &incr), ForVerdict::Match);
    }

    #[test]
    fn test_matching_load_aborts_on_unrelated_condition() {
        let cond = Expr::compare(CmpOp::Lt, Expr::load(LocalId(2)), Expr::Const(10));
        let incr = Expr::Inc(LocalId(1), 1);
        assert_eq!(MatchingLoad.judge(&cond, &incr), ForVerdict::NoMatch);
    }

    #[test]
    fn test_strict_compare_reports_ambiguity() {
        // the target is read, but not as the comparison's left-hand side
        let cond = Expr::compare(
            CmpOp::Lt,
            Expr::Binary(
                BinOp::Add,
                Box::new(Expr::load(LocalId(1))),
                Box::new(Expr::Const(1)),
            ),
            Expr::Const(10),
        );
        let incr = Expr::Inc(LocalId(1), 1);
        assert_eq!(StrictCompare.judge(&cond, &incr), ForVerdict::Ambiguous);
    }
}
