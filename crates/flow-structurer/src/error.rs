// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors raised while structuring a single method.  All of them are fatal
/// for the method being processed; none of them should abort sibling methods.
#[derive(Debug, Error)]
pub enum StructureError {
    /// An internal invariant (jump ownership, successor/predecessor symmetry,
    /// exactly-one-root) was broken.  Either a structurer defect or a
    /// malformed input graph.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A jump could not be attached to any recognized construct after the
    /// full resolution pass.  Should not happen for reducible input graphs.
    #[error("unresolved jump at address {addr}")]
    UnresolvedJump { addr: u32 },

    /// Two predecessors disagree on the operand stack shape at a merge
    /// point.  Signals illegal or adversarial input.
    #[error("operand stack merge conflict: {0}")]
    StackMerge(String),
}

pub type Result<T> = std::result::Result<T, StructureError>;

impl StructureError {
    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        StructureError::Consistency(msg.into())
    }
}
