// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Live-range and operand-stack bookkeeping.
//!
//! A [`VariableSet`] tracks which locals a region may read before writing
//! (`in`) and which it writes at all (`gen`).  A [`VariableStack`] describes
//! what occupies each operand-stack slot on entry to a region; stack slots
//! that survive a control transfer are always materialized into synthesized
//! locals, so a snapshot only ever contains locals.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Result, StructureError};

/// Identifier of a local variable.  Input locals are numbered by the
/// decoder; synthesized stack locals are allocated above them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u32);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A set of local-variable identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VariableSet {
    locals: BTreeSet<LocalId>,
}

impl VariableSet {
    pub fn new() -> Self {
        VariableSet::default()
    }

    pub fn insert(&mut self, local: LocalId) -> bool {
        self.locals.insert(local)
    }

    pub fn contains(&self, local: LocalId) -> bool {
        self.locals.contains(&local)
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = LocalId> + '_ {
        self.locals.iter().copied()
    }

    /// Adds every element of `other` to this set.
    pub fn union_with(&mut self, other: &VariableSet) {
        self.locals.extend(other.locals.iter().copied());
    }

    /// Removes every element of `other` from this set.
    pub fn subtract(&mut self, other: &VariableSet) {
        for local in &other.locals {
            self.locals.remove(local);
        }
    }

    /// Keeps only elements present in both sets.
    pub fn intersect_with(&mut self, other: &VariableSet) {
        self.locals.retain(|l| other.locals.contains(l));
    }

    pub fn intersection(&self, other: &VariableSet) -> VariableSet {
        VariableSet {
            locals: self.locals.intersection(&other.locals).copied().collect(),
        }
    }

    /// Adds every element of `gens` that is not killed by `kills`.
    pub fn union_minus(&mut self, gens: &VariableSet, kills: &VariableSet) {
        for local in &gens.locals {
            if !kills.locals.contains(local) {
                self.locals.insert(*local);
            }
        }
    }
}

impl FromIterator<LocalId> for VariableSet {
    fn from_iter<T: IntoIterator<Item = LocalId>>(iter: T) -> Self {
        VariableSet {
            locals: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for VariableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, l) in self.locals.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", l)?;
        }
        write!(f, "}}")
    }
}

/// The operand stack shape at a region entry: one synthesized local per
/// occupied slot, bottom first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VariableStack {
    slots: Vec<LocalId>,
}

impl VariableStack {
    pub fn empty() -> Self {
        VariableStack::default()
    }

    pub fn from_slots(slots: Vec<LocalId>) -> Self {
        VariableStack { slots }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[LocalId] {
        &self.slots
    }

    pub fn push(&mut self, local: LocalId) {
        self.slots.push(local);
    }

    pub fn pop(&mut self) -> Option<LocalId> {
        self.slots.pop()
    }

    /// Merges two stack shapes reaching the same point.  Depths must agree
    /// and each slot must hold the same local; synthesized stack locals are
    /// keyed by slot depth, so shapes produced from different paths agree
    /// unless the input was illegal.
    pub fn merge(&self, other: &VariableStack) -> Result<VariableStack> {
        if self.slots.len() != other.slots.len() {
            return Err(StructureError::StackMerge(format!(
                "stack depths differ: {} vs {}",
                self.slots.len(),
                other.slots.len()
            )));
        }
        for (i, (a, b)) in self.slots.iter().zip(&other.slots).enumerate() {
            if a != b {
                return Err(StructureError::StackMerge(format!(
                    "slot {} holds {} on one path and {} on another",
                    i, a, b
                )));
            }
        }
        Ok(self.clone())
    }

    /// Merge where one side may be absent (first path to reach the point).
    pub fn merge_option(a: Option<&VariableStack>, b: &VariableStack) -> Result<VariableStack> {
        match a {
            None => Ok(b.clone()),
            Some(a) => a.merge(b),
        }
    }
}

impl fmt::Display for VariableStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, l) in self.slots.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", l)?;
        }
        write!(f, "]")
    }
}
