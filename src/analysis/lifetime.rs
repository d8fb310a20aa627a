// SPDX-License-Identifier: BSD-3-Clause
//! Guard-lifetime automaton
//!
//! Starting from the value produced by a lock site, follow use edges until
//! each branch ends in a terminal state. A wrapped site starts in
//! [`State::WrappedResult`] and moves to [`State::Guard`] at an unwrap.
//! Drops and calls into code we know nothing about end the hold; those
//! operations form the kill set.

use std::collections::{BTreeSet, VecDeque};

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::{
    analysis::classify::LockSite,
    ir::{OpId, Opcode, Operation, Program, Use, ValueId, ValueKind},
    patterns::{ApiKind, Patterns},
};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    WrappedResult,
    Guard,
}

/// Terminal states
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Release {
    Dereferenced,
    AutoDropped,
    ManualDropped,
    MovedToOpaqueCall,
    Returned,
    Overwritten,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Continue(ValueId),
    Unwrapped(ValueId),
    Terminal(Release),
}

/// Outcome of running the automaton for one lock site. Each set holds the
/// operations at which a branch of the walk ended in that state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Lifetime {
    pub guards: BTreeSet<ValueId>,
    pub unwrapped: BTreeSet<OpId>,
    pub dereferenced: BTreeSet<OpId>,
    pub auto_dropped: BTreeSet<OpId>,
    pub manual_dropped: BTreeSet<OpId>,
    pub moved_to_opaque_call: BTreeSet<OpId>,
    pub returned: BTreeSet<OpId>,
    pub overwritten: BTreeSet<OpId>,
    pub unknown: BTreeSet<OpId>,
    /// The `Result` wrapping the guard reached a return
    pub returned_result: bool,
    /// The guard itself reached a return
    pub returned_guard: bool,
    /// Parameters of the site's function that the guard (or the `Result`
    /// wrapping it) was written through, e.g. an `sret` pointer
    pub out_params: BTreeSet<(State, usize)>,
}

impl Lifetime {
    fn record(&mut self, state: State, release: Release, op: OpId) {
        let set = match release {
            Release::Dereferenced => &mut self.dereferenced,
            Release::AutoDropped => &mut self.auto_dropped,
            Release::ManualDropped => &mut self.manual_dropped,
            Release::MovedToOpaqueCall => &mut self.moved_to_opaque_call,
            Release::Returned => {
                match state {
                    State::WrappedResult => self.returned_result = true,
                    State::Guard => self.returned_guard = true,
                }
                &mut self.returned
            }
            Release::Overwritten => &mut self.overwritten,
            Release::Unknown => &mut self.unknown,
        };
        set.insert(op);
    }

    /// Whether `op` ends the hold
    pub fn kills(&self, op: OpId) -> bool {
        self.auto_dropped.contains(&op)
            || self.manual_dropped.contains(&op)
            || self.moved_to_opaque_call.contains(&op)
    }

    /// The kill set
    pub fn kill(&self) -> BTreeSet<OpId> {
        self.auto_dropped
            .iter()
            .chain(&self.manual_dropped)
            .chain(&self.moved_to_opaque_call)
            .copied()
            .collect()
    }

    /// Whether the guard outlives the site's function
    pub fn escapes(&self) -> bool {
        self.returned_result || self.returned_guard || !self.out_params.is_empty()
    }
}

// Value produced by a `Result` API: the call's result, or whatever its
// out-parameter points to.
fn result_or_out_param(program: &Program, o: &Operation) -> Option<ValueId> {
    o.result
        .or_else(|| o.operands.first().map(|a| program.underlying_object(*a)))
}

fn step(program: &Program, patterns: &Patterns, state: State, u: Use) -> Step {
    let o = program.op(u.op);
    let continue_with = |v: Option<ValueId>| match v {
        Some(v) => Step::Continue(v),
        None => Step::Terminal(Release::Unknown),
    };
    match &o.opcode {
        Opcode::Call { .. } => {
            let Some(f) = program.callee(u.op) else {
                return Step::Terminal(Release::MovedToOpaqueCall);
            };
            match (state, patterns.api_kind(&program.function(f).name)) {
                (_, Some(ApiKind::AutoDrop)) => Step::Terminal(Release::AutoDropped),
                (_, Some(ApiKind::ManualDrop)) => Step::Terminal(Release::ManualDropped),
                (State::WrappedResult, Some(ApiKind::Unwrap)) => {
                    match result_or_out_param(program, o) {
                        Some(g) => Step::Unwrapped(g),
                        None => Step::Terminal(Release::Unknown),
                    }
                }
                (State::WrappedResult, Some(ApiKind::ResultPassthrough)) => {
                    continue_with(result_or_out_param(program, o))
                }
                (State::Guard, Some(ApiKind::Deref)) => Step::Terminal(Release::Dereferenced),
                _ => Step::Terminal(Release::MovedToOpaqueCall),
            }
        }
        Opcode::MemTransfer => {
            if u.operand == 0 {
                Step::Terminal(Release::Overwritten)
            } else {
                continue_with(o.operands.first().map(|d| program.underlying_object(*d)))
            }
        }
        Opcode::MemSet => Step::Terminal(Release::Overwritten),
        Opcode::Store => {
            if u.operand == 1 {
                Step::Terminal(Release::Overwritten)
            } else {
                continue_with(o.operands.get(1).map(|p| program.underlying_object(*p)))
            }
        }
        Opcode::Load
        | Opcode::Cast
        | Opcode::GetElementPtr { .. }
        | Opcode::ExtractValue { .. }
        | Opcode::InsertValue { .. }
        | Opcode::Phi
        | Opcode::Select => continue_with(o.result),
        Opcode::Return => Step::Terminal(Release::Returned),
        // No `_` pattern to ensure this is updated if the type changes
        Opcode::Alloca => Step::Terminal(Release::Unknown),
        Opcode::Branch => Step::Terminal(Release::Unknown),
        Opcode::Unreachable => Step::Terminal(Release::Unknown),
        Opcode::Other => Step::Terminal(Release::Unknown),
    }
}

fn out_param(program: &Program, site: &LockSite, v: ValueId) -> Option<usize> {
    match program.value(v).kind {
        ValueKind::Param { function, index } if function == site.function => Some(index),
        _ => None,
    }
}

/// Run the automaton for `site`.
///
/// The walk is breadth-first over use edges. Each worklist entry remembers
/// the operation that produced it, and that operation's own use of the value
/// is not followed again (e.g., the store that put a guard into a slot is not
/// an overwrite of that slot).
pub fn track(program: &Program, patterns: &Patterns, site: &LockSite) -> Lifetime {
    let start = if site.wrapped {
        State::WrappedResult
    } else {
        State::Guard
    };
    let mut lifetime = Lifetime::default();
    if start == State::Guard {
        lifetime.guards.insert(site.guard);
    }
    let mut visited: FxHashSet<(State, ValueId)> = FxHashSet::default();
    let mut worklist: VecDeque<(State, ValueId, OpId)> = VecDeque::new();
    // The lock call itself wrote into a slot the caller passed in
    if program.uses(site.guard).iter().any(|u| u.op == site.op) {
        if let Some(index) = out_param(program, site, site.guard) {
            lifetime.out_params.insert((start, index));
        }
    }
    visited.insert((start, site.guard));
    worklist.push_back((start, site.guard, site.op));

    while let Some((state, value, from)) = worklist.pop_front() {
        for u in program.uses(value) {
            if u.op == from || u.op == site.op {
                continue;
            }
            match step(program, patterns, state, *u) {
                Step::Continue(next) => {
                    if let Some(index) = out_param(program, site, next) {
                        lifetime.out_params.insert((state, index));
                    }
                    if visited.insert((state, next)) {
                        worklist.push_back((state, next, u.op));
                    }
                }
                Step::Unwrapped(guard) => {
                    lifetime.unwrapped.insert(u.op);
                    if let Some(index) = out_param(program, site, guard) {
                        lifetime.out_params.insert((State::Guard, index));
                    }
                    lifetime.guards.insert(guard);
                    if visited.insert((State::Guard, guard)) {
                        worklist.push_back((State::Guard, guard, u.op));
                    }
                }
                Step::Terminal(release) => lifetime.record(state, release, u.op),
            }
        }
    }
    lifetime
}
