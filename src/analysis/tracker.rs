// SPDX-License-Identifier: BSD-3-Clause
//! Interprocedural reachability from a lock site to an aliasing lock site
//!
//! From the operation after the lock site, walk forward through the control
//! flow graph of its function. Calls to defined functions are entered in
//! place: the callee is pushed as a new frame. Once the callee is exhausted,
//! the caller resumes after the call if some path through the callee reached
//! a return. A path ends at an aliasing lock site (a detection), at a member
//! of the kill set, or at a function exit.
//! Each block and each function is visited at most once per query.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::{
    analysis::{alias::AliasGroups, callgraph::CallGraph, classify::LockSite, lifetime::Lifetime},
    ir::{BlockId, FunctionId, OpId, Opcode, Program},
    patterns::Patterns,
};

/// A second acquisition reachable from a lock site.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Detection {
    /// Index of the aliasing lock site
    pub second: usize,
    /// From the first site's function down to the second site's
    pub call_chain: Vec<FunctionId>,
    /// The calls linking consecutive functions of `call_chain`
    pub call_sites: Vec<OpId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub detections: Vec<Detection>,
    pub steps: usize,
    pub truncated: bool,
}

/// Everything a query reads. All of it is immutable, so queries can run
/// concurrently.
#[derive(Clone, Copy, Debug)]
pub struct Query<'a> {
    pub program: &'a Program,
    pub patterns: &'a Patterns,
    pub callgraph: &'a CallGraph,
    pub sites: &'a [LockSite],
    pub lifetimes: &'a [Lifetime],
    pub groups: &'a AliasGroups,
    pub max_steps: usize,
}

#[derive(Debug)]
struct Frame {
    function: FunctionId,
    worklist: VecDeque<(BlockId, usize)>,
    /// Where the caller continues once this frame is exhausted
    resume: Option<(BlockId, usize)>,
    /// Some path through this function reached a return with the lock held
    returns: bool,
}

#[derive(Debug)]
enum Scan {
    Detected(OpId),
    Stopped,
    Descend {
        callee: FunctionId,
        entry: BlockId,
        call: OpId,
        resume: usize,
    },
    Fallthrough,
    OutOfSteps,
}

impl Query<'_> {
    /// A call the tracker may enter: resolved, defined, and not summarized by
    /// the pattern tables.
    fn enterable(&self, op: OpId) -> Option<(FunctionId, BlockId)> {
        let callee = self.callgraph.callee(op)?;
        let f = self.program.function(callee);
        if self.patterns.is_modeled(&f.name) {
            return None;
        }
        f.entry().map(|entry| (callee, entry))
    }

    fn returns(&self, block: BlockId) -> bool {
        self.program
            .block(block)
            .ops
            .last()
            .is_some_and(|op| matches!(self.program.op(*op).opcode, Opcode::Return))
    }

    #[allow(clippy::too_many_arguments)]
    fn scan(
        &self,
        site: &LockSite,
        aliases: &FxHashMap<OpId, Vec<usize>>,
        lifetime: &Lifetime,
        visited_functions: &FxHashSet<FunctionId>,
        block: BlockId,
        start: usize,
        steps: &mut usize,
    ) -> Scan {
        let ops = &self.program.block(block).ops;
        for (idx, op) in ops.iter().enumerate().skip(start) {
            *steps += 1;
            if *steps > self.max_steps {
                return Scan::OutOfSteps;
            }
            // Back around a loop to the site itself
            if *op == site.op {
                return Scan::Stopped;
            }
            if aliases.contains_key(op) {
                return Scan::Detected(*op);
            }
            if lifetime.kills(*op) {
                return Scan::Stopped;
            }
            if let Some((callee, entry)) = self.enterable(*op) {
                if !visited_functions.contains(&callee) {
                    return Scan::Descend {
                        callee,
                        entry,
                        call: *op,
                        resume: idx + 1,
                    };
                }
            }
        }
        Scan::Fallthrough
    }

    fn chain(
        parent: &FxHashMap<FunctionId, (FunctionId, OpId)>,
        root: FunctionId,
        mut f: FunctionId,
    ) -> (Vec<FunctionId>, Vec<OpId>) {
        let mut functions = vec![f];
        let mut calls = Vec::new();
        while f != root {
            match parent.get(&f) {
                Some((caller, call)) => {
                    functions.push(*caller);
                    calls.push(*call);
                    f = *caller;
                }
                None => break,
            }
        }
        functions.reverse();
        calls.reverse();
        (functions, calls)
    }

    /// Search from lock site number `index`.
    pub fn run(&self, index: usize) -> Outcome {
        let site = &self.sites[index];
        let _span = tracing::debug_span!("query", site = %site.op).entered();
        let aliases = self.groups.ops(self.sites, index);
        let mut out = Outcome::default();
        if aliases.is_empty() {
            return out;
        }
        let lifetime = &self.lifetimes[index];

        let mut visited_blocks: FxHashSet<BlockId> = FxHashSet::default();
        let mut visited_functions: FxHashSet<FunctionId> = FxHashSet::default();
        let mut parent: FxHashMap<FunctionId, (FunctionId, OpId)> = FxHashMap::default();
        visited_functions.insert(site.function);
        // The site's own block is not marked, so a loop can come back to it
        let start = (
            self.program.op(site.op).block,
            self.program.index_in_block(site.op) + 1,
        );
        let mut stack = vec![Frame {
            function: site.function,
            worklist: VecDeque::from([start]),
            resume: None,
            returns: false,
        }];

        while let Some(top) = stack.last_mut() {
            let function = top.function;
            let Some((block, start)) = top.worklist.pop_front() else {
                if let Some(done) = stack.pop() {
                    if let (Some(caller), Some(resume), true) =
                        (stack.last_mut(), done.resume, done.returns)
                    {
                        caller.worklist.push_front(resume);
                    }
                }
                continue;
            };
            match self.scan(
                site,
                &aliases,
                lifetime,
                &visited_functions,
                block,
                start,
                &mut out.steps,
            ) {
                Scan::Detected(op) => {
                    let (call_chain, call_sites) = Self::chain(&parent, site.function, function);
                    for second in &aliases[&op] {
                        tracing::debug!(first = %site.op, second = %op, "double lock");
                        out.detections.push(Detection {
                            second: *second,
                            call_chain: call_chain.clone(),
                            call_sites: call_sites.clone(),
                        });
                    }
                }
                Scan::Stopped => (),
                Scan::Descend {
                    callee,
                    entry,
                    call,
                    resume,
                } => {
                    visited_functions.insert(callee);
                    visited_blocks.insert(entry);
                    parent.insert(callee, (function, call));
                    stack.push(Frame {
                        function: callee,
                        worklist: VecDeque::from([(entry, 0)]),
                        resume: Some((block, resume)),
                        returns: false,
                    });
                }
                Scan::Fallthrough => {
                    if let Some(top) = stack.last_mut() {
                        let b = self.program.block(block);
                        if b.successors.is_empty() && self.returns(block) {
                            top.returns = true;
                        }
                        for s in &b.successors {
                            if visited_blocks.insert(*s) {
                                top.worklist.push_back((*s, 0));
                            }
                        }
                    }
                }
                Scan::OutOfSteps => {
                    tracing::warn!(site = %site.op, steps = out.steps, "query truncated");
                    out.truncated = true;
                    break;
                }
            }
        }
        out.detections.sort();
        out.detections.dedup();
        out
    }
}
