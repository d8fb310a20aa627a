// SPDX-License-Identifier: BSD-3-Clause
//! Callgraph of statically resolved calls
//!
//! Only direct calls (possibly through a constant cast of a function
//! address) produce edges. Calls through variables and inline assembly are
//! left unresolved; the lifetime automaton treats them as opaque and the
//! reachability tracker does not descend into them.
//!
//! TODO:
//!
//! - Handle global aliases?

use rustc_hash::FxHashMap;

use crate::ir::{FunctionId, OpId, Opcode, Program};

#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    callee: FxHashMap<OpId, FunctionId>,
    call_sites: FxHashMap<FunctionId, Vec<OpId>>,
    edges: Vec<(FunctionId, OpId, FunctionId)>,
    unresolved: usize,
}

impl CallGraph {
    #[tracing::instrument(name = "callgraph", level = "debug", skip_all)]
    pub fn new(program: &Program) -> Self {
        // Size heuristic: Most functions will be called at least once.
        let mut g = CallGraph {
            callee: FxHashMap::default(),
            call_sites: FxHashMap::default(),
            edges: Vec::with_capacity(program.functions.len()),
            unresolved: 0,
        };
        for (caller, f) in program.functions() {
            for b in &f.blocks {
                for op in &program.block(*b).ops {
                    match &program.op(*op).opcode {
                        Opcode::Call { .. } => match program.callee(*op) {
                            Some(target) => {
                                g.callee.insert(*op, target);
                                g.call_sites.entry(target).or_default().push(*op);
                                g.edges.push((caller, *op, target));
                            }
                            None => g.unresolved += 1,
                        },
                        // No `_` pattern to ensure this is updated if the type changes
                        Opcode::Alloca => (),
                        Opcode::Load => (),
                        Opcode::Store => (),
                        Opcode::GetElementPtr { .. } => (),
                        Opcode::Cast => (),
                        Opcode::ExtractValue { .. } => (),
                        Opcode::InsertValue { .. } => (),
                        Opcode::Phi => (),
                        Opcode::Select => (),
                        Opcode::MemTransfer => (),
                        Opcode::MemSet => (),
                        Opcode::Return => (),
                        Opcode::Branch => (),
                        Opcode::Unreachable => (),
                        Opcode::Other => (),
                    }
                }
            }
        }
        tracing::debug!(
            edges = g.edges.len(),
            unresolved = g.unresolved,
            "built callgraph"
        );
        g
    }

    /// Resolved target of a call site
    pub fn callee(&self, call: OpId) -> Option<FunctionId> {
        self.callee.get(&call).copied()
    }

    /// All call sites that resolve to `f`, in program order
    pub fn call_sites_of(&self, f: FunctionId) -> &[OpId] {
        self.call_sites.get(&f).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `(caller, call site, callee)`
    pub fn edges(&self) -> &[(FunctionId, OpId, FunctionId)] {
        &self.edges
    }

    pub fn unresolved(&self) -> usize {
        self.unresolved
    }
}
