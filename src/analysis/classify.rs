// SPDX-License-Identifier: BSD-3-Clause
//! Lock-site classification

use serde::Serialize;

use crate::{
    analysis::Diagnostic,
    ir::{FunctionId, OpId, Program, ValueId},
    patterns::{GuardSlot, LockPattern, Patterns, ShareMode},
};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Origin {
    /// A call to a lock API
    Direct,
    /// A call to a function that returns the guard acquired at `inner`
    Wrapper { inner: OpId },
}

/// An acquisition of a lock.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct LockSite {
    /// The acquiring call
    pub op: OpId,
    pub function: FunctionId,
    /// Where the lifetime automaton starts: the guard, or the `Result`
    /// wrapping it when `wrapped`
    pub guard: ValueId,
    /// The lock itself
    pub resource: ValueId,
    pub share: ShareMode,
    pub wrapped: bool,
    /// Name of the matching lock pattern
    pub api: String,
    pub origin: Origin,
}

fn parse(program: &Program, op: OpId, pattern: &LockPattern) -> Result<LockSite, Diagnostic> {
    let o = program.op(op);
    let unparseable = |reason: String| Diagnostic::UnparseableLockSite {
        op,
        pattern: pattern.name.clone(),
        reason,
    };
    let arg = |n: usize| {
        o.operands.get(n).copied().ok_or_else(|| {
            unparseable(format!(
                "expected argument {}, but the call has {}",
                n,
                o.operands.len()
            ))
        })
    };
    let resource = arg(pattern.resource)?;
    let guard = match pattern.guard {
        GuardSlot::Result => o
            .result
            .ok_or_else(|| unparseable("expected a result, but the call has none".to_string()))?,
        GuardSlot::Arg(n) => program.strip_casts(arg(n)?),
    };
    Ok(LockSite {
        op,
        function: program.function_of_op(op),
        guard,
        resource,
        share: pattern.share,
        wrapped: pattern.wrapped,
        api: pattern.name.clone(),
        origin: Origin::Direct,
    })
}

/// Classify one operation. `None` if it isn't a call to a lock API.
pub fn classify(
    program: &Program,
    patterns: &Patterns,
    op: OpId,
) -> Option<Result<LockSite, Diagnostic>> {
    let name = program.callee_name(op)?;
    let pattern = patterns.lock_pattern(name)?;
    Some(parse(program, op, pattern))
}

/// All direct lock sites, in program order.
#[tracing::instrument(name = "classify", level = "debug", skip_all)]
pub fn lock_sites(program: &Program, patterns: &Patterns) -> (Vec<LockSite>, Vec<Diagnostic>) {
    let mut sites = Vec::new();
    let mut diagnostics = Vec::new();
    for (op, o) in program.ops() {
        if !o.opcode.is_call() {
            continue;
        }
        match classify(program, patterns, op) {
            Some(Ok(site)) => sites.push(site),
            Some(Err(d)) => {
                tracing::warn!("{}", d);
                diagnostics.push(d);
            }
            None => (),
        }
    }
    tracing::debug!(sites = sites.len(), "classified lock sites");
    (sites, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ProgramBuilder, Type};
    use crate::patterns::PatternFile;

    fn patterns() -> Patterns {
        Patterns::new(PatternFile {
            locks: vec![
                LockPattern {
                    name: "lock".to_string(),
                    pattern: "^lock$".to_string(),
                    resource: 0,
                    guard: GuardSlot::Result,
                    share: ShareMode::Exclusive,
                    wrapped: false,
                },
                LockPattern {
                    name: "lock_out".to_string(),
                    pattern: "^lock_out$".to_string(),
                    resource: 1,
                    guard: GuardSlot::Arg(0),
                    share: ShareMode::Shared,
                    wrapped: true,
                },
            ],
            ..PatternFile::default()
        })
        .unwrap()
    }

    #[test]
    fn shapes() {
        let mut b = ProgramBuilder::new();
        let m = b.ty(Type::Named {
            name: "Mutex".to_string(),
        });
        let mp = b.pointer_to(m);
        let g = b.ty(Type::Named {
            name: "Guard".to_string(),
        });
        let gp = b.pointer_to(g);
        let lock = b.function("lock", &[mp], Some(g));
        let lock_out = b.function("lock_out", &[gp, mp], None);
        let f = b.function("f", &[mp], None);
        let bb = b.block(f);
        let mtx = b.param(f, 0);
        let (l1, r1) = b.call(bb, lock, &[mtx]);
        let slot = b.alloca(bb, g);
        let (l2, _) = b.call(bb, lock_out, &[slot, mtx]);
        // Wrong arity
        let (l3, _) = b.call(bb, lock_out, &[slot]);
        b.ret(bb, None);
        let p = b.finish().unwrap();
        let pats = patterns();

        let s1 = classify(&p, &pats, l1).unwrap().unwrap();
        assert_eq!(s1.guard, r1.unwrap());
        assert_eq!(s1.resource, mtx);
        assert!(!s1.wrapped);

        let s2 = classify(&p, &pats, l2).unwrap().unwrap();
        assert_eq!(s2.guard, slot);
        assert_eq!(s2.share, ShareMode::Shared);
        assert!(s2.wrapped);

        assert!(matches!(
            classify(&p, &pats, l3),
            Some(Err(Diagnostic::UnparseableLockSite { .. }))
        ));

        let (sites, diags) = lock_sites(&p, &pats);
        assert_eq!(sites.len(), 2);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].op(), l3);
    }
}
