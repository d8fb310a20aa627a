// SPDX-License-Identifier: BSD-3-Clause
//! Alias grouping of lock sites

use std::collections::{BTreeMap, BTreeSet};

use ascent::ascent_run;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::{
    analysis::{classify::LockSite, identity::ResourceIdentity, Diagnostic},
    ir::{FunctionId, OpId, Opcode, Program, TypeId, ValueId},
    patterns::ShareMode,
};

/// Must-alias queries between two values local to the same function.
pub trait AliasOracle {
    fn must_alias(&self, function: FunctionId, a: ValueId, b: ValueId) -> bool;
}

// Access paths longer than this are not tracked (this also bounds cycles
// through stack slots)
const MAX_PATH: usize = 8;

/// Access-path must-alias analysis.
///
/// Each value is described by the set of `(root, path)` pairs it is known to
/// equal, where `path` is a sequence of constant GEP indices applied to
/// `root`. Casts preserve paths, GEPs extend them, and a load from a stack
/// slot that is stored to exactly once (and used only by loads otherwise)
/// has the paths of the stored value. Two values must alias when they share
/// a pair.
#[derive(Debug, Default)]
pub struct PathOracle {
    paths: FxHashMap<ValueId, FxHashSet<(ValueId, Vec<i64>)>>,
}

/// Append GEP indices to a path. The first index steps over the pointer, so
/// it is added to the last index of the path.
fn extend(path: &[i64], indices: &[i64]) -> Vec<i64> {
    let mut out = path.to_vec();
    match (out.last_mut(), indices.split_first()) {
        (Some(last), Some((first, rest))) => {
            *last += *first;
            out.extend_from_slice(rest);
        }
        (None, _) => out.extend_from_slice(indices),
        (Some(_), None) => (),
    }
    out
}

// Stack slots stored exactly once and otherwise only loaded, mapped from each
// load result to the stored value
fn single_store_forwards(program: &Program) -> Vec<(ValueId, ValueId)> {
    let mut forwards = Vec::new();
    for (_, o) in program.ops() {
        let (Opcode::Alloca, Some(slot)) = (&o.opcode, o.result) else {
            continue;
        };
        let mut stored = None;
        let mut loads = Vec::new();
        let mut ok = true;
        for u in program.uses(slot) {
            let user = program.op(u.op);
            match (&user.opcode, u.operand) {
                (Opcode::Store, 1) if stored.is_none() => stored = user.operands.first().copied(),
                (Opcode::Load, 0) => loads.extend(user.result),
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        if let (true, Some(s)) = (ok, stored) {
            forwards.extend(loads.into_iter().map(|l| (l, s)));
        }
    }
    forwards
}

impl PathOracle {
    #[allow(clippy::clone_on_copy)]
    #[allow(clippy::collapsible_if)]
    #[allow(clippy::let_unit_value)]
    #[allow(clippy::type_complexity)]
    #[allow(clippy::unused_unit)]
    pub fn new(program: &Program, debug: bool) -> Self {
        let values: Vec<ValueId> = (0..program.values.len())
            .map(ValueId::from_index)
            .collect();
        let casts: Vec<(ValueId, ValueId)> = values
            .iter()
            .filter_map(|v| program.cast_operand(*v).map(|o| (*v, o)))
            .collect();
        let geps: Vec<(ValueId, ValueId, Vec<i64>)> = values
            .iter()
            .filter_map(|v| {
                let g = program.gep(*v)?;
                let idx: Option<Vec<i64>> =
                    g.indices.iter().map(|i| program.const_int(*i)).collect();
                Some((*v, g.base, idx?))
            })
            .collect();
        let forwards = single_store_forwards(program);

        #[allow(clippy::redundant_clone)]
        #[allow(unused_variables)]
        let outs = ascent_run! {
            struct PathOuts;

            relation value(ValueId);
            value(v.clone()) <-- for v in values.iter();

            relation cast(ValueId, ValueId);
            cast(r.clone(), o.clone()) <-- for (r, o) in casts.iter();

            relation gep(ValueId, ValueId, Vec<i64>);
            gep(r.clone(), b.clone(), idx.clone()) <-- for (r, b, idx) in geps.iter();

            relation forward(ValueId, ValueId);
            forward(l.clone(), s.clone()) <-- for (l, s) in forwards.iter();

            relation path(ValueId, ValueId, Vec<i64>);

            path(v.clone(), v.clone(), Vec::new()) <-- value(v);

            path(r.clone(), root.clone(), p.clone()) <--
              cast(r, o),
              path(o, root, p);

            path(r.clone(), root.clone(), extend(&p, &idx)) <--
              gep(r, b, idx),
              path(b, root, p),
              if p.len() + idx.len() <= MAX_PATH;

            path(l.clone(), root.clone(), p.clone()) <--
              forward(l, s),
              path(s, root, p);
        };

        if debug {
            eprintln!("{}", outs.summary());
        }

        let mut paths: FxHashMap<ValueId, FxHashSet<(ValueId, Vec<i64>)>> =
            FxHashMap::with_capacity_and_hasher(values.len(), Default::default());
        for (v, root, p) in outs.path {
            paths.entry(v).or_default().insert((root, p));
        }
        PathOracle { paths }
    }

    pub fn paths(&self, v: ValueId) -> Option<&FxHashSet<(ValueId, Vec<i64>)>> {
        self.paths.get(&v)
    }
}

impl AliasOracle for PathOracle {
    fn must_alias(&self, _function: FunctionId, a: ValueId, b: ValueId) -> bool {
        if a == b {
            return true;
        }
        match (self.paths.get(&a), self.paths.get(&b)) {
            (Some(pa), Some(pb)) => {
                let (small, large) = if pa.len() <= pb.len() {
                    (pa, pb)
                } else {
                    (pb, pa)
                };
                small.iter().any(|x| large.contains(x))
            }
            _ => false,
        }
    }
}

/// For each lock site (by index), the other sites that may hold the same
/// lock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AliasGroups {
    groups: Vec<BTreeSet<usize>>,
}

impl AliasGroups {
    pub fn group(&self, site: usize) -> &BTreeSet<usize> {
        &self.groups[site]
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of unordered aliasing pairs
    pub fn pairs(&self) -> usize {
        self.groups.iter().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// Operations of the sites in `site`'s group, for the tracker
    pub fn ops(&self, sites: &[LockSite], site: usize) -> FxHashMap<OpId, Vec<usize>> {
        let mut ops: FxHashMap<OpId, Vec<usize>> = FxHashMap::default();
        for other in &self.groups[site] {
            ops.entry(sites[*other].op).or_default().push(*other);
        }
        ops
    }
}

/// Partition lock sites by the type of their resource, then pair up sites
/// within a bucket. Sites in one function are compared with `oracle`, sites
/// in different functions by resource identity. Two shared acquisitions are
/// never paired.
#[tracing::instrument(name = "alias", level = "debug", skip_all)]
pub fn group(
    program: &Program,
    sites: &[LockSite],
    identities: &[ResourceIdentity],
    oracle: &dyn AliasOracle,
) -> (AliasGroups, Vec<Diagnostic>) {
    debug_assert_eq!(sites.len(), identities.len());
    let mut diagnostics = Vec::new();
    let mut buckets: BTreeMap<TypeId, Vec<usize>> = BTreeMap::new();
    for (i, s) in sites.iter().enumerate() {
        match program.value(s.resource).ty {
            Some(ty) => buckets.entry(ty).or_default().push(i),
            None => {
                let d = Diagnostic::MissingType {
                    op: s.op,
                    resource: s.resource,
                };
                tracing::warn!("{}", d);
                diagnostics.push(d);
            }
        }
    }

    let mut groups = vec![BTreeSet::new(); sites.len()];
    for (ty, bucket) in &buckets {
        tracing::trace!(ty = %program.type_name(*ty), sites = bucket.len(), "bucket");
        for (n, i) in bucket.iter().enumerate() {
            for j in &bucket[n + 1..] {
                let (a, b) = (&sites[*i], &sites[*j]);
                if a.share == ShareMode::Shared && b.share == ShareMode::Shared {
                    continue;
                }
                let fa = program.function_of_value(a.resource);
                let fb = program.function_of_value(b.resource);
                let alias = match (fa, fb) {
                    (Some(fa), Some(fb)) if fa == fb => {
                        oracle.must_alias(fa, a.resource, b.resource)
                    }
                    _ => identities[*i] == identities[*j],
                };
                if alias {
                    groups[*i].insert(*j);
                    groups[*j].insert(*i);
                }
            }
        }
    }
    let groups = AliasGroups { groups };
    tracing::debug!(pairs = groups.pairs(), "grouped lock sites");
    (groups, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{classify::Origin, identity};
    use crate::ir::{ProgramBuilder, Type};

    #[test]
    fn extend_paths() {
        assert_eq!(extend(&[], &[0, 2]), vec![0, 2]);
        assert_eq!(extend(&[0, 2], &[0, 1]), vec![0, 2, 1]);
        assert_eq!(extend(&[0, 2], &[1]), vec![0, 3]);
    }

    #[test]
    fn paths_through_casts_geps_and_slots() {
        let mut b = ProgramBuilder::new();
        let m = b.ty(Type::Named {
            name: "Mutex".to_string(),
        });
        let mp = b.pointer_to(m);
        let s = b.ty(Type::Named {
            name: "S".to_string(),
        });
        let sp = b.pointer_to(s);
        let i8t = b.ty(Type::Int { bits: 8 });
        let i8p = b.pointer_to(i8t);
        let f = b.function("f", &[sp, sp], None);
        let bb = b.block(f);
        let (x, y) = (b.param(f, 0), b.param(f, 1));
        let g1 = b.gep(bb, s, x, &[0, 1], mp);
        let g2 = b.gep(bb, s, x, &[0, 1], mp);
        let g3 = b.gep(bb, s, x, &[0, 2], mp);
        let g4 = b.gep(bb, s, y, &[0, 1], mp);
        let c1 = b.cast(bb, g1, i8p);
        // Single-store slot
        let slot = b.alloca(bb, sp);
        b.store(bb, x, slot);
        let xl = b.load(bb, slot, sp);
        let g5 = b.gep(bb, s, xl, &[0, 1], mp);
        // Two stores
        let slot2 = b.alloca(bb, sp);
        b.store(bb, x, slot2);
        b.store(bb, y, slot2);
        let xl2 = b.load(bb, slot2, sp);
        let g6 = b.gep(bb, s, xl2, &[0, 1], mp);
        b.ret(bb, None);
        let p = b.finish().unwrap();

        let o = PathOracle::new(&p, false);
        assert!(o.must_alias(f, g1, g2));
        assert!(o.must_alias(f, g1, c1));
        assert!(o.must_alias(f, g1, g5));
        assert!(!o.must_alias(f, g1, g3));
        assert!(!o.must_alias(f, g1, g4));
        assert!(!o.must_alias(f, g1, g6));
        assert!(o.must_alias(f, g6, g6));
    }

    fn site(op: u32, resource: ValueId, share: ShareMode, function: FunctionId) -> LockSite {
        LockSite {
            op: OpId(op),
            function,
            guard: resource,
            resource,
            share,
            wrapped: false,
            api: "test".to_string(),
            origin: Origin::Direct,
        }
    }

    #[test]
    fn grouping() {
        let mut b = ProgramBuilder::new();
        let m = b.ty(Type::Named {
            name: "Mutex".to_string(),
        });
        let mp = b.pointer_to(m);
        let s = b.ty(Type::Named {
            name: "S".to_string(),
        });
        let sp = b.pointer_to(s);
        let f = b.function("f", &[sp], None);
        let fb = b.block(f);
        let g = b.function("g", &[sp], None);
        let gb = b.block(g);
        let x = b.param(f, 0);
        let y = b.param(g, 0);
        let fx = b.gep(fb, s, x, &[0, 1], mp);
        let fx2 = b.gep(fb, s, x, &[0, 1], mp);
        let gy = b.gep(gb, s, y, &[0, 1], mp);
        let untyped = b.opaque(None);
        b.ret(fb, None);
        b.ret(gb, None);
        let p = b.finish().unwrap();

        let sites = vec![
            site(0, fx, ShareMode::Exclusive, f),
            site(1, fx2, ShareMode::Shared, f),
            site(2, gy, ShareMode::Shared, g),
            site(3, untyped, ShareMode::Exclusive, f),
        ];
        let ids: Vec<_> = sites
            .iter()
            .map(|s| identity::resolve(&p, s.resource))
            .collect();
        let oracle = PathOracle::new(&p, false);
        let (groups, diags) = group(&p, &sites, &ids, &oracle);

        assert_eq!(groups.group(0), &BTreeSet::from([1, 2]));
        // Shared/shared across functions is excluded
        assert_eq!(groups.group(1), &BTreeSet::from([0]));
        assert_eq!(groups.group(2), &BTreeSet::from([0]));
        assert!(groups.group(3).is_empty());
        assert_eq!(groups.pairs(), 2);
        assert_eq!(
            diags,
            vec![Diagnostic::MissingType {
                op: OpId(3),
                resource: untyped
            }]
        );
        for i in 0..sites.len() {
            for j in groups.group(i) {
                assert!(groups.group(*j).contains(&i));
            }
        }
        let ops = groups.ops(&sites, 0);
        assert_eq!(ops.get(&OpId(2)), Some(&vec![2]));
    }
}
