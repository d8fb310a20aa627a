// SPDX-License-Identifier: BSD-3-Clause
use std::collections::BTreeSet;

use regex::Regex;

use yadll::analysis::{
    classify::Origin,
    doublelock::{self, Options, Outputs},
    Diagnostic,
};
use yadll::ir::{BlockId, FunctionId, OpId, Program, ProgramBuilder, Type, TypeId, ValueId};
use yadll::patterns::{GuardSlot, LockPattern, PatternFile, Patterns, ShareMode};

// ---------------------------------------------------------
// Helpers

fn lock(name: &str, share: ShareMode) -> LockPattern {
    LockPattern {
        name: name.to_string(),
        pattern: format!("^{}$", name),
        resource: 0,
        guard: GuardSlot::Result,
        share,
        wrapped: false,
    }
}

fn patterns() -> Patterns {
    Patterns::new(PatternFile {
        locks: vec![
            lock("lock", ShareMode::Exclusive),
            lock("read", ShareMode::Shared),
            lock("write", ShareMode::Exclusive),
        ],
        auto_drop: vec!["^drop_in_place$".to_string()],
        manual_drop: vec!["^drop$".to_string()],
        ..PatternFile::default()
    })
    .unwrap()
}

struct Fixture {
    b: ProgramBuilder,
    state: TypeId,
    state_ptr: TypeId,
    mutex_ptr: TypeId,
    guard: TypeId,
    lock: FunctionId,
    read: FunctionId,
    write: FunctionId,
    drop_in_place: FunctionId,
    drop: FunctionId,
}

impl Fixture {
    fn new() -> Self {
        let mut b = ProgramBuilder::new();
        let mutex = b.ty(Type::Named {
            name: "Mutex".to_string(),
        });
        let mutex_ptr = b.pointer_to(mutex);
        let state = b.ty(Type::Struct {
            fields: vec![mutex],
        });
        let state_ptr = b.pointer_to(state);
        let guard = b.ty(Type::Named {
            name: "Guard".to_string(),
        });
        let lock = b.function("lock", &[mutex_ptr], Some(guard));
        let read = b.function("read", &[mutex_ptr], Some(guard));
        let write = b.function("write", &[mutex_ptr], Some(guard));
        let drop_in_place = b.function("drop_in_place", &[guard], None);
        let drop = b.function("drop", &[guard], None);
        Fixture {
            b,
            state,
            state_ptr,
            mutex_ptr,
            guard,
            lock,
            read,
            write,
            drop_in_place,
            drop,
        }
    }

    /// A function of one `State*` parameter, with its entry block
    fn function(&mut self, name: &str) -> (FunctionId, BlockId, ValueId) {
        let f = self.b.function(name, &[self.state_ptr], None);
        let bb = self.b.block(f);
        (f, bb, self.b.param(f, 0))
    }

    /// `&s.lock`
    fn field(&mut self, bb: BlockId, s: ValueId) -> ValueId {
        self.b.gep(bb, self.state, s, &[0, 0], self.mutex_ptr)
    }

    fn acquire(&mut self, bb: BlockId, api: FunctionId, s: ValueId) -> (OpId, ValueId) {
        let m = self.field(bb, s);
        let (op, guard) = self.b.call(bb, api, &[m]);
        (op, guard.unwrap())
    }

    fn release(&mut self, bb: BlockId, guard: ValueId) -> OpId {
        self.b.call(bb, self.drop_in_place, &[guard]).0
    }

    fn finish(self) -> Program {
        self.b.finish().unwrap()
    }
}

fn run(p: &Program) -> Outputs {
    doublelock::analysis(p, &patterns(), &Options::default())
}

/// `f` locks `s.lock` and calls `g`, which locks it again.
fn interprocedural() -> (Program, [OpId; 3], [FunctionId; 2]) {
    let mut fx = Fixture::new();
    let (g, gb, t) = fx.function("g");
    let (f, fb, s) = fx.function("f");
    let (l1, g1) = fx.acquire(fb, fx.lock, s);
    let (c, _) = fx.b.call(fb, g, &[s]);
    fx.release(fb, g1);
    fx.b.ret(fb, None);
    let (l2, g2) = fx.acquire(gb, fx.lock, t);
    fx.release(gb, g2);
    fx.b.ret(gb, None);
    (fx.finish(), [l1, c, l2], [f, g])
}

// ---------------------------------------------------------
// Tests

#[test]
fn same_block() {
    let mut fx = Fixture::new();
    let (f, bb, s) = fx.function("f");
    let (l1, g1) = fx.acquire(bb, fx.lock, s);
    let (l2, g2) = fx.acquire(bb, fx.lock, s);
    fx.release(bb, g2);
    fx.release(bb, g1);
    fx.b.ret(bb, None);
    let p = fx.finish();

    let outs = run(&p);
    assert_eq!(outs.reports.len(), 1);
    let r = &outs.reports[0];
    assert_eq!((r.first.op, r.second.op), (l1, l2));
    assert_eq!(r.call_chain, vec![f]);
    assert!(r.call_sites.is_empty());
    assert!(r.is_local());
    assert!(outs.diagnostics.is_empty());
}

#[test]
fn released_before_reacquired() {
    let mut fx = Fixture::new();
    let (_, bb, s) = fx.function("f");
    let (_, g1) = fx.acquire(bb, fx.lock, s);
    fx.release(bb, g1);
    let (_, g2) = fx.acquire(bb, fx.lock, s);
    fx.b.call(bb, fx.drop, &[g2]);
    fx.b.ret(bb, None);
    let p = fx.finish();

    let outs = run(&p);
    assert!(outs.reports.is_empty());
    assert!(outs.diagnostics.is_empty());
}

#[test]
fn manual_drop_before_reacquired() {
    let mut fx = Fixture::new();
    let (_, bb, s) = fx.function("f");
    let (_, g1) = fx.acquire(bb, fx.lock, s);
    let (d, _) = fx.b.call(bb, fx.drop, &[g1]);
    let (_, g2) = fx.acquire(bb, fx.lock, s);
    fx.release(bb, g2);
    fx.b.ret(bb, None);
    let p = fx.finish();

    let outs = run(&p);
    assert_eq!(outs.lifetimes[0].manual_dropped.iter().collect::<Vec<_>>(), vec![&d]);
    assert!(outs.reports.is_empty());
    assert!(outs.diagnostics.is_empty());
}

#[test]
fn released_on_one_branch() {
    let mut fx = Fixture::new();
    let (f, entry, s) = fx.function("f");
    let released = fx.b.block(f);
    let kept = fx.b.block(f);
    let join = fx.b.block(f);
    let (l1, g1) = fx.acquire(entry, fx.lock, s);
    fx.b.br(entry, &[released, kept]);
    fx.release(released, g1);
    fx.b.br(released, &[join]);
    fx.b.br(kept, &[join]);
    let (l2, g2) = fx.acquire(join, fx.lock, s);
    fx.release(join, g2);
    fx.b.ret(join, None);
    let p = fx.finish();

    let outs = run(&p);
    assert_eq!(outs.reports.len(), 1);
    assert_eq!(
        (outs.reports[0].first.op, outs.reports[0].second.op),
        (l1, l2)
    );
    assert_eq!(outs.reports[0].call_chain, vec![f]);
}

#[test]
fn through_a_call() {
    let (p, [l1, c, l2], [f, g]) = interprocedural();
    let outs = run(&p);
    assert_eq!(outs.reports.len(), 1);
    let r = &outs.reports[0];
    assert_eq!((r.first.op, r.second.op), (l1, l2));
    assert_eq!(r.call_chain, vec![f, g]);
    assert_eq!(r.call_sites, vec![c]);
    assert!(!r.is_local());
}

#[test]
fn callee_with_a_lock_free_branch() {
    let mut fx = Fixture::new();
    let (g, entry, t) = fx.function("g");
    let locking = fx.b.block(g);
    let free = fx.b.block(g);
    let exit = fx.b.block(g);
    fx.b.br(entry, &[locking, free]);
    let (l2, g2) = fx.acquire(locking, fx.lock, t);
    fx.release(locking, g2);
    fx.b.br(locking, &[exit]);
    fx.b.br(free, &[exit]);
    fx.b.ret(exit, None);
    let (f, fb, s) = fx.function("f");
    let (l1, g1) = fx.acquire(fb, fx.lock, s);
    let (c, _) = fx.b.call(fb, g, &[s]);
    let (l3, g3) = fx.acquire(fb, fx.lock, s);
    fx.release(fb, g3);
    fx.release(fb, g1);
    fx.b.ret(fb, None);
    let p = fx.finish();

    let outs = run(&p);
    let found: BTreeSet<_> = outs
        .reports
        .iter()
        .map(|r| (r.first.op, r.second.op, r.call_chain.clone(), r.call_sites.clone()))
        .collect();
    let expected = BTreeSet::from([
        (l1, l2, vec![f, g], vec![c]),
        (l1, l3, vec![f], vec![]),
    ]);
    assert_eq!(found, expected);
}

#[test]
fn facts_without_queries() {
    let (p, [l1, _, l2], _) = interprocedural();
    let facts = doublelock::facts(&p, &patterns(), &Options::default());
    let ops: Vec<_> = facts.sites.iter().map(|s| s.op).collect();
    assert_eq!(ops, vec![l1, l2]);
    assert_eq!(facts.direct_sites, 2);
    assert_eq!(facts.lifetimes.len(), 2);
    assert_eq!(facts.groups.pairs(), 1);
    assert!(facts.diagnostics.is_empty());
}

#[test]
fn shared_acquisitions() {
    let mut fx = Fixture::new();
    let (_, bb, s) = fx.function("readers");
    let (_, g1) = fx.acquire(bb, fx.read, s);
    let (_, g2) = fx.acquire(bb, fx.read, s);
    fx.release(bb, g2);
    fx.release(bb, g1);
    fx.b.ret(bb, None);
    let (_, bb, s) = fx.function("upgrade");
    let (r, g1) = fx.acquire(bb, fx.read, s);
    let (w, g2) = fx.acquire(bb, fx.write, s);
    fx.release(bb, g2);
    fx.release(bb, g1);
    fx.b.ret(bb, None);
    let p = fx.finish();

    let outs = run(&p);
    assert_eq!(outs.reports.len(), 1);
    assert_eq!((outs.reports[0].first.op, outs.reports[0].second.op), (r, w));
    // Symmetric, and no site aliases itself
    for i in 0..outs.sites.len() {
        assert!(!outs.groups.group(i).contains(&i));
        for j in outs.groups.group(i) {
            assert!(outs.groups.group(*j).contains(&i));
        }
    }
}

#[test]
fn guard_returned_by_a_wrapper() {
    let mut fx = Fixture::new();
    let w = fx.b.function("w", &[fx.state_ptr], Some(fx.guard));
    let wb = fx.b.block(w);
    let t = fx.b.param(w, 0);
    let (h, hb, s) = fx.function("h");
    let (lw, gw) = fx.acquire(wb, fx.lock, t);
    fx.b.ret(wb, Some(gw));
    let (cw, g1) = fx.b.call(hb, w, &[s]);
    let (l2, g2) = fx.acquire(hb, fx.lock, s);
    fx.release(hb, g2);
    fx.release(hb, g1.unwrap());
    fx.b.ret(hb, None);
    let p = fx.finish();

    let outs = run(&p);
    let wrappers: Vec<_> = outs
        .sites
        .iter()
        .filter(|s| matches!(s.origin, Origin::Wrapper { .. }))
        .collect();
    assert_eq!(wrappers.len(), 1);
    assert_eq!(wrappers[0].op, cw);
    assert_eq!(outs.reports.len(), 1);
    let r = &outs.reports[0];
    assert_eq!(r.first.op, cw);
    assert_eq!(r.first.origin, Origin::Wrapper { inner: lw });
    assert_eq!(r.second.op, l2);
    assert_eq!(r.call_chain, vec![h]);
    // A returned guard is not a leak
    assert!(outs.lifetimes[0].escapes());
    assert!(outs.diagnostics.is_empty());
}

#[test]
fn guard_returned_through_an_out_parameter() {
    let mut fx = Fixture::new();
    let guard_ptr = fx.b.pointer_to(fx.guard);
    let w = fx.b.function("w", &[guard_ptr, fx.state_ptr], None);
    let wb = fx.b.block(w);
    let (out, t) = (fx.b.param(w, 0), fx.b.param(w, 1));
    let (lw, gw) = fx.acquire(wb, fx.lock, t);
    fx.b.store(wb, gw, out);
    fx.b.ret(wb, None);
    let (h, hb, s) = fx.function("h");
    let slot = fx.b.alloca(hb, fx.guard);
    let (cw, _) = fx.b.call(hb, w, &[slot, s]);
    let (l2, g2) = fx.acquire(hb, fx.lock, s);
    fx.release(hb, g2);
    fx.release(hb, slot);
    fx.b.ret(hb, None);
    let p = fx.finish();

    let outs = run(&p);
    assert!(outs.lifetimes[0].escapes());
    let site = outs.sites.iter().find(|s| s.op == cw).unwrap();
    assert_eq!(site.guard, slot);
    assert_eq!(outs.reports.len(), 1);
    let r = &outs.reports[0];
    assert_eq!((r.first.op, r.second.op), (cw, l2));
    assert_eq!(r.first.origin, Origin::Wrapper { inner: lw });
    assert_eq!(r.call_chain, vec![h]);
    assert!(outs.diagnostics.is_empty());
}

#[test]
fn wrapper_of_a_lock_parameter() {
    let mut fx = Fixture::new();
    let w = fx.b.function("w", &[fx.mutex_ptr], Some(fx.guard));
    let wb = fx.b.block(w);
    let m = fx.b.param(w, 0);
    let (_, gw) = fx.b.call(wb, fx.lock, &[m]);
    fx.b.ret(wb, gw);
    let (_, hb, s) = fx.function("h");
    let m1 = fx.field(hb, s);
    let (cw, g1) = fx.b.call(hb, w, &[m1]);
    let (l2, g2) = fx.acquire(hb, fx.lock, s);
    fx.release(hb, g2);
    fx.release(hb, g1.unwrap());
    fx.b.ret(hb, None);
    let p = fx.finish();

    let outs = run(&p);
    let site = outs.sites.iter().find(|s| s.op == cw).unwrap();
    assert_eq!(site.resource, m1);
    assert_eq!(outs.reports.len(), 1);
    assert_eq!(
        (outs.reports[0].first.op, outs.reports[0].second.op),
        (cw, l2)
    );
}

#[test]
fn loop_with_release() {
    let mut fx = Fixture::new();
    let (f, entry, s) = fx.function("f");
    let body = fx.b.block(f);
    let exit = fx.b.block(f);
    fx.b.br(entry, &[body]);
    let (_, g) = fx.acquire(body, fx.lock, s);
    fx.release(body, g);
    fx.b.br(body, &[body, exit]);
    fx.b.ret(exit, None);
    let p = fx.finish();

    let outs = run(&p);
    assert!(outs.reports.is_empty());
    assert!(outs.diagnostics.is_empty());
}

#[test]
fn mutual_recursion() {
    let mut fx = Fixture::new();
    let (g, gb, t) = fx.function("g");
    let (f, entry, s) = fx.function("f");
    let body = fx.b.block(f);
    let exit = fx.b.block(f);
    let (l1, g1) = fx.acquire(entry, fx.lock, s);
    fx.b.br(entry, &[body]);
    let (c, _) = fx.b.call(body, g, &[s]);
    fx.b.br(body, &[body, exit]);
    fx.release(exit, g1);
    fx.b.ret(exit, None);
    fx.b.call(gb, f, &[t]);
    let (l2, g2) = fx.acquire(gb, fx.lock, t);
    fx.release(gb, g2);
    fx.b.ret(gb, None);
    let p = fx.finish();

    let outs = doublelock::analysis(
        &p,
        &patterns(),
        &Options {
            metrics: true,
            ..Options::default()
        },
    );
    assert_eq!(outs.reports.len(), 1);
    let r = &outs.reports[0];
    assert_eq!((r.first.op, r.second.op), (l1, l2));
    assert_eq!(r.call_chain, vec![f, g]);
    assert_eq!(r.call_sites, vec![c]);
    let m = outs.metrics.unwrap();
    assert_eq!(m.direct_sites, 2);
    assert_eq!(m.wrapper_sites, 0);
    assert_eq!(m.callgraph_edges, 6);
    assert_eq!(m.alias_pairs, 1);
    assert_eq!(m.queries, 2);
    assert_eq!(m.truncated, 0);
}

#[test]
fn guard_passed_to_unknown_code() {
    let mut fx = Fixture::new();
    let (_, bb, s) = fx.function("f");
    let callback = fx.b.opaque(None);
    let (_, g1) = fx.acquire(bb, fx.lock, s);
    fx.b.call_indirect(bb, callback, &[g1], None);
    let (_, g2) = fx.acquire(bb, fx.lock, s);
    fx.release(bb, g2);
    fx.b.ret(bb, None);
    let p = fx.finish();

    let outs = doublelock::analysis(
        &p,
        &patterns(),
        &Options {
            metrics: true,
            ..Options::default()
        },
    );
    assert!(outs.reports.is_empty());
    assert_eq!(outs.lifetimes[0].moved_to_opaque_call.len(), 1);
    assert_eq!(outs.metrics.unwrap().unresolved_calls, 1);
}

#[test]
fn truncated() {
    let (p, [l1, _, _], _) = interprocedural();
    let outs = doublelock::analysis(
        &p,
        &patterns(),
        &Options {
            max_steps: 2,
            ..Options::default()
        },
    );
    assert!(outs.reports.is_empty());
    assert_eq!(
        outs.diagnostics,
        vec![Diagnostic::Truncated { op: l1, steps: 3 }]
    );
}

#[test]
fn only_functions() {
    let (p, _, _) = interprocedural();
    let only = |re: &str| Options {
        only_functions: Some(Regex::new(re).unwrap()),
        ..Options::default()
    };
    let outs = doublelock::analysis(&p, &patterns(), &only("^g$"));
    assert!(outs.reports.is_empty());
    let outs = doublelock::analysis(&p, &patterns(), &only("^f$"));
    assert_eq!(outs.reports.len(), 1);
}

#[test]
fn problems_are_reported_and_skipped() {
    let mut fx = Fixture::new();
    let (_, bb, s) = fx.function("f");
    let untyped = fx.b.opaque(None);
    let (untyped_lock, g0) = fx.b.call(bb, fx.lock, &[untyped]);
    fx.release(bb, g0.unwrap());
    let (leak, _) = fx.acquire(bb, fx.lock, s);
    let (l2, g2) = fx.acquire(bb, fx.lock, s);
    fx.release(bb, g2);
    fx.b.ret(bb, None);
    let p = fx.finish();

    let outs = run(&p);
    assert_eq!(outs.reports.len(), 1);
    assert_eq!(
        (outs.reports[0].first.op, outs.reports[0].second.op),
        (leak, l2)
    );
    assert_eq!(
        outs.diagnostics,
        vec![
            Diagnostic::MissingType {
                op: untyped_lock,
                resource: untyped
            },
            Diagnostic::NoRelease { op: leak },
        ]
    );
}

#[test]
fn deterministic() {
    let (p, _, _) = interprocedural();
    let a = run(&p);
    let b = run(&p);
    assert_eq!(a.reports, b.reports);
    assert_eq!(a.diagnostics, b.diagnostics);
    assert_eq!(
        serde_json::to_string(&a.reports).unwrap(),
        serde_json::to_string(&b.reports).unwrap()
    );
}

#[test]
fn json_program() {
    let (p, _, _) = interprocedural();
    let q = Program::from_json(&p.to_json().unwrap()).unwrap();
    assert_eq!(run(&p).reports, run(&q).reports);
}

#[test]
fn std_mutex() {
    let mut b = ProgramBuilder::new();
    let mutex = b.ty(Type::Named {
        name: "std::sync::mutex::Mutex<i32>".to_string(),
    });
    let mutex_ptr = b.pointer_to(mutex);
    let state = b.ty(Type::Struct {
        fields: vec![mutex],
    });
    let state_ptr = b.pointer_to(state);
    let lock_result = b.ty(Type::Named {
        name: "std::sync::poison::LockResult<MutexGuard<i32>>".to_string(),
    });
    let lock_result_ptr = b.pointer_to(lock_result);
    let guard = b.ty(Type::Named {
        name: "std::sync::mutex::MutexGuard<i32>".to_string(),
    });
    let guard_ptr = b.pointer_to(guard);
    let lock = b.function(
        "_ZN3std4sync5mutex14Mutex$LT$T$GT$4lock17h0123456789abcdefE",
        &[lock_result_ptr, mutex_ptr],
        None,
    );
    let unwrap = b.function(
        "_ZN4core6result19Result$LT$T$C$E$GT$6unwrap17h0123456789abcdefE",
        &[lock_result_ptr],
        Some(guard),
    );
    let drop_in_place = b.function(
        "_ZN4core3ptr78drop_in_place$LT$std..sync..mutex..MutexGuard$LT$i32$GT$$GT$17h0123456789abcdefE",
        &[guard_ptr],
        None,
    );
    let f = b.function("_ZN4demo3bump17h0123456789abcdefE", &[state_ptr], None);
    let bb = b.block(f);
    let s = b.param(f, 0);

    let acquire = |b: &mut ProgramBuilder| {
        let m = b.gep(bb, state, s, &[0, 0], mutex_ptr);
        let out = b.alloca(bb, lock_result);
        let (l, _) = b.call(bb, lock, &[out, m]);
        let (_, g) = b.call(bb, unwrap, &[out]);
        let slot = b.alloca(bb, guard);
        b.store(bb, g.unwrap(), slot);
        (l, slot)
    };
    let (l1, slot1) = acquire(&mut b);
    let (l2, slot2) = acquire(&mut b);
    let (d2, _) = b.call(bb, drop_in_place, &[slot2]);
    let (d1, _) = b.call(bb, drop_in_place, &[slot1]);
    b.ret(bb, None);
    let p = b.finish().unwrap();

    let outs = doublelock::analysis(&p, &Patterns::builtin().unwrap(), &Options::default());
    assert_eq!(outs.sites.len(), 2);
    assert_eq!(outs.lifetimes[0].kill().into_iter().collect::<Vec<_>>(), vec![d1]);
    assert_eq!(outs.lifetimes[1].kill().into_iter().collect::<Vec<_>>(), vec![d2]);
    assert_eq!(outs.reports.len(), 1);
    assert_eq!(
        (outs.reports[0].first.op, outs.reports[0].second.op),
        (l1, l2)
    );
    assert_eq!(outs.reports[0].first.api, "std::sync::Mutex::lock");
    assert!(outs.diagnostics.is_empty());
}
