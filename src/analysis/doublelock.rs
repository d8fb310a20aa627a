// SPDX-License-Identifier: BSD-3-Clause
//! Double-lock analysis driver

use regex::Regex;
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::{
    analysis::{
        alias::{self, AliasGroups, AliasOracle, PathOracle},
        callgraph::CallGraph,
        classify::{self, LockSite, Origin},
        identity::{self, ResourceIdentity},
        lifetime::{self, Lifetime, State},
        tracker::{Outcome, Query},
        Diagnostic,
    },
    ir::{OpId, Program, ValueId, ValueKind},
    patterns::Patterns,
    report::DoubleLockReport,
};

pub const DEFAULT_MAX_STEPS: usize = 1 << 20;

#[derive(Clone, Debug)]
pub struct Options {
    pub debug: bool,
    /// Operations a single reachability query may visit
    pub max_steps: usize,
    pub metrics: bool,
    /// Only lock sites in functions whose names match seed queries
    pub only_functions: Option<Regex>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            debug: false,
            max_steps: DEFAULT_MAX_STEPS,
            metrics: false,
            only_functions: None,
        }
    }
}

/// Counts describing one run of the analysis.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    /// Calls matching a lock pattern
    pub direct_sites: usize,
    /// Calls to functions that return a guard acquired inside them. Each of
    /// these is treated as an acquisition in the caller.
    pub wrapper_sites: usize,
    /// Resolved call edges
    pub callgraph_edges: usize,
    /// Indirect calls that could not be resolved. These are treated as
    /// opaque: a guard passed to one is considered released, and the tracker
    /// does not follow them, so a high count suggests missed reports.
    pub unresolved_calls: usize,
    /// Unordered pairs of lock sites that may hold the same lock
    pub alias_pairs: usize,
    pub queries: usize,
    /// Queries that hit `max_steps`
    pub truncated: usize,
    /// Total operations visited by all queries
    pub steps: usize,
    pub unparseable_sites: usize,
    pub missing_types: usize,
    /// Guards that reach neither a release nor a return. Either the guard is
    /// leaked or a release API is missing from the patterns.
    pub no_release: usize,
}

#[derive(Debug)]
pub struct Outputs {
    /// Direct sites first, then wrapper sites
    pub sites: Vec<LockSite>,
    /// Indexed like `sites`
    pub lifetimes: Vec<Lifetime>,
    /// Indexed like `sites`
    pub identities: Vec<ResourceIdentity>,
    pub groups: AliasGroups,
    pub reports: Vec<DoubleLockReport>,
    pub diagnostics: Vec<Diagnostic>,
    pub metrics: Option<Metrics>,
}

// A lock on a parameter of the wrapper is a lock on the matching argument
fn caller_resource(program: &Program, site: &LockSite, call: OpId) -> ValueId {
    match program.value(program.strip_casts(site.resource)).kind {
        ValueKind::Param { function, index } if function == site.function => program
            .op(call)
            .operands
            .get(index)
            .copied()
            .unwrap_or(site.resource),
        _ => site.resource,
    }
}

/// Run the automaton on every site. A site whose guard (or wrapped result)
/// is returned, directly or through an out-parameter, makes each call to its
/// function an acquisition too; this is repeated until no new sites appear.
#[tracing::instrument(name = "lifetimes", level = "debug", skip_all)]
fn lifetimes(
    program: &Program,
    patterns: &Patterns,
    callgraph: &CallGraph,
    sites: &mut Vec<LockSite>,
) -> Vec<Lifetime> {
    let mut seen: FxHashSet<(OpId, ValueId, bool)> = sites
        .iter()
        .map(|s| (s.op, s.guard, s.wrapped))
        .collect();
    let mut lifetimes = Vec::with_capacity(sites.len());
    let mut i = 0;
    while i < sites.len() {
        let lifetime = lifetime::track(program, patterns, &sites[i]);
        let site = &sites[i];
        // `None` for the return value, `Some(n)` for parameter `n`
        let mut escapes: Vec<(bool, Option<usize>)> = Vec::new();
        if lifetime.returned_result {
            escapes.push((true, None));
        }
        if lifetime.returned_guard {
            escapes.push((false, None));
        }
        for (state, index) in &lifetime.out_params {
            escapes.push((*state == State::WrappedResult, Some(*index)));
        }
        let mut wrappers = Vec::new();
        for (wrapped, slot) in escapes {
            for call in callgraph.call_sites_of(site.function) {
                let o = program.op(*call);
                let guard = match slot {
                    None => o.result,
                    Some(n) => o.operands.get(n).map(|a| program.strip_casts(*a)),
                };
                let Some(guard) = guard else {
                    tracing::debug!(call = %call, "no slot for the returned guard");
                    continue;
                };
                if !seen.insert((*call, guard, wrapped)) {
                    continue;
                }
                wrappers.push(LockSite {
                    op: *call,
                    function: program.function_of_op(*call),
                    guard,
                    resource: caller_resource(program, site, *call),
                    share: site.share,
                    wrapped,
                    api: site.api.clone(),
                    origin: Origin::Wrapper { inner: site.op },
                });
            }
        }
        sites.extend(wrappers);
        lifetimes.push(lifetime);
        i += 1;
    }
    lifetimes
}

#[cfg(feature = "par")]
fn run_queries(query: &Query<'_>, seeds: &[usize]) -> Vec<(usize, Outcome)> {
    let results: dashmap::DashMap<usize, Outcome> = dashmap::DashMap::new();
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let chunk = seeds.len().div_ceil(workers).max(1);
    std::thread::scope(|s| {
        for part in seeds.chunks(chunk) {
            let results = &results;
            s.spawn(move || {
                for i in part {
                    results.insert(*i, query.run(*i));
                }
            });
        }
    });
    let mut outcomes: Vec<(usize, Outcome)> = results.into_iter().collect();
    outcomes.sort_by_key(|(i, _)| *i);
    outcomes
}

#[cfg(not(feature = "par"))]
fn run_queries(query: &Query<'_>, seeds: &[usize]) -> Vec<(usize, Outcome)> {
    seeds.iter().map(|i| (*i, query.run(*i))).collect()
}

/// Everything the reachability queries read: lock sites with their
/// lifetimes, identities and alias groups.
#[derive(Debug)]
pub struct Facts {
    pub callgraph: CallGraph,
    /// Direct sites first, then wrapper sites
    pub sites: Vec<LockSite>,
    /// Number of direct sites at the front of `sites`
    pub direct_sites: usize,
    /// Indexed like `sites`
    pub lifetimes: Vec<Lifetime>,
    /// Indexed like `sites`
    pub identities: Vec<ResourceIdentity>,
    pub groups: AliasGroups,
    pub diagnostics: Vec<Diagnostic>,
}

fn oracle(program: &Program, opts: &Options) -> PathOracle {
    let _span = tracing::debug_span!("oracle").entered();
    PathOracle::new(program, opts.debug)
}

/// Lock sites and alias groups with the default must-alias oracle, without
/// running any query.
pub fn facts(program: &Program, patterns: &Patterns, opts: &Options) -> Facts {
    facts_with_oracle(program, patterns, &oracle(program, opts))
}

pub fn facts_with_oracle(
    program: &Program,
    patterns: &Patterns,
    oracle: &dyn AliasOracle,
) -> Facts {
    let callgraph = CallGraph::new(program);
    let (mut sites, mut diagnostics) = classify::lock_sites(program, patterns);
    let direct_sites = sites.len();
    let lifetimes = lifetimes(program, patterns, &callgraph, &mut sites);
    debug_assert_eq!(sites.len(), lifetimes.len());

    for (site, lifetime) in sites.iter().zip(&lifetimes) {
        if lifetime.kill().is_empty() && !lifetime.escapes() {
            tracing::debug!(site = %site.op, "no release");
            diagnostics.push(Diagnostic::NoRelease { op: site.op });
        }
    }

    let identities: Vec<ResourceIdentity> = sites
        .iter()
        .map(|s| identity::resolve(program, s.resource))
        .collect();
    let (groups, alias_diagnostics) = alias::group(program, &sites, &identities, oracle);
    diagnostics.extend(alias_diagnostics);
    diagnostics.sort();
    diagnostics.dedup();

    Facts {
        callgraph,
        sites,
        direct_sites,
        lifetimes,
        identities,
        groups,
        diagnostics,
    }
}

/// Double-lock analysis with the default must-alias oracle
pub fn analysis(program: &Program, patterns: &Patterns, opts: &Options) -> Outputs {
    analysis_with_oracle(program, patterns, &oracle(program, opts), opts)
}

/// Double-lock analysis
///
/// Sources of unsoundness:
///
/// - Indirect calls that can't be resolved to a function
/// - Lock APIs and guard releases missing from the patterns
/// - Aliasing that isn't visible through casts, GEPs and single-store slots
///
/// Sources of imprecision:
///
/// - Same field of different objects of the same type
/// - Paths that are infeasible because of branch conditions
pub fn analysis_with_oracle(
    program: &Program,
    patterns: &Patterns,
    oracle: &dyn AliasOracle,
    opts: &Options,
) -> Outputs {
    let Facts {
        callgraph,
        sites,
        direct_sites,
        lifetimes,
        identities,
        groups,
        mut diagnostics,
    } = facts_with_oracle(program, patterns, oracle);

    let seeds: Vec<usize> = (0..sites.len())
        .filter(|i| match &opts.only_functions {
            Some(re) => re.is_match(&program.function(sites[*i].function).name),
            None => true,
        })
        .filter(|i| !groups.group(*i).is_empty())
        .collect();
    let query = Query {
        program,
        patterns,
        callgraph: &callgraph,
        sites: &sites,
        lifetimes: &lifetimes,
        groups: &groups,
        max_steps: opts.max_steps,
    };
    let outcomes = {
        let _span = tracing::debug_span!("tracker", queries = seeds.len()).entered();
        run_queries(&query, &seeds)
    };

    let mut reports = Vec::new();
    let mut steps = 0;
    let mut truncated = 0;
    for (i, outcome) in &outcomes {
        steps += outcome.steps;
        if outcome.truncated {
            truncated += 1;
            diagnostics.push(Diagnostic::Truncated {
                op: sites[*i].op,
                steps: outcome.steps,
            });
        }
        for d in &outcome.detections {
            reports.push(DoubleLockReport::new(
                program,
                &sites[*i],
                &sites[d.second],
                d.call_chain.clone(),
                d.call_sites.clone(),
            ));
        }
    }
    reports.sort();
    reports.dedup();
    diagnostics.sort();
    diagnostics.dedup();
    tracing::debug!(reports = reports.len(), "double-lock analysis done");

    let metrics = if opts.metrics {
        let count = |f: fn(&Diagnostic) -> bool| diagnostics.iter().filter(|d| f(d)).count();
        Some(Metrics {
            direct_sites,
            wrapper_sites: sites.len() - direct_sites,
            callgraph_edges: callgraph.edges().len(),
            unresolved_calls: callgraph.unresolved(),
            alias_pairs: groups.pairs(),
            queries: seeds.len(),
            truncated,
            steps,
            unparseable_sites: count(|d| matches!(d, Diagnostic::UnparseableLockSite { .. })),
            missing_types: count(|d| matches!(d, Diagnostic::MissingType { .. })),
            no_release: count(|d| matches!(d, Diagnostic::NoRelease { .. })),
        })
    } else {
        None
    };

    Outputs {
        sites,
        lifetimes,
        identities,
        groups,
        reports,
        diagnostics,
        metrics,
    }
}
