// SPDX-License-Identifier: BSD-3-Clause
//! Double-lock reports and their rendering.
//!
//! [`DoubleLockReport`] is what the analysis produces. For output it is turned
//! into a [`ReportContent`], which carries the bug kind, a possibility, a
//! diagnosis with the two locks' types and locations and the call chain
//! between them, and an explanation.

use std::fmt::Write;

use serde::Serialize;

use crate::{
    analysis::classify::{LockSite, Origin},
    ir::{DebugLoc, FunctionId, OpId, Program},
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DoubleLockReport {
    pub first: LockSite,
    pub second: LockSite,
    /// From `first.function` to `second.function`
    pub call_chain: Vec<FunctionId>,
    /// One call per consecutive pair in `call_chain`
    pub call_sites: Vec<OpId>,
    /// Debug locations of `first` and `second`
    pub locations: [Option<DebugLoc>; 2],
}

impl DoubleLockReport {
    pub fn new(
        program: &Program,
        first: &LockSite,
        second: &LockSite,
        call_chain: Vec<FunctionId>,
        call_sites: Vec<OpId>,
    ) -> Self {
        debug_assert_eq!(call_chain.len(), call_sites.len() + 1);
        DoubleLockReport {
            first: first.clone(),
            second: second.clone(),
            call_chain,
            call_sites,
            locations: [
                program.debug_loc(first.op).cloned(),
                program.debug_loc(second.op).cloned(),
            ],
        }
    }

    /// Whether both acquisitions are in one function
    pub fn is_local(&self) -> bool {
        self.call_chain.len() == 1
    }
}

#[derive(Debug, Serialize)]
pub struct ReportContent<D> {
    pub bug_kind: String,
    pub possibility: String,
    pub diagnosis: D,
    pub explanation: String,
}

impl<D: std::fmt::Debug> ReportContent<D> {
    pub fn new(bug_kind: String, possibility: String, diagnosis: D, explanation: String) -> Self {
        Self {
            bug_kind,
            possibility,
            diagnosis,
            explanation,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LockDescription {
    pub function: String,
    pub api: String,
    /// Type of the lock
    pub lock_type: String,
    /// Source location, or the operation when there is no debug info
    pub location: String,
    /// For a call to a guard-returning function, the acquisition inside it
    pub wrapped_op: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DoubleLockDiagnosis {
    pub first: LockDescription,
    pub second: LockDescription,
    /// `function (location of the call to the next function)`, outermost
    /// first
    pub callchain: Vec<String>,
}

fn location(program: &Program, op: OpId) -> String {
    match program.debug_loc(op) {
        Some(loc) => loc.to_string(),
        None => format!("{} in {}", op, program.function(program.function_of_op(op)).name),
    }
}

fn describe(program: &Program, site: &LockSite) -> LockDescription {
    LockDescription {
        function: program.function(site.function).name.clone(),
        api: site.api.clone(),
        lock_type: match program.value(site.resource).ty {
            Some(t) => program.type_name(t),
            None => "?".to_string(),
        },
        location: location(program, site.op),
        wrapped_op: match site.origin {
            Origin::Direct => None,
            Origin::Wrapper { inner } => Some(location(program, inner)),
        },
    }
}

pub fn to_content(
    program: &Program,
    report: &DoubleLockReport,
) -> ReportContent<DoubleLockDiagnosis> {
    let mut callchain = Vec::with_capacity(report.call_chain.len());
    for (n, f) in report.call_chain.iter().enumerate() {
        let name = &program.function(*f).name;
        match report.call_sites.get(n) {
            Some(call) => callchain.push(format!("{} ({})", name, location(program, *call))),
            None => callchain.push(name.clone()),
        }
    }
    let possibility = if report.is_local() {
        "Probably"
    } else {
        "Possibly"
    };
    ReportContent::new(
        "DoubleLock".to_string(),
        possibility.to_string(),
        DoubleLockDiagnosis {
            first: describe(program, &report.first),
            second: describe(program, &report.second),
            callchain,
        },
        "The first lock is not released when the second lock is acquired".to_string(),
    )
}

fn write_lock(out: &mut impl Write, program: &Program, site: &LockSite) -> std::fmt::Result {
    let d = describe(program, site);
    writeln!(out, "{}", d.function)?;
    writeln!(out, "  {}", d.location)?;
    write!(out, "  {} on {}", d.api, d.lock_type)?;
    if let Some(inner) = d.wrapped_op {
        write!(out, " (acquired at {})", inner)?;
    }
    writeln!(out)
}

fn write_report(
    out: &mut impl Write,
    program: &Program,
    report: &DoubleLockReport,
) -> std::fmt::Result {
    writeln!(out, "Double Lock Happens! First Lock:")?;
    write_lock(out, program, &report.first)?;
    writeln!(out, "Second Lock(s):")?;
    write_lock(out, program, &report.second)?;
    if !report.is_local() {
        writeln!(out, "Call chain:")?;
        for (f, call) in report.call_chain.iter().zip(&report.call_sites) {
            writeln!(
                out,
                "  {}: {}",
                program.function(*f).name,
                location(program, *call)
            )?;
        }
        if let Some(last) = report.call_chain.last() {
            writeln!(out, "  {}", program.function(*last).name)?;
        }
    }
    Ok(())
}

/// Human-readable form of a report, ending in a newline.
pub fn render_text(
    program: &Program,
    report: &DoubleLockReport,
) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    write_report(&mut out, program, report)?;
    Ok(out)
}
