// SPDX-License-Identifier: BSD-3-Clause
//! The double-lock analysis, leaves first:
//!
//! - [`classify`] recognizes lock acquisitions.
//! - [`lifetime`] follows each guard to the operations that release it.
//! - [`identity`] and [`alias`] decide which lock sites may share a lock.
//! - [`tracker`] searches for a second acquisition before the release.
//! - [`doublelock`] runs the above and collects reports.

use serde::Serialize;

use crate::ir::{OpId, ValueId};

pub mod alias;
pub mod callgraph;
pub mod classify;
pub mod doublelock;
pub mod identity;
pub mod lifetime;
pub mod tracker;

/// Recoverable problems. None of these stop the analysis of other sites.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Diagnostic {
    /// A call matched a lock pattern but its shape did not
    UnparseableLockSite {
        op: OpId,
        pattern: String,
        reason: String,
    },
    /// The resource of a lock site has no static type
    MissingType { op: OpId, resource: ValueId },
    /// A reachability query ran out of steps
    Truncated { op: OpId, steps: usize },
    /// A guard never reaches a release or a return
    NoRelease { op: OpId },
}

impl Diagnostic {
    pub fn op(&self) -> OpId {
        match self {
            Diagnostic::UnparseableLockSite { op, .. }
            | Diagnostic::MissingType { op, .. }
            | Diagnostic::Truncated { op, .. }
            | Diagnostic::NoRelease { op } => *op,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UnparseableLockSite {
                op,
                pattern,
                reason,
            } => write!(f, "{}: could not parse lock site ({}): {}", op, pattern, reason),
            Diagnostic::MissingType { op, resource } => {
                write!(f, "{}: no type for lock resource {}", op, resource)
            }
            Diagnostic::Truncated { op, steps } => {
                write!(f, "{}: analysis truncated after {} steps", op, steps)
            }
            Diagnostic::NoRelease { op } => write!(f, "{}: no release found for guard", op),
        }
    }
}
