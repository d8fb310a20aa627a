// SPDX-License-Identifier: BSD-3-Clause
//! Yet Another Double-Lock detector
//!
//! Finds places where a thread may acquire a lock it already holds. The
//! input is a [`Program`], either loaded from LLVM bitcode (with the `llvm`
//! feature) or deserialized from JSON. Lock APIs and guard-handling APIs are
//! recognized by callee name through [`Patterns`].

use std::path::Path;

use anyhow::{Context, Result};

pub mod analysis;
pub mod ir;
pub mod layers;
pub mod patterns;
pub mod report;

pub use analysis::doublelock::{analysis, analysis_with_oracle, Metrics, Options, Outputs};
pub use analysis::Diagnostic;
pub use ir::{Program, ProgramBuilder};
pub use patterns::{PatternFile, Patterns};
pub use report::DoubleLockReport;

/// Load a program from JSON, or from LLVM bitcode if the path ends in `.bc`.
pub fn load_program(path: &Path) -> Result<Program> {
    if path.extension().is_some_and(|e| e == "bc") {
        return load_bitcode(path);
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Couldn't read program at {}", path.display()))?;
    Program::from_json(&json)
        .with_context(|| format!("Couldn't deserialize program at {}", path.display()))
}

#[cfg(feature = "llvm")]
fn load_bitcode(path: &Path) -> Result<Program> {
    let module = llvm_ir::Module::from_bc_path(path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Couldn't parse LLVM bitcode module at {}", path.display()))?;
    ir::llvm::load(&module).context("Malformed LLVM module")
}

#[cfg(not(feature = "llvm"))]
fn load_bitcode(path: &Path) -> Result<Program> {
    Err(anyhow::anyhow!(
        "Can't load {}: built without the `llvm` feature",
        path.display()
    ))
}

/// The builtin patterns, extended with (or, when `builtin` is false,
/// replaced by) the patterns at `path`.
pub fn load_patterns(path: Option<&Path>, builtin: bool) -> Result<Patterns> {
    let file = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Couldn't read patterns at {}", path.display()))?;
            serde_json::from_str(&json).context("Couldn't deserialize patterns")?
        }
        None => PatternFile::default(),
    };
    if builtin {
        let mut patterns = Patterns::builtin().context("Couldn't construct builtin patterns")?;
        patterns
            .extend(file)
            .context("Couldn't construct patterns")?;
        Ok(patterns)
    } else {
        Patterns::new(file).context("Couldn't construct patterns")
    }
}
