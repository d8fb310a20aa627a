// SPDX-License-Identifier: BSD-3-Clause
use std::fmt;
use std::path::PathBuf;

use yadll::analysis::doublelock::DEFAULT_MAX_STEPS;

#[derive(Clone, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Format {
    Text,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Text => write!(f, "text"),
            Format::Json => write!(f, "json"),
        }
    }
}

/// Double-lock detection for LLVM programs
#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Debug
    #[arg(long)]
    pub debug: bool,

    /// Output format
    #[arg(long, default_value_t = Format::Text)]
    pub format: Format,

    /// Steps per reachability query
    #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
    pub max_steps: usize,

    /// Collect and report metrics
    #[arg(long)]
    pub metrics: bool,

    /// Don't use the builtin lock and API patterns
    #[arg(long)]
    pub no_default_patterns: bool,

    /// Only start from lock sites in functions matching this regex
    #[arg(long)]
    pub only_functions: Option<String>,

    /// Lock and API patterns
    #[arg(short, long)]
    pub patterns: Option<PathBuf>,

    /// Program: JSON, or LLVM bitcode (.bc) when built with `llvm`
    #[arg()]
    pub program: PathBuf,

    /// Quiet
    #[arg(long)]
    pub quiet: bool,

    /// Tracing
    #[arg(long)]
    pub tracing: bool,
}
