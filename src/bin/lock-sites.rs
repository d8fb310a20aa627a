// SPDX-License-Identifier: BSD-3-Clause
use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;

use tracing_flame::FlameLayer;
use tracing_subscriber::{fmt, prelude::*};

use yadll::analysis::{classify::Origin, doublelock, identity::ResourceIdentity};

/// List the lock sites of a program with their kill sets and alias groups
#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Debug
    #[arg(long)]
    pub debug: bool,

    /// Don't use the builtin lock and API patterns
    #[arg(long)]
    pub no_default_patterns: bool,

    /// Lock and API patterns
    #[arg(short, long)]
    pub patterns: Option<std::path::PathBuf>,

    /// Program: JSON, or LLVM bitcode (.bc) when built with `llvm`
    #[arg()]
    pub program: std::path::PathBuf,

    /// Tracing
    #[arg(long)]
    pub tracing: bool,
}

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn setup_global_subscriber() -> Result<impl Drop> {
    let filter_layer = tracing::level_filters::LevelFilter::TRACE;
    let fmt_layer = fmt::Layer::default().with_writer(io::stderr);
    let (flame_layer, guard) =
        FlameLayer::with_file("./tracing.folded").context("Couldn't create ./tracing.folded")?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(flame_layer)
        .with(yadll::layers::PhaseTimeLayer)
        .init();
    Ok(guard)
}

fn main() -> Result<()> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let args = Args::parse();

    let _guard = if args.tracing {
        Some(setup_global_subscriber()?)
    } else {
        None
    };

    let patterns = yadll::load_patterns(args.patterns.as_deref(), !args.no_default_patterns)?;
    let program = yadll::load_program(&args.program)?;
    let opts = doublelock::Options {
        debug: args.debug,
        ..doublelock::Options::default()
    };
    let outs = doublelock::facts(&program, &patterns, &opts);

    let mut stdout = io::stdout().lock();
    for (i, site) in outs.sites.iter().enumerate() {
        let lifetime = &outs.lifetimes[i];
        let function = &program.function(site.function).name;
        write!(
            stdout,
            "#{} {} in {}: {} {}",
            i, site.op, function, site.api, site.share
        )?;
        if let Origin::Wrapper { inner } = site.origin {
            write!(stdout, " (wraps {})", inner)?;
        }
        writeln!(stdout)?;
        if let Some(loc) = program.debug_loc(site.op) {
            writeln!(stdout, "  at: {}", loc)?;
        }
        match &outs.identities[i] {
            ResourceIdentity::Direct { value } => {
                writeln!(stdout, "  lock: {}", program.value_name(*value))?
            }
            ResourceIdentity::Field { ty, path, base } => writeln!(
                stdout,
                "  lock: {}.{:?} of {}",
                program.type_name(*ty),
                path,
                program.value_name(*base)
            )?,
        }
        let kill: Vec<String> = lifetime.kill().iter().map(|op| op.to_string()).collect();
        writeln!(stdout, "  kill: [{}]", kill.join(", "))?;
        if lifetime.escapes() {
            writeln!(stdout, "  returned to callers")?;
        }
        let group: Vec<String> = outs
            .groups
            .group(i)
            .iter()
            .map(|j| format!("#{}", j))
            .collect();
        writeln!(stdout, "  aliases: [{}]", group.join(", "))?;
    }
    if !outs.diagnostics.is_empty() {
        writeln!(stdout)?;
        writeln!(stdout, "diagnostics")?;
        writeln!(stdout, "-----------")?;
        for d in &outs.diagnostics {
            writeln!(stdout, "{}", d)?;
        }
    }
    Ok(())
}
