// SPDX-License-Identifier: BSD-3-Clause
use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;

use tracing_flame::FlameLayer;
use tracing_subscriber::{fmt, prelude::*};

use yadll::analysis::doublelock;
use yadll::{layers, report};

mod cli;

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
        .with(layers::PhaseTimeLayer)
        .init();
    Ok(guard)
}

fn main() -> Result<()> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let args = cli::Args::parse();

    let _guard = if args.tracing {
        Some(setup_global_subscriber()?)
    } else {
        None
    };

    let patterns = yadll::load_patterns(args.patterns.as_deref(), !args.no_default_patterns)?;
    let program = yadll::load_program(&args.program)?;

    let only_functions = match &args.only_functions {
        Some(re) => Some(Regex::new(re).context("Invalid --only-functions regex")?),
        None => None,
    };
    let opts = doublelock::Options {
        debug: args.debug,
        max_steps: args.max_steps,
        metrics: args.metrics,
        only_functions,
    };
    let outs = doublelock::analysis(&program, &patterns, &opts);

    if !args.quiet {
        let mut stdout = io::stdout().lock();
        match args.format {
            cli::Format::Text => {
                for r in &outs.reports {
                    writeln!(
                        stdout,
                        "{}",
                        report::render_text(&program, r).context("Couldn't render report")?
                    )?;
                }
                if !outs.diagnostics.is_empty() {
                    writeln!(stdout, "diagnostics")?;
                    writeln!(stdout, "-----------")?;
                    for d in &outs.diagnostics {
                        writeln!(stdout, "{}", d)?;
                    }
                }
            }
            cli::Format::Json => {
                let contents: Vec<_> = outs
                    .reports
                    .iter()
                    .map(|r| report::to_content(&program, r))
                    .collect();
                let json = serde_json::json!({
                    "reports": contents,
                    "diagnostics": outs.diagnostics,
                    "metrics": outs.metrics,
                });
                serde_json::to_writer_pretty(&mut stdout, &json)
                    .context("Couldn't serialize reports")?;
                writeln!(stdout)?;
            }
        }
    }

    if args.metrics && args.format == cli::Format::Text {
        let mut stdout = io::stdout().lock();
        if let Some(m) = outs.metrics {
            writeln!(stdout)?;
            writeln!(stdout, "metrics")?;
            writeln!(stdout, "-------")?;
            writeln!(stdout, "direct lock sites: {}", m.direct_sites)?;
            writeln!(stdout, "wrapper lock sites: {}", m.wrapper_sites)?;
            writeln!(stdout, "callgraph edges: {}", m.callgraph_edges)?;
            writeln!(stdout, "unresolved calls: {}", m.unresolved_calls)?;
            writeln!(stdout, "alias pairs: {}", m.alias_pairs)?;
            writeln!(stdout, "queries: {}", m.queries)?;
            writeln!(stdout, "truncated queries: {}", m.truncated)?;
            writeln!(stdout, "steps: {}", m.steps)?;
            writeln!(stdout, "unparseable lock sites: {}", m.unparseable_sites)?;
            writeln!(stdout, "missing types: {}", m.missing_types)?;
            writeln!(stdout, "no release: {}", m.no_release)?;
        }
    }

    Ok(())
}
