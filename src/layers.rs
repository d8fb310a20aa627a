// SPDX-License-Identifier: BSD-3-Clause
//! Tracing layers

use std::time::{Duration, Instant};

use tracing::{Id, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

/// Prints `phase: nanoseconds` to stderr each time a span is exited.
#[derive(Debug, Default)]
pub struct PhaseTimeLayer;

impl<S> Layer<S> for PhaseTimeLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().replace(Instant::now());
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(start) = span.extensions().get::<Instant>() {
                let elapsed: Duration = start.elapsed();
                eprintln!("{}: {}", span.name(), elapsed.as_nanos())
            }
        }
    }
}
