//! Handler instrumentation decorator.

use crate::handler::{Delivery, Handler, HandlerResult, SharedHandler};
use crate::metrics::BrokerMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Wrap `handler` so every invocation is counted under `subject`.
///
/// Without a metrics sink the handler is returned as is. An invocation that
/// never returns, because it panicked or was dropped by a timeout, counts as
/// an error.
pub fn instrument(handler: SharedHandler, subject: &str, metrics: Option<&BrokerMetrics>) -> SharedHandler {
    match metrics {
        None => handler,
        Some(metrics) => Arc::new(InstrumentedHandler {
            inner: handler,
            subject: subject.to_string(),
            metrics: metrics.clone(),
        }),
    }
}

struct InstrumentedHandler {
    inner: SharedHandler,
    subject: String,
    metrics: BrokerMetrics,
}

#[async_trait]
impl Handler for InstrumentedHandler {
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        let _inflight = self.metrics.start(&self.subject);
        let mut invocation = Invocation {
            metrics: &self.metrics,
            subject: &self.subject,
            start: Instant::now(),
            recorded: false,
        };

        let result = self.inner.handle(delivery).await;
        invocation.finish(result.is_ok());
        result
    }
}

/// Records the outcome of one invocation exactly once
struct Invocation<'a> {
    metrics: &'a BrokerMetrics,
    subject: &'a str,
    start: Instant,
    recorded: bool,
}

impl Invocation<'_> {
    fn finish(&mut self, success: bool) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        if success {
            self.metrics.record_success(self.subject, self.start.elapsed());
        } else {
            self.metrics.record_error(self.subject, self.start.elapsed());
        }
    }
}

impl Drop for Invocation<'_> {
    fn drop(&mut self) {
        // Unwound or cancelled before the handler returned
        self.finish(false);
    }
}
