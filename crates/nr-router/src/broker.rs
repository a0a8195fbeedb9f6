//! Multi-route supervision.
//!
//! [`Broker::run`] starts every registered route with a pool of workers, all
//! sharing one cancellation token. The first worker that fails to start
//! cancels everything and becomes the result of `run`; cancelling the token
//! passed in is a clean shutdown.

use crate::dispatcher::Dispatcher;
use crate::error::BrokerError;
use crate::handler::{Handler, SharedHandler};
use crate::instrument::instrument;
use crate::metrics::BrokerMetrics;
use crate::route::Route;
use futures::future::join_all;
use nr_config::BrokerSettings;
use nr_transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Workers started per route unless configured otherwise
pub const DEFAULT_WORKERS: usize = 5;

/// How long `run` waits for subscriptions to drain after cancellation
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker settings
///
/// The worker count is never zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    workers: usize,
    drain_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl BrokerConfig {
    /// Set the worker count; zero is ignored
    pub fn with_workers(mut self, workers: usize) -> Self {
        if workers > 0 {
            self.workers = workers;
        }
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Workers started per route
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl From<&BrokerSettings> for BrokerConfig {
    fn from(settings: &BrokerSettings) -> Self {
        BrokerConfig::default()
            .with_workers(settings.workers)
            .with_drain_timeout(Duration::from_secs(settings.drain_timeout_secs))
    }
}

/// A route bound to its handler
#[derive(Clone)]
pub struct RouteRegistration {
    route: Arc<Route>,
    handler: SharedHandler,
}

impl RouteRegistration {
    pub fn new<H: Handler>(route: Route, handler: H) -> Self {
        Self {
            route: Arc::new(route),
            handler: Arc::new(handler),
        }
    }

    pub fn from_shared(route: Arc<Route>, handler: SharedHandler) -> Self {
        Self { route, handler }
    }

    /// Builder that reports a missing route or handler as an error
    pub fn builder() -> RouteRegistrationBuilder {
        RouteRegistrationBuilder::default()
    }

    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }
}

impl std::fmt::Debug for RouteRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistration")
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct RouteRegistrationBuilder {
    route: Option<Arc<Route>>,
    handler: Option<SharedHandler>,
}

impl RouteRegistrationBuilder {
    pub fn route(mut self, route: impl Into<Arc<Route>>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn handler<H: Handler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<RouteRegistration, BrokerError> {
        let route = self.route.ok_or(BrokerError::NilRoute)?;
        let handler = self.handler.ok_or(BrokerError::NilHandler)?;
        Ok(RouteRegistration { route, handler })
    }
}

/// Runs routes against a transport
pub struct Broker {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    metrics: Option<BrokerMetrics>,
}

impl Broker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, BrokerConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: BrokerConfig) -> Self {
        Self {
            transport,
            config,
            metrics: None,
        }
    }

    /// Instrument every handler with `metrics`
    pub fn with_metrics(mut self, metrics: BrokerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&BrokerMetrics> {
        self.metrics.as_ref()
    }

    /// Run every registration until `cancel` fires or a worker fails to start.
    ///
    /// Entries that are `None` are rejected before anything starts. After the
    /// routes stop, waits up to the drain timeout for their subscriptions to
    /// drain.
    pub async fn run<I, R>(&self, cancel: CancellationToken, registrations: I) -> Result<(), BrokerError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Option<RouteRegistration>>,
    {
        let registrations: Vec<Option<RouteRegistration>> =
            registrations.into_iter().map(Into::into).collect();
        if registrations.is_empty() {
            return Err(BrokerError::NoRoutes);
        }
        let registrations: Vec<RouteRegistration> = registrations
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(BrokerError::NilRegistration)?;

        let shutdown = cancel.child_token();
        let (err_tx, mut err_rx) = mpsc::channel::<BrokerError>(1);

        info!(
            routes = registrations.len(),
            workers = self.config.workers(),
            "Broker starting"
        );

        let mut supervisors = Vec::with_capacity(registrations.len());
        for registration in registrations {
            let handler = instrument(
                registration.handler.clone(),
                registration.route.subject(),
                self.metrics.as_ref(),
            );
            let supervisor = RouteSupervisor {
                dispatcher: Dispatcher::new(self.transport.clone()),
                route: registration.route,
                handler,
                workers: self.config.workers(),
                shutdown: shutdown.clone(),
                errors: err_tx.clone(),
            };
            supervisors.push(tokio::spawn(supervisor.run()));
        }
        drop(err_tx);

        let result = tokio::select! {
            biased;
            Some(err) = err_rx.recv() => Err(err),
            _ = shutdown.cancelled() => match err_rx.try_recv() {
                Ok(err) => Err(err),
                Err(_) => Ok(()),
            },
        };

        shutdown.cancel();

        if tokio::time::timeout(self.config.drain_timeout(), join_all(supervisors))
            .await
            .is_err()
        {
            warn!(timeout = ?self.config.drain_timeout(), "Routes did not drain in time");
        }

        match &result {
            Ok(()) => info!("Broker stopped"),
            Err(e) => error!(error = %e, "Broker stopped on error"),
        }
        result
    }
}

/// Starts and awaits the workers of one route
struct RouteSupervisor {
    dispatcher: Dispatcher,
    route: Arc<Route>,
    handler: SharedHandler,
    workers: usize,
    shutdown: CancellationToken,
    errors: mpsc::Sender<BrokerError>,
}

impl RouteSupervisor {
    async fn run(self) {
        let workers = (0..self.workers).map(|worker| {
            let span = info_span!("route_worker", subject = %self.route.subject(), worker);
            self.run_worker(worker).instrument(span)
        });
        join_all(workers).await;
        debug!(subject = %self.route.subject(), "Route stopped");
    }

    async fn run_worker(&self, worker: usize) {
        let started = self
            .dispatcher
            .start(self.shutdown.clone(), self.route.clone(), self.handler.clone())
            .await;

        match started {
            Ok(task) => {
                if let Err(e) = task.await {
                    error!(subject = %self.route.subject(), worker, error = %e, "Route worker task aborted");
                }
            }
            Err(e) => {
                error!(subject = %self.route.subject(), worker, error = %e, "route worker failed");
                // First error wins; later ones are dropped
                let _ = self.errors.try_send(BrokerError::Start {
                    subject: self.route.subject().to_string(),
                    source: e,
                });
                self.shutdown.cancel();
            }
        }
    }
}
