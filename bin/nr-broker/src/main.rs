//! NatsRoute Broker
//!
//! Runs the routes declared in the configuration file against a NATS server.
//! Each route gets a logging handler; durable stream messages are acked once
//! logged and request/reply routes answer with the default reply.
//!
//! Configuration is read from `config.toml` (or `NATSROUTE_CONFIG`) and
//! `NATSROUTE_*` environment variables. Use `--example-config` to print a
//! starting point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use nr_config::{AppConfig, ConfigLoader, NatsConfig};
use nr_router::{
    handler_fn, Broker, BrokerConfig, BrokerMetrics, Delivery, Route, RouteRegistration, SharedHandler,
};
use nr_transport::{NatsConnectOptions, NatsTransport, Transport};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|arg| arg == "--example-config") {
        println!("{}", AppConfig::example_toml());
        return Ok(());
    }

    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    nr_common::logging::init_logging("nr-broker");

    info!("Starting NatsRoute Broker");

    let config = ConfigLoader::new().load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let registrations = build_registrations(&config)?;
    if registrations.is_empty() {
        warn!("No routes configured - nothing to do");
        return Ok(());
    }

    let metrics = if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .listen
            .parse()
            .with_context(|| format!("Invalid metrics listen address '{}'", config.metrics.listen))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(listen = %addr, "Prometheus exporter listening");
        Some(BrokerMetrics::new())
    } else {
        None
    };

    let nats = NatsTransport::connect(&connect_options(&config.nats))
        .await
        .context("Failed to connect to NATS")?;
    let transport: Arc<dyn Transport> = Arc::new(nats);

    let mut broker = Broker::with_config(transport, BrokerConfig::from(&config.broker));
    if let Some(metrics) = metrics {
        broker = broker.with_metrics(metrics);
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received...");
        signal_cancel.cancel();
    });

    info!(
        routes = registrations.len(),
        workers = broker.config().workers(),
        "Broker running"
    );

    match broker.run(cancel, registrations).await {
        Ok(()) => {
            info!("NatsRoute Broker shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Broker failed");
            Err(e.into())
        }
    }
}

fn connect_options(nats: &NatsConfig) -> NatsConnectOptions {
    NatsConnectOptions {
        url: nats.url.clone(),
        name: nats.name.clone(),
        connect_timeout: Duration::from_secs(nats.connect_timeout_secs),
        reconnect_wait: Duration::from_secs(nats.reconnect_wait_secs),
        max_reconnects: nats.max_reconnects,
    }
}

fn build_registrations(config: &AppConfig) -> Result<Vec<RouteRegistration>> {
    config
        .routes
        .iter()
        .map(|def| {
            let route = Route::from_definition(def)
                .with_context(|| format!("Invalid route '{}' ({})", def.subject, def.pattern))?;
            info!(subject = %route.subject(), pattern = %route.pattern(), "Route configured");
            Ok(RouteRegistration::from_shared(Arc::new(route), logging_handler()))
        })
        .collect()
}

fn logging_handler() -> SharedHandler {
    Arc::new(handler_fn(|delivery: Delivery| async move {
        info!(
            subject = %delivery.subject,
            bytes = delivery.payload.len(),
            num_delivered = ?delivery.num_delivered,
            "Message received"
        );
        Ok(None)
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
