//! Gateway counters and the Prometheus text endpoint.
//!
//! A [`Metrics`] handle is created once at startup and shared by the
//! listener, the sessions, and the HTTP endpoint. Every update is a single
//! atomic add; rendering loads each counter once.

use std::fmt::Display;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use tracing::info;

use crate::router::Destination;

#[derive(Debug, Default)]
pub struct Metrics {
    active_client_connections: AtomicI64,
    total_queries: AtomicU64,
    primary_queries: AtomicU64,
    replica_queries: AtomicU64,
    errors: AtomicU64,
}

impl Metrics {
    pub fn client_connected(&self) {
        self.active_client_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.active_client_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// One routed `Query` or `Parse`.
    pub fn record_query(&self, dest: Destination) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        match dest {
            Destination::Primary => self.primary_queries.fetch_add(1, Ordering::Relaxed),
            Destination::Replica => self.replica_queries.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_client_connections(&self) -> i64 {
        self.active_client_connections.load(Ordering::Relaxed)
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn primary_queries(&self) -> u64 {
        self.primary_queries.load(Ordering::Relaxed)
    }

    pub fn replica_queries(&self) -> u64 {
        self.replica_queries.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        section(
            &mut out,
            "pggate_active_client_connections",
            "gauge",
            "Current number of active client connections",
            self.active_client_connections(),
        );
        section(
            &mut out,
            "pggate_total_queries_total",
            "counter",
            "Total number of queries handled",
            self.total_queries(),
        );
        section(
            &mut out,
            "pggate_primary_queries_total",
            "counter",
            "Total number of queries routed to the primary",
            self.primary_queries(),
        );
        section(
            &mut out,
            "pggate_replica_queries_total",
            "counter",
            "Total number of queries routed to replicas",
            self.replica_queries(),
        );
        section(
            &mut out,
            "pggate_errors_total",
            "counter",
            "Total number of errors encountered",
            self.errors(),
        );
        out
    }
}

fn section(out: &mut String, name: &str, kind: &str, help: &str, value: impl Display) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
    ));
}

/// Serve `GET /metrics` until the process exits.
pub async fn serve(address: &str, metrics: Arc<Metrics>) -> io::Result<()> {
    let app = axum::Router::new()
        .route("/metrics", get(render))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(%address, "metrics endpoint started");

    axum::serve(listener, app).await
}

async fn render(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_series() {
        let metrics = Metrics::default();
        metrics.client_connected();
        metrics.record_query(Destination::Replica);
        metrics.record_query(Destination::Primary);
        metrics.record_query(Destination::Primary);
        metrics.record_error();

        let text = metrics.render();
        assert!(text.contains("pggate_active_client_connections 1\n"));
        assert!(text.contains("pggate_total_queries_total 3\n"));
        assert!(text.contains("pggate_primary_queries_total 2\n"));
        assert!(text.contains("pggate_replica_queries_total 1\n"));
        assert!(text.contains("pggate_errors_total 1\n"));
        assert!(text.contains("# TYPE pggate_active_client_connections gauge\n"));
    }

    #[test]
    fn gauge_goes_back_down() {
        let metrics = Metrics::default();
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();
        assert_eq!(metrics.active_client_connections(), 1);
    }
}
