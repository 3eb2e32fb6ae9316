use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_gauge!(
            "chat_connections_active",
            "Number of live WebSocket connections"
        );
        metrics::describe_counter!(
            "chat_messages_relayed_total",
            "Per-connection frame deliveries"
        );
        metrics::describe_counter!(
            "chat_messages_undeliverable_total",
            "Payloads that found no live connection"
        );
        metrics::describe_counter!(
            "chat_connections_reaped_total",
            "Connections closed by the watchdog"
        );
        metrics::describe_counter!(
            "event_deliveries_total",
            "Successful event target deliveries"
        );
        metrics::describe_counter!(
            "event_delivery_failures_total",
            "Failed event target delivery attempts"
        );
        metrics::describe_counter!(
            "event_payloads_dropped_total",
            "Payloads dropped after exhausting every fallback"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for the Prometheus scrape endpoint.
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}
