//! Tracing setup and Prometheus metrics for the bot.
//!
//! Two metric families cover every processed event, labelled by `type`
//! (`outgoing_body`, `outgoing_text`, `start_command`):
//! a counter `bot_events_total` and a histogram `bot_event_duration_seconds`.
//! The registry is scraped over plain HTTP at `GET /metrics`.

use std::net::SocketAddr;

use anyhow::Result;
use axum::{Router, http::StatusCode, routing::get};
use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::info;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new("bot_events_total", "Count of processed bot events"),
        &["type"],
    )
    .expect("metric creation failed");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration failed");
    counter
});

pub static EVENT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new("bot_event_duration_seconds", "Event processing duration"),
        &["type"],
    )
    .expect("metric creation failed");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric registration failed");
    histogram
});

/// Installs the fmt subscriber configured from `RUST_LOG`.
pub fn init(service: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();
    info!(service, "telemetry initialised");
}

pub fn inc_event(event_type: &str) {
    EVENTS_TOTAL.with_label_values(&[event_type]).inc();
}

/// Starts a duration observation; call `observe_duration` (or drop the
/// timer) once the event finished.
pub fn time_event(event_type: &str) -> prometheus::HistogramTimer {
    EVENT_DURATION.with_label_values(&[event_type]).start_timer()
}

/// Serves the registry for scrape; runs for the process lifetime.
pub async fn serve_metrics(addr: SocketAddr) -> Result<()> {
    let app = Router::new().route("/metrics", get(render_metrics));
    info!(%addr, "metrics server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn render_metrics() -> Result<String, StatusCode> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(event_type: &str) -> f64 {
        EVENTS_TOTAL.with_label_values(&[event_type]).get()
    }

    #[test]
    fn counter_increments_per_type() {
        let before = counter_value("test_event");
        inc_event("test_event");
        inc_event("test_event");
        assert_eq!(counter_value("test_event"), before + 2.0);
    }

    #[test]
    fn timer_records_an_observation() {
        let timer = time_event("test_timed");
        timer.observe_duration();
        let count = EVENT_DURATION
            .with_label_values(&["test_timed"])
            .get_sample_count();
        assert!(count >= 1);
    }

    #[tokio::test]
    async fn render_exposes_registered_metrics() {
        inc_event("render_check");
        let body = render_metrics().await.unwrap();
        assert!(body.contains("bot_events_total"));
        assert!(body.contains("render_check"));
    }
}
