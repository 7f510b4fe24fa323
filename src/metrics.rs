use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus exporter and register all application metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // Pre-register counters so they appear even before the first increment.
    counter!("push_messages_total").absolute(0);
    counter!("stale_updates_dropped_total").absolute(0);
    counter!("reconnects_total").absolute(0);
    counter!("poll_failures_total").absolute(0);
    counter!("command_deliveries_total", "result" => "delivered").absolute(0);
    counter!("command_deliveries_total", "result" => "failed").absolute(0);
    counter!("commands_enqueued_total").absolute(0);
    counter!("commands_rejected_total").absolute(0);

    gauge!("agents_tracked").set(0.0);
    gauge!("push_connected").set(0.0);
    gauge!("command_queue_pending").set(0.0);

    Ok(handle)
}
