use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the proxy emits. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "mnemo_cache_hit_total",
            Unit::Count,
            "Requests answered from a stored response."
        );
        describe_counter!(
            "mnemo_cache_miss_total",
            Unit::Count,
            "Requests that became the owner of their key and fetched upstream."
        );
        describe_counter!(
            "mnemo_cache_wait_total",
            Unit::Count,
            "Requests that waited on another request's in-flight fetch."
        );
        describe_counter!(
            "mnemo_cache_wait_timeout_total",
            Unit::Count,
            "Waiting requests that gave up before a response was stored."
        );
        describe_counter!(
            "mnemo_upstream_failure_total",
            Unit::Count,
            "Owner fetches that failed before or while streaming the upstream body."
        );
        describe_counter!(
            "mnemo_cache_reclaim_total",
            Unit::Count,
            "Stale request records taken over after their owner lease expired."
        );
        describe_histogram!(
            "mnemo_cache_wait_ms",
            Unit::Milliseconds,
            "Time waiting requests spent blocked on an in-flight fetch."
        );
    });
}
