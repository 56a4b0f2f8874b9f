use once_cell::sync::Lazy;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

// Global registry and metrics are initialized lazily.
static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("dimload".to_string()), None).unwrap_or_default()
});

static RUN_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("run_duration_ms", "Run duration in milliseconds")
        .buckets(vec![10.0, 100.0, 1_000.0, 10_000.0, 60_000.0, 600_000.0, 3_600_000.0]);
    register(HistogramVec::new(opts, &["mode"]))
});

static RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register(CounterVec::new(Opts::new("runs_total", "Finished runs by status"), &["status"]))
});

static TABLE_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register(CounterVec::new(
        Opts::new("table_outcomes_total", "Recorded table outcomes by stage"),
        &["stage"],
    ))
});

static ROWS_LOADED: Lazy<CounterVec> = Lazy::new(|| {
    register(CounterVec::new(
        Opts::new("rows_loaded_total", "Rows written to the target store"),
        &["table"],
    ))
});

fn register<M>(metric: Result<M, prometheus::Error>) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    // Definitions are static; only a malformed name or label set fails here.
    let metric = metric.expect("valid metric definition");
    REGISTRY.register(Box::new(metric.clone())).ok();
    metric
}

/// Observe a run duration in milliseconds.
pub fn observe_run_duration(mode: &str, duration_ms: f64) {
    RUN_DURATION_MS.with_label_values(&[mode]).observe(duration_ms);
}

/// Count a finished run.
pub fn inc_run(status: &str) {
    RUNS.with_label_values(&[status]).inc();
}

/// Count one recorded table outcome.
pub fn inc_table_outcome(stage: &str) {
    TABLE_OUTCOMES.with_label_values(&[stage]).inc();
}

pub fn add_rows_loaded(table: &str, rows: u64) {
    ROWS_LOADED.with_label_values(&[table]).inc_by(rows as f64);
}

/// Gather metrics as text in Prometheus exposition format.
///
/// ```no_run
/// use dimload_core::metrics;
/// metrics::inc_run("succeeded");
/// let body = metrics::gather_text();
/// println!("metrics:\n{}", body);
/// ```
pub fn gather_text() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
