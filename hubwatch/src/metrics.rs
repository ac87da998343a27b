use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref POLLS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_polls_total",
        "Total hub polling attempts"
    ))
    .unwrap();
    pub static ref POLL_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("hubwatch_poll_failures_total", "Failed hub polls by classification"),
        &["kind"]
    )
    .unwrap();
    pub static ref POLLS_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_polls_skipped_total",
        "Hub polls skipped because the access token had expired"
    ))
    .unwrap();
    pub static ref READINGS_INGESTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_readings_ingested_total",
        "Total readings stored"
    ))
    .unwrap();
    pub static ref READINGS_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_readings_skipped_total",
        "Readings dropped as malformed or implausible"
    ))
    .unwrap();
    pub static ref POLL_CYCLE_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "hubwatch_poll_cycle_seconds",
            "Time taken by one full polling cycle"
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
    )
    .unwrap();
    pub static ref TOKEN_REFRESH_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_token_refresh_total",
        "Successful token refreshes"
    ))
    .unwrap();
    pub static ref TOKEN_REFRESH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_token_refresh_failures_total",
        "Failed token refresh attempts"
    ))
    .unwrap();
    pub static ref NEEDS_REAUTH_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_needs_reauth_total",
        "Hubs escalated to needs_reauth"
    ))
    .unwrap();
    pub static ref DIGESTS_SENT_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_digests_sent_total",
        "Digest notifications dispatched"
    ))
    .unwrap();
    pub static ref DIGEST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_digest_failures_total",
        "Digest notifications that failed to render or send"
    ))
    .unwrap();
    pub static ref ROWS_PURGED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_rows_purged_total",
        "Readings and polling log rows deleted by retention"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hubwatch_db_failures_total",
        "Total failed database statements"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(POLLS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(POLL_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POLLS_SKIPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(READINGS_INGESTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(READINGS_SKIPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POLL_CYCLE_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(TOKEN_REFRESH_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(TOKEN_REFRESH_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(NEEDS_REAUTH_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DIGESTS_SENT_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DIGEST_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ROWS_PURGED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
