use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, Encoder, Gauge, IntCounter,
    IntCounterVec, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

// --- Bus Metrics ---

pub static MESSAGES_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "firm_bus_messages_published_total",
        "Messages appended to the bus, by topic",
        &["topic"]
    )
    .expect("messages_published counter")
});

pub static PUBLISH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "firm_bus_publish_failures_total",
        "Fire-and-forget publishes that failed and were dropped"
    )
    .expect("publish_failures counter")
});

pub static MESSAGES_ACKED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "firm_bus_messages_acked_total",
        "Messages acknowledged, by topic and consumer group",
        &["topic", "group"]
    )
    .expect("messages_acked counter")
});

pub static PULL_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "firm_bus_pull_errors_total",
        "Transport failures while pulling from the bus"
    )
    .expect("pull_errors counter")
});

// --- Consumer Metrics ---

pub static MALFORMED_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "firm_consumer_malformed_total",
        "Messages rejected as malformed and acknowledged",
        &["topic"]
    )
    .expect("malformed counter")
});

pub static HANDLER_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "firm_consumer_handler_failures_total",
        "Retryable handler failures",
        &["topic"]
    )
    .expect("handler_failures counter")
});

pub static POISON_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "firm_consumer_poison_dropped_total",
        "Messages dropped after exhausting their delivery budget",
        &["topic"]
    )
    .expect("poison_dropped counter")
});

pub static HANDLER_PANICS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "firm_consumer_handler_panics_total",
        "Handler panics caught at the loop boundary"
    )
    .expect("handler_panics counter")
});

// --- Coordination Metrics ---

pub static NOTIONAL_USD: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "firm_risk_notional_usd",
        "Net notional exposure last observed by the watchdog"
    )
    .expect("notional gauge")
});

pub static HALTS_TRIPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "firm_risk_halts_tripped_total",
        "Times the watchdog raised the halt flag"
    )
    .expect("halts_tripped counter")
});

pub static HOLDS_SET: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("firm_holds_set_total", "Per-ticker holds written")
        .expect("holds_set counter")
});

pub static SIGNALS_EMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("firm_signals_emitted_total", "Trade signals published")
        .expect("signals_emitted counter")
});

pub static SIGNALS_SUPPRESSED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "firm_signals_suppressed_total",
        "Trade signals withheld because the ticker was on hold"
    )
    .expect("signals_suppressed counter")
});

pub fn set_notional(value: Decimal) {
    NOTIONAL_USD.set(value.to_f64().unwrap_or_default());
}

pub fn inc_halts_tripped() {
    HALTS_TRIPPED.inc();
}

pub fn inc_holds_set() {
    HOLDS_SET.inc();
}

pub fn inc_signals_emitted() {
    SIGNALS_EMITTED.inc();
}

pub fn inc_signals_suppressed() {
    SIGNALS_SUPPRESSED.inc();
}

/// Prometheus text exposition of the default registry.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
