//! Metrics registry for catalog controller observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciliation (duration and errors per resource kind)
//! - Work queues (adds, depth, retries, dropped keys)
//! - Broker calls (count by operation and outcome)

use catalog_osb::BrokerError;
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for catalog metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("service-catalog"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of reconciliation duration
///
/// Labels:
/// - `kind`: broker, class, plan, instance, binding, poll
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("catalog_reconcile_duration_seconds")
        .with_description("Duration of reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `kind`: resource kind
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("catalog_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Queue Metrics
// ============================================================================

/// Counter of keys added to a queue
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_ADDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("catalog_queue_adds_total")
        .with_description("Total number of keys added to work queues")
        .with_unit("{keys}")
        .build()
});

/// Gauge of keys waiting in a queue
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_DEPTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("catalog_queue_depth")
        .with_description("Number of keys waiting in a work queue")
        .with_unit("{keys}")
        .build()
});

/// Counter of rate-limited requeues
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("catalog_queue_retries_total")
        .with_description("Total number of rate-limited requeues")
        .with_unit("{retries}")
        .build()
});

/// Counter of keys dropped after exhausting their retries
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_DROPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("catalog_queue_dropped_total")
        .with_description("Total number of keys dropped after max retries")
        .with_unit("{keys}")
        .build()
});

// ============================================================================
// Broker Call Metrics
// ============================================================================

/// Counter of calls made to brokers
///
/// Labels:
/// - `operation`: catalog, provision, update, deprovision, poll, bind, unbind, get_binding
/// - `outcome`: success, http_error, transport_error
pub static BROKER_CALLS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("catalog_broker_calls_total")
        .with_description("Total number of calls made to service brokers")
        .with_unit("{calls}")
        .build()
});

/// Outcome of a broker call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerCallOutcome {
    /// The broker answered successfully
    Success,
    /// The broker answered with an HTTP error
    HttpError,
    /// The broker could not be reached
    TransportError,
}

impl BrokerCallOutcome {
    /// Classify a broker call result
    pub fn of<T>(result: &Result<T, BrokerError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(BrokerError::Http(_)) => Self::HttpError,
            Err(_) => Self::TransportError,
        }
    }

    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HttpError => "http_error",
            Self::TransportError => "transport_error",
        }
    }
}

/// Record the outcome of a broker call
pub fn record_broker_call<T>(operation: &str, result: &Result<T, BrokerError>) {
    BROKER_CALLS.add(
        1,
        &[
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("outcome", BrokerCallOutcome::of(result).as_str()),
        ],
    );
}

/// Record a key added to a queue
pub fn record_queue_add(queue: &str) {
    QUEUE_ADDS.add(1, &[KeyValue::new("queue", queue.to_string())]);
}

/// Record a rate-limited requeue
pub fn record_queue_retry(queue: &str) {
    QUEUE_RETRIES.add(1, &[KeyValue::new("queue", queue.to_string())]);
}

/// Record a key dropped after its last retry
pub fn record_queue_drop(queue: &str) {
    QUEUE_DROPS.add(1, &[KeyValue::new("queue", queue.to_string())]);
}

/// Update the depth gauge of a queue
pub fn set_queue_depth(queue: &str, depth: usize) {
    QUEUE_DEPTH.record(
        i64::try_from(depth).unwrap_or(i64::MAX),
        &[KeyValue::new("queue", queue.to_string())],
    );
}

/// Times one reconciliation and records its outcome
pub struct ReconcileTimer {
    kind: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation of `kind`
    pub fn start(kind: &'static str) -> Self {
        Self {
            kind,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("error_type", error_type),
            ],
        );
    }
}
