//! Metric instrument factories for flowgate.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"flowgate"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for flowgate instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("flowgate")
}

/// Counter: dispatched commands.
/// Labels: `command`, `result` ("ok" | "error" | "offloaded" | "unknown").
pub fn commands() -> Counter<u64> {
    meter()
        .u64_counter("flowgate.commands")
        .with_description("Number of dispatched commands")
        .build()
}

/// Histogram: command handling time in milliseconds.
/// Labels: `command`.
pub fn command_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("flowgate.command.duration_ms")
        .with_description("Command handling duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: workitem state transitions.
/// Labels: `from`, `to`.
pub fn workitem_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("flowgate.workitem.state_transitions")
        .with_description("Number of workitem state transitions")
        .build()
}

/// Counter: claim attempts lost to a concurrent popper.
/// Labels: `queue`.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("flowgate.workitem.claim_conflicts")
        .with_description("Conditional claim updates that matched no row")
        .build()
}

/// Counter: queue-level operations (add, pop, purge, route, send, receive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("flowgate.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: requests refused by admission control.
/// Labels: `command`.
pub fn rate_limited() -> Counter<u64> {
    meter()
        .u64_counter("flowgate.rate_limited")
        .with_description("Requests rejected by per-connection rate limiting")
        .build()
}
