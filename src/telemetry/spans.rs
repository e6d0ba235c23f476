//! Span helpers for dispatched commands and workitem transitions.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;

/// Start the span for one dispatched command, named `message.<Command>`.
///
/// `username` is declared empty and filled once identity is resolved.
pub fn start_message_span(command: &str, id: &str, trace_id: Option<&str>, span_id: Option<&str>) -> Span {
    tracing::info_span!(
        "message",
        otel.name = %format!("message.{command}"),
        command = command,
        id = id,
        "remote.trace_id" = trace_id.unwrap_or_default(),
        "remote.span_id" = span_id.unwrap_or_default(),
        clientid = tracing::field::Empty,
        clientagent = tracing::field::Empty,
        clientversion = tracing::field::Empty,
        username = tracing::field::Empty,
    )
}

/// Record a workitem state transition on the current span and count it.
pub fn record_state_transition(item_id: &str, from: &str, to: &str) {
    tracing::info!(workitem = item_id, from = from, to = to, "state_transition");
    metrics::workitem_state_transitions().add(
        1,
        &[KeyValue::new("from", from.to_string()), KeyValue::new("to", to.to_string())],
    );
}
