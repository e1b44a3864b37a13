// crates/store/src/metrics.rs
//! Pool-event forwarding. These events are the only observability the
//! gateway owes; everything else is recorded by the orchestrator.

use metrics::counter;

/// Record one client pool event (`connection-created`, `ready`,
/// `checkout-succeeded`, `checkout-failed`, `checked-in`).
pub fn record_pool_event(client: &'static str, event: &'static str) {
    counter!("store_pool_events_total", "client" => client, "event" => event).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_pool_event_without_recorder() {
        // With no global recorder installed this must be a no-op, not a panic.
        record_pool_event("read", "ready");
    }
}
