use broker::{Delivery, MESSAGE_ID_HEADER};
use outbox::EventEnvelope;
use sha2::{Digest, Sha256};

/// Identifies a delivery for deduplication.
///
/// A producer-supplied `message-id` header wins. Otherwise the id is the
/// hex SHA-256 of `aggregateId|eventType|timestamp`, so every redelivery of
/// the same event maps to the same id.
pub fn message_id(delivery: &Delivery, envelope: &EventEnvelope) -> String {
    match delivery.header(MESSAGE_ID_HEADER) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => derive_message_id(envelope),
    }
}

pub fn derive_message_id(envelope: &EventEnvelope) -> String {
    let key = format!(
        "{}|{}|{}",
        envelope.aggregate_id,
        envelope.event_type,
        envelope.timestamp.to_rfc3339()
    );
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// Ledger entry for a message consumed from `queue`.
///
/// One event fans out to every queue bound to it, and consumers sharing a
/// store must each record it, so entries are scoped by queue.
pub fn ledger_key(queue: &str, message_id: &str) -> String {
    format!("{queue}/{message_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::Headers;
    use chrono::{TimeZone, Utc};

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id("order-1")
            .aggregate_type("Order")
            .event_type(event_type)
            .payload_raw(serde_json::json!({}))
            .timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
            .build()
    }

    fn delivery(headers: Headers) -> Delivery {
        Delivery {
            tag: 1,
            queue: "q".to_string(),
            exchange: "order".to_string(),
            routing_key: "order.created".to_string(),
            payload: Vec::new(),
            headers,
            redelivered: false,
        }
    }

    #[test]
    fn header_wins() {
        let mut headers = Headers::new();
        headers.insert(MESSAGE_ID_HEADER.to_string(), "abc".to_string());
        assert_eq!(message_id(&delivery(headers), &envelope("order.created")), "abc");
    }

    #[test]
    fn derived_id_is_stable_and_distinct() {
        let first = message_id(&delivery(Headers::new()), &envelope("order.created"));
        let again = message_id(&delivery(Headers::new()), &envelope("order.created"));
        let other = message_id(&delivery(Headers::new()), &envelope("order.placed"));

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn empty_header_falls_back_to_derived_id() {
        let mut headers = Headers::new();
        headers.insert(MESSAGE_ID_HEADER.to_string(), String::new());
        assert_eq!(
            message_id(&delivery(headers), &envelope("order.created")),
            derive_message_id(&envelope("order.created"))
        );
    }

    #[test]
    fn ledger_keys_are_scoped_by_queue() {
        assert_eq!(ledger_key("saga.order-events", "abc"), "saga.order-events/abc");
        assert_ne!(ledger_key("a", "m-1"), ledger_key("b", "m-1"));
    }
}
