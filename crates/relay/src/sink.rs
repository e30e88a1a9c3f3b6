use std::sync::Arc;

use broker::{AppendOnlyStream, Broker, BrokerError, Headers};

use crate::SinkDescriptor;

/// The concrete publishers sink descriptors resolve to.
#[derive(Clone)]
pub struct Sinks {
    broker: Arc<dyn Broker>,
    streams: Arc<dyn AppendOnlyStream>,
    stream_maxlen: Option<u64>,
}

impl Sinks {
    pub fn new(
        broker: Arc<dyn Broker>,
        streams: Arc<dyn AppendOnlyStream>,
        stream_maxlen: Option<u64>,
    ) -> Self {
        Self {
            broker,
            streams,
            stream_maxlen,
        }
    }

    /// Sends one encoded event to one sink. Returns once the sink has
    /// confirmed it.
    pub async fn publish(
        &self,
        sink: &SinkDescriptor,
        event_type: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError> {
        match sink {
            SinkDescriptor::Broker {
                exchange,
                routing_key,
            } => {
                let routing_key = routing_key.as_deref().unwrap_or(event_type);
                self.broker
                    .publish(exchange, routing_key, payload, headers)
                    .await
            }
            SinkDescriptor::Stream { stream_key } => self
                .streams
                .append(stream_key, payload, headers, self.stream_maxlen)
                .await
                .map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::{InMemoryBroker, InMemoryStreams, QueueSpec, Topology};

    #[tokio::test]
    async fn broker_routing_key_defaults_to_event_type() {
        let broker = InMemoryBroker::new();
        broker
            .declare(
                &Topology::new()
                    .exchange("order")
                    .queue(QueueSpec::new("q").bind("order", "#")),
            )
            .await
            .unwrap();
        let sinks = Sinks::new(
            Arc::new(broker.clone()),
            Arc::new(InMemoryStreams::new()),
            None,
        );

        sinks
            .publish(
                &SinkDescriptor::broker("order"),
                "order.created",
                b"{}".to_vec(),
                Headers::new(),
            )
            .await
            .unwrap();

        let published = broker.published().await;
        assert_eq!(published[0].routing_key, "order.created");
    }

    #[tokio::test]
    async fn stream_sink_applies_maxlen() {
        let streams = InMemoryStreams::new();
        let sinks = Sinks::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(streams.clone()),
            Some(2),
        );

        for _ in 0..3 {
            sinks
                .publish(
                    &SinkDescriptor::stream("orders"),
                    "order.placed",
                    b"{}".to_vec(),
                    Headers::new(),
                )
                .await
                .unwrap();
        }
        assert_eq!(streams.len("orders").await, 2);
    }
}
