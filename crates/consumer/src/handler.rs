use std::sync::Arc;

use async_trait::async_trait;
use outbox::EventEnvelope;

use crate::HandlerError;

/// Applies one event. Acknowledgement is left to the consumer wrapper.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        (**self).handle(envelope).await
    }
}
