//! Default route for logs from contracts nobody claimed.

use async_trait::async_trait;
use tracing::info;

use super::{ChainEventHandler, Handled, HandlerContext, HandlerError};
use crate::chain::ChainEventEnvelope;
use crate::storage::UnhandledChainEvent;

/// Records the event in `unhandled_chain_events` so nothing disappears.
pub struct FallbackHandler {
    ctx: HandlerContext,
}

impl FallbackHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChainEventHandler for FallbackHandler {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn handle(&self, event: &ChainEventEnvelope) -> Result<Handled, HandlerError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| HandlerError::Format(format!("re-encoding envelope: {e}")))?;
        let record = UnhandledChainEvent {
            eth_chain_id: event.eth_chain_id(),
            transaction_hash: event.transaction_hash(),
            contract_address: event.contract_address(),
            event_signature: event
                .event_signature()
                .map(str::to_string)
                .or_else(|| event.raw_log.topics.first().cloned()),
            payload,
        };

        if !self.ctx.store.insert_unhandled_event(&record).await? {
            return Ok(Handled::Duplicate);
        }
        info!(
            natural_key = %event.natural_key_string(),
            contract_address = %record.contract_address,
            event_signature = record.event_signature.as_deref().unwrap_or("-"),
            "Unhandled chain event recorded"
        );
        Ok(Handled::Applied)
    }
}
