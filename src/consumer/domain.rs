//! Domain event consumer.

use async_trait::async_trait;
use tracing::{error, info};

use crate::bus::format::{DomainEventFormat, MsgFormat};
use crate::bus::{BrokerMessage, MessageHandler, Outcome};

/// Acknowledges platform domain events once they pass their format contract.
///
/// Downstream platform services own the reactions; this consumer keeps the
/// stream drained and dead-letters anything malformed.
#[derive(Debug, Default)]
pub struct DomainEventConsumer;

#[async_trait]
impl MessageHandler for DomainEventConsumer {
    async fn handle(&self, message: &BrokerMessage) -> Outcome {
        match DomainEventFormat::check_msg_format(&message.event_payload) {
            Ok(fields) => {
                info!(
                    event_name = %message.event_name,
                    fields = fields.len(),
                    redelivery_count = message.delivery.redelivery_count,
                    "Domain event received"
                );
                Outcome::Ack
            }
            Err(e) => {
                error!(
                    event_name = %message.event_name,
                    reason = %e.reason,
                    payload = %e.payload,
                    "Domain event failed format contract"
                );
                Outcome::DeadLetter(e.to_string())
            }
        }
    }
}
