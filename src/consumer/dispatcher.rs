//! Chain event dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{DispatchConfig, HandlerId, RoutingError, RoutingTable};
use crate::bus::format::{ChainEventCreatedFormat, MsgFormat};
use crate::bus::{BrokerMessage, MessageHandler, Outcome};
use crate::handlers::{
    ChainEventHandler, FallbackHandler, Handled, HandlerContext, HandlerError,
    LaunchpadTradeHandler, NamespaceDeployedHandler, StakeTradeHandler,
};

/// Routes each chain log to one handler and turns its result into an
/// [`Outcome`]:
///
/// | Result | Outcome |
/// |--------|---------|
/// | applied, duplicate, skipped | `Ack` |
/// | `Transient` | `Retry` |
/// | `Unresolvable` | `Ack` (logged) |
/// | `Ambiguous`, `Format`, contract failure | `DeadLetter` |
pub struct ChainEventDispatcher {
    routing: RoutingTable,
    handlers: HashMap<HandlerId, Arc<dyn ChainEventHandler>>,
}

impl ChainEventDispatcher {
    pub fn new(routing: RoutingTable) -> Self {
        Self {
            routing,
            handlers: HashMap::new(),
        }
    }

    /// Dispatcher with every handler wired to `ctx`.
    pub fn from_config(config: &DispatchConfig, ctx: HandlerContext) -> Result<Self, RoutingError> {
        let routing = RoutingTable::from_config(config)?;
        info!(routes = routing.len(), "Chain event routing table built");

        Ok(Self::new(routing)
            .with_handler(HandlerId::StakeTrade, Arc::new(StakeTradeHandler::new(ctx.clone())))
            .with_handler(
                HandlerId::NamespaceFactory,
                Arc::new(NamespaceDeployedHandler::new(ctx.clone())),
            )
            .with_handler(
                HandlerId::LaunchpadTrade,
                Arc::new(LaunchpadTradeHandler::new(ctx.clone())),
            )
            .with_handler(HandlerId::Fallback, Arc::new(FallbackHandler::new(ctx))))
    }

    pub fn with_handler(mut self, id: HandlerId, handler: Arc<dyn ChainEventHandler>) -> Self {
        self.handlers.insert(id, handler);
        self
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }
}

#[async_trait]
impl MessageHandler for ChainEventDispatcher {
    async fn handle(&self, message: &BrokerMessage) -> Outcome {
        if message.event_name != ChainEventCreatedFormat::MESSAGE_TYPE {
            error!(
                event_name = %message.event_name,
                payload = %message.event_payload,
                "Unknown event name on chain event subscription"
            );
            return Outcome::DeadLetter(format!("unknown event name {}", message.event_name));
        }

        let event = match ChainEventCreatedFormat::check_msg_format(&message.event_payload) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    event_name = %message.event_name,
                    reason = %e.reason,
                    payload = %e.payload,
                    "Chain event failed format contract"
                );
                return Outcome::DeadLetter(e.to_string());
            }
        };

        let natural_key = event.natural_key_string();
        let contract = event.contract_address();
        let id = self.routing.route(&contract);
        let Some(handler) = self.handlers.get(&id) else {
            error!(natural_key = %natural_key, contract = %contract, handler = ?id, "No handler registered");
            return Outcome::DeadLetter(format!("no handler registered for {id:?}"));
        };

        let redelivery_count = message.delivery.redelivery_count;
        match handler.handle(&event).await {
            Ok(Handled::Applied) => {
                info!(natural_key = %natural_key, handler = handler.name(), "Chain event applied");
                Outcome::Ack
            }
            Ok(Handled::Duplicate) => {
                debug!(natural_key = %natural_key, handler = handler.name(), "Chain event already applied");
                Outcome::Ack
            }
            Ok(Handled::Skipped(reason)) => {
                info!(natural_key = %natural_key, handler = handler.name(), reason = %reason, "Chain event skipped");
                Outcome::Ack
            }
            Err(HandlerError::Transient(reason)) => {
                warn!(
                    natural_key = %natural_key,
                    handler = handler.name(),
                    redelivery_count,
                    reason = %reason,
                    "Transient handler failure, retrying"
                );
                Outcome::Retry(reason)
            }
            Err(HandlerError::Unresolvable(reason)) => {
                warn!(
                    natural_key = %natural_key,
                    handler = handler.name(),
                    reason = %reason,
                    "Chain event context unresolvable, dropping"
                );
                Outcome::Ack
            }
            Err(e @ HandlerError::Ambiguous(_)) => {
                error!(natural_key = %natural_key, handler = handler.name(), error = %e, "Chain event needs operator review");
                Outcome::DeadLetter(e.to_string())
            }
            Err(e @ HandlerError::Format(_)) => {
                error!(
                    natural_key = %natural_key,
                    handler = handler.name(),
                    error = %e,
                    payload = %message.event_payload,
                    "Malformed chain event"
                );
                Outcome::DeadLetter(e.to_string())
            }
        }
    }
}
