//! Chain event handlers.
//!
//! Each handler applies one kind of chain log to local state and is safe to
//! run any number of times for the same log:
//!
//! 1. Natural-key check: an already-derived record means `Duplicate`
//! 2. Resolve context (chain node, token, community); a prerequisite that can
//!    never appear is `Unresolvable`, more than one candidate is `Ambiguous`
//! 3. Fetch missing chain data (block timestamp)
//! 4. Integer math in `U256`
//! 5. Insert with `ON CONFLICT DO NOTHING`
//! 6. Secondary actions guarded by a persisted flag
//!
//! Storage and chain failures surface as `Transient` and are retried by the
//! broker.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::ChainNodeCache;
use crate::chain::{ChainClient, ChainError, ChainEventEnvelope, ChainNode};
use crate::storage::{ProjectionStore, StorageError};

pub mod fallback;
pub mod launchpad;
pub mod namespace;
pub mod stake;

pub use fallback::FallbackHandler;
pub use launchpad::LaunchpadTradeHandler;
pub use namespace::NamespaceDeployedHandler;
pub use stake::StakeTradeHandler;

/// Why a handler did not apply an event.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying: the database or the chain was unavailable.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A prerequisite that will never exist; retrying cannot help.
    #[error("Unresolvable context: {0}")]
    Unresolvable(String),

    /// More than one candidate; needs an operator.
    #[error("Ambiguous context: {0}")]
    Ambiguous(String),

    /// The event itself is malformed.
    #[error("Malformed event: {0}")]
    Format(String),
}

impl From<StorageError> for HandlerError {
    fn from(e: StorageError) -> Self {
        HandlerError::Transient(e.to_string())
    }
}

impl From<ChainError> for HandlerError {
    fn from(e: ChainError) -> Self {
        HandlerError::Transient(e.to_string())
    }
}

/// What a handler did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Applied,
    /// The derived record already existed.
    Duplicate,
    /// Deliberately ignored.
    Skipped(String),
}

#[async_trait]
pub trait ChainEventHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &ChainEventEnvelope) -> Result<Handled, HandlerError>;
}

/// Shared dependencies of every handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub store: ProjectionStore,
    pub chain: Arc<dyn ChainClient>,
    pub chain_nodes: Arc<ChainNodeCache>,
}

impl HandlerContext {
    pub fn new(
        store: ProjectionStore,
        chain: Arc<dyn ChainClient>,
        chain_nodes: Arc<ChainNodeCache>,
    ) -> Self {
        Self {
            store,
            chain,
            chain_nodes,
        }
    }

    /// The node for the event's chain. Unknown chains are unresolvable.
    pub async fn chain_node(&self, event: &ChainEventEnvelope) -> Result<ChainNode, HandlerError> {
        let eth_chain_id = event.eth_chain_id();
        self.chain_nodes
            .resolve(eth_chain_id)
            .await?
            .ok_or_else(|| HandlerError::Unresolvable(format!("unknown chain {eth_chain_id}")))
    }

    /// Block timestamp from the envelope, or from the chain when absent.
    pub async fn block_timestamp(
        &self,
        event: &ChainEventEnvelope,
        node: &ChainNode,
    ) -> Result<i64, HandlerError> {
        let timestamp = match event.block_timestamp() {
            Some(timestamp) => timestamp,
            None => {
                debug!(
                    natural_key = %event.natural_key_string(),
                    "Block timestamp missing from envelope, asking the chain"
                );
                self.chain
                    .block_timestamp(node, &event.raw_log.block_hash)
                    .await?
            }
        };
        i64::try_from(timestamp)
            .map_err(|_| HandlerError::Format(format!("block timestamp {timestamp} out of range")))
    }
}

/// `Skipped` when the envelope names a different event than `expected`.
///
/// Envelopes without a signature are taken at face value.
pub(crate) fn signature_mismatch(event: &ChainEventEnvelope, expected: &str) -> Option<Handled> {
    match event.event_signature() {
        Some(signature) if !signature.eq_ignore_ascii_case(expected) => Some(Handled::Skipped(
            format!("event signature {signature} is not {expected}"),
        )),
        _ => None,
    }
}

/// Decode `parsedArgs`, turning shape errors into `Format`.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    event: &ChainEventEnvelope,
) -> Result<T, HandlerError> {
    event
        .parse_args()
        .map_err(|e| HandlerError::Format(format!("parsedArgs: {e}")))
}
