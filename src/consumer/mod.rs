//! Broker consumers.
//!
//! [`ChainEventDispatcher`] takes `ChainEventCreated` messages off the
//! chain-events subscription, checks their format contract, and hands each
//! one to exactly one chain event handler picked by contract address.
//! [`DomainEventConsumer`] acknowledges well-formed platform domain events.

use serde::Deserialize;

pub mod dispatcher;
pub mod domain;
pub mod routing;

pub use dispatcher::ChainEventDispatcher;
pub use domain::DomainEventConsumer;
pub use routing::{HandlerId, RoutingError, RoutingTable};

/// Contract addresses of interest, by handler.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Community stake contracts (`Trade`).
    pub stake_contracts: Vec<String>,
    /// Namespace factories (`NamespaceDeployed`).
    pub factory_contracts: Vec<String>,
    /// Launchpad bonding curves (`Trade`).
    pub launchpad_contracts: Vec<String>,
}
