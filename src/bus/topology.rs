//! Declared broker topology.
//!
//! Every logical stream names its publication (what producers target), its
//! subscription (what consumers attach to), and the exchange/queue/routing key
//! backing them. All streams share one dead-letter exchange and queue.

use std::collections::HashSet;

use super::{BusError, Result};

/// Stream carrying indexed chain events.
pub const CHAIN_EVENTS: &str = "chain-events";
/// Stream carrying platform domain events.
pub const DOMAIN_EVENTS: &str = "domain-events";
/// Subscription the chain event dispatcher attaches to.
pub const CHAIN_EVENTS_SUBSCRIPTION: &str = "chain-events.dispatcher";
/// Subscription for domain event consumers.
pub const DOMAIN_EVENTS_SUBSCRIPTION: &str = "domain-events.consumer";

const EVENTS_EXCHANGE: &str = "chainrelay.events";
const DEAD_LETTER_EXCHANGE: &str = "chainrelay.dlx";
const DEAD_LETTER_QUEUE: &str = "chainrelay.dead-letter";

/// One logical message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTopology {
    pub name: String,
    pub publication: String,
    pub subscription: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// The single dead-letter pair every stream rejects into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTopology {
    pub exchange: String,
    pub queue: String,
}

/// All streams plus the shared dead-letter pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    streams: Vec<StreamTopology>,
    dead_letter: DeadLetterTopology,
}

impl Topology {
    /// Build and validate a topology.
    pub fn new(streams: Vec<StreamTopology>, dead_letter: DeadLetterTopology) -> Result<Self> {
        let topology = Self {
            streams,
            dead_letter,
        };
        topology.validate()?;
        Ok(topology)
    }

    pub fn streams(&self) -> &[StreamTopology] {
        &self.streams
    }

    pub fn dead_letter(&self) -> &DeadLetterTopology {
        &self.dead_letter
    }

    pub fn stream_for_publication(&self, publication: &str) -> Option<&StreamTopology> {
        self.streams.iter().find(|s| s.publication == publication)
    }

    pub fn stream_for_subscription(&self, subscription: &str) -> Option<&StreamTopology> {
        self.streams.iter().find(|s| s.subscription == subscription)
    }

    /// Reject empty names, duplicate publications/subscriptions/queues, and
    /// any stream that reuses the dead-letter exchange or queue.
    pub fn validate(&self) -> Result<()> {
        if self.dead_letter.exchange.is_empty() || self.dead_letter.queue.is_empty() {
            return Err(BusError::Topology("dead-letter exchange and queue must be named".into()));
        }

        let mut publications = HashSet::new();
        let mut subscriptions = HashSet::new();
        let mut queues = HashSet::new();

        for stream in &self.streams {
            let fields = [
                ("name", &stream.name),
                ("publication", &stream.publication),
                ("subscription", &stream.subscription),
                ("exchange", &stream.exchange),
                ("queue", &stream.queue),
                ("routing_key", &stream.routing_key),
            ];
            if let Some((field, _)) = fields.iter().find(|(_, v)| v.is_empty()) {
                return Err(BusError::Topology(format!(
                    "stream '{}' has an empty {}",
                    stream.name, field
                )));
            }

            if stream.exchange == self.dead_letter.exchange || stream.queue == self.dead_letter.queue {
                return Err(BusError::Topology(format!(
                    "stream '{}' reuses the dead-letter exchange or queue",
                    stream.name
                )));
            }
            if !publications.insert(stream.publication.as_str()) {
                return Err(BusError::Topology(format!(
                    "duplicate publication '{}'",
                    stream.publication
                )));
            }
            if !subscriptions.insert(stream.subscription.as_str()) {
                return Err(BusError::Topology(format!(
                    "duplicate subscription '{}'",
                    stream.subscription
                )));
            }
            if !queues.insert(stream.queue.as_str()) {
                return Err(BusError::Topology(format!("duplicate queue '{}'", stream.queue)));
            }
        }

        Ok(())
    }
}

impl Default for Topology {
    /// Chain events and domain events on one topic exchange.
    fn default() -> Self {
        Self {
            streams: vec![
                StreamTopology {
                    name: CHAIN_EVENTS.to_string(),
                    publication: CHAIN_EVENTS.to_string(),
                    subscription: CHAIN_EVENTS_SUBSCRIPTION.to_string(),
                    exchange: EVENTS_EXCHANGE.to_string(),
                    queue: "chainrelay.chain-events".to_string(),
                    routing_key: "ChainEventCreated".to_string(),
                },
                StreamTopology {
                    name: DOMAIN_EVENTS.to_string(),
                    publication: DOMAIN_EVENTS.to_string(),
                    subscription: DOMAIN_EVENTS_SUBSCRIPTION.to_string(),
                    exchange: EVENTS_EXCHANGE.to_string(),
                    queue: "chainrelay.domain-events".to_string(),
                    routing_key: "DomainEvent".to_string(),
                },
            ],
            dead_letter: DeadLetterTopology {
                exchange: DEAD_LETTER_EXCHANGE.to_string(),
                queue: DEAD_LETTER_QUEUE.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str) -> StreamTopology {
        StreamTopology {
            name: name.to_string(),
            publication: format!("{name}.pub"),
            subscription: format!("{name}.sub"),
            exchange: "events".to_string(),
            queue: format!("{name}.queue"),
            routing_key: name.to_string(),
        }
    }

    fn dlx() -> DeadLetterTopology {
        DeadLetterTopology {
            exchange: "dlx".to_string(),
            queue: "dlq".to_string(),
        }
    }

    #[test]
    fn test_default_topology_is_valid() {
        let topology = Topology::default();
        assert!(topology.validate().is_ok());
        assert_eq!(
            topology.stream_for_publication(CHAIN_EVENTS).unwrap().routing_key,
            "ChainEventCreated"
        );
        assert_eq!(
            topology
                .stream_for_subscription(DOMAIN_EVENTS_SUBSCRIPTION)
                .unwrap()
                .routing_key,
            "DomainEvent"
        );
    }

    #[test]
    fn test_rejects_duplicate_publication() {
        let mut b = stream("b");
        b.publication = "a.pub".to_string();
        let result = Topology::new(vec![stream("a"), b], dlx());
        assert!(matches!(result, Err(BusError::Topology(_))));
    }

    #[test]
    fn test_rejects_stream_on_dead_letter_queue() {
        let mut a = stream("a");
        a.queue = "dlq".to_string();
        assert!(Topology::new(vec![a], dlx()).is_err());
    }

    #[test]
    fn test_rejects_empty_routing_key() {
        let mut a = stream("a");
        a.routing_key.clear();
        assert!(Topology::new(vec![a], dlx()).is_err());
    }

    #[test]
    fn test_unknown_names_resolve_to_none() {
        let topology = Topology::new(vec![stream("a")], dlx()).unwrap();
        assert!(topology.stream_for_publication("nope").is_none());
        assert!(topology.stream_for_subscription("a.sub").is_some());
    }
}
