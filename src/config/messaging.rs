//! Messaging and broker configuration types.

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker (no external dependencies).
    #[default]
    Memory,
    /// AMQP/RabbitMQ broker.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Delivery attempts before a retried message is dead-lettered.
    /// Applies to every broker type.
    pub max_attempts: u32,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Memory,
            max_attempts: 3,
            amqp: AmqpConfig::default(),
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Unacked deliveries per consumer channel (bounds handler concurrency).
    pub prefetch: u16,
    /// Delay before a retried message is republished.
    pub retry_delay_ms: u64,
    /// Consumer tag prefix.
    pub consumer_tag: String,
    /// Connection pool size.
    pub pool_size: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            prefetch: 10,
            retry_delay_ms: 2000,
            consumer_tag: "chainrelay".to_string(),
            pool_size: 10,
        }
    }
}
