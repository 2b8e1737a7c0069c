//! chainrelay - transactional outbox relay and chain event ingestion
//!
//! Two halves share one SQLite database and one broker:
//!
//! - **Write side**: business transactions stage domain events with
//!   [`outbox::enqueue`]; the [`outbox::relay::RelayWorker`] publishes them to
//!   the broker in `created_at` order and marks them relayed.
//! - **Read side**: the [`consumer::ChainEventDispatcher`] receives chain log
//!   events from the broker, checks their format contract, routes them by
//!   contract address and applies them through idempotent [`handlers`].

pub mod bus;
pub mod cache;
pub mod chain;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod handlers;
pub mod outbox;
pub mod runtime;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
