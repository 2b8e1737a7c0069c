//! chainrelay-relay: outbox relay worker.
//!
//! Polls the outbox table and publishes pending events to the broker in
//! `created_at` order, marking each relayed once the broker accepted it.
//! Several instances may run against one database; row leases keep them
//! off each other's batches.
//!
//! ## Configuration
//! ```yaml
//! storage:
//!   path: data/chainrelay.db
//! messaging:
//!   type: amqp
//!   amqp:
//!     url: amqp://localhost:5672
//! relay:
//!   batch_size: 100
//!   poll_interval_ms: 1000
//!   lease_secs: 30
//! ```

use tracing::info;

use chainrelay::config::Config;
use chainrelay::runtime::Runtime;
use chainrelay::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    info!(
        messaging_type = ?config.messaging.messaging_type,
        batch_size = config.relay.batch_size,
        "chainrelay-relay starting"
    );

    let runtime = Runtime::build(config).await?;
    let stats = runtime.run_relay(shutdown_signal()).await;

    info!(
        ticks = stats.ticks,
        relayed = stats.relayed,
        failed_ticks = stats.failed_ticks,
        "chainrelay-relay exited"
    );
    Ok(())
}
