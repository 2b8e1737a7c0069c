//! chainrelay-consumer: chain and domain event consumer.
//!
//! Attaches the chain event dispatcher and the domain event consumer to
//! their subscriptions and runs until ctrl-c.
//!
//! ## Configuration
//! ```yaml
//! messaging:
//!   type: amqp
//!   max_attempts: 3
//!   amqp:
//!     url: amqp://localhost:5672
//!     prefetch: 10
//! dispatch:
//!   stake_contracts: ["0x..."]
//!   factory_contracts: ["0x..."]
//!   launchpad_contracts: ["0x..."]
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
        "chainrelay-consumer starting"
    );

    let runtime = Runtime::build(config).await?;
    info!(
        routes = runtime.dispatcher().routing().len(),
        "Chain event routing ready"
    );
    runtime.run_consumer(shutdown_signal()).await?;

    info!("chainrelay-consumer exited");
    Ok(())
}
