//! chainrelay-standalone: relay and consumers in one process.
//!
//! Intended for local development: SQLite plus the in-memory broker, no
//! external services. Any broker type works, though.

use tracing::{info, warn};

use chainrelay::config::{Config, MessagingType};
use chainrelay::runtime::Runtime;
use chainrelay::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    if config.messaging.messaging_type != MessagingType::Memory {
        warn!(
            messaging_type = ?config.messaging.messaging_type,
            "Standalone mode with an external broker"
        );
    }
    if config.storage.is_in_memory() {
        warn!("In-memory database: all state is lost on exit");
    }

    let runtime = Runtime::build(config).await?;
    info!("chainrelay-standalone started");

    let stats = runtime.run_standalone(shutdown_signal()).await?;

    info!(
        ticks = stats.ticks,
        relayed = stats.relayed,
        "chainrelay-standalone exited"
    );
    Ok(())
}
