//! Bootstrap utilities for chainrelay binaries.
//!
//! Shared initialization code for the relay, consumer and standalone binaries.

use std::future::Future;
use std::time::Duration;

use backon::BackoffBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::utils::retry::connection_backoff;

/// Initialize tracing with the CHAINRELAY_LOG environment variable.
///
/// Defaults to "info" level if CHAINRELAY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a startup dependency with exponential backoff.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "database", "broker")
/// * `address` - Where we are connecting, for logging only
/// * `connect` - Async function that attempts to establish a connection
///
/// Returns the connection on success, or the last error once the backoff
/// schedule is exhausted. Callers treat that error as fatal.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = connection_backoff().build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                info!(service = service_name, address, "Connected");
                return Ok(client);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        service = service_name,
                        address,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        service = service_name,
                        address,
                        attempts = attempt,
                        error = %e,
                        "Giving up on connection"
                    );
                    return Err(e);
                }
            },
        }
    }
}

/// Resolve when the process receives SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
    info!("Shutdown signal received");
}

/// Short pause used by binaries between stopping producers and consumers.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);
