//! Bulletin backend
//!
//! Message distribution core for a moderated news wire: topic tree, access
//! control, message index, export fan-out and import polling.

mod auth;
mod config;
mod db;
mod engine;
mod errors;
mod export;
mod import;
mod index;
mod models;
mod namespace;
mod registry;
mod system;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use engine::Engine;
use registry::PluginRegistry;
use system::{BroadcastNotifier, Notifier};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting bulletin backend {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Base path: {:?}", config.base_path);
    tracing::info!("Default access mask: {}", config.default_mask);

    if !config.io_enabled {
        tracing::warn!("I/O is disabled (BULLETIN_IO_ENABLED). Nothing will be exported or imported!");
    }
    if config.ignore_dirty {
        tracing::warn!("Dirty state tracking is disabled (BULLETIN_IGNORE_DIRTY)");
    }

    let registry = Arc::new(PluginRegistry::with_builtins());
    let notifier = Arc::new(BroadcastNotifier::new(1024));

    // Session layer would subscribe here; keep a receiver so events are logged.
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok((event, audience)) => tracing::trace!(?event, ?audience, "Event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event listener lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let engine = Engine::bootstrap(config, registry, notifier as Arc<dyn Notifier>).await?;
    let imports = engine.start_imports().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    imports.stop();
    if tokio::time::timeout(Duration::from_secs(10), imports.join())
        .await
        .is_err()
    {
        tracing::warn!("Import loops did not stop in time");
    }
    engine.shutdown().await?;

    Ok(())
}
