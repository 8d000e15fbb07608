//! # docsync Agent
//!
//! Replication node for a hierarchical document store.
//!
//! ## Architecture
//!
//! One event loop drives the instance:
//! 1. **Capture**: committed local changes are published on the tenant's change topic
//! 2. **Apply**: received change messages are replayed against the local store
//! 3. **Journal**: every outcome is recorded in `SQLite` and reported periodically
//!
//! A publish is acknowledged only once its apply has succeeded or been skipped.

use anyhow::Result;
use docsync_core::InstanceId;
use tracing_subscriber::EnvFilter;

mod config;
mod journal;
mod runtime;
mod transport;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting docsync agent");

    // Load configuration
    let config = AgentConfig::from_env()?;

    let instance = config
        .instance_id
        .clone()
        .map_or_else(InstanceId::generate, InstanceId::new);

    tracing::info!(%instance, "Agent initialized");

    let agent = Agent::new(config, instance)?;

    agent.run().await?;

    Ok(())
}
