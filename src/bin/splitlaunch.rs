use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use splitlaunch::config::AgentConfig;
use splitlaunch::engagement::ThreadEngagementTracker;
use splitlaunch::groups::GroupStateManager;
use splitlaunch::store::GroupStateStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,splitlaunch=debug")),
        )
        .init();

    let config = AgentConfig::load();

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(run(config))
}

async fn run(config: AgentConfig) -> Result<()> {
    tracing::info!("splitlaunch starting (handle: {})", config.handle);

    let store = Arc::new(
        GroupStateStore::new(&config.database_path)
            .with_context(|| format!("failed to open group state db at {}", config.database_path))?,
    );

    // Canonicalize any records written by older deployments before serving.
    let migration = store.migrate_legacy_records()?;
    if !migration.skipped.is_empty() {
        tracing::warn!(
            "migration skipped {} unparseable record(s): {:?}",
            migration.skipped.len(),
            migration.skipped
        );
    }
    tracing::info!("group state ready ({} record(s))", migration.migrated);

    let manager = Arc::new(GroupStateManager::new(store));
    let health = manager.health_check().await;
    if !health.healthy {
        anyhow::bail!(
            "group state store failed its health check: {}",
            health.error.unwrap_or_default()
        );
    }

    let tracker = Arc::new(ThreadEngagementTracker::new(
        config.thread_timeout(),
        config.response_gap(),
    ));
    tracing::info!(
        "engagement windows: thread {}s, response gap {}s ({} active thread(s))",
        config.thread_timeout_secs,
        config.response_gap_secs,
        tracker.active_thread_count()
    );
    tracing::info!(
        "bootstrap tuning: {} attempt(s), {}s/{}s timeouts, cap {}",
        config.max_connect_attempts,
        config.first_attempt_timeout_secs,
        config.retry_timeout_secs,
        config.installation_cap
    );

    // The messaging-network adapter is deployment-specific: a deployment
    // links one in, builds a ConnectionBootstrapper around it, and feeds the
    // resulting session plus an inbound channel into AgentRuntime::run. This
    // stock binary stops after the startup checks.
    tracing::warn!(
        "no messaging-network adapter linked into this build; startup checks \
         passed, wire an adapter up via splitlaunch::network::MessagingConnector"
    );
    Ok(())
}
