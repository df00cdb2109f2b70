//! node command - run a cluster member with an in-memory cache

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use cohort_cluster::{ClusterManager, MemoryCache};
use cohort_core::config::MetricsConfig;
use cohort_core::CohortConfig;

pub async fn execute(config: CohortConfig, stats_interval: u64) -> Result<()> {
    if config.metrics.enabled {
        install_exporter(&config.metrics)?;
    }

    let cache: Arc<MemoryCache<String>> = Arc::new(MemoryCache::new());
    let manager = ClusterManager::new(config.cluster.clone(), cache.clone())
        .context("Failed to create cluster manager")?;

    let bound = manager
        .startup()
        .await
        .context("Failed to start cluster member")?;
    info!(
        "Cluster member {} listening on {} with {} members",
        manager.server_id(),
        bound,
        manager.members().len()
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => log_stats(&manager, &cache),
        }
    }

    manager.shutdown().await?;
    log_stats(&manager, &cache);

    Ok(())
}

fn log_stats(manager: &ClusterManager, cache: &MemoryCache<String>) {
    let stats = manager.stats();
    let cache_stats = cache.stats();

    info!(
        "Stats: {} broadcast, {} received, {} duplicates, {} send failures, {} malformed, {} apply failures; {}/{} members reachable; {} cache evictions",
        stats.events_broadcast,
        stats.events_received,
        stats.duplicates_suppressed,
        stats.send_failures,
        stats.malformed_frames,
        stats.apply_failures,
        stats.reachable_members(),
        stats.members.len(),
        cache_stats.key_evictions + cache_stats.table_evictions
    );

    for member in stats.members.iter().filter(|m| m.suspended) {
        warn!(
            "Member {} suspended after {} consecutive failures",
            member.address, member.consecutive_failures
        );
    }
}

fn install_exporter(metrics: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", metrics.bind_address, metrics.port)
        .parse()
        .with_context(|| format!("Invalid metrics address {}:{}", metrics.bind_address, metrics.port))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Prometheus metrics at http://{}/metrics", addr);
    Ok(())
}
