//! Delivery daemon.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use miette::{Result, miette};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use courier_scheduler::SchedulerConfig;
use courier_webhook::parse_route;

use crate::commands;

/// Run the daemon until Ctrl-C.
///
/// Every `rescan` the store is re-read so that jobs written by other
/// processes get armed.
pub async fn run(
    store: &Path,
    config: SchedulerConfig,
    destinations: &[String],
    rescan: Duration,
) -> Result<()> {
    let routes = destinations
        .iter()
        .map(|route| parse_route(route))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| miette!("{}", e))?;

    if routes.is_empty() {
        warn!("no destinations configured, every delivery will fail permanently");
    }
    for (name, url) in &routes {
        info!(destination = %name, url = %url, "registered destination");
    }

    let scheduler = Arc::new(commands::open(store, config, routes).await?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let purged = scheduler
        .cleanup_expired()
        .await
        .map_err(|e| miette!("cleanup failed: {}", e))?;
    if purged > 0 {
        info!(purged, "purged expired jobs");
    }

    let restored = scheduler
        .restore_all()
        .await
        .map_err(|e| miette!("failed to restore jobs: {}", e))?;
    info!(
        restored,
        store = %store.display(),
        "courier started"
    );

    let rescan_handle = {
        let scheduler = Arc::clone(&scheduler);
        let mut shutdown_rx = shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(rescan);
            // The first tick completes immediately; startup already restored.
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = interval.tick() => {
                        match scheduler.restore_all().await {
                            Ok(0) => {}
                            Ok(armed) => info!(armed, "armed jobs added by another process"),
                            Err(e) => warn!(error = %e, "store rescan failed"),
                        }
                    }
                }
            }
            debug!("store rescan stopped");
        })
    };

    scheduler.run(shutdown_rx).await;
    let _ = rescan_handle.await;

    info!("courier stopped");
    Ok(())
}
