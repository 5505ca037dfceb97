use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gchat_db::Store;

/// Background task that drops expired tokens.
///
/// Expired tokens are already rejected on lookup; this only keeps the table
/// from growing without bound.
pub async fn run_token_purge(store: Store, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match store.run(|db| db.purge_expired_tokens()).await {
                    Ok(0) => {}
                    Ok(count) => info!("Cleanup: purged {} expired tokens", count),
                    Err(e) => warn!("Cleanup error: {}", e),
                }
            }
        }
    }
}
