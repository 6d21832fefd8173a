use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::Engine;
use crate::observability::COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrite the ledger whenever `threshold` appends have piled up since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns true when a compaction ran and succeeded.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.ledger_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    debug!(appends, threshold, "compacting ledger");
    match engine.compact_ledger().await {
        Ok(()) => {
            metrics::counter!(COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            error!("ledger compaction failed: {e}");
            false
        }
    }
}
