use std::sync::Weak;
use std::time::Duration;

use crate::engine::Engine;

/// Periodically compact a tenant's WAL once enough appends pile up.
/// Exits when the engine is dropped (tenant removed or server stopping).
pub async fn run_compactor(engine: Weak<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            break;
        };
        if engine.is_closed() {
            break;
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!(tenant = %engine.name(), "WAL compaction failed: {e}");
        }
    }
}
