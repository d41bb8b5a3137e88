use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time};
use tracing::{error, info};

use crate::store::CommandStore;

/// Spawn the periodic expiry pass. Runs until the server shuts down; every
/// tick reaps non-terminal commands and queue entries past `expires_at`.
pub fn spawn(store: Arc<CommandStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // The first tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store.sweep_expired(Utc::now()) {
                Ok(stats) if !stats.is_empty() => {
                    info!(
                        expired = stats.expired_commands,
                        removed_entries = stats.removed_entries,
                        "expiry sweep reaped overdue commands"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "expiry sweep failed");
                }
            }
        }
    })
}
