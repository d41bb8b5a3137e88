use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    command::{CommandEnvelope, CommandRecord, CommandStatus},
    error::{FleetError, Result},
    presence::{Presence, Pusher},
    snowflake::DispatchId,
    store::{CommandStore, CreateCommand, RetryDisposition},
};

/// How a freshly created command left the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Pushed over the live channel and marked `sent`.
    Direct,
    /// Parked in the pending queue for a later drain.
    Queued,
}

/// Routes each new command to immediate delivery or the pending queue,
/// exactly once. The only component that creates commands and queue
/// entries; presence and push are injected so the router never touches the
/// socket layer directly.
pub struct DeliveryRouter {
    store: Arc<CommandStore>,
    presence: Arc<dyn Presence>,
    pusher: Arc<dyn Pusher>,
}

impl DeliveryRouter {
    pub fn new(
        store: Arc<CommandStore>,
        presence: Arc<dyn Presence>,
        pusher: Arc<dyn Pusher>,
    ) -> Self {
        Self {
            store,
            presence,
            pusher,
        }
    }

    /// Create the command record and route it. The command is never
    /// dropped: it ends up either `sent` or `pending` with a queue entry.
    /// Channel-level push failure is absorbed by queueing, never surfaced
    /// to the creator.
    pub async fn create_and_dispatch(
        &self,
        input: CreateCommand,
    ) -> Result<(CommandRecord, DeliveryMode)> {
        let record = self.store.create_command(input)?;
        let mode = self.dispatch(&record).await?;
        // Re-read so the caller sees the post-dispatch status.
        let record = self.store.get_command(record.id)?;
        Ok((record, mode))
    }

    async fn dispatch(&self, record: &CommandRecord) -> Result<DeliveryMode> {
        if self.presence.is_online(&record.device_id) {
            let envelope = CommandEnvelope::for_command(record);
            match self.pusher.push(&record.device_id, envelope).await {
                Ok(()) => {
                    match self
                        .store
                        .apply_transition(record.id, CommandStatus::Sent, None, None)
                    {
                        Ok(_) => {
                            info!(
                                command = %record.id,
                                device = record.device_id,
                                "command pushed directly"
                            );
                            return Ok(DeliveryMode::Direct);
                        }
                        // Cancelled between create and push; nothing to do.
                        Err(FleetError::CommandNotFound) => {
                            debug!(command = %record.id, "command vanished mid-dispatch");
                            return Ok(DeliveryMode::Direct);
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(FleetError::ChannelUnavailable(_)) => {
                    // Socket closed under us; fall through to the queue.
                    debug!(
                        command = %record.id,
                        device = record.device_id,
                        "live channel refused push, queueing instead"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        self.store.enqueue_pending(record)?;
        Ok(DeliveryMode::Queued)
    }

    /// React to a transport-confirmed delivery failure reported after the
    /// command was handed to the channel. Consumes one retry and, while
    /// budget remains and the device is still online, re-attempts the push.
    /// Once the budget is spent the store has already forced `failed`.
    pub async fn handle_push_failure(&self, id: DispatchId) -> Result<()> {
        match self.store.record_push_failure(id)? {
            RetryDisposition::Exhausted => Ok(()),
            RetryDisposition::Retry => {
                let record = self.store.get_command(id)?;
                if !self.presence.is_online(&record.device_id) {
                    // Unreachable again; the expiry sweeper resolves it.
                    return Ok(());
                }
                let envelope = CommandEnvelope::for_command(&record);
                if let Err(err) = self.pusher.push(&record.device_id, envelope).await {
                    warn!(
                        command = %id,
                        device = record.device_id,
                        error = %err,
                        "redelivery attempt failed"
                    );
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, Priority};
    use crate::presence::{DeviceHub, OutboundFrame};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_input(device: &str) -> CreateCommand {
        CreateCommand {
            device_id: device.to_string(),
            kind: CommandKind::LockDevice,
            payload: json!({"pin": "0000"}),
            priority: Priority::High,
            ttl_seconds: 3_600,
            max_retries: 3,
        }
    }

    fn make_router(dir: &tempfile::TempDir) -> (Arc<CommandStore>, DeviceHub, DeliveryRouter) {
        let store = Arc::new(CommandStore::open(dir.path().join("dispatch"), 0).unwrap());
        let hub = DeviceHub::new();
        let router = DeliveryRouter::new(
            Arc::clone(&store),
            Arc::new(hub.clone()),
            Arc::new(hub.clone()),
        );
        (store, hub, router)
    }

    #[tokio::test]
    async fn offline_device_gets_a_queue_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _hub, router) = make_router(&dir);
        store.register_device("d1", None).unwrap();

        let (record, mode) = router.create_and_dispatch(make_input("d1")).await.unwrap();
        assert_eq!(mode, DeliveryMode::Queued);
        assert_eq!(record.status, CommandStatus::Pending);
        assert_eq!(store.pending_entries("d1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn online_device_gets_a_direct_push() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hub, router) = make_router(&dir);
        store.register_device("d1", None).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        hub.connect("d1", tx);

        let (record, mode) = router.create_and_dispatch(make_input("d1")).await.unwrap();
        assert_eq!(mode, DeliveryMode::Direct);
        assert_eq!(record.status, CommandStatus::Sent);
        assert!(record.sent_at.is_some());
        assert!(store.pending_entries("d1").unwrap().is_empty());

        match rx.recv().await.unwrap() {
            OutboundFrame::Command(envelope) => assert_eq!(envelope.command_id, record.id),
            other => panic!("expected command frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_channel_falls_back_to_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hub, router) = make_router(&dir);
        store.register_device("d1", None).unwrap();

        let (tx, rx) = mpsc::channel(4);
        hub.connect("d1", tx);
        drop(rx);

        let (record, mode) = router.create_and_dispatch(make_input("d1")).await.unwrap();
        assert_eq!(mode, DeliveryMode::Queued);
        assert_eq!(record.status, CommandStatus::Pending);
        assert_eq!(store.pending_entries("d1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_device_is_rejected_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _hub, router) = make_router(&dir);

        let err = router
            .create_and_dispatch(make_input("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn push_failure_retries_until_the_budget_is_spent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hub, router) = make_router(&dir);
        store.register_device("d1", None).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        hub.connect("d1", tx);

        let (record, _) = router.create_and_dispatch(make_input("d1")).await.unwrap();
        let _ = rx.recv().await;

        for _ in 0..record.max_retries {
            router.handle_push_failure(record.id).await.unwrap();
            // Each retry re-pushes while the device stays online.
            assert!(rx.recv().await.is_some());
        }

        router.handle_push_failure(record.id).await.unwrap();
        let stored = store.get_command(record.id).unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        assert!(stored.retry_count <= stored.max_retries);
    }
}
