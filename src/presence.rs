use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    command::CommandEnvelope,
    error::{FleetError, Result},
};

/// Frames flowing server -> device over a live channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Command(CommandEnvelope),
    Pong,
    Error { message: String },
}

/// Read side of the live-connection table.
pub trait Presence: Send + Sync {
    fn is_online(&self, device_id: &str) -> bool;
}

/// Fire-and-forget push toward a connected device. Failure means the caller
/// should fall back to the pending queue.
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn push(&self, device_id: &str, envelope: CommandEnvelope) -> Result<()>;
}

struct Connection {
    sender: mpsc::Sender<OutboundFrame>,
    connected_at: DateTime<Utc>,
}

/// In-process hub of live device channels. Each WebSocket connection
/// registers an outbound sender here; the delivery router only sees the
/// narrow [`Presence`] and [`Pusher`] traits.
#[derive(Clone, Default)]
pub struct DeviceHub {
    connections: Arc<RwLock<HashMap<String, Connection>>>,
}

impl DeviceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected device. A second connection for the
    /// same device supersedes the first; the stale sender is dropped, which
    /// closes the old socket's forwarding task.
    pub fn connect(&self, device_id: &str, sender: mpsc::Sender<OutboundFrame>) {
        let mut connections = self.connections.write();
        let previous = connections.insert(
            device_id.to_string(),
            Connection {
                sender,
                connected_at: Utc::now(),
            },
        );
        if previous.is_some() {
            debug!(device = device_id, "superseding existing device channel");
        }
    }

    /// Drop the device's channel, but only if `sender` is still the
    /// registered one. A superseded connection disconnecting later must not
    /// tear down its replacement.
    pub fn disconnect(&self, device_id: &str, sender: &mpsc::Sender<OutboundFrame>) {
        let mut connections = self.connections.write();
        if let Some(current) = connections.get(device_id) {
            if current.sender.same_channel(sender) {
                connections.remove(device_id);
            }
        }
    }

    pub fn connected_since(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.connections
            .read()
            .get(device_id)
            .map(|connection| connection.connected_at)
    }

    pub fn online_count(&self) -> usize {
        self.connections.read().len()
    }
}

impl Presence for DeviceHub {
    fn is_online(&self, device_id: &str) -> bool {
        self.connections.read().contains_key(device_id)
    }
}

#[async_trait]
impl Pusher for DeviceHub {
    async fn push(&self, device_id: &str, envelope: CommandEnvelope) -> Result<()> {
        let sender = {
            let connections = self.connections.read();
            connections
                .get(device_id)
                .map(|connection| connection.sender.clone())
        };

        let sender = sender.ok_or_else(|| FleetError::ChannelUnavailable(device_id.to_string()))?;
        sender
            .send(OutboundFrame::Command(envelope))
            .await
            .map_err(|_| FleetError::ChannelUnavailable(device_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, Priority};
    use crate::snowflake::DispatchId;
    use serde_json::json;

    fn envelope() -> CommandEnvelope {
        CommandEnvelope {
            command_id: DispatchId(42),
            kind: CommandKind::LockDevice,
            payload: json!({}),
            priority: Priority::Normal,
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn push_reaches_the_registered_channel() {
        let hub = DeviceHub::new();
        let (tx, mut rx) = mpsc::channel(4);
        hub.connect("d1", tx);

        assert!(hub.is_online("d1"));
        hub.push("d1", envelope()).await.unwrap();
        match rx.recv().await.unwrap() {
            OutboundFrame::Command(received) => assert_eq!(received.command_id, DispatchId(42)),
            other => panic!("expected command frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_to_offline_device_fails() {
        let hub = DeviceHub::new();
        let err = hub.push("d1", envelope()).await.unwrap_err();
        assert!(matches!(err, FleetError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn push_fails_once_receiver_is_dropped() {
        let hub = DeviceHub::new();
        let (tx, rx) = mpsc::channel(4);
        hub.connect("d1", tx);
        drop(rx);

        let err = hub.push("d1", envelope()).await.unwrap_err();
        assert!(matches!(err, FleetError::ChannelUnavailable(_)));
        // Presence is keyed on registration, not channel health; the socket
        // teardown path removes the entry.
        assert!(hub.is_online("d1"));
    }

    #[tokio::test]
    async fn superseded_connection_cannot_disconnect_its_replacement() {
        let hub = DeviceHub::new();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);

        hub.connect("d1", old_tx.clone());
        hub.connect("d1", new_tx);

        hub.disconnect("d1", &old_tx);
        assert!(hub.is_online("d1"));
    }
}
