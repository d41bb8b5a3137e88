use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::FleetError,
    snowflake::DispatchId,
};

pub const DEFAULT_TTL_SECONDS: i64 = 3_600;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Closed set of operations a device agent understands. Anything outside
/// this list is rejected at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    TakePhoto,
    TakeScreenshot,
    RecordAudio,
    PushFile,
    PullFile,
    LockDevice,
    UnlockDevice,
    WipeData,
    SyncConfig,
    GetLocation,
    ListApps,
    ShowMessage,
    Reboot,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakePhoto => "take_photo",
            Self::TakeScreenshot => "take_screenshot",
            Self::RecordAudio => "record_audio",
            Self::PushFile => "push_file",
            Self::PullFile => "pull_file",
            Self::LockDevice => "lock_device",
            Self::UnlockDevice => "unlock_device",
            Self::WipeData => "wipe_data",
            Self::SyncConfig => "sync_config",
            Self::GetLocation => "get_location",
            Self::ListApps => "list_apps",
            Self::ShowMessage => "show_message",
            Self::Reboot => "reboot",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "take_photo" => Ok(Self::TakePhoto),
            "take_screenshot" => Ok(Self::TakeScreenshot),
            "record_audio" => Ok(Self::RecordAudio),
            "push_file" => Ok(Self::PushFile),
            "pull_file" => Ok(Self::PullFile),
            "lock_device" => Ok(Self::LockDevice),
            "unlock_device" => Ok(Self::UnlockDevice),
            "wipe_data" => Ok(Self::WipeData),
            "sync_config" => Ok(Self::SyncConfig),
            "get_location" => Ok(Self::GetLocation),
            "list_apps" => Ok(Self::ListApps),
            "show_message" => Ok(Self::ShowMessage),
            "reboot" => Ok(Self::Reboot),
            other => Err(FleetError::InvalidCommandType(other.to_string())),
        }
    }
}

/// Delivery ordering tie-break. Never preempts an in-flight command.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(FleetError::InvalidPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// The legal transition table. Expiry is listed here but only the
    /// sweeper calls the store with `Expired` as a target.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Sent, Acknowledged)
                | (Acknowledged, Completed)
                | (Acknowledged, Failed)
                | (Sent, Failed)
                | (Pending, Expired)
                | (Sent, Expired)
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "acknowledged" => Ok(Self::Acknowledged),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(FleetError::InvalidStatus(other.to_string())),
        }
    }
}

/// Durable record of a single remote-execution request. Source of truth for
/// the command's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: DispatchId,
    pub device_id: String,
    pub kind: CommandKind,
    pub payload: Value,
    pub status: CommandStatus,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CommandRecord {
    /// Only `pending` and `sent` commands expire; an acknowledged command is
    /// already executing on the device and runs to completion.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status.can_transition_to(CommandStatus::Expired) && self.expires_at <= now
    }
}

/// Denormalized projection of a command parked for an offline device.
/// Created only by the delivery router; removed on drain, expiry, or when
/// the parent command is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub entry_id: DispatchId,
    pub command_id: DispatchId,
    pub device_id: String,
    pub kind: CommandKind,
    pub payload: Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Wire envelope pushed to a connected device agent. Framed on the socket
/// as a tagged `command` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: DispatchId,
    pub kind: CommandKind,
    pub payload: Value,
    pub priority: Priority,
    pub expires_at: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn for_command(record: &CommandRecord) -> Self {
        Self {
            command_id: record.id,
            kind: record.kind,
            payload: record.payload.clone(),
            priority: record.priority,
            expires_at: record.expires_at,
        }
    }

    pub fn for_entry(entry: &PendingEntry) -> Self {
        Self {
            command_id: entry.command_id,
            kind: entry.kind,
            payload: entry.payload.clone(),
            priority: entry.priority,
            expires_at: entry.expires_at,
        }
    }
}

/// Minimal projection of the externally owned device registry: just enough
/// to resolve `DeviceNotFound` and serve `last_seen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Expired,
        ] {
            for next in [
                CommandStatus::Pending,
                CommandStatus::Sent,
                CommandStatus::Acknowledged,
                CommandStatus::Completed,
                CommandStatus::Failed,
                CommandStatus::Expired,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} -> {next} must be illegal"
                );
            }
        }
    }

    #[test]
    fn lifecycle_happy_path_is_legal() {
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Sent));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::Acknowledged));
        assert!(CommandStatus::Acknowledged.can_transition_to(CommandStatus::Completed));
    }

    #[test]
    fn acknowledged_cannot_expire() {
        assert!(!CommandStatus::Acknowledged.can_transition_to(CommandStatus::Expired));
    }

    #[test]
    fn priority_orders_urgent_first() {
        let mut priorities = vec![
            Priority::Normal,
            Priority::Urgent,
            Priority::Low,
            Priority::High,
        ];
        priorities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            priorities,
            vec![
                Priority::Urgent,
                Priority::High,
                Priority::Normal,
                Priority::Low
            ]
        );
    }

    #[test]
    fn kind_parses_only_known_operations() {
        assert_eq!(
            "lock_device".parse::<CommandKind>().unwrap(),
            CommandKind::LockDevice
        );
        assert!("format_disk".parse::<CommandKind>().is_err());
    }
}
