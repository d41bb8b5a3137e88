use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    command::{
        CommandKind, CommandRecord, CommandStatus, DeviceRecord, PendingEntry, Priority,
    },
    error::{FleetError, Result},
    snowflake::{DispatchId, DispatchIdGenerator, MAX_NODE_ID},
};

const SEP: u8 = 0x1F;
const PREFIX_DEVICE: &str = "dev";
const PREFIX_COMMAND: &str = "cmd";
const PREFIX_DEVICE_INDEX: &str = "cmd-dev";
const PREFIX_QUEUE: &str = "queue";

/// Arguments for [`CommandStore::create_command`].
#[derive(Debug, Clone)]
pub struct CreateCommand {
    pub device_id: String,
    pub kind: CommandKind,
    pub payload: Value,
    pub priority: Priority,
    pub ttl_seconds: i64,
    pub max_retries: u32,
}

/// Outcome of recording a transport-level push failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Another delivery attempt is allowed.
    Retry,
    /// The retry budget is spent; the command was forced to `failed`.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    pub expired_commands: usize,
    pub removed_entries: usize,
}

impl SweepStats {
    pub fn is_empty(&self) -> bool {
        self.expired_commands == 0 && self.removed_entries == 0
    }
}

/// Durable source of truth for devices, command records, and the per-device
/// pending queue. All multi-key mutations go through a single `WriteBatch`.
///
/// Status transitions take `transition_lock` and re-read the persisted row
/// before mutating, which gives compare-and-swap semantics: of two racing
/// transitions, whichever is legal against the current status wins and the
/// other is rejected.
pub struct CommandStore {
    db: DBWithThreadMode<MultiThreaded>,
    transition_lock: Mutex<()>,
    ids: Mutex<DispatchIdGenerator>,
    drain_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CommandStore {
    pub fn open(path: PathBuf, node_id: u16) -> Result<Self> {
        if node_id > MAX_NODE_ID {
            return Err(FleetError::Config(format!(
                "node id {} exceeds maximum {}",
                node_id, MAX_NODE_ID
            )));
        }

        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path)?;

        Ok(Self {
            db,
            transition_lock: Mutex::new(()),
            ids: Mutex::new(DispatchIdGenerator::new(node_id)),
            drain_locks: Mutex::new(HashMap::new()),
        })
    }

    fn next_id(&self) -> DispatchId {
        self.ids.lock().next_id()
    }

    // ----- devices -----------------------------------------------------

    pub fn register_device(&self, device_id: &str, name: Option<String>) -> Result<DeviceRecord> {
        // Device ids become key segments; a control character (the 0x1F
        // separator in particular) would let one id alias another's keys.
        if device_id.is_empty() || device_id.chars().any(char::is_control) {
            return Err(FleetError::InvalidDeviceId(device_id.to_string()));
        }

        let now = Utc::now();
        let record = match self.get_device(device_id)? {
            Some(mut existing) => {
                if name.is_some() {
                    existing.name = name;
                }
                existing.last_seen = Some(now);
                existing
            }
            None => DeviceRecord {
                device_id: device_id.to_string(),
                name,
                registered_at: now,
                last_seen: None,
            },
        };

        self.db
            .put(device_key(device_id), serde_json::to_vec(&record)?)?;
        debug!(device = device_id, "device registered");
        Ok(record)
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        match self.db.get(device_key(device_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn device_exists(&self, device_id: &str) -> Result<bool> {
        Ok(self.db.get(device_key(device_id))?.is_some())
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let prefix = key_with_segments(&[PREFIX_DEVICE]);
        let mut devices = Vec::new();
        for item in self.prefix_iter(&prefix) {
            let (_, value) = item?;
            devices.push(serde_json::from_slice(&value)?);
        }
        Ok(devices)
    }

    /// Refresh `last_seen` for a device that just showed signs of life.
    pub fn touch_device(&self, device_id: &str) -> Result<()> {
        if let Some(mut record) = self.get_device(device_id)? {
            record.last_seen = Some(Utc::now());
            self.db
                .put(device_key(device_id), serde_json::to_vec(&record)?)?;
        }
        Ok(())
    }

    pub fn last_seen(&self, device_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get_device(device_id)?.and_then(|record| record.last_seen))
    }

    // ----- command records ---------------------------------------------

    pub fn create_command(&self, input: CreateCommand) -> Result<CommandRecord> {
        if !self.device_exists(&input.device_id)? {
            return Err(FleetError::DeviceNotFound(input.device_id));
        }

        let now = Utc::now();
        let record = CommandRecord {
            id: self.next_id(),
            device_id: input.device_id,
            kind: input.kind,
            payload: input.payload,
            status: CommandStatus::Pending,
            priority: input.priority,
            retry_count: 0,
            max_retries: input.max_retries,
            created_at: now,
            sent_at: None,
            acknowledged_at: None,
            completed_at: None,
            expires_at: now + Duration::seconds(input.ttl_seconds.max(1)),
            response_data: None,
            error_message: None,
        };

        let mut batch = WriteBatch::default();
        batch.put(command_key(record.id), serde_json::to_vec(&record)?);
        batch.put(device_index_key(&record.device_id, record.id), b"");
        self.db.write(batch)?;

        counter!("fleetlink_commands_created").increment(1);
        Ok(record)
    }

    pub fn get_command(&self, id: DispatchId) -> Result<CommandRecord> {
        match self.db.get(command_key(id))? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(FleetError::CommandNotFound),
        }
    }

    pub fn list_commands(
        &self,
        device_id: Option<&str>,
        status: Option<CommandStatus>,
    ) -> Result<Vec<CommandRecord>> {
        let mut commands = Vec::new();

        match device_id {
            Some(device) => {
                let prefix = key_with_segments(&[PREFIX_DEVICE_INDEX, device]);
                for item in self.prefix_iter(&prefix) {
                    let (key, _) = item?;
                    let id = parse_trailing_id(&key)?;
                    match self.get_command(id) {
                        Ok(record) => commands.push(record),
                        // Index rows may briefly outlive a deleted command.
                        Err(FleetError::CommandNotFound) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }
            None => {
                let prefix = key_with_segments(&[PREFIX_COMMAND]);
                for item in self.prefix_iter(&prefix) {
                    let (_, value) = item?;
                    commands.push(serde_json::from_slice::<CommandRecord>(&value)?);
                }
            }
        }

        if let Some(wanted) = status {
            commands.retain(|record| record.status == wanted);
        }
        Ok(commands)
    }

    /// Cancel a command: removes the record, its device index row, and any
    /// queue entry in one atomic batch.
    pub fn delete_command(&self, id: DispatchId) -> Result<()> {
        let _guard = self.transition_lock.lock();
        let record = self.get_command(id)?;

        let mut batch = WriteBatch::default();
        batch.delete(command_key(id));
        batch.delete(device_index_key(&record.device_id, id));
        self.remove_queue_entries(&mut batch, &record.device_id, id)?;
        self.db.write(batch)?;

        counter!("fleetlink_commands_cancelled").increment(1);
        info!(command = %id, device = record.device_id, "command cancelled");
        Ok(())
    }

    // ----- status transitions ------------------------------------------

    /// Apply a lifecycle transition against the currently persisted status.
    ///
    /// Re-reporting the same terminal status is an idempotent no-op so that
    /// duplicate device reports do not surface as errors. Any transition
    /// into a terminal state removes a surviving queue entry in the same
    /// batch.
    pub fn apply_transition(
        &self,
        id: DispatchId,
        next: CommandStatus,
        response_data: Option<Value>,
        error_message: Option<String>,
    ) -> Result<CommandRecord> {
        let _guard = self.transition_lock.lock();
        let record = self.get_command(id)?;

        if record.status == next && next.is_terminal() {
            debug!(command = %id, status = %next, "duplicate terminal report ignored");
            return Ok(record);
        }
        if !record.status.can_transition_to(next) {
            return Err(FleetError::IllegalTransition {
                from: record.status.to_string(),
                to: next.to_string(),
            });
        }

        let mut batch = WriteBatch::default();
        let updated = self.stamp_transition(record, next, response_data, error_message);
        if next.is_terminal() {
            self.remove_queue_entries(&mut batch, &updated.device_id, id)?;
        }
        batch.put(command_key(id), serde_json::to_vec(&updated)?);
        self.db.write(batch)?;

        counter!("fleetlink_status_transitions", "to" => next.as_str()).increment(1);
        Ok(updated)
    }

    fn stamp_transition(
        &self,
        mut record: CommandRecord,
        next: CommandStatus,
        response_data: Option<Value>,
        error_message: Option<String>,
    ) -> CommandRecord {
        let now = Utc::now();
        record.status = next;
        match next {
            CommandStatus::Sent => {
                record.sent_at.get_or_insert(now);
            }
            CommandStatus::Acknowledged => {
                record.acknowledged_at.get_or_insert(now);
            }
            CommandStatus::Completed => {
                record.completed_at = Some(now);
                record.response_data = response_data;
            }
            CommandStatus::Failed => {
                record.completed_at = Some(now);
                record.error_message = error_message;
            }
            CommandStatus::Expired => {
                record.completed_at = Some(now);
            }
            CommandStatus::Pending => {}
        }
        record
    }

    /// Record a transport-confirmed delivery failure. Consumes one retry, or
    /// forces the command to `failed` once the budget is spent.
    pub fn record_push_failure(&self, id: DispatchId) -> Result<RetryDisposition> {
        let _guard = self.transition_lock.lock();
        let mut record = self.get_command(id)?;

        if record.status.is_terminal() {
            return Ok(RetryDisposition::Exhausted);
        }

        if record.retry_count < record.max_retries {
            record.retry_count += 1;
            self.db.put(command_key(id), serde_json::to_vec(&record)?)?;
            counter!("fleetlink_push_retries").increment(1);
            return Ok(RetryDisposition::Retry);
        }

        let attempts = record.retry_count;
        let failed = self.stamp_transition(
            record,
            CommandStatus::Failed,
            None,
            Some(FleetError::RetryLimitExceeded(attempts).to_string()),
        );
        let mut batch = WriteBatch::default();
        self.remove_queue_entries(&mut batch, &failed.device_id, id)?;
        batch.put(command_key(id), serde_json::to_vec(&failed)?);
        self.db.write(batch)?;

        warn!(command = %id, attempts, "retry budget exhausted, command failed");
        Ok(RetryDisposition::Exhausted)
    }

    // ----- pending queue -----------------------------------------------

    /// Park a command for an offline device. Caller (the delivery router)
    /// guarantees the command is still `pending`.
    pub fn enqueue_pending(&self, record: &CommandRecord) -> Result<PendingEntry> {
        let entry = PendingEntry {
            entry_id: self.next_id(),
            command_id: record.id,
            device_id: record.device_id.clone(),
            kind: record.kind,
            payload: record.payload.clone(),
            priority: record.priority,
            created_at: record.created_at,
            expires_at: record.expires_at,
        };

        self.db.put(
            queue_key(&entry.device_id, entry.entry_id),
            serde_json::to_vec(&entry)?,
        )?;

        counter!("fleetlink_commands_queued").increment(1);
        debug!(command = %record.id, device = record.device_id, "command queued");
        Ok(entry)
    }

    /// Hand out every live queue entry for a device, at most once.
    ///
    /// Entries come back in priority-descending order; within a priority
    /// band the command's creation time breaks the tie (entry ids are only
    /// the final disambiguator, since racing creators can enqueue out of
    /// creation order). In the same logical operation the parent
    /// commands move `pending -> sent` and the entries are deleted, so a
    /// concurrent drain for the same device observes a disjoint (usually
    /// empty) result. Expired entries found along the way are reaped inline.
    pub fn drain_pending(&self, device_id: &str) -> Result<Vec<PendingEntry>> {
        let device_lock = self.drain_lock_for(device_id);
        let _device_guard = device_lock.lock();
        let started = Instant::now();

        let prefix = key_with_segments(&[PREFIX_QUEUE, device_id]);
        let mut candidates: Vec<PendingEntry> = Vec::new();
        for item in self.prefix_iter(&prefix) {
            let (_, value) = item?;
            candidates.push(serde_json::from_slice(&value)?);
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.entry_id.cmp(&b.entry_id))
        });

        let now = Utc::now();
        let mut delivered = Vec::new();
        {
            let _guard = self.transition_lock.lock();
            let mut batch = WriteBatch::default();

            for entry in candidates {
                batch.delete(queue_key(device_id, entry.entry_id));

                if entry.expires_at <= now {
                    self.expire_in_batch(&mut batch, entry.command_id)?;
                    continue;
                }

                // The parent may have been cancelled or already resolved;
                // only a still-pending command is handed off.
                match self.get_command(entry.command_id) {
                    Ok(record) if record.status == CommandStatus::Pending => {
                        let sent =
                            self.stamp_transition(record, CommandStatus::Sent, None, None);
                        batch.put(command_key(sent.id), serde_json::to_vec(&sent)?);
                        delivered.push(entry);
                    }
                    Ok(record) => {
                        debug!(
                            command = %entry.command_id,
                            status = %record.status,
                            "skipping queue entry for non-pending command"
                        );
                    }
                    Err(FleetError::CommandNotFound) => {
                        debug!(command = %entry.command_id, "skipping orphaned queue entry");
                    }
                    Err(err) => return Err(err),
                }
            }

            self.db.write(batch)?;
        }

        histogram!("fleetlink_drain_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        counter!("fleetlink_commands_drained").increment(delivered.len() as u64);
        if !delivered.is_empty() {
            info!(device = device_id, count = delivered.len(), "pending queue drained");
        }
        Ok(delivered)
    }

    pub fn pending_entries(&self, device_id: &str) -> Result<Vec<PendingEntry>> {
        let prefix = key_with_segments(&[PREFIX_QUEUE, device_id]);
        let mut entries = Vec::new();
        for item in self.prefix_iter(&prefix) {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    // ----- expiry sweep ------------------------------------------------

    /// One sweeper pass: every non-terminal command past its deadline moves
    /// to `expired` and loses its queue entry. Status is re-checked under
    /// the transition lock, so an entry consumed by a drain moments earlier
    /// is never double-expired.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();

        let prefix = key_with_segments(&[PREFIX_COMMAND]);
        let mut overdue: Vec<DispatchId> = Vec::new();
        for item in self.prefix_iter(&prefix) {
            let (_, value) = item?;
            let record: CommandRecord = serde_json::from_slice(&value)?;
            if record.is_expired_at(now) {
                overdue.push(record.id);
            }
        }

        for id in overdue {
            let _guard = self.transition_lock.lock();
            let record = self.get_command(id)?;
            if !record.is_expired_at(now) {
                // A drain or device report won the race; leave it alone.
                continue;
            }
            let mut batch = WriteBatch::default();
            let expired = self.stamp_transition(record, CommandStatus::Expired, None, None);
            stats.removed_entries +=
                self.remove_queue_entries(&mut batch, &expired.device_id, id)?;
            batch.put(command_key(id), serde_json::to_vec(&expired)?);
            self.db.write(batch)?;
            stats.expired_commands += 1;
        }

        // Queue entries whose parent already resolved (or vanished) are
        // garbage regardless of their own deadline.
        let queue_prefix = key_with_segments(&[PREFIX_QUEUE]);
        let mut orphaned: Vec<(String, DispatchId)> = Vec::new();
        for item in self.prefix_iter(&queue_prefix) {
            let (_, value) = item?;
            let entry: PendingEntry = serde_json::from_slice(&value)?;
            let stale = match self.get_command(entry.command_id) {
                Ok(record) => record.status != CommandStatus::Pending,
                Err(FleetError::CommandNotFound) => true,
                Err(err) => return Err(err),
            };
            if stale || entry.expires_at <= now {
                orphaned.push((entry.device_id, entry.entry_id));
            }
        }
        if !orphaned.is_empty() {
            let mut batch = WriteBatch::default();
            for (device_id, entry_id) in &orphaned {
                batch.delete(queue_key(device_id, *entry_id));
            }
            self.db.write(batch)?;
            stats.removed_entries += orphaned.len();
        }

        counter!("fleetlink_commands_expired").increment(stats.expired_commands as u64);
        Ok(stats)
    }

    // ----- internals ---------------------------------------------------

    fn drain_lock_for(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.drain_locks.lock();
        Arc::clone(
            locks
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Expire a command inside an existing batch. Caller holds the
    /// transition lock.
    fn expire_in_batch(&self, batch: &mut WriteBatch, id: DispatchId) -> Result<()> {
        match self.get_command(id) {
            Ok(record) if record.status.can_transition_to(CommandStatus::Expired) => {
                let expired = self.stamp_transition(record, CommandStatus::Expired, None, None);
                batch.put(command_key(id), serde_json::to_vec(&expired)?);
            }
            Ok(_) | Err(FleetError::CommandNotFound) => {}
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Delete every queue entry belonging to `command_id` for `device_id`.
    fn remove_queue_entries(
        &self,
        batch: &mut WriteBatch,
        device_id: &str,
        command_id: DispatchId,
    ) -> Result<usize> {
        let prefix = key_with_segments(&[PREFIX_QUEUE, device_id]);
        let mut removed = 0;
        for item in self.prefix_iter(&prefix) {
            let (key, value) = item?;
            let entry: PendingEntry = serde_json::from_slice(&value)?;
            if entry.command_id == command_id {
                batch.delete(key.to_vec());
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn prefix_iter(
        &self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + '_ {
        let owned = prefix.to_vec();
        self.db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
            .map(|item| item.map_err(FleetError::from))
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(&owned),
                Err(_) => true,
            })
    }
}

fn key_with_segments(segments: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    for (index, segment) in segments.iter().enumerate() {
        if index > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(segment.as_bytes());
    }
    key.push(SEP);
    key
}

fn device_key(device_id: &str) -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_DEVICE]);
    key.extend_from_slice(device_id.as_bytes());
    key
}

fn command_key(id: DispatchId) -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_COMMAND]);
    key.extend_from_slice(padded_id(id).as_bytes());
    key
}

fn device_index_key(device_id: &str, id: DispatchId) -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_DEVICE_INDEX, device_id]);
    key.extend_from_slice(padded_id(id).as_bytes());
    key
}

fn queue_key(device_id: &str, entry_id: DispatchId) -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_QUEUE, device_id]);
    key.extend_from_slice(padded_id(entry_id).as_bytes());
    key
}

/// Zero-padded so lexicographic key order matches numeric id order.
fn padded_id(id: DispatchId) -> String {
    format!("{:020}", id.as_u64())
}

fn parse_trailing_id(key: &[u8]) -> Result<DispatchId> {
    let position = key
        .iter()
        .rposition(|byte| *byte == SEP)
        .ok_or_else(|| FleetError::Storage("malformed index key".to_string()))?;
    let digits = std::str::from_utf8(&key[position + 1..])
        .map_err(|err| FleetError::Storage(err.to_string()))?;
    digits
        .parse()
        .map_err(|_| FleetError::Storage(format!("malformed id segment: {digits}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store(dir: &tempfile::TempDir) -> CommandStore {
        CommandStore::open(dir.path().join("dispatch"), 0).unwrap()
    }

    fn seed_device(store: &CommandStore, device_id: &str) {
        store.register_device(device_id, None).unwrap();
    }

    fn create(store: &CommandStore, device: &str, kind: CommandKind) -> CommandRecord {
        store
            .create_command(CreateCommand {
                device_id: device.to_string(),
                kind,
                payload: json!({}),
                priority: Priority::Normal,
                ttl_seconds: 3_600,
                max_retries: 3,
            })
            .unwrap()
    }

    #[test]
    fn create_rejects_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let err = store
            .create_command(CreateCommand {
                device_id: "ghost".to_string(),
                kind: CommandKind::LockDevice,
                payload: json!({}),
                priority: Priority::Normal,
                ttl_seconds: 60,
                max_retries: 3,
            })
            .unwrap_err();
        assert!(matches!(err, FleetError::DeviceNotFound(_)));
    }

    #[test]
    fn lifecycle_happy_path_sets_stage_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let record = create(&store, "d1", CommandKind::TakePhoto);
        assert_eq!(record.status, CommandStatus::Pending);
        assert!(record.sent_at.is_none());

        let sent = store
            .apply_transition(record.id, CommandStatus::Sent, None, None)
            .unwrap();
        assert!(sent.sent_at.is_some());
        assert!(sent.acknowledged_at.is_none());

        let acked = store
            .apply_transition(record.id, CommandStatus::Acknowledged, None, None)
            .unwrap();
        assert!(acked.acknowledged_at.is_some());

        let done = store
            .apply_transition(
                record.id,
                CommandStatus::Completed,
                Some(json!({"ok": true})),
                None,
            )
            .unwrap();
        assert_eq!(done.status, CommandStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.response_data, Some(json!({"ok": true})));
    }

    #[test]
    fn illegal_transition_leaves_record_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let record = create(&store, "d1", CommandKind::SyncConfig);
        store
            .apply_transition(record.id, CommandStatus::Sent, None, None)
            .unwrap();
        store
            .apply_transition(record.id, CommandStatus::Acknowledged, None, None)
            .unwrap();
        store
            .apply_transition(record.id, CommandStatus::Completed, None, None)
            .unwrap();

        let err = store
            .apply_transition(record.id, CommandStatus::Sent, None, None)
            .unwrap_err();
        assert!(matches!(err, FleetError::IllegalTransition { .. }));

        let stored = store.get_command(record.id).unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
    }

    #[test]
    fn duplicate_terminal_report_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let record = create(&store, "d1", CommandKind::GetLocation);
        store
            .apply_transition(record.id, CommandStatus::Sent, None, None)
            .unwrap();
        store
            .apply_transition(record.id, CommandStatus::Acknowledged, None, None)
            .unwrap();
        let first = store
            .apply_transition(
                record.id,
                CommandStatus::Completed,
                Some(json!({"lat": 1.0})),
                None,
            )
            .unwrap();

        let second = store
            .apply_transition(
                record.id,
                CommandStatus::Completed,
                Some(json!({"lat": 2.0})),
                None,
            )
            .unwrap();
        assert_eq!(second.completed_at, first.completed_at);
        assert_eq!(second.response_data, Some(json!({"lat": 1.0})));
    }

    #[test]
    fn drain_orders_by_priority_then_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let mut issued = Vec::new();
        for (kind, priority) in [
            (CommandKind::ListApps, Priority::Low),
            (CommandKind::LockDevice, Priority::Urgent),
            (CommandKind::SyncConfig, Priority::Normal),
            (CommandKind::PushFile, Priority::Urgent),
            (CommandKind::TakePhoto, Priority::High),
        ] {
            let record = store
                .create_command(CreateCommand {
                    device_id: "d1".to_string(),
                    kind,
                    payload: json!({}),
                    priority,
                    ttl_seconds: 3_600,
                    max_retries: 3,
                })
                .unwrap();
            store.enqueue_pending(&record).unwrap();
            issued.push(record);
        }

        let drained = store.drain_pending("d1").unwrap();
        let kinds: Vec<CommandKind> = drained.iter().map(|entry| entry.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::LockDevice,
                CommandKind::PushFile,
                CommandKind::TakePhoto,
                CommandKind::SyncConfig,
                CommandKind::ListApps,
            ]
        );

        for entry in &drained {
            let record = store.get_command(entry.command_id).unwrap();
            assert_eq!(record.status, CommandStatus::Sent);
            assert!(record.sent_at.is_some());
        }

        // Hand-off is at-most-once.
        assert!(store.drain_pending("d1").unwrap().is_empty());
        assert!(store.pending_entries("d1").unwrap().is_empty());
    }

    #[test]
    fn drain_breaks_priority_ties_by_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let first = create(&store, "d1", CommandKind::TakePhoto);
        let second = create(&store, "d1", CommandKind::SyncConfig);

        // Racing creators can enqueue out of creation order; the younger
        // command getting the smaller entry id must not jump the line.
        store.enqueue_pending(&second).unwrap();
        store.enqueue_pending(&first).unwrap();

        let drained = store.drain_pending("d1").unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].command_id, first.id);
        assert_eq!(drained[1].command_id, second.id);
    }

    #[test]
    fn drain_skips_cancelled_commands() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let keep = create(&store, "d1", CommandKind::TakePhoto);
        let cancel = create(&store, "d1", CommandKind::WipeData);
        store.enqueue_pending(&keep).unwrap();
        store.enqueue_pending(&cancel).unwrap();
        store.delete_command(cancel.id).unwrap();

        let drained = store.drain_pending("d1").unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].command_id, keep.id);
    }

    #[test]
    fn delete_cascades_queue_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let record = create(&store, "d1", CommandKind::PullFile);
        store.enqueue_pending(&record).unwrap();
        assert_eq!(store.pending_entries("d1").unwrap().len(), 1);

        store.delete_command(record.id).unwrap();
        assert!(store.pending_entries("d1").unwrap().is_empty());
        assert!(matches!(
            store.get_command(record.id),
            Err(FleetError::CommandNotFound)
        ));
    }

    #[test]
    fn sweep_expires_overdue_commands_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let record = store
            .create_command(CreateCommand {
                device_id: "d1".to_string(),
                kind: CommandKind::ShowMessage,
                payload: json!({"text": "hi"}),
                priority: Priority::Normal,
                ttl_seconds: 1,
                max_retries: 3,
            })
            .unwrap();
        store.enqueue_pending(&record).unwrap();

        let later = Utc::now() + Duration::seconds(5);
        let stats = store.sweep_expired(later).unwrap();
        assert_eq!(stats.expired_commands, 1);
        assert!(stats.removed_entries >= 1);

        let stored = store.get_command(record.id).unwrap();
        assert_eq!(stored.status, CommandStatus::Expired);
        assert!(store.pending_entries("d1").unwrap().is_empty());

        // A second pass finds nothing to do.
        let stats = store.sweep_expired(later).unwrap();
        assert!(stats.is_empty());
    }

    #[test]
    fn sweep_leaves_acknowledged_commands_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let record = store
            .create_command(CreateCommand {
                device_id: "d1".to_string(),
                kind: CommandKind::RecordAudio,
                payload: json!({}),
                priority: Priority::Normal,
                ttl_seconds: 1,
                max_retries: 3,
            })
            .unwrap();
        store
            .apply_transition(record.id, CommandStatus::Sent, None, None)
            .unwrap();
        store
            .apply_transition(record.id, CommandStatus::Acknowledged, None, None)
            .unwrap();

        let later = Utc::now() + Duration::seconds(5);
        store.sweep_expired(later).unwrap();
        let stored = store.get_command(record.id).unwrap();
        assert_eq!(stored.status, CommandStatus::Acknowledged);
    }

    #[test]
    fn retry_budget_forces_failed_at_the_bound() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");

        let record = store
            .create_command(CreateCommand {
                device_id: "d1".to_string(),
                kind: CommandKind::Reboot,
                payload: json!({}),
                priority: Priority::Normal,
                ttl_seconds: 3_600,
                max_retries: 2,
            })
            .unwrap();

        assert_eq!(
            store.record_push_failure(record.id).unwrap(),
            RetryDisposition::Retry
        );
        assert_eq!(
            store.record_push_failure(record.id).unwrap(),
            RetryDisposition::Retry
        );
        let stored = store.get_command(record.id).unwrap();
        assert_eq!(stored.retry_count, 2);
        assert!(stored.retry_count <= stored.max_retries);

        assert_eq!(
            store.record_push_failure(record.id).unwrap(),
            RetryDisposition::Exhausted
        );
        let stored = store.get_command(record.id).unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        assert!(stored.retry_count <= stored.max_retries);
        assert!(
            stored
                .error_message
                .as_deref()
                .unwrap_or_default()
                .contains("retry limit"),
        );
    }

    #[test]
    fn list_filters_by_device_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        seed_device(&store, "d1");
        seed_device(&store, "d2");

        let a = create(&store, "d1", CommandKind::TakePhoto);
        let _b = create(&store, "d1", CommandKind::SyncConfig);
        let _c = create(&store, "d2", CommandKind::LockDevice);

        store
            .apply_transition(a.id, CommandStatus::Sent, None, None)
            .unwrap();

        assert_eq!(store.list_commands(Some("d1"), None).unwrap().len(), 2);
        assert_eq!(store.list_commands(Some("d2"), None).unwrap().len(), 1);
        assert_eq!(store.list_commands(None, None).unwrap().len(), 3);

        let sent = store
            .list_commands(Some("d1"), Some(CommandStatus::Sent))
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, a.id);
    }

    #[test]
    fn registration_rejects_ids_with_control_characters() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for bad in ["", "dev\u{1f}other", "tablet\nseven", "d\t1"] {
            let err = store.register_device(bad, None).unwrap_err();
            assert!(
                matches!(err, FleetError::InvalidDeviceId(_)),
                "{bad:?} must be rejected"
            );
        }
        assert!(store.list_devices().unwrap().is_empty());

        store.register_device("tablet-7", None).unwrap();
    }

    #[test]
    fn device_registration_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let first = store
            .register_device("d1", Some("front desk tablet".to_string()))
            .unwrap();
        let second = store.register_device("d1", None).unwrap();
        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.name.as_deref(), Some("front desk tablet"));
        assert!(second.last_seen.is_some());
    }
}
