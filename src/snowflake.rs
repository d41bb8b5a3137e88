use std::{
    fmt,
    str::FromStr,
    thread::sleep,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Custom epoch (2024-01-01T00:00:00Z) expressed in milliseconds.
const EPOCH_MILLIS: u64 = 1_704_067_200_000;
const NODE_ID_BITS: u8 = 8;
const SEQUENCE_BITS: u8 = 14;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;

/// Generates time-ordered 64-bit ids for commands and queue entries.
///
/// Ids issued by one generator are strictly increasing, which makes the id
/// itself usable as a creation-order tie-break when sorting queue entries.
#[derive(Debug)]
pub struct DispatchIdGenerator {
    node_id: u16,
    last_timestamp: u64,
    sequence: u16,
}

impl DispatchIdGenerator {
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: node_id & MAX_NODE_ID,
            last_timestamp: 0,
            sequence: 0,
        }
    }

    pub fn next_id(&mut self) -> DispatchId {
        loop {
            let mut timestamp = current_millis();
            if timestamp < self.last_timestamp {
                // Clock went backwards; wait it out rather than risk a
                // duplicate id.
                let wait = self.last_timestamp - timestamp;
                sleep(Duration::from_millis(wait));
                continue;
            }

            if timestamp == self.last_timestamp {
                self.sequence = (self.sequence + 1) & MAX_SEQUENCE;
                if self.sequence == 0 {
                    timestamp = wait_next_millis(self.last_timestamp);
                }
            } else {
                self.sequence = 0;
            }

            self.last_timestamp = timestamp;
            let elapsed = timestamp - EPOCH_MILLIS;
            let id = (elapsed << (NODE_ID_BITS + SEQUENCE_BITS))
                | ((self.node_id as u64) << SEQUENCE_BITS)
                | self.sequence as u64;
            return DispatchId(id);
        }
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_millis() as u64
}

fn wait_next_millis(last_timestamp: u64) -> u64 {
    loop {
        let now = current_millis();
        if now > last_timestamp {
            return now;
        }
        sleep(Duration::from_millis(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DispatchId(pub u64);

impl DispatchId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DispatchId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u64>().map(DispatchId)
    }
}

// Ids cross the wire as strings so JavaScript clients never lose precision.
impl Serialize for DispatchId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for DispatchId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
