use crate::clock::{Clock, SystemClock};
use crate::errors::LogError;
use crate::metrics_update;
use crate::types::{AuctionId, Event, EventKind};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const HASH_SIZE: usize = 32;
pub const GENESIS_HASH: [u8; HASH_SIZE] = [0u8; HASH_SIZE];

/// One link of the tamper-evident chain. The fingerprint covers the
/// auction id and wrapper timestamp as well as the event body, so an entry
/// cannot be re-dated without breaking every later hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: Uuid,
    pub auction_id: AuctionId,
    pub timestamp: DateTime<Utc>,
    pub event_hash: [u8; HASH_SIZE],
    pub previous_hash: [u8; HASH_SIZE],
    pub event: Event,
}

/// Deterministic, byte-stable encoding of the hashed fields. Struct field
/// order is fixed and every map inside `Event` is a `BTreeMap`, so the same
/// entry always serializes to the same bytes.
#[derive(Serialize)]
struct CanonicalEnvelope<'a> {
    auction_id: AuctionId,
    timestamp_ms: i64,
    event: &'a Event,
}

fn entry_hash(
    auction_id: AuctionId,
    timestamp: DateTime<Utc>,
    event: &Event,
    previous_hash: &[u8; HASH_SIZE],
) -> Result<[u8; HASH_SIZE], LogError> {
    let envelope = CanonicalEnvelope {
        auction_id,
        timestamp_ms: timestamp.timestamp_millis(),
        event,
    };
    let canonical = serde_json::to_vec(&envelope)?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.update(previous_hash);
    Ok(hasher.finalize().into())
}

/// Append-only, hash-chained event store shared by the controller and every
/// auction actor. Appends are serialized by the inner mutex; readers get a
/// consistent snapshot of some prefix of the chain.
pub struct EventLog {
    entries: Mutex<Vec<LogEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Appends `event` to the chain. The hash is computed before the chain
    /// is touched, so a failed encoding leaves no partial entry behind.
    pub fn append(&self, auction_id: AuctionId, event: Event) -> Result<LogEntry, LogError> {
        // Millisecond resolution: anything finer would not survive the
        // canonical encoding and would break verification on replay.
        let now = self.clock.now();
        let timestamp = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now);

        let mut entries = self.entries.lock().unwrap();
        let previous_hash = entries
            .last()
            .map(|entry| entry.event_hash)
            .unwrap_or(GENESIS_HASH);

        let event_hash = entry_hash(auction_id, timestamp, &event, &previous_hash)?;
        let entry = LogEntry {
            entry_id: Uuid::new_v4(),
            auction_id,
            timestamp,
            event_hash,
            previous_hash,
            event,
        };
        entries.push(entry.clone());

        metrics_update!(inc EVENTS_APPENDED_COUNT);

        Ok(entry)
    }

    /// Entries of one auction, in append order.
    pub fn query_by_auction(&self, auction_id: AuctionId) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.auction_id == auction_id)
            .cloned()
            .collect()
    }

    /// Entries of one event kind, in append order.
    pub fn query_by_type(&self, kind: EventKind) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.event.kind() == kind)
            .cloned()
            .collect()
    }

    /// Recomputes every fingerprint from the stored fields and checks the
    /// chain links. True iff nothing in the log has been altered.
    pub fn verify_integrity(&self) -> bool {
        let entries = self.entries.lock().unwrap();
        let mut expected_previous = GENESIS_HASH;

        for entry in entries.iter() {
            if entry.previous_hash != expected_previous {
                return false;
            }

            let recomputed = match entry_hash(
                entry.auction_id,
                entry.timestamp,
                &entry.event,
                &entry.previous_hash,
            ) {
                Ok(hash) => hash,
                Err(_) => return false,
            };

            if recomputed != entry.event_hash {
                return false;
            }

            expected_previous = entry.event_hash;
        }

        true
    }

    /// Feeds each entry of `auction_id` to `handler` in append order. The
    /// handler rebuilds whatever state it is interested in.
    pub fn replay<F>(&self, auction_id: AuctionId, mut handler: F)
    where
        F: FnMut(&LogEntry),
    {
        for entry in self.query_by_auction(auction_id) {
            handler(&entry);
        }
    }

    /// Snapshot of the whole chain, for persistence adapters.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn tamper<F>(&self, index: usize, mutate: F)
    where
        F: FnOnce(&mut LogEntry),
    {
        let mut entries = self.entries.lock().unwrap();
        mutate(&mut entries[index]);
    }
}
