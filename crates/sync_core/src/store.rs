use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use shared::{
    domain::{MessageId, PeerId},
    protocol::MessageRecord,
};

/// Local-only lifecycle of an outbound message. Never serialized to the
/// durable store; remote-originated entries enter directly as `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Sending,
    Sent,
    Error,
}

/// UI-facing tick derived from delivery state, read flag, and whether the
/// remote party is currently online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMarker {
    Pending,
    Failed,
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub record: MessageRecord,
    pub delivery: DeliveryState,
}

/// One sorted, overlay-filtered timeline entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub record: MessageRecord,
    pub delivery: DeliveryState,
    pub marker: DeliveryMarker,
}

/// Canonical in-memory collection for one conversation, keyed by message
/// id. This is the single mutation point: every channel funnels through
/// `upsert`/`remove`, which is what makes arbitrary interleavings of
/// channel completions safe.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: HashMap<MessageId, StoredMessage>,
}

impl MessageStore {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&StoredMessage> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.entries.keys().cloned().collect()
    }

    /// Insert-or-merge keyed by id. Returns whether anything changed.
    ///
    /// Merge rules:
    /// - candidate fields win, except the three below;
    /// - `delivery`: once `Sent`, stays `Sent`; otherwise an explicit
    ///   candidate state wins and the existing state is kept when the
    ///   candidate supplies none (`fallback` applies only to fresh
    ///   inserts);
    /// - `is_read`: logical OR, never regresses;
    /// - `created_at`: immutable once set; a candidate may only fill in a
    ///   missing timestamp.
    pub fn upsert(
        &mut self,
        record: MessageRecord,
        explicit: Option<DeliveryState>,
        fallback: DeliveryState,
    ) -> bool {
        if !record.has_usable_id() {
            warn!("refusing to upsert a message without a usable id");
            return false;
        }
        let record = record.normalized();

        if let Some(existing) = self.entries.get_mut(&record.id) {
            let merged_delivery = merge_delivery(existing.delivery, explicit);
            let merged_record = merge_records(&existing.record, record);
            let changed = merged_record != existing.record || merged_delivery != existing.delivery;
            existing.record = merged_record;
            existing.delivery = merged_delivery;
            return changed;
        }

        if record.created_at.is_none() {
            warn!(message_id = %record.id, "message has no usable creation timestamp; ordering it last");
        }
        self.entries.insert(
            record.id.clone(),
            StoredMessage {
                record,
                delivery: explicit.unwrap_or(fallback),
            },
        );
        true
    }

    /// Exact-key delete. Absent keys are a no-op, which makes duplicate
    /// and out-of-order delete events harmless.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Flips the read flag on every message sent by `sender`. Used both
    /// for applying a remote read receipt (sender = local party) and for
    /// the local read sweep (sender = remote party).
    pub fn mark_read_from(&mut self, sender: &PeerId) -> bool {
        let sender = sender.normalized();
        let mut changed = false;
        for entry in self.entries.values_mut() {
            if entry.record.sender == sender && !entry.record.is_read {
                entry.record.is_read = true;
                changed = true;
            }
        }
        changed
    }

    /// Ids of messages from `sender` to `receiver` not yet marked read.
    pub fn unread_from(&self, sender: &PeerId, receiver: &PeerId) -> Vec<MessageId> {
        let sender = sender.normalized();
        let receiver = receiver.normalized();
        self.entries
            .values()
            .filter(|entry| {
                entry.record.sender == sender
                    && entry.record.receiver == receiver
                    && !entry.record.is_read
            })
            .map(|entry| entry.record.id.clone())
            .collect()
    }

    /// Conditional delivery transition; fires only while the entry is
    /// still in `from`. The send watchdog relies on this to never clobber
    /// a confirmation that won the race.
    pub fn set_delivery_if(
        &mut self,
        id: &MessageId,
        from: DeliveryState,
        to: DeliveryState,
    ) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.delivery == from => {
                entry.delivery = to;
                true
            }
            _ => false,
        }
    }

    /// Newest creation timestamp among messages from `sender`, used to
    /// seed last-seen inference from conversation history.
    pub fn latest_created_at_from(&self, sender: &PeerId) -> Option<DateTime<Utc>> {
        let sender = sender.normalized();
        self.entries
            .values()
            .filter(|entry| entry.record.sender == sender)
            .filter_map(|entry| entry.record.created_at)
            .max()
    }

    /// Sorted view with the per-device hidden overlay applied. Entries
    /// with no parsable timestamp sort last; ties break on id so the
    /// ordering is deterministic.
    pub fn visible(&self, hidden: &HashSet<MessageId>, remote_online: bool) -> Vec<TimelineEntry> {
        let mut entries: Vec<&StoredMessage> = self
            .entries
            .values()
            .filter(|entry| !hidden.contains(&entry.record.id))
            .collect();
        entries.sort_by(|a, b| timeline_order(a, b));
        entries
            .into_iter()
            .map(|entry| TimelineEntry {
                record: entry.record.clone(),
                delivery: entry.delivery,
                marker: marker_for(entry, remote_online),
            })
            .collect()
    }
}

fn merge_delivery(existing: DeliveryState, explicit: Option<DeliveryState>) -> DeliveryState {
    if existing == DeliveryState::Sent {
        return DeliveryState::Sent;
    }
    explicit.unwrap_or(existing)
}

fn merge_records(existing: &MessageRecord, candidate: MessageRecord) -> MessageRecord {
    MessageRecord {
        id: existing.id.clone(),
        sender: candidate.sender,
        receiver: candidate.receiver,
        text: candidate.text,
        image_url: candidate.image_url,
        audio_url: candidate.audio_url,
        created_at: existing.created_at.or(candidate.created_at),
        is_read: existing.is_read || candidate.is_read,
    }
}

fn marker_for(message: &StoredMessage, remote_online: bool) -> DeliveryMarker {
    match message.delivery {
        DeliveryState::Error => DeliveryMarker::Failed,
        DeliveryState::Sending => DeliveryMarker::Pending,
        DeliveryState::Sent => {
            if message.record.is_read {
                DeliveryMarker::Read
            } else if remote_online {
                DeliveryMarker::Delivered
            } else {
                DeliveryMarker::Sent
            }
        }
    }
}

fn timeline_order(a: &StoredMessage, b: &StoredMessage) -> Ordering {
    match (a.record.created_at, b.record.created_at) {
        (Some(left), Some(right)) => left
            .cmp(&right)
            .then_with(|| a.record.id.cmp(&b.record.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.record.id.cmp(&b.record.id),
    }
}

/// Buckets a sorted timeline by calendar day for date separators.
/// Entries without a timestamp land in a trailing `None` bucket.
pub fn day_groups(entries: &[TimelineEntry]) -> Vec<(Option<NaiveDate>, Vec<TimelineEntry>)> {
    let mut groups: Vec<(Option<NaiveDate>, Vec<TimelineEntry>)> = Vec::new();
    for entry in entries {
        let date = entry.record.created_at.map(|at| at.date_naive());
        match groups.last_mut() {
            Some((current, bucket)) if *current == date => bucket.push(entry.clone()),
            _ => groups.push((date, vec![entry.clone()])),
        }
    }
    groups
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
