//! Tracked set and pending change set of one unit of work.
//!
//! # Responsibility
//! - Keep the identity map `(entity type, key) -> document` for everything a
//!   context has loaded or been handed.
//! - Collapse successive changes to one identity into a single pending change.
//! - Undo individual `track` calls and discard all pending changes.
//!
//! # Invariants
//! - At most one entry per identity key; unkeyed entries are pending inserts
//!   waiting for a generated key.
//! - Pending changes are flushed in the order their entry first became
//!   pending.
//! - `accept` is the only path that turns pending entries into `Unchanged`.

use super::tracking::AppliedChange;
use super::{CommitReport, CommittedChange, StoreError, StoreResult, TrackMode, TrackTicket};
use crate::model::entity::{Document, EntityType};
use crate::model::key::EntityKey;
use std::collections::{BTreeMap, HashMap};

/// Tracking state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unchanged,
    Added,
    Modified,
    Removed,
}

impl From<TrackMode> for EntryState {
    fn from(mode: TrackMode) -> Self {
        match mode {
            TrackMode::Added => Self::Added,
            TrackMode::Modified => Self::Modified,
            TrackMode::Removed => Self::Removed,
        }
    }
}

impl EntryState {
    fn pending_mode(self) -> Option<TrackMode> {
        match self {
            Self::Unchanged => None,
            Self::Added => Some(TrackMode::Added),
            Self::Modified => Some(TrackMode::Modified),
            Self::Removed => Some(TrackMode::Removed),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    entity_type: EntityType,
    key: Option<EntityKey>,
    document: Document,
    state: EntryState,
    tickets: Vec<TrackTicket>,
    /// Last document known to be persisted.
    original: Option<Document>,
}

#[derive(Debug)]
struct UndoRecord {
    ticket: TrackTicket,
    slot: u64,
    before: Option<Entry>,
}

enum Transition {
    Become(EntryState),
    Detach,
    Conflict,
}

fn transition(current: EntryState, mode: TrackMode) -> Transition {
    match (current, mode) {
        (EntryState::Removed, TrackMode::Added) => Transition::Become(EntryState::Modified),
        (_, TrackMode::Added) => Transition::Conflict,
        (EntryState::Added, TrackMode::Modified) => Transition::Become(EntryState::Added),
        (_, TrackMode::Modified) => Transition::Become(EntryState::Modified),
        (EntryState::Added, TrackMode::Removed) => Transition::Detach,
        (_, TrackMode::Removed) => Transition::Become(EntryState::Removed),
    }
}

/// One pending change handed to a `BackingStore`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    slot: u64,
    entity_type: EntityType,
    key: Option<EntityKey>,
    document: Document,
    mode: TrackMode,
    tickets: Vec<TrackTicket>,
}

impl PendingChange {
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Identity key; `None` only for inserts with unset generated fields.
    pub fn key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn mode(&self) -> TrackMode {
        self.mode
    }

    /// Identity key of an update or removal.
    pub fn require_key(&self) -> StoreResult<EntityKey> {
        self.key.clone().ok_or_else(|| {
            StoreError::InvalidData(format!(
                "{} change for `{}` has no identity key",
                self.mode.as_str(),
                self.entity_type.name()
            ))
        })
    }
}

type Identity = (&'static str, EntityKey);

/// Identity map plus pending change set.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: BTreeMap<u64, Entry>,
    index: HashMap<Identity, u64>,
    undo: Vec<UndoRecord>,
    next_slot: u64,
    next_ticket: u64,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked entries, pending or not.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state != EntryState::Unchanged)
            .count()
    }

    /// Tracked state and document for an identity.
    pub fn get(&self, entity_type: EntityType, key: &EntityKey) -> Option<(EntryState, &Document)> {
        let slot = self.index.get(&(entity_type.name(), key.clone()))?;
        self.entries
            .get(slot)
            .map(|entry| (entry.state, &entry.document))
    }

    /// Starts tracking a loaded document as `Unchanged`.
    ///
    /// If the identity is already tracked, the tracked document wins and is
    /// returned instead.
    pub fn attach_unchanged(
        &mut self,
        entity_type: EntityType,
        key: EntityKey,
        document: Document,
    ) -> Document {
        if let Some((_, tracked)) = self.get(entity_type, &key) {
            return tracked.clone();
        }

        let slot = self.allocate_slot();
        self.index.insert((entity_type.name(), key.clone()), slot);
        self.entries.insert(
            slot,
            Entry {
                entity_type,
                key: Some(key),
                document: document.clone(),
                state: EntryState::Unchanged,
                tickets: Vec::new(),
                original: Some(document.clone()),
            },
        );
        document
    }

    /// Records a change, collapsing it with any pending change of the same
    /// identity.
    ///
    /// # Errors
    /// - `ConstraintViolation` when adding an identity that is already
    ///   tracked and not pending removal.
    pub fn track(
        &mut self,
        entity_type: EntityType,
        key: Option<EntityKey>,
        document: Document,
        mode: TrackMode,
    ) -> StoreResult<TrackTicket> {
        let existing = key
            .as_ref()
            .and_then(|key| self.index.get(&(entity_type.name(), key.clone())).copied());

        let Some(slot) = existing else {
            let ticket = self.allocate_ticket();
            let slot = self.allocate_slot();
            if let Some(key) = &key {
                self.index.insert((entity_type.name(), key.clone()), slot);
            }
            self.entries.insert(
                slot,
                Entry {
                    entity_type,
                    key,
                    document,
                    state: EntryState::from(mode),
                    tickets: vec![ticket],
                    original: None,
                },
            );
            self.undo.push(UndoRecord {
                ticket,
                slot,
                before: None,
            });
            return Ok(ticket);
        };

        let before = self.entries.get(&slot).cloned().ok_or_else(|| {
            StoreError::InvalidData(format!("tracked identity points at missing slot {slot}"))
        })?;

        let next = transition(before.state, mode);
        if let Transition::Conflict = next {
            return Err(StoreError::constraint(
                entity_type.name(),
                key,
                "identity is already tracked by this context",
            ));
        }

        let ticket = self.allocate_ticket();
        match next {
            Transition::Become(state) => {
                if let Some(entry) = self.entries.get_mut(&slot) {
                    entry.state = state;
                    entry.document = document;
                    entry.tickets.push(ticket);
                }
            }
            Transition::Detach => self.remove_slot(slot),
            Transition::Conflict => {}
        }

        self.undo.push(UndoRecord {
            ticket,
            slot,
            before: Some(before),
        });
        Ok(ticket)
    }

    /// Reverts the change recorded by `ticket`.
    ///
    /// Only the latest change of an identity can be reverted; returns `false`
    /// when `ticket` was superseded, already committed, or unknown.
    pub fn untrack(&mut self, ticket: TrackTicket) -> bool {
        let Some(position) = self.undo.iter().rposition(|record| record.ticket == ticket) else {
            return false;
        };
        let slot = self.undo[position].slot;
        if self.undo[position + 1..]
            .iter()
            .any(|record| record.slot == slot)
        {
            return false;
        }
        // The identity may have been re-added under another slot after a detach.
        if let Some(Entry {
            entity_type,
            key: Some(key),
            ..
        }) = &self.undo[position].before
        {
            if let Some(&current) = self.index.get(&(entity_type.name(), key.clone())) {
                if current != slot {
                    return false;
                }
            }
        }

        let record = self.undo.remove(position);
        self.remove_slot(record.slot);
        if let Some(entry) = record.before {
            if let Some(key) = &entry.key {
                self.index
                    .insert((entry.entity_type.name(), key.clone()), record.slot);
            }
            self.entries.insert(record.slot, entry);
        }
        true
    }

    /// Pending changes in flush order.
    pub fn pending(&self) -> Vec<PendingChange> {
        let mut pending: Vec<PendingChange> = self
            .entries
            .iter()
            .filter_map(|(slot, entry)| {
                let mode = entry.state.pending_mode()?;
                Some(PendingChange {
                    slot: *slot,
                    entity_type: entry.entity_type,
                    key: entry.key.clone(),
                    document: entry.document.clone(),
                    mode,
                    tickets: entry.tickets.clone(),
                })
            })
            .collect();
        pending.sort_by_key(|change| change.tickets.first().copied());
        pending
    }

    /// Marks `pending` as persisted with the documents the store wrote.
    ///
    /// `applied` must match `pending` one to one.
    pub fn accept(
        &mut self,
        pending: Vec<PendingChange>,
        applied: Vec<AppliedChange>,
    ) -> CommitReport {
        let mut changes = Vec::with_capacity(pending.len());

        for (change, applied) in pending.into_iter().zip(applied) {
            let entity = change.entity_type.name();
            match change.mode {
                TrackMode::Removed => {
                    self.remove_slot(change.slot);
                    changes.push(CommittedChange {
                        entity,
                        key: applied.key,
                        mode: change.mode,
                        document: None,
                        tickets: change.tickets,
                    });
                }
                TrackMode::Added | TrackMode::Modified => {
                    let document = applied.document.unwrap_or(change.document);
                    if let Some(entry) = self.entries.get_mut(&change.slot) {
                        entry.key = Some(applied.key.clone());
                        entry.document = document.clone();
                        entry.original = Some(document.clone());
                        entry.state = EntryState::Unchanged;
                        entry.tickets.clear();
                    }
                    self.index.insert((entity, applied.key.clone()), change.slot);
                    changes.push(CommittedChange {
                        entity,
                        key: applied.key,
                        mode: change.mode,
                        document: Some(document),
                        tickets: change.tickets,
                    });
                }
            }
        }

        self.undo.clear();
        CommitReport::new(changes)
    }

    /// Drops all pending changes.
    ///
    /// Entries with a known persisted document fall back to it as
    /// `Unchanged`; the rest leave the tracked set.
    pub fn discard(&mut self) {
        let pending_slots: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state != EntryState::Unchanged)
            .map(|(slot, _)| *slot)
            .collect();

        for slot in pending_slots {
            let Some(entry) = self.entries.get(&slot).cloned() else {
                continue;
            };
            self.remove_slot(slot);
            if entry.state == EntryState::Added {
                continue;
            }
            if let (Some(key), Some(original)) = (entry.key, entry.original) {
                self.index.insert((entry.entity_type.name(), key.clone()), slot);
                self.entries.insert(
                    slot,
                    Entry {
                        entity_type: entry.entity_type,
                        key: Some(key),
                        document: original.clone(),
                        state: EntryState::Unchanged,
                        tickets: Vec::new(),
                        original: Some(original),
                    },
                );
            }
        }

        self.undo.clear();
    }

    fn remove_slot(&mut self, slot: u64) {
        if let Some(entry) = self.entries.remove(&slot) {
            if let Some(key) = entry.key {
                self.index.remove(&(entry.entity_type.name(), key));
            }
        }
    }

    fn allocate_slot(&mut self) -> u64 {
        self.next_slot += 1;
        self.next_slot
    }

    fn allocate_ticket(&mut self) -> TrackTicket {
        self.next_ticket += 1;
        TrackTicket(self.next_ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeTracker, EntryState};
    use crate::context::{AppliedChange, StoreError, TrackMode};
    use crate::model::entity::{Document, EntityType, KeyField};
    use crate::model::key::{EntityKey, KeyKind};
    use serde_json::json;

    const NOTE_KEY: &[KeyField] = &[KeyField::assigned("id", KeyKind::Integer)];
    const NOTE: EntityType = EntityType::new("note", NOTE_KEY);

    fn doc(id: i64, body: &str) -> Document {
        match json!({"id": id, "body": body}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn key(id: i64) -> EntityKey {
        EntityKey::from(id)
    }

    #[test]
    fn added_then_modified_stays_added_with_new_document() {
        let mut tracker = ChangeTracker::new();
        let first = tracker
            .track(NOTE, Some(key(1)), doc(1, "a"), TrackMode::Added)
            .unwrap();
        let second = tracker
            .track(NOTE, Some(key(1)), doc(1, "b"), TrackMode::Modified)
            .unwrap();

        let pending = tracker.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].mode(), TrackMode::Added);
        assert_eq!(pending[0].document().get("body"), Some(&json!("b")));
        assert_eq!(pending[0].tickets, vec![first, second]);
    }

    #[test]
    fn added_then_removed_leaves_nothing_pending() {
        let mut tracker = ChangeTracker::new();
        tracker
            .track(NOTE, Some(key(1)), doc(1, "a"), TrackMode::Added)
            .unwrap();
        tracker
            .track(NOTE, Some(key(1)), doc(1, "a"), TrackMode::Removed)
            .unwrap();

        assert_eq!(tracker.pending_count(), 0);
        assert!(tracker.get(NOTE, &key(1)).is_none());
    }

    #[test]
    fn adding_a_tracked_identity_conflicts() {
        let mut tracker = ChangeTracker::new();
        tracker.attach_unchanged(NOTE, key(1), doc(1, "stored"));

        let err = tracker
            .track(NOTE, Some(key(1)), doc(1, "dup"), TrackMode::Added)
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { entity: "note", .. }));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut tracker = ChangeTracker::new();
        tracker.attach_unchanged(NOTE, key(1), doc(1, "stored"));
        tracker
            .track(NOTE, Some(key(1)), doc(1, "stored"), TrackMode::Removed)
            .unwrap();
        tracker
            .track(NOTE, Some(key(1)), doc(1, "again"), TrackMode::Added)
            .unwrap();

        let pending = tracker.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].mode(), TrackMode::Modified);
    }

    #[test]
    fn untrack_restores_previous_entry_in_lifo_order() {
        let mut tracker = ChangeTracker::new();
        tracker.attach_unchanged(NOTE, key(1), doc(1, "stored"));
        let modify = tracker
            .track(NOTE, Some(key(1)), doc(1, "edited"), TrackMode::Modified)
            .unwrap();
        let remove = tracker
            .track(NOTE, Some(key(1)), doc(1, "edited"), TrackMode::Removed)
            .unwrap();

        assert!(!tracker.untrack(modify), "superseded ticket must not revert");
        assert!(tracker.untrack(remove));
        assert_eq!(
            tracker.get(NOTE, &key(1)).map(|(state, _)| state),
            Some(EntryState::Modified)
        );
        assert!(tracker.untrack(modify));
        let (state, document) = tracker.get(NOTE, &key(1)).unwrap();
        assert_eq!(state, EntryState::Unchanged);
        assert_eq!(document.get("body"), Some(&json!("stored")));
    }

    #[test]
    fn untrack_restores_detached_insert() {
        let mut tracker = ChangeTracker::new();
        tracker
            .track(NOTE, Some(key(3)), doc(3, "a"), TrackMode::Added)
            .unwrap();
        let remove = tracker
            .track(NOTE, Some(key(3)), doc(3, "a"), TrackMode::Removed)
            .unwrap();

        assert!(tracker.untrack(remove));
        assert_eq!(
            tracker.get(NOTE, &key(3)).map(|(state, _)| state),
            Some(EntryState::Added)
        );
    }

    #[test]
    fn untrack_of_detach_is_refused_once_identity_is_re_added() {
        let mut tracker = ChangeTracker::new();
        tracker
            .track(NOTE, Some(key(4)), doc(4, "a"), TrackMode::Added)
            .unwrap();
        let remove = tracker
            .track(NOTE, Some(key(4)), doc(4, "a"), TrackMode::Removed)
            .unwrap();
        let re_add = tracker
            .track(NOTE, Some(key(4)), doc(4, "b"), TrackMode::Added)
            .unwrap();

        assert!(!tracker.untrack(remove));
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.tracked_count(), 1);

        assert!(tracker.untrack(re_add));
        assert!(tracker.untrack(remove));
        let (state, document) = tracker.get(NOTE, &key(4)).unwrap();
        assert_eq!(state, EntryState::Added);
        assert_eq!(document.get("body"), Some(&json!("a")));
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[test]
    fn pending_changes_follow_first_touch_order() {
        let mut tracker = ChangeTracker::new();
        tracker.attach_unchanged(NOTE, key(1), doc(1, "one"));
        tracker
            .track(NOTE, Some(key(2)), doc(2, "two"), TrackMode::Added)
            .unwrap();
        tracker
            .track(NOTE, Some(key(1)), doc(1, "one!"), TrackMode::Modified)
            .unwrap();

        let order: Vec<EntityKey> = tracker
            .pending()
            .iter()
            .filter_map(|change| change.key().cloned())
            .collect();
        assert_eq!(order, vec![key(2), key(1)]);
    }

    #[test]
    fn accept_clears_pending_and_drops_removed() {
        let mut tracker = ChangeTracker::new();
        tracker.attach_unchanged(NOTE, key(1), doc(1, "gone"));
        tracker
            .track(NOTE, Some(key(1)), doc(1, "gone"), TrackMode::Removed)
            .unwrap();
        let add = tracker
            .track(NOTE, Some(key(2)), doc(2, "new"), TrackMode::Added)
            .unwrap();

        let pending = tracker.pending();
        let applied = pending
            .iter()
            .map(|change| AppliedChange {
                key: change.key().cloned().unwrap(),
                document: match change.mode() {
                    TrackMode::Removed => None,
                    _ => Some(change.document().clone()),
                },
            })
            .collect();
        let report = tracker.accept(pending, applied);

        assert_eq!(report.len(), 2);
        assert!(report.persisted(add).is_some());
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.tracked_count(), 1);
        assert!(!tracker.untrack(add));
    }

    #[test]
    fn discard_reverts_to_original_documents() {
        let mut tracker = ChangeTracker::new();
        tracker.attach_unchanged(NOTE, key(1), doc(1, "stored"));
        tracker
            .track(NOTE, Some(key(1)), doc(1, "edited"), TrackMode::Modified)
            .unwrap();
        tracker
            .track(NOTE, Some(key(2)), doc(2, "new"), TrackMode::Added)
            .unwrap();

        tracker.discard();

        assert_eq!(tracker.pending_count(), 0);
        assert!(tracker.get(NOTE, &key(2)).is_none());
        let (state, document) = tracker.get(NOTE, &key(1)).unwrap();
        assert_eq!(state, EntryState::Unchanged);
        assert_eq!(document.get("body"), Some(&json!("stored")));
    }
}
