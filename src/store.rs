//! Deduplicating merge store: the single shared mutable resource.
//!
//! Every mutation is a reconciliation over the existing record rather than a
//! blind overwrite, so re-delivery and out-of-order arrival never regress
//! visible state: `read` is the logical OR of delivered values, `resolution`
//! only moves forward, and display fields follow the newest `created_at`.
//!
//! The store also carries the machinery the resolver needs to survive races
//! between optimistic mutations, server confirmations, and pushed events:
//!
//! - per-record *confirmed floors* (`confirmed_read`, `confirmed_resolution`)
//!   recording what an authoritative source has vouched for, so a failed
//!   optimistic action never rolls back below server truth;
//! - a per-id *action sequence*, so a server response is applied only when
//!   its originating request is still the most recent one issued for that id.

use std::collections::HashMap;

use crate::protocol::{
    NormalizedEvent, NotificationRecord, RelationshipRequest, RelationshipStatus, Resolution,
};

#[derive(Debug, Clone)]
struct StoredRecord {
    record: NotificationRecord,
    confirmed_read: bool,
    confirmed_resolution: Resolution,
}

#[derive(Debug, Clone)]
struct StoredRequest {
    request: RelationshipRequest,
    confirmed: RelationshipStatus,
}

#[derive(Debug, Default)]
pub struct MergeStore {
    records: HashMap<String, StoredRecord>,
    requests: HashMap<String, StoredRequest>,
    unread: usize,
    actions: HashMap<String, u64>,
}

impl MergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<NotificationRecord> {
        self.records.get(id).map(|s| s.record.clone())
    }

    /// The notification owning the given subject (e.g. a friendship id).
    pub fn find_by_subject(&self, subject_id: &str) -> Option<NotificationRecord> {
        self.records
            .values()
            .find(|s| s.record.subject_id.as_deref() == Some(subject_id))
            .map(|s| s.record.clone())
    }

    /// Insert or reconcile one authoritative delivery.
    ///
    /// Returns whether the *visible* state changed (used to decide whether
    /// subscribers need a notification). Re-applying the same record, or an
    /// older record after a newer one, returns false and changes nothing.
    pub fn upsert(&mut self, incoming: NotificationRecord) -> bool {
        let Some(stored) = self.records.get_mut(&incoming.id) else {
            if !incoming.read {
                self.unread += 1;
            }
            self.records.insert(
                incoming.id.clone(),
                StoredRecord {
                    confirmed_read: incoming.read,
                    confirmed_resolution: incoming.resolution,
                    record: incoming,
                },
            );
            return true;
        };

        let mut changed = false;

        // read: logical OR of all delivered values, never reverted.
        if incoming.read {
            stored.confirmed_read = true;
            if !stored.record.read {
                stored.record.read = true;
                self.unread -= 1;
                changed = true;
            }
        }

        // resolution: forward-only, terminal states absorbing.
        stored.confirmed_resolution = stored.confirmed_resolution.advance(incoming.resolution);
        let advanced = stored.record.resolution.advance(incoming.resolution);
        if advanced != stored.record.resolution {
            stored.record.resolution = advanced;
            changed = true;
        }

        // display fields: newest created_at wins.
        if incoming.created_at >= stored.record.created_at {
            if stored.record.created_at != incoming.created_at {
                stored.record.created_at = incoming.created_at;
                changed = true;
            }
            if stored.record.text != incoming.text {
                stored.record.text = incoming.text;
                changed = true;
            }
            if stored.record.kind != incoming.kind {
                stored.record.kind = incoming.kind;
                changed = true;
            }
            if incoming.subject_id.is_some() && stored.record.subject_id != incoming.subject_id {
                stored.record.subject_id = incoming.subject_id;
                changed = true;
            }
            if incoming.sender_id.is_some() && stored.record.sender_id != incoming.sender_id {
                stored.record.sender_id = incoming.sender_id;
                changed = true;
            }
            stored.record.origin = incoming.origin;
        }

        changed
    }

    /// Apply one normalized delivery: the record plus any embedded
    /// relationship row. Returns whether the visible record state changed.
    pub fn apply(&mut self, event: NormalizedEvent) -> bool {
        if let Some(request) = event.request {
            self.upsert_request(request);
        }
        self.upsert(event.record)
    }

    /// Upsert a whole history page. Idempotent under repeated calls with the
    /// same page; returns how many records visibly changed.
    pub fn bulk_upsert(&mut self, records: Vec<NotificationRecord>) -> usize {
        records
            .into_iter()
            .map(|r| self.upsert(r))
            .filter(|&changed| changed)
            .count()
    }

    /// Hard delete. Returns the removed record as the rollback tombstone.
    pub fn remove(&mut self, id: &str) -> Option<NotificationRecord> {
        let stored = self.records.remove(id)?;
        if !stored.record.read {
            self.unread -= 1;
        }
        Some(stored.record)
    }

    /// All records, `created_at` descending, ties broken by `id` ascending.
    pub fn snapshot(&self) -> Vec<NotificationRecord> {
        let mut out: Vec<NotificationRecord> =
            self.records.values().map(|s| s.record.clone()).collect();
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Filtered view over [`snapshot`](Self::snapshot).
    pub fn list(&self, unread_only: bool, limit: usize) -> Vec<NotificationRecord> {
        let mut out = self.snapshot();
        if unread_only {
            out.retain(|r| !r.read);
        }
        out.truncate(limit);
        out
    }

    /// Friend requests still awaiting an accept/decline decision.
    pub fn actionable(&self) -> Vec<NotificationRecord> {
        let mut out = self.snapshot();
        out.retain(NotificationRecord::is_actionable);
        out
    }

    /// O(1) maintained counter of `read == false` records.
    pub fn unread_count(&self) -> usize {
        self.unread
    }

    // -----------------------------------------------------------------------
    // Relationship side table
    // -----------------------------------------------------------------------

    /// Reconcile a delivered relationship row. Status only moves forward.
    pub fn upsert_request(&mut self, incoming: RelationshipRequest) -> bool {
        let Some(stored) = self.requests.get_mut(&incoming.id) else {
            self.requests.insert(
                incoming.id.clone(),
                StoredRequest {
                    confirmed: incoming.status,
                    request: incoming,
                },
            );
            return true;
        };
        stored.confirmed = stored.confirmed.advance(incoming.status);
        let advanced = stored.request.status.advance(incoming.status);
        let changed = advanced != stored.request.status;
        stored.request.status = advanced;
        changed
    }

    pub fn request(&self, id: &str) -> Option<RelationshipRequest> {
        self.requests.get(id).map(|s| s.request.clone())
    }

    /// Optimistic status transition; does not raise the confirmed floor.
    pub fn set_request_status(&mut self, id: &str, status: RelationshipStatus) -> bool {
        let Some(stored) = self.requests.get_mut(id) else {
            return false;
        };
        let advanced = stored.request.status.advance(status);
        let changed = advanced != stored.request.status;
        stored.request.status = advanced;
        changed
    }

    /// Server-confirmed status: raises the floor and the visible status.
    pub fn confirm_request(&mut self, id: &str, status: RelationshipStatus) {
        if let Some(stored) = self.requests.get_mut(id) {
            stored.request.status = stored.request.status.advance(status);
            stored.confirmed = stored.confirmed.advance(status);
        }
    }

    /// Roll an optimistic status back to pending, unless an authoritative
    /// source confirmed a terminal status in the meantime.
    pub fn revert_request(&mut self, id: &str) -> bool {
        let Some(stored) = self.requests.get_mut(id) else {
            return false;
        };
        if matches!(stored.confirmed, RelationshipStatus::Pending)
            && !matches!(stored.request.status, RelationshipStatus::Pending)
        {
            stored.request.status = RelationshipStatus::Pending;
            return true;
        }
        false
    }

    // -----------------------------------------------------------------------
    // Optimistic transitions and confirmed floors
    // -----------------------------------------------------------------------

    /// Optimistic `read = true`. Returns whether the flag flipped.
    pub fn mark_read(&mut self, id: &str) -> bool {
        let Some(stored) = self.records.get_mut(id) else {
            return false;
        };
        if stored.record.read {
            return false;
        }
        stored.record.read = true;
        self.unread -= 1;
        true
    }

    /// Roll an optimistic mark-read back, unless an authoritative delivery
    /// or confirmation vouched for the read state in the meantime.
    pub fn revert_read(&mut self, id: &str) -> bool {
        let Some(stored) = self.records.get_mut(id) else {
            return false;
        };
        if stored.record.read && !stored.confirmed_read {
            stored.record.read = false;
            self.unread += 1;
            return true;
        }
        false
    }

    /// Server-confirmed read state.
    pub fn confirm_read(&mut self, id: &str) {
        if let Some(stored) = self.records.get_mut(id) {
            if !stored.record.read {
                stored.record.read = true;
                self.unread -= 1;
            }
            stored.confirmed_read = true;
        }
    }

    /// Optimistic forward resolution. Returns whether it changed.
    pub fn set_resolution(&mut self, id: &str, resolution: Resolution) -> bool {
        let Some(stored) = self.records.get_mut(id) else {
            return false;
        };
        let advanced = stored.record.resolution.advance(resolution);
        let changed = advanced != stored.record.resolution;
        stored.record.resolution = advanced;
        changed
    }

    /// Roll an optimistic resolution back to unresolved, unless an
    /// authoritative source confirmed a terminal resolution in the meantime.
    pub fn revert_resolution(&mut self, id: &str) -> bool {
        let Some(stored) = self.records.get_mut(id) else {
            return false;
        };
        if !stored.confirmed_resolution.is_resolved() && stored.record.resolution.is_resolved() {
            stored.record.resolution = Resolution::Unresolved;
            return true;
        }
        false
    }

    /// Server-confirmed resolution: raises the floor and the visible state.
    pub fn confirm_resolution(&mut self, id: &str, resolution: Resolution) {
        if let Some(stored) = self.records.get_mut(id) {
            stored.record.resolution = stored.record.resolution.advance(resolution);
            stored.confirmed_resolution = stored.confirmed_resolution.advance(resolution);
        }
    }

    // -----------------------------------------------------------------------
    // Per-id action sequencing
    // -----------------------------------------------------------------------

    /// Issue a new action sequence number for the given id. A response is
    /// only applied while its sequence is still the latest for that id.
    pub fn begin_action(&mut self, id: &str) -> u64 {
        let seq = self.actions.entry(id.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    pub fn is_latest_action(&self, id: &str, seq: u64) -> bool {
        self.actions.get(id).copied() == Some(seq)
    }

    /// Teardown: drop all records and invalidate every outstanding action
    /// sequence, so late resolver responses are discarded.
    pub fn clear(&mut self) {
        self.records.clear();
        self.requests.clear();
        self.actions.clear();
        self.unread = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NotificationKind, Origin};

    fn record(id: &str, created_at: u64, read: bool) -> NotificationRecord {
        NotificationRecord {
            id: id.to_string(),
            kind: NotificationKind::Message,
            subject_id: None,
            sender_id: Some("u-alice".to_string()),
            text: format!("event {id}"),
            created_at,
            read,
            resolution: Resolution::Unresolved,
            origin: Origin::Fetched,
        }
    }

    fn friend_request(id: &str, subject: &str, created_at: u64) -> NotificationRecord {
        NotificationRecord {
            id: id.to_string(),
            kind: NotificationKind::FriendRequest,
            subject_id: Some(subject.to_string()),
            sender_id: Some("u-bob".to_string()),
            text: "bob wants to be friends".to_string(),
            created_at,
            read: false,
            resolution: Resolution::Unresolved,
            origin: Origin::Fetched,
        }
    }

    #[test]
    fn redelivery_is_idempotent() {
        let mut store = MergeStore::new();
        let rec = record("a", 100, false);

        assert!(store.upsert(rec.clone()));
        assert!(!store.upsert(rec.clone()), "identical redelivery is a no-op");
        assert_eq!(store.len(), 1);
        assert_eq!(store.unread_count(), 1);

        // Same page twice.
        assert_eq!(store.bulk_upsert(vec![rec.clone()]), 0);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn read_is_the_or_of_all_deliveries_in_any_order() {
        for deliveries in [[false, true, false], [true, false, false], [false, false, true]] {
            let mut store = MergeStore::new();
            for read in deliveries {
                let mut rec = record("a", 100, read);
                rec.origin = Origin::Pushed;
                store.upsert(rec);
            }
            assert!(store.get("a").unwrap().read);
            assert_eq!(store.unread_count(), 0);
        }
    }

    #[test]
    fn resolution_never_regresses() {
        let mut store = MergeStore::new();
        store.upsert(friend_request("fr", "req-1", 100));

        let mut accepted = friend_request("fr", "req-1", 100);
        accepted.resolution = Resolution::Accepted;
        assert!(store.upsert(accepted));

        // A stale unresolved delivery must not reopen the request.
        assert!(!store.upsert(friend_request("fr", "req-1", 100)));
        assert_eq!(store.get("fr").unwrap().resolution, Resolution::Accepted);
        assert!(store.actionable().is_empty());
    }

    #[test]
    fn optimistic_accept_survives_a_stale_push() {
        let mut store = MergeStore::new();
        store.upsert(friend_request("fr", "req-1", 100));

        assert!(store.set_resolution("fr", Resolution::Accepted));
        // The in-flight push of the original unresolved event arrives late.
        store.upsert(friend_request("fr", "req-1", 100));
        assert_eq!(store.get("fr").unwrap().resolution, Resolution::Accepted);
    }

    #[test]
    fn snapshot_orders_by_created_at_desc_with_id_tiebreak() {
        let mut store = MergeStore::new();
        store.upsert(record("b", 200, false));
        store.upsert(record("a", 100, false));
        // Out-of-order older push lands below newer history.
        store.upsert(record("c", 50, false));
        // Tie on created_at resolves by id ascending.
        store.upsert(record("d", 200, false));

        let ids: Vec<String> = store.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn newest_created_at_wins_for_display_fields() {
        let mut store = MergeStore::new();
        store.upsert(record("a", 200, false));

        let mut stale = record("a", 100, false);
        stale.text = "older rendering".to_string();
        assert!(!store.upsert(stale), "older display fields are ignored");
        assert_eq!(store.get("a").unwrap().text, "event a");

        let mut fresh = record("a", 300, false);
        fresh.text = "newer rendering".to_string();
        assert!(store.upsert(fresh));
        let current = store.get("a").unwrap();
        assert_eq!(current.text, "newer rendering");
        assert_eq!(current.created_at, 300);
    }

    #[test]
    fn unread_counter_tracks_every_transition() {
        let mut store = MergeStore::new();
        store.upsert(record("a", 100, false));
        store.upsert(record("b", 200, true));
        assert_eq!(store.unread_count(), 1);

        // Pushed read-update for the unread record.
        store.upsert(record("a", 100, true));
        assert_eq!(store.unread_count(), 0);
        assert_eq!(store.snapshot().len(), 2);

        store.upsert(record("c", 300, false));
        assert_eq!(store.unread_count(), 1);
        store.remove("c");
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn removed_record_reinserts_at_its_original_position() {
        let mut store = MergeStore::new();
        store.upsert(record("a", 300, false));
        store.upsert(record("b", 200, false));
        store.upsert(record("c", 100, false));

        let tombstone = store.remove("b").unwrap();
        assert_eq!(store.snapshot().len(), 2);

        store.upsert(tombstone);
        let ids: Vec<String> = store.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(store.unread_count(), 3);
    }

    #[test]
    fn revert_read_respects_the_confirmed_floor() {
        let mut store = MergeStore::new();
        store.upsert(record("a", 100, false));

        assert!(store.mark_read("a"));
        assert_eq!(store.unread_count(), 0);
        // No authoritative confirmation yet: rollback applies.
        assert!(store.revert_read("a"));
        assert_eq!(store.unread_count(), 1);

        // An authoritative delivery confirms the read in flight.
        store.mark_read("a");
        store.upsert(record("a", 100, true));
        assert!(!store.revert_read("a"), "rollback below server truth");
        assert!(store.get("a").unwrap().read);
    }

    #[test]
    fn revert_resolution_respects_the_confirmed_floor() {
        let mut store = MergeStore::new();
        store.upsert(friend_request("fr", "req-1", 100));

        store.set_resolution("fr", Resolution::Accepted);
        assert!(store.revert_resolution("fr"));
        assert_eq!(store.get("fr").unwrap().resolution, Resolution::Unresolved);

        store.set_resolution("fr", Resolution::Accepted);
        store.confirm_resolution("fr", Resolution::Accepted);
        assert!(!store.revert_resolution("fr"));
        assert_eq!(store.get("fr").unwrap().resolution, Resolution::Accepted);
    }

    #[test]
    fn action_sequences_invalidate_older_responses() {
        let mut store = MergeStore::new();
        store.upsert(record("a", 100, false));

        let first = store.begin_action("a");
        let second = store.begin_action("a");
        assert!(!store.is_latest_action("a", first));
        assert!(store.is_latest_action("a", second));

        store.clear();
        assert!(!store.is_latest_action("a", second), "teardown discards all");
        assert_eq!(store.unread_count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn request_status_moves_forward_only() {
        let mut store = MergeStore::new();
        let request = RelationshipRequest {
            id: "req-1".to_string(),
            sender_id: "u-bob".to_string(),
            receiver_id: "u-me".to_string(),
            status: RelationshipStatus::Pending,
        };
        store.upsert_request(request.clone());

        assert!(store.set_request_status("req-1", RelationshipStatus::Accepted));
        // Rollback applies while unconfirmed.
        assert!(store.revert_request("req-1"));
        assert_eq!(
            store.request("req-1").unwrap().status,
            RelationshipStatus::Pending
        );

        store.set_request_status("req-1", RelationshipStatus::Accepted);
        store.confirm_request("req-1", RelationshipStatus::Accepted);
        assert!(!store.revert_request("req-1"));

        // A stale pending delivery does not reopen it.
        store.upsert_request(request);
        assert_eq!(
            store.request("req-1").unwrap().status,
            RelationshipStatus::Accepted
        );
    }
}
