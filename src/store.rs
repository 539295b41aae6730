//! In-memory reconciliation index.
//!
//! Events are deduplicated by id and replaceable kinds are reduced to a single
//! winner per scope. The reduction is commutative and idempotent, so events may
//! arrive from any number of relays in any order.

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    delegation::UnknownClausePolicy,
    event::{verify_event_with, verify_id, Event, KindClass, ScopeKey},
    filter::Filter,
};

/// Result of offering an event to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored; for replaceable kinds it is the first event in its scope.
    Inserted,
    /// Stored as the new winner, evicting `previous`.
    Replaced { previous: String },
    /// Id already indexed.
    Duplicate,
    /// Lost to the current winner of its scope and was discarded.
    Superseded,
    /// Failed id or signature verification.
    Rejected,
    /// Ephemeral kind, never stored.
    Ignored,
}

impl AddOutcome {
    pub fn stored(&self) -> bool {
        matches!(self, AddOutcome::Inserted | AddOutcome::Replaced { .. })
    }
}

/// Notification sent to observers whenever the readable state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Added(Event),
    Replaced { previous: String, event: Event },
}

/// Event index keyed by id with a secondary winner map for replaceable scopes.
pub struct EventStore {
    events: HashMap<String, Event>,
    winners: HashMap<ScopeKey, String>,
    verify_sig: bool,
    policy: UnknownClausePolicy,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl EventStore {
    /// Create an empty store. With `verify_sig` off, signatures are trusted but ids are still checked.
    pub fn new(verify_sig: bool) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            events: HashMap::new(),
            winners: HashMap::new(),
            verify_sig,
            policy: UnknownClausePolicy::default(),
            changes,
        }
    }

    pub fn with_policy(mut self, policy: UnknownClausePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register an observer. Lagging observers miss changes rather than block ingest.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Single reconciliation entry point.
    ///
    /// The id is always checked against the event's contents. The Schnorr
    /// signature and any delegation tag are checked when `verify_sig` is on.
    pub fn add_event(&mut self, ev: Event) -> AddOutcome {
        if self.events.contains_key(&ev.id) {
            return AddOutcome::Duplicate;
        }
        let checked = if self.verify_sig {
            verify_event_with(&ev, self.policy)
        } else {
            verify_id(&ev).map(|_| ())
        };
        if let Err(e) = checked {
            debug!(id = %ev.id, error = %e, "dropping malformed event");
            return AddOutcome::Rejected;
        }
        self.reconcile(ev)
    }

    /// Apply the replacement rules to an event that passed validation.
    fn reconcile(&mut self, ev: Event) -> AddOutcome {
        if self.events.contains_key(&ev.id) {
            return AddOutcome::Duplicate;
        }
        let scope = match ev.kind_class() {
            KindClass::Ephemeral => return AddOutcome::Ignored,
            KindClass::Regular => None,
            KindClass::Replaceable | KindClass::ParameterizedReplaceable => ev.scope_key(),
        };
        let Some(scope) = scope else {
            self.events.insert(ev.id.clone(), ev.clone());
            let _ = self.changes.send(StoreChange::Added(ev));
            return AddOutcome::Inserted;
        };

        let previous = match self.winners.get(&scope).and_then(|id| self.events.get(id)) {
            Some(winner) if !ev.supersedes(winner) => return AddOutcome::Superseded,
            Some(winner) => Some(winner.id.clone()),
            None => None,
        };
        if let Some(previous) = &previous {
            self.events.remove(previous);
        }
        self.winners.insert(scope, ev.id.clone());
        self.events.insert(ev.id.clone(), ev.clone());
        match previous {
            Some(previous) => {
                let _ = self.changes.send(StoreChange::Replaced {
                    previous: previous.clone(),
                    event: ev,
                });
                AddOutcome::Replaced { previous }
            }
            None => {
                let _ = self.changes.send(StoreChange::Added(ev));
                AddOutcome::Inserted
            }
        }
    }

    /// Reconcile a batch. A malformed event never stops the rest of the batch.
    pub fn add_events(&mut self, events: impl IntoIterator<Item = Event>) -> Vec<AddOutcome> {
        events.into_iter().map(|ev| self.add_event(ev)).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Event> {
        self.events.get(id)
    }

    /// Current winner of a replaceable scope. `d` is ignored for plain replaceable kinds.
    pub fn latest(&self, kind: u32, pubkey: &str, d: Option<&str>) -> Option<&Event> {
        let d = match KindClass::of(kind) {
            KindClass::ParameterizedReplaceable => Some(d.unwrap_or_default().to_string()),
            KindClass::Replaceable => None,
            KindClass::Regular | KindClass::Ephemeral => return None,
        };
        let scope = ScopeKey {
            kind,
            pubkey: pubkey.to_string(),
            d,
        };
        self.winners.get(&scope).and_then(|id| self.events.get(id))
    }

    /// Every current winner of a replaceable scope.
    pub fn winners(&self) -> impl Iterator<Item = &Event> {
        self.winners.values().filter_map(|id| self.events.get(id))
    }

    /// Matching events, newest first, truncated to the filter's `limit`.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .values()
            .filter(|ev| filter.matches(ev))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.replacement_order(a));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        tests::{bare_event, hashed_event, test_keypair},
        UnsignedEvent,
    };

    /// Feed events past validation so fixed ids can pin the ordering rules.
    fn reconcile_all(store: &mut EventStore, events: impl IntoIterator<Item = Event>) {
        for ev in events {
            store.reconcile(ev);
        }
    }

    fn snapshot(store: &EventStore) -> Vec<String> {
        let mut ids: Vec<String> = store.events.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn permutations(items: &[Event]) -> Vec<Vec<Event>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = vec![];
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn adding_twice_is_a_no_op() {
        let mut store = EventStore::new(false);
        let ev = hashed_event("p1", 1, None, 1);
        assert_eq!(store.add_event(ev.clone()), AddOutcome::Inserted);
        let once = snapshot(&store);
        assert_eq!(store.add_event(ev), AddOutcome::Duplicate);
        assert_eq!(snapshot(&store), once);
    }

    #[test]
    fn regular_events_are_all_kept() {
        let mut store = EventStore::new(false);
        store.reconcile(bare_event("aa11", "p1", 1, None, 1));
        store.reconcile(bare_event("bb22", "p1", 1, None, 1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn total_order_example() {
        let events = vec![
            bare_event("b", "p1", 0, None, 5),
            bare_event("a", "p1", 0, None, 5),
            bare_event("z", "p1", 0, None, 3),
        ];
        for order in permutations(&events) {
            let mut store = EventStore::new(false);
            reconcile_all(&mut store, order);
            assert_eq!(store.latest(0, "p1", None).unwrap().id, "b");
            assert_eq!(snapshot(&store), vec!["b".to_string()]);
        }
    }

    #[test]
    fn winner_independent_of_order_and_duplication() {
        let events = vec![
            bare_event("c1", "p1", 30_023, Some("library"), 7),
            bare_event("c2", "p1", 30_023, Some("library"), 9),
            bare_event("c3", "p1", 30_023, Some("library"), 9),
            bare_event("c2", "p1", 30_023, Some("library"), 9),
        ];
        for order in permutations(&events) {
            let mut store = EventStore::new(false);
            reconcile_all(&mut store, order);
            assert_eq!(
                store.latest(30_023, "p1", Some("library")).unwrap().id,
                "c3"
            );
            assert_eq!(store.len(), 1);
        }
    }

    #[test]
    fn slots_and_authors_are_independent() {
        let mut store = EventStore::new(false);
        store.reconcile(bare_event("a1", "p1", 30_023, Some("book-1"), 1));
        store.reconcile(bare_event("a2", "p1", 30_023, Some("book-2"), 1));
        store.reconcile(bare_event("a3", "p2", 30_023, Some("book-1"), 1));
        store.reconcile(bare_event("a4", "p1", 0, None, 1));
        assert_eq!(store.len(), 4);
        assert_eq!(store.winners().count(), 4);
        assert_eq!(store.latest(30_023, "p2", Some("book-1")).unwrap().id, "a3");
        assert!(store.latest(1, "p1", None).is_none());
    }

    #[test]
    fn losers_are_never_readable() {
        let mut store = EventStore::new(false);
        store.reconcile(bare_event("new", "p1", 3, None, 10));
        assert_eq!(
            store.reconcile(bare_event("old", "p1", 3, None, 1)),
            AddOutcome::Superseded
        );
        assert!(store.get("old").is_none());
        assert!(store.query(&Filter::new().ids(["old"])).is_empty());
        assert_eq!(
            store.reconcile(bare_event("newer", "p1", 3, None, 11)),
            AddOutcome::Replaced {
                previous: "new".into()
            }
        );
        assert!(store.get("new").is_none());
        // evicted winner re-delivered by a slow relay
        assert_eq!(
            store.reconcile(bare_event("new", "p1", 3, None, 10)),
            AddOutcome::Superseded
        );
    }

    #[test]
    fn ephemeral_kinds_are_not_stored() {
        let mut store = EventStore::new(false);
        assert_eq!(
            store.reconcile(bare_event("e1", "p1", 20_001, None, 1)),
            AddOutcome::Ignored
        );
        assert!(store.is_empty());
    }

    #[test]
    fn malformed_events_are_dropped_without_stopping_batch() {
        let mut store = EventStore::new(true);
        let good = UnsignedEvent::new(1, "ok").sign_with(&test_keypair(1)).unwrap();
        let mut bad = UnsignedEvent::new(1, "bad").sign_with(&test_keypair(1)).unwrap();
        bad.content = "tampered".into();
        let outcomes = store.add_events([bad.clone(), good.clone()]);
        assert_eq!(outcomes, vec![AddOutcome::Rejected, AddOutcome::Inserted]);
        assert!(store.get(&bad.id).is_none());
        assert!(store.get(&good.id).is_some());
    }

    #[test]
    fn ids_are_checked_even_without_signature_verification() {
        let mut store = EventStore::new(false);
        let forged = bare_event("not-a-hash", "victim", 30_023, Some("ch1"), u64::MAX);
        assert_eq!(store.add_event(forged), AddOutcome::Rejected);
        assert!(store.latest(30_023, "victim", Some("ch1")).is_none());

        let unsigned = hashed_event("victim", 30_023, Some("ch1"), 5);
        assert_eq!(store.add_event(unsigned.clone()), AddOutcome::Inserted);
        assert_eq!(store.latest(30_023, "victim", Some("ch1")), Some(&unsigned));

        let mut strict = EventStore::new(true);
        assert_eq!(strict.add_event(unsigned), AddOutcome::Rejected);
    }

    #[test]
    fn query_is_newest_first_with_limit() {
        let mut store = EventStore::new(false);
        store.reconcile(bare_event("aa11", "p1", 1, None, 10));
        store.reconcile(bare_event("bb22", "p1", 1, None, 20));
        store.reconcile(bare_event("cc33", "p1", 1, None, 30));
        store.reconcile(bare_event("dd44", "p2", 1, None, 40));
        let res = store.query(&Filter::new().authors(["p1"]).since(15).limit(1));
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id, "cc33");
    }

    #[test]
    fn observers_see_additions_and_replacements() {
        let mut store = EventStore::new(false);
        let mut rx = store.subscribe();
        store.reconcile(bare_event("a", "p1", 0, None, 1));
        store.reconcile(bare_event("b", "p1", 0, None, 2));
        store.reconcile(bare_event("a", "p1", 0, None, 1));
        assert!(matches!(rx.try_recv().unwrap(), StoreChange::Added(ev) if ev.id == "a"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            StoreChange::Replaced { previous, event } if previous == "a" && event.id == "b"
        ));
        assert!(rx.try_recv().is_err());
    }
}
