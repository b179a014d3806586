//! In-memory mirror of the pending queue and batch selection.
//!
//! The mirror belongs to the scheduler thread. Producers talk to it only
//! through [`QueueEvent`]s, so it needs no locking of its own.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::tokens::SuspensionToken;
use crate::action::Action;
use crate::types::{ActionId, PairKey, Timestamp};

/// A queued action as the scheduler sees it.
#[derive(Debug)]
pub struct PendingEntry {
    pub id: ActionId,
    pub pair: PairKey,
    pub time: Timestamp,
    pub action: Box<dyn Action>,
}

#[derive(Debug)]
pub enum QueueEvent {
    Added(PendingEntry),
    /// A sender or reload finished with its pair. The scheduler forgets
    /// `removed` before it drops `token`, so a settled batch is never
    /// selected again.
    Settled {
        removed: Vec<ActionId>,
        token: SuspensionToken,
    },
    /// Reload the pair as soon as it can be suspended
    Reload(PairKey),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Items are delivered together but succeed or fail one by one
    Independent,
    /// A single action judged by its first reply
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem {
    pub id: ActionId,
    pub time: Timestamp,
}

/// A contiguous run of one pair's queue, handed to one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub pair: PairKey,
    pub kind: BatchKind,
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn ids(&self) -> Vec<ActionId> {
        self.items.iter().map(|item| item.id).collect()
    }
}

/// Queue key: assigned time, then arrival order for equal times across pairs.
type Slot = (Timestamp, u64);

#[derive(Default)]
pub struct Mirror {
    entries: BTreeMap<Slot, PendingEntry>,
    slots: HashMap<ActionId, Slot>,
    seq: u64,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn insert(&mut self, entry: PendingEntry) {
        if self.slots.contains_key(&entry.id) {
            return;
        }
        let slot = (entry.time, self.seq);
        self.seq += 1;
        self.slots.insert(entry.id, slot);
        self.entries.insert(slot, entry);
    }

    /// Drop the given actions, returning how many were present.
    pub fn remove(&mut self, ids: &[ActionId]) -> usize {
        let mut removed = 0;
        for id in ids {
            if let Some(slot) = self.slots.remove(id) {
                self.entries.remove(&slot);
                removed += 1;
            }
        }
        removed
    }

    /// Pick the next batch.
    ///
    /// Entries are scanned in queue order. `claim` is asked to suspend each
    /// new pair met; pairs it refuses are skipped for the rest of the scan.
    /// The first claimed pair yields its batch: the head alone if the head
    /// is not similar to itself, otherwise the longest run of the pair's
    /// next entries that are pairwise similar in both directions.
    pub fn select<T>(&self, mut claim: impl FnMut(&PairKey) -> Option<T>) -> Option<(T, Batch)> {
        let mut rejected: HashSet<&PairKey> = HashSet::new();

        for (slot, head) in &self.entries {
            if rejected.contains(&head.pair) {
                continue;
            }
            let Some(claimed) = claim(&head.pair) else {
                rejected.insert(&head.pair);
                continue;
            };

            let mut items = vec![BatchItem {
                id: head.id,
                time: head.time,
            }];
            if !head.action.is_similar(head.action.as_ref()) {
                return Some((
                    claimed,
                    Batch {
                        pair: head.pair.clone(),
                        kind: BatchKind::Composite,
                        items,
                    },
                ));
            }

            let mut members: Vec<&dyn Action> = vec![head.action.as_ref()];
            let following = self
                .entries
                .range((std::ops::Bound::Excluded(*slot), std::ops::Bound::Unbounded))
                .map(|(_, entry)| entry)
                .filter(|entry| entry.pair == head.pair);
            for entry in following {
                let candidate = entry.action.as_ref();
                let similar = candidate.is_similar(candidate)
                    && members
                        .iter()
                        .all(|m| m.is_similar(candidate) && candidate.is_similar(*m));
                if !similar {
                    break;
                }
                members.push(candidate);
                items.push(BatchItem {
                    id: entry.id,
                    time: entry.time,
                });
            }

            return Some((
                claimed,
                Batch {
                    pair: head.pair.clone(),
                    kind: BatchKind::Independent,
                    items,
                },
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{OpenAccount, SetAttribute};

    fn set(pair: &PairKey, key: &str) -> Box<dyn Action> {
        Box::new(SetAttribute::new(pair.clone(), "names", key, "v"))
    }

    fn entry(pair: &PairKey, time: Timestamp, action: Box<dyn Action>) -> PendingEntry {
        PendingEntry {
            id: ActionId::new(),
            pair: pair.clone(),
            time,
            action,
        }
    }

    #[test]
    fn test_batch_is_contiguous_prefix() {
        let pair = PairKey::new("alice@example.org", "profile");
        let mut mirror = Mirror::new();
        let a1 = entry(&pair, 1, set(&pair, "a"));
        let a2 = entry(&pair, 2, set(&pair, "b"));
        let open = entry(&pair, 3, Box::new(OpenAccount::new(pair.clone(), "Alice")));
        let a4 = entry(&pair, 4, set(&pair, "c"));
        let (id1, id2) = (a1.id, a2.id);
        for e in [a1, a2, open, a4] {
            mirror.insert(e);
        }

        let (_, batch) = mirror.select(|_| Some(())).unwrap();
        assert_eq!(batch.kind, BatchKind::Independent);
        assert_eq!(batch.ids(), vec![id1, id2]);
    }

    #[test]
    fn test_composite_head_goes_alone() {
        let pair = PairKey::new("carol@example.org", "account");
        let mut mirror = Mirror::new();
        let open = entry(&pair, 1, Box::new(OpenAccount::new(pair.clone(), "Carol")));
        let open_id = open.id;
        mirror.insert(open);
        mirror.insert(entry(&pair, 2, set(&pair, "a")));

        let (_, batch) = mirror.select(|_| Some(())).unwrap();
        assert_eq!(batch.kind, BatchKind::Composite);
        assert_eq!(batch.ids(), vec![open_id]);
    }

    #[test]
    fn test_suspended_pairs_are_skipped() {
        let busy = PairKey::new("alice@example.org", "profile");
        let free = PairKey::new("bob@example.org", "profile");
        let mut mirror = Mirror::new();
        mirror.insert(entry(&busy, 1, set(&busy, "a")));
        let bob = entry(&free, 2, set(&free, "a"));
        let bob_id = bob.id;
        mirror.insert(bob);
        mirror.insert(entry(&busy, 3, set(&busy, "b")));

        let mut asked = Vec::new();
        let (_, batch) = mirror
            .select(|pair| {
                asked.push(pair.clone());
                (pair != &busy).then_some(())
            })
            .unwrap();

        assert_eq!(batch.pair, free);
        assert_eq!(batch.ids(), vec![bob_id]);
        assert_eq!(asked, vec![busy, free]);
    }

    #[test]
    fn test_other_pairs_do_not_break_runs() {
        let alice = PairKey::new("alice@example.org", "profile");
        let bob = PairKey::new("bob@example.org", "profile");
        let mut mirror = Mirror::new();
        mirror.insert(entry(&alice, 1, set(&alice, "a")));
        mirror.insert(entry(&bob, 2, set(&bob, "a")));
        mirror.insert(entry(&alice, 3, set(&alice, "b")));

        let (_, batch) = mirror.select(|_| Some(())).unwrap();
        assert_eq!(batch.pair, alice);
        assert_eq!(batch.items.len(), 2);
    }

    #[test]
    fn test_remove_and_duplicates() {
        let pair = PairKey::new("alice@example.org", "profile");
        let mut mirror = Mirror::new();
        let first = entry(&pair, 1, set(&pair, "a"));
        let id = first.id;
        mirror.insert(first);
        mirror.insert(PendingEntry {
            id,
            pair: pair.clone(),
            time: 1,
            action: set(&pair, "a"),
        });
        assert_eq!(mirror.len(), 1);

        assert_eq!(mirror.remove(&[id, ActionId::new()]), 1);
        assert!(mirror.is_empty());
        assert!(mirror.select(|_| Some(())).is_none());
    }
}
