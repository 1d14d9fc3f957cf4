//! Pending Patch Table.
//!
//! Maps each record id to the merged patch not yet durably persisted, and
//! remembers insertion order so batches drain oldest-first and the overflow
//! guard can fall back to FIFO.

use std::collections::{BTreeMap, HashMap};

use usagelog_core::{RecordId, UsagePatch};

/// A record taken out of the table for persistence.
///
/// Carries its insertion sequence so a failed batch can be requeued at its
/// original position.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: RecordId,
    pub patch: UsagePatch,
    seq: u64,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    patch: UsagePatch,
}

/// Insertion-ordered map of `RecordId -> UsagePatch`.
///
/// Not synchronized: the owning buffer serializes every access.
#[derive(Debug, Default)]
pub struct PendingTable {
    slots: HashMap<RecordId, Slot>,
    order: BTreeMap<u64, RecordId>,
    next_seq: u64,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `patch` into the entry for `id`, creating it at the tail if
    /// absent. Returns `true` when a new entry was created.
    pub fn upsert(&mut self, id: RecordId, patch: UsagePatch) -> bool {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.patch.merge_from(patch);
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(id, Slot { seq, patch });
        self.order.insert(seq, id);
        true
    }

    /// Removes up to `limit` entries, oldest first.
    pub fn take_batch(&mut self, limit: usize) -> Vec<PendingEntry> {
        let mut batch = Vec::with_capacity(limit.min(self.slots.len()));
        while batch.len() < limit {
            let Some((seq, id)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&id) {
                debug_assert_eq!(slot.seq, seq);
                batch.push(PendingEntry {
                    id,
                    patch: slot.patch,
                    seq,
                });
            }
        }
        batch
    }

    /// Puts entries from a failed batch back.
    ///
    /// Where the table already holds a newer entry for the same id, the
    /// newer fields win: the result is the replayed patch overwritten by the
    /// current one. The merged entry keeps the older insertion position.
    pub fn requeue(&mut self, entries: Vec<PendingEntry>) {
        for entry in entries {
            match self.slots.get_mut(&entry.id) {
                Some(slot) => {
                    let newer = std::mem::take(&mut slot.patch);
                    let mut merged = entry.patch;
                    merged.merge_from(newer);
                    slot.patch = merged;
                    if entry.seq < slot.seq {
                        self.order.remove(&slot.seq);
                        self.order.insert(entry.seq, entry.id);
                        slot.seq = entry.seq;
                    }
                }
                None => {
                    self.order.insert(entry.seq, entry.id);
                    self.slots.insert(
                        entry.id,
                        Slot {
                            seq: entry.seq,
                            patch: entry.patch,
                        },
                    );
                }
            }
        }
    }

    /// Removes the entry for `id`.
    pub fn remove(&mut self, id: RecordId) -> Option<PendingEntry> {
        let slot = self.slots.remove(&id)?;
        self.order.remove(&slot.seq);
        Some(PendingEntry {
            id,
            patch: slot.patch,
            seq: slot.seq,
        })
    }

    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&UsagePatch> {
        self.slots.get(&id).map(|slot| &slot.patch)
    }

    /// Entries from oldest to newest insertion.
    pub fn iter_oldest(&self) -> impl Iterator<Item = (RecordId, &UsagePatch)> + '_ {
        self.order
            .values()
            .filter_map(|id| self.slots.get(id).map(|slot| (*id, &slot.patch)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use usagelog_core::Money;

    use super::*;

    fn ids(entries: &[PendingEntry]) -> Vec<RecordId> {
        entries.iter().map(|e| e.id).collect()
    }

    #[test]
    fn upsert_merges_existing_entry() {
        let mut table = PendingTable::new();
        assert!(table.upsert(RecordId(1), UsagePatch::default().with_duration_ms(120)));
        assert!(!table.upsert(
            RecordId(1),
            UsagePatch::default().with_cost(Money::parse("0.002").unwrap())
        ));

        assert_eq!(table.len(), 1);
        let patch = table.get(RecordId(1)).unwrap();
        assert_eq!(patch.duration_ms, Some(120));
        assert_eq!(patch.cost_usd, Some(Money::parse("0.002").unwrap()));
    }

    #[test]
    fn take_batch_drains_oldest_first() {
        let mut table = PendingTable::new();
        for i in 1..=5 {
            table.upsert(RecordId(i), UsagePatch::default().with_prompt_tokens(1));
        }
        // Re-touching an id does not move it.
        table.upsert(RecordId(1), UsagePatch::default().with_prompt_tokens(2));

        let first = table.take_batch(2);
        assert_eq!(ids(&first), vec![RecordId(1), RecordId(2)]);
        assert_eq!(first[0].patch.prompt_tokens, Some(2));

        let rest = table.take_batch(10);
        assert_eq!(ids(&rest), vec![RecordId(3), RecordId(4), RecordId(5)]);
        assert!(table.is_empty());
        assert!(table.take_batch(10).is_empty());
    }

    #[test]
    fn requeue_prefers_newer_table_entry() {
        let mut table = PendingTable::new();
        table.upsert(
            RecordId(1),
            UsagePatch::default().with_prompt_tokens(10).with_status_code(200),
        );
        table.upsert(RecordId(2), UsagePatch::default().with_prompt_tokens(20));
        let failed = table.take_batch(2);

        // Newer write for id=1 lands while the batch is in flight.
        table.upsert(RecordId(1), UsagePatch::default().with_prompt_tokens(11));
        table.requeue(failed);

        assert_eq!(table.len(), 2);
        let one = table.get(RecordId(1)).unwrap();
        assert_eq!(one.prompt_tokens, Some(11));
        assert_eq!(one.status_code, Some(200));
        assert_eq!(table.get(RecordId(2)).unwrap().prompt_tokens, Some(20));
    }

    #[test]
    fn requeue_restores_original_order() {
        let mut table = PendingTable::new();
        table.upsert(RecordId(1), UsagePatch::default().with_prompt_tokens(1));
        table.upsert(RecordId(2), UsagePatch::default().with_prompt_tokens(2));
        let failed = table.take_batch(2);

        table.upsert(RecordId(3), UsagePatch::default().with_prompt_tokens(3));
        table.upsert(RecordId(2), UsagePatch::default().with_completion_tokens(4));
        table.requeue(failed);

        let order: Vec<_> = table.iter_oldest().map(|(id, _)| id).collect();
        assert_eq!(order, vec![RecordId(1), RecordId(2), RecordId(3)]);
    }

    #[test]
    fn remove_drops_entry_and_order() {
        let mut table = PendingTable::new();
        table.upsert(RecordId(1), UsagePatch::default());
        table.upsert(RecordId(2), UsagePatch::default());

        let removed = table.remove(RecordId(1)).unwrap();
        assert_eq!(removed.id, RecordId(1));
        assert!(table.remove(RecordId(1)).is_none());
        assert_eq!(table.iter_oldest().count(), 1);
        assert_eq!(table.len(), 1);
    }
}
