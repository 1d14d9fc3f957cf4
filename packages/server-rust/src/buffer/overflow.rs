//! Overflow Guard.
//!
//! Keeps the pending table at or below `max_pending` records by evicting one
//! entry per overflowing insert. Records that have not reached their terminal
//! marker go first; among the rest, the oldest insertion goes. This is FIFO
//! by insertion, not recency of update.

use usagelog_core::RecordId;

use super::table::{PendingEntry, PendingTable};

/// Which rule picked an eviction victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Oldest entry lacking the terminal marker.
    Incomplete,
    /// Every entry was terminal; the oldest one was taken.
    OldestTerminal,
}

impl EvictionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::OldestTerminal => "oldest_terminal",
        }
    }
}

/// Picks the entry to evict, without removing it.
#[must_use]
pub fn select_victim(table: &PendingTable) -> Option<(RecordId, EvictionReason)> {
    table
        .iter_oldest()
        .find(|(_, patch)| !patch.is_terminal())
        .map(|(id, _)| (id, EvictionReason::Incomplete))
        .or_else(|| {
            table
                .iter_oldest()
                .next()
                .map(|(id, _)| (id, EvictionReason::OldestTerminal))
        })
}

/// Enforces a memory ceiling on a [`PendingTable`].
#[derive(Debug, Clone, Copy)]
pub struct OverflowGuard {
    max_pending: usize,
}

impl OverflowGuard {
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self { max_pending }
    }

    /// If the table exceeds the ceiling, removes exactly one entry and
    /// returns it with the rule that chose it.
    pub fn enforce(&self, table: &mut PendingTable) -> Option<(PendingEntry, EvictionReason)> {
        if table.len() <= self.max_pending {
            return None;
        }
        let (id, reason) = select_victim(table)?;
        table.remove(id).map(|entry| (entry, reason))
    }
}

#[cfg(test)]
mod tests {
    use usagelog_core::UsagePatch;

    use super::*;

    #[test]
    fn under_ceiling_evicts_nothing() {
        let guard = OverflowGuard::new(2);
        let mut table = PendingTable::new();
        table.upsert(RecordId(1), UsagePatch::default());
        table.upsert(RecordId(2), UsagePatch::default());
        assert!(guard.enforce(&mut table).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn prefers_entry_without_terminal_marker() {
        let guard = OverflowGuard::new(2);
        let mut table = PendingTable::new();
        table.upsert(RecordId(1), UsagePatch::default());
        table.upsert(RecordId(2), UsagePatch::default().with_duration_ms(5));
        table.upsert(RecordId(3), UsagePatch::default());

        let (evicted, reason) = guard.enforce(&mut table).unwrap();
        assert_ne!(evicted.id, RecordId(2));
        assert_eq!(evicted.id, RecordId(1));
        assert_eq!(reason, EvictionReason::Incomplete);
        assert_eq!(table.len(), 2);
        assert!(table.get(RecordId(2)).is_some());
    }

    #[test]
    fn skips_older_terminal_entries() {
        let mut table = PendingTable::new();
        table.upsert(RecordId(1), UsagePatch::default().with_duration_ms(1));
        table.upsert(RecordId(2), UsagePatch::default().with_duration_ms(2));
        table.upsert(RecordId(3), UsagePatch::default().with_prompt_tokens(3));

        assert_eq!(
            select_victim(&table),
            Some((RecordId(3), EvictionReason::Incomplete))
        );
    }

    #[test]
    fn falls_back_to_oldest_when_all_terminal() {
        let guard = OverflowGuard::new(2);
        let mut table = PendingTable::new();
        for i in 1..=3 {
            table.upsert(RecordId(i), UsagePatch::default().with_duration_ms(10));
        }

        let (evicted, reason) = guard.enforce(&mut table).unwrap();
        assert_eq!(evicted.id, RecordId(1));
        assert_eq!(reason, EvictionReason::OldestTerminal);
    }

    #[test]
    fn empty_table_has_no_victim() {
        assert!(select_victim(&PendingTable::new()).is_none());
    }
}
