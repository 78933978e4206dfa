use smallvec::SmallVec;

use crate::timeq::Cycle;

/// A request parked behind an outstanding line fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MshrWaiter {
    /// Core-side port the response goes back to.
    pub port: usize,
    pub tag: u64,
    pub addr: u64,
    pub write: bool,
}

#[derive(Debug)]
pub(crate) struct MshrEntry {
    line_addr: u64,
    allocated_at: Cycle,
    pub(crate) merged: SmallVec<[MshrWaiter; 4]>,
}

impl MshrEntry {
    pub(crate) fn line_addr(&self) -> u64 {
        self.line_addr
    }

    pub(crate) fn allocated_at(&self) -> Cycle {
        self.allocated_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MshrFull;

/// Miss-status holding registers of one bank: one entry per line with a fill in flight, carrying
/// every request that missed on that line.
#[derive(Debug)]
pub(crate) struct MshrTable {
    capacity: usize,
    entries: Vec<MshrEntry>,
}

impl MshrTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn has_entry(&self, line_addr: u64) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.line_addr == line_addr)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Open a new entry for `line_addr` holding `waiter`.
    pub(crate) fn allocate(
        &mut self,
        line_addr: u64,
        waiter: MshrWaiter,
        now: Cycle,
    ) -> Result<(), MshrFull> {
        debug_assert!(!self.has_entry(line_addr), "line already has an MSHR entry");
        if self.is_full() {
            return Err(MshrFull);
        }
        let mut merged = SmallVec::new();
        merged.push(waiter);
        self.entries.push(MshrEntry {
            line_addr,
            allocated_at: now,
            merged,
        });
        Ok(())
    }

    /// Attach `waiter` to the fill already in flight for `line_addr`. Returns false when there
    /// is none.
    pub(crate) fn merge(&mut self, line_addr: u64, waiter: MshrWaiter) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.line_addr == line_addr)
        {
            Some(entry) => {
                entry.merged.push(waiter);
                true
            }
            None => false,
        }
    }

    pub(crate) fn waiters(&self, line_addr: u64) -> Option<&[MshrWaiter]> {
        self.entries
            .iter()
            .find(|entry| entry.line_addr == line_addr)
            .map(|entry| entry.merged.as_slice())
    }

    pub(crate) fn release(&mut self, line_addr: u64) -> Option<MshrEntry> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.line_addr == line_addr)?;
        Some(self.entries.swap_remove(idx))
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(tag: u64) -> MshrWaiter {
        MshrWaiter {
            port: 0,
            tag,
            addr: 0x40,
            write: false,
        }
    }

    #[test]
    fn mshr_table_merges_requests() {
        let mut table = MshrTable::new(1);
        table.allocate(1, waiter(0), 3).unwrap();
        assert_eq!(table.allocate(2, waiter(1), 3), Err(MshrFull));
        assert!(table.merge(1, waiter(2)));
        let entry = table.release(1).unwrap();
        assert_eq!(entry.line_addr(), 1);
        assert_eq!(entry.allocated_at(), 3);
        assert_eq!(entry.merged.len(), 2);
        assert!(table.allocate(2, waiter(1), 4).is_ok());
    }

    #[test]
    fn merge_into_missing_entry_fails() {
        let mut table = MshrTable::new(1);
        assert!(!table.merge(1, waiter(0)));
        assert!(table.waiters(1).is_none());
    }

    #[test]
    fn many_merges_share_one_entry() {
        let mut table = MshrTable::new(4);
        table.allocate(9, waiter(0), 0).unwrap();
        for tag in 1..10 {
            assert!(table.merge(9, waiter(tag)));
        }
        assert_eq!(table.len(), 1);
        let tags: Vec<_> = table.waiters(9).unwrap().iter().map(|w| w.tag).collect();
        assert_eq!(tags, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn fill_and_drain_repeatedly() {
        let mut table = MshrTable::new(4);
        for round in 0..100 {
            for line in 0..4 {
                assert!(table.allocate(line, waiter(line), round).is_ok(), "round {round}");
            }
            assert!(table.is_full());
            for line in 0..4 {
                assert!(table.release(line).is_some(), "round {round}");
            }
        }
    }
}
