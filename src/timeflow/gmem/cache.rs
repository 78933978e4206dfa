use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::policy::ReplacementPolicy;

#[derive(Debug, Clone, Copy, Default)]
struct LineState {
    tag: u64,
    valid: bool,
    dirty: bool,
    referenced: bool,
}

/// Line pushed out of the array by a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub line_addr: u64,
    pub dirty: bool,
}

/// Tags of one cache bank. Lines are identified by their full line address; `set_key` is the
/// bank-local line index that selects the set.
#[derive(Debug)]
pub(crate) struct CacheTagArray {
    sets: usize,
    ways: usize,
    lines: Vec<LineState>,
    policy: ReplacementPolicy,
    rng: StdRng,
}

impl CacheTagArray {
    pub(crate) fn new(sets: usize, ways: usize, policy: ReplacementPolicy, seed: u64) -> Self {
        assert!(sets > 0 && ways > 0, "tag array needs at least one set and way");
        Self {
            sets,
            ways,
            lines: vec![LineState::default(); sets * ways],
            policy,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn set_range(&self, set_key: u64) -> std::ops::Range<usize> {
        let set = (set_key % self.sets as u64) as usize;
        set * self.ways..(set + 1) * self.ways
    }

    fn find(&self, set_key: u64, line_addr: u64) -> Option<usize> {
        self.set_range(set_key)
            .find(|&i| self.lines[i].valid && self.lines[i].tag == line_addr)
    }

    /// Tag lookup; a hit marks the line recently used.
    pub(crate) fn probe(&mut self, set_key: u64, line_addr: u64) -> bool {
        match self.find(set_key, line_addr) {
            Some(idx) => {
                self.touch(set_key, idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, set_key: u64, line_addr: u64) -> bool {
        self.find(set_key, line_addr).is_some()
    }

    pub(crate) fn mark_dirty(&mut self, set_key: u64, line_addr: u64) {
        if let Some(idx) = self.find(set_key, line_addr) {
            self.lines[idx].dirty = true;
        }
    }

    pub(crate) fn is_dirty(&self, set_key: u64, line_addr: u64) -> bool {
        self.find(set_key, line_addr)
            .is_some_and(|idx| self.lines[idx].dirty)
    }

    /// Install a line, returning the valid line it replaced.
    pub(crate) fn fill(&mut self, set_key: u64, line_addr: u64) -> Option<Eviction> {
        if let Some(idx) = self.find(set_key, line_addr) {
            self.touch(set_key, idx);
            return None;
        }

        let idx = self.victim(set_key);
        let old = self.lines[idx];
        self.lines[idx] = LineState {
            tag: line_addr,
            valid: true,
            dirty: false,
            referenced: false,
        };
        self.touch(set_key, idx);
        old.valid.then_some(Eviction {
            line_addr: old.tag,
            dirty: old.dirty,
        })
    }

    fn victim(&mut self, set_key: u64) -> usize {
        let range = self.set_range(set_key);
        if let Some(idx) = range.clone().find(|&i| !self.lines[i].valid) {
            return idx;
        }
        match self.policy {
            ReplacementPolicy::Nru => range
                .clone()
                .find(|&i| !self.lines[i].referenced)
                .unwrap_or(range.start),
            ReplacementPolicy::Random => range.start + self.rng.gen_range(0..self.ways),
        }
    }

    // Once every way of a set is referenced, only the latest access keeps its bit.
    fn touch(&mut self, set_key: u64, idx: usize) {
        self.lines[idx].referenced = true;
        let range = self.set_range(set_key);
        if self.lines[range.clone()].iter().all(|line| line.referenced) {
            for i in range {
                self.lines[i].referenced = i == idx;
            }
        }
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.lines.fill(LineState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nru(sets: usize, ways: usize) -> CacheTagArray {
        CacheTagArray::new(sets, ways, ReplacementPolicy::Nru, 0)
    }

    #[test]
    fn cache_tag_array_hits_and_evicts() {
        let mut tags = nru(1, 2);
        assert!(!tags.probe(0, 0));
        assert_eq!(tags.fill(0, 0), None);
        assert_eq!(tags.fill(0, 1), None);
        assert!(tags.probe(0, 0));
        let evicted = tags.fill(0, 2).unwrap();
        assert_eq!(evicted.line_addr, 1);
        assert!(tags.probe(0, 0));
        assert!(!tags.probe(0, 1));
    }

    #[test]
    fn nru_skips_recently_used_ways() {
        let mut tags = nru(1, 4);
        for line in 0..4 {
            tags.fill(0, line);
        }
        // filling the fourth way saturated the set, so only line 3 is still referenced
        assert!(tags.probe(0, 0));
        assert!(tags.probe(0, 1));
        assert_eq!(tags.fill(0, 4).unwrap().line_addr, 2);
    }

    #[test]
    fn dirty_bit_travels_with_eviction() {
        let mut tags = nru(1, 1);
        tags.fill(0, 7);
        tags.mark_dirty(0, 7);
        assert!(tags.is_dirty(0, 7));
        assert_eq!(
            tags.fill(0, 8),
            Some(Eviction {
                line_addr: 7,
                dirty: true
            })
        );
        assert!(!tags.is_dirty(0, 8));
    }

    #[test]
    fn sets_are_independent() {
        let mut tags = nru(2, 1);
        tags.fill(0, 10);
        tags.fill(1, 11);
        assert!(tags.contains(0, 10));
        assert!(tags.contains(1, 11));
        assert!(!tags.contains(1, 10));
    }

    #[test]
    fn random_policy_is_deterministic_per_seed() {
        let run = |seed| {
            let mut tags = CacheTagArray::new(1, 4, ReplacementPolicy::Random, seed);
            (0..16)
                .filter_map(|line| tags.fill(0, line))
                .map(|e| e.line_addr)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(3), run(3));
    }

    #[test]
    fn invalidate_all_clears_entire_cache() {
        let mut tags = nru(4, 2);
        tags.fill(1, 1);
        tags.fill(2, 2);
        tags.invalidate_all();
        assert!(!tags.probe(1, 1));
        assert!(!tags.probe(2, 2));
    }
}
