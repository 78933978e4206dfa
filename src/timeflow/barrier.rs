use log::debug;

use crate::timeq::Cycle;

#[derive(Debug, Clone, Default)]
struct BarrierState {
    arrived: Vec<usize>,
    first_arrival: Option<Cycle>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierSummary {
    pub arrivals: u64,
    pub release_events: u64,
    pub warps_released: u64,
    pub max_wait_cycles: u64,
}

/// Warp barriers of one core. A barrier releases its whole group on the cycle the last expected
/// warp arrives, and not before.
#[derive(Debug)]
pub struct BarrierTable {
    states: Vec<BarrierState>,
    num_warps: usize,
    stats: BarrierSummary,
}

impl BarrierTable {
    pub fn new(num_barriers: usize, num_warps: usize) -> Self {
        assert!(num_barriers > 0, "need at least one barrier");
        Self {
            states: vec![BarrierState::default(); num_barriers],
            num_warps,
            stats: BarrierSummary::default(),
        }
    }

    fn apply_id_mask(&self, id: usize) -> usize {
        id % self.states.len()
    }

    /// Record that `wid` reached barrier `id`, which waits for `count` warps. Returns the warps to
    /// release once the group is complete.
    pub fn arrive(&mut self, now: Cycle, id: usize, wid: usize, count: usize) -> Option<Vec<usize>> {
        debug_assert!(wid < self.num_warps);
        let id = self.apply_id_mask(id);
        let expected = count.clamp(1, self.num_warps);
        self.stats.arrivals += 1;

        let state = &mut self.states[id];
        if !state.arrived.contains(&wid) {
            state.arrived.push(wid);
        }
        let first = *state.first_arrival.get_or_insert(now);
        if state.arrived.len() < expected {
            debug!("barrier {}: warp {} waiting ({}/{})", id, wid, state.arrived.len(), expected);
            return None;
        }

        let released = std::mem::take(&mut state.arrived);
        state.first_arrival = None;
        self.stats.release_events += 1;
        self.stats.warps_released += released.len() as u64;
        self.stats.max_wait_cycles = self.stats.max_wait_cycles.max(now - first);
        debug!("barrier {}: releasing warps {:?}", id, released);
        Some(released)
    }

    pub fn waiting(&self, id: usize) -> usize {
        self.states[self.apply_id_mask(id)].arrived.len()
    }

    pub fn stats(&self) -> BarrierSummary {
        self.stats
    }

    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(|s| *s = BarrierState::default());
        self.stats = BarrierSummary::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_only_when_group_complete() {
        let mut table = BarrierTable::new(4, 4);
        assert_eq!(table.arrive(0, 1, 0, 3), None);
        assert_eq!(table.arrive(5, 1, 2, 3), None);
        assert_eq!(table.waiting(1), 2);
        assert_eq!(table.arrive(9, 1, 3, 3), Some(vec![0, 2, 3]));
        assert_eq!(table.waiting(1), 0);
        assert_eq!(table.stats().max_wait_cycles, 9);
    }

    #[test]
    fn barriers_are_independent() {
        let mut table = BarrierTable::new(2, 2);
        assert_eq!(table.arrive(0, 0, 0, 2), None);
        assert_eq!(table.arrive(0, 1, 1, 2), None);
        assert_eq!(table.arrive(1, 0, 1, 2), Some(vec![0, 1]));
        assert_eq!(table.waiting(1), 1);
    }

    #[test]
    fn single_warp_barrier_passes_through() {
        let mut table = BarrierTable::new(1, 4);
        assert_eq!(table.arrive(3, 0, 2, 1), Some(vec![2]));
        assert_eq!(table.stats().release_events, 1);
    }
}
