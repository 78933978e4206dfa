/// Round-robin warp selection: the search starts one past the last granted warp, so every
/// eligible warp is granted within `num_warps` cycles.
#[derive(Debug, Clone, Default)]
pub struct WarpScheduler {
    rr_cursor: usize,
}

impl WarpScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, eligible: &[bool]) -> Option<usize> {
        let n = eligible.len();
        if n == 0 {
            return None;
        }
        let start = self.rr_cursor % n;
        let wid = (0..n).map(|offset| (start + offset) % n).find(|&w| eligible[w])?;
        self.rr_cursor = (wid + 1) % n;
        Some(wid)
    }

    pub fn reset(&mut self) {
        self.rr_cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::WarpScheduler;

    #[test]
    fn grants_round_robin_across_eligible() {
        let mut sched = WarpScheduler::new();
        let eligible = [true; 4];
        let grants: Vec<_> = (0..6).map(|_| sched.select(&eligible).unwrap()).collect();
        assert_eq!(grants, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn skips_ineligible_warps() {
        let mut sched = WarpScheduler::new();
        let eligible = [false, true, false, true];
        assert_eq!(sched.select(&eligible), Some(1));
        assert_eq!(sched.select(&eligible), Some(3));
        assert_eq!(sched.select(&eligible), Some(1));
        assert_eq!(sched.select(&[false; 4]), None);
    }
}
