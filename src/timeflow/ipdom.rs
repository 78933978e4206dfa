use log::trace;

/// Where a warp goes after a JOIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAction {
    /// Run the deferred else path.
    Jump { pc: u64, tmask: u32 },
    /// Both paths are done; restore the mask from before the split.
    Reconverge { pc: u64, tmask: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Mask to restore when the split region ends. Uniform splits push one too so every JOIN
    /// has an entry to pop.
    Fallthrough { tmask: u32, divergent: bool },
    Else { tmask: u32, pc: u64 },
}

/// Per-warp immediate post-dominator stack.
///
/// A divergent split pushes two entries, so `capacity` is `2 * (threads - 1)`: every nested
/// divergent split strictly shrinks the active mask. Overflowing it means the arch was built with
/// the wrong thread count and aborts the run.
#[derive(Debug, Clone)]
pub struct IpdomStack {
    entries: Vec<Entry>,
    capacity: usize,
    divergent_entries: usize,
}

impl IpdomStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            divergent_entries: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// True while some thread of the warp is parked on a pending else path or reconvergence.
    pub fn is_diverged(&self) -> bool {
        self.divergent_entries > 0
    }

    /// Apply a SPLIT executed with mask `tmask`. Returns the pc and mask the warp continues with.
    pub fn split(&mut self, tmask: u32, then_mask: u32, else_pc: u64, next_pc: u64) -> (u64, u32) {
        let taken = tmask & then_mask;
        let not_taken = tmask & !then_mask;

        if taken != 0 && not_taken != 0 {
            if self.divergent_entries + 2 > self.capacity {
                panic!(
                    "IPDOM stack overflow: depth {} exceeds {} entries",
                    self.divergent_entries + 2,
                    self.capacity
                );
            }
            self.entries.push(Entry::Fallthrough {
                tmask,
                divergent: true,
            });
            self.entries.push(Entry::Else {
                tmask: not_taken,
                pc: else_pc,
            });
            self.divergent_entries += 2;
            trace!("split {:#x} -> then {:#x} / else {:#x}", tmask, taken, not_taken);
            return (next_pc, taken);
        }

        self.entries.push(Entry::Fallthrough {
            tmask,
            divergent: false,
        });
        if taken != 0 {
            (next_pc, tmask)
        } else {
            (else_pc, tmask)
        }
    }

    /// Apply a JOIN whose fallthrough pc is `next_pc`. `None` if no split is open.
    pub fn join(&mut self, next_pc: u64) -> Option<JoinAction> {
        let action = match self.entries.pop()? {
            Entry::Else { tmask, pc } => {
                self.divergent_entries -= 1;
                JoinAction::Jump { pc, tmask }
            }
            Entry::Fallthrough { tmask, divergent } => {
                if divergent {
                    self.divergent_entries -= 1;
                }
                JoinAction::Reconverge { pc: next_pc, tmask }
            }
        };
        Some(action)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.divergent_entries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divergent_split_runs_both_paths_then_reconverges() {
        let mut ipdom = IpdomStack::new(6);
        let (pc, mask) = ipdom.split(0b1111, 0b0011, 0x30, 0x18);
        assert_eq!((pc, mask), (0x18, 0b0011));
        assert!(ipdom.is_diverged());

        assert_eq!(
            ipdom.join(0x48),
            Some(JoinAction::Jump {
                pc: 0x30,
                tmask: 0b1100
            })
        );
        assert_eq!(
            ipdom.join(0x48),
            Some(JoinAction::Reconverge {
                pc: 0x48,
                tmask: 0b1111
            })
        );
        assert!(!ipdom.is_diverged());
        assert_eq!(ipdom.depth(), 0);
    }

    #[test]
    fn uniform_split_keeps_mask() {
        let mut ipdom = IpdomStack::new(0);
        assert_eq!(ipdom.split(0b1, 0b1, 0x40, 0x8), (0x8, 0b1));
        assert!(!ipdom.is_diverged());
        assert_eq!(
            ipdom.join(0x48),
            Some(JoinAction::Reconverge { pc: 0x48, tmask: 0b1 })
        );

        // nobody takes the then path: jump straight to the else block
        assert_eq!(ipdom.split(0b11, 0, 0x40, 0x8), (0x40, 0b11));
    }

    #[test]
    fn unmatched_join() {
        assert_eq!(IpdomStack::new(2).join(0), None);
    }

    #[test]
    #[should_panic(expected = "IPDOM stack overflow")]
    fn overflow_is_fatal() {
        let mut ipdom = IpdomStack::new(2);
        ipdom.split(0b111, 0b011, 0x100, 0x8);
        ipdom.split(0b011, 0b001, 0x80, 0x10);
    }
}
