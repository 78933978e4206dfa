use crate::timeflow::ipdom::IpdomStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarpStatus {
    Idle,
    Active,
    BarrierWait,
    HazardStall,
    Diverged,
}

#[derive(Debug, Clone)]
pub struct WarpState {
    pub active: bool,
    /// Next pc to fetch.
    pub pc: u64,
    pub tmask: u32,
    pub ipdom: IpdomStack,
    pub barrier_wait: bool,
    /// Head of the ibuffer was blocked by the scoreboard on the last issue attempt.
    pub hazard: bool,
    pub fetch_pending: bool,
    /// A warp-control instruction was decoded and has not committed yet.
    pub control_pending: bool,
}

impl WarpState {
    pub fn new(ipdom_size: usize) -> Self {
        Self {
            active: false,
            pc: 0,
            tmask: 0,
            ipdom: IpdomStack::new(ipdom_size),
            barrier_wait: false,
            hazard: false,
            fetch_pending: false,
            control_pending: false,
        }
    }

    pub fn activate(&mut self, pc: u64, tmask: u32) {
        self.reset();
        self.active = true;
        self.pc = pc;
        self.tmask = tmask;
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.pc = 0;
        self.tmask = 0;
        self.ipdom.clear();
        self.barrier_wait = false;
        self.hazard = false;
        self.fetch_pending = false;
        self.control_pending = false;
    }

    /// Ready to have its next instruction fetched.
    pub fn can_fetch(&self) -> bool {
        self.active && !self.barrier_wait && !self.fetch_pending && !self.control_pending
    }

    pub fn status(&self) -> WarpStatus {
        if !self.active {
            WarpStatus::Idle
        } else if self.barrier_wait {
            WarpStatus::BarrierWait
        } else if self.hazard {
            WarpStatus::HazardStall
        } else if self.ipdom.is_diverged() {
            WarpStatus::Diverged
        } else {
            WarpStatus::Active
        }
    }
}
