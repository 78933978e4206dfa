use smallvec::SmallVec;

use crate::base::arena::{Arena, Handle};
use crate::timeflow::isa::{ExeType, Instr};
use crate::timeq::Cycle;

/// One warp-instruction in flight. Created when the scheduler picks a warp, retired at commit.
/// Exactly one pipeline stage or port holds its handle at any time.
#[derive(Debug, Clone)]
pub struct PipelineTrace {
    /// Per-core sequence number, monotonic in schedule order.
    pub uid: u64,
    pub wid: usize,
    pub pc: u64,
    pub tmask: u32,
    /// Filled in at decode.
    pub instr: Option<Instr>,
    /// Byte address touched by each active thread, in thread order.
    pub mem_addrs: SmallVec<[u64; 8]>,
    pub fetch_cycle: Cycle,
    pub issue_cycle: Cycle,
}

impl PipelineTrace {
    pub fn new(uid: u64, wid: usize, pc: u64, tmask: u32, now: Cycle) -> Self {
        Self {
            uid,
            wid,
            pc,
            tmask,
            instr: None,
            mem_addrs: SmallVec::new(),
            fetch_cycle: now,
            issue_cycle: 0,
        }
    }

    /// Decoded instruction. Only called past decode.
    pub fn instr(&self) -> &Instr {
        self.instr
            .as_ref()
            .expect("trace inspected before decode")
    }

    pub fn exe_type(&self) -> ExeType {
        self.instr().exe_type()
    }

    pub fn active_threads(&self) -> impl Iterator<Item = usize> + '_ {
        (0..32).filter(move |t| self.tmask & (1 << t) != 0)
    }
}

pub type TraceId = Handle<PipelineTrace>;
pub type TraceArena = Arena<PipelineTrace>;
