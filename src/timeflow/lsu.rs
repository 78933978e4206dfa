use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace};
use smallvec::SmallVec;

use crate::base::port::{InputPort, OutputPort, Port};
use crate::sim::perf::CoreCounters;
use crate::timeflow::config::CoreConfig;
use crate::timeflow::exe_unit::ExeUnit;
use crate::timeflow::gmem::{MemReq, MemRsp, SmemConfig};
use crate::timeflow::isa::{ExeType, Instr};
use crate::timeflow::trace::{PipelineTrace, TraceArena, TraceId};
use crate::timeq::Cycle;

const WORD_BYTES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Dcache,
    Smem,
}

#[derive(Debug)]
struct PendingReq {
    trace: TraceId,
    lane: usize,
    /// Sub-requests still outstanding.
    count: usize,
    accepted_at: Cycle,
}

/// Load/store unit.
///
/// A memory instruction is split into sub-requests: active-thread addresses inside the shared
/// memory window become one word request each, the rest are coalesced by dcache line. Each
/// sub-request is queued on the memory lane of the first thread that produced it. A load is
/// forwarded to writeback exactly once, when its last sub-request has been answered; a store is
/// forwarded as soon as it is accepted.
///
/// A fence locks the unit: no memory instruction is accepted from any lane until every pending
/// load has completed, at which point the fence itself is forwarded.
pub struct LsuUnit {
    inputs: Vec<Port<InputPort, TraceId>>,
    outputs: Vec<Port<OutputPort, TraceId>>,
    pub dcache_req: Vec<Port<OutputPort, MemReq>>,
    pub dcache_rsp: Vec<Port<InputPort, MemRsp>>,
    pub smem_req: Vec<Port<OutputPort, MemReq>>,
    pub smem_rsp: Vec<Port<InputPort, MemRsp>>,

    pending_rd_reqs: HashMap<u64, PendingReq>,
    pending_loads: usize,
    fence_lock: bool,
    fence_state: Option<(usize, TraceId)>,
    input_idx: usize,
    next_tag: u64,
    dcache_outbox: Vec<VecDeque<MemReq>>,
    smem_outbox: Vec<VecDeque<MemReq>>,
    /// Completed traces waiting for their output port.
    ready: Vec<VecDeque<TraceId>>,

    queue_size: usize,
    outbox_depth: usize,
    line_size: u32,
    smem: SmemConfig,
    perf: Arc<CoreCounters>,
}

impl LsuUnit {
    pub fn new(
        config: &CoreConfig,
        num_threads: usize,
        line_size: u32,
        smem: SmemConfig,
        perf: Arc<CoreCounters>,
    ) -> Self {
        assert!(line_size.is_power_of_two(), "dcache line size must be a power of two");
        let lanes = config.issue_width;
        Self {
            inputs: (0..lanes).map(|_| Port::new()).collect(),
            outputs: (0..lanes).map(|_| Port::new()).collect(),
            dcache_req: (0..num_threads).map(|_| Port::new()).collect(),
            dcache_rsp: (0..num_threads).map(|_| Port::new()).collect(),
            smem_req: (0..num_threads).map(|_| Port::new()).collect(),
            smem_rsp: (0..num_threads).map(|_| Port::new()).collect(),
            pending_rd_reqs: HashMap::new(),
            pending_loads: 0,
            fence_lock: false,
            fence_state: None,
            input_idx: 0,
            next_tag: 0,
            dcache_outbox: vec![VecDeque::new(); num_threads],
            smem_outbox: vec![VecDeque::new(); num_threads],
            ready: vec![VecDeque::new(); lanes],
            queue_size: config.lsu_queue_size,
            outbox_depth: config.lsu_outbox_depth,
            line_size,
            smem,
            perf,
        }
    }

    /// Sub-requests still waiting for a response, over all loads.
    pub fn pending_loads(&self) -> usize {
        self.pending_loads
    }

    pub fn fence_locked(&self) -> bool {
        self.fence_lock
    }

    fn split(&self, trace: &PipelineTrace, write: bool, tag: u64) -> SmallVec<[(Target, usize, MemReq); 8]> {
        let mut reqs: SmallVec<[(Target, usize, MemReq); 8]> = SmallVec::new();
        let line_mask = !(self.line_size as u64 - 1);
        for (thread, &addr) in trace.active_threads().zip(trace.mem_addrs.iter()) {
            if self.smem.contains(addr) {
                let req = MemReq {
                    addr,
                    write,
                    tag,
                    size: WORD_BYTES,
                };
                reqs.push((Target::Smem, thread, req));
                continue;
            }
            let line = addr & line_mask;
            let coalesced = reqs
                .iter()
                .any(|(target, _, req)| *target == Target::Dcache && req.addr == line);
            if !coalesced {
                let req = MemReq {
                    addr: line,
                    write,
                    tag,
                    size: self.line_size,
                };
                reqs.push((Target::Dcache, thread, req));
            }
        }
        reqs
    }

    fn outbox(&mut self, target: Target, lane: usize) -> &mut VecDeque<MemReq> {
        match target {
            Target::Dcache => &mut self.dcache_outbox[lane],
            Target::Smem => &mut self.smem_outbox[lane],
        }
    }

    fn has_room(&self, reqs: &[(Target, usize, MemReq)]) -> bool {
        let mut extra: SmallVec<[(Target, usize, usize); 8]> = SmallVec::new();
        for &(target, lane, _) in reqs {
            match extra.iter_mut().find(|(t, l, _)| *t == target && *l == lane) {
                Some(entry) => entry.2 += 1,
                None => extra.push((target, lane, 1)),
            }
        }
        extra.iter().all(|&(target, lane, n)| {
            let queued = match target {
                Target::Dcache => self.dcache_outbox[lane].len(),
                Target::Smem => self.smem_outbox[lane].len(),
            };
            queued + n <= self.outbox_depth.max(n)
        })
    }

    /// Try to take the head of issue lane `lane`. Returns whether it was consumed.
    fn accept(&mut self, now: Cycle, lane: usize, id: TraceId, traces: &TraceArena) -> bool {
        let trace = &traces[id];
        match *trace.instr() {
            Instr::Fence => {
                self.fence_lock = true;
                self.fence_state = Some((lane, id));
                debug!("lsu: fence uid {} locks with {} loads pending", trace.uid, self.pending_loads);
                true
            }
            Instr::Load { .. } | Instr::Store { .. } => {
                let write = matches!(trace.instr(), Instr::Store { .. });
                if !write && self.pending_rd_reqs.len() >= self.queue_size {
                    return false;
                }
                let tag = self.next_tag;
                let reqs = self.split(trace, write, tag);
                if !self.has_room(&reqs) {
                    return false;
                }
                self.next_tag += 1;
                for &(target, mem_lane, req) in &reqs {
                    self.outbox(target, mem_lane).push_back(req);
                }
                trace!("lsu: uid {} split into {} requests", trace.uid, reqs.len());

                if write {
                    self.perf.stores.inc();
                    self.ready[lane].push_back(id);
                } else {
                    self.perf.loads.inc();
                    if reqs.is_empty() {
                        self.ready[lane].push_back(id);
                    } else {
                        self.pending_loads += reqs.len();
                        self.pending_rd_reqs.insert(
                            tag,
                            PendingReq {
                                trace: id,
                                lane,
                                count: reqs.len(),
                                accepted_at: now,
                            },
                        );
                    }
                }
                true
            }
            ref other => panic!("lsu received non-memory instruction {other:?}"),
        }
    }

    fn complete(&mut self, now: Cycle, rsp: MemRsp) {
        let Some(pending) = self.pending_rd_reqs.get_mut(&rsp.tag) else {
            debug!("lsu: dropping response with unknown tag {}", rsp.tag);
            return;
        };
        pending.count -= 1;
        self.pending_loads -= 1;
        if pending.count > 0 {
            return;
        }
        if let Some(done) = self.pending_rd_reqs.remove(&rsp.tag) {
            self.perf.load_lat.add(now - done.accepted_at);
            self.ready[done.lane].push_back(done.trace);
        }
    }

    fn drain_responses(&mut self, now: Cycle) {
        for lane in 0..self.dcache_rsp.len() {
            while let Some(rsp) = self.dcache_rsp[lane].pop(now) {
                self.complete(now, rsp);
            }
            while let Some(rsp) = self.smem_rsp[lane].pop(now) {
                self.complete(now, rsp);
            }
        }
    }

    fn send_requests(&mut self, now: Cycle) {
        for (outbox, port) in self.dcache_outbox.iter_mut().zip(self.dcache_req.iter_mut()) {
            while let Some(req) = outbox.pop_front() {
                if let Err(req) = port.try_push(now, req) {
                    outbox.push_front(req);
                    break;
                }
            }
        }
        for (outbox, port) in self.smem_outbox.iter_mut().zip(self.smem_req.iter_mut()) {
            while let Some(req) = outbox.pop_front() {
                if let Err(req) = port.try_push(now, req) {
                    outbox.push_front(req);
                    break;
                }
            }
        }
    }

    fn release_fence(&mut self) {
        if !self.fence_lock || self.pending_loads > 0 {
            return;
        }
        if let Some((lane, id)) = self.fence_state.take() {
            debug!("lsu: fence released");
            self.ready[lane].push_back(id);
        }
        self.fence_lock = false;
    }

    fn accept_inputs(&mut self, now: Cycle, traces: &TraceArena) {
        if self.fence_lock {
            return;
        }
        let lanes = self.inputs.len();
        for k in 0..lanes {
            let lane = (self.input_idx + k) % lanes;
            let Some(id) = self.inputs[lane].peek(now) else {
                continue;
            };
            if self.accept(now, lane, id, traces) {
                self.inputs[lane].pop(now);
                self.input_idx = (lane + 1) % lanes;
                return;
            }
        }
    }

    fn forward(&mut self, now: Cycle) {
        for (ready, port) in self.ready.iter_mut().zip(self.outputs.iter_mut()) {
            while let Some(id) = ready.pop_front() {
                if let Err(id) = port.try_push(now, id) {
                    ready.push_front(id);
                    break;
                }
            }
        }
    }
}

impl ExeUnit for LsuUnit {
    fn exe_type(&self) -> ExeType {
        ExeType::Lsu
    }

    fn tick(&mut self, now: Cycle, traces: &mut TraceArena) {
        self.drain_responses(now);
        self.release_fence();
        self.accept_inputs(now, traces);
        self.release_fence();
        self.send_requests(now);
        self.forward(now);
    }

    fn reset(&mut self) {
        self.pending_rd_reqs.clear();
        self.pending_loads = 0;
        self.fence_lock = false;
        self.fence_state = None;
        self.input_idx = 0;
        self.next_tag = 0;
        self.dcache_outbox.iter_mut().for_each(VecDeque::clear);
        self.smem_outbox.iter_mut().for_each(VecDeque::clear);
        self.ready.iter_mut().for_each(VecDeque::clear);
        self.inputs.iter_mut().for_each(Port::clear);
        self.dcache_rsp.iter_mut().for_each(Port::clear);
        self.smem_rsp.iter_mut().for_each(Port::clear);
    }

    fn inputs_mut(&mut self) -> &mut [Port<InputPort, TraceId>] {
        &mut self.inputs
    }

    fn outputs_mut(&mut self) -> &mut [Port<OutputPort, TraceId>] {
        &mut self.outputs
    }

    fn is_idle(&self) -> bool {
        self.pending_rd_reqs.is_empty()
            && !self.fence_lock
            && self.dcache_outbox.iter().all(VecDeque::is_empty)
            && self.smem_outbox.iter().all(VecDeque::is_empty)
            && self.ready.iter().all(VecDeque::is_empty)
            && self.inputs.iter().all(|p| p.occupancy() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::port::{link, link_vec};
    use crate::timeflow::isa::Reg;

    struct Harness {
        lsu: LsuUnit,
        issue: Vec<Port<OutputPort, TraceId>>,
        commit: Vec<Port<InputPort, TraceId>>,
        mem_in: Vec<Port<InputPort, MemReq>>,
        mem_out: Vec<Port<OutputPort, MemRsp>>,
        traces: TraceArena,
    }

    fn harness(threads: usize) -> Harness {
        let config = CoreConfig::default();
        let mut lsu = LsuUnit::new(
            &config,
            threads,
            64,
            SmemConfig::default(),
            Arc::new(CoreCounters::default()),
        );
        let mut issue: Vec<_> = (0..config.issue_width).map(|_| Port::new()).collect();
        let mut commit: Vec<_> = (0..config.issue_width).map(|_| Port::new()).collect();
        link_vec(lsu.inputs_mut(), &mut issue, 2);
        link_vec(&mut commit, lsu.outputs_mut(), 2);
        let mut mem_in: Vec<_> = (0..threads).map(|_| Port::new()).collect();
        let mut mem_out: Vec<_> = (0..threads).map(|_| Port::new()).collect();
        for t in 0..threads {
            link(&mut mem_in[t], &mut lsu.dcache_req[t], 4);
            link(&mut lsu.dcache_rsp[t], &mut mem_out[t], 4);
            crate::base::port::tie_off_input(&mut lsu.smem_rsp[t]);
        }
        Harness {
            lsu,
            issue,
            commit,
            mem_in,
            mem_out,
            traces: TraceArena::new(),
        }
    }

    fn load(traces: &mut TraceArena, uid: u64, tmask: u32, base: u64, stride: u64) -> TraceId {
        let mut trace = PipelineTrace::new(uid, 0, 0, tmask, 0);
        trace.instr = Some(Instr::Load {
            rd: Reg::x(5),
            rs1: Reg::x(1),
            base: base as u32,
            stride: stride as u8,
        });
        let addrs: Vec<_> = trace.active_threads().map(|t| base + t as u64 * stride).collect();
        trace.mem_addrs.extend(addrs);
        traces.insert(trace)
    }

    #[test]
    fn load_forwards_once_after_all_sub_requests() {
        let mut h = harness(4);
        // stride of a full line: four sub-requests, one per thread lane
        let id = load(&mut h.traces, 0, 0b1111, 0x1000, 64);
        h.issue[0].try_push(0, id).unwrap();

        let mut requests = Vec::new();
        let mut writebacks = Vec::new();
        for now in 0..30 {
            h.lsu.tick(now, &mut h.traces);
            for lane in 0..4 {
                if let Some(req) = h.mem_in[lane].pop(now) {
                    requests.push((lane, req));
                }
            }
            // answer one sub-request every five cycles
            if now % 5 == 4 {
                if let Some((lane, req)) = requests.pop() {
                    h.mem_out[lane].try_push(now, MemRsp::for_request(&req)).unwrap();
                }
            }
            while let Some(done) = h.commit[0].pop(now) {
                writebacks.push((now, done));
            }
            if writebacks.is_empty() && now < 20 {
                assert!(h.lsu.pending_loads() > 0 || now < 2);
            }
        }
        assert_eq!(writebacks.len(), 1);
        assert_eq!(writebacks[0].1, id);
        assert!(writebacks[0].0 > 19);
        assert!(h.lsu.is_idle());
    }

    #[test]
    fn same_line_addresses_coalesce() {
        let h = harness(4);
        let mut traces = TraceArena::new();
        let id = load(&mut traces, 0, 0b1111, 0x2000, 4);
        let reqs = h.lsu.split(&traces[id], false, 0);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].2.addr, 0x2000);

        let smem_base = SmemConfig::default().base_addr;
        let id = load(&mut traces, 1, 0b0101, smem_base, 4);
        let reqs = h.lsu.split(&traces[id], false, 1);
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|(t, _, _)| *t == Target::Smem));
        assert_eq!(reqs[1].1, 2);
    }
}
