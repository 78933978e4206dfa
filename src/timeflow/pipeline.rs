use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use log::{debug, error, info, trace, warn};

use crate::base::behavior::*;
use crate::base::mem::HasMemory;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::base::port::{link_vec, InputPort, OutputPort, Port};
use crate::sim::arch::Arch;
use crate::sim::dcrs::Dcrs;
use crate::sim::perf::{CoreCounters, PerfRegistry};
use crate::sim::sparse_mem::SparseMemory;
use crate::timeflow::barrier::BarrierTable;
use crate::timeflow::config::{CoreConfig, GfxConfig};
use crate::timeflow::exe_unit::{AluUnit, ExeUnit, FpuUnit};
use crate::timeflow::gmem::{CacheHierarchyConfig, MemReq, MemRsp};
use crate::timeflow::ipdom::JoinAction;
use crate::timeflow::isa::{decode, ExeType, GfxKind, Instr, INSTR_BYTES};
use crate::timeflow::lsu::LsuUnit;
use crate::timeflow::scoreboard::Scoreboard;
use crate::timeflow::sfu::SfuUnit;
use crate::timeflow::trace::{PipelineTrace, TraceArena, TraceId};
use crate::timeflow::warp::{WarpState, WarpStatus};
use crate::timeflow::warp_scheduler::WarpScheduler;
use crate::timeq::Cycle;

/// Everything a processor shares with the objects it elaborates.
pub struct CoreContext<'a> {
    pub arch: &'a Arc<Arch>,
    pub core: &'a Arc<CoreConfig>,
    pub gfx: &'a GfxConfig,
    pub caches: &'a CacheHierarchyConfig,
    pub dcrs: &'a Dcrs,
    pub mem: &'a Arc<RwLock<SparseMemory>>,
    pub perf: &'a PerfRegistry,
    pub record_events: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Issue,
    Writeback,
    BarrierRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreEvent {
    pub cycle: Cycle,
    pub wid: usize,
    pub uid: u64,
    pub pc: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy)]
enum IssueBlock {
    Scoreboard,
    Unit(Instr),
}

pub struct CoreState {
    warps: Vec<WarpState>,
    ibuffers: Vec<VecDeque<TraceId>>,
    scoreboard: Scoreboard,
    barriers: BarrierTable,
    scheduler: WarpScheduler,
    traces: TraceArena,
    /// Fetches waiting for the icache, by request tag.
    inflight_fetch: HashMap<u64, TraceId>,
    issue_rr: Vec<usize>,
    next_uid: u64,
    events: Vec<CoreEvent>,
}

impl CoreState {
    fn new(arch: &Arch, config: &CoreConfig) -> Self {
        let warps = arch.num_warps();
        Self {
            warps: (0..warps).map(|_| WarpState::new(arch.ipdom_size())).collect(),
            ibuffers: vec![VecDeque::with_capacity(config.ibuffer_size); warps],
            scoreboard: Scoreboard::new(warps),
            barriers: BarrierTable::new(arch.num_barriers(), warps),
            scheduler: WarpScheduler::new(),
            traces: TraceArena::new(),
            inflight_fetch: HashMap::new(),
            issue_rr: vec![0; config.issue_width],
            next_uid: 0,
            events: Vec::new(),
        }
    }
}

/// One warp-parallel core: fetch/decode front end, warp scheduler, scoreboard, issue lanes and
/// the four execution units. Each tick runs the stages back to front, so a trace moves at most
/// one stage per cycle.
pub struct Core {
    base: ModuleBase<CoreState, CoreConfig>,
    id: usize,
    arch: Arc<Arch>,
    record_events: bool,
    pub icache_req: Port<OutputPort, MemReq>,
    pub icache_rsp: Port<InputPort, MemRsp>,
    alu: AluUnit,
    fpu: FpuUnit,
    pub lsu: LsuUnit,
    sfu: SfuUnit,
    /// Issue ports indexed by execution type, then lane.
    issue: Vec<Vec<Port<OutputPort, TraceId>>>,
    commit: Vec<Vec<Port<InputPort, TraceId>>>,
    mem: Arc<RwLock<SparseMemory>>,
    perf: Arc<CoreCounters>,
}

impl Core {
    pub fn new(id: usize, ctx: &CoreContext) -> Self {
        let config = Arc::clone(ctx.core);
        assert!(config.issue_width > 0, "issue_width must be > 0");
        assert!(config.ibuffer_size > 0, "ibuffer_size must be > 0");
        let arch = Arc::clone(ctx.arch);
        let perf = ctx.perf.core(id);

        let mut alu = AluUnit::new(&config);
        let mut fpu = FpuUnit::new(&config);
        let mut lsu = LsuUnit::new(
            &config,
            arch.num_threads(),
            ctx.caches.dcache.line_size,
            ctx.caches.smem,
            Arc::clone(&perf),
        );
        let mut sfu = SfuUnit::new(&config, ctx.gfx, ctx.dcrs, ctx.perf.core_gfx(id));

        let lanes = config.issue_width;
        let mut issue: Vec<Vec<_>> = ExeType::ALL
            .iter()
            .map(|_| (0..lanes).map(|_| Port::new()).collect())
            .collect();
        let mut commit: Vec<Vec<_>> = ExeType::ALL
            .iter()
            .map(|_| (0..lanes).map(|_| Port::new()).collect())
            .collect();
        {
            let units: [&mut dyn ExeUnit; 4] = [&mut alu, &mut fpu, &mut lsu, &mut sfu];
            for unit in units {
                let t = unit.exe_type().index();
                link_vec(unit.inputs_mut(), &mut issue[t], config.port_capacity);
                link_vec(&mut commit[t], unit.outputs_mut(), config.port_capacity);
            }
        }

        let state = CoreState::new(&arch, &config);
        Self {
            base: ModuleBase::new(state, config),
            id,
            arch,
            record_events: ctx.record_events,
            icache_req: Port::new(),
            icache_rsp: Port::new(),
            alu,
            fpu,
            lsu,
            sfu,
            issue,
            commit,
            mem: Arc::clone(ctx.mem),
            perf,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Activate every warp with all threads at `pc`.
    pub fn start(&mut self, pc: u64) {
        let tmask = self.arch.full_tmask();
        for warp in self.base.state.warps.iter_mut() {
            warp.activate(pc, tmask);
        }
        info!(
            "core {}: launching {} warps at {:#x}",
            self.id,
            self.base.state.warps.len(),
            pc
        );
    }

    pub fn warp_status(&self, wid: usize) -> WarpStatus {
        self.base.state.warps[wid].status()
    }

    pub fn warp_tmask(&self, wid: usize) -> u32 {
        self.base.state.warps[wid].tmask
    }

    pub fn events(&self) -> &[CoreEvent] {
        &self.base.state.events
    }

    pub fn take_events(&mut self) -> Vec<CoreEvent> {
        std::mem::take(&mut self.base.state.events)
    }

    pub fn counters(&self) -> &Arc<CoreCounters> {
        &self.perf
    }

    /// All warps halted and no instruction in flight.
    pub fn is_done(&self) -> bool {
        let state = &self.base.state;
        state.warps.iter().all(|w| !w.active)
            && state.traces.is_empty()
            && self.alu.is_idle()
            && self.fpu.is_idle()
            && self.lsu.is_idle()
            && self.sfu.is_idle()
    }

    fn record(&mut self, now: Cycle, wid: usize, uid: u64, pc: u64, kind: EventKind) {
        if self.record_events {
            self.base.state.events.push(CoreEvent {
                cycle: now,
                wid,
                uid,
                pc,
                kind,
            });
        }
    }

    fn commit(&mut self, now: Cycle) {
        for t in ExeType::ALL {
            for lane in 0..self.commit[t.index()].len() {
                while let Some(id) = self.commit[t.index()][lane].pop(now) {
                    self.retire(now, id);
                }
            }
        }
    }

    fn retire(&mut self, now: Cycle, id: TraceId) {
        let Some(trace) = self.base.state.traces.remove(id) else {
            panic!("core {}: retiring stale trace {id:?}", self.id);
        };
        let instr = *trace.instr();
        self.base
            .state
            .scoreboard
            .release(trace.wid, &instr, trace.uid);
        self.perf.instrs.inc();
        trace!(
            "core {}: warp {} retired uid {} {:?}",
            self.id,
            trace.wid,
            trace.uid,
            instr
        );
        self.record(now, trace.wid, trace.uid, trace.pc, EventKind::Writeback);
        if instr.is_warp_control() {
            self.apply_control(now, &trace, instr);
        }
    }

    fn apply_control(&mut self, now: Cycle, trace: &PipelineTrace, instr: Instr) {
        let wid = trace.wid;
        let next_pc = trace.pc + INSTR_BYTES;
        let state = &mut self.base.state;
        let warp = &mut state.warps[wid];
        match instr {
            Instr::Split {
                then_mask,
                else_offset,
            } => {
                let else_pc = branch_target(trace.pc, else_offset);
                let (pc, tmask) = warp.ipdom.split(trace.tmask, then_mask, else_pc, next_pc);
                warp.pc = pc;
                warp.tmask = tmask;
            }
            Instr::Join => match warp.ipdom.join(next_pc) {
                Some(JoinAction::Jump { pc, tmask }) | Some(JoinAction::Reconverge { pc, tmask }) => {
                    warp.pc = pc;
                    warp.tmask = tmask;
                }
                None => {
                    warn!("core {}: warp {} join at {:#x} without split", self.id, wid, trace.pc);
                    warp.pc = next_pc;
                }
            },
            Instr::Jump { offset } => warp.pc = branch_target(trace.pc, offset),
            Instr::Bar { id, count } => {
                warp.pc = next_pc;
                match state.barriers.arrive(now, id as usize, wid, count as usize) {
                    Some(released) => {
                        for w in released {
                            self.base.state.warps[w].barrier_wait = false;
                            self.record(now, w, trace.uid, trace.pc, EventKind::BarrierRelease);
                        }
                    }
                    None => state.warps[wid].barrier_wait = true,
                }
            }
            Instr::Halt => {
                warp.active = false;
                debug!("core {}: warp {} halted at {:#x}", self.id, wid, trace.pc);
            }
            other => unreachable!("{other:?} is not a warp-control instruction"),
        }
        self.base.state.warps[wid].control_pending = false;
    }

    fn execute(&mut self, now: Cycle) {
        let traces = &mut self.base.state.traces;
        self.alu.tick(now, traces);
        self.fpu.tick(now, traces);
        self.lsu.tick(now, traces);
        self.sfu.tick(now, traces);
    }

    fn count_unit_stall(&self, instr: &Instr) {
        match instr.exe_type() {
            ExeType::Alu => self.perf.alu_stalls.inc(),
            ExeType::Fpu => self.perf.fpu_stalls.inc(),
            ExeType::Lsu => self.perf.lsu_stalls.inc(),
            ExeType::Sfu => self.perf.sfu_stalls.inc(),
        }
        match instr {
            Instr::Gfx {
                kind: GfxKind::Tex, ..
            } => self.perf.tex_issue_stalls.inc(),
            Instr::Gfx {
                kind: GfxKind::Raster,
                ..
            } => self.perf.raster_issue_stalls.inc(),
            Instr::Gfx {
                kind: GfxKind::Rop, ..
            } => self.perf.rop_issue_stalls.inc(),
            _ => {}
        }
    }

    /// Each lane issues at most one instruction, the ibuffer head of one of its warps. A lane that
    /// issues nothing charges the cycle to the first obstacle it met.
    fn issue(&mut self, now: Cycle) {
        let lanes = self.issue[0].len();
        let num_warps = self.base.state.warps.len();

        for lane in 0..lanes {
            let start = self.base.state.issue_rr[lane];
            let mut blocked = None;
            let mut issued = None;

            for k in 0..num_warps {
                let wid = (start + k) % num_warps;
                if wid % lanes != lane {
                    continue;
                }
                let state = &mut self.base.state;
                let Some(&id) = state.ibuffers[wid].front() else {
                    continue;
                };
                let trace = &state.traces[id];
                let (uid, instr) = (trace.uid, *trace.instr());
                if state.scoreboard.in_use(wid, &instr) {
                    state.warps[wid].hazard = true;
                    blocked.get_or_insert(IssueBlock::Scoreboard);
                    continue;
                }
                state.warps[wid].hazard = false;

                let port = &mut self.issue[instr.exe_type().index()][lane];
                if port.full() {
                    blocked.get_or_insert(IssueBlock::Unit(instr));
                    continue;
                }
                if port.try_push(now, id).is_err() {
                    continue;
                }
                state.ibuffers[wid].pop_front();
                state.scoreboard.reserve(wid, &instr, uid);
                state.traces[id].issue_cycle = now;
                state.issue_rr[lane] = (wid + 1) % num_warps;
                issued = Some((wid, uid, state.traces[id].pc));
                break;
            }

            match (issued, blocked) {
                (Some((wid, uid, pc)), _) => {
                    trace!("core {}: lane {} issued uid {} from warp {}", self.id, lane, uid, wid);
                    self.record(now, wid, uid, pc, EventKind::Issue);
                }
                (None, Some(IssueBlock::Scoreboard)) => self.perf.scoreboard_stalls.inc(),
                (None, Some(IssueBlock::Unit(instr))) => self.count_unit_stall(&instr),
                (None, None) => {}
            }
        }
    }

    fn fetch_word(&self, pc: u64) -> Result<Instr, anyhow::Error> {
        let word = self
            .mem
            .read()
            .map_err(|_| anyhow::anyhow!("memory lock poisoned"))?
            .read_u64(pc)?;
        Ok(decode(word)?)
    }

    fn decode(&mut self, now: Cycle) {
        let Some(rsp) = self.icache_rsp.peek(now) else {
            return;
        };
        let Some(&id) = self.base.state.inflight_fetch.get(&rsp.tag) else {
            warn!("core {}: icache response with unknown tag {}", self.id, rsp.tag);
            self.icache_rsp.pop(now);
            return;
        };
        let (wid, pc) = {
            let trace = &self.base.state.traces[id];
            (trace.wid, trace.pc)
        };
        if self.base.state.ibuffers[wid].len() >= self.base.config.ibuffer_size {
            self.perf.ibuffer_stalls.inc();
            return;
        }
        self.icache_rsp.pop(now);
        self.base.state.inflight_fetch.remove(&rsp.tag);

        let instr = self.fetch_word(pc).unwrap_or_else(|err| {
            error!("core {}: warp {} cannot decode pc {:#x}: {:#}", self.id, wid, pc, err);
            Instr::Halt
        });

        let state = &mut self.base.state;
        let trace = &mut state.traces[id];
        trace.instr = Some(instr);
        if let Instr::Load { base, stride, .. } | Instr::Store { base, stride, .. } = instr {
            let addrs: Vec<u64> = trace
                .active_threads()
                .map(|t| base as u64 + t as u64 * stride as u64)
                .collect();
            trace.mem_addrs.extend(addrs);
        }
        self.perf.ifetch_lat.add(now - trace.fetch_cycle);

        let warp = &mut state.warps[wid];
        warp.fetch_pending = false;
        if instr.is_warp_control() {
            warp.control_pending = true;
        }
        state.ibuffers[wid].push_back(id);
    }

    fn schedule(&mut self, now: Cycle) {
        if self.icache_req.full() {
            return;
        }
        let ibuffer_size = self.base.config.ibuffer_size;
        let state = &mut self.base.state;
        let eligible: Vec<bool> = state
            .warps
            .iter()
            .zip(&state.ibuffers)
            .map(|(warp, ibuf)| warp.can_fetch() && ibuf.len() < ibuffer_size)
            .collect();

        let Some(wid) = state.scheduler.select(&eligible) else {
            let ibuffer_full = state
                .warps
                .iter()
                .zip(&state.ibuffers)
                .any(|(warp, ibuf)| warp.can_fetch() && ibuf.len() >= ibuffer_size);
            if ibuffer_full {
                self.perf.ibuffer_stalls.inc();
            }
            return;
        };

        let uid = state.next_uid;
        state.next_uid += 1;
        let warp = &mut state.warps[wid];
        let pc = warp.pc;
        let id = state
            .traces
            .insert(PipelineTrace::new(uid, wid, pc, warp.tmask, now));
        if self
            .icache_req
            .try_push(now, MemReq::read(pc, uid, INSTR_BYTES as u32))
            .is_err()
        {
            state.traces.remove(id);
            return;
        }
        warp.fetch_pending = true;
        warp.pc += INSTR_BYTES;
        state.inflight_fetch.insert(uid, id);
        self.perf.ifetches.inc();
        trace!("core {}: fetch warp {} pc {:#x} uid {}", self.id, wid, pc, uid);
    }
}

fn branch_target(pc: u64, offset: i32) -> u64 {
    pc.wrapping_add_signed(offset as i64 * INSTR_BYTES as i64)
}

module!(Core, CoreState, CoreConfig,);

impl ModuleBehaviors for Core {
    fn tick_one(&mut self) {
        let now = self.now();
        if !self.is_done() {
            self.perf.cycles.inc();
        }
        self.commit(now);
        self.execute(now);
        self.issue(now);
        self.decode(now);
        self.schedule(now);
        self.base.advance();
    }

    fn reset(&mut self) {
        self.base.state = CoreState::new(&self.arch, &self.base.config);
        self.base.cycle = 0;
        self.alu.reset();
        self.fpu.reset();
        self.lsu.reset();
        self.sfu.reset();
        self.icache_rsp.clear();
        self.commit.iter_mut().flatten().for_each(Port::clear);
    }
}
