use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace};

use crate::base::port::{InputPort, OutputPort, Port};
use crate::sim::dcrs::{Dcrs, DCR_ROP_CBUF_WRITEMASK, DCR_ROP_DEPTH_WRITEMASK, DCR_TEX_FILTER};
use crate::sim::perf::{CoreGfxCounters, GfxCounters};
use crate::timeflow::config::{CoreConfig, GfxConfig, GfxUnitConfig};
use crate::timeflow::exe_unit::ExeUnit;
use crate::timeflow::isa::{ExeType, GfxKind, Instr};
use crate::timeflow::trace::{TraceArena, TraceId};
use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

#[derive(Debug, Clone, Copy)]
struct GfxJob {
    lane: usize,
    trace: TraceId,
}

/// Pool of identical fixed-function sub-units of one kind. The unit state programmed through
/// the DCRs is captured when the pool is built.
#[derive(Debug)]
pub struct GfxUnit {
    kind: GfxKind,
    units: Vec<TimedServer<GfxJob>>,
    next_unit: usize,
    /// Memory reads one request performs.
    reads_per_req: u64,
    /// Memory writes one request performs.
    writes_per_req: u64,
    counters: Arc<GfxCounters>,
}

impl GfxUnit {
    pub fn new(kind: GfxKind, config: &GfxUnitConfig, dcrs: &Dcrs, counters: Arc<GfxCounters>) -> Self {
        assert!(config.num_units > 0, "{kind:?} pool needs at least one unit");
        // unprogrammed states fall back to the hardware reset values
        let (reads_per_req, writes_per_req) = match kind {
            // bilinear filtering fetches a 2x2 texel footprint
            GfxKind::Tex => match dcrs.tex.read_stage(0, DCR_TEX_FILTER) {
                Ok(1) => (4, 0),
                _ => (1, 0),
            },
            GfxKind::Raster => (1, 0),
            GfxKind::Rop => {
                let color = dcrs.rop.read(DCR_ROP_CBUF_WRITEMASK).unwrap_or(0xf) != 0;
                let depth = dcrs.rop.read(DCR_ROP_DEPTH_WRITEMASK).unwrap_or(1) != 0;
                (1, color as u64 + depth as u64)
            }
        };
        debug!(
            "{:?} pool: {} units, {} reads / {} writes per request",
            kind, config.num_units, reads_per_req, writes_per_req
        );
        Self {
            kind,
            units: (0..config.num_units)
                .map(|_| TimedServer::new(ServerConfig::pipelined(config.latency, config.queue_depth)))
                .collect(),
            next_unit: 0,
            reads_per_req,
            writes_per_req,
            counters,
        }
    }

    pub fn kind(&self) -> GfxKind {
        self.kind
    }

    fn submit(&mut self, now: Cycle, lane: usize, trace: TraceId) -> bool {
        let n = self.units.len();
        for k in 0..n {
            let idx = (self.next_unit + k) % n;
            let job = ServiceRequest::new(GfxJob { lane, trace }, 0);
            if self.units[idx].try_enqueue(now, job).is_ok() {
                self.next_unit = (idx + 1) % n;
                self.counters.reads.add(self.reads_per_req);
                self.counters.writes.add(self.writes_per_req);
                return true;
            }
        }
        self.counters.stalls.inc();
        false
    }

    /// Pop at most one finished job per sub-unit whose lane has room in `ready`.
    fn poll(&mut self, now: Cycle, ready: &mut [VecDeque<TraceId>], room: usize) {
        for unit in self.units.iter_mut() {
            let Some(job) = unit.peek_ready(now) else {
                continue;
            };
            if ready[job.lane].len() >= room {
                continue;
            }
            if let Some(done) = unit.pop_ready(now) {
                self.counters.lat.add(now - done.ticket.issued_at());
                ready[done.payload.lane].push_back(done.payload.trace);
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.units.iter().all(TimedServer::is_empty)
    }

    fn reset(&mut self) {
        self.units.iter_mut().for_each(TimedServer::clear);
        self.next_unit = 0;
    }
}

/// Special-function unit: warp-control instructions run through a fixed-latency pipeline per
/// lane, graphics instructions are handed to the texture, raster and render-output pools.
/// Completions are polled round-robin across sources, so they may leave out of issue order.
pub struct SfuUnit {
    inputs: Vec<Port<InputPort, TraceId>>,
    outputs: Vec<Port<OutputPort, TraceId>>,
    control: Vec<TimedServer<TraceId>>,
    gfx: [GfxUnit; 3],
    ready: Vec<VecDeque<TraceId>>,
    poll_idx: usize,
    ready_depth: usize,
}

impl SfuUnit {
    pub fn new(config: &CoreConfig, gfx: &GfxConfig, dcrs: &Dcrs, counters: CoreGfxCounters) -> Self {
        let lanes = config.issue_width;
        Self {
            inputs: (0..lanes).map(|_| Port::new()).collect(),
            outputs: (0..lanes).map(|_| Port::new()).collect(),
            control: (0..lanes)
                .map(|_| {
                    TimedServer::new(ServerConfig::pipelined(
                        config.sfu_latency,
                        config.pipeline_depth,
                    ))
                })
                .collect(),
            gfx: [
                GfxUnit::new(GfxKind::Tex, &gfx.tex, dcrs, counters.tex),
                GfxUnit::new(GfxKind::Raster, &gfx.raster, dcrs, counters.raster),
                GfxUnit::new(GfxKind::Rop, &gfx.rop, dcrs, counters.rop),
            ],
            ready: vec![VecDeque::new(); lanes],
            poll_idx: 0,
            ready_depth: config.port_capacity.max(1),
        }
    }

    fn pool(&mut self, kind: GfxKind) -> &mut GfxUnit {
        &mut self.gfx[kind as usize]
    }

    fn poll_control(&mut self, now: Cycle) {
        for (lane, pipe) in self.control.iter_mut().enumerate() {
            if self.ready[lane].len() >= self.ready_depth {
                continue;
            }
            if let Some(done) = pipe.pop_ready(now) {
                self.ready[lane].push_back(done.payload);
            }
        }
    }

    /// Sources take turns at the ready queues: the control pipelines, then each pool.
    fn poll(&mut self, now: Cycle) {
        let sources = 1 + self.gfx.len();
        for k in 0..sources {
            match (self.poll_idx + k) % sources {
                0 => self.poll_control(now),
                i => self.gfx[i - 1].poll(now, &mut self.ready, self.ready_depth),
            }
        }
        self.poll_idx = (self.poll_idx + 1) % sources;
    }

    fn accept(&mut self, now: Cycle, traces: &TraceArena) {
        for lane in 0..self.inputs.len() {
            let Some(id) = self.inputs[lane].peek(now) else {
                continue;
            };
            let accepted = match *traces[id].instr() {
                Instr::Gfx { kind, .. } => self.pool(kind).submit(now, lane, id),
                ref instr if instr.is_warp_control() => self.control[lane]
                    .try_enqueue(now, ServiceRequest::new(id, 0))
                    .is_ok(),
                ref other => panic!("sfu received {other:?}"),
            };
            if accepted {
                trace!("sfu: lane {} accepted uid {}", lane, traces[id].uid);
                self.inputs[lane].pop(now);
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

impl ExeUnit for SfuUnit {
    fn exe_type(&self) -> ExeType {
        ExeType::Sfu
    }

    fn tick(&mut self, now: Cycle, traces: &mut TraceArena) {
        self.poll(now);
        self.forward(now);
        self.accept(now, traces);
    }

    fn reset(&mut self) {
        self.control.iter_mut().for_each(TimedServer::clear);
        self.gfx.iter_mut().for_each(GfxUnit::reset);
        self.ready.iter_mut().for_each(VecDeque::clear);
        self.inputs.iter_mut().for_each(Port::clear);
        self.poll_idx = 0;
    }

    fn inputs_mut(&mut self) -> &mut [Port<InputPort, TraceId>] {
        &mut self.inputs
    }

    fn outputs_mut(&mut self) -> &mut [Port<OutputPort, TraceId>] {
        &mut self.outputs
    }

    fn is_idle(&self) -> bool {
        self.control.iter().all(TimedServer::is_empty)
            && self.gfx.iter().all(GfxUnit::is_idle)
            && self.ready.iter().all(VecDeque::is_empty)
            && self.inputs.iter().all(|p| p.occupancy() == 0)
    }
}
