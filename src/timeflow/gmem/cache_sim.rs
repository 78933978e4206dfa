use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace, warn};

use super::cache::CacheTagArray;
use super::mshr::{MshrTable, MshrWaiter};
use super::policy::CacheConfig;
use super::request::{MemReq, MemRsp};
use crate::base::behavior::*;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::base::port::{InputPort, OutputPort, Port};
use crate::sim::perf::CacheCounters;
use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

#[derive(Debug)]
struct CacheBank {
    tags: CacheTagArray,
    mshr: MshrTable,
}

#[derive(Debug)]
pub struct CacheState {
    banks: Vec<CacheBank>,
    /// Data pipeline of each core-side port.
    rsp_queues: Vec<TimedServer<MemRsp>>,
    /// Dirty victims waiting for the memory-side port.
    writebacks: VecDeque<MemReq>,
    rr_start: usize,
}

impl CacheState {
    fn new(config: &CacheConfig, num_inputs: usize) -> Self {
        Self {
            banks: (0..config.num_banks)
                .map(|bank| CacheBank {
                    tags: CacheTagArray::new(
                        config.num_sets,
                        config.num_ways,
                        config.replacement,
                        config.seed ^ bank as u64,
                    ),
                    mshr: MshrTable::new(config.mshr_size),
                })
                .collect(),
            rsp_queues: (0..num_inputs)
                .map(|_| {
                    TimedServer::new(ServerConfig {
                        base_latency: config.latency,
                        bytes_per_cycle: 1,
                        queue_capacity: config.rsp_queue_size,
                    })
                })
                .collect(),
            writebacks: VecDeque::new(),
            rr_start: 0,
        }
    }
}

enum Access {
    Done,
    Stall,
}

/// Set-associative, banked, non-blocking cache.
///
/// Each core-side port carries requests from one client; responses to reads go back on the port
/// with the same index. Per cycle a bank starts at most `ports_per_bank` accesses; the rest stay
/// at the head of their port and count a bank stall. Misses allocate (or merge into) a
/// per-bank MSHR entry keyed by line address and send one fill request below. The fill releases
/// every merged request in the same cycle.
pub struct CacheSim {
    base: ModuleBase<CacheState, CacheConfig>,
    name: String,
    pub core_req: Vec<Port<InputPort, MemReq>>,
    pub core_rsp: Vec<Port<OutputPort, MemRsp>>,
    pub mem_req: Port<OutputPort, MemReq>,
    pub mem_rsp: Port<InputPort, MemRsp>,
    perf: Arc<CacheCounters>,
}

impl CacheSim {
    pub fn new(
        name: impl Into<String>,
        config: Arc<CacheConfig>,
        num_inputs: usize,
        perf: Arc<CacheCounters>,
    ) -> Self {
        config.ensure_valid();
        assert!(num_inputs > 0, "cache needs at least one core-side port");
        let state = CacheState::new(&config, num_inputs);
        Self {
            base: ModuleBase::new(state, config),
            name: name.into(),
            core_req: (0..num_inputs).map(|_| Port::new()).collect(),
            core_rsp: (0..num_inputs).map(|_| Port::new()).collect(),
            mem_req: Port::new(),
            mem_rsp: Port::new(),
            perf,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_inputs(&self) -> usize {
        self.core_req.len()
    }

    /// Outstanding fills across all banks.
    pub fn mshr_occupancy(&self) -> usize {
        self.base.state.banks.iter().map(|b| b.mshr.len()).sum()
    }

    pub fn is_idle(&self) -> bool {
        let state = &self.base.state;
        self.mshr_occupancy() == 0
            && state.rsp_queues.iter().all(TimedServer::is_empty)
            && state.writebacks.is_empty()
            && self.core_req.iter().all(|p| p.occupancy() == 0)
            && self.mem_rsp.occupancy() == 0
    }

    fn drain_responses(&mut self, now: Cycle) {
        let state = &mut self.base.state;
        for (queue, port) in state.rsp_queues.iter_mut().zip(self.core_rsp.iter_mut()) {
            while queue.peek_ready(now).is_some() && !port.full() {
                if let Some(result) = queue.pop_ready(now) {
                    port
                        .try_push(now, result.payload)
                        .expect("response port checked for room");
                }
            }
        }
    }

    fn drain_writebacks(&mut self, now: Cycle) {
        while let Some(req) = self.base.state.writebacks.pop_front() {
            if let Err(req) = self.mem_req.try_push(now, req) {
                self.base.state.writebacks.push_front(req);
                break;
            }
        }
    }

    /// Install at most one returning line per cycle and release its waiters together.
    fn process_fill(&mut self, now: Cycle) {
        let Some(rsp) = self.mem_rsp.peek(now) else {
            return;
        };
        let config = *self.base.config;
        let line = config.line_addr(rsp.tag);
        let bank_id = config.bank_for(line);
        let state = &mut self.base.state;

        let Some(waiters) = state.banks[bank_id].mshr.waiters(line) else {
            warn!("{}: fill for line {:#x} with no MSHR entry", self.name, rsp.tag);
            self.mem_rsp.pop(now);
            return;
        };

        // every waiter must fit into its response pipeline before the fill is accepted
        let mut needed = vec![0usize; state.rsp_queues.len()];
        for waiter in waiters.iter().filter(|w| !w.write) {
            needed[waiter.port] += 1;
        }
        let fits = needed.iter().zip(&state.rsp_queues).all(|(n, queue)| {
            queue.outstanding() + n <= queue.config().queue_capacity
        });
        if !fits || state.writebacks.len() >= config.mshr_size {
            trace!("{}: fill of line {:#x} stalled", self.name, rsp.tag);
            return;
        }
        self.mem_rsp.pop(now);

        let bank = &mut state.banks[bank_id];
        let Some(entry) = bank.mshr.release(line) else {
            return;
        };
        let set_key = config.bank_local(line);
        if let Some(eviction) = bank.tags.fill(set_key, line) {
            self.perf.evictions.inc();
            if eviction.dirty {
                let victim = eviction.line_addr * config.line_size as u64;
                state
                    .writebacks
                    .push_back(MemReq::write(victim, victim, config.line_size));
            }
        }

        debug!(
            "{}: fill line {:#x} after {} cycles, releasing {} requests",
            self.name,
            rsp.tag,
            now - entry.allocated_at(),
            entry.merged.len()
        );
        for waiter in entry.merged {
            if waiter.write {
                bank.tags.mark_dirty(set_key, line);
                continue;
            }
            let rsp = MemRsp {
                addr: waiter.addr,
                tag: waiter.tag,
            };
            state.rsp_queues[waiter.port]
                .try_enqueue(now, ServiceRequest::new(rsp, 0))
                .expect("response pipeline checked for room");
        }
    }

    fn access(&mut self, now: Cycle, port: usize, req: &MemReq, line: u64, bank_id: usize) -> Access {
        let config = *self.base.config;
        let set_key = config.bank_local(line);
        let line_base = line * config.line_size as u64;
        let state = &mut self.base.state;
        let bank = &mut state.banks[bank_id];
        let waiter = MshrWaiter {
            port,
            tag: req.tag,
            addr: req.addr,
            write: req.write,
        };

        if !req.write {
            if bank.tags.probe(set_key, line) {
                let queue = &mut state.rsp_queues[port];
                if !queue.can_accept(now) {
                    return Access::Stall;
                }
                queue
                    .try_enqueue(now, ServiceRequest::new(MemRsp::for_request(req), 0))
                    .expect("response pipeline checked for room");
                self.perf.reads.inc();
                return Access::Done;
            }
            if bank.mshr.merge(line, waiter) {
                self.perf.reads.inc();
                self.perf.read_misses.inc();
                return Access::Done;
            }
            if bank.mshr.is_full() {
                self.perf.mshr_stalls.inc();
                return Access::Stall;
            }
            if self.mem_req.full() {
                return Access::Stall;
            }
            bank.mshr
                .allocate(line, waiter, now)
                .expect("MSHR checked for room");
            self.mem_req
                .try_push(now, MemReq::read(line_base, line_base, config.line_size))
                .expect("memory port checked for room");
            self.perf.reads.inc();
            self.perf.read_misses.inc();
            return Access::Done;
        }

        if !config.write_back {
            if self.mem_req.full() {
                return Access::Stall;
            }
            if !bank.tags.probe(set_key, line) {
                self.perf.write_misses.inc();
            }
            self.perf.writes.inc();
            self.mem_req
                .try_push(now, *req)
                .expect("memory port checked for room");
            return Access::Done;
        }

        if bank.tags.probe(set_key, line) {
            bank.tags.mark_dirty(set_key, line);
            self.perf.writes.inc();
            return Access::Done;
        }
        if bank.mshr.merge(line, waiter) {
            self.perf.writes.inc();
            self.perf.write_misses.inc();
            return Access::Done;
        }
        if bank.mshr.is_full() {
            self.perf.mshr_stalls.inc();
            return Access::Stall;
        }
        if self.mem_req.full() {
            return Access::Stall;
        }
        bank.mshr
            .allocate(line, waiter, now)
            .expect("MSHR checked for room");
        self.mem_req
            .try_push(now, MemReq::read(line_base, line_base, config.line_size))
            .expect("memory port checked for room");
        self.perf.writes.inc();
        self.perf.write_misses.inc();
        Access::Done
    }

    fn process_requests(&mut self, now: Cycle) {
        let config = *self.base.config;
        let num_inputs = self.core_req.len();
        let mut bank_uses = vec![0usize; config.num_banks];
        let start = self.base.state.rr_start;

        for k in 0..num_inputs {
            let port = (start + k) % num_inputs;
            let Some(req) = self.core_req[port].peek(now) else {
                continue;
            };
            let line = config.line_addr(req.addr);
            let bank_id = config.bank_for(line);
            if bank_uses[bank_id] >= config.ports_per_bank {
                trace!("{}: bank {} conflict on port {}", self.name, bank_id, port);
                self.perf.bank_stalls.inc();
                continue;
            }
            if let Access::Done = self.access(now, port, &req, line, bank_id) {
                self.core_req[port].pop(now);
                bank_uses[bank_id] += 1;
            }
        }
        self.base.state.rr_start = (start + 1) % num_inputs;
    }
}

module!(CacheSim, CacheState, CacheConfig,);

impl ModuleBehaviors for CacheSim {
    fn tick_one(&mut self) {
        let now = self.now();
        self.drain_responses(now);
        self.drain_writebacks(now);
        self.process_fill(now);
        self.process_requests(now);
        self.base.advance();
    }

    fn reset(&mut self) {
        let num_inputs = self.core_req.len();
        self.base.state = CacheState::new(&self.base.config, num_inputs);
        self.base.cycle = 0;
        self.core_req.iter_mut().for_each(Port::clear);
        self.mem_rsp.clear();
    }
}
