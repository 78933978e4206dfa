use std::sync::Arc;

use log::trace;

use crate::base::behavior::*;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::base::port::{InputPort, OutputPort, Port};
use crate::sim::perf::CacheCounters;
use crate::timeflow::gmem::{MemReq, MemRsp, SmemConfig};
use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

#[derive(Debug)]
pub struct SmemState {
    rsp_queues: Vec<TimedServer<MemRsp>>,
    rr_start: usize,
}

impl SmemState {
    fn new(config: &SmemConfig, num_ports: usize) -> Self {
        let depth = (config.latency as usize + 1).max(config.port_capacity);
        Self {
            rsp_queues: (0..num_ports)
                .map(|_| TimedServer::new(ServerConfig::pipelined(config.latency, depth)))
                .collect(),
            rr_start: 0,
        }
    }
}

/// Banked scratchpad local to one core. There are no tags: every access hits, and the only
/// contention is one access per bank per cycle. Word-interleaved banks.
pub struct SharedMem {
    base: ModuleBase<SmemState, SmemConfig>,
    pub req: Vec<Port<InputPort, MemReq>>,
    pub rsp: Vec<Port<OutputPort, MemRsp>>,
    perf: Arc<CacheCounters>,
}

impl SharedMem {
    pub fn new(config: Arc<SmemConfig>, num_ports: usize, perf: Arc<CacheCounters>) -> Self {
        assert!(config.num_banks > 0, "smem needs at least one bank");
        assert!(config.word_size > 0, "smem word_size must be > 0");
        Self {
            base: ModuleBase::new(SmemState::new(&config, num_ports), config),
            req: (0..num_ports).map(|_| Port::new()).collect(),
            rsp: (0..num_ports).map(|_| Port::new()).collect(),
            perf,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.base.state.rsp_queues.iter().all(TimedServer::is_empty)
            && self.req.iter().all(|p| p.occupancy() == 0)
    }

    fn drain(&mut self, now: Cycle) {
        for (queue, port) in self.base.state.rsp_queues.iter_mut().zip(self.rsp.iter_mut()) {
            while queue.peek_ready(now).is_some() && !port.full() {
                if let Some(done) = queue.pop_ready(now) {
                    port
                        .try_push(now, done.payload)
                        .expect("response port checked for room");
                }
            }
        }
    }

    fn serve(&mut self, now: Cycle) {
        let config = *self.base.config;
        let num_ports = self.req.len();
        let start = self.base.state.rr_start;
        let mut bank_busy = vec![false; config.num_banks];

        for k in 0..num_ports {
            let port = (start + k) % num_ports;
            let Some(req) = self.req[port].peek(now) else {
                continue;
            };
            let bank = config.bank_for(req.addr);
            if bank_busy[bank] {
                trace!("smem: bank {} conflict on port {}", bank, port);
                self.perf.bank_stalls.inc();
                continue;
            }
            if req.write {
                self.perf.writes.inc();
            } else {
                let queue = &mut self.base.state.rsp_queues[port];
                if queue
                    .try_enqueue(now, ServiceRequest::new(MemRsp::for_request(&req), 0))
                    .is_err()
                {
                    continue;
                }
                self.perf.reads.inc();
            }
            bank_busy[bank] = true;
            self.req[port].pop(now);
        }
        if num_ports > 0 {
            self.base.state.rr_start = (start + 1) % num_ports;
        }
    }
}

module!(SharedMem, SmemState, SmemConfig,);

impl ModuleBehaviors for SharedMem {
    fn tick_one(&mut self) {
        let now = self.now();
        self.drain(now);
        self.serve(now);
        self.base.advance();
    }

    fn reset(&mut self) {
        let num_ports = self.req.len();
        self.base.state = SmemState::new(&self.base.config, num_ports);
        self.base.cycle = 0;
        self.req.iter_mut().for_each(Port::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::port::link;

    fn harness(ports: usize) -> (SharedMem, Vec<Port<OutputPort, MemReq>>, Vec<Port<InputPort, MemRsp>>) {
        let mut smem = SharedMem::new(
            Arc::new(SmemConfig::default()),
            ports,
            Arc::new(CacheCounters::default()),
        );
        let mut reqs: Vec<_> = (0..ports).map(|_| Port::new()).collect();
        let mut rsps: Vec<_> = (0..ports).map(|_| Port::new()).collect();
        for i in 0..ports {
            link(&mut smem.req[i], &mut reqs[i], 4);
            link(&mut rsps[i], &mut smem.rsp[i], 4);
        }
        (smem, reqs, rsps)
    }

    #[test]
    fn same_bank_accesses_serialize() {
        let (mut smem, mut reqs, _rsps) = harness(2);
        let base = SmemConfig::default().base_addr;
        // 4 banks of 4-byte words: both addresses land in bank 0
        reqs[0].try_push(0, MemReq::read(base, 0, 4)).unwrap();
        reqs[1].try_push(0, MemReq::read(base + 16, 1, 4)).unwrap();
        smem.tick_one();
        smem.tick_one();
        assert_eq!(smem.perf.bank_stalls.get(), 1);
        assert_eq!(smem.perf.reads.get(), 1);
        smem.tick_one();
        assert_eq!(smem.perf.reads.get(), 2);
    }

    #[test]
    fn reads_answer_with_their_tag() {
        let (mut smem, mut reqs, mut rsps) = harness(1);
        let base = SmemConfig::default().base_addr;
        reqs[0].try_push(0, MemReq::read(base + 8, 42, 4)).unwrap();
        reqs[0].try_push(0, MemReq::write(base + 12, 43, 4)).unwrap();
        let mut seen = Vec::new();
        for _ in 0..6 {
            smem.tick_one();
            let now = smem.now();
            while let Some(rsp) = rsps[0].pop(now) {
                seen.push(rsp.tag);
            }
        }
        assert_eq!(seen, vec![42]);
        assert_eq!(smem.perf.writes.get(), 1);
        assert!(smem.is_idle());
    }
}
