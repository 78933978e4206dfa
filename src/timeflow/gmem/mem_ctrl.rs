use std::sync::Arc;

use log::trace;

use super::request::{MemReq, MemRsp};
use crate::base::behavior::*;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::base::port::{InputPort, OutputPort, Port};
use crate::sim::config::MemConfig;
use crate::sim::perf::MemCounters;
use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

#[derive(Debug)]
struct Inflight {
    port: usize,
    req: MemReq,
}

#[derive(Debug)]
pub struct MemCtrlState {
    server: TimedServer<Inflight>,
    rr_start: usize,
}

impl MemCtrlState {
    fn new(config: &MemConfig) -> Self {
        Self {
            server: TimedServer::new(ServerConfig {
                base_latency: config.latency,
                bytes_per_cycle: config.bytes_per_cycle,
                queue_capacity: config.depth,
            }),
            rr_start: 0,
        }
    }
}

/// Terminal memory model: a pipelined server with fixed latency and at most `depth` requests in
/// flight. Reads are answered on the port they arrived on; writes retire silently.
pub struct MemController {
    base: ModuleBase<MemCtrlState, MemConfig>,
    pub req: Vec<Port<InputPort, MemReq>>,
    pub rsp: Vec<Port<OutputPort, MemRsp>>,
    perf: Arc<MemCounters>,
}

impl MemController {
    pub fn new(config: Arc<MemConfig>, num_ports: usize, perf: Arc<MemCounters>) -> Self {
        assert!(num_ports > 0, "memory controller needs at least one port");
        assert!(config.depth > 0, "memory depth must be > 0");
        Self {
            base: ModuleBase::new(MemCtrlState::new(&config), config),
            req: (0..num_ports).map(|_| Port::new()).collect(),
            rsp: (0..num_ports).map(|_| Port::new()).collect(),
            perf,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.base.state.server.outstanding()
    }

    pub fn is_idle(&self) -> bool {
        self.base.state.server.is_empty() && self.req.iter().all(|p| p.occupancy() == 0)
    }

    fn complete(&mut self, now: Cycle) {
        let server = &mut self.base.state.server;
        while let Some(head) = server.peek_ready(now) {
            let port = head.port;
            if !head.req.write && self.rsp[port].full() {
                break;
            }
            let Some(done) = server.pop_ready(now) else {
                break;
            };
            if done.payload.req.write {
                continue;
            }
            // time outstanding includes any cycles spent waiting on a full response port
            self.perf.lat.add(now - done.ticket.issued_at());
            self.rsp[port]
                .try_push(now, MemRsp::for_request(&done.payload.req))
                .expect("response port checked for room");
        }
    }

    fn accept(&mut self, now: Cycle) {
        let num_ports = self.req.len();
        let start = self.base.state.rr_start;
        for k in 0..num_ports {
            let port = (start + k) % num_ports;
            if !self.base.state.server.can_accept(now) {
                break;
            }
            let Some(req) = self.req[port].peek(now) else {
                continue;
            };
            let request = ServiceRequest::new(Inflight { port, req }, req.size);
            if self.base.state.server.try_enqueue(now, request).is_err() {
                break;
            }
            self.req[port].pop(now);
            trace!("mem: accepted {:?} from port {} at {}", req, port, now);
            if req.write {
                self.perf.writes.inc();
            } else {
                self.perf.reads.inc();
            }
        }
        self.base.state.rr_start = (start + 1) % num_ports;
    }
}

module!(MemController, MemCtrlState, MemConfig,);

impl ModuleBehaviors for MemController {
    fn tick_one(&mut self) {
        let now = self.now();
        self.complete(now);
        self.accept(now);
        self.base.advance();
    }

    fn reset(&mut self) {
        self.base.state = MemCtrlState::new(&self.base.config);
        self.base.cycle = 0;
        self.req.iter_mut().for_each(Port::clear);
    }
}
