/*
Time-queue for the timing model.

Every fixed-latency resource in the simulator (ALU/FPU pipelines, the warp-control pipeline, cache
data pipelines, graphics sub-units and the memory controller) is wrapped by a TimedServer which
enforces a service law:
    - a base latency that overlaps between requests (the server is pipelined)
    - a throughput component expressed in bytes-per-cycle that serializes request starts
    - a bound on the number of requests in flight

When the server cannot accept more work it hands the request back inside a Backpressure so the
caller can keep it and re-propose it on a later cycle. Accepted requests yield a `Ticket`
describing when the payload becomes visible again.
*/

use std::collections::VecDeque;

use serde::Deserialize;

pub type Cycle = u64;

// Result of queueing a request with a timed server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
    size_bytes: u32,
}

impl Ticket {
    fn new(issued_at: Cycle, ready_at: Cycle, size_bytes: u32) -> Self {
        Self {
            issued_at,
            ready_at,
            size_bytes,
        }
    }

    // Cycle at which the request entered the server.
    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    // Cycle at which the server makes the payload available to downstream consumers.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }

    // Cycles until the ticket is ready, zero if already ready.
    pub fn remaining_cycles(&self, now: Cycle) -> Cycle {
        self.ready_at.saturating_sub(now)
    }

    // Cycles spent between entering the server and becoming ready.
    pub fn latency(&self) -> Cycle {
        self.ready_at - self.issued_at
    }
}

#[derive(Debug)]
pub struct ServiceRequest<T> {
    pub payload: T,
    pub size_bytes: u32,
}

impl<T> ServiceRequest<T> {
    pub fn new(payload: T, size_bytes: u32) -> Self {
        Self { payload, size_bytes }
    }
}

#[derive(Debug)]
pub struct ServiceResult<T> {
    pub payload: T,
    pub ticket: Ticket,
}

// Reasons why the server rejected a request
#[derive(Debug)]
pub enum Backpressure<T> {
    // Too many requests in flight
    QueueFull { request: ServiceRequest<T>, capacity: usize },
    // The throughput slot is taken until `available_at`
    Busy { request: ServiceRequest<T>, available_at: Cycle },
}

impl<T> Backpressure<T> {
    // Recover the underlying request so it can be retried later.
    pub fn into_request(self) -> ServiceRequest<T> {
        match self {
            Backpressure::QueueFull { request, .. } => request,
            Backpressure::Busy { request, .. } => request,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    // Fixed latency added to every request
    pub base_latency: Cycle,
    // Throughput; a request of `size_bytes` occupies the server for ceil(size/bpc) cycles
    pub bytes_per_cycle: u32,
    // Maximum number of outstanding requests the server will accept
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 1,
            bytes_per_cycle: 1,
            queue_capacity: 1,
        }
    }
}

impl ServerConfig {
    pub fn pipelined(base_latency: Cycle, queue_capacity: usize) -> Self {
        Self {
            base_latency,
            bytes_per_cycle: 1,
            queue_capacity,
        }
    }
}

#[derive(Debug)]
struct Inflight<T> {
    payload: T,
    ticket: Ticket,
}

// Single-lane server that enforces the configured latency/bandwidth budget and keeps track of
// outstanding work using a FIFO. Tickets are issued with non-decreasing ready cycles, so the
// FIFO head is always the first request to complete.
#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<Inflight<T>>,
    busy_until: Cycle,
    last_ready: Cycle,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        assert!(config.queue_capacity > 0, "queue_capacity must be > 0");
        Self {
            config,
            inflight: VecDeque::with_capacity(config.queue_capacity),
            busy_until: 0,
            last_ready: 0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn can_accept(&self, now: Cycle) -> bool {
        self.inflight.len() < self.config.queue_capacity && self.busy_until <= now
    }

    // Attempt to enqueue a request at the provided cycle.
    // Returns a Ticket on success or a Backpressure describing why the request could not be accepted.
    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        request: ServiceRequest<T>,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.inflight.len() >= self.config.queue_capacity {
            return Err(Backpressure::QueueFull {
                request,
                capacity: self.config.queue_capacity,
            });
        }

        if self.busy_until > now {
            return Err(Backpressure::Busy {
                request,
                available_at: self.busy_until,
            });
        }

        let service_cycles =
            ceil_div_u64(request.size_bytes as u64, self.config.bytes_per_cycle as u64);
        self.busy_until = now.saturating_add(service_cycles);

        let ready_at = now
            .saturating_add(service_cycles)
            .saturating_add(self.config.base_latency)
            .max(self.last_ready);
        self.last_ready = ready_at;

        let ticket = Ticket::new(now, ready_at, request.size_bytes);
        self.inflight.push_back(Inflight {
            payload: request.payload,
            ticket,
        });

        Ok(ticket)
    }

    pub fn peek_ready(&self, now: Cycle) -> Option<&T> {
        self.inflight
            .front()
            .filter(|inflight| inflight.ticket.is_ready(now))
            .map(|inflight| &inflight.payload)
    }

    pub fn pop_ready(&mut self, now: Cycle) -> Option<ServiceResult<T>> {
        if !self.inflight.front()?.ticket.is_ready(now) {
            return None;
        }
        self.inflight.pop_front().map(|inflight| ServiceResult {
            payload: inflight.payload,
            ticket: inflight.ticket,
        })
    }

    // Drain any requests that have completed by "now" and invoke the supplied callback with the
    // results.
    pub fn service_ready<F>(&mut self, now: Cycle, mut callback: F)
    where
        F: FnMut(ServiceResult<T>),
    {
        while let Some(result) = self.pop_ready(now) {
            callback(result);
        }
    }

    // Returns the earliest cycle at which a new request could begin service.
    pub fn available_at(&self) -> Cycle {
        self.busy_until
    }

    pub fn oldest_ticket(&self) -> Option<&Ticket> {
        self.inflight.front().map(|inflight| &inflight.ticket)
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn clear(&mut self) {
        self.inflight.clear();
        self.busy_until = 0;
        self.last_ready = 0;
    }
}

fn ceil_div_u64(nom: u64, denom: u64) -> Cycle {
    debug_assert!(denom > 0);
    nom.div_ceil(denom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipelined_requests_overlap_latency() {
        let mut server = TimedServer::new(ServerConfig::pipelined(4, 8));
        let t0 = server.try_enqueue(0, ServiceRequest::new("a", 0)).unwrap();
        let t1 = server.try_enqueue(0, ServiceRequest::new("b", 0)).unwrap();
        assert_eq!(t0.ready_at(), 4);
        assert_eq!(t1.ready_at(), 4);

        assert!(server.pop_ready(3).is_none());
        assert_eq!(server.pop_ready(4).unwrap().payload, "a");
        assert_eq!(server.pop_ready(4).unwrap().payload, "b");
        assert!(server.is_empty());
    }

    #[test]
    fn queue_capacity_applies_backpressure() {
        let mut server = TimedServer::new(ServerConfig::pipelined(2, 1));
        server.try_enqueue(0, ServiceRequest::new(1u32, 0)).unwrap();
        match server.try_enqueue(0, ServiceRequest::new(2u32, 0)) {
            Err(Backpressure::QueueFull { request, capacity }) => {
                assert_eq!(request.payload, 2);
                assert_eq!(capacity, 1);
            }
            other => panic!("expected queue full, got {other:?}"),
        }
    }

    #[test]
    fn throughput_serializes_starts() {
        let config = ServerConfig {
            base_latency: 1,
            bytes_per_cycle: 4,
            queue_capacity: 4,
        };
        let mut server = TimedServer::new(config);
        let ticket = server.try_enqueue(0, ServiceRequest::new((), 8)).unwrap();
        assert_eq!(ticket.ready_at(), 3);
        assert!(matches!(
            server.try_enqueue(1, ServiceRequest::new((), 8)),
            Err(Backpressure::Busy { available_at: 2, .. })
        ));
        let ticket = server.try_enqueue(2, ServiceRequest::new((), 8)).unwrap();
        assert_eq!(ticket.ready_at(), 5);
        assert_eq!(ticket.latency(), 3);
    }
}
