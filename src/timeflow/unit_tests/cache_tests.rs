use std::sync::Arc;

use crate::base::behavior::*;
use crate::base::module::IsModule;
use crate::base::port::{link, InputPort, OutputPort, Port};
use crate::sim::perf::CacheCounters;
use crate::timeflow::gmem::{CacheConfig, CacheSim, MemReq, MemRsp};

struct Harness {
    cache: CacheSim,
    reqs: Vec<Port<OutputPort, MemReq>>,
    rsps: Vec<Port<InputPort, MemRsp>>,
    mem_in: Port<InputPort, MemReq>,
    mem_out: Port<OutputPort, MemRsp>,
    perf: Arc<CacheCounters>,
}

fn harness(config: CacheConfig, ports: usize) -> Harness {
    let perf = Arc::new(CacheCounters::default());
    let mut cache = CacheSim::new("l1", Arc::new(config), ports, Arc::clone(&perf));
    let mut reqs: Vec<_> = (0..ports).map(|_| Port::new()).collect();
    let mut rsps: Vec<_> = (0..ports).map(|_| Port::new()).collect();
    for i in 0..ports {
        link(&mut cache.core_req[i], &mut reqs[i], 4);
        link(&mut rsps[i], &mut cache.core_rsp[i], 4);
    }
    let mut mem_in = Port::new();
    let mut mem_out = Port::new();
    link(&mut mem_in, &mut cache.mem_req, 4);
    link(&mut cache.mem_rsp, &mut mem_out, 4);
    Harness {
        cache,
        reqs,
        rsps,
        mem_in,
        mem_out,
        perf,
    }
}

#[test]
fn misses_to_one_line_share_a_single_fill() {
    let config = CacheConfig {
        ports_per_bank: 4,
        ..CacheConfig::dcache()
    };
    let mut h = harness(config, 4);
    for port in 0..4 {
        h.reqs[port]
            .try_push(0, MemReq::read(0x1000 + port as u64 * 4, port as u64, 4))
            .unwrap();
    }

    let mut fills = Vec::new();
    let mut responses = Vec::new();
    for _ in 0..40 {
        let now = h.cache.now();
        while let Some(req) = h.mem_in.pop(now) {
            fills.push(req);
        }
        if now == 10 {
            assert_eq!(h.cache.mshr_occupancy(), 1);
            h.mem_out.try_push(now, MemRsp::for_request(&fills[0])).unwrap();
        }
        for (port, rsp) in h.rsps.iter_mut().enumerate() {
            while let Some(r) = rsp.pop(now) {
                responses.push((now, port, r.tag));
            }
        }
        h.cache.tick_one();
    }

    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].addr, 0x1000);
    assert_eq!(responses.len(), 4);
    let first = responses[0].0;
    assert!(responses.iter().all(|(cycle, _, _)| *cycle == first));
    assert!(responses.iter().all(|(_, port, tag)| *port as u64 == *tag));
    assert_eq!(h.perf.read_misses.get(), 4);
    assert_eq!(h.cache.mshr_occupancy(), 0);
    assert!(h.cache.is_idle());
}

#[test]
fn filled_line_hits() {
    let mut h = harness(CacheConfig::dcache(), 1);
    h.reqs[0].try_push(0, MemReq::read(0x40, 1, 4)).unwrap();
    let mut hit_sent = false;
    let mut responses = 0;
    for _ in 0..40 {
        let now = h.cache.now();
        if let Some(req) = h.mem_in.pop(now) {
            h.mem_out.try_push(now, MemRsp::for_request(&req)).unwrap();
        }
        while h.rsps[0].pop(now).is_some() {
            responses += 1;
            if !hit_sent {
                h.reqs[0].try_push(now, MemReq::read(0x44, 2, 4)).unwrap();
                hit_sent = true;
            }
        }
        h.cache.tick_one();
    }
    assert_eq!(responses, 2);
    assert_eq!(h.perf.reads.get(), 2);
    assert_eq!(h.perf.read_misses.get(), 1);
}

#[test]
fn same_bank_requests_stall() {
    let config = CacheConfig {
        num_banks: 4,
        ports_per_bank: 1,
        ..CacheConfig::dcache()
    };
    let mut h = harness(config, 2);
    // lines 0 and 4 both map to bank 0
    h.reqs[0].try_push(0, MemReq::read(0x000, 0, 4)).unwrap();
    h.reqs[1].try_push(0, MemReq::read(0x100, 1, 4)).unwrap();
    for _ in 0..4 {
        h.cache.tick_one();
    }
    assert_eq!(h.perf.bank_stalls.get(), 1);
    assert_eq!(h.perf.reads.get(), 2);
}

#[test]
fn different_banks_proceed_together() {
    let mut h = harness(CacheConfig::dcache(), 2);
    h.reqs[0].try_push(0, MemReq::read(0x000, 0, 4)).unwrap();
    h.reqs[1].try_push(0, MemReq::read(0x040, 1, 4)).unwrap();
    h.cache.tick_one();
    h.cache.tick_one();
    assert_eq!(h.perf.bank_stalls.get(), 0);
    assert_eq!(h.perf.reads.get(), 2);
    assert_eq!(h.cache.mshr_occupancy(), 2);
}

#[test]
fn write_through_forwards_stores() {
    let mut h = harness(CacheConfig::dcache(), 1);
    h.reqs[0].try_push(0, MemReq::write(0x80, 7, 4)).unwrap();
    let mut forwarded = Vec::new();
    for _ in 0..6 {
        let now = h.cache.now();
        while let Some(req) = h.mem_in.pop(now) {
            forwarded.push(req);
        }
        h.cache.tick_one();
    }
    assert_eq!(forwarded, vec![MemReq::write(0x80, 7, 4)]);
    assert_eq!(h.perf.write_misses.get(), 1);
    assert_eq!(h.rsps[0].occupancy(), 0);
}

#[test]
fn full_mshr_holds_a_miss_until_the_fill_returns() {
    let config = CacheConfig {
        num_banks: 4,
        ports_per_bank: 2,
        mshr_size: 1,
        ..CacheConfig::dcache()
    };
    let mut h = harness(config, 2);
    // lines 0 and 4 both map to bank 0
    h.reqs[0].try_push(0, MemReq::read(0x000, 0, 4)).unwrap();
    h.reqs[1].try_push(0, MemReq::read(0x100, 1, 4)).unwrap();

    const FIRST_FILL_AT: u64 = 10;
    let mut fills = Vec::new();
    let mut responses = Vec::new();
    for _ in 0..60 {
        let now = h.cache.now();
        while let Some(req) = h.mem_in.pop(now) {
            if now > FIRST_FILL_AT {
                h.mem_out.try_push(now, MemRsp::for_request(&req)).unwrap();
            }
            fills.push((now, req));
        }
        if now == FIRST_FILL_AT {
            assert_eq!(fills.len(), 1);
            assert_eq!(h.cache.mshr_occupancy(), 1);
            assert!(h.perf.mshr_stalls.get() > 0);
            assert_eq!(h.perf.bank_stalls.get(), 0);
            h.mem_out.try_push(now, MemRsp::for_request(&fills[0].1)).unwrap();
        }
        for rsp in h.rsps.iter_mut() {
            while let Some(r) = rsp.pop(now) {
                responses.push(r.tag);
            }
        }
        h.cache.tick_one();
    }

    assert_eq!(fills.len(), 2);
    assert!(fills[1].0 > FIRST_FILL_AT);
    assert_ne!(fills[0].1.addr, fills[1].1.addr);
    responses.sort_unstable();
    assert_eq!(responses, vec![0, 1]);
    assert_eq!(h.perf.read_misses.get(), 2);
    assert!(h.cache.is_idle());
}
