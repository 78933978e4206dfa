use std::sync::Arc;

use log::info;

use crate::base::behavior::*;
use crate::base::port::{link, link_vec, InputPort, OutputPort, Port};
use crate::sim::perf::CacheCounters;
use crate::timeflow::gmem::{CacheConfig, CacheSim, MemReq, MemRsp};
use crate::timeflow::pipeline::{Core, CoreContext};
use crate::timeflow::smem::SharedMem;

/// Requester side of a memory link: where requests leave and responses come back.
pub type MemPorts<'a> = (
    &'a mut Port<OutputPort, MemReq>,
    &'a mut Port<InputPort, MemRsp>,
);

/// Attach `upper` to slot `idx` of a lower level's request/response port vectors.
pub fn connect(
    upper: MemPorts,
    req: &mut [Port<InputPort, MemReq>],
    rsp: &mut [Port<OutputPort, MemRsp>],
    idx: usize,
    capacity: usize,
) {
    let (up_req, up_rsp) = upper;
    link(&mut req[idx], up_req, capacity);
    link(up_rsp, &mut rsp[idx], capacity);
}

/// Build a cache level if it is enabled.
pub fn cache_level(
    name: String,
    config: &CacheConfig,
    num_inputs: usize,
    perf: Arc<CacheCounters>,
) -> Option<CacheSim> {
    config
        .enabled
        .then(|| CacheSim::new(name, Arc::new(*config), num_inputs, perf))
}

/// One core with its private memory side.
pub struct CoreTile {
    pub core: Core,
    pub icache: Option<CacheSim>,
    pub dcache: Option<CacheSim>,
    pub smem: SharedMem,
}

impl CoreTile {
    fn new(core_id: usize, ctx: &CoreContext) -> Self {
        let mut core = Core::new(core_id, ctx);
        let caches = ctx.caches;
        let mem = ctx.perf.core_mem(core_id);
        let num_threads = ctx.arch.num_threads();

        let mut icache = cache_level(format!("icache{core_id}"), &caches.icache, 1, mem.icache);
        if let Some(icache) = icache.as_mut() {
            connect(
                (&mut core.icache_req, &mut core.icache_rsp),
                &mut icache.core_req,
                &mut icache.core_rsp,
                0,
                caches.icache.port_capacity,
            );
        }

        let mut dcache = cache_level(
            format!("dcache{core_id}"),
            &caches.dcache,
            num_threads,
            mem.dcache,
        );
        if let Some(dcache) = dcache.as_mut() {
            link_vec(&mut dcache.core_req, &mut core.lsu.dcache_req, caches.dcache.port_capacity);
            link_vec(&mut core.lsu.dcache_rsp, &mut dcache.core_rsp, caches.dcache.port_capacity);
        }

        let mut smem = SharedMem::new(Arc::new(caches.smem), num_threads, mem.smem);
        link_vec(&mut smem.req, &mut core.lsu.smem_req, caches.smem.port_capacity);
        link_vec(&mut core.lsu.smem_rsp, &mut smem.rsp, caches.smem.port_capacity);

        Self {
            core,
            icache,
            dcache,
            smem,
        }
    }

    /// Ports facing the next level down: one per enabled L1, or the core's own ports where an
    /// L1 is disabled.
    pub fn mem_ports(&mut self) -> Vec<MemPorts<'_>> {
        let mut ports: Vec<MemPorts> = Vec::new();
        match self.icache.as_mut() {
            Some(icache) => ports.push((&mut icache.mem_req, &mut icache.mem_rsp)),
            None => ports.push((&mut self.core.icache_req, &mut self.core.icache_rsp)),
        }
        match self.dcache.as_mut() {
            Some(dcache) => ports.push((&mut dcache.mem_req, &mut dcache.mem_rsp)),
            None => ports.extend(
                self.core
                    .lsu
                    .dcache_req
                    .iter_mut()
                    .zip(self.core.lsu.dcache_rsp.iter_mut()),
            ),
        }
        ports
    }

    pub fn is_idle(&self) -> bool {
        self.core.is_done()
            && self.icache.as_ref().map_or(true, CacheSim::is_idle)
            && self.dcache.as_ref().map_or(true, CacheSim::is_idle)
            && self.smem.is_idle()
    }

    fn tick_one(&mut self) {
        self.core.tick_one();
        if let Some(icache) = self.icache.as_mut() {
            icache.tick_one();
        }
        if let Some(dcache) = self.dcache.as_mut() {
            dcache.tick_one();
        }
        self.smem.tick_one();
    }

    fn reset(&mut self) {
        self.core.reset();
        if let Some(icache) = self.icache.as_mut() {
            icache.reset();
        }
        if let Some(dcache) = self.dcache.as_mut() {
            dcache.reset();
        }
        self.smem.reset();
    }
}

/// Cores of one cluster sharing an L2.
pub struct Cluster {
    id: usize,
    pub tiles: Vec<CoreTile>,
    pub l2: Option<CacheSim>,
}

impl Cluster {
    pub fn new(id: usize, ctx: &CoreContext) -> Self {
        let num_cores = ctx.arch.num_cores();
        let mut tiles: Vec<CoreTile> = (0..num_cores)
            .map(|local| CoreTile::new(id * num_cores + local, ctx))
            .collect();

        let caches = ctx.caches;
        let mut l2 = None;
        if caches.l2.enabled {
            let mut upper: Vec<MemPorts> = tiles.iter_mut().flat_map(CoreTile::mem_ports).collect();
            let mut cache = CacheSim::new(
                format!("l2cache{id}"),
                Arc::new(caches.l2),
                upper.len(),
                ctx.perf.l2(id),
            );
            for (idx, ports) in upper.drain(..).enumerate() {
                connect(
                    ports,
                    &mut cache.core_req,
                    &mut cache.core_rsp,
                    idx,
                    caches.l2.port_capacity,
                );
            }
            l2 = Some(cache);
        }
        info!(
            "cluster {}: {} cores, l2 {}",
            id,
            num_cores,
            if l2.is_some() { "enabled" } else { "bypassed" }
        );
        Self { id, tiles, l2 }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cores(&self) -> impl Iterator<Item = &Core> {
        self.tiles.iter().map(|tile| &tile.core)
    }

    pub fn cores_mut(&mut self) -> impl Iterator<Item = &mut Core> {
        self.tiles.iter_mut().map(|tile| &mut tile.core)
    }

    /// Ports facing the L3 or the memory controller.
    pub fn mem_ports(&mut self) -> Vec<MemPorts<'_>> {
        match self.l2.as_mut() {
            Some(l2) => vec![(&mut l2.mem_req, &mut l2.mem_rsp)],
            None => self.tiles.iter_mut().flat_map(CoreTile::mem_ports).collect(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.tiles.iter().all(CoreTile::is_idle) && self.l2.as_ref().map_or(true, CacheSim::is_idle)
    }
}

impl ModuleBehaviors for Cluster {
    fn tick_one(&mut self) {
        self.tiles.iter_mut().for_each(CoreTile::tick_one);
        if let Some(l2) = self.l2.as_mut() {
            l2.tick_one();
        }
    }

    fn reset(&mut self) {
        self.tiles.iter_mut().for_each(CoreTile::reset);
        if let Some(l2) = self.l2.as_mut() {
            l2.reset();
        }
    }
}
