use std::sync::{Arc, RwLock};

use log::{debug, info};

use crate::base::behavior::*;
use crate::cluster::{cache_level, connect, Cluster, MemPorts};
use crate::sim::arch::Arch;
use crate::sim::config::MemConfig;
use crate::sim::dcrs::{DcrError, Dcrs};
use crate::sim::perf::PerfRegistry;
use crate::sim::sparse_mem::SparseMemory;
use crate::timeflow::config::{CoreConfig, GfxConfig};
use crate::timeflow::gmem::{CacheHierarchyConfig, CacheSim, MemController};
use crate::timeflow::pipeline::{Core, CoreContext};
use crate::timeq::Cycle;

/// Everything needed to elaborate a processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub arch: Arc<Arch>,
    pub core: Arc<CoreConfig>,
    pub gfx: GfxConfig,
    pub caches: CacheHierarchyConfig,
    pub mem: MemConfig,
    pub record_events: bool,
}

impl ProcessorConfig {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch: Arc::new(arch),
            core: Arc::default(),
            gfx: GfxConfig::default(),
            caches: CacheHierarchyConfig::default(),
            mem: MemConfig::default(),
            record_events: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every warp halted; cycles since launch.
    Halted(Cycle),
    BudgetExhausted,
}

struct Hierarchy {
    clusters: Vec<Cluster>,
    l3: Option<CacheSim>,
    mem_ctrl: MemController,
}

/// Build clusters and the shared levels below them. Graphics pools sample `dcrs` here.
fn elaborate(
    config: &ProcessorConfig,
    dcrs: &Dcrs,
    mem: &Arc<RwLock<SparseMemory>>,
    perf: &PerfRegistry,
) -> Hierarchy {
    let ctx = CoreContext {
        arch: &config.arch,
        core: &config.core,
        gfx: &config.gfx,
        caches: &config.caches,
        dcrs,
        mem,
        perf,
        record_events: config.record_events,
    };
    let mut clusters: Vec<Cluster> = (0..config.arch.num_clusters())
        .map(|id| Cluster::new(id, &ctx))
        .collect();

    let mem_config = Arc::new(config.mem);
    let l3_config = &config.caches.l3;
    let mut upper: Vec<MemPorts> = clusters.iter_mut().flat_map(Cluster::mem_ports).collect();
    let mut l3 = cache_level("l3cache".to_string(), l3_config, upper.len(), perf.l3());
    let mem_ctrl = match l3.as_mut() {
        Some(l3) => {
            for (idx, ports) in upper.drain(..).enumerate() {
                connect(ports, &mut l3.core_req, &mut l3.core_rsp, idx, l3_config.port_capacity);
            }
            let mut ctrl = MemController::new(mem_config, 1, perf.mem());
            connect(
                (&mut l3.mem_req, &mut l3.mem_rsp),
                &mut ctrl.req,
                &mut ctrl.rsp,
                0,
                config.mem.port_capacity,
            );
            ctrl
        }
        None => {
            let mut ctrl = MemController::new(mem_config, upper.len(), perf.mem());
            for (idx, ports) in upper.drain(..).enumerate() {
                connect(ports, &mut ctrl.req, &mut ctrl.rsp, idx, config.mem.port_capacity);
            }
            ctrl
        }
    };
    debug!(
        "elaborated {} clusters, l3 {}, {} memory ports",
        clusters.len(),
        if l3.is_some() { "enabled" } else { "bypassed" },
        mem_ctrl.req.len()
    );
    Hierarchy {
        clusters,
        l3,
        mem_ctrl,
    }
}

/// The whole device: clusters of cores, the shared L3, the memory controller, and the state the
/// host programs (DCRs, memory). Owns the counter registry for the run.
pub struct Processor {
    config: ProcessorConfig,
    pub clusters: Vec<Cluster>,
    l3: Option<CacheSim>,
    mem_ctrl: MemController,
    perf: PerfRegistry,
    dcrs: Dcrs,
    mem: Arc<RwLock<SparseMemory>>,
    cycle: Cycle,
}

impl Processor {
    pub fn new(config: ProcessorConfig, mem: Arc<RwLock<SparseMemory>>) -> Self {
        let perf = PerfRegistry::new(&config.arch);
        let dcrs = Dcrs::new();
        let hierarchy = elaborate(&config, &dcrs, &mem, &perf);
        info!(
            "processor: {} clusters x {} cores x {} warps x {} threads",
            config.arch.num_clusters(),
            config.arch.num_cores(),
            config.arch.num_warps(),
            config.arch.num_threads()
        );
        Self {
            config,
            clusters: hierarchy.clusters,
            l3: hierarchy.l3,
            mem_ctrl: hierarchy.mem_ctrl,
            perf,
            dcrs,
            mem,
            cycle: 0,
        }
    }

    pub fn arch(&self) -> &Arch {
        &self.config.arch
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn perf(&self) -> &PerfRegistry {
        &self.perf
    }

    pub fn dcrs(&self) -> &Dcrs {
        &self.dcrs
    }

    pub fn dcrs_mut(&mut self) -> &mut Dcrs {
        &mut self.dcrs
    }

    pub fn mem(&self) -> &Arc<RwLock<SparseMemory>> {
        &self.mem
    }

    /// Cycles since the last launch.
    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn core(&self, core_id: usize) -> Option<&Core> {
        let per_cluster = self.config.arch.num_cores();
        self.clusters
            .get(core_id / per_cluster)?
            .tiles
            .get(core_id % per_cluster)
            .map(|tile| &tile.core)
    }

    pub fn cores(&self) -> impl Iterator<Item = &Core> {
        self.clusters.iter().flat_map(Cluster::cores)
    }

    /// Rebuild the hierarchy from the current DCR state, zero the counters and start every warp
    /// of every core at the programmed startup address.
    pub fn launch(&mut self) -> Result<u64, DcrError> {
        let startup = self.dcrs.base.startup_addr()?;
        let hierarchy = elaborate(&self.config, &self.dcrs, &self.mem, &self.perf);
        self.clusters = hierarchy.clusters;
        self.l3 = hierarchy.l3;
        self.mem_ctrl = hierarchy.mem_ctrl;
        self.perf.reset();
        self.cycle = 0;
        for cluster in self.clusters.iter_mut() {
            cluster.cores_mut().for_each(|core| core.start(startup));
        }
        info!("processor: launched at {:#x}", startup);
        Ok(startup)
    }

    pub fn is_done(&self) -> bool {
        self.cores().all(Core::is_done)
    }

    /// Step until every warp has halted or `max_cycles` more cycles have elapsed.
    pub fn run(&mut self, max_cycles: u64) -> RunOutcome {
        let deadline = self.cycle.saturating_add(max_cycles);
        loop {
            if self.is_done() {
                info!("processor: halted after {} cycles", self.cycle);
                return RunOutcome::Halted(self.cycle);
            }
            if self.cycle >= deadline {
                info!("processor: cycle budget exhausted at {}", self.cycle);
                return RunOutcome::BudgetExhausted;
            }
            self.tick_one();
        }
    }
}

impl ModuleBehaviors for Processor {
    fn tick_one(&mut self) {
        self.clusters.iter_mut().for_each(Cluster::tick_one);
        if let Some(l3) = self.l3.as_mut() {
            l3.tick_one();
        }
        self.mem_ctrl.tick_one();
        self.cycle += 1;
    }

    fn reset(&mut self) {
        self.clusters.iter_mut().for_each(Cluster::reset);
        if let Some(l3) = self.l3.as_mut() {
            l3.reset();
        }
        self.mem_ctrl.reset();
        self.perf.reset();
        self.cycle = 0;
    }
}
