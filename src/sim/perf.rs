//! Performance-counter registry and the memory-mapped CSR view of it.
//!
//! One `PerfRegistry` exists per simulation run. Each component receives `Arc` handles to the
//! counter sets it owns when it is constructed and increments them inside its own tick; nothing
//! else ever writes a counter. The host side only reads them, through the per-core staging
//! buffer exposed at `IO_CSR_ADDR`.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use num_derive::FromPrimitive;
use phf::phf_map;
use serde::Serialize;

use crate::sim::arch::Arch;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Declares a set of live counters together with a plain snapshot type.
macro_rules! counter_set {
    ($(#[$meta:meta])* $name:ident => $snap:ident { $($field:ident),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: Counter,)*
        }

        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
        pub struct $snap {
            $(pub $field: u64,)*
        }

        impl $name {
            pub fn snapshot(&self) -> $snap {
                $snap {
                    $($field: self.$field.get(),)*
                }
            }

            pub fn reset(&self) {
                $(self.$field.reset();)*
            }
        }

        impl AddAssign for $snap {
            fn add_assign(&mut self, other: Self) {
                $(self.$field = self.$field.saturating_add(other.$field);)*
            }
        }
    };
}

counter_set! {
    /// Pipeline events of one core.
    CoreCounters => CoreStats {
        instrs,
        cycles,
        ibuffer_stalls,
        scoreboard_stalls,
        alu_stalls,
        lsu_stalls,
        fpu_stalls,
        sfu_stalls,
        ifetches,
        loads,
        stores,
        ifetch_lat,
        load_lat,
        tex_issue_stalls,
        raster_issue_stalls,
        rop_issue_stalls,
    }
}

counter_set! {
    CacheCounters => CacheStats {
        reads,
        writes,
        read_misses,
        write_misses,
        bank_stalls,
        mshr_stalls,
        evictions,
    }
}

counter_set! {
    MemCounters => MemStats {
        reads,
        writes,
        lat,
    }
}

counter_set! {
    /// Traffic of one graphics sub-unit pool.
    GfxCounters => GfxStats {
        reads,
        writes,
        lat,
        stalls,
    }
}

/// Counter class selected through the MPM_CLASS configuration register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize)]
pub enum MpmClass {
    None = 0,
    Core = 1,
    Mem = 2,
    Tex = 3,
    Raster = 4,
    Rop = 5,
}

pub const IO_CSR_ADDR: u64 = 0xFF00_0000;
/// Bytes of CSR staging buffer per core: 32 lo words followed by 32 hi words.
pub const CSR_REGION_SIZE: u64 = 64 * 4;

pub mod csr {
    pub const MPM_BASE: u32 = 0xB00;
    pub const MCYCLE: u32 = 0xB00;
    pub const MINSTRET: u32 = 0xB02;

    // core class
    pub const IBUF_ST: u32 = 0xB03;
    pub const SCRB_ST: u32 = 0xB04;
    pub const ALU_ST: u32 = 0xB05;
    pub const LSU_ST: u32 = 0xB06;
    pub const FPU_ST: u32 = 0xB07;
    pub const SFU_ST: u32 = 0xB08;
    pub const IFETCHES: u32 = 0xB09;
    pub const LOADS: u32 = 0xB0A;
    pub const STORES: u32 = 0xB0B;
    pub const IFETCH_LAT: u32 = 0xB0C;
    pub const LOAD_LAT: u32 = 0xB0D;

    // mem class
    pub const ICACHE_READS: u32 = 0xB03;
    pub const ICACHE_MISS_R: u32 = 0xB04;
    pub const DCACHE_READS: u32 = 0xB05;
    pub const DCACHE_WRITES: u32 = 0xB06;
    pub const DCACHE_MISS_R: u32 = 0xB07;
    pub const DCACHE_MISS_W: u32 = 0xB08;
    pub const DCACHE_BANK_ST: u32 = 0xB09;
    pub const DCACHE_MSHR_ST: u32 = 0xB0A;
    pub const SMEM_READS: u32 = 0xB0B;
    pub const SMEM_WRITES: u32 = 0xB0C;
    pub const SMEM_BANK_ST: u32 = 0xB0D;
    pub const L2CACHE_READS: u32 = 0xB0E;
    pub const L2CACHE_WRITES: u32 = 0xB0F;
    pub const L2CACHE_MISS_R: u32 = 0xB10;
    pub const L2CACHE_MISS_W: u32 = 0xB11;
    pub const L2CACHE_BANK_ST: u32 = 0xB12;
    pub const L2CACHE_MSHR_ST: u32 = 0xB13;
    pub const L3CACHE_READS: u32 = 0xB14;
    pub const L3CACHE_WRITES: u32 = 0xB15;
    pub const L3CACHE_MISS_R: u32 = 0xB16;
    pub const L3CACHE_MISS_W: u32 = 0xB17;
    pub const L3CACHE_BANK_ST: u32 = 0xB18;
    pub const L3CACHE_MSHR_ST: u32 = 0xB19;
    pub const MEM_READS: u32 = 0xB1A;
    pub const MEM_WRITES: u32 = 0xB1B;
    pub const MEM_LAT: u32 = 0xB1C;

    // tex class
    pub const TEX_READS: u32 = 0xB03;
    pub const TEX_LAT: u32 = 0xB04;
    pub const TEX_STALL: u32 = 0xB05;
    pub const TEX_ISSUE_ST: u32 = 0xB06;

    // raster class
    pub const RASTER_READS: u32 = 0xB03;
    pub const RASTER_LAT: u32 = 0xB04;
    pub const RASTER_STALL: u32 = 0xB05;
    pub const RASTER_ISSUE_ST: u32 = 0xB06;

    // rop class
    pub const ROP_READS: u32 = 0xB03;
    pub const ROP_WRITES: u32 = 0xB04;
    pub const ROP_LAT: u32 = 0xB05;
    pub const ROP_STALL: u32 = 0xB06;
    pub const ROP_ISSUE_ST: u32 = 0xB07;
}

/// Counter names accepted on the command line, mapped to their class and CSR address.
pub static NAMED_COUNTERS: phf::Map<&'static str, (MpmClass, u32)> = phf_map! {
    "cycles" => (MpmClass::None, csr::MCYCLE),
    "instrs" => (MpmClass::None, csr::MINSTRET),
    "ibuffer_stalls" => (MpmClass::Core, csr::IBUF_ST),
    "scoreboard_stalls" => (MpmClass::Core, csr::SCRB_ST),
    "alu_stalls" => (MpmClass::Core, csr::ALU_ST),
    "lsu_stalls" => (MpmClass::Core, csr::LSU_ST),
    "fpu_stalls" => (MpmClass::Core, csr::FPU_ST),
    "sfu_stalls" => (MpmClass::Core, csr::SFU_ST),
    "ifetches" => (MpmClass::Core, csr::IFETCHES),
    "loads" => (MpmClass::Core, csr::LOADS),
    "stores" => (MpmClass::Core, csr::STORES),
    "ifetch_lat" => (MpmClass::Core, csr::IFETCH_LAT),
    "load_lat" => (MpmClass::Core, csr::LOAD_LAT),
    "icache_reads" => (MpmClass::Mem, csr::ICACHE_READS),
    "icache_read_misses" => (MpmClass::Mem, csr::ICACHE_MISS_R),
    "dcache_reads" => (MpmClass::Mem, csr::DCACHE_READS),
    "dcache_writes" => (MpmClass::Mem, csr::DCACHE_WRITES),
    "dcache_read_misses" => (MpmClass::Mem, csr::DCACHE_MISS_R),
    "dcache_write_misses" => (MpmClass::Mem, csr::DCACHE_MISS_W),
    "dcache_bank_stalls" => (MpmClass::Mem, csr::DCACHE_BANK_ST),
    "dcache_mshr_stalls" => (MpmClass::Mem, csr::DCACHE_MSHR_ST),
    "smem_reads" => (MpmClass::Mem, csr::SMEM_READS),
    "smem_writes" => (MpmClass::Mem, csr::SMEM_WRITES),
    "smem_bank_stalls" => (MpmClass::Mem, csr::SMEM_BANK_ST),
    "l2cache_reads" => (MpmClass::Mem, csr::L2CACHE_READS),
    "l2cache_writes" => (MpmClass::Mem, csr::L2CACHE_WRITES),
    "l2cache_read_misses" => (MpmClass::Mem, csr::L2CACHE_MISS_R),
    "l2cache_write_misses" => (MpmClass::Mem, csr::L2CACHE_MISS_W),
    "l2cache_bank_stalls" => (MpmClass::Mem, csr::L2CACHE_BANK_ST),
    "l2cache_mshr_stalls" => (MpmClass::Mem, csr::L2CACHE_MSHR_ST),
    "l3cache_reads" => (MpmClass::Mem, csr::L3CACHE_READS),
    "l3cache_writes" => (MpmClass::Mem, csr::L3CACHE_WRITES),
    "l3cache_read_misses" => (MpmClass::Mem, csr::L3CACHE_MISS_R),
    "l3cache_write_misses" => (MpmClass::Mem, csr::L3CACHE_MISS_W),
    "l3cache_bank_stalls" => (MpmClass::Mem, csr::L3CACHE_BANK_ST),
    "l3cache_mshr_stalls" => (MpmClass::Mem, csr::L3CACHE_MSHR_ST),
    "mem_reads" => (MpmClass::Mem, csr::MEM_READS),
    "mem_writes" => (MpmClass::Mem, csr::MEM_WRITES),
    "mem_lat" => (MpmClass::Mem, csr::MEM_LAT),
    "tex_reads" => (MpmClass::Tex, csr::TEX_READS),
    "tex_lat" => (MpmClass::Tex, csr::TEX_LAT),
    "tex_stalls" => (MpmClass::Tex, csr::TEX_STALL),
    "tex_issue_stalls" => (MpmClass::Tex, csr::TEX_ISSUE_ST),
    "raster_reads" => (MpmClass::Raster, csr::RASTER_READS),
    "raster_lat" => (MpmClass::Raster, csr::RASTER_LAT),
    "raster_stalls" => (MpmClass::Raster, csr::RASTER_STALL),
    "raster_issue_stalls" => (MpmClass::Raster, csr::RASTER_ISSUE_ST),
    "rop_reads" => (MpmClass::Rop, csr::ROP_READS),
    "rop_writes" => (MpmClass::Rop, csr::ROP_WRITES),
    "rop_lat" => (MpmClass::Rop, csr::ROP_LAT),
    "rop_stalls" => (MpmClass::Rop, csr::ROP_STALL),
    "rop_issue_stalls" => (MpmClass::Rop, csr::ROP_ISSUE_ST),
};

pub type StagingBuffer = [u32; 64];

fn set_csr_64(buf: &mut StagingBuffer, addr: u32, value: u64) {
    let offset = (addr - csr::MPM_BASE) as usize;
    buf[offset] = value as u32;
    buf[offset + 32] = (value >> 32) as u32;
}

/// Reassemble a 64-bit counter from the lo/hi halves of a staging buffer.
pub fn csr_64(buf: &StagingBuffer, addr: u32) -> u64 {
    let offset = (addr - csr::MPM_BASE) as usize;
    ((buf[offset + 32] as u64) << 32) | buf[offset] as u64
}

/// Counters owned by the memory side of one core: its L1 caches and scratchpad.
#[derive(Debug, Default, Clone)]
pub struct CoreMemCounters {
    pub icache: Arc<CacheCounters>,
    pub dcache: Arc<CacheCounters>,
    pub smem: Arc<CacheCounters>,
}

#[derive(Debug, Default, Clone)]
pub struct CoreGfxCounters {
    pub tex: Arc<GfxCounters>,
    pub raster: Arc<GfxCounters>,
    pub rop: Arc<GfxCounters>,
}

#[derive(Debug)]
pub struct PerfRegistry {
    cores_per_cluster: usize,
    cores: Vec<Arc<CoreCounters>>,
    core_mem: Vec<CoreMemCounters>,
    core_gfx: Vec<CoreGfxCounters>,
    l2: Vec<Arc<CacheCounters>>,
    l3: Arc<CacheCounters>,
    mem: Arc<MemCounters>,
}

impl PerfRegistry {
    pub fn new(arch: &Arch) -> Self {
        let total = arch.total_cores();
        Self {
            cores_per_cluster: arch.num_cores(),
            cores: (0..total).map(|_| Arc::default()).collect(),
            core_mem: (0..total).map(|_| CoreMemCounters::default()).collect(),
            core_gfx: (0..total).map(|_| CoreGfxCounters::default()).collect(),
            l2: (0..arch.num_clusters()).map(|_| Arc::default()).collect(),
            l3: Arc::default(),
            mem: Arc::default(),
        }
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn core(&self, core_id: usize) -> Arc<CoreCounters> {
        Arc::clone(&self.cores[core_id])
    }

    pub fn core_mem(&self, core_id: usize) -> CoreMemCounters {
        self.core_mem[core_id].clone()
    }

    pub fn core_gfx(&self, core_id: usize) -> CoreGfxCounters {
        self.core_gfx[core_id].clone()
    }

    pub fn l2(&self, cluster_id: usize) -> Arc<CacheCounters> {
        Arc::clone(&self.l2[cluster_id])
    }

    pub fn l3(&self) -> Arc<CacheCounters> {
        Arc::clone(&self.l3)
    }

    pub fn mem(&self) -> Arc<MemCounters> {
        Arc::clone(&self.mem)
    }

    pub fn reset(&self) {
        self.cores.iter().for_each(|c| c.reset());
        for mem in &self.core_mem {
            mem.icache.reset();
            mem.dcache.reset();
            mem.smem.reset();
        }
        for gfx in &self.core_gfx {
            gfx.tex.reset();
            gfx.raster.reset();
            gfx.rop.reset();
        }
        self.l2.iter().for_each(|c| c.reset());
        self.l3.reset();
        self.mem.reset();
    }

    /// Fill the staging buffer of `core_id` for the given counter class. Shared levels are
    /// reported once: the L2 through the first core of its cluster, the L3 and the memory
    /// controller through core 0, so summing over cores never double counts.
    pub fn staging_buffer(&self, core_id: usize, class: MpmClass) -> Option<StagingBuffer> {
        let core = self.cores.get(core_id)?.snapshot();
        let mut buf = [0u32; 64];
        set_csr_64(&mut buf, csr::MCYCLE, core.cycles);
        set_csr_64(&mut buf, csr::MINSTRET, core.instrs);

        match class {
            MpmClass::None => {}
            MpmClass::Core => {
                for (addr, value) in [
                    (csr::IBUF_ST, core.ibuffer_stalls),
                    (csr::SCRB_ST, core.scoreboard_stalls),
                    (csr::ALU_ST, core.alu_stalls),
                    (csr::LSU_ST, core.lsu_stalls),
                    (csr::FPU_ST, core.fpu_stalls),
                    (csr::SFU_ST, core.sfu_stalls),
                    (csr::IFETCHES, core.ifetches),
                    (csr::LOADS, core.loads),
                    (csr::STORES, core.stores),
                    (csr::IFETCH_LAT, core.ifetch_lat),
                    (csr::LOAD_LAT, core.load_lat),
                ] {
                    set_csr_64(&mut buf, addr, value);
                }
            }
            MpmClass::Mem => {
                let mem = &self.core_mem[core_id];
                let icache = mem.icache.snapshot();
                let dcache = mem.dcache.snapshot();
                let smem = mem.smem.snapshot();
                for (addr, value) in [
                    (csr::ICACHE_READS, icache.reads),
                    (csr::ICACHE_MISS_R, icache.read_misses),
                    (csr::DCACHE_READS, dcache.reads),
                    (csr::DCACHE_WRITES, dcache.writes),
                    (csr::DCACHE_MISS_R, dcache.read_misses),
                    (csr::DCACHE_MISS_W, dcache.write_misses),
                    (csr::DCACHE_BANK_ST, dcache.bank_stalls),
                    (csr::DCACHE_MSHR_ST, dcache.mshr_stalls),
                    (csr::SMEM_READS, smem.reads),
                    (csr::SMEM_WRITES, smem.writes),
                    (csr::SMEM_BANK_ST, smem.bank_stalls),
                ] {
                    set_csr_64(&mut buf, addr, value);
                }
                if core_id % self.cores_per_cluster == 0 {
                    let l2 = self.l2[core_id / self.cores_per_cluster].snapshot();
                    for (addr, value) in [
                        (csr::L2CACHE_READS, l2.reads),
                        (csr::L2CACHE_WRITES, l2.writes),
                        (csr::L2CACHE_MISS_R, l2.read_misses),
                        (csr::L2CACHE_MISS_W, l2.write_misses),
                        (csr::L2CACHE_BANK_ST, l2.bank_stalls),
                        (csr::L2CACHE_MSHR_ST, l2.mshr_stalls),
                    ] {
                        set_csr_64(&mut buf, addr, value);
                    }
                }
                if core_id == 0 {
                    let l3 = self.l3.snapshot();
                    let mem = self.mem.snapshot();
                    for (addr, value) in [
                        (csr::L3CACHE_READS, l3.reads),
                        (csr::L3CACHE_WRITES, l3.writes),
                        (csr::L3CACHE_MISS_R, l3.read_misses),
                        (csr::L3CACHE_MISS_W, l3.write_misses),
                        (csr::L3CACHE_BANK_ST, l3.bank_stalls),
                        (csr::L3CACHE_MSHR_ST, l3.mshr_stalls),
                        (csr::MEM_READS, mem.reads),
                        (csr::MEM_WRITES, mem.writes),
                        (csr::MEM_LAT, mem.lat),
                    ] {
                        set_csr_64(&mut buf, addr, value);
                    }
                }
            }
            MpmClass::Tex => {
                let tex = self.core_gfx[core_id].tex.snapshot();
                set_csr_64(&mut buf, csr::TEX_READS, tex.reads);
                set_csr_64(&mut buf, csr::TEX_LAT, tex.lat);
                set_csr_64(&mut buf, csr::TEX_STALL, tex.stalls);
                set_csr_64(&mut buf, csr::TEX_ISSUE_ST, core.tex_issue_stalls);
            }
            MpmClass::Raster => {
                let raster = self.core_gfx[core_id].raster.snapshot();
                set_csr_64(&mut buf, csr::RASTER_READS, raster.reads);
                set_csr_64(&mut buf, csr::RASTER_LAT, raster.lat);
                set_csr_64(&mut buf, csr::RASTER_STALL, raster.stalls);
                set_csr_64(&mut buf, csr::RASTER_ISSUE_ST, core.raster_issue_stalls);
            }
            MpmClass::Rop => {
                let rop = self.core_gfx[core_id].rop.snapshot();
                set_csr_64(&mut buf, csr::ROP_READS, rop.reads);
                set_csr_64(&mut buf, csr::ROP_WRITES, rop.writes);
                set_csr_64(&mut buf, csr::ROP_LAT, rop.lat);
                set_csr_64(&mut buf, csr::ROP_STALL, rop.stalls);
                set_csr_64(&mut buf, csr::ROP_ISSUE_ST, core.rop_issue_stalls);
            }
        }
        Some(buf)
    }

    pub fn core_stats(&self, core_id: usize) -> Option<CoreStats> {
        self.cores.get(core_id).map(|c| c.snapshot())
    }

    pub fn l2_stats(&self, cluster_id: usize) -> Option<CacheStats> {
        self.l2.get(cluster_id).map(|c| c.snapshot())
    }

    pub fn l3_stats(&self) -> CacheStats {
        self.l3.snapshot()
    }

    pub fn mem_stats(&self) -> MemStats {
        self.mem.snapshot()
    }
}
