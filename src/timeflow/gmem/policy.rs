use serde::Deserialize;

use crate::sim::config::Config;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicy {
    /// Not-recently-used: evict the first way whose reference bit is clear.
    #[default]
    Nru,
    Random,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub line_size: u32,
    /// Sets per bank.
    pub num_sets: usize,
    pub num_ways: usize,
    pub num_banks: usize,
    /// Accesses one bank can start per cycle.
    pub ports_per_bank: usize,
    /// Cycles from tag access to response.
    pub latency: Cycle,
    /// MSHR entries per bank.
    pub mshr_size: usize,
    pub write_back: bool,
    pub replacement: ReplacementPolicy,
    pub seed: u64,
    /// Responses a port can have queued in the data pipeline.
    pub rsp_queue_size: usize,
    pub port_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let s = Self {
            enabled: true,
            line_size: 64,
            num_sets: 64,
            num_ways: 4,
            num_banks: 4,
            ports_per_bank: 1,
            latency: 2,
            mshr_size: 8,
            write_back: false,
            replacement: ReplacementPolicy::Nru,
            seed: 0,
            rsp_queue_size: 16,
            port_capacity: 2,
        };
        s.ensure_valid();
        s
    }
}

impl CacheConfig {
    pub fn icache() -> Self {
        Self {
            num_banks: 1,
            latency: 1,
            mshr_size: 4,
            ..Self::default()
        }
    }

    pub fn dcache() -> Self {
        Self::default()
    }

    pub fn l2() -> Self {
        Self {
            num_sets: 256,
            num_ways: 8,
            num_banks: 8,
            latency: 4,
            mshr_size: 16,
            write_back: true,
            ..Self::default()
        }
    }

    pub fn l3() -> Self {
        Self {
            enabled: false,
            num_sets: 512,
            num_ways: 8,
            num_banks: 8,
            latency: 8,
            mshr_size: 32,
            write_back: true,
            ..Self::default()
        }
    }

    /// Fail fast on configurations that cannot describe a cache.
    pub fn ensure_valid(&self) {
        assert!(self.line_size.is_power_of_two(), "line_size must be a power of two");
        assert!(self.num_sets > 0, "num_sets must be > 0");
        assert!(self.num_ways > 0, "num_ways must be > 0");
        assert!(self.num_banks > 0, "num_banks must be > 0");
        assert!(self.ports_per_bank > 0, "ports_per_bank must be > 0");
        assert!(self.mshr_size > 0, "mshr_size must be > 0");
        assert!(self.rsp_queue_size > 0, "rsp_queue_size must be > 0");
        assert!(self.port_capacity > 0, "port_capacity must be > 0");
    }

    pub fn line_addr(&self, addr: u64) -> u64 {
        addr / self.line_size as u64
    }

    pub fn line_base(&self, addr: u64) -> u64 {
        addr & !(self.line_size as u64 - 1)
    }

    /// Lines are interleaved across banks.
    pub fn bank_for(&self, line_addr: u64) -> usize {
        (line_addr % self.num_banks as u64) as usize
    }

    /// Line index within its bank, used to pick the set.
    pub fn bank_local(&self, line_addr: u64) -> u64 {
        line_addr / self.num_banks as u64
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SmemConfig {
    pub enabled: bool,
    pub base_addr: u64,
    pub size: u64,
    pub num_banks: usize,
    /// Bytes per bank word.
    pub word_size: u32,
    pub latency: Cycle,
    pub port_capacity: usize,
}

impl Default for SmemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_addr: 0xFE00_0000,
            size: 0x4000,
            num_banks: 4,
            word_size: 4,
            latency: 1,
            port_capacity: 2,
        }
    }
}

impl SmemConfig {
    pub fn contains(&self, addr: u64) -> bool {
        self.enabled && addr >= self.base_addr && addr < self.base_addr + self.size
    }

    pub fn bank_for(&self, addr: u64) -> usize {
        ((addr / self.word_size as u64) % self.num_banks as u64) as usize
    }
}

/// Every memory-side component, one sub-table each.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheHierarchyConfig {
    pub icache: CacheConfig,
    pub dcache: CacheConfig,
    pub l2: CacheConfig,
    pub l3: CacheConfig,
    pub smem: SmemConfig,
}

impl Config for CacheHierarchyConfig {}

impl Default for CacheHierarchyConfig {
    fn default() -> Self {
        Self {
            icache: CacheConfig::icache(),
            dcache: CacheConfig::dcache(),
            l2: CacheConfig::l2(),
            l3: CacheConfig::l3(),
            smem: SmemConfig::default(),
        }
    }
}
