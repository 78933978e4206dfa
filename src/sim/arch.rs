use serde::Deserialize;
use thiserror::Error;

use crate::sim::config::Config;

pub const NUM_BARRIERS: usize = 4;
pub const VECTOR_SIZE: usize = 16;
pub const NUM_REGS: usize = 32;
pub const NUM_CSRS: usize = 4096;
/// Thread masks are 32 bits wide.
pub const MAX_THREADS: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArchError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("{threads} threads per warp exceeds the maximum of {max}")]
    TooManyThreads { threads: usize, max: usize },
}

/// Topology of the simulated processor. Built once before elaboration and shared read-only by
/// every component afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arch {
    num_threads: usize,
    num_warps: usize,
    num_cores: usize,
    num_clusters: usize,
    vsize: usize,
    num_regs: usize,
    num_csrs: usize,
    num_barriers: usize,
    ipdom_size: usize,
}

impl Arch {
    pub fn new(
        num_threads: usize,
        num_warps: usize,
        num_cores: usize,
        num_clusters: usize,
    ) -> Result<Self, ArchError> {
        for (field, value) in [
            ("num_threads", num_threads),
            ("num_warps", num_warps),
            ("num_cores", num_cores),
            ("num_clusters", num_clusters),
        ] {
            if value == 0 {
                return Err(ArchError::Zero { field });
            }
        }
        if num_threads > MAX_THREADS {
            return Err(ArchError::TooManyThreads {
                threads: num_threads,
                max: MAX_THREADS,
            });
        }
        Ok(Self {
            num_threads,
            num_warps,
            num_cores,
            num_clusters,
            vsize: VECTOR_SIZE,
            num_regs: NUM_REGS,
            num_csrs: NUM_CSRS,
            num_barriers: NUM_BARRIERS,
            // each divergent split pushes two entries, and a warp can split at most threads-1 times
            // before every path is a single thread
            ipdom_size: 2 * (num_threads - 1),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn num_warps(&self) -> usize {
        self.num_warps
    }

    /// Cores per cluster.
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    pub fn total_cores(&self) -> usize {
        self.num_cores * self.num_clusters
    }

    pub fn vsize(&self) -> usize {
        self.vsize
    }

    pub fn num_regs(&self) -> usize {
        self.num_regs
    }

    pub fn num_csrs(&self) -> usize {
        self.num_csrs
    }

    pub fn num_barriers(&self) -> usize {
        self.num_barriers
    }

    pub fn ipdom_size(&self) -> usize {
        self.ipdom_size
    }

    pub fn full_tmask(&self) -> u32 {
        if self.num_threads == MAX_THREADS {
            u32::MAX
        } else {
            (1u32 << self.num_threads) - 1
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ArchConfig {
    pub num_threads: usize,
    pub num_warps: usize,
    pub num_cores: usize,
    pub num_clusters: usize,
}

impl Config for ArchConfig {}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            num_warps: 4,
            num_cores: 1,
            num_clusters: 1,
        }
    }
}

impl TryFrom<ArchConfig> for Arch {
    type Error = ArchError;

    fn try_from(config: ArchConfig) -> Result<Self, Self::Error> {
        Arch::new(
            config.num_threads,
            config.num_warps,
            config.num_cores,
            config.num_clusters,
        )
    }
}
