pub mod base {
    pub mod arena;
    pub mod behavior;
    pub mod mem;
    pub mod module;
    pub mod port;
}

pub mod cluster;

pub mod sim {
    pub mod arch;
    pub mod config;
    pub mod dcrs;
    pub mod device;
    pub mod perf;
    pub mod perf_log;
    pub mod runtime;
    pub mod sparse_mem;
    pub mod top;
}

pub mod timeflow;
pub mod timeq;
