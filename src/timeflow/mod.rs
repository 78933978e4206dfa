pub mod barrier;
pub mod config;
pub mod exe_unit;
pub mod gmem;
pub mod ipdom;
pub mod isa;
pub mod lsu;
pub mod pipeline;
pub mod scoreboard;
pub mod sfu;
pub mod smem;
pub mod trace;
pub mod warp;
pub mod warp_scheduler;

#[cfg(test)]
mod unit_tests;

pub use config::{CoreConfig, GfxConfig, GfxUnitConfig};
pub use gmem::{CacheConfig, CacheHierarchyConfig, CacheSim, MemController, MemReq, MemRsp};
pub use isa::{Instr, KernelBuilder};
pub use pipeline::{Core, CoreContext, CoreEvent, EventKind};
pub use smem::SharedMem;
pub use warp::WarpStatus;
