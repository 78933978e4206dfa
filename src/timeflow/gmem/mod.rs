pub mod cache;
mod cache_sim;
mod mem_ctrl;
pub mod mshr;
pub mod policy;
mod request;

pub use cache_sim::CacheSim;
pub use mem_ctrl::MemController;
pub use policy::{CacheConfig, CacheHierarchyConfig, ReplacementPolicy, SmemConfig};
pub use request::{MemReq, MemRsp};
