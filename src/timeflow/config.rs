use serde::Deserialize;

use crate::sim::config::Config;
use crate::timeflow::isa::GfxKind;
use crate::timeq::Cycle;

/// Pipeline parameters of one core.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Issue lanes; warp `w` issues on lane `w % issue_width`.
    pub issue_width: usize,
    /// Decoded instructions buffered per warp.
    pub ibuffer_size: usize,
    /// Capacity of every intra-core link.
    pub port_capacity: usize,
    pub alu_latency: Cycle,
    pub mul_latency: Cycle,
    pub div_latency: Cycle,
    pub fpu_latency: Cycle,
    /// Warp-control pipeline depth inside the SFU.
    pub sfu_latency: Cycle,
    /// Instructions each ALU/FPU lane keeps in flight.
    pub pipeline_depth: usize,
    /// Loads the LSU tracks at once.
    pub lsu_queue_size: usize,
    /// Sub-requests queued per memory lane before the LSU refuses new instructions.
    pub lsu_outbox_depth: usize,
}

impl Config for CoreConfig {}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            issue_width: 1,
            ibuffer_size: 2,
            port_capacity: 2,
            alu_latency: 1,
            mul_latency: 3,
            div_latency: 16,
            fpu_latency: 4,
            sfu_latency: 2,
            pipeline_depth: 4,
            lsu_queue_size: 8,
            lsu_outbox_depth: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GfxUnitConfig {
    /// Sub-units in the pool; each serves one request at a time.
    pub num_units: usize,
    pub latency: Cycle,
    /// Requests queued per sub-unit.
    pub queue_depth: usize,
}

impl Default for GfxUnitConfig {
    fn default() -> Self {
        Self {
            num_units: 1,
            latency: 8,
            queue_depth: 2,
        }
    }
}

/// Graphics sub-unit pools reached through the SFU.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    pub tex: GfxUnitConfig,
    pub raster: GfxUnitConfig,
    pub rop: GfxUnitConfig,
}

impl Config for GfxConfig {}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            tex: GfxUnitConfig::default(),
            raster: GfxUnitConfig::default(),
            rop: GfxUnitConfig::default(),
        }
    }
}

impl GfxConfig {
    pub fn unit(&self, kind: GfxKind) -> &GfxUnitConfig {
        match kind {
            GfxKind::Tex => &self.tex,
            GfxKind::Raster => &self.raster,
            GfxKind::Rop => &self.rop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gfx_pools_parse_independently() {
        let table: toml::Table =
            toml::from_str("[gfx.tex]\nnum_units = 4\n[gfx.rop]\nlatency = 2\n").unwrap();
        let gfx = GfxConfig::from_section(table.get("gfx"));
        assert_eq!(gfx.unit(GfxKind::Tex).num_units, 4);
        assert_eq!(gfx.unit(GfxKind::Tex).latency, 8);
        assert_eq!(gfx.unit(GfxKind::Rop).latency, 2);
        assert_eq!(gfx.unit(GfxKind::Raster).num_units, 1);
    }
}
