//! Device configuration registers.
//!
//! The host programs fixed-function state through `write(addr, value)`. Every address belongs to
//! exactly one sub-bank: the base (pipeline) bank, the texture bank, the raster bank or the
//! render-output bank. States start out unwritten and reading one is an error.

use std::ops::Range;

use log::{debug, error};
use thiserror::Error;

pub const DCR_BASE_STATE_BEGIN: u32 = 0x001;
pub const DCR_BASE_STARTUP_ADDR0: u32 = 0x001;
pub const DCR_BASE_STARTUP_ADDR1: u32 = 0x002;
pub const DCR_BASE_MPM_CLASS: u32 = 0x003;
pub const DCR_BASE_STATE_END: u32 = 0x004;

pub const DCR_TEX_STATE_BEGIN: u32 = DCR_BASE_STATE_END;
pub const DCR_TEX_STAGE: u32 = DCR_TEX_STATE_BEGIN;
pub const DCR_TEX_LOGDIM: u32 = DCR_TEX_STATE_BEGIN + 1;
pub const DCR_TEX_FORMAT: u32 = DCR_TEX_STATE_BEGIN + 2;
pub const DCR_TEX_FILTER: u32 = DCR_TEX_STATE_BEGIN + 3;
pub const DCR_TEX_WRAP: u32 = DCR_TEX_STATE_BEGIN + 4;
pub const DCR_TEX_ADDR: u32 = DCR_TEX_STATE_BEGIN + 5;
pub const DCR_TEX_MIPOFF: u32 = DCR_TEX_STATE_BEGIN + 6;
pub const DCR_TEX_BORDER: u32 = DCR_TEX_STATE_BEGIN + 7;
pub const DCR_TEX_STATE_END: u32 = DCR_TEX_STATE_BEGIN + 8;
pub const NUM_TEX_STAGES: usize = 2;

pub const DCR_RASTER_STATE_BEGIN: u32 = DCR_TEX_STATE_END;
pub const DCR_RASTER_TBUF_ADDR: u32 = DCR_RASTER_STATE_BEGIN;
pub const DCR_RASTER_TILE_COUNT: u32 = DCR_RASTER_STATE_BEGIN + 1;
pub const DCR_RASTER_PBUF_ADDR: u32 = DCR_RASTER_STATE_BEGIN + 2;
pub const DCR_RASTER_PBUF_STRIDE: u32 = DCR_RASTER_STATE_BEGIN + 3;
pub const DCR_RASTER_SCISSOR_X: u32 = DCR_RASTER_STATE_BEGIN + 4;
pub const DCR_RASTER_SCISSOR_Y: u32 = DCR_RASTER_STATE_BEGIN + 5;
pub const DCR_RASTER_DST_SIZE: u32 = DCR_RASTER_STATE_BEGIN + 6;
pub const DCR_RASTER_STATE_END: u32 = DCR_RASTER_STATE_BEGIN + 8;

pub const DCR_ROP_STATE_BEGIN: u32 = DCR_RASTER_STATE_END;
pub const DCR_ROP_CBUF_ADDR: u32 = DCR_ROP_STATE_BEGIN;
pub const DCR_ROP_CBUF_PITCH: u32 = DCR_ROP_STATE_BEGIN + 1;
pub const DCR_ROP_CBUF_WRITEMASK: u32 = DCR_ROP_STATE_BEGIN + 2;
pub const DCR_ROP_ZBUF_ADDR: u32 = DCR_ROP_STATE_BEGIN + 3;
pub const DCR_ROP_ZBUF_PITCH: u32 = DCR_ROP_STATE_BEGIN + 4;
pub const DCR_ROP_DEPTH_FUNC: u32 = DCR_ROP_STATE_BEGIN + 5;
pub const DCR_ROP_DEPTH_WRITEMASK: u32 = DCR_ROP_STATE_BEGIN + 6;
pub const DCR_ROP_BLEND_MODE: u32 = DCR_ROP_STATE_BEGIN + 14;
pub const DCR_ROP_BLEND_CONST: u32 = DCR_ROP_STATE_BEGIN + 15;
pub const DCR_ROP_STATE_END: u32 = DCR_ROP_STATE_BEGIN + 16;

pub const DCR_BASE_STATE_COUNT: usize = (DCR_BASE_STATE_END - DCR_BASE_STATE_BEGIN) as usize;
pub const DCR_TEX_STATE_COUNT: usize = (DCR_TEX_STATE_END - DCR_TEX_STATE_BEGIN) as usize;
pub const DCR_RASTER_STATE_COUNT: usize =
    (DCR_RASTER_STATE_END - DCR_RASTER_STATE_BEGIN) as usize;
pub const DCR_ROP_STATE_COUNT: usize = (DCR_ROP_STATE_END - DCR_ROP_STATE_BEGIN) as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DcrError {
    #[error("invalid global DCR addr={0:#x}")]
    Unmapped(u32),
    #[error("DCR addr={0:#x} read before it was written")]
    Unwritten(u32),
    #[error("texture stage {0} out of range")]
    InvalidStage(u32),
}

/// A contiguous block of 32-bit states starting at `begin`.
#[derive(Debug, Clone)]
pub struct StateBank<const N: usize> {
    begin: u32,
    states: [Option<u32>; N],
}

impl<const N: usize> StateBank<N> {
    pub fn new(begin: u32) -> Self {
        Self {
            begin,
            states: [None; N],
        }
    }

    pub fn range(&self) -> Range<u32> {
        self.begin..self.begin + N as u32
    }

    fn offset(&self, addr: u32) -> Result<usize, DcrError> {
        self.range()
            .contains(&addr)
            .then(|| (addr - self.begin) as usize)
            .ok_or(DcrError::Unmapped(addr))
    }

    pub fn read(&self, addr: u32) -> Result<u32, DcrError> {
        self.states[self.offset(addr)?].ok_or(DcrError::Unwritten(addr))
    }

    pub fn write(&mut self, addr: u32, value: u32) -> Result<(), DcrError> {
        let offset = self.offset(addr)?;
        self.states[offset] = Some(value);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.states = [None; N];
    }
}

pub type BaseDcrs = StateBank<DCR_BASE_STATE_COUNT>;
pub type RasterDcrs = StateBank<DCR_RASTER_STATE_COUNT>;
pub type RopDcrs = StateBank<DCR_ROP_STATE_COUNT>;

impl BaseDcrs {
    pub fn startup_addr(&self) -> Result<u64, DcrError> {
        let lo = self.read(DCR_BASE_STARTUP_ADDR0)? as u64;
        let hi = self.read(DCR_BASE_STARTUP_ADDR1)? as u64;
        Ok((hi << 32) | lo)
    }

    pub fn mpm_class(&self) -> Result<u32, DcrError> {
        self.read(DCR_BASE_MPM_CLASS)
    }
}

/// Texture states are banked per sampler stage; writing TEX_STAGE selects the stage that later
/// writes to the bank land in.
#[derive(Debug, Clone)]
pub struct TexDcrs {
    stage: Option<u32>,
    stages: Vec<StateBank<DCR_TEX_STATE_COUNT>>,
}

impl Default for TexDcrs {
    fn default() -> Self {
        Self {
            stage: None,
            stages: vec![StateBank::new(DCR_TEX_STATE_BEGIN); NUM_TEX_STAGES],
        }
    }
}

impl TexDcrs {
    pub fn range(&self) -> Range<u32> {
        DCR_TEX_STATE_BEGIN..DCR_TEX_STATE_END
    }

    pub fn write(&mut self, addr: u32, value: u32) -> Result<(), DcrError> {
        if addr == DCR_TEX_STAGE {
            if value as usize >= NUM_TEX_STAGES {
                return Err(DcrError::InvalidStage(value));
            }
            self.stage = Some(value);
        }
        let stage = self.stage.ok_or(DcrError::Unwritten(DCR_TEX_STAGE))?;
        self.stages[stage as usize].write(addr, value)
    }

    /// Read a state of an explicit stage.
    pub fn read_stage(&self, stage: usize, addr: u32) -> Result<u32, DcrError> {
        self.stages
            .get(stage)
            .ok_or(DcrError::InvalidStage(stage as u32))?
            .read(addr)
    }

    /// Read a state of the currently selected stage.
    pub fn read(&self, addr: u32) -> Result<u32, DcrError> {
        let stage = self.stage.ok_or(DcrError::Unwritten(DCR_TEX_STAGE))?;
        self.read_stage(stage as usize, addr)
    }

    pub fn clear(&mut self) {
        self.stage = None;
        self.stages.iter_mut().for_each(StateBank::clear);
    }
}

#[derive(Debug, Clone)]
pub struct Dcrs {
    pub base: BaseDcrs,
    pub tex: TexDcrs,
    pub raster: RasterDcrs,
    pub rop: RopDcrs,
}

impl Default for Dcrs {
    fn default() -> Self {
        Self {
            base: StateBank::new(DCR_BASE_STATE_BEGIN),
            tex: TexDcrs::default(),
            raster: StateBank::new(DCR_RASTER_STATE_BEGIN),
            rop: StateBank::new(DCR_ROP_STATE_BEGIN),
        }
    }
}

impl Dcrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_write(&mut self, addr: u32, value: u32) -> Result<(), DcrError> {
        debug!("dcr write {:#x} <- {:#x}", addr, value);
        if self.base.range().contains(&addr) {
            return self.base.write(addr, value);
        }
        if self.tex.range().contains(&addr) {
            return self.tex.write(addr, value);
        }
        if self.raster.range().contains(&addr) {
            return self.raster.write(addr, value);
        }
        if self.rop.range().contains(&addr) {
            return self.rop.write(addr, value);
        }
        Err(DcrError::Unmapped(addr))
    }

    /// Host-side write. An address that no sub-bank claims is a driver bug and aborts the run;
    /// a rejected value inside a bank is handed back to the caller.
    pub fn write(&mut self, addr: u32, value: u32) -> Result<(), DcrError> {
        match self.try_write(addr, value) {
            Err(err @ DcrError::Unmapped(_)) => {
                error!("{}", err);
                panic!("fatal DCR write: {err}");
            }
            result => result,
        }
    }

    pub fn read(&self, addr: u32) -> Result<u32, DcrError> {
        if self.base.range().contains(&addr) {
            self.base.read(addr)
        } else if self.tex.range().contains(&addr) {
            self.tex.read(addr)
        } else if self.raster.range().contains(&addr) {
            self.raster.read(addr)
        } else if self.rop.range().contains(&addr) {
            self.rop.read(addr)
        } else {
            Err(DcrError::Unmapped(addr))
        }
    }

    pub fn reset(&mut self) {
        self.base.clear();
        self.tex.clear();
        self.raster.clear();
        self.rop.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_route_to_one_bank() {
        let mut dcrs = Dcrs::new();
        dcrs.write(DCR_BASE_STARTUP_ADDR0, 0x8000_0000).unwrap();
        dcrs.write(DCR_BASE_STARTUP_ADDR1, 0x1).unwrap();
        dcrs.write(DCR_RASTER_TILE_COUNT, 12).unwrap();
        dcrs.write(DCR_ROP_BLEND_CONST, 0xff).unwrap();

        assert_eq!(dcrs.base.startup_addr(), Ok(0x1_8000_0000));
        assert_eq!(dcrs.read(DCR_RASTER_TILE_COUNT), Ok(12));
        assert_eq!(dcrs.rop.read(DCR_ROP_BLEND_CONST), Ok(0xff));
        assert_eq!(
            dcrs.raster.read(DCR_ROP_BLEND_CONST),
            Err(DcrError::Unmapped(DCR_ROP_BLEND_CONST))
        );
    }

    #[test]
    fn unwritten_state_is_an_error() {
        let dcrs = Dcrs::new();
        assert_eq!(
            dcrs.read(DCR_BASE_MPM_CLASS),
            Err(DcrError::Unwritten(DCR_BASE_MPM_CLASS))
        );
        assert!(dcrs.base.startup_addr().is_err());
    }

    #[test]
    fn unmapped_write_is_rejected() {
        let mut dcrs = Dcrs::new();
        assert_eq!(dcrs.try_write(0x0, 1), Err(DcrError::Unmapped(0x0)));
        assert_eq!(
            dcrs.try_write(DCR_ROP_STATE_END, 1),
            Err(DcrError::Unmapped(DCR_ROP_STATE_END))
        );
    }

    #[test]
    #[should_panic(expected = "fatal DCR write")]
    fn unmapped_write_aborts() {
        let _ = Dcrs::new().write(0x7ff, 1);
    }

    #[test]
    fn tex_writes_follow_selected_stage() {
        let mut dcrs = Dcrs::new();
        assert_eq!(
            dcrs.try_write(DCR_TEX_ADDR, 1),
            Err(DcrError::Unwritten(DCR_TEX_STAGE))
        );
        dcrs.write(DCR_TEX_STAGE, 0).unwrap();
        dcrs.write(DCR_TEX_ADDR, 0x100).unwrap();
        dcrs.write(DCR_TEX_STAGE, 1).unwrap();
        dcrs.write(DCR_TEX_ADDR, 0x200).unwrap();

        assert_eq!(dcrs.tex.read_stage(0, DCR_TEX_ADDR), Ok(0x100));
        assert_eq!(dcrs.tex.read_stage(1, DCR_TEX_ADDR), Ok(0x200));
        assert_eq!(dcrs.read(DCR_TEX_ADDR), Ok(0x200));
        assert_eq!(
            dcrs.try_write(DCR_TEX_STAGE, NUM_TEX_STAGES as u32),
            Err(DcrError::InvalidStage(NUM_TEX_STAGES as u32))
        );
        // a bad stage is reported without aborting
        assert_eq!(
            dcrs.write(DCR_TEX_STAGE, NUM_TEX_STAGES as u32),
            Err(DcrError::InvalidStage(NUM_TEX_STAGES as u32))
        );
        assert_eq!(dcrs.read(DCR_TEX_ADDR), Ok(0x200));
    }

    #[test]
    fn reset_forgets_states() {
        let mut dcrs = Dcrs::new();
        dcrs.write(DCR_BASE_MPM_CLASS, 2).unwrap();
        dcrs.reset();
        assert!(dcrs.read(DCR_BASE_MPM_CLASS).is_err());
    }
}
