//! Host view of the simulated processor: capability queries, memory copies, DCR programming and
//! kernel launch. Every fallible call returns a `DeviceError` that maps onto a non-zero status
//! code, and nothing is mutated when a call fails.

use std::sync::{Arc, RwLock};

use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::base::mem::HasMemory;
use crate::sim::dcrs::DcrError;
use crate::sim::perf::{MpmClass, StagingBuffer, CSR_REGION_SIZE, IO_CSR_ADDR};
use crate::sim::sparse_mem::SparseMemory;
use crate::sim::top::{Processor, ProcessorConfig, RunOutcome};

/// Kernels are uploaded to, and start at, this address.
pub const STARTUP_ADDR: u64 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum DeviceCap {
    Version = 0,
    NumThreads = 1,
    NumWarps = 2,
    NumCores = 3,
    NumClusters = 4,
    KernelBaseAddr = 5,
    IsaFlags = 6,
    GlobalMemSize = 7,
}

/// Bits reported by `DeviceCap::IsaFlags`.
pub mod isa_ext {
    pub const ICACHE: u64 = 1 << 0;
    pub const DCACHE: u64 = 1 << 1;
    pub const L2CACHE: u64 = 1 << 2;
    pub const L3CACHE: u64 = 1 << 3;
    pub const SMEM: u64 = 1 << 4;
    pub const TEX: u64 = 1 << 5;
    pub const RASTER: u64 = 1 << 6;
    pub const ROP: u64 = 1 << 7;
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("host i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown device capability {0}")]
    UnknownCap(u32),
    #[error("empty content")]
    EmptyContent,
    #[error("{size} bytes at {addr:#x} fall outside device memory")]
    OutOfRange { addr: u64, size: usize },
    #[error("core {0} out of range")]
    CoreOutOfRange(usize),
    #[error("performance counters are not initialized")]
    CsrUninitialized,
    #[error(transparent)]
    Dcr(#[from] DcrError),
    #[error("device memory access failed: {0:#}")]
    Memory(anyhow::Error),
}

impl DeviceError {
    /// Status code reported to the host; never zero.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::Io(_) => -1,
            DeviceError::EmptyContent => -2,
            DeviceError::UnknownCap(_) => -3,
            DeviceError::OutOfRange { .. } => -4,
            DeviceError::CoreOutOfRange(_) => -5,
            DeviceError::CsrUninitialized => -6,
            DeviceError::Dcr(_) => -7,
            DeviceError::Memory(_) => -8,
        }
    }
}

pub trait Device {
    fn dev_caps(&self, cap: u32) -> Result<u64, DeviceError>;

    fn copy_to_dev(&mut self, addr: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn copy_from_dev(&self, addr: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    fn dcr_write(&mut self, addr: u32, value: u32) -> Result<(), DeviceError>;

    /// Launch the kernel at the programmed startup address.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Run the launched kernel for at most `budget` cycles.
    fn wait(&mut self, budget: u64) -> Result<RunOutcome, DeviceError>;
}

/// `Device` backed by the cycle-level model.
pub struct SimDevice {
    processor: Processor,
    mem: Arc<RwLock<SparseMemory>>,
    launched: bool,
}

impl SimDevice {
    pub fn new(config: ProcessorConfig) -> Self {
        let mem = Arc::new(RwLock::new(SparseMemory::new(config.mem.size)));
        let processor = Processor::new(config, Arc::clone(&mem));
        Self {
            processor,
            mem,
            launched: false,
        }
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut Processor {
        &mut self.processor
    }

    fn csr_region_end(&self) -> u64 {
        IO_CSR_ADDR + self.processor.arch().total_cores() as u64 * CSR_REGION_SIZE
    }

    fn mpm_class(&self) -> MpmClass {
        // an unprogrammed class exposes only cycles and instructions
        self.processor
            .dcrs()
            .base
            .mpm_class()
            .ok()
            .and_then(MpmClass::from_u32)
            .unwrap_or(MpmClass::None)
    }

    fn staging_buffer(&self, core_id: usize) -> Result<StagingBuffer, DeviceError> {
        self.processor
            .perf()
            .staging_buffer(core_id, self.mpm_class())
            .ok_or(DeviceError::CoreOutOfRange(core_id))
    }

    fn copy_from_csr(&self, addr: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        if !self.launched {
            return Err(DeviceError::CsrUninitialized);
        }
        let mut cached: Option<(usize, StagingBuffer)> = None;
        for (i, byte) in buf.iter_mut().enumerate() {
            let offset = addr - IO_CSR_ADDR + i as u64;
            let core_id = (offset / CSR_REGION_SIZE) as usize;
            let staging = match cached {
                Some((id, staging)) if id == core_id => staging,
                _ => {
                    let staging = self.staging_buffer(core_id)?;
                    cached = Some((core_id, staging));
                    staging
                }
            };
            let local = (offset % CSR_REGION_SIZE) as usize;
            *byte = staging[local / 4].to_le_bytes()[local % 4];
        }
        Ok(())
    }
}

impl Device for SimDevice {
    fn dev_caps(&self, cap: u32) -> Result<u64, DeviceError> {
        let arch = self.processor.arch();
        let caches = &self.processor.config().caches;
        let value = match DeviceCap::from_u32(cap).ok_or(DeviceError::UnknownCap(cap))? {
            DeviceCap::Version => 1,
            DeviceCap::NumThreads => arch.num_threads() as u64,
            DeviceCap::NumWarps => arch.num_warps() as u64,
            DeviceCap::NumCores => arch.total_cores() as u64,
            DeviceCap::NumClusters => arch.num_clusters() as u64,
            DeviceCap::KernelBaseAddr => STARTUP_ADDR,
            DeviceCap::GlobalMemSize => self.processor.config().mem.size,
            DeviceCap::IsaFlags => {
                let levels = [
                    (caches.icache.enabled, isa_ext::ICACHE),
                    (caches.dcache.enabled, isa_ext::DCACHE),
                    (caches.l2.enabled, isa_ext::L2CACHE),
                    (caches.l3.enabled, isa_ext::L3CACHE),
                    (caches.smem.enabled, isa_ext::SMEM),
                ];
                levels
                    .iter()
                    .filter(|(enabled, _)| *enabled)
                    .fold(isa_ext::TEX | isa_ext::RASTER | isa_ext::ROP, |acc, (_, bit)| {
                        acc | bit
                    })
            }
        };
        Ok(value)
    }

    fn copy_to_dev(&mut self, addr: u64, data: &[u8]) -> Result<(), DeviceError> {
        let size = data.len();
        let end = addr
            .checked_add(size as u64)
            .ok_or(DeviceError::OutOfRange { addr, size })?;
        let overlaps_csr = addr < self.csr_region_end() && end > IO_CSR_ADDR;
        let mut mem = self
            .mem
            .write()
            .map_err(|_| DeviceError::Memory(anyhow::anyhow!("memory lock poisoned")))?;
        if end > mem.size() || overlaps_csr {
            warn!("rejecting copy of {} bytes to {:#x}", size, addr);
            return Err(DeviceError::OutOfRange { addr, size });
        }
        mem.write(addr, data).map_err(DeviceError::Memory)?;
        debug!("copied {} bytes to {:#x}", size, addr);
        Ok(())
    }

    fn copy_from_dev(&self, addr: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let size = buf.len();
        let end = addr
            .checked_add(size as u64)
            .ok_or(DeviceError::OutOfRange { addr, size })?;
        let csr_end = self.csr_region_end();
        if addr >= IO_CSR_ADDR && end <= csr_end {
            return self.copy_from_csr(addr, buf);
        }
        if addr < csr_end && end > IO_CSR_ADDR {
            return Err(DeviceError::OutOfRange { addr, size });
        }
        let mem = self
            .mem
            .read()
            .map_err(|_| DeviceError::Memory(anyhow::anyhow!("memory lock poisoned")))?;
        if end > mem.size() {
            return Err(DeviceError::OutOfRange { addr, size });
        }
        mem.read(addr, buf).map_err(DeviceError::Memory)
    }

    fn dcr_write(&mut self, addr: u32, value: u32) -> Result<(), DeviceError> {
        self.processor.dcrs_mut().write(addr, value)?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.processor.launch()?;
        self.launched = true;
        Ok(())
    }

    fn wait(&mut self, budget: u64) -> Result<RunOutcome, DeviceError> {
        let outcome = self.processor.run(budget);
        if outcome == RunOutcome::BudgetExhausted {
            warn!("kernel still running after {} cycles", self.processor.cycle());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::arch::Arch;
    use crate::sim::perf::csr;

    fn device() -> SimDevice {
        SimDevice::new(ProcessorConfig::new(Arch::new(4, 2, 2, 1).unwrap()))
    }

    #[test]
    fn caps_report_topology() {
        let dev = device();
        assert_eq!(dev.dev_caps(DeviceCap::NumCores as u32).unwrap(), 2);
        assert_eq!(dev.dev_caps(DeviceCap::NumThreads as u32).unwrap(), 4);
        assert_eq!(dev.dev_caps(DeviceCap::KernelBaseAddr as u32).unwrap(), STARTUP_ADDR);
        let flags = dev.dev_caps(DeviceCap::IsaFlags as u32).unwrap();
        assert_ne!(flags & isa_ext::SMEM, 0);
        let err = dev.dev_caps(99).unwrap_err();
        assert!(matches!(err, DeviceError::UnknownCap(99)));
        assert_ne!(err.code(), 0);
    }

    #[test]
    fn out_of_range_copy_writes_nothing() {
        let mut dev = device();
        let size = dev.dev_caps(DeviceCap::GlobalMemSize as u32).unwrap();
        let err = dev.copy_to_dev(size - 4, &[1; 8]).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfRange { .. }));
        assert_eq!(dev.mem.read().unwrap().resident_pages(), 0);
        assert!(dev.copy_to_dev(IO_CSR_ADDR, &[0; 4]).is_err());
    }

    #[test]
    fn memory_round_trips_through_host_copies() {
        let mut dev = device();
        dev.copy_to_dev(0x1000, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        dev.copy_from_dev(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn csr_region_requires_a_launch() {
        let dev = device();
        let mut buf = [0u8; 256];
        let err = dev.copy_from_dev(IO_CSR_ADDR, &mut buf).unwrap_err();
        assert!(matches!(err, DeviceError::CsrUninitialized));
    }

    #[test]
    fn csr_region_exposes_counters_per_core() {
        let mut dev = device();
        dev.dcr_write(crate::sim::dcrs::DCR_BASE_STARTUP_ADDR0, STARTUP_ADDR as u32)
            .unwrap();
        dev.dcr_write(crate::sim::dcrs::DCR_BASE_STARTUP_ADDR1, 0).unwrap();
        dev.start().unwrap();
        dev.processor().perf().core(1).instrs.add(42);

        let mut buf = [0u8; 256];
        dev.copy_from_dev(IO_CSR_ADDR + CSR_REGION_SIZE, &mut buf).unwrap();
        let offset = (csr::MINSTRET - csr::MPM_BASE) as usize * 4;
        assert_eq!(buf[offset], 42);
    }

    #[test]
    #[should_panic(expected = "fatal DCR write")]
    fn unmapped_dcr_write_aborts_the_run() {
        let mut dev = device();
        let _ = dev.dcr_write(0xfff, 1);
    }

    #[test]
    fn invalid_tex_stage_is_reported() {
        let mut dev = device();
        let err = dev
            .dcr_write(crate::sim::dcrs::DCR_TEX_STAGE, crate::sim::dcrs::NUM_TEX_STAGES as u32)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Dcr(DcrError::InvalidStage(_))));
        assert_eq!(err.code(), -7);
    }
}
