use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::sim::dcrs::*;
use crate::sim::device::{Device, DeviceCap, DeviceError, STARTUP_ADDR};

/// Copy a raw kernel image to the device's kernel base address.
pub fn upload_kernel_bytes(dev: &mut impl Device, content: &[u8]) -> Result<(), DeviceError> {
    if content.is_empty() {
        return Err(DeviceError::EmptyContent);
    }
    let base = dev.dev_caps(DeviceCap::KernelBaseAddr as u32)?;
    dev.copy_to_dev(base, content)?;
    info!("uploaded {} byte kernel to {:#x}", content.len(), base);
    Ok(())
}

pub fn upload_kernel_file(dev: &mut impl Device, path: &Path) -> Result<(), DeviceError> {
    let content = fs::read(path).map_err(|err| {
        warn!("cannot read kernel {}: {}", path.display(), err);
        err
    })?;
    upload_kernel_bytes(dev, &content)
}

/// Program the startup address, select no counter class, and zero every graphics state.
pub fn dcr_initialize(dev: &mut impl Device) -> Result<(), DeviceError> {
    dev.dcr_write(DCR_BASE_STARTUP_ADDR0, STARTUP_ADDR as u32)?;
    dev.dcr_write(DCR_BASE_STARTUP_ADDR1, (STARTUP_ADDR >> 32) as u32)?;
    dev.dcr_write(DCR_BASE_MPM_CLASS, 0)?;

    for i in 0..DCR_RASTER_STATE_COUNT as u32 {
        dev.dcr_write(DCR_RASTER_STATE_BEGIN + i, 0)?;
    }
    for i in 0..DCR_ROP_STATE_COUNT as u32 {
        dev.dcr_write(DCR_ROP_STATE_BEGIN + i, 0)?;
    }
    for stage in 0..NUM_TEX_STAGES as u32 {
        dev.dcr_write(DCR_TEX_STAGE, stage)?;
        for i in 1..DCR_TEX_STATE_COUNT as u32 {
            dev.dcr_write(DCR_TEX_STATE_BEGIN + i, 0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::arch::Arch;
    use crate::sim::device::SimDevice;
    use crate::sim::top::ProcessorConfig;

    fn device() -> SimDevice {
        SimDevice::new(ProcessorConfig::new(Arch::new(4, 2, 1, 1).unwrap()))
    }

    #[test]
    fn initialize_programs_every_bank() {
        let mut dev = device();
        dcr_initialize(&mut dev).unwrap();
        let dcrs = dev.processor().dcrs();
        assert_eq!(dcrs.base.startup_addr().unwrap(), STARTUP_ADDR);
        assert_eq!(dcrs.rop.read(DCR_ROP_BLEND_CONST).unwrap(), 0);
        assert_eq!(dcrs.tex.read_stage(1, DCR_TEX_FILTER).unwrap(), 0);
    }

    #[test]
    fn uploaded_kernel_lands_at_base() {
        let mut dev = device();
        upload_kernel_bytes(&mut dev, &[0xaa, 0xbb]).unwrap();
        let mut buf = [0u8; 2];
        dev.copy_from_dev(STARTUP_ADDR, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xbb]);
    }
}
