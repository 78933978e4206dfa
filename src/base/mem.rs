use anyhow::bail;

/// Trait for simulated backing stores.
pub trait HasMemory {
    fn read_impl(&self, addr: u64, buf: &mut [u8]) -> Result<(), anyhow::Error>;
    fn write_impl(&mut self, addr: u64, data: &[u8]) -> Result<(), anyhow::Error>;

    /// Size of the address space in bytes.
    fn size(&self) -> u64;

    fn check_range(&self, addr: u64, n: usize) -> Result<(), anyhow::Error> {
        let end = addr.checked_add(n as u64);
        match end {
            Some(end) if end <= self.size() => Ok(()),
            _ => bail!(
                "access of {} bytes @ {:#x} outside of {:#x}-byte address space",
                n,
                addr,
                self.size()
            ),
        }
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), anyhow::Error> {
        self.check_range(addr, buf.len())?;
        self.read_impl(addr, buf)
    }

    fn read_n<const N: usize>(&self, addr: u64) -> Result<[u8; N], anyhow::Error> {
        let mut buf = [0u8; N];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    fn read_u64(&self, addr: u64) -> Result<u64, anyhow::Error> {
        if addr & 0x7 != 0 {
            bail!("unaligned 8-byte read @ {:#x}", addr);
        }
        self.read_n::<8>(addr).map(u64::from_le_bytes)
    }

    /// Either the whole range is written or nothing is.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), anyhow::Error> {
        self.check_range(addr, data.len())?;
        self.write_impl(addr, data)
    }
}
