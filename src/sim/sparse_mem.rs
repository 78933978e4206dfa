use std::collections::HashMap;

use crate::base::mem::HasMemory;

const PAGE_BITS: u64 = 12;
const PAGE_SIZE: usize = 1 << PAGE_BITS;

// a sparse memory that reads anything never written as 0
#[derive(Debug)]
pub struct SparseMemory {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE]>>,
    size: u64,
}

impl SparseMemory {
    pub fn new(size: u64) -> Self {
        Self {
            pages: HashMap::new(),
            size,
        }
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}

impl HasMemory for SparseMemory {
    fn read_impl(&self, addr: u64, buf: &mut [u8]) -> Result<(), anyhow::Error> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let a = addr + i as u64;
            *byte = self
                .pages
                .get(&(a >> PAGE_BITS))
                .map_or(0, |page| page[(a as usize) & (PAGE_SIZE - 1)]);
        }
        Ok(())
    }

    fn write_impl(&mut self, addr: u64, data: &[u8]) -> Result<(), anyhow::Error> {
        for (i, byte) in data.iter().enumerate() {
            let a = addr + i as u64;
            let page = self
                .pages
                .entry(a >> PAGE_BITS)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[(a as usize) & (PAGE_SIZE - 1)] = *byte;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_bytes_read_as_zero() {
        let mem = SparseMemory::new(1 << 20);
        assert_eq!(mem.read_n::<4>(0x100).unwrap(), [0; 4]);
        assert_eq!(mem.resident_pages(), 0);
    }

    #[test]
    fn writes_span_pages() {
        let mut mem = SparseMemory::new(1 << 20);
        let data: Vec<u8> = (0..16).collect();
        mem.write(0xff8, &data).unwrap();
        let mut buf = [0u8; 16];
        mem.read(0xff8, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[..]);
        assert_eq!(mem.resident_pages(), 2);
    }

    #[test]
    fn out_of_range_write_touches_nothing() {
        let mut mem = SparseMemory::new(0x1000);
        assert!(mem.write(0xffc, &[1, 2, 3, 4, 5, 6, 7, 8]).is_err());
        assert_eq!(mem.resident_pages(), 0);
    }
}
