/// Memory request travelling down the hierarchy. `tag` is chosen by the requester and echoed
/// back in the matching response; caches use the line base address as the tag of their fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemReq {
    pub addr: u64,
    pub write: bool,
    pub tag: u64,
    pub size: u32,
}

impl MemReq {
    pub fn read(addr: u64, tag: u64, size: u32) -> Self {
        Self {
            addr,
            write: false,
            tag,
            size,
        }
    }

    pub fn write(addr: u64, tag: u64, size: u32) -> Self {
        Self {
            addr,
            write: true,
            tag,
            size,
        }
    }
}

/// Only reads are answered; writes retire silently once accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRsp {
    pub addr: u64,
    pub tag: u64,
}

impl MemRsp {
    pub fn for_request(req: &MemReq) -> Self {
        Self {
            addr: req.addr,
            tag: req.tag,
        }
    }
}
