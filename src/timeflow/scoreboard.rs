use crate::timeflow::isa::{Instr, Reg};

/// Pending writer of every register, per warp. Issue reserves the destination, writeback
/// releases it; an instruction may issue only when none of its registers has a pending writer.
#[derive(Debug, Clone)]
pub struct Scoreboard {
    pending: Vec<[Option<u64>; Reg::COUNT]>,
}

impl Scoreboard {
    pub fn new(num_warps: usize) -> Self {
        Self {
            pending: vec![[None; Reg::COUNT]; num_warps],
        }
    }

    pub fn in_use(&self, wid: usize, instr: &Instr) -> bool {
        let regs = &self.pending[wid];
        instr
            .rd()
            .into_iter()
            .chain(instr.rs().into_iter().flatten())
            .any(|reg| regs[reg.index()].is_some())
    }

    pub fn pending_writer(&self, wid: usize, reg: Reg) -> Option<u64> {
        self.pending[wid][reg.index()]
    }

    pub fn reserve(&mut self, wid: usize, instr: &Instr, uid: u64) {
        if let Some(rd) = instr.rd() {
            debug_assert!(self.pending[wid][rd.index()].is_none(), "{rd:?} reserved twice");
            self.pending[wid][rd.index()] = Some(uid);
        }
    }

    /// Clear the destination of `uid`; a later writer of the same register keeps its claim.
    pub fn release(&mut self, wid: usize, instr: &Instr, uid: u64) {
        if let Some(rd) = instr.rd() {
            let slot = &mut self.pending[wid][rd.index()];
            if *slot == Some(uid) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        for regs in &mut self.pending {
            *regs = [None; Reg::COUNT];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeflow::isa::AluOp;

    fn add(rd: Reg, rs1: Reg, rs2: Reg) -> Instr {
        Instr::Alu {
            op: AluOp::Arith,
            rd,
            rs1,
            rs2,
        }
    }

    #[test]
    fn raw_and_waw_hazards_block() {
        let mut sb = Scoreboard::new(2);
        let producer = add(Reg::x(3), Reg::x(1), Reg::x(2));
        sb.reserve(0, &producer, 7);

        assert!(sb.in_use(0, &add(Reg::x(4), Reg::x(3), Reg::x(1))));
        assert!(sb.in_use(0, &add(Reg::x(3), Reg::x(5), Reg::x(6))));
        assert!(!sb.in_use(0, &add(Reg::x(4), Reg::x(5), Reg::x(6))));
        // other warps have their own registers
        assert!(!sb.in_use(1, &add(Reg::x(4), Reg::x(3), Reg::x(1))));

        sb.release(0, &producer, 7);
        assert!(!sb.in_use(0, &add(Reg::x(4), Reg::x(3), Reg::x(1))));
    }

    #[test]
    fn int_and_float_files_are_separate() {
        let mut sb = Scoreboard::new(1);
        sb.reserve(0, &Instr::Fpu { rd: Reg::f(3), rs1: Reg::f(1), rs2: Reg::f(2) }, 1);
        assert_eq!(sb.pending_writer(0, Reg::f(3)), Some(1));
        assert!(!sb.in_use(0, &add(Reg::x(4), Reg::x(3), Reg::x(3))));
    }

    #[test]
    fn stale_release_is_ignored() {
        let mut sb = Scoreboard::new(1);
        let instr = add(Reg::x(3), Reg::x(1), Reg::x(2));
        sb.reserve(0, &instr, 1);
        sb.release(0, &instr, 0);
        assert_eq!(sb.pending_writer(0, Reg::x(3)), Some(1));
    }
}
