//! Instruction encoding understood by the timing model.
//!
//! Only what matters for timing is encoded: the execution class, the registers that create
//! hazards, per-thread address patterns of memory accesses, and the warp-control operands. Every
//! instruction is one little-endian 64-bit word and the PC advances by 8.
//!
//! ```text
//!  63            32 31    24 23    16 15     8 7      0
//! |     imm32      |  rs2   |  rs1   |   rd   | opcode |   ALU / FPU / TEX / RASTER / ROP
//! |     base       | stride |  rs1   |   rd   | opcode |   LOAD
//! |     base       | stride |  rs1   |  rs2   | opcode |   STORE
//! |  offset24  |        then-mask (32)         | opcode |   SPLIT
//! |  offset24  |                               | opcode |   JUMP
//! |                |     count       |   id   | opcode |   BAR
//! ```

use std::fmt;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

pub const INSTR_BYTES: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Opcode {
    Alu = 0x01,
    Fpu = 0x02,
    Load = 0x03,
    Store = 0x04,
    Fence = 0x05,
    Split = 0x06,
    Join = 0x07,
    Jump = 0x08,
    Bar = 0x09,
    Tex = 0x0A,
    Raster = 0x0B,
    Rop = 0x0C,
    Halt = 0x0D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum AluOp {
    Arith = 0,
    Mul = 1,
    Div = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum GfxKind {
    Tex = 0,
    Raster = 1,
    Rop = 2,
}

/// Execution unit an instruction is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExeType {
    Alu,
    Fpu,
    Lsu,
    Sfu,
}

impl ExeType {
    pub const ALL: [ExeType; 4] = [ExeType::Alu, ExeType::Fpu, ExeType::Lsu, ExeType::Sfu];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Architectural register: 0..32 are integer registers, 32..64 are floating point.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(u8);

impl Reg {
    pub const ZERO: Reg = Reg(0);
    pub const COUNT: usize = 64;

    pub const fn x(index: u8) -> Reg {
        Reg(index & 0x1f)
    }

    pub const fn f(index: u8) -> Reg {
        Reg(0x20 | (index & 0x1f))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_float(self) -> bool {
        self.0 & 0x20 != 0
    }

    /// x0 is hardwired and never creates a hazard.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    fn from_field(field: u64) -> Result<Reg, DecodeError> {
        let index = (field & 0xff) as u8;
        if index as usize >= Reg::COUNT {
            return Err(DecodeError::InvalidRegister(index));
        }
        Ok(Reg(index))
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_float() {
            write!(f, "f{}", self.0 & 0x1f)
        } else {
            write!(f, "x{}", self.0)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("unknown sub-operation {0}")]
    UnknownSubOp(u8),
    #[error("register index {0} out of range")]
    InvalidRegister(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Alu { op: AluOp, rd: Reg, rs1: Reg, rs2: Reg },
    Fpu { rd: Reg, rs1: Reg, rs2: Reg },
    /// Thread `t` reads the word at `base + t * stride`.
    Load { rd: Reg, rs1: Reg, base: u32, stride: u8 },
    Store { rs1: Reg, rs2: Reg, base: u32, stride: u8 },
    Fence,
    /// Threads in `then_mask` continue at pc + 8, the rest at pc + 8 * else_offset.
    ///
    /// A two-sided region is laid out as `SPLIT; then; JOIN; JUMP end; else; JOIN` with `end`
    /// right after the second JOIN (see [`KernelBuilder::if_else`]). A divergent warp never
    /// reaches the JUMP because the first JOIN sends it to the else block. A warp whose threads
    /// all took the then path reconverges at the JUMP and skips the else block.
    Split { then_mask: u32, else_offset: i32 },
    Join,
    Jump { offset: i32 },
    Bar { id: u8, count: u16 },
    Gfx { kind: GfxKind, rd: Reg, rs1: Reg, rs2: Reg },
    Halt,
}

fn field(word: u64, lo: u32, bits: u32) -> u64 {
    (word >> lo) & ((1u64 << bits) - 1)
}

fn sign_extend_24(value: u64) -> i32 {
    ((value as u32) << 8) as i32 >> 8
}

fn offset_field(offset: i32) -> u64 {
    ((offset as u32) & 0x00ff_ffff) as u64
}

fn three_reg(word: u64) -> Result<(Reg, Reg, Reg), DecodeError> {
    Ok((
        Reg::from_field(field(word, 8, 8))?,
        Reg::from_field(field(word, 16, 8))?,
        Reg::from_field(field(word, 24, 8))?,
    ))
}

pub fn decode(word: u64) -> Result<Instr, DecodeError> {
    let raw = field(word, 0, 8) as u8;
    let opcode = Opcode::from_u8(raw).ok_or(DecodeError::UnknownOpcode(raw))?;
    let instr = match opcode {
        Opcode::Alu => {
            let (rd, rs1, rs2) = three_reg(word)?;
            let sub = field(word, 32, 8) as u8;
            let op = AluOp::from_u8(sub).ok_or(DecodeError::UnknownSubOp(sub))?;
            Instr::Alu { op, rd, rs1, rs2 }
        }
        Opcode::Fpu => {
            let (rd, rs1, rs2) = three_reg(word)?;
            Instr::Fpu { rd, rs1, rs2 }
        }
        Opcode::Load => Instr::Load {
            rd: Reg::from_field(field(word, 8, 8))?,
            rs1: Reg::from_field(field(word, 16, 8))?,
            stride: field(word, 24, 8) as u8,
            base: field(word, 32, 32) as u32,
        },
        Opcode::Store => Instr::Store {
            rs2: Reg::from_field(field(word, 8, 8))?,
            rs1: Reg::from_field(field(word, 16, 8))?,
            stride: field(word, 24, 8) as u8,
            base: field(word, 32, 32) as u32,
        },
        Opcode::Fence => Instr::Fence,
        Opcode::Split => Instr::Split {
            then_mask: field(word, 8, 32) as u32,
            else_offset: sign_extend_24(field(word, 40, 24)),
        },
        Opcode::Join => Instr::Join,
        Opcode::Jump => Instr::Jump {
            offset: sign_extend_24(field(word, 40, 24)),
        },
        Opcode::Bar => Instr::Bar {
            id: field(word, 8, 8) as u8,
            count: field(word, 16, 16) as u16,
        },
        Opcode::Tex | Opcode::Raster | Opcode::Rop => {
            let (rd, rs1, rs2) = three_reg(word)?;
            let kind = match opcode {
                Opcode::Tex => GfxKind::Tex,
                Opcode::Raster => GfxKind::Raster,
                _ => GfxKind::Rop,
            };
            Instr::Gfx { kind, rd, rs1, rs2 }
        }
        Opcode::Halt => Instr::Halt,
    };
    Ok(instr)
}

impl Instr {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instr::Alu { .. } => Opcode::Alu,
            Instr::Fpu { .. } => Opcode::Fpu,
            Instr::Load { .. } => Opcode::Load,
            Instr::Store { .. } => Opcode::Store,
            Instr::Fence => Opcode::Fence,
            Instr::Split { .. } => Opcode::Split,
            Instr::Join => Opcode::Join,
            Instr::Jump { .. } => Opcode::Jump,
            Instr::Bar { .. } => Opcode::Bar,
            Instr::Gfx { kind: GfxKind::Tex, .. } => Opcode::Tex,
            Instr::Gfx { kind: GfxKind::Raster, .. } => Opcode::Raster,
            Instr::Gfx { kind: GfxKind::Rop, .. } => Opcode::Rop,
            Instr::Halt => Opcode::Halt,
        }
    }

    pub fn encode(&self) -> u64 {
        let regs = |a: Reg, b: Reg, c: Reg| {
            ((a.0 as u64) << 8) | ((b.0 as u64) << 16) | ((c.0 as u64) << 24)
        };
        let body = match *self {
            Instr::Alu { op, rd, rs1, rs2 } => regs(rd, rs1, rs2) | ((op as u64) << 32),
            Instr::Fpu { rd, rs1, rs2 } | Instr::Gfx { rd, rs1, rs2, .. } => regs(rd, rs1, rs2),
            Instr::Load { rd, rs1, base, stride } => {
                ((rd.0 as u64) << 8)
                    | ((rs1.0 as u64) << 16)
                    | ((stride as u64) << 24)
                    | ((base as u64) << 32)
            }
            Instr::Store { rs1, rs2, base, stride } => {
                ((rs2.0 as u64) << 8)
                    | ((rs1.0 as u64) << 16)
                    | ((stride as u64) << 24)
                    | ((base as u64) << 32)
            }
            Instr::Split { then_mask, else_offset } => {
                ((then_mask as u64) << 8) | (offset_field(else_offset) << 40)
            }
            Instr::Jump { offset } => offset_field(offset) << 40,
            Instr::Bar { id, count } => ((id as u64) << 8) | ((count as u64) << 16),
            Instr::Fence | Instr::Join | Instr::Halt => 0,
        };
        body | self.opcode() as u64
    }

    pub fn exe_type(&self) -> ExeType {
        match self {
            Instr::Alu { .. } => ExeType::Alu,
            Instr::Fpu { .. } => ExeType::Fpu,
            Instr::Load { .. } | Instr::Store { .. } | Instr::Fence => ExeType::Lsu,
            Instr::Split { .. }
            | Instr::Join
            | Instr::Jump { .. }
            | Instr::Bar { .. }
            | Instr::Gfx { .. }
            | Instr::Halt => ExeType::Sfu,
        }
    }

    /// Destination register, if the instruction writes one that can create a hazard.
    pub fn rd(&self) -> Option<Reg> {
        let rd = match *self {
            Instr::Alu { rd, .. }
            | Instr::Fpu { rd, .. }
            | Instr::Load { rd, .. }
            | Instr::Gfx { rd, .. } => rd,
            _ => return None,
        };
        (!rd.is_zero()).then_some(rd)
    }

    pub fn rs(&self) -> [Option<Reg>; 2] {
        let nonzero = |r: Reg| (!r.is_zero()).then_some(r);
        match *self {
            Instr::Alu { rs1, rs2, .. }
            | Instr::Fpu { rs1, rs2, .. }
            | Instr::Store { rs1, rs2, .. }
            | Instr::Gfx { rs1, rs2, .. } => [nonzero(rs1), nonzero(rs2)],
            Instr::Load { rs1, .. } => [nonzero(rs1), None],
            _ => [None, None],
        }
    }

    /// Warp-control instructions redirect the warp, so it stops fetching until they commit.
    pub fn is_warp_control(&self) -> bool {
        matches!(
            self,
            Instr::Split { .. } | Instr::Join | Instr::Jump { .. } | Instr::Bar { .. } | Instr::Halt
        )
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Instr::Load { .. } | Instr::Store { .. })
    }
}

/// Assembles instruction streams into kernel images.
#[derive(Debug, Default, Clone)]
pub struct KernelBuilder {
    instrs: Vec<Instr>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instr: Instr) -> &mut Self {
        self.instrs.push(instr);
        self
    }

    /// Index the next pushed instruction will get.
    pub fn here(&self) -> usize {
        self.instrs.len()
    }

    /// Rewrite the offset of a previously pushed SPLIT or JUMP so it lands on `target`.
    pub fn patch_target(&mut self, at: usize, target: usize) -> &mut Self {
        let offset = target as i32 - at as i32;
        match &mut self.instrs[at] {
            Instr::Split { else_offset, .. } => *else_offset = offset,
            Instr::Jump { offset: o } => *o = offset,
            other => panic!("cannot patch a branch target into {other:?}"),
        }
        self
    }

    /// Emit a two-sided SPLIT region. Threads in `then_mask` run `then`, the others run
    /// `otherwise`, and all of them continue after the region with their original mask.
    pub fn if_else(
        &mut self,
        then_mask: u32,
        then: impl FnOnce(&mut Self),
        otherwise: impl FnOnce(&mut Self),
    ) -> &mut Self {
        let split = self.here();
        self.push(Instr::Split {
            then_mask,
            else_offset: 0,
        });
        then(self);
        self.push(Instr::Join);
        let skip = self.here();
        self.push(Instr::Jump { offset: 0 });
        let else_block = self.here();
        otherwise(self);
        self.push(Instr::Join);
        let end = self.here();
        self.patch_target(split, else_block).patch_target(skip, end)
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn build(&self) -> Vec<u8> {
        self.instrs
            .iter()
            .flat_map(|instr| instr.encode().to_le_bytes())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_unknown_opcode() {
        assert_eq!(decode(0xff), Err(DecodeError::UnknownOpcode(0xff)));
        assert_eq!(decode(0), Err(DecodeError::UnknownOpcode(0)));
    }

    #[test]
    fn negative_offsets_survive_encoding() {
        let jump = Instr::Jump { offset: -3 };
        assert_eq!(decode(jump.encode()), Ok(jump));
        let split = Instr::Split {
            then_mask: 0b0011,
            else_offset: 5,
        };
        assert_eq!(decode(split.encode()), Ok(split));
    }

    #[test]
    fn load_fields() {
        let load = Instr::Load {
            rd: Reg::x(5),
            rs1: Reg::x(2),
            base: 0x8000_1000,
            stride: 4,
        };
        let decoded = decode(load.encode()).unwrap();
        assert_eq!(decoded, load);
        assert_eq!(decoded.exe_type(), ExeType::Lsu);
        assert_eq!(decoded.rd(), Some(Reg::x(5)));
        assert_eq!(decoded.rs(), [Some(Reg::x(2)), None]);
    }

    #[test]
    fn x0_never_creates_hazards() {
        let alu = Instr::Alu {
            op: AluOp::Arith,
            rd: Reg::ZERO,
            rs1: Reg::ZERO,
            rs2: Reg::f(1),
        };
        assert_eq!(alu.rd(), None);
        assert_eq!(alu.rs(), [None, Some(Reg::f(1))]);
    }

    #[test]
    fn builder_patches_targets() {
        let mut kb = KernelBuilder::new();
        let split = kb.here();
        kb.push(Instr::Split {
            then_mask: 1,
            else_offset: 0,
        });
        kb.push(Instr::Halt).push(Instr::Halt);
        kb.patch_target(split, 2);
        assert_eq!(
            kb.instrs()[0],
            Instr::Split {
                then_mask: 1,
                else_offset: 2
            }
        );
        assert_eq!(kb.build().len(), 24);
    }

    #[test]
    fn if_else_places_skip_jump_after_then_join() {
        let mut kb = KernelBuilder::new();
        kb.if_else(
            0b01,
            |kb| {
                kb.push(Instr::Fence);
            },
            |kb| {
                kb.push(Instr::Fence).push(Instr::Fence);
            },
        );
        assert_eq!(
            kb.instrs(),
            &[
                Instr::Split {
                    then_mask: 0b01,
                    else_offset: 4
                },
                Instr::Fence,
                Instr::Join,
                Instr::Jump { offset: 4 },
                Instr::Fence,
                Instr::Fence,
                Instr::Join,
            ]
        );
    }
}
