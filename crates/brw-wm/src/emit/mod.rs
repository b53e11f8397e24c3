//! Hardware instruction model and the backend interface.
//!
//! The allocated value program is translated into [`HwInsn`]s, a close model of the Gen4 EU
//! instruction set (two-source ALU operations, accumulator, flag register, message `SEND`s), and
//! then encoded into fixed 16-byte instructions.

mod encode;
mod gen4;

use std::fmt;

pub use encode::{encode, encode_all};
pub use gen4::Gen4Emitter;

use crate::error::CompileError;
use crate::key::WmProgKey;
use crate::lower::LoweredProgram;
use crate::regalloc::Allocation;

/// Translates an allocated program for one hardware generation.
pub trait CodeEmitter {
    /// Lowers `program` in instruction order.
    fn emit(
        &mut self,
        program: &LoweredProgram,
        alloc: &Allocation,
        key: &WmProgKey,
    ) -> Result<Vec<HwInsn>, CompileError>;

    /// Serializes `insns` into the binary the hardware executes.
    fn encode(&self, insns: &[HwInsn]) -> Vec<u8> {
        encode_all(insns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HwOpcode {
    Mov = 1,
    Sel = 2,
    And = 5,
    Cmp = 16,
    Send = 49,
    Add = 64,
    Mul = 65,
    Frc = 67,
    Rndd = 69,
    Mac = 72,
    Line = 89,
    Nop = 126,
}

impl HwOpcode {
    pub fn name(self) -> &'static str {
        match self {
            HwOpcode::Mov => "mov",
            HwOpcode::Sel => "sel",
            HwOpcode::And => "and",
            HwOpcode::Cmp => "cmp",
            HwOpcode::Send => "send",
            HwOpcode::Add => "add",
            HwOpcode::Mul => "mul",
            HwOpcode::Frc => "frc",
            HwOpcode::Rndd => "rndd",
            HwOpcode::Mac => "mac",
            HwOpcode::Line => "line",
            HwOpcode::Nop => "nop",
        }
    }
}

/// Conditional modifier: sets the flag register from the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CondMod {
    #[default]
    None = 0,
    Eq = 1,
    Ne = 2,
    Gt = 3,
    Ge = 4,
    Lt = 5,
    Le = 6,
}

impl CondMod {
    /// The condition with operands exchanged: `a < b` is the same as `b > a`.
    pub fn swapped(self) -> Self {
        match self {
            CondMod::Gt => CondMod::Lt,
            CondMod::Lt => CondMod::Gt,
            CondMod::Ge => CondMod::Le,
            CondMod::Le => CondMod::Ge,
            other => other,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            CondMod::None => "",
            CondMod::Eq => ".z",
            CondMod::Ne => ".nz",
            CondMod::Gt => ".g",
            CondMod::Ge => ".ge",
            CondMod::Lt => ".l",
            CondMod::Le => ".le",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegType {
    Ud = 0,
    D = 1,
    Uw = 2,
    W = 3,
    F = 7,
}

impl RegType {
    pub fn size(self) -> u32 {
        match self {
            RegType::Ud | RegType::D | RegType::F => 4,
            RegType::Uw | RegType::W => 2,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            RegType::Ud => "UD",
            RegType::D => "D",
            RegType::Uw => "UW",
            RegType::W => "W",
            RegType::F => "F",
        }
    }
}

/// Source region `<vstride; width, hstride>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// `<8;8,1>`: one element per channel.
    Vec8,
    /// `<0;1,0>`: one element broadcast to every channel.
    Scalar,
    /// `<2;4,0>`: each subspan origin repeated across its four pixels.
    Subspan,
}

impl Region {
    pub fn strides(self) -> (u32, u32, u32) {
        match self {
            Region::Vec8 => (8, 8, 1),
            Region::Scalar => (0, 1, 0),
            Region::Subspan => (2, 4, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Imm {
    F(f32),
    Ud(u32),
    /// Eight packed signed 4-bit integers.
    V(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HwReg {
    Grf {
        nr: u8,
        /// Element offset within the register, in units of `ty`.
        subnr: u8,
        ty: RegType,
        region: Region,
    },
    Mrf {
        nr: u8,
        ty: RegType,
    },
    Acc,
    Flag,
    Null,
    Imm(Imm),
}

impl HwReg {
    pub fn grf(nr: u32) -> Self {
        HwReg::Grf {
            nr: nr as u8,
            subnr: 0,
            ty: RegType::F,
            region: Region::Vec8,
        }
    }

    pub fn scalar(nr: u32, subnr: u32) -> Self {
        HwReg::Grf {
            nr: nr as u8,
            subnr: subnr as u8,
            ty: RegType::F,
            region: Region::Scalar,
        }
    }

    pub fn mrf(nr: u32) -> Self {
        HwReg::Mrf {
            nr: nr as u8,
            ty: RegType::F,
        }
    }

    pub fn retype(self, new: RegType) -> Self {
        match self {
            HwReg::Grf {
                nr, subnr, region, ..
            } => HwReg::Grf {
                nr,
                subnr,
                ty: new,
                region,
            },
            HwReg::Mrf { nr, .. } => HwReg::Mrf { nr, ty: new },
            other => other,
        }
    }

    pub fn ty(&self) -> RegType {
        match self {
            HwReg::Grf { ty, .. } | HwReg::Mrf { ty, .. } => *ty,
            HwReg::Imm(Imm::F(_)) | HwReg::Acc | HwReg::Null => RegType::F,
            HwReg::Imm(Imm::Ud(_)) | HwReg::Imm(Imm::V(_)) => RegType::Ud,
            HwReg::Flag => RegType::Uw,
        }
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, HwReg::Imm(_))
    }

    pub fn grf_nr(&self) -> Option<u8> {
        match self {
            HwReg::Grf { nr, .. } => Some(*nr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HwSrc {
    pub reg: HwReg,
    pub negate: bool,
    pub abs: bool,
}

impl HwSrc {
    pub const fn new(reg: HwReg) -> Self {
        Self {
            reg,
            negate: false,
            abs: false,
        }
    }

    pub const fn float(v: f32) -> Self {
        Self::new(HwReg::Imm(Imm::F(v)))
    }

    pub const fn null() -> Self {
        Self::new(HwReg::Null)
    }

    /// Negation; float immediates fold into the value.
    pub fn neg(self) -> Self {
        match self.reg {
            HwReg::Imm(Imm::F(v)) => HwSrc::float(-v),
            _ => Self {
                negate: !self.negate,
                ..self
            },
        }
    }
}

impl From<HwReg> for HwSrc {
    fn from(reg: HwReg) -> Self {
        HwSrc::new(reg)
    }
}

/// Shared functions reachable through `SEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Sfid {
    Math = 1,
    Sampler = 2,
    DataportRead = 4,
    DataportWrite = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MathFunction {
    Inv = 1,
    Log = 2,
    Exp = 3,
    Sqrt = 4,
    Rsq = 5,
    Sin = 6,
    Cos = 7,
    Pow = 10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SampleKind {
    Sample = 0,
    SampleBias = 1,
    SampleCompare = 2,
    SampleBiasCompare = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    Math {
        function: MathFunction,
    },
    Sampler {
        surface: u8,
        sampler: u8,
        kind: SampleKind,
    },
    RenderTarget {
        surface: u8,
        eot: bool,
    },
    ScratchRead {
        /// Offset in 32-byte units.
        offset: u32,
    },
    ScratchWrite {
        offset: u32,
    },
}

impl Message {
    pub fn sfid(&self) -> Sfid {
        match self {
            Message::Math { .. } => Sfid::Math,
            Message::Sampler { .. } => Sfid::Sampler,
            Message::ScratchRead { .. } => Sfid::DataportRead,
            Message::RenderTarget { .. } | Message::ScratchWrite { .. } => Sfid::DataportWrite,
        }
    }

    pub fn eot(&self) -> bool {
        matches!(self, Message::RenderTarget { eot: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendInfo {
    pub message: Message,
    /// Message registers sent, starting at the `SEND`'s source.
    pub mlen: u8,
    /// Registers written back to the destination.
    pub rlen: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HwInsn {
    pub opcode: HwOpcode,
    pub dst: HwReg,
    pub src: [HwSrc; 2],
    pub saturate: bool,
    pub cond: CondMod,
    /// Executes only where the flag register is set (or clear, with `pred_inverse`).
    pub predicated: bool,
    pub pred_inverse: bool,
    /// Result also written to the accumulator.
    pub acc_write: bool,
    pub send: Option<SendInfo>,
}

impl HwInsn {
    pub fn new(opcode: HwOpcode, dst: HwReg, src0: HwSrc, src1: HwSrc) -> Self {
        Self {
            opcode,
            dst,
            src: [src0, src1],
            saturate: false,
            cond: CondMod::None,
            predicated: false,
            pred_inverse: false,
            acc_write: false,
            send: None,
        }
    }

    pub fn nr_src(&self) -> usize {
        match self.opcode {
            HwOpcode::Mov | HwOpcode::Frc | HwOpcode::Rndd | HwOpcode::Send => 1,
            HwOpcode::Nop => 0,
            _ => 2,
        }
    }
}

struct RegDisplay<'a>(&'a HwReg, bool);

impl fmt::Display for RegDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let is_src = self.1;
        match *self.0 {
            HwReg::Grf {
                nr,
                subnr,
                ty,
                region,
            } => {
                write!(f, "g{nr}")?;
                if subnr != 0 {
                    write!(f, ".{subnr}")?;
                }
                if is_src {
                    let (v, w, h) = region.strides();
                    write!(f, "<{v};{w},{h}>")?;
                } else {
                    f.write_str("<1>")?;
                }
                f.write_str(ty.suffix())
            }
            HwReg::Mrf { nr, ty } => write!(f, "m{nr}<1>{}", ty.suffix()),
            HwReg::Acc => f.write_str("acc0"),
            HwReg::Flag => f.write_str("f0.0"),
            HwReg::Null => f.write_str("null"),
            HwReg::Imm(Imm::F(v)) => write!(f, "{v:?}F"),
            HwReg::Imm(Imm::Ud(v)) => write!(f, "0x{v:08x}UD"),
            HwReg::Imm(Imm::V(v)) => write!(f, "0x{v:08x}V"),
        }
    }
}

impl fmt::Display for HwSrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            f.write_str("-")?;
        }
        if self.abs {
            f.write_str("(abs)")?;
        }
        RegDisplay(&self.reg, true).fmt(f)
    }
}

impl fmt::Display for HwInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.predicated {
            f.write_str(if self.pred_inverse { "(-f0) " } else { "(+f0) " })?;
        }
        f.write_str(self.opcode.name())?;
        if self.saturate {
            f.write_str(".sat")?;
        }
        f.write_str(self.cond.suffix())?;
        write!(f, "(8) {}", RegDisplay(&self.dst, false))?;
        for src in &self.src[..self.nr_src()] {
            write!(f, " {src}")?;
        }
        if let Some(send) = &self.send {
            write!(f, " {:?} mlen {} rlen {}", send.message, send.mlen, send.rlen)?;
        }
        if self.acc_write {
            f.write_str(" { AccWrEnable }")?;
        }
        Ok(())
    }
}

/// One instruction per line, prefixed with its index.
pub fn disassemble(insns: &[HwInsn]) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    for (i, insn) in insns.iter().enumerate() {
        let _ = writeln!(out, "{i:4}: {insn}");
    }
    out
}
