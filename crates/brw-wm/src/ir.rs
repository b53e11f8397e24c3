//! Expanded instruction list produced by the expansion pass.

use std::fmt::{self, Write as _};

use crate::opcode::Opcode;
use crate::program::{DstReg, SrcReg, TexTarget};

/// Operations the Gen4 backend knows how to lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WmOp {
    Mov,
    Add,
    Mul,
    Mad,
    Lrp,
    Cmp,
    Min,
    Max,
    Dp3,
    Dp4,
    Dph,
    Xpd,
    Rcp,
    Rsq,
    Ex2,
    Lg2,
    Pow,
    Sin,
    Cos,
    /// `x = cos(a)`, `y = sin(a)`.
    Scs,
    Flr,
    Frc,
    Seq,
    Sne,
    Slt,
    Sle,
    Sgt,
    Sge,
    /// The `y`/`z` half of LIT; `x`/`w` are expanded to literal moves.
    Lit,
    Kil,
    Tex,
    Txb,
    Ddx,
    Ddy,
    PixelXy,
    DeltaXy,
    PixelW,
    Linterp,
    Pinterp,
    Cinterp,
    WposXy,
    FbWrite,
}

impl WmOp {
    /// Validates an opcode that has a direct hardware lowering.
    ///
    /// Opcodes the expansion pass always rewrites (ABS, SUB, SWZ, DST, TXP, NRM*, END, PRINT)
    /// and unknown opcodes have none.
    pub fn from_opcode(op: Opcode) -> Option<WmOp> {
        use Opcode as O;
        let wm = match op {
            O::Mov => WmOp::Mov,
            O::Add => WmOp::Add,
            O::Mul => WmOp::Mul,
            O::Mad => WmOp::Mad,
            O::Lrp => WmOp::Lrp,
            O::Cmp => WmOp::Cmp,
            O::Min => WmOp::Min,
            O::Max => WmOp::Max,
            O::Dp3 => WmOp::Dp3,
            O::Dp4 => WmOp::Dp4,
            O::Dph => WmOp::Dph,
            O::Xpd => WmOp::Xpd,
            O::Rcp => WmOp::Rcp,
            O::Rsq => WmOp::Rsq,
            O::Ex2 => WmOp::Ex2,
            O::Lg2 => WmOp::Lg2,
            O::Pow => WmOp::Pow,
            O::Sin => WmOp::Sin,
            O::Cos => WmOp::Cos,
            O::Scs => WmOp::Scs,
            O::Flr => WmOp::Flr,
            O::Frc => WmOp::Frc,
            O::Seq => WmOp::Seq,
            O::Sne => WmOp::Sne,
            O::Slt => WmOp::Slt,
            O::Sle => WmOp::Sle,
            O::Sgt => WmOp::Sgt,
            O::Sge => WmOp::Sge,
            O::Lit => WmOp::Lit,
            O::Kil => WmOp::Kil,
            O::Tex => WmOp::Tex,
            O::Txb => WmOp::Txb,
            O::Ddx => WmOp::Ddx,
            O::Ddy => WmOp::Ddy,
            O::PixelXy => WmOp::PixelXy,
            O::DeltaXy => WmOp::DeltaXy,
            O::PixelW => WmOp::PixelW,
            O::Linterp => WmOp::Linterp,
            O::Pinterp => WmOp::Pinterp,
            O::Cinterp => WmOp::Cinterp,
            O::WposXy => WmOp::WposXy,
            O::FbWrite => WmOp::FbWrite,
            O::Abs
            | O::Sub
            | O::Swz
            | O::Dst
            | O::Txp
            | O::Nrm3
            | O::Nrm4
            | O::End
            | O::Print
            | O::Unknown(_) => return None,
        };
        Some(wm)
    }

    pub fn opcode(self) -> Opcode {
        use Opcode as O;
        match self {
            WmOp::Mov => O::Mov,
            WmOp::Add => O::Add,
            WmOp::Mul => O::Mul,
            WmOp::Mad => O::Mad,
            WmOp::Lrp => O::Lrp,
            WmOp::Cmp => O::Cmp,
            WmOp::Min => O::Min,
            WmOp::Max => O::Max,
            WmOp::Dp3 => O::Dp3,
            WmOp::Dp4 => O::Dp4,
            WmOp::Dph => O::Dph,
            WmOp::Xpd => O::Xpd,
            WmOp::Rcp => O::Rcp,
            WmOp::Rsq => O::Rsq,
            WmOp::Ex2 => O::Ex2,
            WmOp::Lg2 => O::Lg2,
            WmOp::Pow => O::Pow,
            WmOp::Sin => O::Sin,
            WmOp::Cos => O::Cos,
            WmOp::Scs => O::Scs,
            WmOp::Flr => O::Flr,
            WmOp::Frc => O::Frc,
            WmOp::Seq => O::Seq,
            WmOp::Sne => O::Sne,
            WmOp::Slt => O::Slt,
            WmOp::Sle => O::Sle,
            WmOp::Sgt => O::Sgt,
            WmOp::Sge => O::Sge,
            WmOp::Lit => O::Lit,
            WmOp::Kil => O::Kil,
            WmOp::Tex => O::Tex,
            WmOp::Txb => O::Txb,
            WmOp::Ddx => O::Ddx,
            WmOp::Ddy => O::Ddy,
            WmOp::PixelXy => O::PixelXy,
            WmOp::DeltaXy => O::DeltaXy,
            WmOp::PixelW => O::PixelW,
            WmOp::Linterp => O::Linterp,
            WmOp::Pinterp => O::Pinterp,
            WmOp::Cinterp => O::Cinterp,
            WmOp::WposXy => O::WposXy,
            WmOp::FbWrite => O::FbWrite,
        }
    }

    /// Sources of the expanded form. Derivatives gain the setup data and `1/w` operands.
    pub fn nr_src(self) -> usize {
        match self {
            WmOp::Ddx | WmOp::Ddy => 2,
            other => other.opcode().arity(),
        }
    }

    /// Number of leading sources whose component `c` only feeds destination component `c`.
    pub fn per_component_sources(self) -> usize {
        use WmOp::*;
        match self {
            Mov | Add | Mul | Mad | Lrp | Cmp | Min | Max | Flr | Frc | Seq | Sne | Slt | Sle
            | Sgt | Sge => self.nr_src(),
            Linterp | Pinterp | Cinterp | Ddx | Ddy => 1,
            _ => 0,
        }
    }

    /// Instructions that must survive dead code elimination regardless of their destination.
    pub fn has_side_effects(self) -> bool {
        matches!(self, WmOp::Kil | WmOp::FbWrite)
    }

    pub fn is_texture(self) -> bool {
        matches!(self, WmOp::Tex | WmOp::Txb)
    }
}

impl fmt::Display for WmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.opcode().fmt(f)
    }
}

/// Operation of an expanded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Validated: the backend has a lowering for it.
    Wm(WmOp),
    /// Copied verbatim from the source program without a known lowering.
    Passthrough(Opcode),
}

impl Op {
    pub fn opcode(self) -> Opcode {
        match self {
            Op::Wm(op) => op.opcode(),
            Op::Passthrough(op) => op,
        }
    }

    pub fn nr_src(self) -> usize {
        match self {
            Op::Wm(op) => op.nr_src(),
            Op::Passthrough(op) => op.arity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexInfo {
    /// Texture unit after sampler remapping.
    pub unit: u8,
    pub target: TexTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbWriteInfo {
    /// Render target (binding table slot) index.
    pub target: u8,
    /// End of thread: the last message the thread sends.
    pub eot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Insn {
    pub op: Op,
    pub dst: DstReg,
    pub src: [SrcReg; 3],
    pub saturate: bool,
    pub tex: Option<TexInfo>,
    pub fb: Option<FbWriteInfo>,
    /// Index of the source instruction this was expanded from.
    pub provenance: Option<u32>,
}

impl Insn {
    pub fn new(op: WmOp, dst: DstReg, src: [SrcReg; 3]) -> Self {
        Self {
            op: Op::Wm(op),
            dst,
            src,
            saturate: false,
            tex: None,
            fb: None,
            provenance: None,
        }
    }

    pub fn wm_op(&self) -> Option<WmOp> {
        match self.op {
            Op::Wm(op) => Some(op),
            Op::Passthrough(_) => None,
        }
    }

    pub fn is(&self, op: WmOp) -> bool {
        self.op == Op::Wm(op)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.opcode())?;
        if self.saturate {
            f.write_str("_SAT")?;
        }
        write!(f, " {}", self.dst)?;
        for src in &self.src[..self.op.nr_src().min(3)] {
            write!(f, ", {src}")?;
        }
        if let Some(tex) = self.tex {
            write!(f, " (unit {} {})", tex.unit, tex.target)?;
        }
        if let Some(fb) = self.fb {
            write!(f, " (target {}", fb.target)?;
            if fb.eot {
                f.write_str(" EOT")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Numbered listing, one instruction per line.
pub fn listing(insns: &[Insn]) -> String {
    let mut out = String::new();
    for (i, insn) in insns.iter().enumerate() {
        let _ = writeln!(out, "{i:3}: {insn}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{attrib, ComponentMask, RegFile};

    #[test]
    fn rewritten_opcodes_are_not_validated() {
        for op in [
            Opcode::Abs,
            Opcode::Sub,
            Opcode::Swz,
            Opcode::Dst,
            Opcode::Txp,
            Opcode::End,
            Opcode::Unknown(3),
        ] {
            assert_eq!(WmOp::from_opcode(op), None, "{op}");
        }
        assert_eq!(WmOp::from_opcode(Opcode::Mad), Some(WmOp::Mad));
    }

    #[test]
    fn validated_opcodes_round_trip() {
        for op in [WmOp::Pinterp, WmOp::FbWrite, WmOp::Dph, WmOp::Lit] {
            assert_eq!(WmOp::from_opcode(op.opcode()), Some(op));
        }
    }

    #[test]
    fn display_shows_operands_and_flags() {
        let mut insn = Insn::new(
            WmOp::Linterp,
            DstReg::new(RegFile::Input, attrib::COL0),
            [
                SrcReg::new(RegFile::Payload, attrib::COL0),
                SrcReg::temp(65),
                SrcReg::undef(),
            ],
        );
        insn.dst.write_mask = ComponentMask::XYZW;
        assert_eq!(
            insn.to_string(),
            "LINTERP INPUT[1].xyzw, PAYLOAD[1].xyzw, TEMP[65].xyzw"
        );
    }
}
