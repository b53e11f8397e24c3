//! Opcode classification shared by every pass.

use std::fmt;

/// Fragment program opcodes, plus the pseudo-ops the expansion pass introduces for
/// interpolation and framebuffer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Abs,
    Add,
    Cmp,
    Cos,
    Ddx,
    Ddy,
    Dp3,
    Dp4,
    Dph,
    Dst,
    End,
    Ex2,
    Flr,
    Frc,
    Kil,
    Lg2,
    Lit,
    Lrp,
    Mad,
    Max,
    Min,
    Mov,
    Mul,
    Nrm3,
    Nrm4,
    Pow,
    Print,
    Rcp,
    Rsq,
    Scs,
    Seq,
    Sge,
    Sgt,
    Sin,
    Sle,
    Slt,
    Sne,
    Sub,
    Swz,
    Tex,
    Txb,
    Txp,
    Xpd,

    /// Screen-space pixel coordinates of each channel, from the thread payload header.
    PixelXy,
    /// Pixel position relative to the primitive's setup origin.
    DeltaXy,
    /// Perspective-correct `1/w`, interpolated from the position attribute.
    PixelW,
    /// Linear (screen-space) attribute interpolation.
    Linterp,
    /// Perspective-correct attribute interpolation.
    Pinterp,
    /// Constant (flat-shaded) attribute value.
    Cinterp,
    /// Window-relative `gl_FragCoord.xy`.
    WposXy,
    /// Render target write message.
    FbWrite,

    /// Opcode value this compiler does not know about.
    Unknown(u16),
}

impl Opcode {
    /// Number of source operands the opcode consumes.
    ///
    /// Total over the enumeration; unrecognized opcodes report zero sources.
    pub fn arity(self) -> usize {
        use Opcode::*;
        match self {
            PixelXy | Abs | Flr | Frc | Swz | Mov | Cos | Ex2 | Lg2 | Rcp | Rsq | Sin | Scs
            | Tex | Txb | Txp | Kil | Lit | Nrm3 | Nrm4 | Cinterp | WposXy | Ddx | Ddy => 1,

            Pow | Sub | Sge | Sgt | Sle | Slt | Seq | Sne | Add | Max | Min | Mul | Xpd | Dp3
            | Dp4 | Dph | Dst | Linterp | DeltaXy | PixelW => 2,

            FbWrite | Pinterp | Mad | Cmp | Lrp => 3,

            End | Print | Unknown(_) => 0,
        }
    }

    /// Whether the opcode computes a single value that is replicated to every written
    /// destination component.
    pub fn is_scalar_result(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Cos | Ex2 | Lg2 | Pow | Rcp | Rsq | Sin | Dp3 | Dp4 | Dph | Dst
        )
    }

    pub fn is_texture(self) -> bool {
        matches!(self, Opcode::Tex | Opcode::Txb | Opcode::Txp)
    }

    /// Opcodes only the compiler itself emits.
    pub fn is_internal(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            PixelXy | DeltaXy | PixelW | Linterp | Pinterp | Cinterp | WposXy | FbWrite
        )
    }

    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Abs => "ABS",
            Add => "ADD",
            Cmp => "CMP",
            Cos => "COS",
            Ddx => "DDX",
            Ddy => "DDY",
            Dp3 => "DP3",
            Dp4 => "DP4",
            Dph => "DPH",
            Dst => "DST",
            End => "END",
            Ex2 => "EX2",
            Flr => "FLR",
            Frc => "FRC",
            Kil => "KIL",
            Lg2 => "LG2",
            Lit => "LIT",
            Lrp => "LRP",
            Mad => "MAD",
            Max => "MAX",
            Min => "MIN",
            Mov => "MOV",
            Mul => "MUL",
            Nrm3 => "NRM3",
            Nrm4 => "NRM4",
            Pow => "POW",
            Print => "PRINT",
            Rcp => "RCP",
            Rsq => "RSQ",
            Scs => "SCS",
            Seq => "SEQ",
            Sge => "SGE",
            Sgt => "SGT",
            Sin => "SIN",
            Sle => "SLE",
            Slt => "SLT",
            Sne => "SNE",
            Sub => "SUB",
            Swz => "SWZ",
            Tex => "TEX",
            Txb => "TXB",
            Txp => "TXP",
            Xpd => "XPD",
            PixelXy => "PIXELXY",
            DeltaXy => "DELTAXY",
            PixelW => "PIXELW",
            Linterp => "LINTERP",
            Pinterp => "PINTERP",
            Cinterp => "CINTERP",
            WposXy => "WPOSXY",
            FbWrite => "FB_WRITE",
            Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Unknown(raw) => write!(f, "UNKNOWN({raw})"),
            other => f.write_str(other.name()),
        }
    }
}
