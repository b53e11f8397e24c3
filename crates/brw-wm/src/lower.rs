//! Value translation: rewrites the register-level instruction list into per-component values.
//!
//! Every written destination component gets a fresh [`ValueId`]. Sources are resolved through a
//! map from (register, component) to the operand currently held there, so unsaturated `MOV`s
//! become aliases and never reach the allocator.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use crate::error::{CompileError, InternalError};
use crate::ir::{FbWriteInfo, Insn, Op, TexInfo, WmOp};
use crate::key::WmProgKey;
use crate::program::{
    ComponentMask, DstReg, Parameter, ParameterList, RegFile, SrcReg, Swz, PAYLOAD_HEADER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Data the hardware delivers in the thread payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadRef {
    /// Thread header (`r0`) and subspan origins (`r1`).
    Header,
    /// Setup coefficients (`dx`, `dy`, `c0`) of one attribute component.
    Setup { attr: u16, comp: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ref {
    Value(ValueId),
    /// Component `comp` of state parameter `param`, pushed as a constant (CURBE) register.
    Curbe { param: u16, comp: u8 },
    Payload(PayloadRef),
    Imm(f32),
}

/// One scalar source: `negate(abs(r))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Operand {
    pub r: Ref,
    pub negate: bool,
    pub abs: bool,
}

impl Operand {
    pub const fn new(r: Ref) -> Self {
        Self {
            r,
            negate: false,
            abs: false,
        }
    }

    pub const fn imm(value: f32) -> Self {
        Self::new(Ref::Imm(value))
    }

    pub fn value(&self) -> Option<ValueId> {
        match self.r {
            Ref::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Applies `negate(abs(..))` on top of the operand's own modifiers. Immediates fold.
    pub fn modified(self, negate: bool, abs: bool) -> Self {
        if let Ref::Imm(v) = self.r {
            let v = if abs { v.abs() } else { v };
            return Operand::imm(if negate { -v } else { v });
        }
        if abs {
            Operand {
                r: self.r,
                negate,
                abs: true,
            }
        } else {
            Operand {
                negate: self.negate ^ negate,
                ..self
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            f.write_str("-")?;
        }
        if self.abs {
            f.write_str("|")?;
        }
        match self.r {
            Ref::Value(v) => write!(f, "{v}")?,
            Ref::Curbe { param, comp } => write!(f, "c{param}.{}", component_name(comp))?,
            Ref::Payload(PayloadRef::Header) => f.write_str("header")?,
            Ref::Payload(PayloadRef::Setup { attr, comp }) => {
                write!(f, "setup{attr}.{}", component_name(comp))?
            }
            Ref::Imm(v) => write!(f, "{v:?}")?,
        }
        if self.abs {
            f.write_str("|")?;
        }
        Ok(())
    }
}

fn component_name(comp: u8) -> char {
    ['x', 'y', 'z', 'w'][usize::from(comp & 3)]
}

#[derive(Debug, Clone, PartialEq)]
pub struct WmInsn {
    pub op: WmOp,
    pub saturate: bool,
    pub dst: [Option<ValueId>; 4],
    /// `src[i][p]`: position `p` of source `i`, present only where the operation reads it.
    pub src: [[Option<Operand>; 4]; 3],
    pub tex: Option<TexInfo>,
    pub fb: Option<FbWriteInfo>,
    pub provenance: Option<u32>,
}

impl WmInsn {
    pub fn write_mask(&self) -> ComponentMask {
        self.dst
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .fold(ComponentMask::empty(), |m, (c, _)| {
                m | ComponentMask::component(c)
            })
    }

    pub fn defs(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.dst.iter().flatten().copied()
    }

    pub fn operands(&self) -> impl Iterator<Item = &Operand> + '_ {
        self.src.iter().flatten().flatten()
    }

    pub fn uses(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.operands().filter_map(Operand::value)
    }
}

impl fmt::Display for WmInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if self.saturate {
            f.write_str("_SAT")?;
        }
        f.write_str(" [")?;
        for (c, v) in self.dst.iter().enumerate() {
            if c > 0 {
                f.write_str(", ")?;
            }
            match v {
                Some(v) => write!(f, "{v}")?,
                None => f.write_str("_")?,
            }
        }
        f.write_str("]")?;
        for src in &self.src[..self.op.nr_src().min(3)] {
            f.write_str(" <- [")?;
            for (p, operand) in src.iter().enumerate() {
                if p > 0 {
                    f.write_str(", ")?;
                }
                match operand {
                    Some(o) => write!(f, "{o}")?,
                    None => f.write_str("_")?,
                }
            }
            f.write_str("]")?;
        }
        if let Some(tex) = self.tex {
            write!(f, " (unit {} {})", tex.unit, tex.target)?;
        }
        if let Some(fb) = self.fb {
            write!(f, " (target {}{})", fb.target, if fb.eot { " EOT" } else { "" })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredProgram {
    pub insns: Vec<WmInsn>,
    /// Number of value ids handed out; every id is below this.
    pub nr_values: u32,
    pub params: ParameterList,
}

impl LoweredProgram {
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (i, insn) in self.insns.iter().enumerate() {
            let _ = writeln!(out, "{i:3}: {insn}");
        }
        out
    }
}

/// Source positions `op` reads for a destination mask of `mask`.
pub fn source_components(
    op: WmOp,
    mask: ComponentMask,
    tex: Option<TexInfo>,
    key: &WmProgKey,
) -> [ComponentMask; 3] {
    use ComponentMask as M;
    let none = M::empty();
    if mask.is_empty() && !op.has_side_effects() {
        return [none; 3];
    }
    match op {
        WmOp::Rcp | WmOp::Rsq | WmOp::Ex2 | WmOp::Lg2 | WmOp::Sin | WmOp::Cos | WmOp::Scs => {
            [M::X, none, none]
        }
        WmOp::Pow => [M::X, M::X, none],
        WmOp::Dp3 | WmOp::Xpd => [M::XYZ, M::XYZ, none],
        WmOp::Dp4 => [M::XYZW, M::XYZW, none],
        WmOp::Dph => [M::XYZ, M::XYZW, none],
        WmOp::Lit => [M::X | M::Y | M::W, none, none],
        WmOp::Kil => [M::XYZW, none, none],
        WmOp::Tex | WmOp::Txb => {
            let mut coord = none;
            if let Some(tex) = tex {
                for c in 0..tex.target.coord_components() {
                    coord |= M::component(c);
                }
                if WmProgKey::unit_flag(key.shadowtex_mask, tex.unit) {
                    coord |= M::Z;
                }
            }
            if op == WmOp::Txb {
                coord |= M::W;
            }
            [coord, none, none]
        }
        WmOp::PixelXy => [M::X, none, none],
        WmOp::DeltaXy => [M::XY, M::X, none],
        WmOp::PixelW => [M::W, M::XY, none],
        WmOp::WposXy => [M::XY, none, none],
        WmOp::Linterp => [mask, M::XY, none],
        WmOp::Pinterp => [mask, M::XY, M::W],
        WmOp::Cinterp => [mask, none, none],
        WmOp::Ddx | WmOp::Ddy => [mask, M::W, none],
        WmOp::FbWrite => {
            let depth = if key.payload_layout().computes_depth {
                M::Z
            } else {
                none
            };
            [M::XYZW, M::X, depth]
        }
        _ => {
            let mut reads = [none; 3];
            for r in reads.iter_mut().take(op.nr_src()) {
                *r = mask;
            }
            reads
        }
    }
}

struct Translator<'a> {
    regs: HashMap<(RegFile, u16), [Option<Operand>; 4]>,
    params: &'a ParameterList,
    next_value: u32,
}

impl Translator<'_> {
    fn new_value(&mut self) -> ValueId {
        let v = ValueId(self.next_value);
        self.next_value += 1;
        v
    }

    fn bind(&mut self, dst: DstReg, comp: usize, operand: Operand) {
        self.regs.entry((dst.file, dst.index)).or_default()[comp] = Some(operand);
    }

    fn operand(&self, src: &SrcReg, position: usize) -> Operand {
        let base = match src.swizzle.get(position) {
            Swz::Zero => Operand::imm(0.0),
            Swz::One => Operand::imm(1.0),
            sel => self.component(src, sel.component().unwrap_or(0)),
        };
        base.modified(src.negate.has(position), src.abs)
    }

    fn component(&self, src: &SrcReg, comp: usize) -> Operand {
        match src.file {
            RegFile::Temporary | RegFile::Input | RegFile::Output => self
                .regs
                .get(&(src.file, src.index))
                .and_then(|r| r[comp])
                .unwrap_or(Operand::imm(0.0)),
            RegFile::StateVar | RegFile::Constant => match self.params.get(src.index) {
                Some(Parameter::Constant(v)) => Operand::imm(v[comp]),
                Some(Parameter::State(_)) => Operand::new(Ref::Curbe {
                    param: src.index,
                    comp: comp as u8,
                }),
                None => Operand::imm(0.0),
            },
            RegFile::Payload if src.index == PAYLOAD_HEADER => {
                Operand::new(Ref::Payload(PayloadRef::Header))
            }
            RegFile::Payload => Operand::new(Ref::Payload(PayloadRef::Setup {
                attr: src.index,
                comp: comp as u8,
            })),
            RegFile::Undefined => Operand::imm(0.0),
        }
    }
}

/// Translates the expanded program. Every operation must have been validated by expansion.
pub fn lower(
    insns: &[Insn],
    params: ParameterList,
    key: &WmProgKey,
) -> Result<LoweredProgram, CompileError> {
    let mut t = Translator {
        regs: HashMap::new(),
        params: &params,
        next_value: 0,
    };
    let mut out = Vec::with_capacity(insns.len());

    for (index, insn) in insns.iter().enumerate() {
        let op = match insn.op {
            Op::Wm(op) => op,
            Op::Passthrough(opcode) => {
                return Err(InternalError::UnsupportedOpcode { opcode, index }.into())
            }
        };
        let mask = if insn.dst.is_undef() {
            ComponentMask::empty()
        } else {
            insn.dst.write_mask
        };

        // All sources are resolved before any destination is rebound.
        let mut src = [[None; 4]; 3];
        for (i, reads) in source_components(op, mask, insn.tex, key)
            .iter()
            .enumerate()
        {
            for p in reads.components() {
                src[i][p] = Some(t.operand(&insn.src[i], p));
            }
        }

        if op == WmOp::Mov && !insn.saturate {
            for c in mask.components() {
                t.bind(insn.dst, c, src[0][c].unwrap_or(Operand::imm(0.0)));
            }
            continue;
        }

        let mut dst = [None; 4];
        for c in mask.components() {
            let v = t.new_value();
            dst[c] = Some(v);
            t.bind(insn.dst, c, Operand::new(Ref::Value(v)));
        }
        out.push(WmInsn {
            op,
            saturate: insn.saturate,
            dst,
            src,
            tex: insn.tex,
            fb: insn.fb,
            provenance: insn.provenance,
        });
    }

    let nr_values = t.next_value;
    Ok(LoweredProgram {
        insns: out,
        nr_values,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use crate::program::{attrib, result, StateRef, Swizzle};

    fn insn(op: WmOp, dst: DstReg, src: &[SrcReg]) -> Insn {
        let mut s = [SrcReg::undef(); 3];
        s[..src.len()].copy_from_slice(src);
        Insn::new(op, dst, s)
    }

    fn interp_col0() -> Insn {
        insn(
            WmOp::Cinterp,
            DstReg::new(RegFile::Input, attrib::COL0),
            &[SrcReg::new(RegFile::Payload, attrib::COL0)],
        )
    }

    #[test]
    fn moves_become_aliases() {
        let insns = [
            interp_col0(),
            insn(
                WmOp::Mov,
                DstReg::temp(0),
                &[SrcReg::input(attrib::COL0).negated()],
            ),
            insn(
                WmOp::Add,
                DstReg::output(result::COLOR),
                &[SrcReg::temp(0), SrcReg::input(attrib::COL0)],
            ),
        ];
        let lowered = lower(&insns, ParameterList::new(), &WmProgKey::default()).unwrap();
        assert_eq!(lowered.insns.len(), 2);
        assert_eq!(lowered.nr_values, 8);
        let add = &lowered.insns[1];
        for c in 0..4 {
            let a = add.src[0][c].unwrap();
            let b = add.src[1][c].unwrap();
            assert_eq!(a.r, b.r);
            assert!(a.negate);
            assert!(!b.negate);
        }
    }

    #[test]
    fn swapping_move_reads_before_rebinding() {
        let insns = [
            interp_col0(),
            insn(
                WmOp::Mov,
                DstReg::new(RegFile::Input, attrib::COL0).masked(ComponentMask::XY),
                &[SrcReg::input(attrib::COL0)
                    .with_swizzle(Swizzle::new(Swz::Y, Swz::X, Swz::Z, Swz::W))],
            ),
            insn(
                WmOp::Mov,
                DstReg::output(result::COLOR),
                &[SrcReg::input(attrib::COL0)],
            ),
            insn(
                WmOp::Frc,
                DstReg::temp(1),
                &[SrcReg::output(result::COLOR)],
            ),
        ];
        let lowered = lower(&insns, ParameterList::new(), &WmProgKey::default()).unwrap();
        let interp = &lowered.insns[0];
        let frc = &lowered.insns[1];
        assert_eq!(frc.src[0][0].unwrap().value(), interp.dst[1]);
        assert_eq!(frc.src[0][1].unwrap().value(), interp.dst[0]);
        assert_eq!(frc.src[0][2].unwrap().value(), interp.dst[2]);
    }

    #[test]
    fn literals_fold_and_state_goes_to_curbe() {
        let mut params = ParameterList::new();
        let lit = params.search_or_add_const4f([0.5, -2.0, 3.0, 4.0]);
        let fog = params.search_or_add_state(StateRef::FogColor);
        let insns = [insn(
            WmOp::Mad,
            DstReg::output(result::COLOR).masked(ComponentMask::XY),
            &[
                SrcReg::new(RegFile::Constant, lit).abs().negated(),
                SrcReg::new(RegFile::StateVar, fog).splat(Swz::W),
                SrcReg::temp(9).with_swizzle(Swizzle::new(Swz::One, Swz::Zero, Swz::X, Swz::X)),
            ],
        )];
        let lowered = lower(&insns, params, &WmProgKey::default()).unwrap();
        let mad = &lowered.insns[0];
        assert_eq!(mad.src[0][0], Some(Operand::imm(-0.5)));
        assert_eq!(mad.src[0][1], Some(Operand::imm(-2.0)));
        assert_eq!(
            mad.src[1][1].unwrap().r,
            Ref::Curbe {
                param: fog,
                comp: 3
            }
        );
        assert_eq!(mad.src[2][0], Some(Operand::imm(1.0)));
        assert_eq!(mad.src[2][1], Some(Operand::imm(0.0)));
        assert_eq!(mad.src[0][2], None, "unwritten components are not read");
    }

    #[test]
    fn abs_discards_earlier_negation() {
        let base = Operand::new(Ref::Value(ValueId(3))).modified(true, false);
        assert!(base.negate);
        let abs = base.modified(false, true);
        assert_eq!(
            abs,
            Operand {
                r: Ref::Value(ValueId(3)),
                negate: false,
                abs: true
            }
        );
        let neg_abs = abs.modified(true, false);
        assert!(neg_abs.negate && neg_abs.abs);
    }

    #[test]
    fn passthrough_is_an_internal_error() {
        let mut bogus = insn(WmOp::Mov, DstReg::temp(0), &[SrcReg::temp(1)]);
        bogus.op = Op::Passthrough(Opcode::Unknown(77));
        let err = lower(
            &[interp_col0(), bogus],
            ParameterList::new(),
            &WmProgKey::default(),
        )
        .unwrap_err();
        assert!(err.is_internal());
        assert_eq!(
            err,
            CompileError::Internal(InternalError::UnsupportedOpcode {
                opcode: Opcode::Unknown(77),
                index: 1
            })
        );
    }

    #[test]
    fn shadow_lookups_read_the_reference_component() {
        let key = WmProgKey {
            shadowtex_mask: 1 << 2,
            ..Default::default()
        };
        let tex = |unit| {
            let mut i = insn(WmOp::Tex, DstReg::temp(0), &[SrcReg::temp(1)]);
            i.tex = Some(TexInfo {
                unit,
                target: crate::program::TexTarget::Tex2D,
            });
            i
        };
        let reads = |i: &Insn| source_components(WmOp::Tex, ComponentMask::XYZW, i.tex, &key)[0];
        assert_eq!(reads(&tex(0)), ComponentMask::XY);
        assert_eq!(reads(&tex(2)), ComponentMask::XYZ);
    }
}
