//! Gen4 lowering of allocated value instructions.

use tracing::trace;

use super::{
    CodeEmitter, CondMod, HwInsn, HwOpcode, HwReg, HwSrc, Imm, MathFunction, Message, RegType,
    Region, SampleKind, SendInfo,
};
use crate::error::{CompileError, InternalError};
use crate::ir::WmOp;
use crate::key::WmProgKey;
use crate::limits::{MAX_DRAW_BUFFERS, MAX_MRF};
use crate::lower::{LoweredProgram, Operand, PayloadRef, Ref, WmInsn};
use crate::regalloc::{Allocation, InsnAlloc, PinnedLayout};

/// Binding table slot of texture unit 0: render targets come first, then the constant buffer.
const TEXTURE_SURFACE_BASE: u8 = MAX_DRAW_BUFFERS + 1;

/// First message register of math and scratch messages; `m0`/`m1` carry headers.
const MATH_MRF: u32 = 2;

/// Per-subspan pixel offsets added to the subspan origins in `r1`.
const PIXEL_X_OFFSETS: u32 = 0x1010_1010;
const PIXEL_Y_OFFSETS: u32 = 0x1100_1100;

#[derive(Debug, Clone, Copy, Default)]
pub struct Gen4Emitter;

impl CodeEmitter for Gen4Emitter {
    fn emit(
        &mut self,
        program: &LoweredProgram,
        alloc: &Allocation,
        key: &WmProgKey,
    ) -> Result<Vec<HwInsn>, CompileError> {
        let mut l = Lowering {
            key,
            layout: &alloc.layout,
            out: Vec::with_capacity(program.insns.len() * 3),
            index: 0,
        };
        for (index, (insn, a)) in program.insns.iter().zip(&alloc.insns).enumerate() {
            l.index = index;
            let before = l.out.len();
            l.scratch(a)?;
            l.insn(insn, a)?;
            trace!(insn = index, op = %insn.op, hw = l.out.len() - before, "lowered instruction");
        }
        Ok(l.out)
    }
}

struct Lowering<'a> {
    key: &'a WmProgKey,
    layout: &'a PinnedLayout,
    out: Vec<HwInsn>,
    index: usize,
}

fn grf(nr: u32) -> HwReg {
    HwReg::grf(nr)
}

fn mrf(nr: u32) -> HwReg {
    HwReg::mrf(nr)
}

fn uw(src: HwSrc) -> HwSrc {
    HwSrc {
        reg: src.reg.retype(RegType::Uw),
        ..src
    }
}

fn set_on_cond(op: WmOp) -> Option<CondMod> {
    Some(match op {
        WmOp::Seq => CondMod::Eq,
        WmOp::Sne => CondMod::Ne,
        WmOp::Slt => CondMod::Lt,
        WmOp::Sle => CondMod::Le,
        WmOp::Sgt => CondMod::Gt,
        WmOp::Sge => CondMod::Ge,
        _ => return None,
    })
}

impl Lowering<'_> {
    fn unresolved(&self) -> CompileError {
        InternalError::UnresolvedOperand { insn: self.index }.into()
    }

    fn push(&mut self, insn: HwInsn) -> &mut HwInsn {
        self.out.push(insn);
        let last = self.out.len() - 1;
        &mut self.out[last]
    }

    fn alu(&mut self, op: HwOpcode, dst: HwReg, a: HwSrc, b: HwSrc) -> &mut HwInsn {
        self.push(HwInsn::new(op, dst, a, b))
    }

    fn mov(&mut self, dst: HwReg, src: impl Into<HwSrc>) -> &mut HwInsn {
        self.alu(HwOpcode::Mov, dst, src.into(), HwSrc::null())
    }

    /// Only the last source may be an immediate. Commutative operations swap; otherwise the
    /// immediate is moved into the destination (when the other source does not read it) or an
    /// emitter temporary.
    fn legalize(&mut self, dst: HwReg, a: HwSrc, b: HwSrc, commutative: bool) -> (HwSrc, HwSrc) {
        if !a.reg.is_imm() {
            return (a, b);
        }
        if commutative && !b.reg.is_imm() {
            return (b, a);
        }
        let fix = match dst.grf_nr() {
            Some(nr) if b.reg.grf_nr() != Some(nr) => grf(u32::from(nr)),
            _ => grf(self.layout.emit_temps[0]),
        };
        self.mov(fix, a);
        (HwSrc::new(fix), b)
    }

    fn alu2(
        &mut self,
        op: HwOpcode,
        dst: HwReg,
        a: HwSrc,
        b: HwSrc,
        commutative: bool,
    ) -> &mut HwInsn {
        let (a, b) = self.legalize(dst, a, b, commutative);
        self.alu(op, dst, a, b)
    }

    fn send(
        &mut self,
        dst: HwReg,
        msg_reg: u32,
        message: Message,
        mlen: u32,
        rlen: u32,
    ) -> Result<&mut HwInsn, CompileError> {
        if msg_reg + mlen > MAX_MRF {
            return Err(InternalError::MessageTooLong { len: mlen }.into());
        }
        let mut insn = HwInsn::new(HwOpcode::Send, dst, HwSrc::new(mrf(msg_reg)), HwSrc::null());
        insn.send = Some(SendInfo {
            message,
            mlen: mlen as u8,
            rlen: rlen as u8,
        });
        Ok(self.push(insn))
    }

    fn math(
        &mut self,
        function: MathFunction,
        dst: HwReg,
        args: &[HwSrc],
        saturate: bool,
    ) -> Result<(), CompileError> {
        for (k, arg) in args.iter().enumerate() {
            self.mov(mrf(MATH_MRF + k as u32), *arg);
        }
        self.send(dst, MATH_MRF, Message::Math { function }, args.len() as u32, 1)?
            .saturate = saturate;
        Ok(())
    }

    fn header_to(&mut self, m: u32) {
        self.mov(mrf(m).retype(RegType::Ud), grf(0).retype(RegType::Ud));
    }

    fn src(&self, operand: Option<Operand>, reg: Option<u32>) -> Result<HwSrc, CompileError> {
        let Some(o) = operand else {
            return Ok(HwSrc::float(0.0));
        };
        let reg = match o.r {
            Ref::Imm(v) => return Ok(HwSrc::float(v)),
            Ref::Value(_) => grf(reg.ok_or_else(|| self.unresolved())?),
            Ref::Curbe { param, comp } => {
                let (nr, sub) = self
                    .layout
                    .curbe(param, comp)
                    .ok_or_else(|| self.unresolved())?;
                HwReg::scalar(nr, sub)
            }
            Ref::Payload(PayloadRef::Header) => grf(0).retype(RegType::Ud),
            Ref::Payload(PayloadRef::Setup { attr, comp }) => {
                let (nr, sub) = self
                    .layout
                    .setup(attr, comp)
                    .ok_or_else(|| self.unresolved())?;
                HwReg::scalar(nr, sub + 3)
            }
        };
        Ok(HwSrc {
            reg,
            negate: o.negate,
            abs: o.abs,
        })
    }

    fn operand(
        &self,
        insn: &WmInsn,
        a: &InsnAlloc,
        s: usize,
        p: usize,
    ) -> Result<HwSrc, CompileError> {
        self.src(insn.src[s][p], a.src[s][p])
    }

    /// Setup coefficient location for an interpolation source.
    fn setup(&self, operand: Option<Operand>) -> Result<(u32, u32), CompileError> {
        match operand.map(|o| o.r) {
            Some(Ref::Payload(PayloadRef::Setup { attr, comp })) => {
                self.layout.setup(attr, comp).ok_or_else(|| self.unresolved())
            }
            _ => Err(self.unresolved()),
        }
    }

    fn scratch(&mut self, a: &InsnAlloc) -> Result<(), CompileError> {
        for s in &a.spills {
            self.header_to(1);
            self.mov(mrf(2), grf(s.reg));
            self.send(HwReg::Null, 1, Message::ScratchWrite { offset: s.slot }, 2, 0)?;
        }
        for f in &a.fills {
            self.header_to(1);
            self.send(grf(f.reg), 1, Message::ScratchRead { offset: f.slot }, 1, 1)?;
        }
        Ok(())
    }

    /// Copies a scalar result computed into `first` to the other written components.
    fn replicate(&mut self, a: &InsnAlloc, first: u32) {
        for r in a.dst.iter().flatten().copied().filter(|&r| r != first) {
            self.mov(grf(r), grf(first));
        }
    }

    fn insn(&mut self, insn: &WmInsn, a: &InsnAlloc) -> Result<(), CompileError> {
        let sat = insn.saturate;
        let first = a.dst.iter().flatten().copied().next();

        match insn.op {
            WmOp::Mov
            | WmOp::Add
            | WmOp::Mul
            | WmOp::Mad
            | WmOp::Lrp
            | WmOp::Cmp
            | WmOp::Min
            | WmOp::Max
            | WmOp::Flr
            | WmOp::Frc
            | WmOp::Seq
            | WmOp::Sne
            | WmOp::Slt
            | WmOp::Sle
            | WmOp::Sgt
            | WmOp::Sge => {
                for c in 0..4 {
                    let Some(dst) = a.dst[c] else { continue };
                    let s = [
                        self.operand(insn, a, 0, c)?,
                        self.operand(insn, a, 1, c)?,
                        self.operand(insn, a, 2, c)?,
                    ];
                    self.componentwise(insn.op, grf(dst), s, sat);
                }
            }
            WmOp::Dp3 | WmOp::Dp4 | WmOp::Dph => {
                let Some(first) = first else { return Ok(()) };
                let n = if insn.op == WmOp::Dp4 { 4 } else { 3 };
                let mut terms = Vec::with_capacity(n);
                for i in 0..n {
                    terms.push((self.operand(insn, a, 0, i)?, self.operand(insn, a, 1, i)?));
                }
                self.alu2(HwOpcode::Mul, HwReg::Acc, terms[0].0, terms[0].1, true);
                for &(x, y) in &terms[1..n - 1] {
                    self.alu2(HwOpcode::Mac, HwReg::Acc, x, y, true);
                }
                let (x, y) = terms[n - 1];
                if insn.op == WmOp::Dph {
                    self.alu2(HwOpcode::Mac, HwReg::Acc, x, y, true);
                    let w = self.operand(insn, a, 1, 3)?;
                    self.alu(HwOpcode::Add, grf(first), HwSrc::new(HwReg::Acc), w)
                        .saturate = sat;
                } else {
                    self.alu2(HwOpcode::Mac, grf(first), x, y, true).saturate = sat;
                }
                self.replicate(a, first);
            }
            WmOp::Xpd => {
                for c in 0..3 {
                    let Some(dst) = a.dst[c] else { continue };
                    let (i, j) = ((c + 1) % 3, (c + 2) % 3);
                    let (ai, aj) = (self.operand(insn, a, 0, i)?, self.operand(insn, a, 0, j)?);
                    let (bi, bj) = (self.operand(insn, a, 1, i)?, self.operand(insn, a, 1, j)?);
                    self.alu2(HwOpcode::Mul, HwReg::Acc, ai, bj, true);
                    self.alu2(HwOpcode::Mac, grf(dst), aj.neg(), bi, true).saturate = sat;
                }
            }
            WmOp::Rcp | WmOp::Rsq | WmOp::Ex2 | WmOp::Lg2 | WmOp::Sin | WmOp::Cos => {
                let Some(first) = first else { return Ok(()) };
                let function = match insn.op {
                    WmOp::Rcp => MathFunction::Inv,
                    WmOp::Rsq => MathFunction::Rsq,
                    WmOp::Ex2 => MathFunction::Exp,
                    WmOp::Lg2 => MathFunction::Log,
                    WmOp::Sin => MathFunction::Sin,
                    _ => MathFunction::Cos,
                };
                let x = self.operand(insn, a, 0, 0)?;
                self.math(function, grf(first), &[x], sat)?;
                self.replicate(a, first);
            }
            WmOp::Pow => {
                let Some(first) = first else { return Ok(()) };
                let x = self.operand(insn, a, 0, 0)?;
                let y = self.operand(insn, a, 1, 0)?;
                self.math(MathFunction::Pow, grf(first), &[x, y], sat)?;
                self.replicate(a, first);
            }
            WmOp::Scs => {
                let x = self.operand(insn, a, 0, 0)?;
                if let Some(d) = a.dst[0] {
                    self.math(MathFunction::Cos, grf(d), &[x], sat)?;
                }
                if let Some(d) = a.dst[1] {
                    self.math(MathFunction::Sin, grf(d), &[x], sat)?;
                }
            }
            WmOp::Lit => self.lit(insn, a)?,
            WmOp::Kil => {
                let mask = HwReg::Grf {
                    nr: 0,
                    subnr: 0,
                    ty: RegType::Uw,
                    region: Region::Scalar,
                };
                for c in 0..4 {
                    let x = self.operand(insn, a, 0, c)?;
                    self.alu2(HwOpcode::Cmp, HwReg::Null, x, HwSrc::float(0.0), false)
                        .cond = CondMod::Ge;
                    self.alu(HwOpcode::And, mask, HwSrc::new(HwReg::Flag), HwSrc::new(mask));
                }
            }
            WmOp::Tex | WmOp::Txb => self.tex(insn, a)?,
            WmOp::FbWrite => self.fb_write(insn, a)?,
            WmOp::PixelXy => {
                let origin = |subnr| {
                    HwSrc::new(HwReg::Grf {
                        nr: 1,
                        subnr,
                        ty: RegType::Uw,
                        region: Region::Subspan,
                    })
                };
                let offsets = [PIXEL_X_OFFSETS, PIXEL_Y_OFFSETS];
                for c in 0..2 {
                    let Some(d) = a.dst[c] else { continue };
                    self.alu(
                        HwOpcode::Add,
                        grf(d).retype(RegType::Uw),
                        origin(4 + c as u8),
                        HwSrc::new(HwReg::Imm(Imm::V(offsets[c]))),
                    );
                }
            }
            WmOp::DeltaXy => {
                for c in 0..2 {
                    let Some(d) = a.dst[c] else { continue };
                    let pixel = uw(self.operand(insn, a, 0, c)?);
                    self.alu(
                        HwOpcode::Add,
                        grf(d),
                        pixel,
                        HwSrc::new(HwReg::scalar(1, c as u32)).neg(),
                    );
                }
            }
            WmOp::PixelW => {
                let Some(d) = a.dst[3] else { return Ok(()) };
                let (nr, sub) = self.setup(insn.src[0][3])?;
                let dx = self.operand(insn, a, 1, 0)?;
                let dy = self.operand(insn, a, 1, 1)?;
                let t = grf(self.layout.emit_temps[0]);
                self.alu(HwOpcode::Line, HwReg::Null, HwReg::scalar(nr, sub).into(), dx)
                    .acc_write = true;
                self.alu(HwOpcode::Mac, t, HwReg::scalar(nr, sub + 1).into(), dy);
                self.math(MathFunction::Inv, grf(d), &[HwSrc::new(t)], false)?;
            }
            WmOp::WposXy => {
                let key = self.key;
                if let Some(d) = a.dst[0] {
                    let px = uw(self.operand(insn, a, 0, 0)?);
                    self.alu(HwOpcode::Add, grf(d), px, HwSrc::float(-(key.origin_x as f32)));
                }
                if let Some(d) = a.dst[1] {
                    // Window y grows downwards; GL's grows upwards from the drawable origin.
                    let py = uw(self.operand(insn, a, 0, 1)?);
                    let flip = key.drawable_height as f32 - 1.0 + key.origin_y as f32;
                    self.alu(HwOpcode::Add, grf(d), py.neg(), HwSrc::float(flip));
                }
            }
            WmOp::Linterp | WmOp::Pinterp => {
                let dx = self.operand(insn, a, 1, 0)?;
                let dy = self.operand(insn, a, 1, 1)?;
                let w = if insn.op == WmOp::Pinterp {
                    Some(self.operand(insn, a, 2, 3)?)
                } else {
                    None
                };
                for c in 0..4 {
                    let Some(d) = a.dst[c] else { continue };
                    let (nr, sub) = self.setup(insn.src[0][c])?;
                    self.alu(HwOpcode::Line, HwReg::Null, HwReg::scalar(nr, sub).into(), dx)
                        .acc_write = true;
                    let mac = HwReg::scalar(nr, sub + 1);
                    match w {
                        Some(w) => {
                            self.alu(HwOpcode::Mac, grf(d), mac.into(), dy);
                            self.alu(HwOpcode::Mul, grf(d), HwSrc::new(grf(d)), w).saturate = sat;
                        }
                        None => self.alu(HwOpcode::Mac, grf(d), mac.into(), dy).saturate = sat,
                    }
                }
            }
            WmOp::Cinterp => {
                for c in 0..4 {
                    let Some(d) = a.dst[c] else { continue };
                    let (nr, sub) = self.setup(insn.src[0][c])?;
                    self.mov(grf(d), HwReg::scalar(nr, sub + 3)).saturate = sat;
                }
            }
            WmOp::Ddx | WmOp::Ddy => {
                let w = self.operand(insn, a, 1, 3)?;
                let offset = if insn.op == WmOp::Ddx { 0 } else { 1 };
                for c in 0..4 {
                    let Some(d) = a.dst[c] else { continue };
                    // Literal selectors are constant across the primitive.
                    if insn.src[0][c].is_some_and(|o| matches!(o.r, Ref::Imm(_))) {
                        self.mov(grf(d), HwSrc::float(0.0));
                        continue;
                    }
                    let (nr, sub) = self.setup(insn.src[0][c])?;
                    let (negate, abs) = insn.src[0][c]
                        .map_or((false, false), |o| (o.negate, o.abs));
                    let coef = HwSrc {
                        negate,
                        abs,
                        ..HwSrc::new(HwReg::scalar(nr, sub + offset))
                    };
                    self.alu(HwOpcode::Mul, grf(d), coef, w).saturate = sat;
                }
            }
        }
        Ok(())
    }

    fn componentwise(&mut self, op: WmOp, dst: HwReg, [a, b, c]: [HwSrc; 3], sat: bool) {
        if let Some(cond) = set_on_cond(op) {
            let (a, b, cond) = if a.reg.is_imm() && !b.reg.is_imm() {
                (b, a, cond.swapped())
            } else {
                (a, b, cond)
            };
            self.alu2(HwOpcode::Cmp, HwReg::Null, a, b, false).cond = cond;
            self.mov(dst, HwSrc::float(0.0));
            self.mov(dst, HwSrc::float(1.0)).predicated = true;
            return;
        }
        match op {
            WmOp::Mov => self.mov(dst, a).saturate = sat,
            WmOp::Add => self.alu2(HwOpcode::Add, dst, a, b, true).saturate = sat,
            WmOp::Mul => self.alu2(HwOpcode::Mul, dst, a, b, true).saturate = sat,
            WmOp::Mad => {
                self.alu2(HwOpcode::Mul, HwReg::Acc, a, b, true);
                self.alu(HwOpcode::Add, dst, HwSrc::new(HwReg::Acc), c).saturate = sat;
            }
            WmOp::Lrp => {
                // a * (b - c) + c
                self.alu2(HwOpcode::Add, dst, b, c.neg(), false);
                self.alu2(HwOpcode::Mul, HwReg::Acc, a, HwSrc::new(dst), true);
                self.alu(HwOpcode::Add, dst, HwSrc::new(HwReg::Acc), c).saturate = sat;
            }
            WmOp::Cmp => {
                self.alu2(HwOpcode::Cmp, HwReg::Null, a, HwSrc::float(0.0), false).cond =
                    CondMod::Lt;
                self.mov(dst, c).saturate = sat;
                let sel = self.mov(dst, b);
                sel.saturate = sat;
                sel.predicated = true;
            }
            WmOp::Min | WmOp::Max => {
                let sel = self.alu2(HwOpcode::Sel, dst, a, b, true);
                sel.cond = if op == WmOp::Min { CondMod::Lt } else { CondMod::Ge };
                sel.saturate = sat;
            }
            WmOp::Flr => self.alu(HwOpcode::Rndd, dst, a, HwSrc::null()).saturate = sat,
            WmOp::Frc => self.alu(HwOpcode::Frc, dst, a, HwSrc::null()).saturate = sat,
            _ => {}
        }
    }

    /// `y = max(x, 0)`, `z = x > 0 ? max(y, 0) ^ clamp(w, -128, 128) : 0`.
    fn lit(&mut self, insn: &WmInsn, a: &InsnAlloc) -> Result<(), CompileError> {
        let sat = insn.saturate;
        let x = self.operand(insn, a, 0, 0)?;
        if let Some(d) = a.dst[1] {
            let sel = self.alu2(HwOpcode::Sel, grf(d), x, HwSrc::float(0.0), true);
            sel.cond = CondMod::Ge;
            sel.saturate = sat;
        }
        if let Some(d) = a.dst[2] {
            let y = self.operand(insn, a, 0, 1)?;
            let w = self.operand(insn, a, 0, 3)?;
            let [t0, t1] = self.layout.emit_temps.map(grf);
            self.alu2(HwOpcode::Sel, t0, y, HwSrc::float(0.0), true).cond = CondMod::Ge;
            self.alu2(HwOpcode::Sel, t1, w, HwSrc::float(-128.0), true).cond = CondMod::Ge;
            self.alu(HwOpcode::Sel, t1, HwSrc::new(t1), HwSrc::float(128.0))
                .cond = CondMod::Lt;
            self.math(MathFunction::Pow, grf(d), &[HwSrc::new(t0), HwSrc::new(t1)], sat)?;
            self.alu2(HwOpcode::Cmp, HwReg::Null, x, HwSrc::float(0.0), false).cond = CondMod::Le;
            self.mov(grf(d), HwSrc::float(0.0)).predicated = true;
        }
        Ok(())
    }

    fn tex(&mut self, insn: &WmInsn, a: &InsnAlloc) -> Result<(), CompileError> {
        let tex = insn.tex.ok_or_else(|| self.unresolved())?;
        let base = a.dst[0].ok_or_else(|| self.unresolved())?;
        let shadow = WmProgKey::unit_flag(self.key.shadowtex_mask, tex.unit);

        // m1 header, m2.. coordinates (u, v, r), shadow reference in r, bias last.
        self.header_to(1);
        let slots = insn.src[0]
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |p| p + 1);
        for p in 0..slots {
            let coord = self.operand(insn, a, 0, p)?;
            self.mov(mrf(2 + p as u32), coord);
        }

        let kind = match (insn.op == WmOp::Txb, shadow) {
            (false, false) => SampleKind::Sample,
            (true, false) => SampleKind::SampleBias,
            (false, true) => SampleKind::SampleCompare,
            (true, true) => SampleKind::SampleBiasCompare,
        };
        let message = Message::Sampler {
            surface: TEXTURE_SURFACE_BASE + tex.unit,
            sampler: tex.unit,
            kind,
        };
        self.send(grf(base), 1, message, 1 + slots as u32, 4)?;

        if insn.saturate {
            for c in 0..4 {
                if insn.dst[c].is_some() {
                    let r = grf(base + c as u32);
                    self.mov(r, r).saturate = true;
                }
            }
        }
        Ok(())
    }

    /// `m0`/`m1` header, `m2..m5` color, then antialiasing coverage and depth when the payload
    /// layout asks for them.
    fn fb_write(&mut self, insn: &WmInsn, a: &InsnAlloc) -> Result<(), CompileError> {
        let fb = insn.fb.ok_or_else(|| self.unresolved())?;
        let payload = self.layout.payload;

        self.header_to(0);
        self.mov(mrf(1).retype(RegType::Ud), grf(1).retype(RegType::Ud));
        for c in 0..4 {
            let color = self.operand(insn, a, 0, c)?;
            self.mov(mrf(2 + c as u32), color);
        }
        let mut len = 6;
        if let Some(r) = payload.aa_dest_stencil_reg() {
            self.mov(mrf(len), grf(r));
            len += 1;
        }
        if payload.dest_depth {
            let depth = if payload.computes_depth {
                self.operand(insn, a, 2, 2)?
            } else {
                let r = payload
                    .source_depth_reg()
                    .ok_or_else(|| self.unresolved())?;
                HwSrc::new(grf(r))
            };
            self.mov(mrf(len), depth);
            len += 1;
        }
        self.send(
            HwReg::Null,
            0,
            Message::RenderTarget {
                surface: fb.target,
                eot: fb.eot,
            },
            len,
            0,
        )?;
        Ok(())
    }
}
