//! Expansion pass: rewrites source instructions into the operations the backend lowers.
//!
//! Interpolation is injected right before the first instruction reading each input attribute,
//! texture fetches get their coordinate fixups, compound opcodes are split along the write mask
//! and `END` becomes one render target write per bound color region.

use crate::builder::{BuiltProgram, ProgramBuilder};
use crate::error::CompileError;
use crate::ir::{FbWriteInfo, Insn, Op, TexInfo, WmOp};
use crate::key::WmProgKey;
use crate::limits::MAX_DRAW_BUFFERS;
use crate::opcode::Opcode;
use crate::program::{
    attrib, result, ComponentMask, DstReg, FragmentProgram, Instruction, RegFile, SrcReg,
    StateRef, Swizzle, Swz, TexTarget, PAYLOAD_HEADER,
};

/// YUV to RGB bias and luma scale.
const YUV_C0: [f32; 4] = [-0.5, -0.0625, -0.5, 1.164];
/// Chroma contributions to red and blue, and the green contributions in `y`/`w`.
const YUV_C1: [f32; 4] = [1.596, -0.813, 2.018, -0.391];

pub fn expand_program(
    program: &FragmentProgram,
    key: &WmProgKey,
) -> Result<BuiltProgram, CompileError> {
    expand_program_into(program, key, Vec::new())
}

/// Like [`expand_program`], reusing `buffer`'s allocation for the output.
pub fn expand_program_into(
    program: &FragmentProgram,
    key: &WmProgKey,
    buffer: Vec<Insn>,
) -> Result<BuiltProgram, CompileError> {
    let fragcolor_written = program.outputs_written() & (1 << result::COLOR) != 0;
    let mut b = ProgramBuilder::new(program, key, buffer);

    for (i, inst) in program.instructions.iter().enumerate() {
        b.set_provenance(Some(i as u32));
        // Derivatives read the setup coefficients directly.
        if !matches!(inst.opcode, Opcode::Ddx | Opcode::Ddy) {
            emit_interps(&mut b, inst)?;
        }
        expand_instruction(&mut b, inst, fragcolor_written)?;
    }

    Ok(b.finish())
}

fn emit_interps(b: &mut ProgramBuilder<'_>, inst: &Instruction) -> Result<(), CompileError> {
    for src in &inst.src[..inst.opcode.arity()] {
        if src.file == RegFile::Input && !b.interp_emitted(src.index) {
            emit_interp(b, src.index)?;
        }
    }
    Ok(())
}

fn emit_interp(b: &mut ProgramBuilder<'_>, attr: u16) -> Result<(), CompileError> {
    let dst = DstReg::new(RegFile::Input, attr);
    let setup = SrcReg::new(RegFile::Payload, attr);
    let undef = SrcReg::undef();

    match attr {
        attrib::WPOS => {
            let pixel_xy = b.pixel_xy()?;
            b.emit(
                WmOp::WposXy,
                dst.masked(ComponentMask::XY),
                [pixel_xy, undef, undef],
            )?;
            let deltas = b.delta_xy()?;
            b.emit(
                WmOp::Linterp,
                dst.masked(ComponentMask::ZW),
                [setup, deltas, undef],
            )?;
        }
        attrib::COL0 | attrib::COL1 if b.key().flat_shade() => {
            b.emit(WmOp::Cinterp, dst, [setup, undef, undef])?;
        }
        attrib::COL0 | attrib::COL1 => {
            let deltas = b.delta_xy()?;
            b.emit(WmOp::Linterp, dst, [setup, deltas, undef])?;
        }
        _ => {
            let deltas = b.delta_xy()?;
            let pixel_w = b.pixel_w()?;
            b.emit(WmOp::Pinterp, dst, [setup, deltas, pixel_w])?;
        }
    }

    b.mark_interp_emitted(attr);
    Ok(())
}

fn expand_instruction(
    b: &mut ProgramBuilder<'_>,
    inst: &Instruction,
    fragcolor_written: bool,
) -> Result<(), CompileError> {
    match inst.opcode {
        Opcode::Swz => {
            emit_copy(b, inst, Op::Wm(WmOp::Mov))?;
        }
        Opcode::Abs => {
            let out = emit_copy(b, inst, Op::Wm(WmOp::Mov))?;
            out.src[0].negate = ComponentMask::empty();
            out.src[0].abs = true;
        }
        Opcode::Sub => {
            let out = emit_copy(b, inst, Op::Wm(WmOp::Add))?;
            out.src[1].negate ^= ComponentMask::XYZW;
        }
        Opcode::Scs => {
            let out = emit_copy(b, inst, Op::Wm(WmOp::Scs))?;
            out.dst.write_mask &= ComponentMask::XY;
        }
        Opcode::Xpd => {
            let out = emit_copy(b, inst, Op::Wm(WmOp::Xpd))?;
            out.dst.write_mask &= ComponentMask::XYZ;
        }
        Opcode::Kil => {
            let out = emit_copy(b, inst, Op::Wm(WmOp::Kil))?;
            out.dst.write_mask = ComponentMask::empty();
        }
        Opcode::Dst => expand_dst(b, inst)?,
        Opcode::Lit => expand_lit(b, inst)?,
        Opcode::Nrm3 => expand_nrm(b, inst, WmOp::Dp3)?,
        Opcode::Nrm4 => expand_nrm(b, inst, WmOp::Dp4)?,
        Opcode::Tex => expand_tex(b, inst, inst.src[0])?,
        Opcode::Txp => expand_txp(b, inst)?,
        Opcode::Txb => {
            let unit = b.program().sampler_units[usize::from(inst.tex_unit)];
            let out = emit_copy(b, inst, Op::Wm(WmOp::Txb))?;
            out.tex = Some(TexInfo {
                unit,
                target: inst.tex_target,
            });
        }
        Opcode::Ddx | Opcode::Ddy => {
            let op = if inst.opcode == Opcode::Ddx {
                WmOp::Ddx
            } else {
                WmOp::Ddy
            };
            let setup = SrcReg::new(RegFile::Payload, inst.src[0].index)
                .with_swizzle(inst.src[0].swizzle)
                .with_negate(inst.src[0].negate);
            let pixel_w = b.pixel_w()?;
            b.emit(op, inst.dst, [setup, pixel_w, SrcReg::undef()])?
                .saturate = inst.saturate;
        }
        Opcode::End => emit_fb_writes(b, fragcolor_written)?,
        Opcode::Print => {}
        other => {
            let op = WmOp::from_opcode(other).map_or(Op::Passthrough(other), Op::Wm);
            emit_copy(b, inst, op)?;
        }
    }
    Ok(())
}

fn emit_copy<'b>(
    b: &'b mut ProgramBuilder<'_>,
    inst: &Instruction,
    op: Op,
) -> Result<&'b mut Insn, CompileError> {
    b.push(Insn {
        op,
        dst: inst.dst,
        src: inst.src,
        saturate: inst.saturate,
        tex: None,
        fb: None,
        provenance: None,
    })
}

/// `DST`: `x = 1`, `y = src0.y * src1.y`, `z = src0.z`, `w = src1.w`.
fn expand_dst(b: &mut ProgramBuilder<'_>, inst: &Instruction) -> Result<(), CompileError> {
    let [src0, src1, _] = inst.src;
    let mask = inst.dst.write_mask;
    let undef = SrcReg::undef();

    if mask.contains(ComponentMask::Y) {
        b.emit(
            WmOp::Mul,
            inst.dst.masked(ComponentMask::Y),
            [src0, src1, undef],
        )?
        .saturate = inst.saturate;
    }
    if mask.intersects(ComponentMask::XZ) {
        let one_z = src0.reswizzle(Swizzle::new(Swz::One, Swz::Z, Swz::Z, Swz::Z));
        let out = b.emit(
            WmOp::Mov,
            inst.dst.masked(mask & ComponentMask::XZ),
            [one_z, undef, undef],
        )?;
        out.saturate = inst.saturate;
        // The literal 1 never takes src0's negation.
        out.src[0].negate.remove(ComponentMask::X);
    }
    if mask.contains(ComponentMask::W) {
        b.emit(
            WmOp::Mov,
            inst.dst.masked(ComponentMask::W),
            [src1, undef, undef],
        )?
        .saturate = inst.saturate;
    }
    Ok(())
}

/// `LIT`: `x = w = 1`; `y`/`z` from the hardware sequence.
fn expand_lit(b: &mut ProgramBuilder<'_>, inst: &Instruction) -> Result<(), CompileError> {
    let src0 = inst.src[0];
    let mask = inst.dst.write_mask;
    let undef = SrcReg::undef();

    if mask.intersects(ComponentMask::XW) {
        let out = b.emit(
            WmOp::Mov,
            inst.dst.masked(mask & ComponentMask::XW),
            [src0.splat(Swz::One), undef, undef],
        )?;
        out.src[0].negate = ComponentMask::empty();
    }
    if mask.intersects(ComponentMask::YZ) {
        b.emit(
            WmOp::Lit,
            inst.dst.masked(mask & ComponentMask::YZ),
            [src0, undef, undef],
        )?
        .saturate = inst.saturate;
    }
    Ok(())
}

/// `NRM3`/`NRM4`: `dst = src * rsq(dot(src, src))`.
fn expand_nrm(
    b: &mut ProgramBuilder<'_>,
    inst: &Instruction,
    dot: WmOp,
) -> Result<(), CompileError> {
    let src0 = inst.src[0];
    let undef = SrcReg::undef();
    let tmp = b.acquire_temp()?;
    let len = tmp.dst().masked(ComponentMask::X);

    b.emit(dot, len, [src0, src0, undef])?;
    b.emit(WmOp::Rsq, len, [tmp.src().splat(Swz::X), undef, undef])?;
    b.emit(
        WmOp::Mul,
        inst.dst,
        [src0, tmp.src().splat(Swz::X), undef],
    )?
    .saturate = inst.saturate;
    Ok(())
}

/// Conservatively decides whether a `TXP` coordinate needs the divide by `q`.
///
/// Only an unmodified texcoord input whose set is known to arrive with `q == 1` skips it. Cube
/// lookups normalize by the major axis, which makes the divide redundant.
pub fn projtex(key: &WmProgKey, inst: &Instruction) -> bool {
    let src = inst.src[0];
    if inst.tex_target == TexTarget::Cube {
        return false;
    }
    if src.file == RegFile::Input && src.swizzle.get(3) == Swz::W && !src.negate.has(3) {
        if let Some(set) = attrib::texcoord_unit(src.index) {
            if key.projtex_mask & (1 << set) == 0 {
                return false;
            }
        }
    }
    true
}

fn expand_txp(b: &mut ProgramBuilder<'_>, inst: &Instruction) -> Result<(), CompileError> {
    let src0 = inst.src[0];
    if !projtex(b.key(), inst) {
        return expand_tex(b, inst, src0);
    }

    let undef = SrcReg::undef();
    let tmp = b.acquire_temp()?;
    b.emit(
        WmOp::Rcp,
        tmp.dst().masked(ComponentMask::W),
        [src0.splat(Swz::W), undef, undef],
    )?;
    b.emit(
        WmOp::Mul,
        tmp.dst().masked(ComponentMask::XYZ),
        [src0, tmp.src().splat(Swz::W), undef],
    )?;
    expand_tex(b, inst, tmp.src())
}

fn expand_tex(
    b: &mut ProgramBuilder<'_>,
    inst: &Instruction,
    coord_in: SrcReg,
) -> Result<(), CompileError> {
    let unit = b.program().sampler_units[usize::from(inst.tex_unit)];
    let target = inst.tex_target;
    let undef = SrcReg::undef();

    // Holds the rewritten coordinate until the fetch has been emitted.
    let tmpcoord;
    let coord = match target {
        TexTarget::Cube => {
            let tmp0 = b.acquire_temp()?;
            let tmp1 = b.acquire_temp()?;
            let tc = b.acquire_temp()?;
            let coord = tc.src();

            let abs = b.emit(WmOp::Mov, tc.dst(), [coord_in, undef, undef])?;
            abs.src[0].negate = ComponentMask::empty();
            abs.src[0].abs = true;

            b.emit(
                WmOp::Max,
                tmp0.dst(),
                [coord.splat(Swz::X), coord.splat(Swz::Y), undef],
            )?;
            b.emit(
                WmOp::Max,
                tmp1.dst(),
                [tmp0.src(), coord.splat(Swz::Z), undef],
            )?;
            b.emit(WmOp::Rcp, tmp0.dst(), [tmp1.src(), undef, undef])?;
            b.emit(WmOp::Mul, tc.dst(), [coord_in, tmp0.src(), undef])?;
            tmpcoord = Some(tc);
            coord
        }
        TexTarget::Rect => {
            let scale = b
                .params_mut()
                .search_or_add_state(StateRef::TexRectScale(unit));
            let tc = b.acquire_temp()?;
            b.emit(
                WmOp::Mul,
                tc.dst(),
                [coord_in, SrcReg::new(RegFile::StateVar, scale), undef],
            )?;
            let coord = tc.src();
            tmpcoord = Some(tc);
            coord
        }
        _ => {
            tmpcoord = None;
            coord_in
        }
    };

    let key = b.key();
    let tex = Some(TexInfo { unit, target });
    if !WmProgKey::unit_flag(key.yuvtex_mask, unit) {
        let out = b.emit(WmOp::Tex, inst.dst, [coord, undef, undef])?;
        out.saturate = inst.saturate;
        out.tex = tex;
    } else {
        let swap_uv = WmProgKey::unit_flag(key.yuvtex_swap_mask, unit);
        let dst = inst.dst;
        let tmp = b.acquire_temp()?;
        let yuv = tmp.src();
        let c0 = SrcReg::new(RegFile::Constant, b.params_mut().search_or_add_const4f(YUV_C0));
        let c1 = SrcReg::new(RegFile::Constant, b.params_mut().search_or_add_const4f(YUV_C1));

        // yuv = TEX coord
        let out = b.emit(WmOp::Tex, tmp.dst(), [coord, undef, undef])?;
        out.saturate = inst.saturate;
        out.tex = tex;

        // yuv.xyz = ADD yuv, C0
        b.emit(
            WmOp::Add,
            tmp.dst().masked(ComponentMask::XYZ),
            [yuv, c0, undef],
        )?;
        // yuv.y = MUL yuv.y, C0.w
        b.emit(
            WmOp::Mul,
            tmp.dst().masked(ComponentMask::Y),
            [yuv, c0.splat(Swz::W), undef],
        )?;
        // rgb.xyz = MAD yuv.zzx / yuv.xxz, C1, yuv.y
        let chroma = if swap_uv {
            Swizzle::new(Swz::Z, Swz::Z, Swz::X, Swz::X)
        } else {
            Swizzle::new(Swz::X, Swz::X, Swz::Z, Swz::Z)
        };
        let rgb_mask = dst.write_mask & ComponentMask::XYZ;
        if !rgb_mask.is_empty() {
            b.emit(
                WmOp::Mad,
                dst.masked(rgb_mask),
                [yuv.reswizzle(chroma), c1, yuv.splat(Swz::Y)],
            )?;
        }
        // rgb.y = MAD yuv.z, C1.w, rgb.y
        if dst.write_mask.contains(ComponentMask::Y) {
            b.emit(
                WmOp::Mad,
                dst.masked(ComponentMask::Y),
                [
                    yuv.splat(Swz::Z),
                    c1.splat(Swz::W),
                    SrcReg::from(dst).splat(Swz::Y),
                ],
            )?;
        }
    }

    drop(tmpcoord);
    Ok(())
}

/// Replaces `END` with the render target writes.
fn emit_fb_writes(b: &mut ProgramBuilder<'_>, fragcolor_written: bool) -> Result<(), CompileError> {
    let regions = b.key().nr_color_regions.clamp(1, MAX_DRAW_BUFFERS);

    if regions > 1 {
        for i in 0..regions {
            let last = i + 1 == regions;
            emit_fb_write(
                b,
                result::DATA0 + u16::from(i),
                FbWriteInfo {
                    target: i,
                    eot: last && !fragcolor_written,
                },
            )?;
            if fragcolor_written {
                emit_fb_write(
                    b,
                    result::COLOR,
                    FbWriteInfo {
                        target: i,
                        eot: last,
                    },
                )?;
            }
        }
    } else {
        let color = if b.program().outputs_written() & (1 << result::DATA0) != 0 {
            result::DATA0
        } else {
            result::COLOR
        };
        emit_fb_write(
            b,
            color,
            FbWriteInfo {
                target: 0,
                eot: true,
            },
        )?;
    }
    Ok(())
}

fn emit_fb_write(
    b: &mut ProgramBuilder<'_>,
    color: u16,
    fb: FbWriteInfo,
) -> Result<(), CompileError> {
    let out = b.emit(
        WmOp::FbWrite,
        DstReg::undef(),
        [
            SrcReg::output(color),
            SrcReg::new(RegFile::Payload, PAYLOAD_HEADER),
            SrcReg::output(result::DEPTH),
        ],
    )?;
    out.fb = Some(fb);
    Ok(())
}
