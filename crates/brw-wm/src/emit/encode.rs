//! Fixed-width binary encoding: four little-endian dwords per instruction.

use super::{HwInsn, HwReg, HwSrc, Imm, Message, Region};
use crate::limits::HW_INSN_BYTES;

const FILE_ARF: u32 = 0;
const FILE_GRF: u32 = 1;
const FILE_MRF: u32 = 2;
const FILE_IMM: u32 = 3;

const ARF_NULL: u32 = 0x00;
const ARF_ACC: u32 = 0x20;
const ARF_FLAG: u32 = 0x30;

/// Execution size field for SIMD8.
const EXEC_SIZE_8: u32 = 3;

/// Predicate control: normal (all channels use their own flag bit).
const PRED_NORMAL: u32 = 1;

const _: () = {
    assert!(HW_INSN_BYTES == 16);
};

fn bits(value: u32, hi: u32, lo: u32) -> u32 {
    let width = hi - lo + 1;
    (value & ((1u32 << width) - 1)) << lo
}

/// Register file, number and byte offset. Architecture registers carry their kind in the number.
fn location(reg: &HwReg) -> (u32, u32, u32) {
    match *reg {
        HwReg::Grf { nr, subnr, ty, .. } => (FILE_GRF, u32::from(nr), u32::from(subnr) * ty.size()),
        HwReg::Mrf { nr, .. } => (FILE_MRF, u32::from(nr), 0),
        HwReg::Acc => (FILE_ARF, ARF_ACC, 0),
        HwReg::Flag => (FILE_ARF, ARF_FLAG, 0),
        HwReg::Null => (FILE_ARF, ARF_NULL, 0),
        HwReg::Imm(_) => (FILE_IMM, 0, 0),
    }
}

fn stride_code(stride: u32) -> u32 {
    if stride == 0 {
        0
    } else {
        stride.trailing_zeros() + 1
    }
}

fn region(reg: &HwReg) -> (u32, u32, u32) {
    let r = match reg {
        HwReg::Grf { region, .. } => *region,
        HwReg::Acc | HwReg::Mrf { .. } => Region::Vec8,
        _ => Region::Scalar,
    };
    r.strides()
}

fn imm_bits(imm: Imm) -> u32 {
    match imm {
        Imm::F(v) => v.to_bits(),
        Imm::Ud(v) | Imm::V(v) => v,
    }
}

fn source(src: &HwSrc) -> u32 {
    let (_, nr, subreg) = location(&src.reg);
    let (vstride, width, hstride) = region(&src.reg);
    bits(subreg, 4, 0)
        | bits(nr, 12, 5)
        | bits(u32::from(src.abs), 13, 13)
        | bits(u32::from(src.negate), 14, 14)
        | bits(stride_code(hstride), 17, 16)
        | bits(width.trailing_zeros(), 20, 18)
        | bits(stride_code(vstride), 24, 21)
}

fn descriptor(insn: &HwInsn) -> u32 {
    let Some(send) = insn.send else { return 0 };
    let (bti, control) = match send.message {
        Message::Math { function } => (0, function as u32),
        Message::Sampler {
            surface,
            sampler,
            kind,
        } => (u32::from(surface), u32::from(sampler) | (kind as u32) << 4),
        Message::RenderTarget { surface, .. } => (u32::from(surface), 0),
        Message::ScratchRead { offset } | Message::ScratchWrite { offset } => (0xff, offset),
    };
    bits(bti, 7, 0)
        | bits(control, 15, 8)
        | bits(u32::from(send.rlen), 19, 16)
        | bits(u32::from(send.mlen), 23, 20)
        | bits(send.message.sfid() as u32, 27, 24)
        | bits(u32::from(send.message.eot()), 31, 31)
}

pub fn encode(insn: &HwInsn) -> [u8; HW_INSN_BYTES] {
    let cond = match insn.send {
        Some(send) => send.message.sfid() as u32,
        None => insn.cond as u32,
    };
    let dw0 = bits(insn.opcode as u32, 6, 0)
        | bits(if insn.predicated { PRED_NORMAL } else { 0 }, 19, 16)
        | bits(u32::from(insn.pred_inverse), 20, 20)
        | bits(EXEC_SIZE_8, 23, 21)
        | bits(cond, 27, 24)
        | bits(u32::from(insn.acc_write), 28, 28)
        | bits(u32::from(insn.saturate), 31, 31);

    let [src0, src1] = &insn.src;
    let (dst_file, dst_nr, dst_subreg) = location(&insn.dst);
    let (src0_file, ..) = location(&src0.reg);
    let (src1_file, ..) = location(&src1.reg);
    let dw1 = bits(dst_file, 1, 0)
        | bits(insn.dst.ty() as u32, 4, 2)
        | bits(src0_file, 6, 5)
        | bits(src0.reg.ty() as u32, 9, 7)
        | bits(src1_file, 11, 10)
        | bits(src1.reg.ty() as u32, 14, 12)
        | bits(dst_subreg, 20, 16)
        | bits(dst_nr, 28, 21)
        | bits(1, 30, 29);

    let dw2 = match src0.reg {
        HwReg::Imm(imm) => imm_bits(imm),
        _ => source(src0),
    };
    let dw3 = if insn.send.is_some() {
        descriptor(insn)
    } else {
        match src1.reg {
            HwReg::Imm(imm) => imm_bits(imm),
            _ if insn.nr_src() < 2 => 0,
            _ => source(src1),
        }
    };

    let mut out = [0u8; HW_INSN_BYTES];
    for (chunk, dw) in out.chunks_exact_mut(4).zip([dw0, dw1, dw2, dw3]) {
        chunk.copy_from_slice(&dw.to_le_bytes());
    }
    out
}

pub fn encode_all(insns: &[HwInsn]) -> Vec<u8> {
    let mut out = Vec::with_capacity(insns.len() * HW_INSN_BYTES);
    for insn in insns {
        out.extend_from_slice(&encode(insn));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{CondMod, HwOpcode, MathFunction, SendInfo};

    fn dword(bytes: &[u8], i: usize) -> u32 {
        u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap())
    }

    #[test]
    fn opcode_and_registers_land_in_their_fields() {
        let mut add = HwInsn::new(
            HwOpcode::Add,
            HwReg::grf(4),
            HwSrc::new(HwReg::grf(2)),
            HwSrc::float(1.0),
        );
        add.saturate = true;
        add.cond = CondMod::Ge;
        let bytes = encode(&add);
        let dw0 = dword(&bytes, 0);
        assert_eq!(dw0 & 0x7f, HwOpcode::Add as u32);
        assert_eq!((dw0 >> 24) & 0xf, CondMod::Ge as u32);
        assert_eq!(dw0 >> 31, 1);

        let dw1 = dword(&bytes, 1);
        assert_eq!(dw1 & 0x3, FILE_GRF);
        assert_eq!((dw1 >> 10) & 0x3, FILE_IMM);
        assert_eq!((dw1 >> 21) & 0xff, 4);

        assert_eq!((dword(&bytes, 2) >> 5) & 0xff, 2);
        assert_eq!(dword(&bytes, 3), 1.0f32.to_bits());
    }

    #[test]
    fn send_descriptor_carries_lengths_and_end_of_thread() {
        let mut send = HwInsn::new(
            HwOpcode::Send,
            HwReg::Null,
            HwSrc::new(HwReg::mrf(0)),
            HwSrc::null(),
        );
        send.send = Some(SendInfo {
            message: Message::RenderTarget {
                surface: 0,
                eot: true,
            },
            mlen: 6,
            rlen: 0,
        });
        let dw3 = dword(&encode(&send), 3);
        assert_eq!((dw3 >> 20) & 0xf, 6);
        assert_eq!((dw3 >> 16) & 0xf, 0);
        assert_eq!(dw3 >> 31, 1);

        send.send = Some(SendInfo {
            message: Message::Math {
                function: MathFunction::Rsq,
            },
            mlen: 1,
            rlen: 1,
        });
        let dw3 = dword(&encode(&send), 3);
        assert_eq!(dw3 >> 31, 0);
        assert_eq!((dw3 >> 8) & 0xff, MathFunction::Rsq as u32);
    }

    #[test]
    fn every_instruction_is_sixteen_bytes() {
        let mov = HwInsn::new(HwOpcode::Mov, HwReg::grf(3), HwSrc::float(0.0), HwSrc::null());
        assert_eq!(encode_all(&[mov, mov, mov]).len(), 48);
    }
}
