//! Dead code elimination over the value form.
//!
//! The program is straight-line, so one backward sweep computes exact liveness. Render target
//! writes and `KIL` are the roots.

use crate::lower::{LoweredProgram, Ref, ValueId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DceStats {
    pub removed_insns: usize,
    /// Destination components dropped from instructions that stayed live.
    pub removed_components: usize,
    pub values_before: u32,
    pub values_after: u32,
}

pub fn run(program: &mut LoweredProgram) -> DceStats {
    let mut live = vec![false; program.nr_values as usize];
    let mut keep = vec![false; program.insns.len()];
    let mut removed_components = 0;

    for (idx, insn) in program.insns.iter_mut().enumerate().rev() {
        let any_live = insn.defs().any(|v| live[v.index()]);
        if !any_live && !insn.op.has_side_effects() {
            continue;
        }
        keep[idx] = true;

        let follow = insn.op.per_component_sources();
        for c in 0..4 {
            let Some(v) = insn.dst[c] else { continue };
            if live[v.index()] {
                continue;
            }
            insn.dst[c] = None;
            removed_components += 1;
            for src in &mut insn.src[..follow] {
                src[c] = None;
            }
        }

        for v in insn.uses() {
            live[v.index()] = true;
        }
    }

    let before = program.insns.len();
    let mut idx = 0;
    program.insns.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });

    let values_before = program.nr_values;
    compact(program);

    DceStats {
        removed_insns: before - program.insns.len(),
        removed_components,
        values_before,
        values_after: program.nr_values,
    }
}

/// Renumbers values densely in definition order.
fn compact(program: &mut LoweredProgram) {
    let mut remap: Vec<Option<u32>> = vec![None; program.nr_values as usize];
    let mut next = 0;
    for insn in &program.insns {
        for v in insn.defs() {
            remap[v.index()] = Some(next);
            next += 1;
        }
    }

    let renumber = |v: &mut ValueId| {
        if let Some(n) = remap.get(v.index()).copied().flatten() {
            *v = ValueId(n);
        }
    };
    for insn in &mut program.insns {
        for v in insn.dst.iter_mut().flatten() {
            renumber(v);
        }
        for operand in insn.src.iter_mut().flatten().flatten() {
            if let Ref::Value(v) = &mut operand.r {
                renumber(v);
            }
        }
    }
    program.nr_values = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FbWriteInfo, WmOp};
    use crate::lower::{Operand, WmInsn};
    use crate::program::{ComponentMask, ParameterList};

    fn value(v: u32) -> Option<Operand> {
        Some(Operand::new(Ref::Value(ValueId(v))))
    }

    fn alu(op: WmOp, dst: [Option<u32>; 4], src: [[Option<Operand>; 4]; 3]) -> WmInsn {
        WmInsn {
            op,
            saturate: false,
            dst: dst.map(|d| d.map(ValueId)),
            src,
            tex: None,
            fb: None,
            provenance: None,
        }
    }

    fn fb_write(color: [Option<Operand>; 4]) -> WmInsn {
        WmInsn {
            fb: Some(FbWriteInfo {
                target: 0,
                eot: true,
            }),
            ..alu(WmOp::FbWrite, [None; 4], [color, [None; 4], [None; 4]])
        }
    }

    #[test]
    fn unread_instructions_are_removed_and_ids_compacted() {
        let imm = Some(Operand::imm(1.0));
        let mut program = LoweredProgram {
            insns: vec![
                // v0 is never read.
                alu(WmOp::Frc, [Some(0), None, None, None], [[imm, None, None, None], [None; 4], [None; 4]]),
                alu(WmOp::Flr, [Some(1), None, None, None], [[imm, None, None, None], [None; 4], [None; 4]]),
                fb_write([value(1), value(1), value(1), value(1)]),
            ],
            nr_values: 2,
            params: ParameterList::new(),
        };
        let stats = run(&mut program);
        assert_eq!(stats.removed_insns, 1);
        assert_eq!(stats.values_after, 1);
        assert_eq!(program.insns.len(), 2);
        assert_eq!(program.insns[0].op, WmOp::Flr);
        assert_eq!(program.insns[0].dst[0], Some(ValueId(0)));
        assert_eq!(program.insns[1].src[0][3], value(0));
    }

    #[test]
    fn dead_components_drop_matching_sources() {
        let mut program = LoweredProgram {
            insns: vec![
                alu(
                    WmOp::Add,
                    [Some(0), Some(1), Some(2), Some(3)],
                    [
                        [value(10), value(11), value(12), value(13)],
                        [Some(Operand::imm(0.5)); 4],
                        [None; 4],
                    ],
                ),
                fb_write([value(0), None, value(2), None]),
            ],
            nr_values: 14,
            params: ParameterList::new(),
        };
        let stats = run(&mut program);
        assert_eq!(stats.removed_components, 2);
        let add = &program.insns[0];
        assert_eq!(add.write_mask(), ComponentMask::XZ);
        assert_eq!(add.src[0][1], None);
        assert_eq!(add.src[1][3], None);
        assert!(add.src[0][0].is_some());
    }

    #[test]
    fn dot_products_keep_all_sources() {
        let mut program = LoweredProgram {
            insns: vec![
                alu(
                    WmOp::Dp3,
                    [Some(0), Some(1), Some(2), Some(3)],
                    [
                        [value(8), value(9), value(10), None],
                        [value(8), value(9), value(10), None],
                        [None; 4],
                    ],
                ),
                fb_write([value(3), value(3), value(3), value(3)]),
            ],
            nr_values: 11,
            params: ParameterList::new(),
        };
        run(&mut program);
        let dp3 = &program.insns[0];
        assert_eq!(dp3.write_mask(), ComponentMask::W);
        assert_eq!(dp3.operands().count(), 6);
    }

    #[test]
    fn kill_survives_without_destination() {
        let mut program = LoweredProgram {
            insns: vec![alu(
                WmOp::Kil,
                [None; 4],
                [[Some(Operand::imm(-1.0)); 4], [None; 4], [None; 4]],
            )],
            nr_values: 0,
            params: ParameterList::new(),
        };
        let stats = run(&mut program);
        assert_eq!(stats.removed_insns, 0);
        assert_eq!(program.insns.len(), 1);
    }
}
