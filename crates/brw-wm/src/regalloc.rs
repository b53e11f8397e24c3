//! Linear-scan register allocation over the value form.
//!
//! The payload header, pushed constants (CURBE) and attribute setup data are pinned at the bottom
//! of the register file, followed by two registers the emitter uses for operand fixups. Values
//! are then assigned in instruction order to the lowest free register below the budget. When the
//! budget is full, the resident value whose next use is furthest away is stored to scratch and
//! reloaded before the instruction that reads it next.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{CompileError, InternalError, ResourceError};
use crate::key::{PayloadLayout, WmProgKey};
use crate::limits::{MAX_GRF, SCRATCH_GRANULARITY, SCRATCH_SLOT_BYTES};
use crate::lower::{LoweredProgram, PayloadRef, Ref, ValueId};

/// Registers reserved for the emitter's own temporaries.
pub const EMIT_TEMPS: usize = 2;

/// Floats of one state parameter; two parameters share a register.
const PARAM_FLOATS: u32 = 4;

/// Where the pinned inputs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedLayout {
    pub payload: PayloadLayout,
    pub first_curbe_grf: u32,
    /// State parameters in push-constant slot order.
    pub curbe_params: Vec<u16>,
    pub first_setup_grf: u32,
    /// Attributes with setup data, two registers each, in register order.
    pub setup_attrs: Vec<u16>,
    pub emit_temps: [u32; EMIT_TEMPS],
    /// First register available to values.
    pub first_value_grf: u32,
}

impl PinnedLayout {
    pub fn new(program: &LoweredProgram, key: &WmProgKey) -> Self {
        let mut params = BTreeSet::new();
        let mut attrs = BTreeSet::new();
        for operand in program.insns.iter().flat_map(|i| i.operands()) {
            match operand.r {
                Ref::Curbe { param, .. } => {
                    params.insert(param);
                }
                Ref::Payload(PayloadRef::Setup { attr, .. }) => {
                    attrs.insert(attr);
                }
                _ => {}
            }
        }

        let payload = key.payload_layout();
        let first_curbe_grf = payload.nr_regs();
        let curbe_params: Vec<u16> = params.into_iter().collect();
        let first_setup_grf = first_curbe_grf + curbe_regs(curbe_params.len());
        let setup_attrs: Vec<u16> = attrs.into_iter().collect();
        let temps = first_setup_grf + 2 * setup_attrs.len() as u32;
        Self {
            payload,
            first_curbe_grf,
            curbe_params,
            first_setup_grf,
            setup_attrs,
            emit_temps: [temps, temps + 1],
            first_value_grf: temps + EMIT_TEMPS as u32,
        }
    }

    pub fn curbe_read_length(&self) -> u32 {
        curbe_regs(self.curbe_params.len())
    }

    /// Register and float offset holding component `comp` of state parameter `param`.
    pub fn curbe(&self, param: u16, comp: u8) -> Option<(u32, u32)> {
        let slot = self.curbe_params.iter().position(|&p| p == param)? as u32;
        Some((
            self.first_curbe_grf + slot / 2,
            (slot % 2) * PARAM_FLOATS + u32::from(comp),
        ))
    }

    /// Register and float offset of the `dx` coefficient for one attribute component. `dy`
    /// follows at +1 and the constant term at +3.
    pub fn setup(&self, attr: u16, comp: u8) -> Option<(u32, u32)> {
        let k = self.setup_attrs.iter().position(|&a| a == attr)? as u32;
        let comp = u32::from(comp);
        Some((self.first_setup_grf + 2 * k + comp / 2, (comp % 2) * 4))
    }
}

fn curbe_regs(params: usize) -> u32 {
    (params as u32).div_ceil(2)
}

/// A transfer between a register and a scratch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchMove {
    pub reg: u32,
    pub slot: u32,
}

/// Register assignment for one instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsnAlloc {
    /// Stores issued before the instruction, while the registers still hold the evicted values.
    pub spills: Vec<ScratchMove>,
    /// Reloads issued after the stores.
    pub fills: Vec<ScratchMove>,
    /// Register per destination component. Texture results always get all four.
    pub dst: [Option<u32>; 4],
    /// Register per value source position.
    pub src: [[Option<u32>; 4]; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub layout: PinnedLayout,
    pub insns: Vec<InsnAlloc>,
    /// High-water mark: registers `0..total_grf` are in use.
    pub total_grf: u32,
    pub scratch_slots: u32,
}

impl Allocation {
    pub fn scratch_bytes(&self) -> u32 {
        scratch_bytes(self.scratch_slots)
    }
}

/// Per-thread scratch allocation for `slots` spilled registers.
pub fn scratch_bytes(slots: u32) -> u32 {
    if slots == 0 {
        return 0;
    }
    (slots * SCRATCH_SLOT_BYTES)
        .next_power_of_two()
        .max(SCRATCH_GRANULARITY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Undefined,
    Reg(u32),
    Spilled,
    Dead,
}

struct Allocator<'a> {
    budget: u32,
    first: u32,
    pinned: u32,
    allow_spilling: bool,
    uses: &'a [Vec<usize>],
    resident: Vec<Option<ValueId>>,
    loc: Vec<Loc>,
    slot: Vec<Option<u32>>,
    next_slot: u32,
    high_water: u32,
}

fn bit(reg: u32) -> u128 {
    1u128 << reg
}

impl Allocator<'_> {
    fn next_use(&self, v: ValueId, insn: usize) -> usize {
        let uses = &self.uses[v.index()];
        let i = uses.partition_point(|&u| u <= insn);
        uses.get(i).copied().unwrap_or(usize::MAX)
    }

    fn free_reg(&self, busy: u128) -> Option<u32> {
        (self.first..self.budget)
            .find(|&r| self.resident[r as usize].is_none() && busy & bit(r) == 0)
    }

    fn victim(&self, busy: u128, insn: usize) -> Option<u32> {
        (self.first..self.budget)
            .filter(|&r| busy & bit(r) == 0)
            .filter_map(|r| self.resident[r as usize].map(|v| (r, self.next_use(v, insn))))
            .max_by_key(|&(r, next)| (next, std::cmp::Reverse(r)))
            .map(|(r, _)| r)
    }

    fn no_register(&self, insn: usize) -> CompileError {
        ResourceError::RegisterBudgetExceeded {
            insn,
            budget: self.budget,
            pinned: self.pinned,
        }
        .into()
    }

    fn spilling_disabled(&self, insn: usize) -> CompileError {
        ResourceError::SpillingDisabled {
            insn,
            budget: self.budget,
        }
        .into()
    }

    fn evict(&mut self, reg: u32, insn: usize, out: &mut InsnAlloc) {
        let Some(v) = self.resident[reg as usize].take() else {
            return;
        };
        // Values never change once defined, so an existing slot is still current.
        if self.slot[v.index()].is_none() {
            let slot = self.next_slot;
            self.next_slot += 1;
            self.slot[v.index()] = Some(slot);
            out.spills.push(ScratchMove { reg, slot });
            debug!(insn, value = v.0, reg, slot, "spilling value to scratch");
        }
        self.loc[v.index()] = Loc::Spilled;
    }

    fn take_reg(&mut self, busy: u128, insn: usize, out: &mut InsnAlloc) -> Result<u32, CompileError> {
        if let Some(r) = self.free_reg(busy) {
            return Ok(r);
        }
        let Some(r) = self.victim(busy, insn) else {
            return Err(self.no_register(insn));
        };
        if !self.allow_spilling {
            return Err(self.spilling_disabled(insn));
        }
        self.evict(r, insn, out);
        Ok(r)
    }

    /// Four contiguous registers for a sampler response.
    fn take_window(&mut self, busy: u128, insn: usize, out: &mut InsnAlloc) -> Result<u32, CompileError> {
        let mut best: Option<(usize, u32)> = None;
        if self.budget >= self.first + 4 {
            for base in self.first..=self.budget - 4 {
                if busy & (0xf << base) != 0 {
                    continue;
                }
                let occupied = (base..base + 4)
                    .filter(|&r| self.resident[r as usize].is_some())
                    .count();
                if best.map_or(true, |(n, _)| occupied < n) {
                    best = Some((occupied, base));
                }
            }
        }
        let Some((occupied, base)) = best else {
            return Err(self.no_register(insn));
        };
        if occupied > 0 && !self.allow_spilling {
            return Err(self.spilling_disabled(insn));
        }
        for r in base..base + 4 {
            self.evict(r, insn, out);
        }
        Ok(base)
    }

    fn assign(&mut self, reg: u32, v: ValueId) {
        self.resident[reg as usize] = Some(v);
        self.loc[v.index()] = Loc::Reg(reg);
        self.high_water = self.high_water.max(reg + 1);
    }

    fn release(&mut self, v: ValueId) {
        if let Loc::Reg(r) = self.loc[v.index()] {
            self.resident[r as usize] = None;
        }
        self.loc[v.index()] = Loc::Dead;
    }
}

fn collect_uses(program: &LoweredProgram) -> Vec<Vec<usize>> {
    let mut uses = vec![Vec::new(); program.nr_values as usize];
    for (i, insn) in program.insns.iter().enumerate() {
        for v in insn.uses() {
            if let Some(list) = uses.get_mut(v.index()) {
                if list.last() != Some(&i) {
                    list.push(i);
                }
            }
        }
    }
    uses
}

/// Allocates `program` within `budget` registers (capped at the register file size).
pub fn run(
    program: &LoweredProgram,
    key: &WmProgKey,
    budget: u32,
    allow_spilling: bool,
) -> Result<Allocation, CompileError> {
    let budget = budget.min(MAX_GRF);
    let layout = PinnedLayout::new(program, key);
    let pinned = layout.first_value_grf;
    if pinned > budget {
        return Err(ResourceError::RegisterBudgetExceeded {
            insn: 0,
            budget,
            pinned,
        }
        .into());
    }

    let uses = collect_uses(program);
    let nr_values = program.nr_values as usize;
    let mut ra = Allocator {
        budget,
        first: pinned,
        pinned,
        allow_spilling,
        uses: &uses,
        resident: vec![None; MAX_GRF as usize],
        loc: vec![Loc::Undefined; nr_values],
        slot: vec![None; nr_values],
        next_slot: 0,
        high_water: pinned,
    };

    let mut insns = Vec::with_capacity(program.insns.len());
    for (i, insn) in program.insns.iter().enumerate() {
        let mut a = InsnAlloc::default();

        // Resident sources stay put for the whole instruction.
        let mut busy = 0u128;
        for v in insn.uses() {
            if let Some(Loc::Reg(r)) = ra.loc.get(v.index()) {
                busy |= bit(*r);
            }
        }

        for (s, src) in insn.src.iter().enumerate() {
            for (p, operand) in src.iter().enumerate() {
                let Some(v) = operand.and_then(|o| o.value()) else {
                    continue;
                };
                let reg = match ra.loc.get(v.index()).copied() {
                    Some(Loc::Reg(r)) => r,
                    Some(Loc::Spilled) => {
                        let r = ra.take_reg(busy, i, &mut a)?;
                        let slot = ra.slot[v.index()].ok_or(InternalError::LostValue {
                            value: v.0,
                            insn: i,
                        })?;
                        a.fills.push(ScratchMove { reg: r, slot });
                        ra.assign(r, v);
                        busy |= bit(r);
                        r
                    }
                    Some(Loc::Dead) => {
                        return Err(InternalError::LostValue { value: v.0, insn: i }.into())
                    }
                    Some(Loc::Undefined) | None => {
                        return Err(InternalError::UndefinedValue { value: v.0, insn: i }.into())
                    }
                };
                a.src[s][p] = Some(reg);
            }
        }

        if insn.op.is_texture() {
            let base = ra.take_window(busy, i, &mut a)?;
            for c in 0..4 {
                let r = base + c as u32;
                a.dst[c] = Some(r);
                if let Some(v) = insn.dst[c] {
                    ra.assign(r, v);
                }
            }
            ra.high_water = ra.high_water.max(base + 4);
        } else {
            for c in 0..4 {
                let Some(v) = insn.dst[c] else { continue };
                let r = ra.take_reg(busy, i, &mut a)?;
                ra.assign(r, v);
                busy |= bit(r);
                a.dst[c] = Some(r);
            }
        }

        for v in insn.uses() {
            if uses[v.index()].last() == Some(&i) {
                ra.release(v);
            }
        }
        for v in insn.defs() {
            if uses[v.index()].is_empty() {
                ra.release(v);
            }
        }
        insns.push(a);
    }

    Ok(Allocation {
        layout,
        insns,
        total_grf: ra.high_water,
        scratch_slots: ra.next_slot,
    })
}
