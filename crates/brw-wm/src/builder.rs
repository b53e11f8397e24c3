//! Mutable state of one expansion: instruction list, temporaries, derived values.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::{CompileError, ResourceError};
use crate::ir::{Insn, WmOp};
use crate::key::WmProgKey;
use crate::limits::{FIRST_INTERNAL_TEMP, INTERNAL_TEMP_COUNT, MAX_EXPANDED_INSNS};
use crate::program::{
    attrib, ComponentMask, DstReg, FragmentProgram, ParameterList, RegFile, SrcReg,
    PAYLOAD_HEADER,
};

#[derive(Debug, Default)]
struct PoolState {
    used: Cell<u32>,
    acquired: Cell<u32>,
    released: Cell<u32>,
}

/// Counters describing temporary pool traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TempPoolStats {
    pub acquired: u32,
    pub released: u32,
    /// Temporaries held as derived values until expansion finished.
    pub retained: u32,
}

/// Fixed-size pool of internal temporaries.
#[derive(Debug, Default)]
pub struct TempPool {
    state: Rc<PoolState>,
}

impl TempPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lowest free slot; the slot returns to the pool when the [`Temp`] drops.
    pub fn acquire(&self) -> Result<Temp, CompileError> {
        let used = self.state.used.get();
        let free = !used;
        if free == 0 {
            return Err(ResourceError::OutOfTemporaries {
                pool_size: INTERNAL_TEMP_COUNT,
            }
            .into());
        }
        let slot = free.trailing_zeros();
        self.state.used.set(used | (1 << slot));
        self.state.acquired.set(self.state.acquired.get() + 1);
        Ok(Temp {
            slot: slot as u16,
            pool: Rc::clone(&self.state),
        })
    }

    pub fn outstanding(&self) -> u32 {
        self.state.used.get().count_ones()
    }

    pub fn stats(&self) -> TempPoolStats {
        TempPoolStats {
            acquired: self.state.acquired.get(),
            released: self.state.released.get(),
            retained: 0,
        }
    }
}

/// An acquired internal temporary.
#[derive(Debug)]
pub struct Temp {
    slot: u16,
    pool: Rc<PoolState>,
}

impl Temp {
    pub fn index(&self) -> u16 {
        FIRST_INTERNAL_TEMP + self.slot
    }

    pub fn dst(&self) -> DstReg {
        DstReg::temp(self.index())
    }

    pub fn src(&self) -> SrcReg {
        SrcReg::temp(self.index())
    }
}

impl Drop for Temp {
    fn drop(&mut self) {
        let used = self.pool.used.get();
        debug_assert!(used & (1 << self.slot) != 0);
        self.pool.used.set(used & !(1 << self.slot));
        self.pool.released.set(self.pool.released.get() + 1);
    }
}

/// Output of a finished expansion.
#[derive(Debug)]
pub struct BuiltProgram {
    pub insns: Vec<Insn>,
    /// The program's parameters plus entries added during expansion.
    pub params: ParameterList,
    pub temps: TempPoolStats,
}

pub struct ProgramBuilder<'a> {
    program: &'a FragmentProgram,
    key: &'a WmProgKey,
    insns: Vec<Insn>,
    params: ParameterList,
    temps: TempPool,
    pixel_xy: Option<Temp>,
    delta_xy: Option<Temp>,
    pixel_w: Option<Temp>,
    interp_emitted: u32,
    provenance: Option<u32>,
}

impl<'a> ProgramBuilder<'a> {
    /// Starts an expansion, reusing `buffer`'s allocation for the instruction list.
    pub fn new(program: &'a FragmentProgram, key: &'a WmProgKey, mut buffer: Vec<Insn>) -> Self {
        buffer.clear();
        Self {
            program,
            key,
            insns: buffer,
            params: program.parameters.clone(),
            temps: TempPool::new(),
            pixel_xy: None,
            delta_xy: None,
            pixel_w: None,
            interp_emitted: 0,
            provenance: None,
        }
    }

    pub fn program(&self) -> &'a FragmentProgram {
        self.program
    }

    pub fn key(&self) -> &'a WmProgKey {
        self.key
    }

    pub fn params_mut(&mut self) -> &mut ParameterList {
        &mut self.params
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    /// Source instruction subsequent emits are attributed to.
    pub fn set_provenance(&mut self, index: Option<u32>) {
        self.provenance = index;
    }

    pub fn acquire_temp(&self) -> Result<Temp, CompileError> {
        self.temps.acquire()
    }

    pub fn emit(
        &mut self,
        op: WmOp,
        dst: DstReg,
        src: [SrcReg; 3],
    ) -> Result<&mut Insn, CompileError> {
        self.push(Insn::new(op, dst, src))
    }

    /// Appends `insn` and returns it for further adjustment.
    pub fn push(&mut self, mut insn: Insn) -> Result<&mut Insn, CompileError> {
        if self.insns.len() >= MAX_EXPANDED_INSNS {
            return Err(ResourceError::TooManyInstructions {
                count: self.insns.len() + 1,
                max: MAX_EXPANDED_INSNS,
            }
            .into());
        }
        insn.provenance = self.provenance;
        let idx = self.insns.len();
        self.insns.push(insn);
        Ok(&mut self.insns[idx])
    }

    /// `pixel_xy.xy = PIXELXY payload.header`
    pub fn pixel_xy(&mut self) -> Result<SrcReg, CompileError> {
        if let Some(temp) = &self.pixel_xy {
            return Ok(temp.src());
        }
        let temp = self.temps.acquire()?;
        self.emit(
            WmOp::PixelXy,
            temp.dst().masked(ComponentMask::XY),
            [header(), SrcReg::undef(), SrcReg::undef()],
        )?;
        let src = temp.src();
        self.pixel_xy = Some(temp);
        Ok(src)
    }

    /// `delta_xy.xy = DELTAXY pixel_xy, payload.header`
    pub fn delta_xy(&mut self) -> Result<SrcReg, CompileError> {
        if let Some(temp) = &self.delta_xy {
            return Ok(temp.src());
        }
        let temp = self.temps.acquire()?;
        let pixel_xy = self.pixel_xy()?;
        self.emit(
            WmOp::DeltaXy,
            temp.dst().masked(ComponentMask::XY),
            [pixel_xy, header(), SrcReg::undef()],
        )?;
        let src = temp.src();
        self.delta_xy = Some(temp);
        Ok(src)
    }

    /// `pixel_w.w = PIXELW payload.setup[WPOS], delta_xy`
    pub fn pixel_w(&mut self) -> Result<SrcReg, CompileError> {
        if let Some(temp) = &self.pixel_w {
            return Ok(temp.src());
        }
        let temp = self.temps.acquire()?;
        let deltas = self.delta_xy()?;
        self.emit(
            WmOp::PixelW,
            temp.dst().masked(ComponentMask::W),
            [
                SrcReg::new(RegFile::Payload, attrib::WPOS),
                deltas,
                SrcReg::undef(),
            ],
        )?;
        let src = temp.src();
        self.pixel_w = Some(temp);
        Ok(src)
    }

    pub fn interp_emitted(&self, attr: u16) -> bool {
        self.interp_emitted & (1 << attr) != 0
    }

    pub fn mark_interp_emitted(&mut self, attr: u16) {
        self.interp_emitted |= 1 << attr;
    }

    pub fn temp_stats(&self) -> TempPoolStats {
        TempPoolStats {
            retained: self.retained(),
            ..self.temps.stats()
        }
    }

    fn retained(&self) -> u32 {
        [&self.pixel_xy, &self.delta_xy, &self.pixel_w]
            .iter()
            .filter(|t| t.is_some())
            .count() as u32
    }

    /// Ends the expansion. Derived values are released here; every other temporary must already
    /// be back in the pool.
    pub fn finish(mut self) -> BuiltProgram {
        let retained = self.retained();
        debug_assert_eq!(self.temps.outstanding(), retained);
        self.pixel_xy = None;
        self.delta_xy = None;
        self.pixel_w = None;
        BuiltProgram {
            insns: self.insns,
            params: self.params,
            temps: TempPoolStats {
                retained,
                ..self.temps.stats()
            },
        }
    }
}

fn header() -> SrcReg {
    SrcReg::new(RegFile::Payload, PAYLOAD_HEADER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_a_resource_error() {
        let pool = TempPool::new();
        let held: Vec<Temp> = (0..INTERNAL_TEMP_COUNT)
            .map(|_| pool.acquire().unwrap())
            .collect();
        assert_eq!(pool.outstanding(), INTERNAL_TEMP_COUNT);
        let err = pool.acquire().unwrap_err();
        assert_eq!(
            err,
            CompileError::ResourceExhausted(ResourceError::OutOfTemporaries { pool_size: 32 })
        );
        drop(held);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn dropped_temps_are_reused_lowest_first() {
        let pool = TempPool::new();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.index(), FIRST_INTERNAL_TEMP);
        assert_eq!(b.index(), FIRST_INTERNAL_TEMP + 1);
        drop(a);
        let c = pool.acquire().unwrap();
        assert_eq!(c.index(), FIRST_INTERNAL_TEMP);
        let stats = pool.stats();
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn derived_values_are_memoized() {
        let program = FragmentProgram::new(1, Vec::new());
        let key = WmProgKey::default();
        let mut b = ProgramBuilder::new(&program, &key, Vec::new());

        let w0 = b.pixel_w().unwrap();
        let len = b.insns().len();
        assert_eq!(len, 3, "PIXELXY, DELTAXY, PIXELW");
        let w1 = b.pixel_w().unwrap();
        let d = b.delta_xy().unwrap();
        assert_eq!(w0, w1);
        assert_eq!(b.insns().len(), len);
        assert!(b.insns()[1].is(WmOp::DeltaXy));
        assert_eq!(b.insns()[1].dst.index, d.index);

        let built = b.finish();
        assert_eq!(built.temps.retained, 3);
        assert_eq!(built.temps.acquired, built.temps.released);
    }

    #[test]
    fn emit_returns_handle_for_mutation() {
        let program = FragmentProgram::new(1, Vec::new());
        let key = WmProgKey::default();
        let mut b = ProgramBuilder::new(&program, &key, Vec::new());
        b.set_provenance(Some(4));
        b.emit(
            WmOp::Mov,
            DstReg::temp(0),
            [SrcReg::temp(1).negated(), SrcReg::undef(), SrcReg::undef()],
        )
        .unwrap()
        .src[0]
            .negate = ComponentMask::empty();
        assert!(b.insns()[0].src[0].negate.is_empty());
        assert_eq!(b.insns()[0].provenance, Some(4));
    }
}
