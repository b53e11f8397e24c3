//! Compilation driver: runs every pass for one program variant.

use tracing::debug;

use crate::builder::{BuiltProgram, TempPoolStats};
use crate::constants::ConstantLayout;
use crate::dce::{self, DceStats};
use crate::emit::{disassemble, CodeEmitter, Gen4Emitter};
use crate::error::CompileError;
use crate::expand::expand_program_into;
use crate::ir::{self, Insn};
use crate::key::{IzFlags, WmProgKey};
use crate::limits::{DEFAULT_GRF_BUDGET, HW_INSN_BYTES};
use crate::lower;
use crate::program::FragmentProgram;
use crate::regalloc;

const DUMP_TARGET: &str = "brw_wm::dump";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// GRFs one thread may use, including the pinned payload and constant registers.
    pub grf_budget: u32,
    /// Spill to scratch memory when the budget runs out instead of failing.
    pub allow_spilling: bool,
    /// Log every intermediate listing at `debug` level under the `brw_wm::dump` target.
    pub dump_passes: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            grf_budget: DEFAULT_GRF_BUDGET,
            allow_spilling: true,
            dump_passes: false,
        }
    }
}

/// Per-pass counters of the last compilation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub source_insns: usize,
    pub expanded_insns: usize,
    pub lowered_insns: usize,
    pub dce: DceStats,
    pub hw_insns: usize,
    pub spills: usize,
    pub temps: TempPoolStats,
}

/// Scratch state reused across compilations. Nothing in it survives into the next compilation
/// except allocations.
#[derive(Debug, Default)]
pub struct CompilationContext {
    insn_buffer: Vec<Insn>,
    emitter: Gen4Emitter,
    last_stats: Option<PassStats>,
}

impl CompilationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_stats(&self) -> Option<&PassStats> {
        self.last_stats.as_ref()
    }

    fn reset(&mut self) {
        self.insn_buffer.clear();
        self.last_stats = None;
    }
}

/// Metadata the fixed-function units need to dispatch the program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WmProgData {
    /// Registers used, payload included.
    pub total_grf: u32,
    /// Per-thread scratch space in bytes.
    pub total_scratch: u32,
    pub first_curbe_grf: u32,
    pub curb_read_length: u32,
    pub urb_read_length: u32,
    pub uses_kill: bool,
    pub computes_depth: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProgram {
    pub key: WmProgKey,
    /// Encoded instructions, [`HW_INSN_BYTES`] each.
    pub code: Vec<u8>,
    pub prog_data: WmProgData,
    pub constants: ConstantLayout,
    pub hash: blake3::Hash,
}

impl CompiledProgram {
    pub fn nr_insns(&self) -> usize {
        self.code.len() / HW_INSN_BYTES
    }
}

fn dump(options: &CompileOptions, pass: &str, listing: impl FnOnce() -> String) {
    if options.dump_passes {
        debug!(target: DUMP_TARGET, pass, "\n{}", listing());
    }
}

/// Compiles `program` for the pipeline state captured in `key`.
pub fn compile_program(
    ctx: &mut CompilationContext,
    program: &FragmentProgram,
    key: &WmProgKey,
    options: &CompileOptions,
) -> Result<CompiledProgram, CompileError> {
    ctx.reset();
    program.validate()?;

    let buffer = std::mem::take(&mut ctx.insn_buffer);
    let BuiltProgram {
        insns,
        params,
        temps,
    } = expand_program_into(program, key, buffer)?;
    dump(options, "expand", || ir::listing(&insns));

    let lowered = lower::lower(&insns, params, key);
    let expanded_insns = insns.len();
    ctx.insn_buffer = insns;
    let mut lowered = lowered?;
    let lowered_insns = lowered.insns.len();
    dump(options, "pass0", || lowered.listing());

    let dce = dce::run(&mut lowered);
    dump(options, "dce", || lowered.listing());

    let alloc = regalloc::run(&lowered, key, options.grf_budget, options.allow_spilling)?;
    let hw = ctx.emitter.emit(&lowered, &alloc, key)?;
    dump(options, "emit", || disassemble(&hw));
    let code = ctx.emitter.encode(&hw);

    let layout = &alloc.layout;
    let prog_data = WmProgData {
        total_grf: alloc.total_grf,
        total_scratch: alloc.scratch_bytes(),
        first_curbe_grf: layout.first_curbe_grf,
        curb_read_length: layout.curbe_read_length(),
        urb_read_length: layout.setup_attrs.len() as u32 * 2,
        uses_kill: program.uses_kill() || key.iz_flags().contains(IzFlags::KILL_ALPHATEST),
        computes_depth: program.writes_depth(),
    };
    let constants = ConstantLayout::new(&lowered.params, &layout.curbe_params);
    let stats = PassStats {
        source_insns: program.instructions.len(),
        expanded_insns,
        lowered_insns,
        dce,
        hw_insns: hw.len(),
        spills: alloc.insns.iter().map(|a| a.spills.len()).sum(),
        temps,
    };

    debug!(
        program = program.id,
        source_insns = stats.source_insns,
        expanded_insns,
        values = lowered.nr_values,
        hw_insns = stats.hw_insns,
        total_grf = prog_data.total_grf,
        scratch = prog_data.total_scratch,
        "compiled fragment program"
    );
    ctx.last_stats = Some(stats);

    Ok(CompiledProgram {
        key: *key,
        hash: blake3::hash(&code),
        code,
        prog_data,
        constants,
    })
}
