//! Centralized limits for the fragment program compiler.
//!
//! Values that describe the hardware (register file size, message register count) live next to
//! compiler-imposed caps (temporary pool size, instruction count) so that every pass agrees on
//! the same numbers.

/// Number of general purpose registers in one thread's register file.
pub const MAX_GRF: u32 = 128;

/// Default allocation budget: half of the register file.
///
/// The other half is left for the second thread the hardware dispatches onto the same EU.
pub const DEFAULT_GRF_BUDGET: u32 = MAX_GRF / 2;

/// Number of message registers (`m0..m15`) usable as SEND payload.
pub const MAX_MRF: u32 = 16;

/// Temporaries a source program may name directly. Internal temporaries are numbered after them.
pub const MAX_PROGRAM_TEMPS: u16 = 64;

/// First register index handed out by the internal temporary pool.
pub const FIRST_INTERNAL_TEMP: u16 = MAX_PROGRAM_TEMPS;

/// Size of the internal temporary pool (one bit per slot).
pub const INTERNAL_TEMP_COUNT: u32 = u32::BITS;

/// Number of texture image units / samplers.
pub const MAX_TEX_UNITS: usize = 16;

/// Number of color draw regions a single program may write.
pub const MAX_DRAW_BUFFERS: u8 = 8;

/// Maximum accepted source instructions per program.
pub const MAX_PROGRAM_INSNS: usize = 1024;

/// Maximum expanded instructions per compilation.
///
/// Expansion multiplies the source length by a small constant; anything past this is rejected
/// rather than handed to the allocator.
pub const MAX_EXPANDED_INSNS: usize = MAX_PROGRAM_INSNS * 4;

/// Bytes of scratch memory backing one spilled register.
pub const SCRATCH_SLOT_BYTES: u32 = 32;

/// Scratch space is allocated per thread in power-of-two sizes of at least this many bytes.
pub const SCRATCH_GRANULARITY: u32 = 1024;

/// Floats held by one GRF (SIMD8, 32-bit channels).
pub const GRF_FLOATS: usize = 8;

/// Size in bytes of one encoded hardware instruction.
pub const HW_INSN_BYTES: usize = 16;

const _: () = {
    assert!(DEFAULT_GRF_BUDGET <= MAX_GRF);
    assert!(INTERNAL_TEMP_COUNT == 32);
    assert!(MAX_TEX_UNITS <= u16::BITS as usize);
};
