//! Fragment ("WM") program compiler for Gen4 class Intel GPUs.
//!
//! A [`FragmentProgram`] is compiled for one [`WmProgKey`] (the pipeline state that affects code
//! generation) through these passes:
//!
//! 1. [`expand`]: interpolation, texture coordinate fixups, compound opcodes, render target
//!    writes.
//! 2. [`lower`]: per-component value form with copy propagation.
//! 3. [`dce`]: dead instructions and components.
//! 4. [`regalloc`]: GRF assignment under a register budget, spilling to scratch.
//! 5. [`emit`]: hardware instructions and their binary encoding.
//!
//! [`ProgramCache`] memoizes the result per key and [`WmProgState`] derives the key from a
//! [`PipelineState`] snapshot before each draw.

pub mod builder;
pub mod cache;
pub mod compile;
pub mod constants;
pub mod dce;
pub mod emit;
pub mod error;
pub mod expand;
pub mod ir;
pub mod key;
pub mod limits;
pub mod lower;
pub mod opcode;
pub mod program;
pub mod regalloc;
pub mod state;

pub use cache::{CacheLookup, CacheLookupSource, CacheOptions, CacheStats, ProgramCache};
pub use compile::{
    compile_program, CompilationContext, CompileOptions, CompiledProgram, PassStats, WmProgData,
};
pub use constants::{ConstantLayout, ParamResolver};
pub use error::{CompileError, InternalError, ResourceError};
pub use key::{AaMode, IzFlags, WmProgKey};
pub use opcode::Opcode;
pub use program::{FragmentProgram, Instruction, Parameter, ParameterList, StateRef};
pub use state::{populate_key, DirtyFlags, PipelineState, WmProgState};
