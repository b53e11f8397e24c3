use thiserror::Error;

use crate::opcode::Opcode;

/// Why a compilation could not fit the hardware.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("internal temporary pool exhausted ({pool_size} slots)")]
    OutOfTemporaries { pool_size: u32 },
    #[error(
        "register budget of {budget} GRFs exceeded at instruction {insn} \
         ({pinned} registers pinned by payload and constants)"
    )]
    RegisterBudgetExceeded { insn: usize, budget: u32, pinned: u32 },
    #[error("instruction {insn} needs more registers than the budget of {budget} GRFs and spilling is disabled")]
    SpillingDisabled { insn: usize, budget: u32 },
    #[error("expanded program has {count} instructions (maximum {max})")]
    TooManyInstructions { count: usize, max: usize },
}

/// Invariant violations inside the compiler. These never depend on user input once the program
/// has passed [`crate::program::FragmentProgram::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("opcode {opcode} at expanded instruction {index} has no hardware lowering")]
    UnsupportedOpcode { opcode: Opcode, index: usize },
    #[error("value {value} read at instruction {insn} before it was defined")]
    UndefinedValue { value: u32, insn: usize },
    #[error("value {value} used at instruction {insn} is neither resident nor spilled")]
    LostValue { value: u32, insn: usize },
    #[error("operand of instruction {insn} does not resolve to a register")]
    UnresolvedOperand { insn: usize },
    #[error("message payload of {len} registers does not fit the message register file")]
    MessageTooLong { len: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("compilation failed: resource exhausted: {0}")]
    ResourceExhausted(#[from] ResourceError),
    #[error("invalid fragment program: {0}")]
    InvalidProgram(String),
    #[error("internal compiler error: {0}")]
    Internal(#[from] InternalError),
}

impl CompileError {
    /// Returns `true` for errors that indicate a compiler bug rather than a program or state the
    /// hardware cannot handle.
    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal(_))
    }
}
