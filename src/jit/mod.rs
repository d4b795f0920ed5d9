//! JIT compilation of tagged guest code
//!
//! One host function is compiled per translation unit:
//!
//! ```text
//! tagged window -> FunctionTranslator -> Cranelift IR -> native entry
//! ```
//!
//! The compiled function has the guest entry ABI
//! `extern "C" fn(*mut u8 ram, *mut u8 reg, debug) -> i32`. Its `entry`
//! block unpacks the register record into host scalars, `dispatch` switches
//! on the guest PC to a lifted block, and `ret` spills the scalars back and
//! returns a status code.

mod code;
mod compiler;
mod translate;

pub use code::CompiledEntry;
pub(crate) use compiler::{compile, JitRequest};
pub use translate::Lift;

use std::fmt;

use bitflags::bitflags;

use crate::arch::Addr;

/// Status returned when dispatch falls through: execution reached a guest PC
/// with no compiled re-entry point.
pub const JIT_RETURN_FUNCNOTFOUND: i32 = 1;

/// Optimizer flag word with every pass enabled.
pub const OPTIMIZE_ALL: u64 = u64::MAX;
/// Optimizer flag word disabling the optimizer.
pub const OPTIMIZE_NONE: u64 = 0;

bitflags! {
    /// Debug behavior of a translation unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Bypass the tagger and compile one-instruction functions.
        const SINGLESTEP = 1 << 0;
        /// Dump the IR before optimization.
        const PRINT_IR = 1 << 1;
        /// Dump the compiled form after optimization.
        const PRINT_IR_OPTIMIZED = 1 << 2;
    }
}

/// JIT compilation failure.
#[derive(Debug, Clone)]
pub enum JitError {
    /// Cranelift setup or compilation failed.
    Compile(String),
    /// A lifted block or fallthrough target has no basic block. Indicates a
    /// tagging or lifting bug.
    MissingBasicBlock(Addr),
    /// The built function failed IR verification.
    Verify(String),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::Compile(msg) => write!(f, "JIT compilation failed: {msg}"),
            JitError::MissingBasicBlock(pc) => {
                write!(f, "basic block {pc:#010x} not found")
            }
            JitError::Verify(msg) => write!(f, "IR verification failed: {msg}"),
        }
    }
}

impl std::error::Error for JitError {}
