//! Architecture front-end boundary
//!
//! A guest instruction set plugs into the core through the [`Architecture`]
//! trait: it decodes instruction lengths, classifies control flow for the
//! tagger, and emits Cranelift IR for single instructions through a
//! [`Lift`](crate::jit::Lift) context. Everything architecture-specific
//! enters the core through this trait and nothing else.

use cranelift_frontend::Variable;

use crate::jit::{JitError, Lift};

/// A guest address.
pub type Addr = u64;

/// Per-instruction debug callout invoked by generated code.
///
/// Receives the guest RAM base and the register record, in that order.
pub type DebugCallout = unsafe extern "C" fn(ram: *mut u8, reg: *mut u8);

/// Abstract control-flow class of one guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Undecodable or trapping instruction; terminates discovery.
    Err,
    /// Return from subroutine; terminates discovery.
    Ret,
    /// Unconditional transfer, falls nowhere.
    Jump,
    /// Transfer that conceptually returns to `pc + len`.
    Call,
    /// Conditional transfer, may take the target or `pc + len`.
    Branch,
    /// Straight-line execution.
    Continue,
}

/// Flow classification of a single instruction, as reported by a front-end.
#[derive(Debug, Clone, Copy)]
pub struct FlowInfo {
    pub flow: Flow,
    /// Instruction length in bytes.
    pub len: usize,
    /// Static transfer target for `Jump`/`Call`/`Branch`; `None` when the
    /// target is computed at run time (indirect).
    pub target: Option<Addr>,
}

impl FlowInfo {
    pub fn new(flow: Flow, len: usize) -> Self {
        FlowInfo {
            flow,
            len,
            target: None,
        }
    }

    pub fn to(flow: Flow, len: usize, target: Addr) -> Self {
        FlowInfo {
            flow,
            len,
            target: Some(target),
        }
    }
}

/// A guest instruction-set front-end.
///
/// The register record is an opaque byte buffer of `reg_bytes()` length with
/// a layout only the front-end knows; the core allocates it, passes it to
/// generated code, and hands slices back for PC inspection.
pub trait Architecture {
    /// Short architecture name for diagnostics.
    fn name(&self) -> &'static str;

    /// Render a human-readable line for the instruction at `pc` into `out`;
    /// returns the instruction length in bytes.
    fn disasm_instr(&self, ram: &[u8], pc: Addr, out: &mut String) -> usize;

    /// Classify the control flow of the instruction at `pc`.
    fn tag_instr(&self, ram: &[u8], pc: Addr) -> FlowInfo;

    /// Size in bytes of the guest register record.
    fn reg_bytes(&self) -> usize;

    /// Initialize a freshly allocated register record.
    fn init_reg(&self, reg: &mut [u8]);

    /// Read the current program counter out of the register record.
    fn read_pc(&self, reg: &[u8]) -> Addr;

    /// Receive the architecture flag word configured on the translation
    /// unit. The core does not interpret it.
    fn set_flags(&mut self, _flags: u32) {}

    /// Declare host-scalar locals for the guest registers and load them from
    /// the incoming register pointer. Runs in the `entry` block. Returns the
    /// variable holding the guest PC, which the dispatch switch reads and
    /// exit paths write.
    fn emit_decode_reg(&self, lift: &mut Lift<'_, '_>) -> Variable;

    /// Store the host-scalar locals back into the register record. Runs in
    /// the `ret` block.
    fn emit_spill_reg(&self, lift: &mut Lift<'_, '_>);

    /// Emit IR for the instruction at `pc` into the current block; returns
    /// the instruction length. For non-`Continue` flow the front-end must
    /// terminate the block itself: branch to another lifted block, to the
    /// dispatch block for indirect control flow, or to `ret` with a status
    /// code.
    fn emit_instr(
        &self,
        lift: &mut Lift<'_, '_>,
        ram: &[u8],
        pc: Addr,
    ) -> Result<usize, JitError>;
}
