//! # Veneer - A Retargetable Dynamic Binary Translator
//!
//! Veneer compiles guest machine code to native host code through a generic
//! typed intermediate representation. Guest instruction sets plug in as
//! [`Architecture`] front-ends; the core discovers reachable code, lifts it
//! into Cranelift IR, and hands back a callable native entry.
//!
//! ## Architecture
//!
//! ```text
//! guest RAM + entry PC
//!        |
//!     tagger          classify every byte: code, branch target, call
//!        |            return site, dispatch entry
//!   recompiler        one block per label, dispatch switch on PC,
//!        |            per-instruction lifting via the front-end
//!   JIT driver        verify, optimize, compile, materialize entry
//!        |
//!  i32 jitmain(u8 *RAM, reg_t *reg, void (*debug)(u8 *, reg_t *))
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut cpu = Cpu::new(Box::new(MyArch::new()));
//! cpu.set_ram(image);
//! cpu.set_code(0x0000, 0x4000, 0x0200);
//! cpu.tag(0x0200);
//! let status = cpu.run(None)?;
//! ```
//!
//! Register records are described declaratively and lowered by the
//! [`regfile`] builder into a packed record of storage cells with per-name
//! lookup, covering sub-registers, hardwired expressions, bidirectional
//! aliases, update-on-write bindings, and condition-flag pseudo registers.

pub mod arch;
pub mod cpu;
pub mod jit;
pub mod regfile;
pub mod tag;

pub use arch::{Addr, Architecture, DebugCallout, Flow, FlowInfo};
pub use cpu::{Cpu, CpuError};
pub use jit::{
    CompiledEntry, DebugFlags, JitError, Lift, JIT_RETURN_FUNCNOTFOUND, OPTIMIZE_ALL,
    OPTIMIZE_NONE,
};
pub use regfile::{
    build as build_register_file, FieldKind, FieldRef, RegField, RegType, RegUnit, RegisterDesc,
    RegisterBuildError, RegisterFile, SlotRef,
};
pub use tag::{Tag, TagMap};
