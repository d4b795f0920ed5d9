//! Translation unit lifecycle
//!
//! A [`Cpu`] binds an architecture front-end to a guest RAM image and a code
//! window, owns the tag array and the compiled entry, and drives the
//! tag / compile / run / flush cycle.

use std::fmt;

use tracing::{debug, info};

use crate::arch::{Addr, Architecture, DebugCallout};
use crate::jit::{self, CompiledEntry, DebugFlags, JitError, JitRequest, OPTIMIZE_NONE};
use crate::tag::{self, Tag, TagMap};

/// Callout used when the host does not install one.
unsafe extern "C" fn noop_debug(_ram: *mut u8, _reg: *mut u8) {}

/// Errors surfaced by the translation-unit API.
#[derive(Debug)]
pub enum CpuError {
    /// No RAM image has been bound.
    MissingRam,
    /// The code window is empty or inverted.
    EmptyCodeWindow,
    Jit(JitError),
}

impl fmt::Display for CpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuError::MissingRam => write!(f, "no guest RAM image is bound"),
            CpuError::EmptyCodeWindow => write!(f, "the code window is empty"),
            CpuError::Jit(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CpuError {}

impl From<JitError> for CpuError {
    fn from(err: JitError) -> Self {
        CpuError::Jit(err)
    }
}

/// One translation unit: an architecture, a guest RAM image, a code window,
/// and at most one compiled function at a time.
pub struct Cpu {
    arch: Box<dyn Architecture>,
    ram: Vec<u8>,
    code_start: Addr,
    code_end: Addr,
    code_entry: Addr,
    flags_optimize: u64,
    flags_debug: DebugFlags,
    flags_arch: u32,
    tags: Option<TagMap>,
    reg: Option<Box<[u8]>>,
    compiled: Option<CompiledEntry>,
}

impl Cpu {
    pub fn new(arch: Box<dyn Architecture>) -> Self {
        debug!(arch = arch.name(), "new translation unit");
        Cpu {
            arch,
            ram: Vec::new(),
            code_start: 0,
            code_end: 0,
            code_entry: 0,
            flags_optimize: OPTIMIZE_NONE,
            flags_debug: DebugFlags::empty(),
            flags_arch: 0,
            tags: None,
            reg: None,
            compiled: None,
        }
    }

    /// Bind the guest RAM image. The unit owns it; the compiled function
    /// receives it as its first argument on every run.
    pub fn set_ram(&mut self, image: Vec<u8>) {
        self.ram = image;
        self.compiled = None;
        self.tags = None;
    }

    /// Bind the code window `[start, end)` and the static entry PC.
    pub fn set_code(&mut self, start: Addr, end: Addr, entry: Addr) {
        self.code_start = start;
        self.code_end = end;
        self.code_entry = entry;
        // The tag array is sized to the window; both it and any compiled
        // function are stale now.
        self.tags = None;
        self.compiled = None;
    }

    pub fn set_flags_optimize(&mut self, flags: u64) {
        self.flags_optimize = flags;
    }

    pub fn set_flags_debug(&mut self, flags: DebugFlags) {
        self.flags_debug = flags;
    }

    /// Architecture flag word; opaque to the core, forwarded to the
    /// front-end.
    pub fn set_flags_arch(&mut self, flags: u32) {
        self.flags_arch = flags;
        self.arch.set_flags(flags);
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    /// The register record, once a run has allocated it.
    pub fn reg(&self) -> Option<&[u8]> {
        self.reg.as_deref()
    }

    pub fn reg_mut(&mut self) -> Option<&mut [u8]> {
        self.reg.as_deref_mut()
    }

    /// The tag array, once tagging has run.
    pub fn tags(&self) -> Option<&TagMap> {
        self.tags.as_ref()
    }

    /// Mark `pc` as a static entry point and walk guest code reachable from
    /// it. A no-op in single-step mode and outside the code window.
    pub fn tag(&mut self, pc: Addr) {
        if self.flags_debug.contains(DebugFlags::SINGLESTEP) {
            return;
        }
        let (start, end) = (self.code_start, self.code_end);
        let tags = self.tags.get_or_insert_with(|| TagMap::new(start, end));
        debug!("tagging from {pc:#06x}");
        tags.or_at(pc, Tag::ENTRY);
        tag::walk(&*self.arch, &self.ram, tags, pc, 0);
    }

    /// Render the listing line for the instruction at `pc`: address, raw
    /// bytes, mnemonic. Returns the line and the instruction length.
    pub fn disasm_instr(&self, pc: Addr) -> (String, usize) {
        let mut mnemonic = String::new();
        let len = self.arch.disasm_instr(&self.ram, pc, &mut mnemonic);
        let mut line = format!(".,{pc:04x} ");
        for offset in 0..len {
            let byte = self
                .ram
                .get((pc as usize) + offset)
                .copied()
                .unwrap_or_default();
            line.push_str(&format!("{byte:02X} "));
        }
        while line.len() < 20 {
            line.push(' ');
        }
        line.push_str(&mnemonic);
        (line, len)
    }

    /// Run the guest. Lazily initializes the register record, tags the
    /// entry (whole-region mode), compiles, and calls the native entry.
    /// Returns the status code the compiled function exits with.
    pub fn run(&mut self, debug: Option<DebugCallout>) -> Result<i32, CpuError> {
        if self.ram.is_empty() {
            return Err(CpuError::MissingRam);
        }
        if self.code_end <= self.code_start {
            return Err(CpuError::EmptyCodeWindow);
        }

        if self.reg.is_none() {
            let mut reg = vec![0u8; self.arch.reg_bytes()].into_boxed_slice();
            self.arch.init_reg(&mut reg);
            self.reg = Some(reg);
        }

        if self.compiled.is_none() {
            if !self.flags_debug.contains(DebugFlags::SINGLESTEP) {
                self.tag(self.code_entry);
            }
            let reg = self.reg.as_deref().unwrap_or_default();
            let request = JitRequest {
                arch: &*self.arch,
                ram: &self.ram,
                code_start: self.code_start,
                code_end: self.code_end,
                tags: self.tags.as_ref(),
                reg,
                debug_flags: self.flags_debug,
                flags_optimize: self.flags_optimize,
            };
            self.compiled = Some(jit::compile(&request)?);
        }

        let (Some(entry), Some(reg)) = (self.compiled.as_ref(), self.reg.as_deref_mut()) else {
            unreachable!("initialized above");
        };
        let ram_ptr = self.ram.as_mut_ptr();
        let reg_ptr = reg.as_mut_ptr();
        let callout = debug.unwrap_or(noop_debug);

        // Safety: ram and reg are owned by this unit and exclusively
        // borrowed through &mut self for the duration of the call; the
        // entry was compiled against this very window and record size.
        let status = unsafe { entry.call(ram_ptr, reg_ptr, callout) };
        debug!(status, "guest returned");
        Ok(status)
    }

    /// Release the compiled function and its machine code. The unit keeps
    /// its tags and register state; the next `run` recompiles.
    pub fn flush(&mut self) {
        if self.compiled.take().is_some() {
            info!("flushed compiled function");
        }
    }
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("arch", &self.arch.name())
            .field("code_start", &self.code_start)
            .field("code_end", &self.code_end)
            .field("code_entry", &self.code_entry)
            .field("compiled", &self.compiled.is_some())
            .finish()
    }
}
