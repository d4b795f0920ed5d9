//! Guest code discovery
//!
//! The tagger walks guest memory from an entry point, following static
//! control flow, and classifies every byte of the code window with a [`Tag`]
//! bitset. The recompiler later derives basic-block boundaries and the
//! dispatch table from these tags.

use bitflags::bitflags;
use tracing::trace;

use crate::arch::{Addr, Architecture, Flow};

bitflags! {
    /// Per-address classification byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Tag: u8 {
        /// First byte of a decoded instruction.
        const CODE = 1 << 0;
        /// Some branch transfers to this address.
        const CODE_TARGET = 1 << 1;
        /// Return site of a call, a dynamic re-entry point.
        const AFTER_CALL = 1 << 2;
        /// Label forced by a preceding conditional branch.
        const AFTER_BRANCH = 1 << 3;
        /// Static entry point, included in the dispatch table.
        const ENTRY = 1 << 4;
        /// Call target. Reserved, not consumed by the recompiler.
        const SUBROUTINE = 1 << 5;
        /// This instruction is a call. Reserved for return prediction.
        const CALL = 1 << 6;
        /// Same-stack-level sentinel. Reserved for return prediction.
        const SAME_ENTRY = 1 << 7;
    }
}

impl Tag {
    /// Any tag that forces a basic-block label.
    pub const LABEL: Tag = Tag::CODE_TARGET
        .union(Tag::ENTRY)
        .union(Tag::AFTER_CALL)
        .union(Tag::AFTER_BRANCH);

    /// Legal dynamic re-entry points, enumerated by the dispatch switch.
    pub const DISPATCH: Tag = Tag::ENTRY.union(Tag::AFTER_CALL);
}

/// One tag byte per guest address in the code window.
#[derive(Debug, Clone)]
pub struct TagMap {
    start: Addr,
    tags: Vec<Tag>,
}

impl TagMap {
    pub(crate) fn new(start: Addr, end: Addr) -> Self {
        TagMap {
            start,
            tags: vec![Tag::empty(); (end - start) as usize],
        }
    }

    pub fn start(&self) -> Addr {
        self.start
    }

    pub fn end(&self) -> Addr {
        self.start + self.tags.len() as Addr
    }

    fn in_window(&self, addr: Addr) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Tag at `addr`; empty outside the window.
    pub fn get(&self, addr: Addr) -> Tag {
        if self.in_window(addr) {
            self.tags[(addr - self.start) as usize]
        } else {
            Tag::empty()
        }
    }

    /// Or `tag` into the byte at `addr`. Out-of-window addresses are
    /// silently absorbed, which is what bounds the discovery walk.
    pub(crate) fn or_at(&mut self, addr: Addr, tag: Tag) {
        if self.in_window(addr) {
            self.tags[(addr - self.start) as usize] |= tag;
        }
    }
}

/// Walk guest code transitively from `pc`, marking reachable instructions.
///
/// Depth-first and idempotent: a `CODE` byte is a merge point already
/// explored and ends the walk. Only bits are ever added, never cleared.
pub(crate) fn walk(
    arch: &dyn Architecture,
    ram: &[u8],
    tags: &mut TagMap,
    mut pc: Addr,
    depth: usize,
) {
    // Mark before the window check so a new edge into an already explored
    // address still gets labelled.
    tags.or_at(pc, Tag::CODE_TARGET);

    loop {
        if !tags.in_window(pc) {
            return;
        }
        if tags.get(pc).contains(Tag::CODE) {
            return;
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            let mut line = String::new();
            arch.disasm_instr(ram, pc, &mut line);
            trace!("{:depth$}{pc:#06x}: {line}", "");
        }

        tags.or_at(pc, Tag::CODE);

        let info = arch.tag_instr(ram, pc);
        let len = info.len as Addr;

        match info.flow {
            Flow::Err | Flow::Ret => return,
            Flow::Jump => {
                if let Some(target) = info.target {
                    walk(arch, ram, tags, target, depth + 1);
                }
                return;
            }
            Flow::Call => {
                tags.or_at(pc, Tag::CALL);
                // The instruction after the call needs a label: execution
                // re-enters there when the callee returns.
                tags.or_at(pc + len, Tag::AFTER_CALL);
                if let Some(target) = info.target {
                    walk(arch, ram, tags, target, depth + 1);
                }
            }
            Flow::Branch => {
                if let Some(target) = info.target {
                    walk(arch, ram, tags, target, depth + 1);
                }
                tags.or_at(pc + len, Tag::AFTER_BRANCH);
            }
            Flow::Continue => {}
        }

        pc += len;
    }
}
