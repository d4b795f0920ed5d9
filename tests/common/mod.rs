//! Shared test front-end: a minimal MOS 6502.
//!
//! Implements just enough of the instruction set to exercise every flow
//! class the core handles: `LDA #imm`, `STA abs`, `NOP`, `BEQ rel`,
//! `JSR abs`, `RTS`, and `BRK`. The register record is a `repr(C)` struct
//! the emitters address by field offset.

use std::cell::Cell;
use std::mem::offset_of;

use cranelift_codegen::ir::types::{I16, I32, I8};
use cranelift_codegen::ir::{InstBuilder, MemFlags, Value};
use cranelift_frontend::Variable;

use veneer::{Addr, Architecture, Flow, FlowInfo, JitError, Lift};

/// Status returned by a lifted `BRK`.
pub const BRK_RETURN: i32 = 0x6502;

/// Architecture flag: call the debug callout before every lifted
/// instruction.
pub const ARCH_TRACE_CALLOUT: u32 = 1 << 0;

#[allow(dead_code)]
pub const FLAG_C: u8 = 0x01;
pub const FLAG_Z: u8 = 0x02;
pub const FLAG_N: u8 = 0x80;

/// Guest register record.
#[repr(C)]
pub struct Reg6502 {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub s: u8,
    pub p: u8,
    pub pc: u16,
}

pub const OFF_A: usize = offset_of!(Reg6502, a);
pub const OFF_X: usize = offset_of!(Reg6502, x);
pub const OFF_Y: usize = offset_of!(Reg6502, y);
pub const OFF_S: usize = offset_of!(Reg6502, s);
pub const OFF_P: usize = offset_of!(Reg6502, p);
pub const OFF_PC: usize = offset_of!(Reg6502, pc);

pub fn reg_a(reg: &[u8]) -> u8 {
    reg[OFF_A]
}

#[allow(dead_code)]
pub fn reg_p(reg: &[u8]) -> u8 {
    reg[OFF_P]
}

pub fn reg_pc(reg: &[u8]) -> u16 {
    u16::from_le_bytes([reg[OFF_PC], reg[OFF_PC + 1]])
}

pub fn set_reg_pc(reg: &mut [u8], pc: u16) {
    reg[OFF_PC..OFF_PC + 2].copy_from_slice(&pc.to_le_bytes());
}

pub fn set_reg_p(reg: &mut [u8], p: u8) {
    reg[OFF_P] = p;
}

/// Host-scalar holders for the guest registers, created by the decode.
#[derive(Clone, Copy)]
struct RegVars {
    a: Variable,
    x: Variable,
    y: Variable,
    s: Variable,
    p: Variable,
    pc: Variable,
}

pub struct Mos6502 {
    flags: Cell<u32>,
    vars: Cell<Option<RegVars>>,
}

impl Mos6502 {
    pub fn new() -> Self {
        Mos6502 {
            flags: Cell::new(0),
            vars: Cell::new(None),
        }
    }

    fn vars(&self) -> RegVars {
        self.vars.get().expect("register decode ran first")
    }

    /// Update Z and N in the status variable from an 8-bit result.
    fn emit_set_zn(&self, lift: &mut Lift<'_, '_>, value: Value) {
        let vars = self.vars();
        let p = lift.builder.use_var(vars.p);
        let keep = lift
            .builder
            .ins()
            .iconst(I8, (!(FLAG_Z | FLAG_N)) as i8 as i64);
        let p = lift.builder.ins().band(p, keep);
        let is_zero = lift.builder.ins().icmp_imm(
            cranelift_codegen::ir::condcodes::IntCC::Equal,
            value,
            0,
        );
        let z = lift.builder.ins().ishl_imm(is_zero, 1);
        let nmask = lift.builder.ins().iconst(I8, FLAG_N as i8 as i64);
        let n = lift.builder.ins().band(value, nmask);
        let p = lift.builder.ins().bor(p, z);
        let p = lift.builder.ins().bor(p, n);
        lift.builder.def_var(vars.p, p);
    }

    /// Host address of the 6502 stack slot `0x0100 + s`.
    fn emit_stack_addr(&self, lift: &mut Lift<'_, '_>, s: Value) -> Value {
        let ptr_type = lift.ptr_type();
        let s_wide = lift.builder.ins().uextend(ptr_type, s);
        let base = lift.builder.ins().iadd_imm(lift.ram, 0x100);
        lift.builder.ins().iadd(base, s_wide)
    }

    /// Set the PC variable and resolve through the dispatch switch.
    fn emit_goto(&self, lift: &mut Lift<'_, '_>, target: Addr) {
        let vars = self.vars();
        match lift.block_at(target) {
            Some(block) => {
                lift.builder.ins().jump(block, &[]);
            }
            None => {
                let pc = lift.builder.ins().iconst(I32, target as i64);
                lift.builder.def_var(vars.pc, pc);
                lift.jump_dispatch();
            }
        }
    }
}

impl Architecture for Mos6502 {
    fn name(&self) -> &'static str {
        "6502"
    }

    fn disasm_instr(&self, ram: &[u8], pc: Addr, out: &mut String) -> usize {
        let at = pc as usize;
        let info = self.tag_instr(ram, pc);
        match ram[at] {
            0xa9 => out.push_str(&format!("LDA #${:02X}", ram[at + 1])),
            0x8d => out.push_str(&format!(
                "STA ${:02X}{:02X}",
                ram[at + 2],
                ram[at + 1]
            )),
            0xea => out.push_str("NOP"),
            0xf0 => out.push_str(&format!(
                "BEQ ${:04X}",
                info.target.unwrap_or_default()
            )),
            0x20 => out.push_str(&format!(
                "JSR ${:04X}",
                info.target.unwrap_or_default()
            )),
            0x60 => out.push_str("RTS"),
            0x00 => out.push_str("BRK"),
            other => out.push_str(&format!(".byte ${other:02X}")),
        }
        info.len
    }

    fn tag_instr(&self, ram: &[u8], pc: Addr) -> FlowInfo {
        let at = pc as usize;
        match ram[at] {
            0xa9 => FlowInfo::new(Flow::Continue, 2),
            0x8d => FlowInfo::new(Flow::Continue, 3),
            0xea => FlowInfo::new(Flow::Continue, 1),
            0xf0 => {
                let rel = ram[at + 1] as i8 as i64;
                FlowInfo::to(Flow::Branch, 2, (pc as i64 + 2 + rel) as Addr)
            }
            0x20 => {
                let target = ram[at + 1] as Addr | (ram[at + 2] as Addr) << 8;
                FlowInfo::to(Flow::Call, 3, target)
            }
            0x60 => FlowInfo::new(Flow::Ret, 1),
            _ => FlowInfo::new(Flow::Err, 1),
        }
    }

    fn reg_bytes(&self) -> usize {
        std::mem::size_of::<Reg6502>()
    }

    fn init_reg(&self, reg: &mut [u8]) {
        reg.fill(0);
        reg[OFF_S] = 0xfd;
    }

    fn read_pc(&self, reg: &[u8]) -> Addr {
        reg_pc(reg) as Addr
    }

    fn set_flags(&mut self, flags: u32) {
        self.flags.set(flags);
    }

    fn emit_decode_reg(&self, lift: &mut Lift<'_, '_>) -> Variable {
        let vars = RegVars {
            a: lift.declare_var(I8),
            x: lift.declare_var(I8),
            y: lift.declare_var(I8),
            s: lift.declare_var(I8),
            p: lift.declare_var(I8),
            pc: lift.declare_var(I32),
        };
        for (var, offset) in [
            (vars.a, OFF_A),
            (vars.x, OFF_X),
            (vars.y, OFF_Y),
            (vars.s, OFF_S),
            (vars.p, OFF_P),
        ] {
            let value = lift
                .builder
                .ins()
                .load(I8, MemFlags::trusted(), lift.reg, offset as i32);
            lift.builder.def_var(var, value);
        }
        let pc16 = lift
            .builder
            .ins()
            .load(I16, MemFlags::trusted(), lift.reg, OFF_PC as i32);
        let pc32 = lift.builder.ins().uextend(I32, pc16);
        lift.builder.def_var(vars.pc, pc32);
        self.vars.set(Some(vars));
        vars.pc
    }

    fn emit_spill_reg(&self, lift: &mut Lift<'_, '_>) {
        let vars = self.vars();
        for (var, offset) in [
            (vars.a, OFF_A),
            (vars.x, OFF_X),
            (vars.y, OFF_Y),
            (vars.s, OFF_S),
            (vars.p, OFF_P),
        ] {
            let value = lift.builder.use_var(var);
            lift.builder
                .ins()
                .store(MemFlags::trusted(), value, lift.reg, offset as i32);
        }
        let pc32 = lift.builder.use_var(vars.pc);
        let pc16 = lift.builder.ins().ireduce(I16, pc32);
        lift.builder
            .ins()
            .store(MemFlags::trusted(), pc16, lift.reg, OFF_PC as i32);
    }

    fn emit_instr(
        &self,
        lift: &mut Lift<'_, '_>,
        ram: &[u8],
        pc: Addr,
    ) -> Result<usize, JitError> {
        if self.flags.get() & ARCH_TRACE_CALLOUT != 0 {
            lift.call_debug();
        }
        let vars = self.vars();
        let at = pc as usize;
        let info = self.tag_instr(ram, pc);
        match ram[at] {
            // LDA #imm
            0xa9 => {
                let value = lift.builder.ins().iconst(I8, ram[at + 1] as i8 as i64);
                lift.builder.def_var(vars.a, value);
                self.emit_set_zn(lift, value);
            }
            // STA abs
            0x8d => {
                let addr = ram[at + 1] as i64 | (ram[at + 2] as i64) << 8;
                let a = lift.builder.use_var(vars.a);
                let dest = lift.builder.ins().iadd_imm(lift.ram, addr);
                lift.builder
                    .ins()
                    .store(MemFlags::trusted(), a, dest, 0);
            }
            // NOP
            0xea => {}
            // BEQ rel
            0xf0 => {
                let target = info.target.ok_or(JitError::MissingBasicBlock(pc))?;
                let fall = pc + 2;
                let taken_block = lift
                    .block_at(target)
                    .ok_or(JitError::MissingBasicBlock(target))?;
                let fall_block = lift
                    .block_at(fall)
                    .ok_or(JitError::MissingBasicBlock(fall))?;
                let p = lift.builder.use_var(vars.p);
                let zmask = lift.builder.ins().iconst(I8, FLAG_Z as i64);
                let z = lift.builder.ins().band(p, zmask);
                lift.builder
                    .ins()
                    .brif(z, taken_block, &[], fall_block, &[]);
            }
            // JSR abs: push the address of the JSR's last byte, high first.
            0x20 => {
                let target = info.target.ok_or(JitError::MissingBasicBlock(pc))?;
                let ret_addr = pc + 2;
                let hi = lift
                    .builder
                    .ins()
                    .iconst(I8, ((ret_addr >> 8) as u8) as i8 as i64);
                let lo = lift.builder.ins().iconst(I8, (ret_addr as u8) as i8 as i64);
                let mut s = lift.builder.use_var(vars.s);
                let slot = self.emit_stack_addr(lift, s);
                lift.builder.ins().store(MemFlags::trusted(), hi, slot, 0);
                s = lift.builder.ins().iadd_imm(s, -1);
                let slot = self.emit_stack_addr(lift, s);
                lift.builder.ins().store(MemFlags::trusted(), lo, slot, 0);
                s = lift.builder.ins().iadd_imm(s, -1);
                lift.builder.def_var(vars.s, s);
                self.emit_goto(lift, target);
            }
            // RTS: pull the pushed address and resume one past it.
            0x60 => {
                let mut s = lift.builder.use_var(vars.s);
                s = lift.builder.ins().iadd_imm(s, 1);
                let slot = self.emit_stack_addr(lift, s);
                let lo = lift.builder.ins().load(I8, MemFlags::trusted(), slot, 0);
                s = lift.builder.ins().iadd_imm(s, 1);
                let slot = self.emit_stack_addr(lift, s);
                let hi = lift.builder.ins().load(I8, MemFlags::trusted(), slot, 0);
                lift.builder.def_var(vars.s, s);
                let lo32 = lift.builder.ins().uextend(I32, lo);
                let hi32 = lift.builder.ins().uextend(I32, hi);
                let hi_shifted = lift.builder.ins().ishl_imm(hi32, 8);
                let pulled = lift.builder.ins().bor(lo32, hi_shifted);
                let next = lift.builder.ins().iadd_imm(pulled, 1);
                let next = lift.builder.ins().band_imm(next, 0xffff);
                lift.builder.def_var(vars.pc, next);
                lift.jump_dispatch();
            }
            // BRK: record where we stopped and trap out.
            0x00 => {
                let here = lift.builder.ins().iconst(I32, pc as i64);
                lift.builder.def_var(vars.pc, here);
                lift.jump_ret(BRK_RETURN);
            }
            other => {
                return Err(JitError::Compile(format!(
                    "unimplemented opcode {other:#04x} at {pc:#06x}"
                )))
            }
        }
        Ok(info.len)
    }
}
