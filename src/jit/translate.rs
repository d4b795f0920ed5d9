//! Tagged guest code to Cranelift IR translation
//!
//! `FunctionTranslator` lays out the compiled function from the tag array:
//! one block per labelled guest address, a dispatch switch over the legal
//! re-entry points, and per-block instruction lifting through the
//! architecture front-end. Front-ends emit through the [`Lift`] context,
//! which carries the function builder, the incoming pointers, and the
//! label-to-block map.

use cranelift_codegen::ir::types::I32;
use cranelift_codegen::ir::{AbiParam, Block, InstBuilder, SigRef, Signature, Type, Value};
use cranelift_frontend::{FunctionBuilder, Switch, Variable};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::arch::{Addr, Architecture, Flow};
use crate::tag::{Tag, TagMap};

use super::{JitError, JIT_RETURN_FUNCNOTFOUND};

/// Emission context handed to architecture front-ends.
///
/// Guest registers live in Cranelift variables between `entry` and `ret`;
/// the front-end declares them with [`Lift::declare_var`] while decoding the
/// register record and reads them back while spilling.
pub struct Lift<'short, 'long> {
    pub builder: &'short mut FunctionBuilder<'long>,
    /// Guest RAM base pointer argument.
    pub ram: Value,
    /// Register record pointer argument.
    pub reg: Value,
    /// Debug callout pointer argument.
    pub debug: Value,
    dispatch: Block,
    ret: Block,
    blocks: &'short FxHashMap<Addr, Block>,
    ptr_type: Type,
    pc_var: Option<Variable>,
    next_var: u32,
    debug_sig: Option<SigRef>,
}

impl<'short, 'long> Lift<'short, 'long> {
    fn new(
        builder: &'short mut FunctionBuilder<'long>,
        ram: Value,
        reg: Value,
        debug: Value,
        dispatch: Block,
        ret: Block,
        blocks: &'short FxHashMap<Addr, Block>,
        ptr_type: Type,
    ) -> Self {
        Lift {
            builder,
            ram,
            reg,
            debug,
            dispatch,
            ret,
            blocks,
            ptr_type,
            pc_var: None,
            next_var: 0,
            debug_sig: None,
        }
    }

    /// Host pointer type of the target.
    pub fn ptr_type(&self) -> Type {
        self.ptr_type
    }

    /// Declare a fresh host-scalar variable.
    pub fn declare_var(&mut self, ty: Type) -> Variable {
        let var = Variable::from_u32(self.next_var);
        self.next_var += 1;
        self.builder.declare_var(var, ty);
        var
    }

    /// The variable holding the guest PC.
    ///
    /// Available once the front-end's register decode has run; the decode
    /// returns it and the translator records it here.
    pub fn pc(&self) -> Variable {
        self.pc_var
            .expect("register decode must run before instructions are lifted")
    }

    /// The lifted block at a guest address, when one exists.
    pub fn block_at(&self, pc: Addr) -> Option<Block> {
        self.blocks.get(&pc).copied()
    }

    /// The dispatch block, the target for indirect control flow. The PC
    /// variable must hold the destination before jumping here.
    pub fn dispatch_block(&self) -> Block {
        self.dispatch
    }

    /// Terminate the current block: jump to `ret` with a constant status.
    pub fn jump_ret(&mut self, status: i32) {
        let code = self.builder.ins().iconst(I32, status as i64);
        self.builder.ins().jump(self.ret, &[code]);
    }

    /// Terminate the current block: jump to `ret` with a computed status.
    pub fn jump_ret_val(&mut self, status: Value) {
        self.builder.ins().jump(self.ret, &[status]);
    }

    /// Terminate the current block: resolve the PC variable at run time
    /// through the dispatch switch.
    pub fn jump_dispatch(&mut self) {
        self.builder.ins().jump(self.dispatch, &[]);
    }

    /// Call the debug callout with `(ram, reg)`.
    pub fn call_debug(&mut self) {
        let sig_ref = match self.debug_sig {
            Some(sig_ref) => sig_ref,
            None => {
                let mut sig = Signature::new(self.builder.func.signature.call_conv);
                sig.params.push(AbiParam::new(self.ptr_type));
                sig.params.push(AbiParam::new(self.ptr_type));
                let sig_ref = self.builder.import_signature(sig);
                self.debug_sig = Some(sig_ref);
                sig_ref
            }
        };
        self.builder
            .ins()
            .call_indirect(sig_ref, self.debug, &[self.ram, self.reg]);
    }
}

/// A constant of the PC variable's type, with the immediate sign-extended
/// the way Cranelift expects for narrow integer types.
fn pc_const(builder: &mut FunctionBuilder, ty: Type, value: Addr) -> Value {
    let bits = ty.bits();
    let imm = if bits >= 64 {
        value as i64
    } else {
        let masked = value & ((1u64 << bits) - 1);
        ((masked << (64 - bits)) as i64) >> (64 - bits)
    };
    builder.ins().iconst(ty, imm)
}

/// Builds the body of the compiled function for one translation unit.
pub(crate) struct FunctionTranslator<'a> {
    pub arch: &'a dyn Architecture,
    pub ram: &'a [u8],
    pub code_start: Addr,
    pub code_end: Addr,
}

impl<'a> FunctionTranslator<'a> {
    fn trace_instr(&self, pc: Addr) {
        if tracing::enabled!(tracing::Level::TRACE) {
            let mut line = String::new();
            self.arch.disasm_instr(self.ram, pc, &mut line);
            trace!("{pc:#06x}: {line}");
        }
    }

    /// Whole-region translation over a tagged window.
    pub(crate) fn translate_region(
        &self,
        builder: &mut FunctionBuilder,
        ptr_type: Type,
        tags: &TagMap,
    ) -> Result<(), JitError> {
        let entry = builder.create_block();
        let ret = builder.create_block();
        let ret_status = builder.append_block_param(ret, I32);
        let dispatch = builder.create_block();
        let miss = builder.create_block();

        // One block for every guest address that needs a label.
        let mut blocks = FxHashMap::default();
        let mut labels = Vec::new();
        let mut pc = self.code_start;
        while pc < self.code_end {
            if tags.get(pc).intersects(Tag::LABEL) {
                blocks.insert(pc, builder.create_block());
                labels.push(pc);
            }
            pc += 1;
        }
        debug!(blocks = labels.len(), "basic blocks discovered");

        // entry: unpack the register record into host scalars.
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let params = builder.block_params(entry);
        let (ram_val, reg_val, debug_val) = (params[0], params[1], params[2]);
        let mut lift = Lift::new(
            builder, ram_val, reg_val, debug_val, dispatch, ret, &blocks, ptr_type,
        );
        let pc_var = self.arch.emit_decode_reg(&mut lift);
        lift.pc_var = Some(pc_var);
        lift.builder.ins().jump(dispatch, &[]);

        // dispatch: switch on the current PC over the legal re-entry points.
        lift.builder.switch_to_block(dispatch);
        let pc_val = lift.builder.use_var(pc_var);
        let mut switch = Switch::new();
        for &label in &labels {
            if tags.get(label).intersects(Tag::DISPATCH) {
                debug!("dispatch case {label:#06x}");
                switch.set_entry(label as u128, blocks[&label]);
            }
        }
        switch.emit(lift.builder, pc_val, miss);

        lift.builder.switch_to_block(miss);
        lift.jump_ret(JIT_RETURN_FUNCNOTFOUND);

        // Lift every labelled block.
        for &label in &labels {
            lift.builder.switch_to_block(blocks[&label]);
            if !tags.get(label).contains(Tag::CODE) {
                // A branch targets this byte but nothing decodes here: a
                // data cell reached by a mis-classified target.
                warn!("label {label:#06x} is not code, routing to ret");
                lift.jump_ret(JIT_RETURN_FUNCNOTFOUND);
                continue;
            }
            trace!("basic block L{label:08x}");
            let mut pc = label;
            loop {
                self.trace_instr(pc);
                let info = self.arch.tag_instr(self.ram, pc);
                let len = self.arch.emit_instr(&mut lift, self.ram, pc)? as Addr;
                let next = pc + len;
                if info.flow != Flow::Continue {
                    // The front-end terminated the block itself.
                    break;
                }
                if next >= self.code_end
                    || !tags.get(next).contains(Tag::CODE)
                    || tags.get(next).intersects(Tag::LABEL)
                {
                    let target = lift
                        .block_at(next)
                        .ok_or(JitError::MissingBasicBlock(next))?;
                    trace!("linking continue {next:#06x}");
                    lift.builder.ins().jump(target, &[]);
                    break;
                }
                pc = next;
            }
        }

        // ret: spill the scalars and return the status argument.
        lift.builder.switch_to_block(ret);
        self.arch.emit_spill_reg(&mut lift);
        lift.builder.ins().return_(&[ret_status]);
        Ok(())
    }

    /// Single-step translation: one instruction, one exit per possible
    /// successor, each storing its literal PC before returning.
    pub(crate) fn translate_singlestep(
        &self,
        builder: &mut FunctionBuilder,
        ptr_type: Type,
        pc: Addr,
    ) -> Result<(), JitError> {
        let entry = builder.create_block();
        let ret = builder.create_block();
        let ret_status = builder.append_block_param(ret, I32);
        // Indirect control flow has nowhere to dispatch to in single-step
        // mode; it exits with the PC the front-end stored.
        let miss = builder.create_block();
        let instr = builder.create_block();

        let info = self.arch.tag_instr(self.ram, pc);
        let len = info.len as Addr;

        // Exit blocks double as label targets so front-end branch emission
        // resolves them through the ordinary block map.
        let mut blocks = FxHashMap::default();
        let mut exits = Vec::new();
        let mut add_exit = |builder: &mut FunctionBuilder, target: Addr| {
            blocks.insert(target, builder.create_block());
            exits.push(target);
        };
        match info.flow {
            Flow::Branch => {
                if let Some(target) = info.target {
                    add_exit(builder, target);
                }
                add_exit(builder, pc + len);
            }
            Flow::Jump | Flow::Call => {
                if let Some(target) = info.target {
                    add_exit(builder, target);
                }
            }
            _ => {}
        }

        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let params = builder.block_params(entry);
        let (ram_val, reg_val, debug_val) = (params[0], params[1], params[2]);
        let mut lift = Lift::new(
            builder, ram_val, reg_val, debug_val, miss, ret, &blocks, ptr_type,
        );
        let pc_var = self.arch.emit_decode_reg(&mut lift);
        lift.pc_var = Some(pc_var);
        let pc_ty = {
            let current = lift.builder.use_var(pc_var);
            lift.builder.func.dfg.value_type(current)
        };
        lift.builder.ins().jump(instr, &[]);

        for &target in &exits {
            lift.builder.switch_to_block(blocks[&target]);
            let value = pc_const(lift.builder, pc_ty, target);
            lift.builder.def_var(pc_var, value);
            lift.jump_ret(JIT_RETURN_FUNCNOTFOUND);
        }

        lift.builder.switch_to_block(miss);
        lift.jump_ret(JIT_RETURN_FUNCNOTFOUND);

        lift.builder.switch_to_block(instr);
        self.trace_instr(pc);
        let emitted = self.arch.emit_instr(&mut lift, self.ram, pc)? as Addr;
        if info.flow == Flow::Continue {
            let value = pc_const(lift.builder, pc_ty, pc + emitted);
            lift.builder.def_var(pc_var, value);
            lift.jump_ret(JIT_RETURN_FUNCNOTFOUND);
        }

        lift.builder.switch_to_block(ret);
        self.arch.emit_spill_reg(&mut lift);
        lift.builder.ins().return_(&[ret_status]);
        Ok(())
    }
}
