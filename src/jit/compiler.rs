//! Cranelift driver
//!
//! Owns the module/ISA setup and the compile sequence: build the function
//! shell, translate the tagged region (or a single instruction), verify,
//! optionally dump the IR, optimize, and materialize the native entry.

use cranelift_codegen::ir::types::I32;
use cranelift_codegen::ir::{AbiParam, UserFuncName};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::verify_function;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use tracing::{debug, info};

use crate::arch::{Addr, Architecture};
use crate::tag::TagMap;

use super::code::CompiledEntry;
use super::translate::FunctionTranslator;
use super::{DebugFlags, JitError, OPTIMIZE_NONE};

/// Everything one compilation needs from the translation unit.
pub(crate) struct JitRequest<'a> {
    pub arch: &'a dyn Architecture,
    pub ram: &'a [u8],
    pub code_start: Addr,
    pub code_end: Addr,
    /// Tag array; required unless single-stepping.
    pub tags: Option<&'a TagMap>,
    /// Register record, read for the starting PC in single-step mode.
    pub reg: &'a [u8],
    pub debug_flags: DebugFlags,
    pub flags_optimize: u64,
}

/// Compile the request down to a callable native entry.
pub(crate) fn compile(req: &JitRequest<'_>) -> Result<CompiledEntry, JitError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(|e| JitError::Compile(e.to_string()))?;
    flag_builder
        .set("is_pic", "false")
        .map_err(|e| JitError::Compile(e.to_string()))?;
    // The optimizer flag word degenerates to Cranelift's optimization
    // level: any enabled pass selects "speed".
    let opt_level = if req.flags_optimize == OPTIMIZE_NONE {
        "none"
    } else {
        "speed"
    };
    flag_builder
        .set("opt_level", opt_level)
        .map_err(|e| JitError::Compile(e.to_string()))?;

    let isa_builder =
        cranelift_native::builder().map_err(|msg| JitError::Compile(msg.to_string()))?;
    let isa = isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| JitError::Compile(e.to_string()))?;
    let verifier_isa = isa.clone();

    let jit_builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    let mut module = JITModule::new(jit_builder);
    let ptr_type = module.target_config().pointer_type();

    // i32 jitmain(u8 *RAM, reg_t *reg, void (*debug)(u8 *, reg_t *))
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr_type));
    sig.params.push(AbiParam::new(ptr_type));
    sig.params.push(AbiParam::new(ptr_type));
    sig.returns.push(AbiParam::new(I32));

    let func_id = match module.declare_function("jitmain", Linkage::Export, &sig) {
        Ok(id) => id,
        Err(e) => return fail(module, JitError::Compile(e.to_string())),
    };

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    ctx.func.name = UserFuncName::user(0, func_id.as_u32());

    if let Err(err) = build_function(req, &mut ctx.func) {
        return fail(module, err);
    }

    if req.debug_flags.contains(DebugFlags::PRINT_IR) {
        println!("{}", ctx.func.display());
    }

    if let Err(errors) = verify_function(&ctx.func, &*verifier_isa) {
        return fail(module, JitError::Verify(errors.to_string()));
    }

    if req.debug_flags.contains(DebugFlags::PRINT_IR_OPTIMIZED) {
        ctx.set_disasm(true);
    }

    info!(opt_level, "optimizing and compiling");
    if let Err(e) = module.define_function(func_id, &mut ctx) {
        return fail(module, JitError::Compile(e.to_string()));
    }

    if req.debug_flags.contains(DebugFlags::PRINT_IR_OPTIMIZED) {
        if let Some(vcode) = ctx.compiled_code().and_then(|code| code.vcode.as_ref()) {
            println!("{vcode}");
        }
    }

    if let Err(e) = module.finalize_definitions() {
        return fail(module, JitError::Compile(e.to_string()));
    }
    let fn_ptr = module.get_finalized_function(func_id);
    debug!("native entry materialized");

    Ok(CompiledEntry::new(fn_ptr, module))
}

/// Abort a compilation, releasing whatever the module mapped so far.
fn fail(module: JITModule, err: JitError) -> Result<CompiledEntry, JitError> {
    // Safety: no pointers into the module have escaped yet.
    unsafe { module.free_memory() };
    Err(err)
}

fn build_function(
    req: &JitRequest<'_>,
    func: &mut cranelift_codegen::ir::Function,
) -> Result<(), JitError> {
    let ptr_type = func.signature.params[0].value_type;
    let mut fb_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(func, &mut fb_ctx);

    let translator = FunctionTranslator {
        arch: req.arch,
        ram: req.ram,
        code_start: req.code_start,
        code_end: req.code_end,
    };

    if req.debug_flags.contains(DebugFlags::SINGLESTEP) {
        let pc = req.arch.read_pc(req.reg);
        debug!("single-stepping at {pc:#06x}");
        translator.translate_singlestep(&mut builder, ptr_type, pc)?;
    } else {
        let tags = req
            .tags
            .ok_or_else(|| JitError::Compile("no tagged region to translate".to_string()))?;
        translator.translate_region(&mut builder, ptr_type, tags)?;
    }

    builder.seal_all_blocks();
    builder.finalize();
    Ok(())
}
