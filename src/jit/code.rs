//! Compiled entry wrapper
//!
//! `CompiledEntry` pairs the native entry pointer with the `JITModule` that
//! owns its executable memory, so the code cannot outlive its backing pages.

use cranelift_jit::JITModule;

use crate::arch::DebugCallout;

/// The native entry of a compiled translation unit.
pub struct CompiledEntry {
    fn_ptr: *const u8,
    /// Owns the executable memory; freed when the entry is dropped.
    module: Option<JITModule>,
}

impl CompiledEntry {
    pub(crate) fn new(fn_ptr: *const u8, module: JITModule) -> Self {
        CompiledEntry {
            fn_ptr,
            module: Some(module),
        }
    }

    /// The raw native entry pointer.
    pub fn fn_ptr(&self) -> *const u8 {
        self.fn_ptr
    }

    /// Run the compiled function with the guest entry ABI.
    ///
    /// # Safety
    /// - `ram` must point to the guest RAM image the unit was compiled
    ///   against, valid for reads and writes for its full length
    /// - `reg` must point to a register record of the architecture's size,
    ///   exclusively borrowed for the duration of the call
    /// - `debug` must be callable with `(ram, reg)`
    #[inline]
    pub unsafe fn call(&self, ram: *mut u8, reg: *mut u8, debug: DebugCallout) -> i32 {
        let f: unsafe extern "C" fn(*mut u8, *mut u8, DebugCallout) -> i32 =
            std::mem::transmute(self.fn_ptr);
        f(ram, reg, debug)
    }
}

impl Drop for CompiledEntry {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // Safety: the entry pointer dies with this value, so no caller
            // can reach the unmapped pages afterwards.
            unsafe { module.free_memory() };
        }
    }
}

impl std::fmt::Debug for CompiledEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledEntry")
            .field("fn_ptr", &self.fn_ptr)
            .finish()
    }
}
