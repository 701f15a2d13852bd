use crate::target::BuildTarget;
use llvm_sys::{
    LLVMTypeKind,
    core::{
        LLVMBuildAlloca, LLVMBuildCall2, LLVMContextCreate, LLVMContextDispose,
        LLVMCreateBuilderInContext, LLVMDisposeBuilder, LLVMDisposeModule, LLVMGetBasicBlockParent,
        LLVMGetEntryBasicBlock, LLVMGetFirstInstruction, LLVMGetInsertBlock,
        LLVMGetIntrinsicDeclaration, LLVMGetReturnType, LLVMGetTypeKind, LLVMInt8TypeInContext,
        LLVMInt32TypeInContext, LLVMInt64TypeInContext, LLVMIntTypeInContext,
        LLVMIntrinsicGetType, LLVMLookupIntrinsicID, LLVMModuleCreateWithNameInContext,
        LLVMPointerTypeInContext, LLVMPositionBuilderAtEnd, LLVMPositionBuilderBefore,
        LLVMSetTarget,
    },
    prelude::*,
};
use std::{collections::HashMap, env, ffi::CString};

pub mod abi;
pub mod channel;
pub mod layout;

#[cfg(test)]
mod tests;

use abi::RuntimeAbi;
use layout::TargetLayout;

/// Per-function lowering state. A select statement's received values are read
/// out of its receive buffer only when a later extraction asks for them, so
/// the buffer is remembered here, keyed by the select's result value. The
/// frame is dropped together with the function compilation that owns it.
#[derive(Default)]
pub struct Frame {
    pub(crate) select_recv_buf: HashMap<LLVMValueRef, LLVMValueRef>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }
}

/// IR context for the concurrency lowering. Owns the LLVM context, module and
/// builder; the front end positions the builder at each lowering site before
/// calling into the `emit_*` methods.
pub struct Lowering {
    context: LLVMContextRef,
    module: LLVMModuleRef,
    builder: LLVMBuilderRef,
    target: BuildTarget,
    layout: TargetLayout,
    abi: RuntimeAbi,
    int_type: LLVMTypeRef,
    usize_type: LLVMTypeRef,
    i8_type: LLVMTypeRef,
    i32_type: LLVMTypeRef,
    i64_type: LLVMTypeRef,
    ptr_type: LLVMTypeRef,
    lifetime_start: LLVMValueRef,
    lifetime_start_ty: LLVMTypeRef,
    lifetime_end: LLVMValueRef,
    lifetime_end_ty: LLVMTypeRef,
}

impl Lowering {
    pub fn new() -> Self {
        Self::with_target(BuildTarget::host())
    }

    pub fn with_target(target: BuildTarget) -> Self {
        unsafe {
            let context = LLVMContextCreate();
            let module_name = CString::new("ember").expect("ffi string");
            let module = LLVMModuleCreateWithNameInContext(module_name.as_ptr(), context);
            if let Some(triple) = target.triple() {
                let triple_c = CString::new(triple).expect("ffi string");
                LLVMSetTarget(module, triple_c.as_ptr());
            }
            let builder = LLVMCreateBuilderInContext(context);

            let pointer_width = target.pointer_width_bits();
            let abi = RuntimeAbi::declare(context, module, pointer_width);
            let ptr_type = LLVMPointerTypeInContext(context, 0);

            let start_name = "llvm.lifetime.start";
            let start_id = LLVMLookupIntrinsicID(start_name.as_ptr() as *const _, start_name.len());
            let end_name = "llvm.lifetime.end";
            let end_id = LLVMLookupIntrinsicID(end_name.as_ptr() as *const _, end_name.len());
            let mut overload = [ptr_type];
            let lifetime_start =
                LLVMGetIntrinsicDeclaration(module, start_id, overload.as_mut_ptr(), 1);
            let lifetime_start_ty =
                LLVMIntrinsicGetType(context, start_id, overload.as_mut_ptr(), 1);
            let lifetime_end = LLVMGetIntrinsicDeclaration(module, end_id, overload.as_mut_ptr(), 1);
            let lifetime_end_ty = LLVMIntrinsicGetType(context, end_id, overload.as_mut_ptr(), 1);

            Self {
                context,
                module,
                builder,
                target,
                layout: TargetLayout::new(module),
                abi,
                int_type: LLVMIntTypeInContext(context, pointer_width),
                usize_type: LLVMIntTypeInContext(context, pointer_width),
                i8_type: LLVMInt8TypeInContext(context),
                i32_type: LLVMInt32TypeInContext(context),
                i64_type: LLVMInt64TypeInContext(context),
                ptr_type,
                lifetime_start,
                lifetime_start_ty,
                lifetime_end,
                lifetime_end_ty,
            }
        }
    }

    pub fn context(&self) -> LLVMContextRef {
        self.context
    }

    pub fn module(&self) -> LLVMModuleRef {
        self.module
    }

    pub fn builder(&self) -> LLVMBuilderRef {
        self.builder
    }

    pub fn target(&self) -> &BuildTarget {
        &self.target
    }

    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    pub fn abi(&self) -> &RuntimeAbi {
        &self.abi
    }

    pub(crate) fn call_runtime(
        &mut self,
        func: LLVMValueRef,
        func_type: LLVMTypeRef,
        args: &mut [LLVMValueRef],
        name: &str,
    ) -> LLVMValueRef {
        let is_void = unsafe {
            let ret = LLVMGetReturnType(func_type);
            LLVMGetTypeKind(ret) == LLVMTypeKind::LLVMVoidTypeKind
        };
        let name_c = if is_void {
            CString::new("").expect("ffi string")
        } else {
            CString::new(name).expect("ffi string")
        };
        assert!(!func.is_null(), "runtime function `{}` is null", name);
        unsafe {
            let block = LLVMGetInsertBlock(self.builder);
            assert!(
                !block.is_null(),
                "no insertion block for runtime call `{}`",
                name
            );
            if env::var_os("EMBER_DEBUG_RT_CALLS").is_some() {
                eprintln!("[rt_call] name={name} func={func:?} block={block:?}");
            }
            LLVMBuildCall2(
                self.builder,
                func_type,
                func,
                args.as_mut_ptr(),
                args.len() as u32,
                name_c.as_ptr(),
            )
        }
    }

    /// Places an alloca in the function's entry block so it is a static
    /// (stack-slot) allocation regardless of where lowering happens to be
    /// emitting, then restores the builder position.
    pub(crate) fn create_entry_block_alloca(
        &mut self,
        ty: LLVMTypeRef,
        name: &str,
    ) -> LLVMValueRef {
        unsafe {
            let current = LLVMGetInsertBlock(self.builder);
            let function = LLVMGetBasicBlockParent(current);
            let entry = LLVMGetEntryBasicBlock(function);
            let first = LLVMGetFirstInstruction(entry);
            if first.is_null() {
                LLVMPositionBuilderAtEnd(self.builder, entry);
            } else {
                LLVMPositionBuilderBefore(self.builder, first);
            }
            let name_c = CString::new(name).expect("ffi string");
            let alloca = LLVMBuildAlloca(self.builder, ty, name_c.as_ptr());
            LLVMPositionBuilderAtEnd(self.builder, current);
            alloca
        }
    }

    /// Entry-block alloca whose lifetime starts at the current insertion
    /// point. Returns the alloca and its size constant for the matching
    /// `emit_lifetime_end`.
    pub(crate) fn create_temporary_alloca(
        &mut self,
        ty: LLVMTypeRef,
        name: &str,
    ) -> (LLVMValueRef, LLVMValueRef) {
        let alloca = self.create_entry_block_alloca(ty, name);
        let size = unsafe {
            llvm_sys::core::LLVMConstInt(self.i64_type, self.layout.alloc_size(ty), 0)
        };
        let mut args = [size, alloca];
        self.call_runtime(self.lifetime_start, self.lifetime_start_ty, &mut args, "");
        (alloca, size)
    }

    pub(crate) fn emit_lifetime_end(&mut self, pointer: LLVMValueRef, size: LLVMValueRef) {
        let mut args = [size, pointer];
        self.call_runtime(self.lifetime_end, self.lifetime_end_ty, &mut args, "");
    }
}

impl Drop for Lowering {
    fn drop(&mut self) {
        unsafe {
            if !self.builder.is_null() {
                LLVMDisposeBuilder(self.builder);
            }
            if !self.module.is_null() {
                LLVMDisposeModule(self.module);
            }
            if !self.context.is_null() {
                LLVMContextDispose(self.context);
            }
        }
    }
}
