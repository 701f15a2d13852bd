use llvm_sys::prelude::{LLVMModuleRef, LLVMTypeRef};
use llvm_sys::target::{LLVMABIAlignmentOfType, LLVMABISizeOfType, LLVMGetModuleDataLayout};

/// Size and alignment queries against the module's data layout. The layout is
/// read on every query so a data layout set after construction is picked up.
#[derive(Clone, Copy)]
pub struct TargetLayout {
    module: LLVMModuleRef,
}

impl TargetLayout {
    pub fn new(module: LLVMModuleRef) -> Self {
        Self { module }
    }

    /// Allocated size of a value of this type, in bytes (including padding).
    pub fn alloc_size(&self, ty: LLVMTypeRef) -> u64 {
        unsafe { LLVMABISizeOfType(LLVMGetModuleDataLayout(self.module), ty) }
    }

    /// ABI alignment of this type, in bytes.
    pub fn abi_alignment(&self, ty: LLVMTypeRef) -> u32 {
        unsafe { LLVMABIAlignmentOfType(LLVMGetModuleDataLayout(self.module), ty) }
    }
}
