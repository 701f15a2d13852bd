use llvm_sys::core::{
    LLVMGetAsString, LLVMGetFirstUse, LLVMGetInitializer, LLVMGetNextUse, LLVMGetUser,
    LLVMGetValueName2, LLVMIsConstantString,
};
use llvm_sys::prelude::LLVMValueRef;
use std::slice;

pub mod errors;
pub mod interrupt;


pub use errors::{PassError, PassErrorKind};
pub use interrupt::lower_interrupts;

/// Snapshot of a value's users. Collected up front so callers are free to
/// erase instructions while walking the list.
pub(crate) fn get_uses(value: LLVMValueRef) -> Vec<LLVMValueRef> {
    let mut users = Vec::new();
    if value.is_null() {
        return users;
    }
    unsafe {
        let mut current = LLVMGetFirstUse(value);
        while !current.is_null() {
            users.push(LLVMGetUser(current));
            current = LLVMGetNextUse(current);
        }
    }
    users
}

pub(crate) fn has_uses(value: LLVMValueRef) -> bool {
    !value.is_null() && unsafe { !LLVMGetFirstUse(value).is_null() }
}

/// Reads the bytes of a constant-initialized byte-array global.
pub(crate) fn global_bytes(global: LLVMValueRef) -> Option<Vec<u8>> {
    unsafe {
        let initializer = LLVMGetInitializer(global);
        if initializer.is_null() || LLVMIsConstantString(initializer) == 0 {
            return None;
        }
        let mut len = 0usize;
        let data = LLVMGetAsString(initializer, &mut len);
        if data.is_null() {
            return None;
        }
        Some(slice::from_raw_parts(data as *const u8, len).to_vec())
    }
}

pub(crate) fn value_name(value: LLVMValueRef) -> Option<String> {
    if value.is_null() {
        return None;
    }
    unsafe {
        let mut len = 0usize;
        let data = LLVMGetValueName2(value, &mut len);
        if data.is_null() || len == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(slice::from_raw_parts(data as *const u8, len)).into_owned())
    }
}

/// A pass error annotated with the name of the value it was found at, when
/// that value has one. Calls are usually unnamed; globals and functions are
/// the interesting anchors.
pub(crate) fn error_at(
    kind: PassErrorKind,
    value: LLVMValueRef,
    message: impl Into<String>,
) -> PassError {
    let error = PassError::new(kind, message);
    match value_name(value) {
        Some(name) => error.with_symbol(name),
        None => error,
    }
}
