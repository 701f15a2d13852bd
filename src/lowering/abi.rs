#![allow(unsafe_op_in_unsafe_fn)]

use llvm_sys::{
    LLVMLinkage,
    core::{
        LLVMAddFunction, LLVMFunctionType, LLVMInt1TypeInContext, LLVMInt32TypeInContext,
        LLVMIntTypeInContext, LLVMPointerTypeInContext, LLVMSetLinkage, LLVMStructCreateNamed,
        LLVMStructSetBody, LLVMStructTypeInContext, LLVMVoidTypeInContext,
    },
    prelude::*,
};
use std::ffi::CString;

/// Declarations for the channel runtime the lowered code calls into. Each
/// runtime function is kept together with its function type so calls can be
/// built without consulting the (opaque) pointer type of the callee.
#[derive(Clone, Copy)]
pub struct RuntimeAbi {
    pub handle_type: LLVMTypeRef,
    pub bool_type: LLVMTypeRef,
    pub int_type: LLVMTypeRef,
    pub usize_type: LLVMTypeRef,
    /// `chanSelectState`: one per select case, `{channel, send payload}`.
    /// A null payload pointer marks the case as a receive.
    pub select_state_type: LLVMTypeRef,
    /// `channelBlockedList`: scratch the runtime uses to register the calling
    /// task against every case of a blocking select as a group. The layout
    /// must match the runtime's definition; this pass only sizes allocas
    /// with it.
    pub blocked_list_type: LLVMTypeRef,
    /// `{chosen case, ok}` as returned by chanSelect/tryChanSelect.
    pub select_result_type: LLVMTypeRef,
    pub chan_make: LLVMValueRef,
    pub chan_make_ty: LLVMTypeRef,
    pub chan_send: LLVMValueRef,
    pub chan_send_ty: LLVMTypeRef,
    pub chan_recv: LLVMValueRef,
    pub chan_recv_ty: LLVMTypeRef,
    pub chan_close: LLVMValueRef,
    pub chan_close_ty: LLVMTypeRef,
    pub chan_select: LLVMValueRef,
    pub chan_select_ty: LLVMTypeRef,
    pub try_chan_select: LLVMValueRef,
    pub try_chan_select_ty: LLVMTypeRef,
    pub deadlock: LLVMValueRef,
    pub deadlock_ty: LLVMTypeRef,
}

impl RuntimeAbi {
    pub unsafe fn declare(
        context: LLVMContextRef,
        module: LLVMModuleRef,
        pointer_width_bits: u32,
    ) -> Self {
        let handle_type = LLVMPointerTypeInContext(context, 0);
        let void_type = LLVMVoidTypeInContext(context);
        let bool_type = LLVMInt1TypeInContext(context);
        let i32_type = LLVMInt32TypeInContext(context);
        let int_type = LLVMIntTypeInContext(context, pointer_width_bits);
        let usize_type = LLVMIntTypeInContext(context, pointer_width_bits);

        let select_state_name = CString::new("chanSelectState").expect("ffi string");
        let select_state_type = LLVMStructCreateNamed(context, select_state_name.as_ptr());
        let mut select_state_fields = [handle_type, handle_type];
        LLVMStructSetBody(
            select_state_type,
            select_state_fields.as_mut_ptr(),
            select_state_fields.len() as u32,
            0,
        );

        let blocked_list_name = CString::new("channelBlockedList").expect("ffi string");
        let blocked_list_type = LLVMStructCreateNamed(context, blocked_list_name.as_ptr());
        let mut select_ops_fields = [handle_type, usize_type, usize_type];
        let select_ops_slice = LLVMStructTypeInContext(
            context,
            select_ops_fields.as_mut_ptr(),
            select_ops_fields.len() as u32,
            0,
        );
        let mut blocked_list_fields = [handle_type, handle_type, select_ops_slice];
        LLVMStructSetBody(
            blocked_list_type,
            blocked_list_fields.as_mut_ptr(),
            blocked_list_fields.len() as u32,
            0,
        );

        let mut select_result_fields = [i32_type, bool_type];
        let select_result_type = LLVMStructTypeInContext(
            context,
            select_result_fields.as_mut_ptr(),
            select_result_fields.len() as u32,
            0,
        );

        let (chan_make, chan_make_ty) = declare_fn(
            module,
            "chanMake",
            handle_type,
            &mut [usize_type, usize_type],
        );
        let (chan_send, chan_send_ty) = declare_fn(
            module,
            "chanSend",
            void_type,
            &mut [handle_type, handle_type],
        );
        let (chan_recv, chan_recv_ty) = declare_fn(
            module,
            "chanRecv",
            bool_type,
            &mut [handle_type, handle_type],
        );
        let (chan_close, chan_close_ty) =
            declare_fn(module, "chanClose", void_type, &mut [handle_type]);
        let (chan_select, chan_select_ty) = declare_fn(
            module,
            "chanSelect",
            select_result_type,
            &mut [
                handle_type,
                handle_type,
                usize_type,
                usize_type,
                handle_type,
                usize_type,
                usize_type,
            ],
        );
        let (try_chan_select, try_chan_select_ty) = declare_fn(
            module,
            "tryChanSelect",
            select_result_type,
            &mut [handle_type, handle_type, usize_type, usize_type],
        );
        let (deadlock, deadlock_ty) = declare_fn(module, "deadlock", void_type, &mut []);

        Self {
            handle_type,
            bool_type,
            int_type,
            usize_type,
            select_state_type,
            blocked_list_type,
            select_result_type,
            chan_make,
            chan_make_ty,
            chan_send,
            chan_send_ty,
            chan_recv,
            chan_recv_ty,
            chan_close,
            chan_close_ty,
            chan_select,
            chan_select_ty,
            try_chan_select,
            try_chan_select_ty,
            deadlock,
            deadlock_ty,
        }
    }
}

unsafe fn declare_fn(
    module: LLVMModuleRef,
    name: &str,
    ret: LLVMTypeRef,
    params: &mut [LLVMTypeRef],
) -> (LLVMValueRef, LLVMTypeRef) {
    let name_c = CString::new(name).expect("ffi string");
    let function_type = LLVMFunctionType(ret, params.as_mut_ptr(), params.len() as u32, 0);
    let func = LLVMAddFunction(module, name_c.as_ptr(), function_type);
    LLVMSetLinkage(func, LLVMLinkage::LLVMExternalLinkage);
    (func, function_type)
}
