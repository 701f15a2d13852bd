// Creates real interrupt handlers for the handler descriptors the front end
// registers through runtime pseudo-constructs.
//
// The front end leaves two things in the IR:
//   * calls to `interruptRegister` that map interrupt numbers to ISR names.
//   * `interruptHandle` globals that hold the (constant) interrupt number and
//     handler func value.
//
// This pass synthesizes the specially named vector entry points that forward
// to the registered handlers. The forwarding looks like overhead, but
// inlining and const propagation remove most or all of it.

use super::{error_at, get_uses, global_bytes, has_uses, value_name};
use crate::target::triple_is_avr;
use crate::transform::errors::{PassError, PassErrorKind};
use llvm_sys::core::{
    LLVMAddCase, LLVMAddFunction, LLVMAppendBasicBlockInContext, LLVMBuildCall2, LLVMBuildRetVoid,
    LLVMBuildSwitch, LLVMConstInt, LLVMConstIntGetSExtValue, LLVMConstIntToPtr, LLVMConstNull,
    LLVMConstPointerNull, LLVMCreateBuilderInContext, LLVMDeleteGlobal, LLVMDisposeBuilder,
    LLVMFunctionType, LLVMGetAggregateElement, LLVMGetCalledValue, LLVMGetConstOpcode,
    LLVMGetFirstBasicBlock, LLVMGetFirstGlobal, LLVMGetFirstInstruction, LLVMGetFirstUse,
    LLVMGetInitializer, LLVMGetModuleContext, LLVMGetNamedFunction, LLVMGetNextGlobal,
    LLVMGetNumOperands, LLVMGetOperand, LLVMGetParam, LLVMGetTarget, LLVMGetTypeByName2,
    LLVMGetTypeKind, LLVMGetValueKind, LLVMGlobalGetValueType, LLVMInstructionEraseFromParent,
    LLVMIntTypeInContext, LLVMIsACallInst, LLVMIsAConstantExpr, LLVMIsAConstantInt,
    LLVMIsAGlobalVariable, LLVMIsConstant, LLVMIsDeclaration, LLVMIsGlobalConstant,
    LLVMPointerTypeInContext, LLVMPositionBuilderAtEnd, LLVMReplaceAllUsesWith,
    LLVMSetFunctionCallConv, LLVMSetLinkage, LLVMSetSection, LLVMSetUnnamedAddress,
    LLVMTypeOf, LLVMVoidTypeInContext,
};
use llvm_sys::prelude::{LLVMContextRef, LLVMModuleRef, LLVMValueRef};
use llvm_sys::target::{LLVMGetModuleDataLayout, LLVMPointerSize};
use llvm_sys::{LLVMLinkage, LLVMOpcode, LLVMTypeKind, LLVMUnnamedAddr, LLVMValueKind};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr;

/// Pseudo-call mapping an interrupt number to an ISR symbol name.
pub const INTERRUPT_REGISTER: &str = "interruptRegister";
/// Software-vectoring dispatcher; its having uses is what marks a module as
/// software vectored.
pub const INTERRUPT_DISPATCH: &str = "callInterruptHandler";
/// Pseudo-call keeping an otherwise-unreferenced handler alive until this
/// pass has run.
pub const INTERRUPT_KEEP_ALIVE: &str = "interruptUse";
/// Named struct type of the handler descriptor globals.
pub const INTERRUPT_HANDLE_TYPE: &str = "interruptHandle";
/// Named struct type of the indirection global produced by switch-based func
/// value lowering.
pub const FUNC_VALUE_WITH_SIGNATURE_TYPE: &str = "funcValueWithSignature";

// CallingConv::AVR_SIGNAL. Saves every clobbered register and keeps
// interrupts disabled while the handler runs; AVR_INTERRUPT would re-enable
// them right at entry and invite nested interrupts on a small stack.
const AVR_SIGNAL_CALL_CONV: u32 = 85;

/// Creates interrupt handlers for the descriptors registered by the front
/// end. Errors are accumulated so one run reports every independent problem;
/// the caller must fail the build if any are returned.
pub fn lower_interrupts(module: LLVMModuleRef) -> Vec<PassError> {
    let mut errs = Vec::new();

    unsafe {
        let ctx = LLVMGetModuleContext(module);
        let triple = CStr::from_ptr(LLVMGetTarget(module))
            .to_string_lossy()
            .into_owned();

        // Discover interrupt names. Each interruptRegister call carries a
        // constant number and a constant string; both are extracted here and
        // the pseudo-call is erased.
        let mut handler_names: HashMap<i64, String> = HashMap::new();
        let register_name = CString::new(INTERRUPT_REGISTER).expect("ffi string");
        for call in get_uses(LLVMGetNamedFunction(module, register_name.as_ptr())) {
            if LLVMIsACallInst(call).is_null() {
                errs.push(error_at(
                    PassErrorKind::InvalidOperand,
                    call,
                    format!("expected a call to {INTERRUPT_REGISTER}"),
                ));
                continue;
            }

            let num = LLVMGetOperand(call, 0);
            if LLVMIsAConstantInt(num).is_null() {
                errs.push(error_at(
                    PassErrorKind::InvalidOperand,
                    call,
                    "non-constant interrupt number",
                ));
                continue;
            }

            // The name operand is the string global itself, or a constant
            // offset into it that still has its base to unwrap.
            let mut name_ptr = LLVMGetOperand(call, 1);
            if !LLVMIsAConstantExpr(name_ptr).is_null()
                && LLVMGetConstOpcode(name_ptr) == LLVMOpcode::LLVMGetElementPtr
            {
                name_ptr = LLVMGetOperand(name_ptr, 0);
            }
            let name_len = LLVMGetOperand(call, 2);
            if LLVMIsAGlobalVariable(name_ptr).is_null()
                || LLVMIsGlobalConstant(name_ptr) == 0
                || LLVMIsAConstantInt(name_len).is_null()
            {
                errs.push(error_at(
                    PassErrorKind::InvalidOperand,
                    call,
                    "non-constant interrupt name",
                ));
                continue;
            }
            let bytes = match global_bytes(name_ptr) {
                Some(bytes) => bytes,
                None => {
                    errs.push(error_at(
                        PassErrorKind::InvalidOperand,
                        call,
                        "non-constant interrupt name",
                    ));
                    continue;
                }
            };
            let len = LLVMConstIntGetSExtValue(name_len) as usize;
            if len > bytes.len() {
                errs.push(error_at(
                    PassErrorKind::InvalidOperand,
                    call,
                    "interrupt name length out of range",
                ));
                continue;
            }

            let name = String::from_utf8_lossy(&bytes[..len]).into_owned();
            handler_names.insert(LLVMConstIntGetSExtValue(num), name);

            let call_ty = LLVMTypeOf(call);
            if LLVMGetTypeKind(call_ty) != LLVMTypeKind::LLVMVoidTypeKind {
                LLVMReplaceAllUsesWith(call, LLVMConstNull(call_ty));
            }
            LLVMInstructionEraseFromParent(call);
        }

        let dispatch_name = CString::new(INTERRUPT_DISPATCH).expect("ffi string");
        let dispatcher = LLVMGetNamedFunction(module, dispatch_name.as_ptr());
        let has_software_vectoring = has_uses(dispatcher);
        let mut software_vector: HashMap<i64, LLVMValueRef> = HashMap::new();

        let ptr_type = LLVMPointerTypeInContext(ctx, 0);
        let nullptr = LLVMConstPointerNull(ptr_type);
        let builder = LLVMCreateBuilderInContext(ctx);

        // The signature every interrupt vector entry point has.
        let fn_type = LLVMFunctionType(LLVMVoidTypeInContext(ctx), ptr::null_mut(), 0, 0);

        // Descriptors still present in the IR could not be optimized away, so
        // each needs a real interrupt handler.
        let handle_type_name = CString::new(INTERRUPT_HANDLE_TYPE).expect("ffi string");
        let handle_type = LLVMGetTypeByName2(ctx, handle_type_name.as_ptr());
        let mut handles = Vec::new();
        if !handle_type.is_null() {
            let mut global = LLVMGetFirstGlobal(module);
            while !global.is_null() {
                if LLVMGlobalGetValueType(global) == handle_type {
                    handles.push(global);
                }
                global = LLVMGetNextGlobal(global);
            }
        }

        for global in handles {
            let initializer = LLVMGetInitializer(global);
            if initializer.is_null() {
                errs.push(error_at(
                    PassErrorKind::MalformedDescriptor,
                    global,
                    "interrupt handle has no initializer",
                ));
                continue;
            }
            let num = const_field(initializer, &[1, 0]);
            if num.is_null() || LLVMIsAConstantInt(num).is_null() {
                errs.push(error_at(
                    PassErrorKind::MalformedDescriptor,
                    global,
                    "malformed interrupt handle",
                ));
                continue;
            }
            let num_value = LLVMConstIntGetSExtValue(num);

            let mut name = handler_names.get(&num_value).cloned().unwrap_or_default();
            let mut is_software_vectored = false;
            if name.is_empty() {
                // Either interruptRegister was never called for this number
                // (hardware-vectored targets name every slot), or dispatch
                // goes through the software vector and the name is free to
                // pick. Only the latter is recoverable.
                if has_software_vectoring {
                    is_software_vectored = true;
                    name = format!("interruptHandler{num_value}");
                } else {
                    errs.push(error_at(
                        PassErrorKind::UnresolvedInterrupt,
                        global,
                        format!("no name for interrupt handler {num_value}"),
                    ));
                    continue;
                }
            }

            // Extract the func value.
            let handler_context = const_field(initializer, &[0, 0]);
            let handler_func_id = const_field(initializer, &[0, 1]);
            if handler_context.is_null() || handler_func_id.is_null() {
                errs.push(error_at(
                    PassErrorKind::MalformedDescriptor,
                    global,
                    "malformed interrupt handle",
                ));
                continue;
            }
            if LLVMIsConstant(handler_context) == 0 || LLVMIsConstant(handler_func_id) == 0 {
                // This should have been checked already in the front end.
                errs.push(error_at(
                    PassErrorKind::MalformedDescriptor,
                    global,
                    "func value must be constant",
                ));
                continue;
            }
            let handler_fn = match resolve_constant_function_pointer(ctx, handler_func_id, 1) {
                Ok(function) => function,
                Err(error) => {
                    errs.push(match value_name(global) {
                        Some(symbol) => error.with_symbol(symbol),
                        None => error,
                    });
                    continue;
                }
            };

            // Check for an existing interrupt handler before creating one.
            let name_c = CString::new(name.clone()).expect("ffi string");
            let mut func = LLVMGetNamedFunction(module, name_c.as_ptr());
            let mut needs_body = true;
            if func.is_null() {
                func = LLVMAddFunction(module, name_c.as_ptr(), fn_type);
            } else if LLVMGlobalGetValueType(func) != fn_type {
                errs.push(error_at(
                    PassErrorKind::Redeclaration,
                    global,
                    format!("{name} redeclared with a different signature"),
                ));
                continue;
            } else if LLVMIsDeclaration(func) == 0 {
                // Already defined. If the first instruction is the same
                // forwarding call this descriptor would produce, the two
                // descriptors are textually identical and one handler serves
                // both.
                let first = LLVMGetFirstInstruction(LLVMGetFirstBasicBlock(func));
                let identical = !LLVMIsACallInst(first).is_null()
                    && LLVMGetNumOperands(first) == 4
                    && LLVMGetCalledValue(first) == handler_fn
                    && LLVMGetOperand(first, 0) == num
                    && LLVMGetOperand(first, 1) == handler_context;
                if !identical {
                    errs.push(error_at(
                        PassErrorKind::Redeclaration,
                        global,
                        format!("{name} redeclared in this program"),
                    ));
                    continue;
                }
                needs_body = false;
            }

            if needs_body {
                // The wrapper function that goes into the interrupt vector.
                LLVMSetUnnamedAddress(func, LLVMUnnamedAddr::LLVMGlobalUnnamedAddr);
                let section = CString::new(format!(".text.{name}")).expect("ffi string");
                LLVMSetSection(func, section.as_ptr());
                if is_software_vectored {
                    LLVMSetLinkage(func, LLVMLinkage::LLVMInternalLinkage);
                    software_vector.insert(num_value, func);
                }
                if triple_is_avr(&triple) {
                    LLVMSetFunctionCallConv(func, AVR_SIGNAL_CALL_CONV);
                }

                let entry_name = CString::new("entry").expect("ffi string");
                let entry = LLVMAppendBasicBlockInContext(ctx, func, entry_name.as_ptr());
                LLVMPositionBuilderAtEnd(builder, entry);

                // The forwarding call; usually inlined away afterwards.
                let handler_ty = LLVMGlobalGetValueType(handler_fn);
                let mut args = [num, handler_context, nullptr];
                let empty = CString::new("").expect("ffi string");
                LLVMBuildCall2(
                    builder,
                    handler_ty,
                    handler_fn,
                    args.as_mut_ptr(),
                    args.len() as u32,
                    empty.as_ptr(),
                );
                LLVMBuildRetVoid(builder);
            }

            // Replace the remaining ptrtoint uses of the descriptor with the
            // interrupt number itself. Doing this only after the handler
            // exists keeps it from being optimized away in between.
            let mut uses_ok = true;
            for user in get_uses(global) {
                if LLVMIsAConstantExpr(user).is_null()
                    || LLVMGetConstOpcode(user) != LLVMOpcode::LLVMPtrToInt
                {
                    errs.push(error_at(
                        PassErrorKind::Internal,
                        global,
                        "expected a ptrtoint use of an interrupt handle",
                    ));
                    uses_ok = false;
                }
            }
            if !uses_ok {
                continue;
            }
            if !LLVMGetFirstUse(global).is_null() {
                // Substituting a folded inttoptr rebuilds each ptrtoint user
                // as the literal number and retires the stale constant
                // expressions, leaving the global unused.
                let pointer_bits = LLVMPointerSize(LLVMGetModuleDataLayout(module)) * 8;
                let int_ptr_type = LLVMIntTypeInContext(ctx, pointer_bits);
                let num_const = LLVMConstInt(int_ptr_type, num_value as u64, 1);
                LLVMReplaceAllUsesWith(global, LLVMConstIntToPtr(num_const, ptr_type));
            }
            if LLVMGetFirstUse(global).is_null() {
                LLVMDeleteGlobal(global);
            } else {
                errs.push(error_at(
                    PassErrorKind::Internal,
                    global,
                    "interrupt handle still in use after lowering",
                ));
            }
        }

        // With software vectoring, build the dispatcher: one switch over the
        // interrupt number, one case per handler, sorted so the generated
        // code is deterministic.
        //     func callInterruptHandler(id int32) {
        //         switch id {
        //         case 1: interruptHandler1()
        //         ...
        //         default: // no-op
        //         }
        //     }
        if has_software_vectoring {
            let mut ids: Vec<i64> = software_vector.keys().copied().collect();
            ids.sort_unstable();

            let entry_name = CString::new("entry").expect("ffi string");
            let default_name = CString::new("default").expect("ffi string");
            let entry = LLVMAppendBasicBlockInContext(ctx, dispatcher, entry_name.as_ptr());
            let default_block =
                LLVMAppendBasicBlockInContext(ctx, dispatcher, default_name.as_ptr());
            LLVMPositionBuilderAtEnd(builder, entry);
            let interrupt_id = LLVMGetParam(dispatcher, 0);
            let switch =
                LLVMBuildSwitch(builder, interrupt_id, default_block, ids.len() as u32);

            let empty = CString::new("").expect("ffi string");
            for id in ids {
                let block_name = CString::new(format!("interrupt{id}")).expect("ffi string");
                let block =
                    LLVMAppendBasicBlockInContext(ctx, dispatcher, block_name.as_ptr());
                LLVMPositionBuilderAtEnd(builder, block);
                LLVMBuildCall2(
                    builder,
                    fn_type,
                    software_vector[&id],
                    ptr::null_mut(),
                    0,
                    empty.as_ptr(),
                );
                LLVMBuildRetVoid(builder);
                LLVMAddCase(
                    switch,
                    LLVMConstInt(LLVMTypeOf(interrupt_id), id as u64, 1),
                    block,
                );
            }

            // A ready interrupt without a handler is dropped on the floor.
            LLVMPositionBuilderAtEnd(builder, default_block);
            LLVMBuildRetVoid(builder);

            LLVMSetLinkage(dispatcher, LLVMLinkage::LLVMInternalLinkage);
            LLVMSetUnnamedAddress(dispatcher, LLVMUnnamedAddr::LLVMGlobalUnnamedAddr);
        }

        // interruptUse calls have done their job (keeping handles alive up
        // to this pass) and would only break the link from here on.
        let keep_alive_name = CString::new(INTERRUPT_KEEP_ALIVE).expect("ffi string");
        for call in get_uses(LLVMGetNamedFunction(module, keep_alive_name.as_ptr())) {
            if LLVMIsACallInst(call).is_null() {
                errs.push(error_at(
                    PassErrorKind::Internal,
                    call,
                    format!("expected call to {INTERRUPT_KEEP_ALIVE}"),
                ));
                continue;
            }
            LLVMInstructionEraseFromParent(call);
        }

        LLVMDisposeBuilder(builder);
    }

    errs
}

/// Walks a field path through a constant aggregate. Returns null when the
/// aggregate does not have the expected shape.
unsafe fn const_field(value: LLVMValueRef, path: &[u32]) -> LLVMValueRef {
    let mut current = value;
    for &index in path {
        if current.is_null() {
            return ptr::null_mut();
        }
        current = LLVMGetAggregateElement(current, index);
    }
    current
}

/// Resolves a constant func-value field to the function it names. The
/// recognized shapes are exactly:
///   * a function;
///   * `ptrtoint` of a function;
///   * `ptrtoint` of a `funcValueWithSignature` global, whose first field is
///     resolved recursively (switch-based func value lowering produces this
///     one extra layer).
/// Anything else means an earlier stage emitted IR this pass does not
/// understand.
pub(crate) unsafe fn resolve_constant_function_pointer(
    ctx: LLVMContextRef,
    value: LLVMValueRef,
    max_indirections: u32,
) -> Result<LLVMValueRef, PassError> {
    if LLVMGetValueKind(value) == LLVMValueKind::LLVMFunctionValueKind {
        return Ok(value);
    }
    if !LLVMIsAConstantExpr(value).is_null()
        && LLVMGetConstOpcode(value) == LLVMOpcode::LLVMPtrToInt
    {
        let pointee = LLVMGetOperand(value, 0);
        if LLVMGetValueKind(pointee) == LLVMValueKind::LLVMFunctionValueKind {
            return Ok(pointee);
        }
        if !LLVMIsAGlobalVariable(pointee).is_null() {
            if max_indirections == 0 {
                return Err(PassError::new(
                    PassErrorKind::Internal,
                    "too many func value indirections",
                ));
            }
            let type_name = CString::new(FUNC_VALUE_WITH_SIGNATURE_TYPE).expect("ffi string");
            let expected = LLVMGetTypeByName2(ctx, type_name.as_ptr());
            let initializer = LLVMGetInitializer(pointee);
            if initializer.is_null() || expected.is_null() || LLVMTypeOf(initializer) != expected
            {
                return Err(PassError::new(
                    PassErrorKind::Internal,
                    "func lowering global has unexpected type",
                ));
            }
            let inner = LLVMGetAggregateElement(initializer, 0);
            if inner.is_null() {
                return Err(PassError::new(
                    PassErrorKind::Internal,
                    "func lowering global has unexpected func ptr",
                ));
            }
            return resolve_constant_function_pointer(ctx, inner, max_indirections - 1);
        }
        return Err(PassError::new(
            PassErrorKind::Internal,
            "expected a global for func lowering",
        ));
    }
    Err(PassError::new(
        PassErrorKind::Internal,
        "unexpected constant in func value",
    ))
}
