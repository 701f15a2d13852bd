use super::channel::SelectCase;
use super::*;
use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyModule};
use llvm_sys::core::{
    LLVMAddFunction, LLVMAppendBasicBlockInContext, LLVMBuildRetVoid, LLVMConstInt,
    LLVMDisposeMessage, LLVMFunctionType, LLVMGetIntTypeWidth, LLVMGetTypeKind,
    LLVMInt32TypeInContext, LLVMInt64TypeInContext, LLVMIsConstant, LLVMIsUndef,
    LLVMPrintModuleToString, LLVMSetDataLayout, LLVMTypeOf, LLVMVoidTypeInContext,
};
use std::ffi::CStr;
use std::ptr;

/// A host lowering with a pinned data layout, so size and alignment
/// assertions do not depend on LLVM's bare defaults.
fn test_lowering() -> Lowering {
    let lowering = Lowering::new();
    unsafe {
        let layout = CString::new("e-i64:64-n32:64-S128").expect("ffi string");
        LLVMSetDataLayout(lowering.module(), layout.as_ptr());
    }
    lowering
}

fn begin_function(lowering: &mut Lowering, name: &str) {
    unsafe {
        let void_type = LLVMVoidTypeInContext(lowering.context());
        let fn_type = LLVMFunctionType(void_type, ptr::null_mut(), 0, 0);
        let name_c = CString::new(name).expect("ffi string");
        let function = LLVMAddFunction(lowering.module(), name_c.as_ptr(), fn_type);
        let entry_c = CString::new("entry").expect("ffi string");
        let entry = LLVMAppendBasicBlockInContext(lowering.context(), function, entry_c.as_ptr());
        LLVMPositionBuilderAtEnd(lowering.builder(), entry);
    }
}

fn finish_function(lowering: &Lowering) {
    unsafe {
        LLVMBuildRetVoid(lowering.builder());
    }
}

fn module_ir(lowering: &Lowering) -> String {
    unsafe {
        let raw = LLVMPrintModuleToString(lowering.module());
        let text = CStr::from_ptr(raw).to_string_lossy().into_owned();
        LLVMDisposeMessage(raw);
        text
    }
}

fn verify(lowering: &Lowering) {
    unsafe {
        let mut message = ptr::null_mut();
        let failed = LLVMVerifyModule(
            lowering.module(),
            LLVMVerifierFailureAction::LLVMReturnStatusAction,
            &mut message,
        );
        let text = if message.is_null() {
            String::new()
        } else {
            let text = CStr::from_ptr(message).to_string_lossy().into_owned();
            LLVMDisposeMessage(message);
            text
        };
        assert!(failed == 0, "module failed to verify: {text}");
    }
}

fn make_test_channel(lowering: &mut Lowering, elem_ty: LLVMTypeRef) -> LLVMValueRef {
    let capacity = unsafe { LLVMConstInt(lowering.abi().usize_type, 0, 0) };
    lowering.emit_chan_make(elem_ty, capacity)
}

#[test]
fn make_channel_uses_element_alloc_size() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "chan_make_test");
    let i64_type = unsafe { LLVMInt64TypeInContext(lowering.context()) };
    let capacity = unsafe { LLVMConstInt(lowering.abi().usize_type, 4, 0) };
    lowering.emit_chan_make(i64_type, capacity);
    finish_function(&lowering);
    verify(&lowering);

    let bits = lowering.target().pointer_width_bits();
    let ir = module_ir(&lowering);
    assert!(
        ir.contains(&format!("@chanMake(i{bits} 8, i{bits} 4)")),
        "chanMake should receive the element alloc size:\n{ir}"
    );
}

#[test]
fn chan_send_stores_payload_then_ends_lifetime() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "chan_send_test");
    let i32_type = unsafe { LLVMInt32TypeInContext(lowering.context()) };
    let ch = make_test_channel(&mut lowering, i32_type);
    let payload = unsafe { LLVMConstInt(i32_type, 7, 1) };
    lowering.emit_chan_send(ch, payload);
    finish_function(&lowering);
    verify(&lowering);

    let ir = module_ir(&lowering);
    assert!(ir.contains("%chan.value = alloca i32"), "missing payload slot:\n{ir}");
    assert!(ir.contains("store i32 7, ptr %chan.value"), "missing payload store:\n{ir}");
    let body = &ir[ir.find("define").expect("no function body")..];
    let send_at = body.find("@chanSend(").expect("no chanSend call");
    let lifetime_end_at = body.rfind("llvm.lifetime.end").expect("no lifetime end");
    assert!(
        send_at < lifetime_end_at,
        "payload lifetime must end after the send:\n{ir}"
    );
}

#[test]
fn chan_recv_returns_loaded_value() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "chan_recv_test");
    let i32_type = unsafe { LLVMInt32TypeInContext(lowering.context()) };
    let ch = make_test_channel(&mut lowering, i32_type);
    let received = lowering.emit_chan_recv(ch, i32_type, false);
    assert_eq!(unsafe { LLVMTypeOf(received) }, i32_type);
    finish_function(&lowering);
    verify(&lowering);

    let ir = module_ir(&lowering);
    assert!(ir.contains("call i1 @chanRecv(ptr"), "missing chanRecv call:\n{ir}");
    assert!(
        ir.contains("%chan.received = load i32, ptr %chan.value"),
        "value must be loaded from the receive slot:\n{ir}"
    );
}

#[test]
fn chan_recv_comma_ok_wraps_presence_flag() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "chan_recv_ok_test");
    let i32_type = unsafe { LLVMInt32TypeInContext(lowering.context()) };
    let ch = make_test_channel(&mut lowering, i32_type);
    let tuple = lowering.emit_chan_recv(ch, i32_type, true);
    unsafe {
        assert_eq!(
            LLVMGetTypeKind(LLVMTypeOf(tuple)),
            LLVMTypeKind::LLVMStructTypeKind
        );
    }
    finish_function(&lowering);
    verify(&lowering);

    let ir = module_ir(&lowering);
    assert!(ir.contains("insertvalue { i32, i1 }"), "missing comma-ok tuple:\n{ir}");
}

#[test]
fn chan_close_is_one_runtime_call() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "chan_close_test");
    let i32_type = unsafe { LLVMInt32TypeInContext(lowering.context()) };
    let ch = make_test_channel(&mut lowering, i32_type);
    lowering.emit_chan_close(ch);
    finish_function(&lowering);
    verify(&lowering);

    let ir = module_ir(&lowering);
    assert_eq!(
        ir.matches("call void @chanClose(ptr").count(),
        1,
        "unexpected IR:\n{ir}"
    );
}

#[test]
fn select_no_cases_nonblocking_is_a_constant() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "select_empty_test");
    let mut frame = Frame::new();
    let result = lowering.emit_select(&mut frame, &[], false);
    assert!(unsafe { LLVMIsConstant(result) } != 0, "result must fold to {{-1, false}}");
    finish_function(&lowering);
    verify(&lowering);

    let ir = module_ir(&lowering);
    assert_eq!(
        ir.matches("call ").count(),
        0,
        "no runtime call may be emitted for an empty non-blocking select:\n{ir}"
    );
}

#[test]
fn select_no_cases_blocking_deadlocks() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "select_block_forever_test");
    let mut frame = Frame::new();
    let result = lowering.emit_select(&mut frame, &[], true);
    assert!(unsafe { LLVMIsUndef(result) } != 0);
    finish_function(&lowering);
    verify(&lowering);

    let ir = module_ir(&lowering);
    assert!(ir.contains("call void @deadlock()"), "unexpected IR:\n{ir}");
}

#[test]
fn select_nonblocking_builds_states_and_shared_recvbuf() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "select_try_test");
    let i32_type = unsafe { LLVMInt32TypeInContext(lowering.context()) };
    let i64_type = unsafe { LLVMInt64TypeInContext(lowering.context()) };
    let recv_ch = make_test_channel(&mut lowering, i64_type);
    let send_ch = make_test_channel(&mut lowering, i32_type);
    let payload = unsafe { LLVMConstInt(i32_type, 9, 1) };
    let mut frame = Frame::new();
    let cases = [
        SelectCase::Recv {
            channel: recv_ch,
            elem_ty: i64_type,
        },
        SelectCase::Send {
            channel: send_ch,
            value: payload,
        },
    ];
    let result = lowering.emit_select(&mut frame, &cases, false);
    finish_function(&lowering);
    verify(&lowering);

    let bits = lowering.target().pointer_width_bits();
    let ir = module_ir(&lowering);
    assert!(
        ir.contains("alloca [2 x %chanSelectState]"),
        "missing states buffer:\n{ir}"
    );
    // The receive buffer covers the largest receive case (i64 here).
    assert!(
        ir.contains("%select.recvbuf.alloca = alloca [8 x i8], align 8"),
        "receive buffer must use the max element size and alignment:\n{ir}"
    );
    assert!(
        ir.contains("%select.send.value = alloca i32"),
        "send payload needs its own slot:\n{ir}"
    );
    assert!(
        ir.contains(&format!(
            "@tryChanSelect(ptr %select.recvbuf, ptr %select.states, i{bits} 2, i{bits} 2)"
        )),
        "unexpected tryChanSelect call:\n{ir}"
    );
    assert_eq!(frame.select_recv_buf.len(), 1);
    let body = &ir[ir.find("define").expect("no function body")..];
    let call_at = body.find("@tryChanSelect(").expect("no tryChanSelect call");
    let states_end_at = body.rfind("llvm.lifetime.end").expect("no lifetime end");
    assert!(call_at < states_end_at, "states lifetime must end after the call");
    assert!(frame.select_recv_buf.contains_key(&result));
}

#[test]
fn select_blocking_passes_block_list() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "select_blocking_test");
    let i32_type = unsafe { LLVMInt32TypeInContext(lowering.context()) };
    let i64_type = unsafe { LLVMInt64TypeInContext(lowering.context()) };
    let ch_a = make_test_channel(&mut lowering, i32_type);
    let ch_b = make_test_channel(&mut lowering, i64_type);
    let mut frame = Frame::new();
    let cases = [
        SelectCase::Recv {
            channel: ch_a,
            elem_ty: i32_type,
        },
        SelectCase::Recv {
            channel: ch_b,
            elem_ty: i64_type,
        },
    ];
    lowering.emit_select(&mut frame, &cases, true);
    finish_function(&lowering);
    verify(&lowering);

    let bits = lowering.target().pointer_width_bits();
    let ir = module_ir(&lowering);
    assert!(
        ir.contains("alloca [2 x %channelBlockedList]"),
        "blocking select needs one blocked-list slot per case:\n{ir}"
    );
    assert!(
        ir.contains(&format!(
            "@chanSelect(ptr %select.recvbuf, ptr %select.states, i{bits} 2, i{bits} 2, ptr %select.block, i{bits} 2, i{bits} 2)"
        )),
        "unexpected chanSelect call:\n{ir}"
    );
}

#[test]
fn select_without_receives_passes_null_recvbuf() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "select_send_only_test");
    let i32_type = unsafe { LLVMInt32TypeInContext(lowering.context()) };
    let ch = make_test_channel(&mut lowering, i32_type);
    let payload = unsafe { LLVMConstInt(i32_type, 1, 1) };
    let mut frame = Frame::new();
    let cases = [SelectCase::Send {
        channel: ch,
        value: payload,
    }];
    lowering.emit_select(&mut frame, &cases, false);
    finish_function(&lowering);
    verify(&lowering);

    let bits = lowering.target().pointer_width_bits();
    let ir = module_ir(&lowering);
    assert!(
        ir.contains(&format!(
            "@tryChanSelect(ptr null, ptr %select.states, i{bits} 1, i{bits} 1)"
        )),
        "send-only select must pass a null receive buffer:\n{ir}"
    );
    assert!(!ir.contains("select.recvbuf.alloca"), "unexpected IR:\n{ir}");
}

#[test]
fn select_result_extraction_reads_all_indices() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "select_extract_test");
    let i64_type = unsafe { LLVMInt64TypeInContext(lowering.context()) };
    let ch = make_test_channel(&mut lowering, i64_type);
    let mut frame = Frame::new();
    let cases = [SelectCase::Recv {
        channel: ch,
        elem_ty: i64_type,
    }];
    let result = lowering.emit_select(&mut frame, &cases, false);

    let chosen = lowering
        .emit_select_result(&frame, result, 0, i64_type)
        .expect("chosen index");
    let bits = lowering.target().pointer_width_bits();
    unsafe {
        assert_eq!(LLVMGetIntTypeWidth(LLVMTypeOf(chosen)), bits);
    }
    let ok = lowering
        .emit_select_result(&frame, result, 1, i64_type)
        .expect("ok flag");
    unsafe {
        assert_eq!(LLVMGetIntTypeWidth(LLVMTypeOf(ok)), 1);
    }
    let received = lowering
        .emit_select_result(&frame, result, 2, i64_type)
        .expect("received value");
    assert_eq!(unsafe { LLVMTypeOf(received) }, i64_type);
    finish_function(&lowering);
    verify(&lowering);

    let ir = module_ir(&lowering);
    assert!(
        ir.contains("extractvalue { i32, i1 } %select.result, 0"),
        "chosen case comes from the result pair:\n{ir}"
    );
    assert!(
        ir.contains("extractvalue { i32, i1 } %select.result, 1"),
        "ok flag comes from the result pair:\n{ir}"
    );
    if bits > 32 {
        assert!(ir.contains("sext i32"), "chosen index must widen to the native int:\n{ir}");
    }
    assert!(
        ir.contains("%select.received = load i64, ptr %select.recvbuf"),
        "received values are read back out of the select's receive buffer:\n{ir}"
    );
}

#[test]
fn select_result_without_recorded_buffer_is_an_error() {
    let mut lowering = test_lowering();
    begin_function(&mut lowering, "select_extract_invalid_test");
    let i64_type = unsafe { LLVMInt64TypeInContext(lowering.context()) };
    let ch = make_test_channel(&mut lowering, i64_type);
    let mut frame = Frame::new();
    let cases = [SelectCase::Recv {
        channel: ch,
        elem_ty: i64_type,
    }];
    let result = lowering.emit_select(&mut frame, &cases, false);

    // A frame from a different function compilation knows nothing about this
    // select; extraction of a received value must fail loudly.
    let foreign_frame = Frame::new();
    let outcome = lowering.emit_select_result(&foreign_frame, result, 2, i64_type);
    assert!(outcome.is_err());
}
