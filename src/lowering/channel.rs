// Lowers channel operations (make/send/recv/close/select) to calls into the
// channel runtime. Buffers handed to the runtime are stack-scoped allocas;
// their lifetimes are bracketed explicitly so later stack-frame transforms
// see accurate liveness.

use super::*;
use llvm_sys::core::{
    LLVMArrayType2, LLVMBuildExtractValue, LLVMBuildInBoundsGEP2, LLVMBuildInsertValue,
    LLVMBuildLoad2, LLVMBuildPointerCast, LLVMBuildSExt, LLVMBuildStore, LLVMConstInt,
    LLVMConstNull, LLVMConstPointerNull, LLVMGetIntTypeWidth, LLVMGetUndef,
    LLVMSetAlignment, LLVMStructTypeInContext, LLVMTypeOf,
};

/// One case of a select statement. The direction is not stored in the runtime
/// state struct; a send case is recognized by its non-null payload pointer.
pub enum SelectCase {
    Recv {
        channel: LLVMValueRef,
        elem_ty: LLVMTypeRef,
    },
    Send {
        channel: LLVMValueRef,
        value: LLVMValueRef,
    },
}

impl Lowering {
    /// Lowers `make(chan T, n)`. The runtime owns capacity validation; a
    /// negative or overflowing capacity is its failure to report.
    pub fn emit_chan_make(
        &mut self,
        elem_ty: LLVMTypeRef,
        capacity: LLVMValueRef,
    ) -> LLVMValueRef {
        let element_size =
            unsafe { LLVMConstInt(self.usize_type, self.layout.alloc_size(elem_ty), 0) };
        let mut args = [element_size, capacity];
        self.call_runtime(self.abi.chan_make, self.abi.chan_make_ty, &mut args, "chan")
    }

    pub fn emit_chan_send(&mut self, ch: LLVMValueRef, value: LLVMValueRef) {
        let value_ty = unsafe { LLVMTypeOf(value) };

        // store value-to-send
        let (value_alloca, value_size) = self.create_temporary_alloca(value_ty, "chan.value");
        unsafe {
            LLVMBuildStore(self.builder, value, value_alloca);
        }

        // Do the send.
        let mut args = [ch, value_alloca];
        self.call_runtime(self.abi.chan_send, self.abi.chan_send_ty, &mut args, "");

        // End the lifetime of the alloca. Ending it here, before any
        // suspension point the send may turn into, keeps the coroutine
        // transform from spilling the buffer into the task frame.
        self.emit_lifetime_end(value_alloca, value_size);
    }

    /// Lowers a channel receive. With `comma_ok` the result is a
    /// `{value, ok}` pair; `ok` is false once the channel is closed and
    /// drained, and the runtime guarantees the buffer holds the element
    /// type's zero value in that case.
    pub fn emit_chan_recv(
        &mut self,
        ch: LLVMValueRef,
        elem_ty: LLVMTypeRef,
        comma_ok: bool,
    ) -> LLVMValueRef {
        let (value_alloca, value_size) = self.create_temporary_alloca(elem_ty, "chan.value");

        let mut args = [ch, value_alloca];
        let ok = self.call_runtime(self.abi.chan_recv, self.abi.chan_recv_ty, &mut args, "chan.ok");
        let received = unsafe {
            let name = CString::new("chan.received").expect("ffi string");
            LLVMBuildLoad2(self.builder, elem_ty, value_alloca, name.as_ptr())
        };
        self.emit_lifetime_end(value_alloca, value_size);

        if comma_ok {
            unsafe {
                let mut fields = [elem_ty, self.abi.bool_type];
                let tuple_ty =
                    LLVMStructTypeInContext(self.context, fields.as_mut_ptr(), 2, 0);
                let empty = CString::new("").expect("ffi string");
                let mut tuple = LLVMGetUndef(tuple_ty);
                tuple = LLVMBuildInsertValue(self.builder, tuple, received, 0, empty.as_ptr());
                tuple = LLVMBuildInsertValue(self.builder, tuple, ok, 1, empty.as_ptr());
                tuple
            }
        } else {
            received
        }
    }

    pub fn emit_chan_close(&mut self, ch: LLVMValueRef) {
        let mut args = [ch];
        self.call_runtime(self.abi.chan_close, self.abi.chan_close_ty, &mut args, "");
    }

    /// Lowers a select statement to a single runtime call over a
    /// stack-allocated slice of case states. Returns the `{chosen, ok}` pair;
    /// received values are not part of the result and are read out of the
    /// shared receive buffer by `emit_select_result` when extracted.
    pub fn emit_select(
        &mut self,
        frame: &mut Frame,
        cases: &[SelectCase],
        blocking: bool,
    ) -> LLVMValueRef {
        let result_ty = self.abi.select_result_type;
        if cases.is_empty() {
            if blocking {
                // Blocks forever:
                //     select {}
                self.call_runtime(self.abi.deadlock, self.abi.deadlock_ty, &mut [], "");
                return unsafe { LLVMGetUndef(result_ty) };
            }
            // No-op:
            //     select {
            //     default:
            //     }
            unsafe {
                let empty = CString::new("").expect("ffi string");
                let mut retval = LLVMGetUndef(result_ty);
                retval = LLVMBuildInsertValue(
                    self.builder,
                    retval,
                    LLVMConstInt(self.i32_type, -1i64 as u64, 1),
                    0,
                    empty.as_ptr(),
                );
                retval = LLVMBuildInsertValue(
                    self.builder,
                    retval,
                    LLVMConstInt(self.abi.bool_type, 0, 0),
                    1,
                    empty.as_ptr(),
                );
                return retval; // {-1, false}
            }
        }

        // Go through all the cases. Build one chanSelectState per case and
        // track the receive buffer size and alignment over the receive cases;
        // at most one case completes, so every receive shares one buffer.
        let empty = CString::new("").expect("ffi string");
        let mut recvbuf_size = 0u64;
        let mut recvbuf_align = 0u32;
        let mut has_receives = false;
        let mut select_states = Vec::with_capacity(cases.len());
        for case in cases {
            let mut state = unsafe { LLVMConstNull(self.abi.select_state_type) };
            match case {
                SelectCase::Recv { channel, elem_ty } => {
                    state = unsafe {
                        LLVMBuildInsertValue(self.builder, state, *channel, 0, empty.as_ptr())
                    };
                    let size = self.layout.alloc_size(*elem_ty);
                    if size > recvbuf_size {
                        recvbuf_size = size;
                    }
                    let align = self.layout.abi_alignment(*elem_ty);
                    if align > recvbuf_align {
                        recvbuf_align = align;
                    }
                    has_receives = true;
                }
                SelectCase::Send { channel, value } => {
                    state = unsafe {
                        LLVMBuildInsertValue(self.builder, state, *channel, 0, empty.as_ptr())
                    };
                    // The payload lives in its own stack slot; its address in
                    // the state marks this case as a send.
                    let value_ty = unsafe { LLVMTypeOf(*value) };
                    let alloca = self.create_entry_block_alloca(value_ty, "select.send.value");
                    unsafe {
                        LLVMBuildStore(self.builder, *value, alloca);
                        state =
                            LLVMBuildInsertValue(self.builder, state, alloca, 1, empty.as_ptr());
                    }
                }
            }
            select_states.push(state);
        }

        // The shared receive buffer. Its lifetime spans the whole select
        // statement, including every later extraction of a received value,
        // so no lifetime end is emitted here.
        let recvbuf = if has_receives {
            unsafe {
                let buf_ty = LLVMArrayType2(self.i8_type, recvbuf_size);
                let (alloca, _size) = self.create_temporary_alloca(buf_ty, "select.recvbuf.alloca");
                LLVMSetAlignment(alloca, recvbuf_align);
                let mut indices = [
                    LLVMConstInt(self.i32_type, 0, 0),
                    LLVMConstInt(self.i32_type, 0, 0),
                ];
                let name = CString::new("select.recvbuf").expect("ffi string");
                LLVMBuildInBoundsGEP2(
                    self.builder,
                    buf_ty,
                    alloca,
                    indices.as_mut_ptr(),
                    2,
                    name.as_ptr(),
                )
            }
        } else {
            unsafe { LLVMConstPointerNull(self.ptr_type) }
        };

        // The states slice, allocated on the stack.
        let states_ty =
            unsafe { LLVMArrayType2(self.abi.select_state_type, select_states.len() as u64) };
        let (states_alloca, states_size) =
            self.create_temporary_alloca(states_ty, "select.states.alloca");
        for (i, state) in select_states.iter().enumerate() {
            unsafe {
                let mut indices = [
                    LLVMConstInt(self.i32_type, 0, 0),
                    LLVMConstInt(self.i32_type, i as u64, 0),
                ];
                let slot = LLVMBuildInBoundsGEP2(
                    self.builder,
                    states_ty,
                    states_alloca,
                    indices.as_mut_ptr(),
                    2,
                    empty.as_ptr(),
                );
                LLVMBuildStore(self.builder, *state, slot);
            }
        }
        let states_ptr = unsafe {
            let mut indices = [
                LLVMConstInt(self.i32_type, 0, 0),
                LLVMConstInt(self.i32_type, 0, 0),
            ];
            let name = CString::new("select.states").expect("ffi string");
            LLVMBuildInBoundsGEP2(
                self.builder,
                states_ty,
                states_alloca,
                indices.as_mut_ptr(),
                2,
                name.as_ptr(),
            )
        };
        let states_len =
            unsafe { LLVMConstInt(self.usize_type, select_states.len() as u64, 0) };

        // Do the select in the runtime.
        let results = if blocking {
            // One blocked-list slot per case, so the runtime can register the
            // task against every case's wait queue as a group. Stack
            // allocated; a slice literal here would heap-allocate.
            let block_ty = unsafe {
                LLVMArrayType2(self.abi.blocked_list_type, select_states.len() as u64)
            };
            let (block_alloca, block_size) =
                self.create_temporary_alloca(block_ty, "select.block.alloca");
            let block_ptr = unsafe {
                let mut indices = [
                    LLVMConstInt(self.i32_type, 0, 0),
                    LLVMConstInt(self.i32_type, 0, 0),
                ];
                let name = CString::new("select.block").expect("ffi string");
                LLVMBuildInBoundsGEP2(
                    self.builder,
                    block_ty,
                    block_alloca,
                    indices.as_mut_ptr(),
                    2,
                    name.as_ptr(),
                )
            };

            let mut args = [
                recvbuf, states_ptr, states_len, states_len, block_ptr, states_len, states_len,
            ];
            let results = self.call_runtime(
                self.abi.chan_select,
                self.abi.chan_select_ty,
                &mut args,
                "select.result",
            );

            // Terminate the lifetime of the operation structures.
            self.emit_lifetime_end(block_alloca, block_size);
            results
        } else {
            let mut args = [recvbuf, states_ptr, states_len, states_len];
            self.call_runtime(
                self.abi.try_chan_select,
                self.abi.try_chan_select_ty,
                &mut args,
                "select.result",
            )
        };

        // Terminate the lifetime of the states alloca.
        self.emit_lifetime_end(states_alloca, states_size);

        // Received values cannot be loaded in advance; the extraction of any
        // case payload happens later, against this buffer.
        frame.select_recv_buf.insert(results, recvbuf);

        results
    }

    /// Reads one field of a select's `(chosen, ok, received...)` tuple.
    /// Indices 0 and 1 come from the runtime's result pair; any higher index
    /// is a received value and is loaded from the select's receive buffer at
    /// the static type expected by the extraction site.
    pub fn emit_select_result(
        &mut self,
        frame: &Frame,
        tuple: LLVMValueRef,
        index: u32,
        expected_ty: LLVMTypeRef,
    ) -> Result<LLVMValueRef, String> {
        let empty = CString::new("").expect("ffi string");
        if index == 0 {
            // chosen case index
            unsafe {
                let mut value =
                    LLVMBuildExtractValue(self.builder, tuple, 0, empty.as_ptr());
                if LLVMGetIntTypeWidth(LLVMTypeOf(value)) < LLVMGetIntTypeWidth(self.int_type) {
                    let name = CString::new("select.index").expect("ffi string");
                    value = LLVMBuildSExt(self.builder, value, self.int_type, name.as_ptr());
                }
                Ok(value)
            }
        } else if index == 1 {
            // comma-ok
            unsafe { Ok(LLVMBuildExtractValue(self.builder, tuple, 1, empty.as_ptr())) }
        } else {
            let recvbuf = frame
                .select_recv_buf
                .get(&tuple)
                .copied()
                .ok_or_else(|| "no receive buffer recorded for select result".to_string())?;
            unsafe {
                let cast =
                    LLVMBuildPointerCast(self.builder, recvbuf, self.ptr_type, empty.as_ptr());
                let name = CString::new("select.received").expect("ffi string");
                Ok(LLVMBuildLoad2(self.builder, expected_ty, cast, name.as_ptr()))
            }
        }
    }
}
