use ember_lang::diagnostics::{emit_pass_errors, report_io_error};
use ember_lang::transform::lower_interrupts;
use llvm_sys::core::{
    LLVMContextCreate, LLVMContextDispose, LLVMCreateMemoryBufferWithContentsOfFile,
    LLVMDisposeMessage, LLVMDisposeModule, LLVMPrintModuleToString,
};
use llvm_sys::ir_reader::LLVMParseIRInContext;
use std::env;
use std::ffi::{CStr, CString};
use std::path::Path;
use std::process;
use std::ptr;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() != 3 {
        eprintln!("Usage: ember-lang lower-interrupts <module.ll|module.bc>");
        process::exit(1);
    }

    let command = &args[1];
    let filename = &args[2];

    if command != "lower-interrupts" {
        eprintln!("Unknown command `{}`. Only lower-interrupts is supported.", command);
        process::exit(1);
    }

    if !filename.ends_with(".ll") && !filename.ends_with(".bc") {
        eprintln!("Invalid file extension. Only .ll and .bc modules are accepted.");
        process::exit(1);
    }

    unsafe {
        let context = LLVMContextCreate();
        let path_c = CString::new(filename.as_str()).expect("ffi string");

        let mut buffer = ptr::null_mut();
        let mut message = ptr::null_mut();
        if LLVMCreateMemoryBufferWithContentsOfFile(path_c.as_ptr(), &mut buffer, &mut message)
            != 0
        {
            let text = CStr::from_ptr(message).to_string_lossy().into_owned();
            LLVMDisposeMessage(message);
            report_io_error(Path::new(filename), &text);
            LLVMContextDispose(context);
            process::exit(1);
        }

        // Takes ownership of the buffer, also on failure.
        let mut module = ptr::null_mut();
        let mut message = ptr::null_mut();
        if LLVMParseIRInContext(context, buffer, &mut module, &mut message) != 0 {
            let text = CStr::from_ptr(message).to_string_lossy().into_owned();
            LLVMDisposeMessage(message);
            eprintln!("Failed to parse {}: {}", filename, text);
            LLVMContextDispose(context);
            process::exit(1);
        }

        let errors = lower_interrupts(module);
        if !errors.is_empty() {
            emit_pass_errors(&errors);
            LLVMDisposeModule(module);
            LLVMContextDispose(context);
            process::exit(1);
        }

        let ir = LLVMPrintModuleToString(module);
        print!("{}", CStr::from_ptr(ir).to_string_lossy());
        LLVMDisposeMessage(ir);

        LLVMDisposeModule(module);
        LLVMContextDispose(context);
    }
}
