//! Run command — execute a Cinder source file

use super::{report_diagnostics, report_runtime_error, EX_DATAERR, EX_IOERR, EX_SOFTWARE};
use cinder_runtime::{InterpretError, Vm, VmOptions};
use std::fs;
use std::path::Path;

/// Compile and execute a source file, or with `disasm` just print its
/// bytecode. Returns the process exit code.
pub fn run_file(path: &Path, options: VmOptions, disasm: bool, json: bool) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cinder: could not read {}: {}", path.display(), err);
            return EX_IOERR;
        }
    };

    let mut vm = Vm::with_options(options);

    if disasm {
        return match vm.compile_source(&source) {
            Ok(function) => {
                print!("{}", vm.disassemble_function(function));
                0
            }
            Err(diagnostics) => {
                report_diagnostics(&diagnostics, json);
                EX_DATAERR
            }
        };
    }

    match vm.interpret(&source) {
        Ok(()) => 0,
        Err(InterpretError::Compile(diagnostics)) => {
            report_diagnostics(&diagnostics, json);
            EX_DATAERR
        }
        Err(InterpretError::Runtime(error)) => {
            report_runtime_error(&error);
            EX_SOFTWARE
        }
    }
}
