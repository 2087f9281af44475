//! Driver commands

pub mod repl;
pub mod run;

use cinder_runtime::{Diagnostic, RuntimeError};

/// Usage error
pub const EX_USAGE: i32 = 64;
/// Compile error
pub const EX_DATAERR: i32 = 65;
/// Runtime error
pub const EX_SOFTWARE: i32 = 70;
/// I/O error
pub const EX_IOERR: i32 = 74;

/// Print compile diagnostics to stderr, human-readable or as one JSON array
pub fn report_diagnostics(diagnostics: &[Diagnostic], json: bool) {
    if json {
        match serde_json::to_string(diagnostics) {
            Ok(rendered) => eprintln!("{}", rendered),
            Err(err) => eprintln!("cinder: could not render diagnostics: {}", err),
        }
    } else {
        for diagnostic in diagnostics {
            eprintln!("{}", diagnostic);
        }
    }
}

/// Print a runtime error and its stack trace to stderr
pub fn report_runtime_error(error: &RuntimeError) {
    eprintln!("{}", error);
    eprint!("{}", error.stack_trace());
}
