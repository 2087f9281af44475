//! Interactive session
//!
//! One VM lives for the whole session, so globals, classes, and functions
//! defined on earlier lines stay visible. Errors report and the loop
//! continues; Ctrl-D (or Ctrl-C) ends the session.

use super::{report_diagnostics, report_runtime_error, EX_IOERR};
use anyhow::Context;
use cinder_runtime::{InterpretError, Vm, VmOptions};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;

pub fn run(options: VmOptions, json: bool) -> i32 {
    match repl_loop(options, json) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("cinder: {:#}", err);
            EX_IOERR
        }
    }
}

fn repl_loop(options: VmOptions, json: bool) -> anyhow::Result<()> {
    let mut vm = Vm::with_options(options);
    let mut editor = DefaultEditor::new().context("could not initialize line editor")?;

    let history = history_path();
    if let Some(path) = &history {
        // Absent on first run.
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                match vm.interpret(&line) {
                    Ok(()) => {}
                    Err(InterpretError::Compile(diagnostics)) => {
                        report_diagnostics(&diagnostics, json)
                    }
                    Err(InterpretError::Runtime(error)) => report_runtime_error(&error),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err).context("could not read input"),
        }
    }

    if let Some(path) = &history {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = editor.save_history(path);
    }
    Ok(())
}

fn history_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("cinder").join("history.txt"))
}
