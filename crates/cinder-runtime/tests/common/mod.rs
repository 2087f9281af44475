#![allow(dead_code)]

//! Shared test helpers: a capturing `print` sink and run wrappers

use cinder_runtime::{InterpretError, Vm, VmOptions};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// A `Write` sink the test keeps a handle to after handing it to the VM
#[derive(Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("print output was not UTF-8")
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run a program and return everything it printed
pub fn run_with_options(source: &str, options: VmOptions) -> Result<String, InterpretError> {
    let buffer = CaptureBuffer::new();
    let mut vm = Vm::with_options(options);
    vm.set_output(Box::new(buffer.clone()));
    vm.interpret(source)?;
    Ok(buffer.contents())
}

pub fn run(source: &str) -> String {
    run_with_options(source, VmOptions::default()).expect("program failed")
}
