//! Native function interface
//!
//! Hosts register `(name, arity, function)` triples with
//! [`crate::vm::Vm::define_native`]. A native receives the argument window of
//! the value stack and returns a single value. The plain fn-pointer
//! signature keeps natives from allocating heap objects or re-entering the
//! VM.

use crate::value::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Signature of a host function callable from scripts
pub type NativeFn = fn(&[Value]) -> Value;

/// Seconds since the Unix epoch, as a number. Registered as `clock` on every
/// VM.
pub(crate) fn clock(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}
