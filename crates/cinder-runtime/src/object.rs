//! Heap object payloads
//!
//! Every garbage-collected object is one variant of [`Obj`]. The collector
//! branches on the variant to find children; identity is the arena handle,
//! never the contents.

use crate::bytecode::Chunk;
use crate::heap::ObjRef;
use crate::natives::NativeFn;
use crate::table::Table;
use crate::value::Value;

/// A heap-allocated object
#[derive(Debug)]
pub enum Obj {
    String(Str),
    Function(Function),
    Native(Native),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// An interned string with its cached FNV-1a hash
#[derive(Debug)]
pub struct Str {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function: its bytecode, arity, and how many upvalues each
/// closure over it will carry.
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// Interned name; `None` for the top-level script
    pub name: Option<ObjRef>,
}

/// A host function exposed to scripts
#[derive(Debug)]
pub struct Native {
    pub name: ObjRef,
    pub arity: u8,
    pub function: NativeFn,
}

/// A function paired with the upvalues captured at its creation site
#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable, shared between the enclosing activation and any
/// closures that captured it.
#[derive(Debug)]
pub struct Upvalue {
    pub state: UpvalueState,
    /// Next entry in the VM's open-upvalue list (unused once closed)
    pub next: Option<ObjRef>,
}

/// Whether the captured variable still lives on the value stack
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Index of the captured stack slot
    Open(usize),
    /// The variable, moved off the stack when its scope ended
    Closed(Value),
}

/// A class and its method table (name → closure)
#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    pub methods: Table,
}

/// An instance: its class and a field table (name → value)
#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method closure bound to the receiver it was accessed on
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}
