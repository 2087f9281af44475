//! Stack-based virtual machine
//!
//! Executes bytecode with a value stack and a stack of call frames. The VM
//! owns the heap, the globals table, and the open-upvalue list, and it is
//! the component that decides when the collector runs: every runtime
//! allocation funnels through [`Vm::alloc`] / [`Vm::intern`], which collect
//! first when the heap asks for it (or on every allocation under
//! `gc_stress`). Multi-step constructions keep their intermediates on the
//! stack across allocations so a collection can never free them.

mod frame;
mod gc;

pub use frame::CallFrame;

use crate::bytecode::{disassemble_chunk, disassemble_instruction, OpCode};
use crate::compiler::compile;
use crate::diagnostic::Diagnostic;
use crate::heap::{Heap, ObjRef};
use crate::natives::{self, NativeFn};
use crate::object::{
    BoundMethod, Class, Closure, Instance, Native, Obj, Upvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::{format_value, Value};
use std::fmt::Write as _;
use std::io::Write;
use thiserror::Error;

/// Maximum call depth
pub const FRAMES_MAX: usize = 64;

/// Value-stack bound implied by the frame cap and per-frame slot budget
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// One line of a runtime error's stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Line of the instruction being executed in this frame
    pub line: u32,
    /// Function name; `None` for the top-level script
    pub function: Option<String>,
}

/// A runtime failure. The VM has already unwound: all frames are closed and
/// the stack is reset, so the VM is ready for the next top-level input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    /// Innermost frame first
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    /// Render the trace portion: `[line N] in name()` / `[line N] in script`
    pub fn stack_trace(&self) -> String {
        let mut output = String::new();
        for frame in &self.trace {
            match &frame.function {
                Some(name) => writeln!(output, "[line {}] in {}()", frame.line, name),
                None => writeln!(output, "[line {}] in script", frame.line),
            }
            .expect("writing to string");
        }
        output
    }
}

/// Why a top-level interpretation failed
#[derive(Debug, Error)]
pub enum InterpretError {
    /// The source did not compile; no code ran
    #[error("compile error")]
    Compile(Vec<Diagnostic>),
    /// Execution failed; the stack has been reset
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Execution toggles, all off by default
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    /// Log every instruction with the stack contents before it
    pub trace_execution: bool,
    /// Log the disassembly of each compiled function before running
    pub print_code: bool,
    /// Collect before every runtime allocation
    pub gc_stress: bool,
    /// Override the initial collection threshold in bytes
    pub gc_threshold: Option<usize>,
}

/// Virtual machine state
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Head of the open-upvalue list, sorted by descending stack slot
    open_upvalues: Option<ObjRef>,
    /// Interned `"init"`, looked up on every class call
    init_string: ObjRef,
    options: VmOptions,
    /// Where `print` writes; swappable for capture
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        if let Some(threshold) = options.gc_threshold {
            heap.set_gc_threshold(threshold);
        }
        let init_string = heap.intern("init");

        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            options,
            output: Box::new(std::io::stdout()),
        };
        vm.define_native("clock", 0, natives::clock);
        vm
    }

    /// Redirect `print` output
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Register a host function as a global
    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        // Name and native stay rooted on the stack until both exist and the
        // global binding holds them.
        let name_obj = self.intern(name);
        self.push(Value::Obj(name_obj));
        let native = self.alloc(Obj::Native(Native {
            name: name_obj,
            arity,
            function,
        }));
        self.push(Value::Obj(native));
        let key = self.heap.key(name_obj);
        let value = self.peek(0);
        self.globals.set(key, value);
        self.pop();
        self.pop();
    }

    /// Compile and execute one top-level unit. Globals, interned strings,
    /// and surviving objects persist across calls, which is what keeps a
    /// REPL session alive.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        if self.options.print_code {
            self.log_compiled_code(function);
        }

        // Root the script function before the closure allocation can
        // trigger a collection.
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;

        self.run()?;
        Ok(())
    }

    /// Compile without executing (used by `--disasm` and golden tests)
    pub fn compile_source(&mut self, source: &str) -> Result<ObjRef, Vec<Diagnostic>> {
        compile(source, &mut self.heap)
    }

    /// Disassemble a function and every function in its constant pools,
    /// outermost first.
    pub fn disassemble_function(&self, function: ObjRef) -> String {
        let mut output = String::new();
        let mut pending = vec![function];
        while let Some(handle) = pending.pop() {
            let function = self.heap.function(handle);
            let name = match function.name {
                Some(name) => self.heap.string(name).chars.clone(),
                None => "<script>".to_string(),
            };
            output.push_str(&disassemble_chunk(&self.heap, &function.chunk, &name));
            for value in &function.chunk.constants {
                if let Some(obj) = value.as_obj() {
                    if matches!(self.heap.get(obj), Obj::Function(_)) {
                        pending.push(obj);
                    }
                }
            }
        }
        output
    }

    /// Read a global by name, if defined
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let obj = self.heap.find_interned(name)?;
        self.globals.get(self.heap.key(obj))
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Current value-stack depth (zero between top-level runs)
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Current call depth (zero between top-level runs)
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    // === Allocation ===
    //
    // The only two ways the running VM creates heap objects. Both collect
    // first when the heap is past its threshold, so callers must have every
    // intermediate they still need reachable from a root.

    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.maybe_collect();
        self.heap.allocate(obj)
    }

    fn intern(&mut self, chars: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(chars)
    }

    fn maybe_collect(&mut self) {
        if self.options.gc_stress || self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    // === Stack ===

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    /// Build a runtime error with the current stack trace, then unwind
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure_function(frame.closure);
            let line = function.chunk.line_for(frame.ip.saturating_sub(1));
            let name = function
                .name
                .map(|name| self.heap.string(name).chars.clone());
            trace.push(TraceFrame {
                line,
                function: name,
            });
        }
        let error = RuntimeError {
            message: message.into(),
            trace,
        };
        self.reset_stack();
        error
    }

    // === Instruction decoding ===

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = self.heap.closure_function(frame.closure).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("no active call frame");
        self.heap.closure_function(frame.closure).chunk.constants[index]
    }

    /// A constant operand the compiler guarantees is an interned string
    fn read_string_constant(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(handle) => handle,
            value => panic!("expected string constant, found {:?}", value),
        }
    }

    fn frame_base(&self) -> usize {
        self.frames.last().expect("no active call frame").stack_base
    }

    fn current_closure(&self) -> ObjRef {
        self.frames.last().expect("no active call frame").closure
    }

    // === Interpreter loop ===

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.options.trace_execution {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => return Err(self.runtime_error(format!("Unknown opcode {}.", byte))),
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame_base() + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_base();
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }

                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let key = self.heap.key(name);
                    match self.globals.get(key) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.string(name).chars);
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let key = self.heap.key(name);
                    let value = self.peek(0);
                    self.globals.set(key, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let key = self.heap.key(name);
                    let value = self.peek(0);
                    // Assignment never creates a global; undo and report.
                    if self.globals.set(key, value) {
                        self.globals.delete(key);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.string(name).chars);
                        return Err(self.runtime_error(message));
                    }
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.current_closure()).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let upvalue = self.heap.closure(self.current_closure()).upvalues[index];
                    let upvalue_obj = self.heap.upvalue_mut(upvalue);
                    match upvalue_obj.state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            upvalue_obj.state = UpvalueState::Closed(value)
                        }
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    let Some(instance) = self.instance_handle(self.peek(0)) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let key = self.heap.key(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(key) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant();
                    let Some(instance) = self.instance_handle(self.peek(1)) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    let key = self.heap.key(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(key, value);
                    // The assigned value is the expression's result; the
                    // receiver below it goes away.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = match self.pop() {
                        Value::Obj(handle) => handle,
                        value => panic!("super lookup on non-class {:?}", value),
                    };
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,

                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b)) if self.both_strings(a, b) => {
                        self.concatenate(a, b);
                    }
                    _ => {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        )
                    }
                },
                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,

                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },

                OpCode::Print => {
                    let value = self.pop();
                    let text = format_value(&self.heap, value);
                    let _ = writeln!(self.output, "{}", text);
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    let Some(instance) = self.instance_handle(self.peek(arg_count)) else {
                        return Err(self.runtime_error("Only instances have methods."));
                    };
                    let key = self.heap.key(name);
                    if let Some(field) = self.heap.instance(instance).fields.get(key) {
                        // A field shadows any method; call whatever it holds.
                        let slot = self.stack.len() - arg_count - 1;
                        self.stack[slot] = field;
                        self.call_value(field, arg_count)?;
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.invoke_from_class(class, name, arg_count)?;
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(handle) => handle,
                        value => panic!("super invoke on non-class {:?}", value),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(handle) => handle,
                        value => panic!("closure operand is not a function, found {:?}", value),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    // The closure goes on the stack before its upvalues are
                    // captured, so the capture allocations see it as a root.
                    let closure = self.alloc(Obj::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame_base() + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap.closure(self.current_closure()).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.stack_base);
                    if self.frames.is_empty() {
                        // Pop the script closure; execution is complete.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.stack_base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string_constant();
                    let class = self.alloc(Obj::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let Some(superclass) = self
                        .peek(1)
                        .as_obj()
                        .filter(|&handle| matches!(self.heap.get(handle), Obj::Class(_)))
                    else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let subclass = self.peek(0).as_obj().expect("subclass on stack");
                    self.heap.inherit_methods(superclass, subclass);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string_constant();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj().expect("class under method closure");
                    let key = self.heap.key(name);
                    self.heap.class_mut(class).methods.set(key, method);
                    self.pop();
                }
            }
        }
    }

    // === Calls ===

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let Some(handle) = callee.as_obj() else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match self.heap.get(handle) {
            Obj::Closure(_) => self.call_closure(handle, arg_count),
            Obj::Native(native) => {
                let arity = native.arity as usize;
                let function = native.function;
                if arg_count != arity {
                    let message =
                        format!("Expected {} arguments but got {}.", arity, arg_count);
                    return Err(self.runtime_error(message));
                }
                let base = self.stack.len() - arg_count;
                let result = function(&self.stack[base..]);
                // The callee and its arguments collapse into the result.
                self.stack.truncate(base - 1);
                self.push(result);
                Ok(())
            }
            Obj::Class(_) => {
                let instance = self.alloc(Obj::Instance(Instance {
                    class: handle,
                    fields: Table::new(),
                }));
                let callee_slot = self.stack.len() - arg_count - 1;
                self.stack[callee_slot] = Value::Obj(instance);

                let init_key = self.heap.key(self.init_string);
                if let Some(initializer) = self.heap.class(handle).methods.get(init_key) {
                    let Value::Obj(initializer) = initializer else {
                        panic!("method table holds non-closure");
                    };
                    self.call_closure(initializer, arg_count)
                } else if arg_count != 0 {
                    let message = format!("Expected 0 arguments but got {}.", arg_count);
                    Err(self.runtime_error(message))
                } else {
                    Ok(())
                }
            }
            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let callee_slot = self.stack.len() - arg_count - 1;
                self.stack[callee_slot] = receiver;
                self.call_closure(method, arg_count)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let arity = self.heap.closure_function(closure).arity as usize;
        if arg_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, arg_count);
            return Err(self.runtime_error(message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            stack_base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    /// Call a method of `class` directly, without materializing a bound
    /// method.
    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let key = self.heap.key(name);
        let Some(method) = self.heap.class(class).methods.get(key) else {
            let message = format!("Undefined property '{}'.", self.heap.string(name).chars);
            return Err(self.runtime_error(message));
        };
        let Value::Obj(method) = method else {
            panic!("method table holds non-closure");
        };
        self.call_closure(method, arg_count)
    }

    /// Replace the receiver on top of the stack with `class`'s method
    /// `name` bound to it.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let key = self.heap.key(name);
        let Some(method) = self.heap.class(class).methods.get(key) else {
            let message = format!("Undefined property '{}'.", self.heap.string(name).chars);
            return Err(self.runtime_error(message));
        };
        let Value::Obj(method) = method else {
            panic!("method table holds non-closure");
        };
        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // === Upvalues ===

    /// Find or create the open upvalue for a stack slot, keeping the list
    /// sorted by descending slot and sharing one upvalue per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(handle) = current {
            let upvalue = self.heap.upvalue(handle);
            let UpvalueState::Open(open_slot) = upvalue.state else {
                panic!("closed upvalue in open list");
            };
            if open_slot <= slot {
                break;
            }
            prev = Some(handle);
            current = upvalue.next;
        }

        if let Some(handle) = current {
            if let UpvalueState::Open(open_slot) = self.heap.upvalue(handle).state {
                if open_slot == slot {
                    return handle;
                }
            }
        }

        let created = self.alloc(Obj::Upvalue(Upvalue {
            state: UpvalueState::Open(slot),
            next: current,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`, inlining the stack value
    fn close_upvalues(&mut self, last: usize) {
        while let Some(handle) = self.open_upvalues {
            let UpvalueState::Open(slot) = self.heap.upvalue(handle).state else {
                panic!("closed upvalue in open list");
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            let upvalue = self.heap.upvalue_mut(handle);
            self.open_upvalues = upvalue.next;
            upvalue.state = UpvalueState::Closed(value);
        }
    }

    // === Operator helpers ===

    fn binary_number_op(
        &mut self,
        op: impl FnOnce(f64, f64) -> Value,
    ) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    fn both_strings(&self, a: ObjRef, b: ObjRef) -> bool {
        matches!(self.heap.get(a), Obj::String(_)) && matches!(self.heap.get(b), Obj::String(_))
    }

    /// Concatenate two strings into a new interned string. Operands stay on
    /// the stack until the result exists, so the interning allocation cannot
    /// free them.
    fn concatenate(&mut self, a: ObjRef, b: ObjRef) {
        let mut chars = self.heap.string(a).chars.clone();
        chars.push_str(&self.heap.string(b).chars);
        let result = self.intern(&chars);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    fn instance_handle(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&handle| matches!(self.heap.get(handle), Obj::Instance(_)))
    }

    // === Diagnostics ===

    /// Log the stack and the next instruction at `trace` level
    fn trace_instruction(&self) {
        let mut stack_text = String::new();
        for &value in &self.stack {
            write!(stack_text, "[ {} ]", format_value(&self.heap, value))
                .expect("writing to string");
        }
        let frame = self.frames.last().expect("no active call frame");
        let chunk = &self.heap.closure_function(frame.closure).chunk;
        let (instruction, _) = disassemble_instruction(&self.heap, chunk, frame.ip);
        tracing::trace!(target: "cinder::vm", stack = %stack_text, %instruction);
    }

    /// Log the disassembly of a function and everything nested in it
    fn log_compiled_code(&self, function: ObjRef) {
        let listing = self.disassemble_function(function);
        tracing::debug!(target: "cinder::vm", code = %listing, "compiled code");
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(source: &str) -> Vm {
        let mut vm = Vm::new();
        vm.interpret(source).expect("program failed");
        vm
    }

    fn run_error(source: &str) -> RuntimeError {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            Err(InterpretError::Runtime(error)) => error,
            other => panic!("expected runtime error, got {:?}", other.err()),
        }
    }

    fn number_global(vm: &Vm, name: &str) -> f64 {
        vm.get_global(name)
            .and_then(Value::as_number)
            .unwrap_or_else(|| panic!("global '{}' is not a number", name))
    }

    #[test]
    fn test_arithmetic_precedence() {
        let vm = run("var result = 1 + 2 * 3;");
        assert_eq!(number_global(&vm, "result"), 7.0);
    }

    #[test]
    fn test_globals_define_and_assign() {
        let vm = run("var a = 1; a = a + 2;");
        assert_eq!(number_global(&vm, "a"), 3.0);
    }

    #[test]
    fn test_assign_undefined_global_errors() {
        let error = run_error("b = 1;");
        assert_eq!(error.message, "Undefined variable 'b'.");
    }

    #[test]
    fn test_read_undefined_global_errors() {
        let error = run_error("print missing;");
        assert_eq!(error.message, "Undefined variable 'missing'.");
    }

    #[test]
    fn test_string_concatenation_interns_result() {
        let vm = run("var a = \"con\" + \"cat\"; var b = \"concat\";");
        // Both globals hold the same handle.
        assert_eq!(vm.get_global("a"), vm.get_global("b"));
    }

    #[test]
    fn test_add_type_mismatch() {
        let error = run_error("var x = \"a\" + 1;");
        assert_eq!(error.message, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn test_comparison_and_equality() {
        let vm = run(
            "var a = 1 < 2; var b = 2 <= 2; var c = nil == nil; var d = \"x\" == \"x\"; var e = 0 == false;",
        );
        assert_eq!(vm.get_global("a"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("b"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("c"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("d"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("e"), Some(Value::Bool(false)));
    }

    #[test]
    fn test_short_circuit_leaves_one_value() {
        let vm = run(
            "var a = false and missing; var b = true or missing; var c = 1 and 2; var d = nil or 3;",
        );
        // The right operand of a short-circuited branch never evaluates, so
        // `missing` is never looked up.
        assert_eq!(vm.get_global("a"), Some(Value::Bool(false)));
        assert_eq!(vm.get_global("b"), Some(Value::Bool(true)));
        assert_eq!(number_global(&vm, "c"), 2.0);
        assert_eq!(number_global(&vm, "d"), 3.0);
    }

    #[test]
    fn test_control_flow() {
        let vm = run(
            "var total = 0; for (var i = 0; i < 5; i = i + 1) { if (i == 3) { total = total + 10; } else { total = total + 1; } }",
        );
        assert_eq!(number_global(&vm, "total"), 14.0);
    }

    #[test]
    fn test_function_call_and_return() {
        let vm = run("fun add(a, b) { return a + b; } var result = add(2, 3);");
        assert_eq!(number_global(&vm, "result"), 5.0);
    }

    #[test]
    fn test_wrong_arity() {
        let error = run_error("fun f(a) { return a; } f(1, 2);");
        assert_eq!(error.message, "Expected 1 arguments but got 2.");
    }

    #[test]
    fn test_call_non_callable() {
        let error = run_error("var x = 1; x();");
        assert_eq!(error.message, "Can only call functions and classes.");
    }

    #[test]
    fn test_recursion() {
        let vm = run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } var result = fib(10);");
        assert_eq!(number_global(&vm, "result"), 55.0);
    }

    #[test]
    fn test_closure_captures_by_reference() {
        let vm = run(
            "fun outer() { var x = 1; fun inner() { x = x + 1; return x; } return inner; } var f = outer(); var a = f(); var b = f();",
        );
        assert_eq!(number_global(&vm, "a"), 2.0);
        assert_eq!(number_global(&vm, "b"), 3.0);
    }

    #[test]
    fn test_sibling_closures_share_one_upvalue() {
        let vm = run(
            "fun pair() { var x = 0; fun bump() { x = x + 1; } fun read() { return x; } bump(); bump(); var got = read(); return got; } var result = pair();",
        );
        assert_eq!(number_global(&vm, "result"), 2.0);
    }

    #[test]
    fn test_class_fields_and_methods() {
        let vm = run(
            "class Counter { init(start) { this.n = start; } bump() { this.n = this.n + 1; return this.n; } } var c = Counter(10); c.bump(); var result = c.bump();",
        );
        assert_eq!(number_global(&vm, "result"), 12.0);
    }

    #[test]
    fn test_initializer_returns_instance() {
        let vm = run(
            "class A { init() { this.x = 1; } } var a = A(); var result = a.x;",
        );
        assert_eq!(number_global(&vm, "result"), 1.0);
    }

    #[test]
    fn test_class_arity_without_init() {
        let error = run_error("class A {} A(1);");
        assert_eq!(error.message, "Expected 0 arguments but got 1.");
    }

    #[test]
    fn test_undefined_property() {
        let error = run_error("class A {} var a = A(); print a.missing;");
        assert_eq!(error.message, "Undefined property 'missing'.");
    }

    #[test]
    fn test_property_on_non_instance() {
        let error = run_error("print true.field;");
        assert_eq!(error.message, "Only instances have properties.");
    }

    #[test]
    fn test_bound_method_carries_receiver() {
        let vm = run(
            "class A { init() { this.x = 7; } get() { return this.x; } } var m = A().get; var result = m();",
        );
        assert_eq!(number_global(&vm, "result"), 7.0);
    }

    #[test]
    fn test_inheritance_and_super() {
        let vm = run(
            "class A { value() { return 1; } } class B < A { value() { return super.value() + 10; } } var result = B().value();",
        );
        assert_eq!(number_global(&vm, "result"), 11.0);
    }

    #[test]
    fn test_inherit_from_non_class() {
        let error = run_error("var NotAClass = 1; class B < NotAClass {}");
        assert_eq!(error.message, "Superclass must be a class.");
    }

    #[test]
    fn test_stack_overflow() {
        let error = run_error("fun loop() { loop(); } loop();");
        assert_eq!(error.message, "Stack overflow.");
        // Innermost frames first, capped at the frame limit.
        assert_eq!(error.trace.len(), FRAMES_MAX);
        assert_eq!(error.trace[0].function.as_deref(), Some("loop"));
        assert_eq!(error.trace.last().unwrap().function, None);
    }

    #[test]
    fn test_stack_and_frames_empty_after_success() {
        let vm = run("fun f() { return 1; } f();");
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(vm.frame_depth(), 0);
    }

    #[test]
    fn test_stack_reset_after_runtime_error() {
        let mut vm = Vm::new();
        assert!(vm.interpret("fun f() { return missing; } f();").is_err());
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(vm.frame_depth(), 0);
        // The VM accepts the next top-level input.
        vm.interpret("var ok = 1;").expect("vm not reusable");
        assert_eq!(number_global(&vm, "ok"), 1.0);
    }

    #[test]
    fn test_runtime_error_trace_format() {
        let error = run_error("fun inner() { return 1 + nil; }\nfun outer() { return inner(); }\nouter();");
        assert_eq!(error.message, "Operands must be two numbers or two strings.");
        assert_eq!(
            error.stack_trace(),
            "[line 1] in inner()\n[line 2] in outer()\n[line 3] in script\n"
        );
    }

    #[test]
    fn test_globals_persist_across_interpret_calls() {
        let mut vm = Vm::new();
        vm.interpret("var counter = 1;").unwrap();
        vm.interpret("counter = counter + 1;").unwrap();
        assert_eq!(number_global(&vm, "counter"), 2.0);
    }

    #[test]
    fn test_native_clock_is_callable() {
        let vm = run("var t = clock();");
        assert!(number_global(&vm, "t") > 0.0);
    }

    #[test]
    fn test_native_arity_checked() {
        let error = run_error("clock(1);");
        assert_eq!(error.message, "Expected 0 arguments but got 1.");
    }

    #[test]
    fn test_define_native() {
        fn double(args: &[Value]) -> Value {
            match args[0] {
                Value::Number(n) => Value::Number(n * 2.0),
                _ => Value::Nil,
            }
        }
        let mut vm = Vm::new();
        vm.define_native("double", 1, double);
        vm.interpret("var result = double(21);").unwrap();
        assert_eq!(number_global(&vm, "result"), 42.0);
    }
}
