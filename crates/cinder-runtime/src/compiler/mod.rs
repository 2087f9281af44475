//! Single-pass bytecode compiler
//!
//! Tokens stream straight from the scanner into bytecode; there is no AST.
//! Expressions use Pratt parsing (`expr.rs`), statements are recursive
//! descent (`stmt.rs`), and this module holds the shared machinery: the
//! parser state, emit helpers, scope tracking, and variable resolution with
//! upvalue planning.
//!
//! Compilation maintains a stack of per-function states. Resolving a name
//! walks the current function's locals, then recurses outward through
//! enclosing functions; a hit in an outer function marks that local captured
//! and threads an upvalue plan through every function in between.

mod expr;
mod stmt;

use crate::bytecode::{Chunk, OpCode};
use crate::diagnostic::Diagnostic;
use crate::heap::{Heap, ObjRef};
use crate::object::{Function, Obj};
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Locals per function, including the reserved callee slot
pub const MAX_LOCALS: usize = 256;

/// Upvalues per function
pub const MAX_UPVALUES: usize = 256;

/// Compile a source string into the implicit top-level script function.
/// Returns every diagnostic found when the source does not compile.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_function();
    if compiler.parser.diagnostics.is_empty() {
        Ok(function)
    } else {
        Err(compiler.parser.diagnostics)
    }
}

/// What kind of function body is being compiled; decides the reserved
/// slot-zero name and the implicit return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable slot
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or `None` while declared-but-uninitialized (forbids
    /// `var a = a;`)
    depth: Option<u32>,
    /// Captured locals close into upvalues instead of being popped
    is_captured: bool,
}

/// How a closure sources one upvalue: slot `index` of the enclosing function
/// (`is_local`) or upvalue `index` of the enclosing closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpvaluePlan {
    pub(crate) index: u8,
    pub(crate) is_local: bool,
}

/// Per-function compilation state
struct FunctionState<'src> {
    kind: FunctionKind,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvaluePlan>,
    scope_depth: u32,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        // Slot zero holds the callee; methods expose it as `this`.
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: Some(0),
            is_captured: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Innermost enclosing class, for `this`/`super` resolution
struct ClassState {
    has_superclass: bool,
}

/// Token stream state shared by all parsing routines
struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
}

/// Compiler state: the parser, the heap it allocates into, and the stacks of
/// function and class scopes.
pub(crate) struct Compiler<'src, 'heap> {
    parser: Parser<'src>,
    heap: &'heap mut Heap,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        Self {
            parser: Parser {
                scanner: Scanner::new(source),
                current: Token::empty(),
                previous: Token::empty(),
                diagnostics: Vec::new(),
                panic_mode: false,
            },
            heap,
            functions: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.next_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let token = self.parser.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // === Error reporting ===

    fn error(&mut self, message: &str) {
        let token = self.parser.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.parser.current;
        self.error_at(token, message);
    }

    /// Report an error unless already panicking; panic mode suppresses the
    /// cascade until `synchronize` reaches a statement boundary.
    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        let diagnostic = match token.kind {
            TokenKind::Eof => Diagnostic::at_end(token.line, message),
            TokenKind::Error => Diagnostic::plain(token.line, message),
            _ => Diagnostic::at_token(token.line, token.lexeme, message),
        };
        self.parser.diagnostics.push(diagnostic);
    }

    /// Skip tokens until a likely statement boundary
    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Emit helpers ===

    fn state(&self) -> &FunctionState<'src> {
        self.functions.last().expect("compiler function stack empty")
    }

    fn state_mut(&mut self) -> &mut FunctionState<'src> {
        self.functions
            .last_mut()
            .expect("compiler function stack empty")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.state_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    /// The implicit return: initializers return `this` (slot 0), everything
    /// else returns `nil`.
    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Emit a forward jump with a placeholder offset; returns the offset of
    /// the placeholder for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.state().chunk.code.len() - 2
    }

    /// Back-patch a forward jump to land on the next instruction
    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves.
        let jump = self.state().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = &mut self.state_mut().chunk;
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    /// Emit a backward jump to `loop_start`
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.state().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // === Constants ===

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.state_mut().chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, index);
    }

    /// Intern an identifier and add it to the constant pool
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj = self.heap.intern(name);
        self.make_constant(Value::Obj(obj))
    }

    // === Scopes and locals ===

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Close a scope: discard its locals, closing over any that were
    /// captured.
    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let state = self.state();
            let captured = match state.locals.last() {
                Some(local) if local.depth.unwrap_or(0) > state.scope_depth => local.is_captured,
                _ => break,
            };
            self.state_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Record a new local in the current scope; no code is emitted, the
    /// value is already in its stack slot.
    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.parser.previous;

        let state = self.state();
        let mut duplicate = false;
        for local in state.locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < state.scope_depth {
                    break;
                }
            }
            if local.name == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name: name.lexeme,
            depth: None,
            is_captured: false,
        });
    }

    /// Parse a variable name; returns the name-constant index for globals,
    /// 0 for locals (which need none).
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.lexeme;
        self.identifier_constant(name)
    }

    /// A local becomes readable only once its initializer has run
    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    /// Find `name` among the locals of function `func_index`, top down
    fn resolve_local(&mut self, func_index: usize, name: &str) -> Option<u8> {
        let found = self.functions[func_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot, local.depth.is_none()));
        match found {
            Some((slot, uninitialized)) => {
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(slot as u8)
            }
            None => None,
        }
    }

    /// Find `name` in an enclosing function, planning the capture chain.
    /// Direct hits capture the enclosing local; deeper hits re-capture the
    /// enclosing function's own upvalue, so every intermediate function gets
    /// a plan.
    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(func_index - 1, name) {
            self.functions[func_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(func_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(func_index - 1, name) {
            return Some(self.add_upvalue(func_index, upvalue, false));
        }
        None
    }

    /// Append an upvalue plan, reusing an existing identical one
    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> u8 {
        let plan = UpvaluePlan { index, is_local };
        if let Some(existing) = self.functions[func_index]
            .upvalues
            .iter()
            .position(|&p| p == plan)
        {
            return existing as u8;
        }
        if self.functions[func_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.functions[func_index].upvalues.push(plan);
        (self.functions[func_index].upvalues.len() - 1) as u8
    }

    /// Finish the innermost function: emit the implicit return, pop its
    /// state, and allocate the finished [`Function`] object. Returns the
    /// upvalue plans so the caller can emit the `Closure` operand pairs.
    fn end_function(&mut self) -> (ObjRef, Vec<UpvaluePlan>) {
        self.emit_return();
        let state = self.functions.pop().expect("compiler function stack empty");
        let name = state.name.map(|n| self.heap.intern(&n));
        let function = self.heap.allocate(Obj::Function(Function {
            arity: state.arity,
            upvalue_count: state.upvalues.len(),
            chunk: state.chunk,
            name,
        }));
        (function, state.upvalues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble_chunk;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("compilation failed");
        (heap, function)
    }

    fn compile_errors(source: &str) -> Vec<Diagnostic> {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("compilation unexpectedly succeeded")
    }

    #[test]
    fn test_script_function_shape() {
        let (heap, function) = compile_ok("print 1;");
        let function = heap.function(function);
        assert_eq!(function.arity, 0);
        assert_eq!(function.upvalue_count, 0);
        assert!(function.name.is_none());
    }

    #[test]
    fn test_expression_bytecode() {
        let (heap, function) = compile_ok("print 1 + 2 * 3;");
        let listing = disassemble_chunk(&heap, &heap.function(function).chunk, "script");
        // Operands compile in precedence order: 2 * 3 runs before the add.
        let add = listing.find("Add").expect("no Add emitted");
        let multiply = listing.find("Multiply").expect("no Multiply emitted");
        assert!(multiply < add);
    }

    #[test]
    fn test_error_reports_line_and_lexeme() {
        let diagnostics = compile_errors("var 1 = 2;");
        assert_eq!(
            diagnostics[0].to_string(),
            "[line 1] Error at '1': Expect variable name."
        );
    }

    #[test]
    fn test_panic_mode_recovers_at_statement_boundary() {
        let diagnostics = compile_errors("var 1 = 2;\nvar 3 = 4;");
        // One error per statement: the cascade inside each is suppressed.
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[1].line, 2);
    }

    #[test]
    fn test_self_read_in_initializer() {
        let diagnostics = compile_errors("{ var a = a; }");
        assert_eq!(
            diagnostics[0].message,
            "Can't read local variable in its own initializer."
        );
    }

    #[test]
    fn test_duplicate_local() {
        let diagnostics = compile_errors("{ var a = 1; var a = 2; }");
        assert_eq!(
            diagnostics[0].message,
            "Already a variable with this name in this scope."
        );
    }

    #[test]
    fn test_return_outside_function() {
        let diagnostics = compile_errors("return 1;");
        assert_eq!(diagnostics[0].message, "Can't return from top-level code.");
    }

    #[test]
    fn test_this_outside_class() {
        let diagnostics = compile_errors("print this;");
        assert_eq!(
            diagnostics[0].message,
            "Can't use 'this' outside of a class."
        );
    }

    #[test]
    fn test_class_cannot_inherit_from_itself() {
        let diagnostics = compile_errors("class A < A {}");
        assert_eq!(diagnostics[0].message, "A class can't inherit from itself.");
    }

    #[test]
    fn test_closure_upvalue_plans() {
        let (heap, script) = compile_ok(
            "fun outer() { var x = 1; fun middle() { fun inner() { return x; } } }",
        );
        // outer's chunk holds middle, middle's holds inner; both capture x,
        // inner through middle's upvalue.
        let outer = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|&o| matches!(heap.get(o), Obj::Function(_)))
            .expect("outer function constant");
        let middle = heap
            .function(outer)
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|&o| matches!(heap.get(o), Obj::Function(_)))
            .expect("middle function constant");
        let inner = heap
            .function(middle)
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|&o| matches!(heap.get(o), Obj::Function(_)))
            .expect("inner function constant");
        assert_eq!(heap.function(middle).upvalue_count, 1);
        assert_eq!(heap.function(inner).upvalue_count, 1);
    }
}
