//! Pratt expression parsing
//!
//! Each token kind maps to an optional prefix rule, an optional infix rule,
//! and a precedence. `parse_precedence` runs the prefix rule for the current
//! token, then folds in infix rules while the next token binds at least as
//! tightly. Assignment is only legal when parsing at assignment precedence
//! or looser; a stray `=` anywhere else is reported against its target.

use super::Compiler;
use crate::bytecode::OpCode;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Precedence levels, lowest binding first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    /// One level tighter; used for left-associative infix operators
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'heap> = fn(&mut Compiler<'src, 'heap>, bool);

struct ParseRule<'src, 'heap> {
    prefix: Option<ParseFn<'src, 'heap>>,
    infix: Option<ParseFn<'src, 'heap>>,
    precedence: Precedence,
}

/// The rule table as a function of token kind
fn rule<'src, 'heap>(kind: TokenKind) -> ParseRule<'src, 'heap> {
    use TokenKind::*;

    fn make<'src, 'heap>(
        prefix: Option<ParseFn<'src, 'heap>>,
        infix: Option<ParseFn<'src, 'heap>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'heap> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    match kind {
        LeftParen => make(Some(grouping), Some(call), Precedence::Call),
        Dot => make(None, Some(dot), Precedence::Call),
        Minus => make(Some(unary), Some(binary), Precedence::Term),
        Plus => make(None, Some(binary), Precedence::Term),
        Slash | Star => make(None, Some(binary), Precedence::Factor),
        Bang => make(Some(unary), None, Precedence::None),
        BangEqual | EqualEqual => make(None, Some(binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            make(None, Some(binary), Precedence::Comparison)
        }
        Identifier => make(Some(variable), None, Precedence::None),
        String => make(Some(string), None, Precedence::None),
        Number => make(Some(number), None, Precedence::None),
        And => make(None, Some(and_), Precedence::And),
        Or => make(None, Some(or_), Precedence::Or),
        False | True | Nil => make(Some(literal), None, Precedence::None),
        Super => make(Some(super_), None, Precedence::None),
        This => make(Some(this_), None, Precedence::None),
        _ => make(None, None, Precedence::None),
    }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    pub(super) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    pub(super) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.parser.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.parser.current.kind).precedence {
            self.advance();
            let infix = rule(self.parser.previous.kind)
                .infix
                .expect("token with infix precedence has an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Compile a read of (or assignment to) a named variable, resolving
    /// local, then upvalue, then global.
    pub(super) fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let func_index = self.functions.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(func_index, name.lexeme)
        {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(func_index, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    /// Compile the arguments of a call; returns the count
    pub(super) fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }
}

// === Parselets ===

fn number(compiler: &mut Compiler, _can_assign: bool) {
    let value: f64 = compiler
        .parser
        .previous
        .lexeme
        .parse()
        .expect("scanner produced a malformed number literal");
    compiler.emit_constant(Value::Number(value));
}

fn string(compiler: &mut Compiler, _can_assign: bool) {
    // Trim the surrounding quotes; the bytes in between are the contents.
    let lexeme = compiler.parser.previous.lexeme;
    let contents = &lexeme[1..lexeme.len() - 1];
    let obj = compiler.heap.intern(contents);
    compiler.emit_constant(Value::Obj(obj));
}

fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.parser.previous.kind {
        TokenKind::False => compiler.emit_op(OpCode::False),
        TokenKind::True => compiler.emit_op(OpCode::True),
        TokenKind::Nil => compiler.emit_op(OpCode::Nil),
        _ => unreachable!("literal rule on non-literal token"),
    }
}

fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    compiler.expression();
    compiler.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.parser.previous.kind;
    compiler.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Bang => compiler.emit_op(OpCode::Not),
        TokenKind::Minus => compiler.emit_op(OpCode::Negate),
        _ => unreachable!("unary rule on non-unary token"),
    }
}

fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.parser.previous.kind;
    compiler.parse_precedence(rule(operator).precedence.next());
    match operator {
        TokenKind::BangEqual => compiler.emit_ops(OpCode::Equal, OpCode::Not),
        TokenKind::EqualEqual => compiler.emit_op(OpCode::Equal),
        TokenKind::Greater => compiler.emit_op(OpCode::Greater),
        TokenKind::GreaterEqual => compiler.emit_ops(OpCode::Less, OpCode::Not),
        TokenKind::Less => compiler.emit_op(OpCode::Less),
        TokenKind::LessEqual => compiler.emit_ops(OpCode::Greater, OpCode::Not),
        TokenKind::Plus => compiler.emit_op(OpCode::Add),
        TokenKind::Minus => compiler.emit_op(OpCode::Subtract),
        TokenKind::Star => compiler.emit_op(OpCode::Multiply),
        TokenKind::Slash => compiler.emit_op(OpCode::Divide),
        _ => unreachable!("binary rule on non-binary token"),
    }
}

fn call(compiler: &mut Compiler, _can_assign: bool) {
    let arg_count = compiler.argument_list();
    compiler.emit_op_byte(OpCode::Call, arg_count);
}

fn dot(compiler: &mut Compiler, can_assign: bool) {
    compiler.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let name = compiler.parser.previous.lexeme;
    let constant = compiler.identifier_constant(name);

    if can_assign && compiler.match_token(TokenKind::Equal) {
        compiler.expression();
        compiler.emit_op_byte(OpCode::SetProperty, constant);
    } else if compiler.match_token(TokenKind::LeftParen) {
        // receiver.name(args) fuses the lookup and the call.
        let arg_count = compiler.argument_list();
        compiler.emit_op_byte(OpCode::Invoke, constant);
        compiler.emit_byte(arg_count);
    } else {
        compiler.emit_op_byte(OpCode::GetProperty, constant);
    }
}

fn variable(compiler: &mut Compiler, can_assign: bool) {
    let name = compiler.parser.previous;
    compiler.named_variable(name, can_assign);
}

/// `and` short-circuits by jumping over the right operand while the left is
/// falsey on the stack; exactly one value remains either way.
fn and_(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    compiler.emit_op(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);
    compiler.patch_jump(end_jump);
}

/// `or` keeps a truthy left operand and otherwise pops it for the right
fn or_(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    let end_jump = compiler.emit_jump(OpCode::Jump);
    compiler.patch_jump(else_jump);
    compiler.emit_op(OpCode::Pop);
    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}

fn this_(compiler: &mut Compiler, _can_assign: bool) {
    if compiler.classes.is_empty() {
        compiler.error("Can't use 'this' outside of a class.");
        return;
    }
    variable(compiler, false);
}

fn super_(compiler: &mut Compiler, _can_assign: bool) {
    if compiler.classes.is_empty() {
        compiler.error("Can't use 'super' outside of a class.");
    } else if !compiler.classes.last().is_some_and(|c| c.has_superclass) {
        compiler.error("Can't use 'super' in a class with no superclass.");
    }

    compiler.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    compiler.consume(TokenKind::Identifier, "Expect superclass method name.");
    let name = compiler.parser.previous.lexeme;
    let constant = compiler.identifier_constant(name);

    compiler.named_variable(Token::synthetic("this"), false);
    if compiler.match_token(TokenKind::LeftParen) {
        let arg_count = compiler.argument_list();
        compiler.named_variable(Token::synthetic("super"), false);
        compiler.emit_op_byte(OpCode::SuperInvoke, constant);
        compiler.emit_byte(arg_count);
    } else {
        compiler.named_variable(Token::synthetic("super"), false);
        compiler.emit_op_byte(OpCode::GetSuper, constant);
    }
}
