//! Bytecode disassembler
//!
//! Renders chunks in a human-readable listing for the execution trace,
//! `--disasm`, and golden tests. The line column prints `|` when an
//! instruction shares its source line with the previous one.

use super::{Chunk, OpCode};
use crate::heap::Heap;
use crate::value::{format_value, Value};
use std::fmt::Write;

/// Disassemble a whole chunk under a header
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut output = String::new();
    writeln!(output, "== {} ==", name).unwrap();

    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(heap, chunk, offset);
        writeln!(output, "{}", line).unwrap();
        offset = next;
    }

    output
}

/// Disassemble the instruction at `offset`. Returns the rendered line and
/// the offset of the next instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut line = format!("{:04} ", offset);

    if offset > 0 && chunk.line_for(offset) == chunk.line_for(offset - 1) {
        line.push_str("   | ");
    } else {
        write!(line, "{:4} ", chunk.line_for(offset)).unwrap();
    }

    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(_) => {
            write!(line, "<unknown opcode {:#04x}>", byte).unwrap();
            return (line, offset + 1);
        }
    };

    match op {
        // No operands
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::Inherit => {
            write!(line, "{:?}", op).unwrap();
            (line, offset + 1)
        }

        // One-byte constant operand, shown with the constant's value
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let constant = chunk.code[offset + 1];
            write!(
                line,
                "{:<16?} {:4} '{}'",
                op,
                constant,
                constant_text(heap, chunk, constant)
            )
            .unwrap();
            (line, offset + 2)
        }

        // One-byte slot or count operand
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call => {
            let slot = chunk.code[offset + 1];
            write!(line, "{:<16?} {:4}", op, slot).unwrap();
            (line, offset + 2)
        }

        // Name constant then argument count, from successive bytes
        OpCode::Invoke | OpCode::SuperInvoke => {
            let constant = chunk.code[offset + 1];
            let arg_count = chunk.code[offset + 2];
            write!(
                line,
                "{:<16?} ({} args) {:4} '{}'",
                op,
                arg_count,
                constant,
                constant_text(heap, chunk, constant)
            )
            .unwrap();
            (line, offset + 3)
        }

        // Two-byte jump operands
        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = read_u16(chunk, offset + 1);
            write!(
                line,
                "{:<16?} {:4} -> {}",
                op,
                offset,
                offset + 3 + jump as usize
            )
            .unwrap();
            (line, offset + 3)
        }
        OpCode::Loop => {
            let jump = read_u16(chunk, offset + 1);
            write!(
                line,
                "{:<16?} {:4} -> {}",
                op,
                offset,
                offset + 3 - jump as usize
            )
            .unwrap();
            (line, offset + 3)
        }

        // Function constant followed by one (is_local, index) pair per
        // upvalue
        OpCode::Closure => {
            let mut offset = offset + 1;
            let constant = chunk.code[offset];
            offset += 1;
            write!(
                line,
                "{:<16?} {:4} {}",
                op,
                constant,
                constant_text(heap, chunk, constant)
            )
            .unwrap();

            let function = match chunk.constants[constant as usize] {
                Value::Obj(handle) => heap.function(handle),
                _ => panic!("closure operand is not a function constant"),
            };
            for _ in 0..function.upvalue_count {
                let is_local = chunk.code[offset];
                let index = chunk.code[offset + 1];
                write!(
                    line,
                    "\n{:04}      |                     {} {}",
                    offset,
                    if is_local == 1 { "local" } else { "upvalue" },
                    index
                )
                .unwrap();
                offset += 2;
            }
            (line, offset)
        }
    }
}

fn constant_text(heap: &Heap, chunk: &Chunk, constant: u8) -> String {
    match chunk.constants.get(constant as usize) {
        Some(&value) => format_value(heap, value),
        None => "<bad constant>".to_string(),
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    let high = chunk.code[offset] as u16;
    let low = chunk.code[offset + 1] as u16;
    (high << 8) | low
}
