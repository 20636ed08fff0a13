use std::fmt::Write;

use super::chunk::{Chunk, OpCode};
use super::heap::Heap;
use super::object::ObjBody;
use super::value::Value;

// ---------------------------------------------------------------------------
// Disassembler
// ---------------------------------------------------------------------------

/// Render a whole chunk, one instruction per line.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Render one instruction, returning the offset of the next one.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let op = match OpCode::from_byte(chunk.code[offset]) {
        Some(op) => op,
        None => {
            let _ = writeln!(out, "Unknown opcode {}", chunk.code[offset]);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(heap, op, chunk, offset, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::BuildList => byte_instruction(op, chunk, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::AsyncBegin => {
            jump_instruction(op, 1, chunk, offset, out)
        }
        OpCode::Loop => jump_instruction(op, -1, chunk, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(heap, op, chunk, offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        _ => simple_instruction(op, offset, out),
    }
}

fn op_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Constant => "OP_CONSTANT",
        OpCode::Nil => "OP_NIL",
        OpCode::True => "OP_TRUE",
        OpCode::False => "OP_FALSE",
        OpCode::Pop => "OP_POP",
        OpCode::GetLocal => "OP_GET_LOCAL",
        OpCode::SetLocal => "OP_SET_LOCAL",
        OpCode::GetGlobal => "OP_GET_GLOBAL",
        OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
        OpCode::SetGlobal => "OP_SET_GLOBAL",
        OpCode::GetUpvalue => "OP_GET_UPVALUE",
        OpCode::SetUpvalue => "OP_SET_UPVALUE",
        OpCode::GetProperty => "OP_GET_PROPERTY",
        OpCode::SetProperty => "OP_SET_PROPERTY",
        OpCode::GetSuper => "OP_GET_SUPER",
        OpCode::Equal => "OP_EQUAL",
        OpCode::Greater => "OP_GREATER",
        OpCode::Less => "OP_LESS",
        OpCode::Add => "OP_ADD",
        OpCode::Subtract => "OP_SUBTRACT",
        OpCode::Multiply => "OP_MULTIPLY",
        OpCode::Divide => "OP_DIVIDE",
        OpCode::Modulus => "OP_MODULUS",
        OpCode::Not => "OP_NOT",
        OpCode::Negate => "OP_NEGATE",
        OpCode::Print => "OP_PRINT",
        OpCode::Jump => "OP_JUMP",
        OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
        OpCode::Loop => "OP_LOOP",
        OpCode::Call => "OP_CALL",
        OpCode::Invoke => "OP_INVOKE",
        OpCode::SuperInvoke => "OP_SUPER_INVOKE",
        OpCode::Closure => "OP_CLOSURE",
        OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
        OpCode::Return => "OP_RETURN",
        OpCode::Class => "OP_CLASS",
        OpCode::Inherit => "OP_INHERIT",
        OpCode::Method => "OP_METHOD",
        OpCode::BuildList => "OP_BUILD_LIST",
        OpCode::IndexGet => "OP_INDEX_GET",
        OpCode::IndexSet => "OP_INDEX_SET",
        OpCode::FinishBegin => "OP_FINISH_BEGIN",
        OpCode::FinishEnd => "OP_FINISH_END",
        OpCode::AsyncBegin => "OP_ASYNC_BEGIN",
        OpCode::AsyncEnd => "OP_ASYNC_END",
        OpCode::Future => "OP_FUTURE",
    }
}

fn simple_instruction(op: OpCode, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{}", op_name(op));
    offset + 1
}

fn constant_instruction(
    heap: &Heap,
    op: OpCode,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let constant = chunk.code[offset + 1];
    let _ = writeln!(
        out,
        "{:<16} {:4} '{}'",
        op_name(op),
        constant,
        heap.value_to_string(chunk.constants[constant as usize]),
    );
    offset + 2
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {:4}", op_name(op), slot);
    offset + 2
}

fn jump_instruction(op: OpCode, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as i32;
    let target = offset as i32 + 3 + sign * jump;
    let _ = writeln!(out, "{:<16} {:4} -> {}", op_name(op), offset, target);
    offset + 3
}

fn invoke_instruction(
    heap: &Heap,
    op: OpCode,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let _ = writeln!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        op_name(op),
        arg_count,
        constant,
        heap.value_to_string(chunk.constants[constant as usize]),
    );
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset];
    offset += 1;
    let _ = writeln!(
        out,
        "{:<16} {:4} {}",
        "OP_CLOSURE",
        constant,
        heap.value_to_string(chunk.constants[constant as usize]),
    );

    let upvalue_count = match chunk.constants[constant as usize] {
        Value::Obj(r) => match &heap.get(r).body {
            ObjBody::Function(f) => f.upvalue_count,
            _ => 0,
        },
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}      |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index,
        );
        offset += 2;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembles_constants_and_simple_ops() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.2)) as u8;
        chunk.write_op(OpCode::Constant, 123);
        chunk.write(idx, 123);
        chunk.write_op(OpCode::Return, 123);

        let text = disassemble_chunk(&heap, &chunk, "test chunk");
        assert!(text.contains("== test chunk =="));
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("'1.2'"));
        assert!(text.contains("OP_RETURN"));
        // Second instruction on the same line shows the `|` marker.
        assert!(text.contains("   | "));
    }

    #[test]
    fn jump_targets_are_absolute() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(5, 1);

        let mut out = String::new();
        let next = disassemble_instruction(&heap, &chunk, 0, &mut out);
        assert_eq!(next, 3);
        assert!(out.contains("OP_JUMP"));
        assert!(out.contains("0 -> 8"));
    }
}
