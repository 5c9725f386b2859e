//! Bytecode dump used by `noxt --trace` and by tests that assert on
//! emitted instruction shape. One line per instruction: offset,
//! source line (or `|` when it repeats the previous line), mnemonic,
//! decoded operands, and the resolved constant for opcodes that carry
//! a constant-pool index.

use nox_gc::{Chunk, OpCode, Value};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Returns the formatted line for the instruction at `offset` and the
/// offset of the instruction that follows it.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut line = format!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        line.push_str("   | ");
    } else {
        line.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let op = OpCode::from_u8(chunk.code[offset]);
    let next = match op {
        OpCode::Constant => constant_instruction(&mut line, "OP_CONSTANT", chunk, offset),
        OpCode::GetGlobal => constant_instruction(&mut line, "OP_GET_GLOBAL", chunk, offset),
        OpCode::DefineGlobal => constant_instruction(&mut line, "OP_DEFINE_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instruction(&mut line, "OP_SET_GLOBAL", chunk, offset),
        OpCode::GetProperty => constant_instruction(&mut line, "OP_GET_PROPERTY", chunk, offset),
        OpCode::SetProperty => constant_instruction(&mut line, "OP_SET_PROPERTY", chunk, offset),
        OpCode::GetSuper => constant_instruction(&mut line, "OP_GET_SUPER", chunk, offset),
        OpCode::Class => constant_instruction(&mut line, "OP_CLASS", chunk, offset),
        OpCode::Method => constant_instruction(&mut line, "OP_METHOD", chunk, offset),

        OpCode::GetLocal => byte_instruction(&mut line, "OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction(&mut line, "OP_SET_LOCAL", chunk, offset),
        OpCode::GetUpvalue => byte_instruction(&mut line, "OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction(&mut line, "OP_SET_UPVALUE", chunk, offset),
        OpCode::Call => byte_instruction(&mut line, "OP_CALL", chunk, offset),
        OpCode::BuildList => byte_instruction(&mut line, "OP_BUILD_LIST", chunk, offset),

        OpCode::Jump => jump_instruction(&mut line, "OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction(&mut line, "OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction(&mut line, "OP_LOOP", -1, chunk, offset),

        OpCode::Invoke => invoke_instruction(&mut line, "OP_INVOKE", chunk, offset),

        OpCode::Closure => closure_instruction(&mut line, chunk, offset),

        OpCode::Nil => simple(&mut line, "OP_NIL", offset),
        OpCode::True => simple(&mut line, "OP_TRUE", offset),
        OpCode::False => simple(&mut line, "OP_FALSE", offset),
        OpCode::Pop => simple(&mut line, "OP_POP", offset),
        OpCode::Equal => simple(&mut line, "OP_EQUAL", offset),
        OpCode::Greater => simple(&mut line, "OP_GREATER", offset),
        OpCode::Less => simple(&mut line, "OP_LESS", offset),
        OpCode::Add => simple(&mut line, "OP_ADD", offset),
        OpCode::Subtract => simple(&mut line, "OP_SUBTRACT", offset),
        OpCode::Multiply => simple(&mut line, "OP_MULTIPLY", offset),
        OpCode::Divide => simple(&mut line, "OP_DIVIDE", offset),
        OpCode::Not => simple(&mut line, "OP_NOT", offset),
        OpCode::Negate => simple(&mut line, "OP_NEGATE", offset),
        OpCode::Print => simple(&mut line, "OP_PRINT", offset),
        OpCode::CloseUpvalue => simple(&mut line, "OP_CLOSE_UPVALUE", offset),
        OpCode::Return => simple(&mut line, "OP_RETURN", offset),
        OpCode::Inherit => simple(&mut line, "OP_INHERIT", offset),
        OpCode::IndexSubscr => simple(&mut line, "OP_INDEX_SUBSCR", offset),
        OpCode::StoreSubscr => simple(&mut line, "OP_STORE_SUBSCR", offset),
    };
    (line, next)
}

fn simple(line: &mut String, name: &str, offset: usize) -> usize {
    line.push_str(name);
    offset + 1
}

fn constant_instruction(line: &mut String, name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    line.push_str(&format!(
        "{name:-16} {index:4} '{}'",
        display_constant(&chunk.constants[index])
    ));
    offset + 2
}

fn byte_instruction(line: &mut String, name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    line.push_str(&format!("{name:-16} {slot:4}"));
    offset + 2
}

fn jump_instruction(
    line: &mut String,
    name: &str,
    sign: i32,
    chunk: &Chunk,
    offset: usize,
) -> usize {
    let hi = chunk.code[offset + 1] as u16;
    let lo = chunk.code[offset + 2] as u16;
    let jump = (hi << 8) | lo;
    let target = offset as i32 + 3 + sign * jump as i32;
    line.push_str(&format!("{name:-16} {offset:4} -> {target}"));
    offset + 3
}

fn invoke_instruction(line: &mut String, name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    line.push_str(&format!(
        "{name:-16} ({arg_count} args) {index:4} '{}'",
        display_constant(&chunk.constants[index])
    ));
    offset + 3
}

fn closure_instruction(line: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    line.push_str(&format!(
        "{:-16} {index:4} '{}'",
        "OP_CLOSURE",
        display_constant(&chunk.constants[index])
    ));
    let mut next = offset + 2;
    if let Value::Obj(obj) = chunk.constants[index] {
        if obj.kind() == nox_gc::ObjKind::Function {
            let function: nox_gc::GcRef<nox_gc::ObjFunction> = unsafe { obj.downcast() };
            for _ in 0..function.get().upvalue_count {
                let is_local = chunk.code[next];
                let upvalue_index = chunk.code[next + 1];
                line.push_str(&format!(
                    "\n{next:04}      |                     {} {upvalue_index}",
                    if is_local != 0 { "local" } else { "upvalue" }
                ));
                next += 2;
            }
        }
    }
    next
}

fn display_constant(value: &Value) -> String {
    value.to_string()
}
