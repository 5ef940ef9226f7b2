//! disasm.rs — textual disassembly of a compiled [`Chunk`], for the CLI's
//! debug-only `--trace` flag and for tests that want to assert on emitted
//! bytecode shape without depending on VM internals.

use std::fmt::Write as _;

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::ops::Op;
use crate::value::format_value;

/// Renders every instruction in `chunk` as `OFFSET LINE MNEMONIC operand`,
/// one line per instruction, prefixed by `name`. Mirrors clox's
/// `disassembleChunk`/`disassembleInstruction` pair, collapsed into one
/// pass since `Op` already carries its own decoded operands.
pub fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    for (offset, op) in chunk.code.iter().enumerate() {
        let _ = write!(out, "{offset:04} ");
        let line = chunk.line_of(offset);
        if offset > 0 && line == chunk.line_of(offset - 1) {
            let _ = write!(out, "   | ");
        } else {
            let _ = write!(out, "{line:4} ");
        }
        let _ = writeln!(out, "{}", disassemble_instruction(chunk, heap, op));
    }
    out
}

fn disassemble_instruction(chunk: &Chunk, heap: &Heap, op: &Op) -> String {
    match op {
        Op::Constant(idx) => format!("{:<16} {:4} '{}'", op.mnemonic(), idx, describe_constant(chunk, heap, *idx)),
        Op::GetLocal(slot) | Op::SetLocal(slot) => format!("{:<16} {:4}", op.mnemonic(), slot),
        Op::DefineGlobal(idx) | Op::GetGlobal(idx) | Op::SetGlobal(idx) => {
            format!("{:<16} {:4} '{}'", op.mnemonic(), idx, describe_constant(chunk, heap, *idx))
        }
        Op::GetUpvalue(slot) | Op::SetUpvalue(slot) => format!("{:<16} {:4}", op.mnemonic(), slot),
        Op::GetProperty(idx) | Op::SetProperty(idx) | Op::GetSuper(idx) => {
            format!("{:<16} {:4} '{}'", op.mnemonic(), idx, describe_constant(chunk, heap, *idx))
        }
        Op::Jump(offset) | Op::JumpIfFalse(offset) | Op::Loop(offset) => {
            format!("{:<16} {:4}", op.mnemonic(), offset)
        }
        Op::Call(argc) => format!("{:<16} ({argc} args)", op.mnemonic()),
        Op::Invoke(idx, argc) | Op::SuperInvoke(idx, argc) => {
            format!("{:<16} {:4} '{}' ({argc} args)", op.mnemonic(), idx, describe_constant(chunk, heap, *idx))
        }
        Op::Closure(idx, captures) => {
            format!(
                "{:<16} {:4} '{}' ({} upvalue(s))",
                op.mnemonic(),
                idx,
                describe_constant(chunk, heap, *idx),
                captures.len()
            )
        }
        Op::Class(idx) | Op::Method(idx) => {
            format!("{:<16} {:4} '{}'", op.mnemonic(), idx, describe_constant(chunk, heap, *idx))
        }
        _ => op.mnemonic().to_string(),
    }
}

fn describe_constant(chunk: &Chunk, heap: &Heap, idx: u8) -> String {
    match chunk.constants.get(idx as usize) {
        Some(v) => format_value(heap, *v),
        None => "<out of range>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn renders_a_header_and_one_line_per_op() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0)).unwrap();
        chunk.write(Op::Constant(idx), 1);
        chunk.write(Op::Return, 1);

        let text = disassemble_chunk(&chunk, &heap, "test");
        assert!(text.starts_with("== test ==\n"));
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("CONSTANT"));
        assert!(text.contains("RETURN"));
    }
}
