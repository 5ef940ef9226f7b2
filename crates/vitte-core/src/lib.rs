//! vitte-core — compiler and virtual machine for the Vitte scripting
//! language: a single-pass bytecode compiler, a stack-based VM with
//! mark-sweep GC, and the tagged value/object model they share.
//!
//! This crate has no knowledge of stdin/stdout or process exit codes; see
//! `vitte-cli` for the REPL/file driver built on top of it. Everything a
//! host needs is reachable from [`vm::Vm`].

pub mod chunk;
pub mod compiler;
pub mod disasm;
pub mod error;
pub mod heap;
pub mod object;
pub mod ops;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{CompileError, Diagnostic, FrameTrace, RuntimeError, VitteError};
pub use heap::Heap;
pub use object::{FunctionKind, Object, ObjHandle};
pub use ops::Op;
pub use value::Value;
pub use vm::{BufferHost, Host, InterpretOutcome, StdHost, Vm, VmOptions};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interprets_a_trivial_program_end_to_end() {
        let mut vm = Vm::new(VmOptions::new());
        vm.set_host(Box::new(BufferHost::default()));
        let outcome = vm.interpret("print 1 + 2;");
        assert!(outcome.is_ok());
    }
}
