pub mod assemble;
pub mod code;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod stack_depth;
pub mod unit;

pub use code::{CodeFlags, CodeObject, LineTableEntry};
pub use compile::compile;
pub use compile_error::{CompileError, CompileResult, DecodeError};
pub use ir::{Block, BlockIdx, Instruction};
pub use op::Opcode;
pub use unit::{CompilationUnit, FBlock};
