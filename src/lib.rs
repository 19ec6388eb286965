//! Bytecode compiler backend: lowers a syntax tree plus its resolved symbol
//! table into CPython 3.9 compatible code objects.

pub mod bytecode;
pub mod lang;
pub mod options;

pub use bytecode::{CodeObject, CompileError, CompileResult, compile};
pub use options::CompileOptions;
