//! # Front-end data consumed by the backend
//!
//! The parser and the symbol-table builder live elsewhere; this module only
//! defines what they hand over: the syntax tree, literal constants and the
//! resolved scope tree.

pub mod ast;
pub mod constant;
pub mod symtable;
