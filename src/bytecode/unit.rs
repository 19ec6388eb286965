use indexmap::{IndexMap, IndexSet};
use tracing::trace;

use crate::{
    bytecode::{
        Block, BlockIdx, CodeFlags, CompileError, CompileResult, Instruction, Opcode,
    },
    lang::{
        ast::Stmt,
        constant::{Constant, ConstantKey},
        symtable::{ScopeKind, SymbolScope, SymbolTable},
    },
};

// =============================================================================
// FRAME BLOCKS - Statically nested regions that break/continue/return unwind
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FBlock {
    WhileLoop { start: BlockIdx, exit: BlockIdx },
    ForLoop { start: BlockIdx, exit: BlockIdx },
    TryExcept,
    /// Protected body of `try/finally`; unwinding inlines the final body.
    FinallyTry { finalbody: Vec<Stmt> },
    /// The exceptional copy of a final body.
    FinallyEnd,
    ExceptionHandler,
    /// Body of an `except` clause, optionally bound to a name.
    HandlerCleanup { name: Option<String> },
    /// A return value kept on the stack while a final body runs.
    PopValue,
}

impl FBlock {
    /// `(start, exit)` of a loop; `continue` jumps to start, `break` to exit.
    pub fn loop_targets(&self) -> Option<(BlockIdx, BlockIdx)> {
        match self {
            FBlock::WhileLoop { start, exit } | FBlock::ForLoop { start, exit } => {
                Some((*start, *exit))
            }
            _ => None,
        }
    }

    pub fn is_loop(&self) -> bool {
        self.loop_targets().is_some()
    }

    fn label(&self) -> &'static str {
        match self {
            FBlock::WhileLoop { .. } => "while loop",
            FBlock::ForLoop { .. } => "for loop",
            FBlock::TryExcept => "try/except",
            FBlock::FinallyTry { .. } => "try/finally",
            FBlock::FinallyEnd => "finally",
            FBlock::ExceptionHandler => "exception handler",
            FBlock::HandlerCleanup { .. } => "handler cleanup",
            FBlock::PopValue => "preserved value",
        }
    }
}

// =============================================================================
// COMPILATION UNIT - Mutable state of one scope being compiled
// =============================================================================

pub struct CompilationUnit {
    pub name: String,
    pub qualname: String,
    pub kind: ScopeKind,
    /// Identity of the resulting code object within this compile.
    pub serial: u32,
    pub firstlineno: u32,
    /// Enclosed (transitively) by a function-like scope.
    pub nested: bool,
    pub is_generator: bool,
    pub needs_class_cell: bool,
    pub has_varargs: bool,
    pub has_varkeywords: bool,

    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,

    symbols: IndexMap<String, SymbolScope>,
    children: std::vec::IntoIter<SymbolTable>,

    pub constants: IndexMap<ConstantKey, Constant>,
    pub names: IndexSet<String>,
    pub varnames: IndexSet<String>,
    pub cellvars: IndexSet<String>,
    pub freevars: IndexSet<String>,

    pub blocks: Vec<Block>,
    pub entry: BlockIdx,
    pub current: BlockIdx,
    pub lineno: u32,
    lineno_set: bool,

    pub fblocks: Vec<FBlock>,
}

impl CompilationUnit {
    pub fn new(
        name: impl Into<String>,
        qualname: impl Into<String>,
        table: SymbolTable,
        serial: u32,
        firstlineno: u32,
        nested: bool,
    ) -> Self {
        let varnames: IndexSet<String> = table.parameter_names().map(str::to_string).collect();

        let mut cellvars = IndexSet::new();
        if table.needs_class_cell {
            cellvars.insert("__class__".to_string());
        }
        cellvars.extend(table.cellvars());
        let freevars: IndexSet<String> = table.freevars().into_iter().collect();

        Self {
            name: name.into(),
            qualname: qualname.into(),
            kind: table.kind,
            serial,
            firstlineno,
            nested,
            is_generator: table.is_generator,
            needs_class_cell: table.needs_class_cell,
            has_varargs: table.vararg.is_some(),
            has_varkeywords: table.kwarg.is_some(),
            argcount: (table.posonly_params.len() + table.params.len()) as u32,
            posonlyargcount: table.posonly_params.len() as u32,
            kwonlyargcount: table.kwonly_params.len() as u32,
            symbols: table.symbols,
            children: table.children.into_iter(),
            constants: IndexMap::new(),
            names: IndexSet::new(),
            varnames,
            cellvars,
            freevars,
            blocks: vec![Block::default()],
            entry: BlockIdx(0),
            current: BlockIdx(0),
            lineno: firstlineno,
            lineno_set: false,
            fblocks: Vec::new(),
        }
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Index of `value` in the constant table, adding it on first sight.
    pub fn intern_constant(&mut self, value: Constant) -> u32 {
        let entry = self.constants.entry(value.key());
        let index = entry.index();
        entry.or_insert(value);
        index as u32
    }

    /// Index of `name` in the name table, adding it on first sight.
    pub fn intern_name(&mut self, name: &str) -> u32 {
        intern(&mut self.names, name)
    }

    /// Fast-local slot of `name`, appending it after the parameters.
    pub fn varname(&mut self, name: &str) -> u32 {
        intern(&mut self.varnames, name)
    }

    pub fn scope_of(&self, name: &str) -> Option<SymbolScope> {
        self.symbols.get(name).copied()
    }

    /// Slot for the DEREF family: cells first, then free variables.
    pub fn deref_index(&self, name: &str) -> CompileResult<u32> {
        if let Some(i) = self.cellvars.get_index_of(name) {
            return Ok(i as u32);
        }
        if let Some(i) = self.freevars.get_index_of(name) {
            return Ok((i + self.cellvars.len()) as u32);
        }
        Err(CompileError::internal(format!(
            "'{}' is neither a cell nor a free variable of '{}'",
            name, self.name
        )))
    }

    /// Symbol table of the next nested scope, in entry order.
    pub fn next_child(&mut self) -> CompileResult<SymbolTable> {
        self.children.next().ok_or_else(|| {
            CompileError::internal(format!(
                "symbol table of '{}' has no entry for a nested scope",
                self.name
            ))
        })
    }

    /// Discard the symbol tables of `count` nested scopes that won't be compiled.
    pub fn skip_children(&mut self, count: usize) -> CompileResult<()> {
        for _ in 0..count {
            self.next_child()?;
        }
        Ok(())
    }

    pub fn remaining_children(&self) -> usize {
        self.children.len()
    }

    pub fn flags(&self) -> CodeFlags {
        let mut flags = CodeFlags::empty();
        if self.kind.is_function_like() {
            flags |= CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS;
            if self.nested {
                flags |= CodeFlags::NESTED;
            }
            if self.is_generator {
                flags |= CodeFlags::GENERATOR;
            }
            if self.has_varargs {
                flags |= CodeFlags::VARARGS;
            }
            if self.has_varkeywords {
                flags |= CodeFlags::VARKEYWORDS;
            }
        }
        if self.cellvars.is_empty() && self.freevars.is_empty() {
            flags |= CodeFlags::NOFREE;
        }
        flags
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    pub fn new_block(&mut self) -> BlockIdx {
        let idx = BlockIdx(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        idx
    }

    pub fn use_block(&mut self, block: BlockIdx) {
        self.current = block;
    }

    /// Link the current block's fall-through to `block` (or a fresh one) and
    /// continue emitting there.
    pub fn use_next_block(&mut self, block: Option<BlockIdx>) -> BlockIdx {
        let block = block.unwrap_or_else(|| self.new_block());
        self.blocks[self.current.index()].next = Some(block);
        self.current = block;
        block
    }

    pub fn current_block(&self) -> &Block {
        &self.blocks[self.current.index()]
    }

    pub fn block(&self, idx: BlockIdx) -> &Block {
        &self.blocks[idx.index()]
    }

    // =========================================================================
    // Emission
    // =========================================================================

    pub fn set_lineno(&mut self, lineno: u32) {
        if lineno != self.lineno {
            self.lineno = lineno;
            self.lineno_set = false;
        }
    }

    /// Stamp the next instruction even if the line is unchanged.
    pub fn reset_lineno(&mut self) {
        self.lineno_set = false;
    }

    pub fn emit(&mut self, opcode: Opcode, arg: u32) -> CompileResult<()> {
        let instr = Instruction::new(opcode, arg)?;
        self.push(instr);
        Ok(())
    }

    pub fn emit_jump(&mut self, opcode: Opcode, target: BlockIdx) -> CompileResult<()> {
        let instr = Instruction::jump(opcode, target)?;
        self.push(instr);
        Ok(())
    }

    fn push(&mut self, mut instr: Instruction) {
        let block = &mut self.blocks[self.current.index()];
        if block.terminal {
            trace!(scope = %self.name, opcode = %instr.opcode, "dropping unreachable instruction");
            return;
        }
        // Only an appended instruction takes the line stamp.
        if !self.lineno_set {
            instr.lineno = self.lineno;
            self.lineno_set = true;
        }
        block.push(instr);
    }

    pub fn load_const(&mut self, value: Constant) -> CompileResult<()> {
        let index = self.intern_constant(value);
        self.emit(Opcode::LOAD_CONST, index)
    }

    // =========================================================================
    // Frame blocks
    // =========================================================================

    pub fn push_fblock(&mut self, fblock: FBlock) {
        self.fblocks.push(fblock);
    }

    /// Pop the innermost frame block, which must be of the same kind as `expected`.
    pub fn pop_fblock(&mut self, expected: &FBlock) -> CompileResult<FBlock> {
        match self.fblocks.pop() {
            Some(top) if std::mem::discriminant(&top) == std::mem::discriminant(expected) => {
                Ok(top)
            }
            Some(top) => Err(CompileError::internal(format!(
                "frame block mismatch: expected {}, found {}",
                expected.label(),
                top.label()
            ))),
            None => Err(CompileError::internal(format!(
                "frame block stack empty while closing {}",
                expected.label()
            ))),
        }
    }
}

fn intern(set: &mut IndexSet<String>, name: &str) -> u32 {
    match set.get_index_of(name) {
        Some(i) => i as u32,
        None => set.insert_full(name.to_string()).0 as u32,
    }
}
