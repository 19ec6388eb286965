use tracing::{debug, trace};

use crate::{
    bytecode::{
        BlockIdx, CodeObject, CompilationUnit, CompileError, CompileResult, FBlock, Opcode,
        assemble::assemble, op::make_function,
    },
    lang::{
        ast::{
            self, Alias, Arg, Arguments, BoolOp, CmpOp, Comprehension, ExceptHandler, Expr,
            ExprContext, ExprKind, Keyword, Mod, Operator, Stmt, StmtKind, UnaryOp,
        },
        constant::Constant,
        symtable::{ScopeKind, SymbolScope, SymbolTable},
    },
    options::CompileOptions,
};

/// Largest number of entries a single `BUILD_MAP`/`BUILD_CONST_KEY_MAP` builds.
const MAX_MAP_CHUNK: usize = 0xFFFF;

/// Compile a module or expression, with its resolved symbol table, into the
/// top-level code object. Nested scopes end up as code constants.
pub fn compile(module: &Mod, symbols: SymbolTable, options: CompileOptions) -> CompileResult<CodeObject> {
    match module {
        Mod::Module { body } => {
            let mut compiler = Compiler::new(symbols, options)?;
            compiler.compile_body(body)?;
            compiler.finish(true)
        }
        Mod::Expression { body } => {
            let mut compiler = Compiler::new(symbols, options)?;
            compiler.compile_expr(body)?;
            compiler.finish(false)
        }
        Mod::Interactive { .. } => Err(CompileError::unsupported_mode(module.kind_name())),
    }
}

struct Compiler {
    /// Scope currently being compiled.
    unit: CompilationUnit,

    /// Enclosing scopes, outermost first.
    parents: Vec<CompilationUnit>,

    /// Serial handed to the next scope entered.
    next_serial: u32,

    options: CompileOptions,
}

impl Compiler {
    fn new(symbols: SymbolTable, options: CompileOptions) -> CompileResult<Self> {
        if symbols.kind != ScopeKind::Module {
            return Err(CompileError::internal(format!(
                "top-level symbol table '{}' is a {:?} scope, expected a module",
                symbols.name, symbols.kind
            )));
        }
        debug!(filename = %options.filename, optimize = options.optimize, "compiling module");
        Ok(Self {
            unit: CompilationUnit::new("<module>", "<module>", symbols, 0, 1, false),
            parents: Vec::new(),
            next_serial: 1,
            options,
        })
    }

    fn finish(self, add_none: bool) -> CompileResult<CodeObject> {
        if !self.parents.is_empty() {
            return Err(CompileError::internal(format!(
                "{} scope(s) still open at end of compile",
                self.parents.len()
            )));
        }
        finish_unit(self.unit, add_none, &self.options.filename)
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    fn enter_scope(&mut self, name: &str, kind: ScopeKind, firstlineno: u32) -> CompileResult<()> {
        let table = self.unit.next_child()?;
        if table.kind != kind {
            return Err(CompileError::internal(format!(
                "expected a {:?} symbol table for '{}', found {:?} '{}'",
                kind, name, table.kind, table.name
            )));
        }

        let qualname = self.qualname_for(name, kind);
        let nested = self.unit.nested || self.unit.kind.is_function_like();
        let serial = self.next_serial;
        self.next_serial += 1;

        debug!(scope = %qualname, ?kind, serial, "entering scope");
        let child = CompilationUnit::new(name, qualname, table, serial, firstlineno, nested);
        let parent = std::mem::replace(&mut self.unit, child);
        self.parents.push(parent);
        Ok(())
    }

    fn exit_scope(&mut self, add_none: bool) -> CompileResult<CodeObject> {
        let parent = self
            .parents
            .pop()
            .ok_or_else(|| CompileError::internal("exit from the top-level scope"))?;
        let child = std::mem::replace(&mut self.unit, parent);
        finish_unit(child, add_none, &self.options.filename)
    }

    /// Dotted path of a scope about to be entered from the current one.
    fn qualname_for(&self, name: &str, kind: ScopeKind) -> String {
        let parent = &self.unit;
        if parent.kind == ScopeKind::Module {
            return name.to_string();
        }
        let declared_global = matches!(kind, ScopeKind::Function | ScopeKind::Class)
            && parent.scope_of(name) == Some(SymbolScope::GlobalExplicit);
        if declared_global {
            name.to_string()
        } else if matches!(parent.kind, ScopeKind::Function | ScopeKind::Lambda) {
            format!("{}.<locals>.{}", parent.qualname, name)
        } else {
            format!("{}.{}", parent.qualname, name)
        }
    }

    /// Push a function object for `code`, capturing its free variables.
    fn make_closure(&mut self, code: CodeObject, mut flags: u32, qualname: String) -> CompileResult<()> {
        if !code.freevars.is_empty() {
            for name in &code.freevars {
                let slot = self.closure_slot(name, &code.name)?;
                self.emit_arg(Opcode::LOAD_CLOSURE, slot)?;
            }
            self.emit_arg(Opcode::BUILD_TUPLE, code.freevars.len() as u32)?;
            flags |= make_function::CLOSURE;
        }
        self.load_const(Constant::Code(Box::new(code)))?;
        self.load_const(Constant::Str(qualname))?;
        self.emit_arg(Opcode::MAKE_FUNCTION, flags)
    }

    /// Deref slot in the current scope that backs a child's free variable.
    fn closure_slot(&self, name: &str, child: &str) -> CompileResult<u32> {
        let unit = &self.unit;
        let is_cell = unit.scope_of(name) == Some(SymbolScope::Cell)
            || (unit.kind == ScopeKind::Class && name == "__class__");
        let slot = if is_cell {
            unit.cellvars.get_index_of(name)
        } else {
            unit.freevars
                .get_index_of(name)
                .map(|i| i + unit.cellvars.len())
        };
        slot.map(|s| s as u32).ok_or_else(|| {
            CompileError::internal(format!(
                "free variable '{}' of '{}' has no binding in '{}'",
                name, child, unit.name
            ))
        })
    }

    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn emit(&mut self, opcode: Opcode) -> CompileResult<()> {
        self.unit.emit(opcode, 0)
    }

    fn emit_arg(&mut self, opcode: Opcode, arg: u32) -> CompileResult<()> {
        self.unit.emit(opcode, arg)
    }

    fn emit_jump(&mut self, opcode: Opcode, target: BlockIdx) -> CompileResult<()> {
        self.unit.emit_jump(opcode, target)
    }

    fn emit_name(&mut self, opcode: Opcode, name: &str) -> CompileResult<()> {
        let index = self.unit.intern_name(name);
        self.unit.emit(opcode, index)
    }

    fn load_const(&mut self, value: Constant) -> CompileResult<()> {
        self.unit.load_const(value)
    }

    fn new_block(&mut self) -> BlockIdx {
        self.unit.new_block()
    }

    fn use_next_block(&mut self, block: BlockIdx) {
        self.unit.use_next_block(Some(block));
    }

    /// Start a fresh block linked after the current one.
    fn next_block(&mut self) {
        self.unit.use_next_block(None);
    }

    // =========================================================================
    // Names
    // =========================================================================

    fn compile_name(&mut self, name: &str, ctx: ExprContext) -> CompileResult<()> {
        let scope = self.unit.scope_of(name);
        let function_like = self.unit.kind.is_function_like();

        match scope {
            Some(SymbolScope::Free | SymbolScope::Cell) => {
                let opcode = match ctx {
                    ExprContext::Load if self.unit.kind == ScopeKind::Class => {
                        Opcode::LOAD_CLASSDEREF
                    }
                    ExprContext::Load => Opcode::LOAD_DEREF,
                    ExprContext::Store => Opcode::STORE_DEREF,
                    ExprContext::Del => Opcode::DELETE_DEREF,
                };
                let slot = self.unit.deref_index(name)?;
                self.emit_arg(opcode, slot)
            }
            Some(SymbolScope::Local) if function_like => {
                let opcode = match ctx {
                    ExprContext::Load => Opcode::LOAD_FAST,
                    ExprContext::Store => Opcode::STORE_FAST,
                    ExprContext::Del => Opcode::DELETE_FAST,
                };
                let slot = self.unit.varname(name);
                self.emit_arg(opcode, slot)
            }
            Some(SymbolScope::GlobalExplicit) | Some(SymbolScope::GlobalImplicit)
                if function_like || scope == Some(SymbolScope::GlobalExplicit) =>
            {
                let opcode = match ctx {
                    ExprContext::Load => Opcode::LOAD_GLOBAL,
                    ExprContext::Store => Opcode::STORE_GLOBAL,
                    ExprContext::Del => Opcode::DELETE_GLOBAL,
                };
                self.emit_name(opcode, name)
            }
            _ => {
                let opcode = match ctx {
                    ExprContext::Load => Opcode::LOAD_NAME,
                    ExprContext::Store => Opcode::STORE_NAME,
                    ExprContext::Del => Opcode::DELETE_NAME,
                };
                self.emit_name(opcode, name)
            }
        }
    }

    /// Store `None` into a bound exception name, then unbind it.
    fn clear_handler_name(&mut self, name: &str) -> CompileResult<()> {
        self.load_const(Constant::None)?;
        self.compile_name(name, ExprContext::Store)?;
        self.compile_name(name, ExprContext::Del)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Body of a module or class: a docstring binds `__doc__`.
    fn compile_body(&mut self, body: &[Stmt]) -> CompileResult<()> {
        if self.unit.kind == ScopeKind::Module {
            if let Some(first) = body.first() {
                self.unit.set_lineno(first.lineno);
            }
        }

        let docstring = if self.options.strips_docstrings() {
            None
        } else {
            ast::docstring(body)
        };
        match docstring {
            Some(doc) => {
                self.unit.set_lineno(body[0].lineno);
                self.load_const(Constant::str(doc))?;
                self.compile_name("__doc__", ExprContext::Store)?;
                self.compile_statements(&body[1..])
            }
            None => self.compile_statements(body),
        }
    }

    fn compile_statements(&mut self, body: &[Stmt]) -> CompileResult<()> {
        for stmt in body {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    fn compile_statement(&mut self, stmt: &Stmt) -> CompileResult<()> {
        self.unit.set_lineno(stmt.lineno);
        self.compile_statement_kind(stmt)
            .map_err(|e| e.with_context(&self.unit.qualname, stmt.lineno))
    }

    fn compile_statement_kind(&mut self, stmt: &Stmt) -> CompileResult<()> {
        let lineno = stmt.lineno;
        match &stmt.kind {
            StmtKind::FunctionDef {
                name,
                args,
                body,
                decorator_list,
                returns,
            } => self.compile_function_def(name, args, body, decorator_list, returns.as_deref(), lineno),

            StmtKind::ClassDef {
                name,
                bases,
                keywords,
                body,
                decorator_list,
            } => self.compile_class_def(name, bases, keywords, body, decorator_list, lineno),

            StmtKind::Return(value) => self.compile_return(value.as_ref(), lineno),

            StmtKind::Delete(targets) => {
                for target in targets {
                    self.compile_expr(target)?;
                }
                Ok(())
            }

            StmtKind::Assign { targets, value } => {
                self.compile_expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.emit(Opcode::DUP_TOP)?;
                    }
                    self.compile_expr(target)?;
                }
                Ok(())
            }

            StmtKind::AugAssign { target, op, value } => self.compile_aug_assign(target, *op, value),

            StmtKind::Raise { exc, cause } => {
                let mut count = 0;
                if let Some(exc) = exc {
                    self.compile_expr(exc)?;
                    count += 1;
                    if let Some(cause) = cause {
                        self.compile_expr(cause)?;
                        count += 1;
                    }
                }
                self.emit_arg(Opcode::RAISE_VARARGS, count)
            }

            StmtKind::Assert { test, msg } => self.compile_assert(test, msg.as_ref()),

            StmtKind::Import(names) => self.compile_import(names),

            StmtKind::ImportFrom { module, names, level } => {
                self.compile_import_from(module.as_deref(), names, *level)
            }

            StmtKind::Global(_) | StmtKind::Nonlocal(_) | StmtKind::Pass => Ok(()),

            StmtKind::Expr(value) => {
                if value.is_constant() {
                    self.emit(Opcode::NOP)
                } else {
                    self.compile_expr(value)?;
                    self.emit(Opcode::POP_TOP)
                }
            }

            StmtKind::Break => self.compile_break(lineno),

            StmtKind::Continue => self.compile_continue(lineno),

            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => self.compile_for(target, iter, body, orelse),

            StmtKind::While { test, body, orelse } => self.compile_while(test, body, orelse),

            StmtKind::If { test, body, orelse } => self.compile_if(test, body, orelse),

            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                if finalbody.is_empty() {
                    self.compile_try_except(body, handlers, orelse)
                } else {
                    self.compile_try_finally(body, handlers, orelse, finalbody)
                }
            }
        }
    }

    fn compile_aug_assign(&mut self, target: &Expr, op: Operator, value: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Attribute { value: object, attr, .. } => {
                self.compile_expr(object)?;
                self.emit(Opcode::DUP_TOP)?;
                self.emit_name(Opcode::LOAD_ATTR, attr)?;
                self.compile_expr(value)?;
                self.emit(inplace_opcode(op))?;
                self.emit(Opcode::ROT_TWO)?;
                self.emit_name(Opcode::STORE_ATTR, attr)
            }
            ExprKind::Subscript { value: object, slice, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(slice)?;
                self.emit(Opcode::DUP_TOP_TWO)?;
                self.emit(Opcode::BINARY_SUBSCR)?;
                self.compile_expr(value)?;
                self.emit(inplace_opcode(op))?;
                self.emit(Opcode::ROT_THREE)?;
                self.emit(Opcode::STORE_SUBSCR)
            }
            ExprKind::Name { id, .. } => {
                self.compile_name(id, ExprContext::Load)?;
                self.compile_expr(value)?;
                self.emit(inplace_opcode(op))?;
                self.compile_name(id, ExprContext::Store)
            }
            _ => Err(CompileError::internal(
                "augmented assignment to something other than a name, attribute or subscript",
            )),
        }
    }

    fn compile_assert(&mut self, test: &Expr, msg: Option<&Expr>) -> CompileResult<()> {
        if self.options.strips_asserts() {
            let skipped = nested_scopes(test) + msg.map_or(0, nested_scopes);
            trace!(skipped, "dropping assert");
            return self.unit.skip_children(skipped);
        }

        let end = self.new_block();
        self.compile_jump_if(test, end, true)?;
        self.emit(Opcode::LOAD_ASSERTION_ERROR)?;
        if let Some(msg) = msg {
            self.compile_expr(msg)?;
            self.emit_arg(Opcode::CALL_FUNCTION, 1)?;
        }
        self.emit_arg(Opcode::RAISE_VARARGS, 1)?;
        self.use_next_block(end);
        Ok(())
    }

    fn compile_import(&mut self, names: &[Alias]) -> CompileResult<()> {
        for alias in names {
            self.load_const(Constant::Int(0))?;
            self.load_const(Constant::None)?;
            self.emit_name(Opcode::IMPORT_NAME, &alias.name)?;

            match &alias.asname {
                Some(asname) => self.compile_import_as(&alias.name, asname)?,
                None => {
                    let top = alias
                        .name
                        .split_once('.')
                        .map_or(alias.name.as_str(), |(head, _)| head);
                    self.compile_name(top, ExprContext::Store)?;
                }
            }
        }
        Ok(())
    }

    /// `import a.b.c as d` binds `d` to the innermost submodule.
    fn compile_import_as(&mut self, name: &str, asname: &str) -> CompileResult<()> {
        let attrs: Vec<&str> = name.split('.').skip(1).collect();
        if attrs.is_empty() {
            return self.compile_name(asname, ExprContext::Store);
        }
        for (i, attr) in attrs.iter().enumerate() {
            self.emit_name(Opcode::IMPORT_FROM, attr)?;
            if i + 1 < attrs.len() {
                self.emit(Opcode::ROT_TWO)?;
                self.emit(Opcode::POP_TOP)?;
            }
        }
        self.compile_name(asname, ExprContext::Store)?;
        self.emit(Opcode::POP_TOP)
    }

    fn compile_import_from(&mut self, module: Option<&str>, names: &[Alias], level: u32) -> CompileResult<()> {
        let fromlist = names.iter().map(|a| Constant::str(&a.name)).collect();
        self.load_const(Constant::Int(i64::from(level)))?;
        self.load_const(Constant::Tuple(fromlist))?;
        self.emit_name(Opcode::IMPORT_NAME, module.unwrap_or(""))?;

        for (i, alias) in names.iter().enumerate() {
            if i == 0 && alias.name == "*" {
                return self.emit(Opcode::IMPORT_STAR);
            }
            self.emit_name(Opcode::IMPORT_FROM, &alias.name)?;
            let bound = alias.asname.as_deref().unwrap_or(&alias.name);
            self.compile_name(bound, ExprContext::Store)?;
        }
        self.emit(Opcode::POP_TOP)
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn compile_if(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CompileResult<()> {
        let end = self.new_block();
        let next = if orelse.is_empty() { end } else { self.new_block() };

        self.compile_jump_if(test, next, false)?;
        self.compile_statements(body)?;
        if !orelse.is_empty() {
            self.emit_jump(Opcode::JUMP_FORWARD, end)?;
            self.use_next_block(next);
            self.compile_statements(orelse)?;
        }
        self.use_next_block(end);
        Ok(())
    }

    fn compile_while(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CompileResult<()> {
        let start = self.new_block();
        let end = self.new_block();
        let anchor = self.new_block();
        let fblock = FBlock::WhileLoop { start, exit: end };

        self.use_next_block(start);
        self.unit.push_fblock(fblock.clone());
        self.compile_jump_if(test, anchor, false)?;
        self.compile_statements(body)?;
        self.emit_jump(Opcode::JUMP_ABSOLUTE, start)?;

        self.use_next_block(anchor);
        self.unit.pop_fblock(&fblock)?;
        self.compile_statements(orelse)?;
        self.use_next_block(end);
        Ok(())
    }

    fn compile_for(&mut self, target: &Expr, iter: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CompileResult<()> {
        let start = self.new_block();
        let cleanup = self.new_block();
        let end = self.new_block();
        let fblock = FBlock::ForLoop { start, exit: end };

        self.unit.push_fblock(fblock.clone());
        self.compile_expr(iter)?;
        self.emit(Opcode::GET_ITER)?;
        self.use_next_block(start);
        self.emit_jump(Opcode::FOR_ITER, cleanup)?;
        self.compile_expr(target)?;
        self.compile_statements(body)?;
        self.emit_jump(Opcode::JUMP_ABSOLUTE, start)?;

        self.use_next_block(cleanup);
        self.unit.pop_fblock(&fblock)?;
        self.compile_statements(orelse)?;
        self.use_next_block(end);
        Ok(())
    }

    fn compile_break(&mut self, lineno: u32) -> CompileResult<()> {
        let Some(loop_block) = self.unwind_fblock_stack(false, true)? else {
            return Err(CompileError::break_outside_loop(lineno));
        };
        self.unwind_fblock(&loop_block, false)?;
        let (_, exit) = loop_targets(&loop_block)?;
        self.emit_jump(Opcode::JUMP_ABSOLUTE, exit)
    }

    fn compile_continue(&mut self, lineno: u32) -> CompileResult<()> {
        let Some(loop_block) = self.unwind_fblock_stack(false, true)? else {
            return Err(CompileError::continue_outside_loop(lineno));
        };
        let (start, _) = loop_targets(&loop_block)?;
        self.emit_jump(Opcode::JUMP_ABSOLUTE, start)
    }

    fn compile_return(&mut self, value: Option<&Expr>, lineno: u32) -> CompileResult<()> {
        if !self.unit.kind.is_function_like() {
            return Err(CompileError::return_outside_function(lineno));
        }

        // A computed value must survive any final bodies run on the way out.
        let preserved = value.filter(|v| !v.is_constant());
        if let Some(value) = preserved {
            self.compile_expr(value)?;
        }
        self.unwind_fblock_stack(preserved.is_some(), false)?;

        match (value, preserved) {
            (None, _) => self.load_const(Constant::None)?,
            (Some(value), None) => self.compile_expr(value)?,
            (Some(_), Some(_)) => {}
        }
        self.emit(Opcode::RETURN_VALUE)
    }

    /// Emit the exit code for every frame block, innermost first, stopping at
    /// the innermost loop when `stop_at_loop` is set. Returns that loop.
    fn unwind_fblock_stack(&mut self, preserve_tos: bool, stop_at_loop: bool) -> CompileResult<Option<FBlock>> {
        let Some(top) = self.unit.fblocks.pop() else {
            return Ok(None);
        };
        if stop_at_loop && top.is_loop() {
            let found = top.clone();
            self.unit.push_fblock(top);
            return Ok(Some(found));
        }

        self.unwind_fblock(&top, preserve_tos)?;
        let found = self.unwind_fblock_stack(preserve_tos, stop_at_loop)?;
        self.unit.push_fblock(top);
        Ok(found)
    }

    fn unwind_fblock(&mut self, fblock: &FBlock, preserve_tos: bool) -> CompileResult<()> {
        match fblock {
            FBlock::WhileLoop { .. } | FBlock::ExceptionHandler => Ok(()),

            FBlock::ForLoop { .. } | FBlock::PopValue => {
                if preserve_tos {
                    self.emit(Opcode::ROT_TWO)?;
                }
                self.emit(Opcode::POP_TOP)
            }

            FBlock::TryExcept => self.emit(Opcode::POP_BLOCK),

            FBlock::FinallyTry { finalbody } => {
                self.emit(Opcode::POP_BLOCK)?;
                if preserve_tos {
                    self.unit.push_fblock(FBlock::PopValue);
                }
                let saved = self.unit.lineno;
                self.compile_statements(finalbody)?;
                self.unit.set_lineno(saved);
                if preserve_tos {
                    self.unit.pop_fblock(&FBlock::PopValue)?;
                }
                Ok(())
            }

            FBlock::FinallyEnd => {
                if preserve_tos {
                    self.emit(Opcode::ROT_FOUR)?;
                }
                for _ in 0..3 {
                    self.emit(Opcode::POP_TOP)?;
                }
                if preserve_tos {
                    self.emit(Opcode::ROT_FOUR)?;
                }
                self.emit(Opcode::POP_EXCEPT)
            }

            FBlock::HandlerCleanup { name } => {
                if name.is_some() {
                    self.emit(Opcode::POP_BLOCK)?;
                }
                if preserve_tos {
                    self.emit(Opcode::ROT_FOUR)?;
                }
                self.emit(Opcode::POP_EXCEPT)?;
                match name {
                    Some(name) => self.clear_handler_name(name),
                    None => Ok(()),
                }
            }
        }
    }

    fn compile_try_finally(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> CompileResult<()> {
        let body_block = self.new_block();
        let end = self.new_block();
        let exit = self.new_block();
        let protected = FBlock::FinallyTry {
            finalbody: finalbody.to_vec(),
        };

        // try body, possibly with its own except clauses
        self.emit_jump(Opcode::SETUP_FINALLY, end)?;
        self.use_next_block(body_block);
        self.unit.push_fblock(protected.clone());
        if handlers.is_empty() {
            self.compile_statements(body)?;
        } else {
            self.compile_try_except(body, handlers, orelse)?;
        }
        self.emit(Opcode::POP_BLOCK)?;
        self.unit.pop_fblock(&protected)?;

        // normal exit
        self.compile_statements(finalbody)?;
        self.emit_jump(Opcode::JUMP_FORWARD, exit)?;

        // exceptional exit
        self.use_next_block(end);
        self.unit.push_fblock(FBlock::FinallyEnd);
        self.compile_statements(finalbody)?;
        self.unit.pop_fblock(&FBlock::FinallyEnd)?;
        self.emit(Opcode::RERAISE)?;

        self.use_next_block(exit);
        Ok(())
    }

    fn compile_try_except(&mut self, body: &[Stmt], handlers: &[ExceptHandler], orelse: &[Stmt]) -> CompileResult<()> {
        let body_block = self.new_block();
        let mut except = self.new_block();
        let orelse_block = self.new_block();
        let end = self.new_block();

        self.emit_jump(Opcode::SETUP_FINALLY, except)?;
        self.use_next_block(body_block);
        self.unit.push_fblock(FBlock::TryExcept);
        self.compile_statements(body)?;
        self.emit(Opcode::POP_BLOCK)?;
        self.unit.pop_fblock(&FBlock::TryExcept)?;
        self.emit_jump(Opcode::JUMP_FORWARD, orelse_block)?;

        self.use_next_block(except);
        self.unit.push_fblock(FBlock::ExceptionHandler);

        for (i, handler) in handlers.iter().enumerate() {
            if handler.typ.is_none() && i + 1 < handlers.len() {
                return Err(CompileError::default_except_not_last(handler.lineno));
            }
            self.unit.set_lineno(handler.lineno);

            except = self.new_block();
            if let Some(typ) = &handler.typ {
                self.emit(Opcode::DUP_TOP)?;
                self.compile_expr(typ)?;
                self.emit_jump(Opcode::JUMP_IF_NOT_EXC_MATCH, except)?;
            }
            self.emit(Opcode::POP_TOP)?;

            match &handler.name {
                Some(name) => self.compile_named_handler(name, &handler.body, end)?,
                None => {
                    let cleanup_body = self.new_block();
                    let cleanup = FBlock::HandlerCleanup { name: None };

                    self.emit(Opcode::POP_TOP)?;
                    self.emit(Opcode::POP_TOP)?;
                    self.use_next_block(cleanup_body);
                    self.unit.push_fblock(cleanup.clone());
                    self.compile_statements(&handler.body)?;
                    self.unit.pop_fblock(&cleanup)?;
                    self.emit(Opcode::POP_EXCEPT)?;
                    self.emit_jump(Opcode::JUMP_FORWARD, end)?;
                }
            }
            self.use_next_block(except);
        }

        self.unit.pop_fblock(&FBlock::ExceptionHandler)?;
        self.emit(Opcode::RERAISE)?;
        self.use_next_block(orelse_block);
        self.compile_statements(orelse)?;
        self.use_next_block(end);
        Ok(())
    }

    /// `except E as name:` unbinds `name` on every way out of the handler.
    fn compile_named_handler(&mut self, name: &str, body: &[Stmt], end: BlockIdx) -> CompileResult<()> {
        let cleanup_end = self.new_block();
        let cleanup_body = self.new_block();
        let cleanup = FBlock::HandlerCleanup {
            name: Some(name.to_string()),
        };

        self.compile_name(name, ExprContext::Store)?;
        self.emit(Opcode::POP_TOP)?;
        self.emit_jump(Opcode::SETUP_FINALLY, cleanup_end)?;

        self.use_next_block(cleanup_body);
        self.unit.push_fblock(cleanup.clone());
        self.compile_statements(body)?;
        self.unit.pop_fblock(&cleanup)?;
        self.emit(Opcode::POP_BLOCK)?;
        self.emit(Opcode::POP_EXCEPT)?;
        self.clear_handler_name(name)?;
        self.emit_jump(Opcode::JUMP_FORWARD, end)?;

        self.use_next_block(cleanup_end);
        self.clear_handler_name(name)?;
        self.emit(Opcode::RERAISE)
    }

    /// Jump to `next` when `expr` evaluates to `cond`, else fall through.
    fn compile_jump_if(&mut self, expr: &Expr, next: BlockIdx, cond: bool) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::UnaryOp {
                op: UnaryOp::Not,
                operand,
            } => return self.compile_jump_if(operand, next, !cond),

            ExprKind::BoolOp { op, values } => {
                let (last, init) = split_last(values, "boolean operation")?;
                let cond2 = *op == BoolOp::Or;
                let next2 = if cond2 != cond { self.new_block() } else { next };
                for value in init {
                    self.compile_jump_if(value, next2, cond2)?;
                }
                self.compile_jump_if(last, next, cond)?;
                if next2 != next {
                    self.use_next_block(next2);
                }
                return Ok(());
            }

            ExprKind::IfExp { test, body, orelse } => {
                let end = self.new_block();
                let next2 = self.new_block();
                self.compile_jump_if(test, next2, false)?;
                self.compile_jump_if(body, next, cond)?;
                self.emit_jump(Opcode::JUMP_FORWARD, end)?;
                self.use_next_block(next2);
                self.compile_jump_if(orelse, next, cond)?;
                self.use_next_block(end);
                return Ok(());
            }

            ExprKind::Compare {
                left,
                ops,
                comparators,
            } if ops.len() > 1 => {
                let (last_op, init_ops) = split_last(ops, "comparison")?;
                let (last_cmp, init_cmps) = split_last(comparators, "comparison")?;
                let cleanup = self.new_block();

                self.compile_expr(left)?;
                for (op, comparator) in init_ops.iter().zip(init_cmps) {
                    self.compile_expr(comparator)?;
                    self.emit(Opcode::DUP_TOP)?;
                    self.emit(Opcode::ROT_THREE)?;
                    self.emit_compare(*op)?;
                    self.emit_jump(Opcode::POP_JUMP_IF_FALSE, cleanup)?;
                    self.next_block();
                }
                self.compile_expr(last_cmp)?;
                self.emit_compare(*last_op)?;
                self.emit_jump(pop_jump_if(cond), next)?;
                self.next_block();

                let end = self.new_block();
                self.emit_jump(Opcode::JUMP_FORWARD, end)?;
                self.use_next_block(cleanup);
                self.emit(Opcode::POP_TOP)?;
                if !cond {
                    self.emit_jump(Opcode::JUMP_FORWARD, next)?;
                }
                self.use_next_block(end);
                return Ok(());
            }

            _ => {}
        }

        self.compile_expr(expr)?;
        self.emit_jump(pop_jump_if(cond), next)?;
        self.next_block();
        Ok(())
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    fn compile_decorators(&mut self, decorators: &[Expr]) -> CompileResult<()> {
        for decorator in decorators {
            self.compile_expr(decorator)?;
        }
        Ok(())
    }

    fn apply_decorators(&mut self, decorators: &[Expr]) -> CompileResult<()> {
        for _ in decorators {
            self.emit_arg(Opcode::CALL_FUNCTION, 1)?;
        }
        Ok(())
    }

    /// Push positional and keyword-only defaults; returns the `MAKE_FUNCTION` flags.
    fn compile_default_arguments(&mut self, args: &Arguments) -> CompileResult<u32> {
        let mut flags = 0;

        if !args.defaults.is_empty() {
            for default in &args.defaults {
                self.compile_expr(default)?;
            }
            self.emit_arg(Opcode::BUILD_TUPLE, args.defaults.len() as u32)?;
            flags |= make_function::DEFAULTS;
        }

        let mut keys = Vec::new();
        for (arg, default) in args.kwonlyargs.iter().zip(&args.kw_defaults) {
            if let Some(default) = default {
                keys.push(Constant::str(&arg.arg));
                self.compile_expr(default)?;
            }
        }
        if !keys.is_empty() {
            let count = keys.len() as u32;
            self.load_const(Constant::Tuple(keys))?;
            self.emit_arg(Opcode::BUILD_CONST_KEY_MAP, count)?;
            flags |= make_function::KW_DEFAULTS;
        }

        Ok(flags)
    }

    /// Push the annotation dict, if any annotation is present.
    fn compile_annotations(&mut self, args: &Arguments, returns: Option<&Expr>) -> CompileResult<bool> {
        let params: Vec<&Arg> = args
            .args
            .iter()
            .chain(&args.posonlyargs)
            .chain(&args.vararg)
            .chain(&args.kwonlyargs)
            .chain(&args.kwarg)
            .collect();

        let mut keys = Vec::new();
        for param in params {
            if let Some(annotation) = &param.annotation {
                self.compile_expr(annotation)?;
                keys.push(Constant::str(&param.arg));
            }
        }
        if let Some(returns) = returns {
            self.compile_expr(returns)?;
            keys.push(Constant::str("return"));
        }

        if keys.is_empty() {
            return Ok(false);
        }
        let count = keys.len() as u32;
        self.load_const(Constant::Tuple(keys))?;
        self.emit_arg(Opcode::BUILD_CONST_KEY_MAP, count)?;
        Ok(true)
    }

    fn compile_function_def(
        &mut self,
        name: &str,
        args: &Arguments,
        body: &[Stmt],
        decorators: &[Expr],
        returns: Option<&Expr>,
        lineno: u32,
    ) -> CompileResult<()> {
        self.compile_decorators(decorators)?;
        let firstlineno = decorators.first().map_or(lineno, |d| d.lineno);

        let mut flags = self.compile_default_arguments(args)?;
        if self.compile_annotations(args, returns)? {
            flags |= make_function::ANNOTATIONS;
        }

        self.enter_scope(name, ScopeKind::Function, firstlineno)?;
        let docstring = if self.options.strips_docstrings() {
            None
        } else {
            ast::docstring(body)
        };
        // The first constant of a function is always its docstring.
        self.unit
            .intern_constant(docstring.map_or(Constant::None, Constant::str));
        let body = if docstring.is_some() { &body[1..] } else { body };
        self.compile_statements(body)?;
        let code = self.exit_scope(true)?;

        let qualname = code.qualname.clone();
        self.make_closure(code, flags, qualname)?;
        self.apply_decorators(decorators)?;
        self.compile_name(name, ExprContext::Store)
    }

    fn compile_class_def(
        &mut self,
        name: &str,
        bases: &[Expr],
        keywords: &[Keyword],
        body: &[Stmt],
        decorators: &[Expr],
        lineno: u32,
    ) -> CompileResult<()> {
        self.compile_decorators(decorators)?;
        let firstlineno = decorators.first().map_or(lineno, |d| d.lineno);

        self.enter_scope(name, ScopeKind::Class, firstlineno)?;
        self.compile_name("__name__", ExprContext::Load)?;
        self.compile_name("__module__", ExprContext::Store)?;
        let qualname = self.unit.qualname.clone();
        self.load_const(Constant::Str(qualname))?;
        self.compile_name("__qualname__", ExprContext::Store)?;
        self.compile_body(body)?;

        self.unit.reset_lineno();
        if self.unit.needs_class_cell {
            let slot = self.unit.deref_index("__class__")?;
            self.emit_arg(Opcode::LOAD_CLOSURE, slot)?;
            self.emit(Opcode::DUP_TOP)?;
            self.compile_name("__classcell__", ExprContext::Store)?;
        } else {
            self.load_const(Constant::None)?;
        }
        self.emit(Opcode::RETURN_VALUE)?;
        let code = self.exit_scope(true)?;

        self.emit(Opcode::LOAD_BUILD_CLASS)?;
        self.make_closure(code, 0, name.to_string())?;
        self.load_const(Constant::str(name))?;
        self.compile_call_helper(2, bases, keywords)?;
        self.apply_decorators(decorators)?;
        self.compile_name(name, ExprContext::Store)
    }

    fn compile_lambda(&mut self, args: &Arguments, body: &Expr, lineno: u32) -> CompileResult<()> {
        let flags = self.compile_default_arguments(args)?;

        self.enter_scope("<lambda>", ScopeKind::Lambda, lineno)?;
        self.unit.intern_constant(Constant::None);
        self.compile_expr(body)?;
        let code = if self.unit.is_generator {
            self.exit_scope(false)?
        } else {
            self.emit(Opcode::RETURN_VALUE)?;
            self.exit_scope(true)?
        };

        let qualname = code.qualname.clone();
        self.make_closure(code, flags, qualname)
    }

    fn compile_list_comp(&mut self, elt: &Expr, generators: &[Comprehension], lineno: u32) -> CompileResult<()> {
        let Some(outermost) = generators.first() else {
            return Err(CompileError::internal("list comprehension without generators"));
        };

        self.enter_scope("<listcomp>", ScopeKind::Comprehension, lineno)?;
        self.emit_arg(Opcode::BUILD_LIST, 0)?;
        self.compile_comprehension_generator(generators, 0, elt)?;
        self.emit(Opcode::RETURN_VALUE)?;
        let code = self.exit_scope(true)?;

        let qualname = code.qualname.clone();
        self.make_closure(code, 0, qualname)?;
        // The outermost iterable is evaluated in the enclosing scope.
        self.compile_expr(&outermost.iter)?;
        self.emit(Opcode::GET_ITER)?;
        self.emit_arg(Opcode::CALL_FUNCTION, 1)
    }

    fn compile_comprehension_generator(
        &mut self,
        generators: &[Comprehension],
        index: usize,
        elt: &Expr,
    ) -> CompileResult<()> {
        let Some(generator) = generators.get(index) else {
            return Err(CompileError::internal("comprehension generator out of range"));
        };
        let start = self.new_block();
        let skip = self.new_block();
        let if_cleanup = self.new_block();
        let anchor = self.new_block();

        if index == 0 {
            let slot = self.unit.varname(".0");
            self.emit_arg(Opcode::LOAD_FAST, slot)?;
        } else {
            self.compile_expr(&generator.iter)?;
            self.emit(Opcode::GET_ITER)?;
        }
        self.use_next_block(start);
        self.emit_jump(Opcode::FOR_ITER, anchor)?;
        self.next_block();
        self.compile_expr(&generator.target)?;

        for cond in &generator.ifs {
            self.compile_jump_if(cond, if_cleanup, false)?;
            self.next_block();
        }

        let depth = index + 1;
        if depth < generators.len() {
            self.compile_comprehension_generator(generators, depth, elt)?;
        } else {
            self.compile_expr(elt)?;
            self.emit_arg(Opcode::LIST_APPEND, depth as u32 + 1)?;
            self.use_next_block(skip);
        }
        self.use_next_block(if_cleanup);
        self.emit_jump(Opcode::JUMP_ABSOLUTE, start)?;
        self.use_next_block(anchor);
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        let saved = self.unit.lineno;
        if expr.lineno > 0 {
            self.unit.set_lineno(expr.lineno);
        }
        self.compile_expr_kind(expr)?;
        self.unit.set_lineno(saved);
        Ok(())
    }

    fn compile_expr_kind(&mut self, expr: &Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::BoolOp { op, values } => self.compile_bool_op(*op, values),

            ExprKind::BinOp { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(binary_opcode(*op))
            }

            ExprKind::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                self.emit(unary_opcode(*op))
            }

            ExprKind::Lambda { args, body } => self.compile_lambda(args, body, expr.lineno),

            ExprKind::IfExp { test, body, orelse } => {
                let end = self.new_block();
                let next = self.new_block();
                self.compile_jump_if(test, next, false)?;
                self.compile_expr(body)?;
                self.emit_jump(Opcode::JUMP_FORWARD, end)?;
                self.use_next_block(next);
                self.compile_expr(orelse)?;
                self.use_next_block(end);
                Ok(())
            }

            ExprKind::Dict { keys, values } => self.compile_dict(keys, values),

            ExprKind::Set(elts) => {
                for elt in elts {
                    self.compile_expr(elt)?;
                }
                self.emit_arg(Opcode::BUILD_SET, elts.len() as u32)
            }

            ExprKind::ListComp { elt, generators } => self.compile_list_comp(elt, generators, expr.lineno),

            ExprKind::Yield(value) => {
                if !self.unit.kind.is_function_like() {
                    return Err(CompileError::yield_outside_function(expr.lineno));
                }
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.load_const(Constant::None)?,
                }
                self.emit(Opcode::YIELD_VALUE)
            }

            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.compile_compare(left, ops, comparators),

            ExprKind::Call { func, args, keywords } => self.compile_call(func, args, keywords),

            ExprKind::Constant(value) => self.load_const(value.clone()),

            ExprKind::Attribute { value, attr, ctx } => {
                self.compile_expr(value)?;
                let opcode = match ctx {
                    ExprContext::Load => Opcode::LOAD_ATTR,
                    ExprContext::Store => Opcode::STORE_ATTR,
                    ExprContext::Del => Opcode::DELETE_ATTR,
                };
                self.emit_name(opcode, attr)
            }

            ExprKind::Subscript { value, slice, ctx } => {
                self.compile_expr(value)?;
                self.compile_expr(slice)?;
                self.emit(match ctx {
                    ExprContext::Load => Opcode::BINARY_SUBSCR,
                    ExprContext::Store => Opcode::STORE_SUBSCR,
                    ExprContext::Del => Opcode::DELETE_SUBSCR,
                })
            }

            ExprKind::Slice { lower, upper, step } => {
                for bound in [lower, upper] {
                    match bound {
                        Some(bound) => self.compile_expr(bound)?,
                        None => self.load_const(Constant::None)?,
                    }
                }
                let count = match step {
                    Some(step) => {
                        self.compile_expr(step)?;
                        3
                    }
                    None => 2,
                };
                self.emit_arg(Opcode::BUILD_SLICE, count)
            }

            ExprKind::Name { id, ctx } => self.compile_name(id, *ctx),

            ExprKind::List { elts, ctx } => self.compile_sequence(elts, *ctx, Opcode::BUILD_LIST),

            ExprKind::Tuple { elts, ctx } => self.compile_sequence(elts, *ctx, Opcode::BUILD_TUPLE),
        }
    }

    fn compile_bool_op(&mut self, op: BoolOp, values: &[Expr]) -> CompileResult<()> {
        let (last, init) = split_last(values, "boolean operation")?;
        let jump = match op {
            BoolOp::And => Opcode::JUMP_IF_FALSE_OR_POP,
            BoolOp::Or => Opcode::JUMP_IF_TRUE_OR_POP,
        };
        let end = self.new_block();
        for value in init {
            self.compile_expr(value)?;
            self.emit_jump(jump, end)?;
            self.next_block();
        }
        self.compile_expr(last)?;
        self.use_next_block(end);
        Ok(())
    }

    fn compile_compare(&mut self, left: &Expr, ops: &[CmpOp], comparators: &[Expr]) -> CompileResult<()> {
        if ops.len() != comparators.len() {
            return Err(CompileError::internal(format!(
                "comparison with {} operators and {} operands",
                ops.len(),
                comparators.len()
            )));
        }
        let (last_op, init_ops) = split_last(ops, "comparison")?;
        let (last_cmp, init_cmps) = split_last(comparators, "comparison")?;

        self.compile_expr(left)?;
        if init_ops.is_empty() {
            self.compile_expr(last_cmp)?;
            return self.emit_compare(*last_op);
        }

        let cleanup = self.new_block();
        for (op, comparator) in init_ops.iter().zip(init_cmps) {
            self.compile_expr(comparator)?;
            self.emit(Opcode::DUP_TOP)?;
            self.emit(Opcode::ROT_THREE)?;
            self.emit_compare(*op)?;
            self.emit_jump(Opcode::JUMP_IF_FALSE_OR_POP, cleanup)?;
            self.next_block();
        }
        self.compile_expr(last_cmp)?;
        self.emit_compare(*last_op)?;

        let end = self.new_block();
        self.emit_jump(Opcode::JUMP_FORWARD, end)?;
        self.use_next_block(cleanup);
        self.emit(Opcode::ROT_TWO)?;
        self.emit(Opcode::POP_TOP)?;
        self.use_next_block(end);
        Ok(())
    }

    fn emit_compare(&mut self, op: CmpOp) -> CompileResult<()> {
        let (opcode, arg) = compare_opcode(op);
        self.emit_arg(opcode, arg)
    }

    fn compile_call(&mut self, func: &Expr, args: &[Expr], keywords: &[Keyword]) -> CompileResult<()> {
        if let ExprKind::Attribute {
            value,
            attr,
            ctx: ExprContext::Load,
        } = &func.kind
        {
            if keywords.is_empty() {
                self.compile_expr(value)?;
                self.emit_name(Opcode::LOAD_METHOD, attr)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                return self.emit_arg(Opcode::CALL_METHOD, args.len() as u32);
            }
        }

        self.compile_expr(func)?;
        self.compile_call_helper(0, args, keywords)
    }

    /// Push `args` and `keywords` and call; `extra` values are already on the stack.
    fn compile_call_helper(&mut self, extra: u32, args: &[Expr], keywords: &[Keyword]) -> CompileResult<()> {
        for arg in args {
            self.compile_expr(arg)?;
        }
        let positional = extra + args.len() as u32;
        if keywords.is_empty() {
            return self.emit_arg(Opcode::CALL_FUNCTION, positional);
        }

        for keyword in keywords {
            self.compile_expr(&keyword.value)?;
        }
        let names = keywords.iter().map(|k| Constant::str(&k.arg)).collect();
        self.load_const(Constant::Tuple(names))?;
        self.emit_arg(Opcode::CALL_FUNCTION_KW, positional + keywords.len() as u32)
    }

    fn compile_dict(&mut self, keys: &[Expr], values: &[Expr]) -> CompileResult<()> {
        if keys.len() != values.len() {
            return Err(CompileError::internal(format!(
                "dict display with {} keys and {} values",
                keys.len(),
                values.len()
            )));
        }

        let mut have_dict = false;
        for (keys, values) in keys.chunks(MAX_MAP_CHUNK).zip(values.chunks(MAX_MAP_CHUNK)) {
            self.compile_subdict(keys, values)?;
            if have_dict {
                self.emit_arg(Opcode::DICT_UPDATE, 1)?;
            }
            have_dict = true;
        }
        if !have_dict {
            self.emit_arg(Opcode::BUILD_MAP, 0)?;
        }
        Ok(())
    }

    fn compile_subdict(&mut self, keys: &[Expr], values: &[Expr]) -> CompileResult<()> {
        let count = keys.len() as u32;
        let constant_keys: Option<Vec<Constant>> = keys
            .iter()
            .map(|k| match &k.kind {
                ExprKind::Constant(c) => Some(c.clone()),
                _ => None,
            })
            .collect();

        match constant_keys {
            Some(constant_keys) if count > 1 => {
                for value in values {
                    self.compile_expr(value)?;
                }
                self.load_const(Constant::Tuple(constant_keys))?;
                self.emit_arg(Opcode::BUILD_CONST_KEY_MAP, count)
            }
            _ => {
                for (key, value) in keys.iter().zip(values) {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit_arg(Opcode::BUILD_MAP, count)
            }
        }
    }

    fn compile_sequence(&mut self, elts: &[Expr], ctx: ExprContext, build: Opcode) -> CompileResult<()> {
        match ctx {
            ExprContext::Load => {
                for elt in elts {
                    self.compile_expr(elt)?;
                }
                self.emit_arg(build, elts.len() as u32)
            }
            ExprContext::Store => {
                self.emit_arg(Opcode::UNPACK_SEQUENCE, elts.len() as u32)?;
                for elt in elts {
                    self.compile_expr(elt)?;
                }
                Ok(())
            }
            ExprContext::Del => {
                for elt in elts {
                    self.compile_expr(elt)?;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn finish_unit(unit: CompilationUnit, add_none: bool, filename: &str) -> CompileResult<CodeObject> {
    let scope = unit.qualname.clone();
    if unit.remaining_children() > 0 {
        return Err(CompileError::internal(format!(
            "{} nested scope(s) in the symbol table were never compiled",
            unit.remaining_children()
        ))
        .with_context(&scope, 0));
    }
    if !unit.fblocks.is_empty() {
        return Err(CompileError::internal("frame blocks left open at end of scope").with_context(&scope, 0));
    }
    debug!(scope = %scope, serial = unit.serial, "leaving scope");
    assemble(unit, add_none, filename).map_err(|e| e.with_context(&scope, 0))
}

fn loop_targets(fblock: &FBlock) -> CompileResult<(BlockIdx, BlockIdx)> {
    fblock
        .loop_targets()
        .ok_or_else(|| CompileError::internal("unwinding stopped at a block that is not a loop"))
}

fn split_last<'a, T>(items: &'a [T], what: &str) -> CompileResult<(&'a T, &'a [T])> {
    items
        .split_last()
        .ok_or_else(|| CompileError::internal(format!("{} without operands", what)))
}

fn pop_jump_if(cond: bool) -> Opcode {
    if cond {
        Opcode::POP_JUMP_IF_TRUE
    } else {
        Opcode::POP_JUMP_IF_FALSE
    }
}

/// Number of nested scopes whose code `expr` would create in the current scope.
fn nested_scopes(expr: &Expr) -> usize {
    let own = usize::from(matches!(expr.kind, ExprKind::Lambda { .. } | ExprKind::ListComp { .. }));
    own + subexpressions(expr).into_iter().map(nested_scopes).sum::<usize>()
}

/// Direct subexpressions of `expr` that are evaluated in the enclosing scope.
fn subexpressions(expr: &Expr) -> Vec<&Expr> {
    match &expr.kind {
        ExprKind::BoolOp { values, .. } => values.iter().collect(),
        ExprKind::BinOp { left, right, .. } => vec![left.as_ref(), right.as_ref()],
        ExprKind::UnaryOp { operand, .. } => vec![operand.as_ref()],
        ExprKind::Lambda { args, .. } => args
            .defaults
            .iter()
            .chain(args.kw_defaults.iter().flatten())
            .collect(),
        ExprKind::IfExp { test, body, orelse } => vec![test.as_ref(), body.as_ref(), orelse.as_ref()],
        ExprKind::Dict { keys, values } => keys.iter().chain(values).collect(),
        ExprKind::Set(elts) | ExprKind::List { elts, .. } | ExprKind::Tuple { elts, .. } => elts.iter().collect(),
        ExprKind::ListComp { generators, .. } => generators.first().map(|g| &g.iter).into_iter().collect(),
        ExprKind::Yield(value) => value.as_deref().into_iter().collect(),
        ExprKind::Compare { left, comparators, .. } => {
            std::iter::once(left.as_ref()).chain(comparators).collect()
        }
        ExprKind::Call { func, args, keywords } => std::iter::once(func.as_ref())
            .chain(args)
            .chain(keywords.iter().map(|k| &k.value))
            .collect(),
        ExprKind::Attribute { value, .. } => vec![value.as_ref()],
        ExprKind::Subscript { value, slice, .. } => vec![value.as_ref(), slice.as_ref()],
        ExprKind::Slice { lower, upper, step } => [lower, upper, step]
            .into_iter()
            .filter_map(|b| b.as_deref())
            .collect(),
        ExprKind::Constant(_) | ExprKind::Name { .. } => Vec::new(),
    }
}

fn compare_opcode(op: CmpOp) -> (Opcode, u32) {
    match op {
        CmpOp::Lt => (Opcode::COMPARE_OP, 0),
        CmpOp::LtE => (Opcode::COMPARE_OP, 1),
        CmpOp::Eq => (Opcode::COMPARE_OP, 2),
        CmpOp::NotEq => (Opcode::COMPARE_OP, 3),
        CmpOp::Gt => (Opcode::COMPARE_OP, 4),
        CmpOp::GtE => (Opcode::COMPARE_OP, 5),
        CmpOp::Is => (Opcode::IS_OP, 0),
        CmpOp::IsNot => (Opcode::IS_OP, 1),
        CmpOp::In => (Opcode::CONTAINS_OP, 0),
        CmpOp::NotIn => (Opcode::CONTAINS_OP, 1),
    }
}

fn binary_opcode(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::BINARY_ADD,
        Operator::Sub => Opcode::BINARY_SUBTRACT,
        Operator::Mult => Opcode::BINARY_MULTIPLY,
        Operator::MatMult => Opcode::BINARY_MATRIX_MULTIPLY,
        Operator::Div => Opcode::BINARY_TRUE_DIVIDE,
        Operator::Mod => Opcode::BINARY_MODULO,
        Operator::Pow => Opcode::BINARY_POWER,
        Operator::LShift => Opcode::BINARY_LSHIFT,
        Operator::RShift => Opcode::BINARY_RSHIFT,
        Operator::BitOr => Opcode::BINARY_OR,
        Operator::BitXor => Opcode::BINARY_XOR,
        Operator::BitAnd => Opcode::BINARY_AND,
        Operator::FloorDiv => Opcode::BINARY_FLOOR_DIVIDE,
    }
}

fn inplace_opcode(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::INPLACE_ADD,
        Operator::Sub => Opcode::INPLACE_SUBTRACT,
        Operator::Mult => Opcode::INPLACE_MULTIPLY,
        Operator::MatMult => Opcode::INPLACE_MATRIX_MULTIPLY,
        Operator::Div => Opcode::INPLACE_TRUE_DIVIDE,
        Operator::Mod => Opcode::INPLACE_MODULO,
        Operator::Pow => Opcode::INPLACE_POWER,
        Operator::LShift => Opcode::INPLACE_LSHIFT,
        Operator::RShift => Opcode::INPLACE_RSHIFT,
        Operator::BitOr => Opcode::INPLACE_OR,
        Operator::BitXor => Opcode::INPLACE_XOR,
        Operator::BitAnd => Opcode::INPLACE_AND,
        Operator::FloorDiv => Opcode::INPLACE_FLOOR_DIVIDE,
    }
}

fn unary_opcode(op: UnaryOp) -> Opcode {
    match op {
        UnaryOp::Invert => Opcode::UNARY_INVERT,
        UnaryOp::Not => Opcode::UNARY_NOT,
        UnaryOp::UAdd => Opcode::UNARY_POSITIVE,
        UnaryOp::USub => Opcode::UNARY_NEGATIVE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeFlags, disasm::decode};

    fn module(body: Vec<Stmt>) -> Mod {
        Mod::Module { body }
    }

    fn int(n: i64, line: u32) -> Expr {
        Expr::constant(Constant::Int(n), line)
    }

    fn call(func: &str, line: u32) -> Expr {
        Expr::new(
            ExprKind::Call {
                func: Box::new(Expr::name(func, line)),
                args: vec![],
                keywords: vec![],
            },
            line,
        )
    }

    fn assign(target: &str, value: Expr, line: u32) -> Stmt {
        Stmt::new(
            StmtKind::Assign {
                targets: vec![Expr::store(target, line)],
                value,
            },
            line,
        )
    }

    fn def(name: &str, body: Vec<Stmt>, line: u32) -> Stmt {
        Stmt::new(
            StmtKind::FunctionDef {
                name: name.to_string(),
                args: Box::default(),
                body,
                decorator_list: vec![],
                returns: None,
            },
            line,
        )
    }

    fn ops(code: &CodeObject) -> Vec<(Opcode, u32)> {
        decode(&code.code)
            .unwrap()
            .into_iter()
            .map(|i| (i.opcode, i.arg))
            .collect()
    }

    fn compile_module(body: Vec<Stmt>, symbols: SymbolTable) -> CodeObject {
        compile(&module(body), symbols, CompileOptions::default()).unwrap()
    }

    #[test]
    fn test_module_assignment() {
        let code = compile_module(vec![assign("x", int(1, 1), 1)], SymbolTable::module());
        assert_eq!(
            ops(&code),
            [
                (Opcode::LOAD_CONST, 0),
                (Opcode::STORE_NAME, 0),
                (Opcode::LOAD_CONST, 1),
                (Opcode::RETURN_VALUE, 0),
            ]
        );
        assert_eq!(code.constants, [Constant::Int(1), Constant::None]);
        assert_eq!(code.names, ["x"]);
        assert_eq!(code.name, "<module>");
        assert!(code.flags.contains(CodeFlags::NOFREE));
    }

    #[test]
    fn test_expression_mode_returns_value() {
        let expr = Mod::Expression {
            body: Box::new(int(7, 1)),
        };
        let code = compile(&expr, SymbolTable::module(), CompileOptions::default()).unwrap();
        assert_eq!(ops(&code), [(Opcode::LOAD_CONST, 0), (Opcode::RETURN_VALUE, 0)]);
        assert_eq!(code.constants, [Constant::Int(7)]);
    }

    #[test]
    fn test_interactive_rejected() {
        let err = compile(
            &Mod::Interactive { body: vec![] },
            SymbolTable::module(),
            CompileOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedMode { ref mode } if mode == "interactive"));
    }

    #[test]
    fn test_root_table_must_be_module() {
        let err = compile(&module(vec![]), SymbolTable::function("f", 1), CompileOptions::default())
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_name_ops_follow_symbol_scope() {
        // def f(a): return a + g + c   with c a free variable
        let body = vec![Stmt::new(
            StmtKind::Return(Some(Expr::new(
                ExprKind::BinOp {
                    left: Box::new(Expr::new(
                        ExprKind::BinOp {
                            left: Box::new(Expr::name("a", 2)),
                            op: Operator::Add,
                            right: Box::new(Expr::name("g", 2)),
                        },
                        2,
                    )),
                    op: Operator::Add,
                    right: Box::new(Expr::name("c", 2)),
                },
                2,
            ))),
            2,
        )];
        let outer = SymbolTable::function("outer", 1)
            .with_symbol("c", SymbolScope::Cell)
            .with_symbol("f", SymbolScope::Local)
            .with_child(
                SymbolTable::function("f", 1)
                    .with_params(["a"])
                    .with_symbol("g", SymbolScope::GlobalImplicit)
                    .with_symbol("c", SymbolScope::Free),
            );
        let symbols = SymbolTable::module()
            .with_symbol("outer", SymbolScope::Local)
            .with_child(outer);

        let code = compile_module(vec![def("outer", vec![def("f", body, 1)], 1)], symbols);
        let outer = code.nested().next().unwrap();
        let f = outer.nested().next().unwrap();

        assert_eq!(f.qualname, "outer.<locals>.f");
        assert_eq!(
            ops(f),
            [
                (Opcode::LOAD_FAST, 0),
                (Opcode::LOAD_GLOBAL, 0),
                (Opcode::BINARY_ADD, 0),
                (Opcode::LOAD_DEREF, 0),
                (Opcode::BINARY_ADD, 0),
                (Opcode::RETURN_VALUE, 0),
            ]
        );
        assert!(f.flags.contains(CodeFlags::NESTED));
        assert_eq!(f.freevars, ["c"]);

        // outer builds the closure from its own cell
        let outer_ops = ops(outer);
        assert_eq!(outer_ops[0], (Opcode::LOAD_CLOSURE, 0));
        assert_eq!(outer_ops[1], (Opcode::BUILD_TUPLE, 1));
        assert_eq!(outer_ops[4], (Opcode::MAKE_FUNCTION, make_function::CLOSURE));
    }

    #[test]
    fn test_code_after_return_is_dropped() {
        let body = vec![
            Stmt::new(StmtKind::Return(Some(int(1, 2))), 2),
            Stmt::expr(call("side_effect", 3)),
        ];
        let symbols = SymbolTable::module()
            .with_symbol("f", SymbolScope::Local)
            .with_child(SymbolTable::function("f", 1).with_symbol("side_effect", SymbolScope::GlobalImplicit));

        let code = compile_module(vec![def("f", body, 1)], symbols);
        let f = code.nested().next().unwrap();
        assert_eq!(ops(f), [(Opcode::LOAD_CONST, 1), (Opcode::RETURN_VALUE, 0)]);
        // the dead call still interned its name
        assert_eq!(f.names, ["side_effect"]);
    }

    #[test]
    fn test_break_outside_loop() {
        let err = compile(
            &module(vec![Stmt::new(StmtKind::Break, 4)]),
            SymbolTable::module(),
            CompileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, CompileError::break_outside_loop(4));
    }

    #[test]
    fn test_return_outside_function() {
        let err = compile(
            &module(vec![Stmt::new(StmtKind::Return(None), 2)]),
            SymbolTable::module(),
            CompileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, CompileError::return_outside_function(2));
    }

    #[test]
    fn test_default_except_must_be_last() {
        let handler = |typ: Option<Expr>, line| ExceptHandler {
            typ,
            name: None,
            body: vec![Stmt::new(StmtKind::Pass, line)],
            lineno: line,
        };
        let stmt = Stmt::new(
            StmtKind::Try {
                body: vec![Stmt::new(StmtKind::Pass, 2)],
                handlers: vec![handler(None, 3), handler(Some(Expr::name("E", 5)), 5)],
                orelse: vec![],
                finalbody: vec![],
            },
            1,
        );
        let err = compile(&module(vec![stmt]), SymbolTable::module(), CompileOptions::default())
            .unwrap_err();
        assert_eq!(err, CompileError::default_except_not_last(3));
    }

    #[test]
    fn test_while_break_jumps_past_else() {
        // while x: break
        // else: y()
        let stmt = Stmt::new(
            StmtKind::While {
                test: Expr::name("x", 1),
                body: vec![Stmt::new(StmtKind::Break, 2)],
                orelse: vec![Stmt::expr(call("y", 4))],
            },
            1,
        );
        let code = compile_module(vec![stmt], SymbolTable::module());
        let decoded = decode(&code.code).unwrap();
        let break_jump = decoded
            .iter()
            .find(|i| i.opcode == Opcode::JUMP_ABSOLUTE)
            .unwrap();
        // target is the implicit return after the else clause
        let target = break_jump.jump_target().unwrap() as usize;
        let at_target = decoded.iter().find(|i| i.offset as usize == target).unwrap();
        assert_eq!(at_target.opcode, Opcode::LOAD_CONST);
        assert!(decoded.iter().any(|i| i.opcode == Opcode::CALL_FUNCTION));
    }

    #[test]
    fn test_class_qualname_and_module_binding() {
        let class = Stmt::new(
            StmtKind::ClassDef {
                name: "C".to_string(),
                bases: vec![],
                keywords: vec![],
                body: vec![def("m", vec![Stmt::new(StmtKind::Pass, 3)], 2)],
                decorator_list: vec![],
            },
            1,
        );
        let symbols = SymbolTable::module()
            .with_symbol("C", SymbolScope::Local)
            .with_child(
                SymbolTable::class("C", 1)
                    .with_symbol("m", SymbolScope::Local)
                    .with_child(SymbolTable::function("m", 2)),
            );

        let code = compile_module(vec![class], symbols);
        assert_eq!(code.names, ["C"]);
        assert_eq!(ops(&code)[0], (Opcode::LOAD_BUILD_CLASS, 0));
        let body = code.nested().next().unwrap();
        assert_eq!(body.qualname, "C");
        assert_eq!(body.names, ["__name__", "__module__", "__qualname__", "m"]);
        let method = body.nested().next().unwrap();
        assert_eq!(method.qualname, "C.m");
        assert!(!method.flags.contains(CodeFlags::NESTED));
    }

    #[test]
    fn test_explicit_global_function_keeps_bare_qualname() {
        let symbols = SymbolTable::module()
            .with_symbol("outer", SymbolScope::Local)
            .with_child(
                SymbolTable::function("outer", 1)
                    .with_symbol("g", SymbolScope::GlobalExplicit)
                    .with_child(SymbolTable::function("g", 3)),
            );
        let outer_body = vec![
            Stmt::new(StmtKind::Global(vec!["g".to_string()]), 2),
            def("g", vec![Stmt::new(StmtKind::Pass, 4)], 3),
        ];
        let code = compile_module(vec![def("outer", outer_body, 1)], symbols);
        let outer = code.nested().next().unwrap();
        let g = outer.nested().next().unwrap();
        assert_eq!(g.qualname, "g");
        assert_eq!(ops(outer)[3], (Opcode::STORE_GLOBAL, 0));
    }

    #[test]
    fn test_assert_stripped_skips_nested_scopes() {
        // assert (lambda: 1)()
        let lambda = Expr::new(
            ExprKind::Lambda {
                args: Box::default(),
                body: Box::new(int(1, 1)),
            },
            1,
        );
        let test = Expr::new(
            ExprKind::Call {
                func: Box::new(lambda),
                args: vec![],
                keywords: vec![],
            },
            1,
        );
        let stmt = Stmt::new(StmtKind::Assert { test, msg: None }, 1);
        let symbols = SymbolTable::module().with_child(SymbolTable::lambda(1));

        let code = compile(
            &module(vec![stmt]),
            symbols,
            CompileOptions::default().with_optimize(1),
        )
        .unwrap();
        assert_eq!(ops(&code), [(Opcode::LOAD_CONST, 0), (Opcode::RETURN_VALUE, 0)]);
    }

    #[test]
    fn test_unconsumed_child_is_internal_error() {
        let symbols = SymbolTable::module().with_child(SymbolTable::function("ghost", 1));
        let err = compile(&module(vec![]), symbols, CompileOptions::default()).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("<module>"));
    }

    #[test]
    fn test_module_docstring() {
        let doc = Stmt::expr(Expr::constant(Constant::str("about"), 1));
        let code = compile_module(vec![doc.clone()], SymbolTable::module());
        assert_eq!(code.names, ["__doc__"]);

        let stripped = compile(
            &module(vec![doc]),
            SymbolTable::module(),
            CompileOptions::default().with_optimize(2),
        )
        .unwrap();
        assert!(stripped.names.is_empty());
        assert_eq!(ops(&stripped)[0], (Opcode::NOP, 0));
    }
}
