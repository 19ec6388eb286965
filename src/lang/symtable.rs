//! Scope classification produced by the external symbol-table pass.
//!
//! The backend treats this tree as ground truth: it never re-derives which
//! names are local, captured, or global.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The kind of lexical scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Module,
    Class,
    Function,
    Lambda,
    Comprehension,
}

impl ScopeKind {
    /// Function-like scopes keep their locals in fast slots.
    pub fn is_function_like(self) -> bool {
        matches!(
            self,
            ScopeKind::Function | ScopeKind::Lambda | ScopeKind::Comprehension
        )
    }
}

/// Resolution of one identifier within one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolScope {
    /// Bound in this scope and not captured by any nested scope.
    Local,
    /// Not bound anywhere enclosing; resolved in module globals.
    GlobalImplicit,
    /// Declared `global` in this scope.
    GlobalExplicit,
    /// Bound in an enclosing function scope and captured here.
    Free,
    /// Bound here and captured by a nested scope.
    Cell,
}

/// One scope of the symbol-table tree.
///
/// `children` lists nested scopes in the order the backend enters them,
/// which is source order with one exception: a comprehension's own scope
/// comes before any scope nested in its outermost iterable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTable {
    pub name: String,
    pub kind: ScopeKind,
    pub lineno: u32,
    pub posonly_params: Vec<String>,
    pub params: Vec<String>,
    pub kwonly_params: Vec<String>,
    pub vararg: Option<String>,
    pub kwarg: Option<String>,
    pub symbols: IndexMap<String, SymbolScope>,
    /// A class body whose methods reference `__class__` or `super`.
    pub needs_class_cell: bool,
    pub is_generator: bool,
    pub children: Vec<SymbolTable>,
}

impl SymbolTable {
    pub fn new(kind: ScopeKind, name: impl Into<String>, lineno: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            lineno,
            posonly_params: Vec::new(),
            params: Vec::new(),
            kwonly_params: Vec::new(),
            vararg: None,
            kwarg: None,
            symbols: IndexMap::new(),
            needs_class_cell: false,
            is_generator: false,
            children: Vec::new(),
        }
    }

    pub fn module() -> Self {
        Self::new(ScopeKind::Module, "top", 0)
    }

    pub fn function(name: impl Into<String>, lineno: u32) -> Self {
        Self::new(ScopeKind::Function, name, lineno)
    }

    pub fn class(name: impl Into<String>, lineno: u32) -> Self {
        Self::new(ScopeKind::Class, name, lineno)
    }

    pub fn lambda(lineno: u32) -> Self {
        Self::new(ScopeKind::Lambda, "<lambda>", lineno)
    }

    /// A list comprehension scope with its implicit `.0` iterator parameter.
    pub fn list_comprehension(lineno: u32) -> Self {
        Self::new(ScopeKind::Comprehension, "<listcomp>", lineno).with_params([".0"])
    }

    /// Append ordinary positional parameters; each becomes a local.
    pub fn with_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            self.symbols.entry(name.clone()).or_insert(SymbolScope::Local);
            self.params.push(name);
        }
        self
    }

    pub fn with_posonly_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            self.symbols.entry(name.clone()).or_insert(SymbolScope::Local);
            self.posonly_params.push(name);
        }
        self
    }

    pub fn with_kwonly_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            self.symbols.entry(name.clone()).or_insert(SymbolScope::Local);
            self.kwonly_params.push(name);
        }
        self
    }

    pub fn with_vararg(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.symbols.entry(name.clone()).or_insert(SymbolScope::Local);
        self.vararg = Some(name);
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.symbols.entry(name.clone()).or_insert(SymbolScope::Local);
        self.kwarg = Some(name);
        self
    }

    /// Classify `name`; a later call overrides an earlier one.
    pub fn with_symbol(mut self, name: impl Into<String>, scope: SymbolScope) -> Self {
        self.symbols.insert(name.into(), scope);
        self
    }

    pub fn with_child(mut self, child: SymbolTable) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_class_cell(mut self) -> Self {
        self.needs_class_cell = true;
        self
    }

    pub fn generator(mut self) -> Self {
        self.is_generator = true;
        self
    }

    /// Parameter names in slot order.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.posonly_params
            .iter()
            .chain(&self.params)
            .chain(&self.kwonly_params)
            .chain(&self.vararg)
            .chain(&self.kwarg)
            .map(String::as_str)
    }

    /// Cell variable names, sorted.
    pub fn cellvars(&self) -> Vec<String> {
        self.sorted_names(SymbolScope::Cell)
    }

    /// Free variable names, sorted.
    pub fn freevars(&self) -> Vec<String> {
        self.sorted_names(SymbolScope::Free)
    }

    fn sorted_names(&self, scope: SymbolScope) -> Vec<String> {
        let mut names: Vec<String> = self
            .symbols
            .iter()
            .filter(|(_, s)| **s == scope)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_slot_order() {
        let table = SymbolTable::function("f", 1)
            .with_posonly_params(["a"])
            .with_params(["b"])
            .with_kwonly_params(["c"])
            .with_vararg("args")
            .with_kwarg("kw");

        let names: Vec<&str> = table.parameter_names().collect();
        assert_eq!(names, ["a", "b", "c", "args", "kw"]);
    }

    #[test]
    fn test_cell_and_free_are_sorted() {
        let table = SymbolTable::function("f", 1)
            .with_symbol("z", SymbolScope::Cell)
            .with_symbol("a", SymbolScope::Cell)
            .with_symbol("m", SymbolScope::Free)
            .with_symbol("x", SymbolScope::Local);

        assert_eq!(table.cellvars(), ["a", "z"]);
        assert_eq!(table.freevars(), ["m"]);
    }

    #[test]
    fn test_param_can_be_reclassified_as_cell() {
        let table = SymbolTable::function("f", 1)
            .with_params(["x"])
            .with_symbol("x", SymbolScope::Cell);
        assert_eq!(table.symbols.get("x"), Some(&SymbolScope::Cell));
        assert_eq!(table.params, ["x"]);
    }

    #[test]
    fn test_function_like_kinds() {
        assert!(ScopeKind::Lambda.is_function_like());
        assert!(ScopeKind::Comprehension.is_function_like());
        assert!(!ScopeKind::Class.is_function_like());
        assert!(!ScopeKind::Module.is_function_like());
    }
}
