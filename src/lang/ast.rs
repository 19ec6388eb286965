use super::constant::Constant;
use serde::{Deserialize, Serialize};

/// Top-level input handed to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mod {
    /// A source file: a sequence of statements.
    Module { body: Vec<Stmt> },

    /// A single expression compiled for evaluation (`eval` input).
    Expression { body: Box<Expr> },

    /// Interactive (REPL) input. Not supported by this backend.
    Interactive { body: Vec<Stmt> },
}

impl Mod {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Mod::Module { .. } => "module",
            Mod::Expression { .. } => "expression",
            Mod::Interactive { .. } => "interactive",
        }
    }
}

/// A statement with its 1-based source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub lineno: u32,
}

impl Stmt {
    pub fn new(kind: StmtKind, lineno: u32) -> Self {
        Self { kind, lineno }
    }

    /// Expression statement on the expression's own line.
    pub fn expr(value: Expr) -> Self {
        let lineno = value.lineno;
        Self::new(StmtKind::Expr(value), lineno)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    // ─────────────────────────── Definitions ────────────────────────────
    FunctionDef {
        name: String,
        args: Box<Arguments>,
        body: Vec<Stmt>,
        decorator_list: Vec<Expr>,
        returns: Option<Box<Expr>>,
    },

    ClassDef {
        name: String,
        bases: Vec<Expr>,
        keywords: Vec<Keyword>,
        body: Vec<Stmt>,
        decorator_list: Vec<Expr>,
    },

    // ─────────────────────────── Simple statements ──────────────────────
    Return(Option<Expr>),

    Delete(Vec<Expr>),

    /// `a = b = value`: one value stored to every target, left to right.
    Assign { targets: Vec<Expr>, value: Expr },

    AugAssign { target: Expr, op: Operator, value: Expr },

    Raise { exc: Option<Expr>, cause: Option<Expr> },

    Assert { test: Expr, msg: Option<Expr> },

    Import(Vec<Alias>),

    ImportFrom { module: Option<String>, names: Vec<Alias>, level: u32 },

    Global(Vec<String>),

    Nonlocal(Vec<String>),

    Expr(Expr),

    Pass,

    Break,

    Continue,

    // ─────────────────────────── Compound statements ────────────────────
    For { target: Expr, iter: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },

    While { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },

    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },

    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
}

/// An expression with its 1-based source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub lineno: u32,
}

impl Expr {
    pub fn new(kind: ExprKind, lineno: u32) -> Self {
        Self { kind, lineno }
    }

    pub fn name(id: impl Into<String>, lineno: u32) -> Self {
        Self::new(ExprKind::Name { id: id.into(), ctx: ExprContext::Load }, lineno)
    }

    /// A name in assignment-target position.
    pub fn store(id: impl Into<String>, lineno: u32) -> Self {
        Self::new(ExprKind::Name { id: id.into(), ctx: ExprContext::Store }, lineno)
    }

    pub fn constant(value: Constant, lineno: u32) -> Self {
        Self::new(ExprKind::Constant(value), lineno)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ExprKind::Constant(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// `a and b and c` / `a or b or c` with at least two values.
    BoolOp { op: BoolOp, values: Vec<Expr> },

    BinOp { left: Box<Expr>, op: Operator, right: Box<Expr> },

    UnaryOp { op: UnaryOp, operand: Box<Expr> },

    Lambda { args: Box<Arguments>, body: Box<Expr> },

    /// `body if test else orelse`.
    IfExp { test: Box<Expr>, body: Box<Expr>, orelse: Box<Expr> },

    Dict { keys: Vec<Expr>, values: Vec<Expr> },

    Set(Vec<Expr>),

    ListComp { elt: Box<Expr>, generators: Vec<Comprehension> },

    Yield(Option<Box<Expr>>),

    /// `left op0 c0 op1 c1 ...`; `ops` and `comparators` have equal length.
    Compare { left: Box<Expr>, ops: Vec<CmpOp>, comparators: Vec<Expr> },

    Call { func: Box<Expr>, args: Vec<Expr>, keywords: Vec<Keyword> },

    Constant(Constant),

    Attribute { value: Box<Expr>, attr: String, ctx: ExprContext },

    Subscript { value: Box<Expr>, slice: Box<Expr>, ctx: ExprContext },

    Slice { lower: Option<Box<Expr>>, upper: Option<Box<Expr>>, step: Option<Box<Expr>> },

    Name { id: String, ctx: ExprContext },

    List { elts: Vec<Expr>, ctx: ExprContext },

    Tuple { elts: Vec<Expr>, ctx: ExprContext },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprContext {
    Load,
    Store,
    Del,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    FloorDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Invert,
    Not,
    UAdd,
    USub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

/// One `for target in iter if cond...` clause of a comprehension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptHandler {
    /// `None` for a bare `except:`.
    pub typ: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
    pub lineno: u32,
}

/// Parameter list of a function or lambda.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    pub posonlyargs: Vec<Arg>,
    pub args: Vec<Arg>,
    pub vararg: Option<Arg>,
    pub kwonlyargs: Vec<Arg>,
    /// One slot per keyword-only argument; `None` when it has no default.
    pub kw_defaults: Vec<Option<Expr>>,
    pub kwarg: Option<Arg>,
    /// Defaults for the last `defaults.len()` positional parameters.
    pub defaults: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    pub arg: String,
    pub annotation: Option<Box<Expr>>,
}

impl Arg {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            arg: name.into(),
            annotation: None,
        }
    }
}

/// `name=value` in a call or class definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub arg: String,
    pub value: Expr,
}

/// `name as asname` in an import statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
}

/// Return the docstring of a body: a leading string-constant expression.
pub fn docstring(body: &[Stmt]) -> Option<&str> {
    match body.first().map(|s| &s.kind) {
        Some(StmtKind::Expr(Expr {
            kind: ExprKind::Constant(Constant::Str(doc)),
            ..
        })) => Some(doc),
        _ => None,
    }
}
