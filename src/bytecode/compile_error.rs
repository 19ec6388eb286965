use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Internal compiler error (a defect in the backend, never in user source)
    #[error("compile error: internal error{}: {message}", context(.scope, .line))]
    Internal {
        message: String,
        scope: Option<String>,
        line: Option<u32>,
    },

    /// A top-level input kind this backend refuses to compile
    #[error("compile error: unsupported mode '{mode}'\n  hint: only module and expression input can be compiled")]
    UnsupportedMode { mode: String },

    /// A node that's valid but appeared in an invalid position
    #[error("compile error: '{node_type}' {reason} (line {line})")]
    InvalidPosition {
        node_type: String,
        reason: String,
        line: u32,
    },
}

fn context(scope: &Option<String>, line: &Option<u32>) -> String {
    match (scope, line) {
        (Some(s), Some(l)) => format!(" in '{}' at line {}", s, l),
        (Some(s), None) => format!(" in '{}'", s),
        (None, Some(l)) => format!(" at line {}", l),
        (None, None) => String::new(),
    }
}

impl CompileError {
    /// Create an internal compiler error
    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal {
            message: msg.into(),
            scope: None,
            line: None,
        }
    }

    pub fn unsupported_mode(mode: impl Into<String>) -> Self {
        CompileError::UnsupportedMode { mode: mode.into() }
    }

    pub fn invalid_position(node_type: &str, reason: &str, line: u32) -> Self {
        CompileError::InvalidPosition {
            node_type: node_type.to_string(),
            reason: reason.to_string(),
            line,
        }
    }

    pub fn break_outside_loop(line: u32) -> Self {
        Self::invalid_position("break", "outside loop", line)
    }

    pub fn continue_outside_loop(line: u32) -> Self {
        Self::invalid_position("continue", "not properly in loop", line)
    }

    pub fn return_outside_function(line: u32) -> Self {
        Self::invalid_position("return", "outside function", line)
    }

    pub fn yield_outside_function(line: u32) -> Self {
        Self::invalid_position("yield", "outside function", line)
    }

    pub fn default_except_not_last(line: u32) -> Self {
        Self::invalid_position("except", "default 'except:' must be last", line)
    }

    /// Attach the scope name and line to an internal error that has none yet.
    pub fn with_context(self, scope_name: &str, lineno: u32) -> Self {
        match self {
            CompileError::Internal {
                message,
                scope: None,
                line,
            } => CompileError::Internal {
                message,
                scope: Some(scope_name.to_string()),
                line: line.or(Some(lineno).filter(|&l| l > 0)),
            },
            other => other,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal { .. })
    }
}

/// Failure to re-scan an assembled bytecode buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("decode error: bytecode length {0} is not a whole number of code units")]
    OddLength(usize),

    #[error("decode error: unknown opcode {byte} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("decode error: EXTENDED_ARG at offset {0} is not followed by an instruction")]
    DanglingExtendedArg(usize),
}
