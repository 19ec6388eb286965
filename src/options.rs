use serde::{Deserialize, Serialize};

/// Settings for one compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Recorded in every produced code object.
    pub filename: String,
    /// 0 keeps everything, 1 drops `assert`, 2 also drops docstrings.
    pub optimize: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            filename: "<string>".to_string(),
            optimize: 0,
        }
    }
}

impl CompileOptions {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    pub fn with_optimize(mut self, level: u8) -> Self {
        self.optimize = level;
        self
    }

    pub fn strips_asserts(&self) -> bool {
        self.optimize >= 1
    }

    pub fn strips_docstrings(&self) -> bool {
        self.optimize >= 2
    }
}
