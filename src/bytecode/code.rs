use crate::lang::constant::Constant;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Code object flags, numbered for the downstream VM.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CodeFlags: u32 {
        const OPTIMIZED = 0x0001;
        const NEWLOCALS = 0x0002;
        const VARARGS = 0x0004;
        const VARKEYWORDS = 0x0008;
        const NESTED = 0x0010;
        const GENERATOR = 0x0020;
        const NOFREE = 0x0040;
    }
}

/// Byte range `[start, end)` of the bytecode produced for one source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTableEntry {
    pub start: u32,
    pub end: u32,
    pub line: u32,
}

/// The immutable compiled artifact of one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub firstlineno: u32,
    pub flags: CodeFlags,

    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub stacksize: u32,

    /// Identity of this scope within one compile.
    pub serial: u32,

    pub constants: Vec<Constant>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,

    /// Wordcode.
    pub code: Vec<u8>,
    pub linetable: Vec<LineTableEntry>,
}

impl CodeObject {
    /// Source line of the instruction at byte `offset`.
    pub fn line_for_offset(&self, offset: u32) -> Option<u32> {
        self.linetable
            .iter()
            .find(|e| e.start <= offset && offset < e.end)
            .map(|e| e.line)
    }

    pub fn name_slot(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn varname_slot(&self, name: &str) -> Option<usize> {
        self.varnames.iter().position(|n| n == name)
    }

    /// Deref slot: cell variables first, then free variables.
    pub fn deref_slot(&self, name: &str) -> Option<usize> {
        self.cellvars.iter().position(|n| n == name).or_else(|| {
            self.freevars
                .iter()
                .position(|n| n == name)
                .map(|i| i + self.cellvars.len())
        })
    }

    /// Name for a `LOAD_DEREF`-family operand.
    pub fn deref_name(&self, slot: usize) -> Option<&str> {
        match slot.checked_sub(self.cellvars.len()) {
            None => self.cellvars.get(slot),
            Some(free) => self.freevars.get(free),
        }
        .map(String::as_str)
    }

    /// Nested code objects in constant-table order.
    pub fn nested(&self) -> impl Iterator<Item = &CodeObject> {
        self.constants.iter().filter_map(Constant::as_code)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CodeObject {
        CodeObject {
            name: "f".to_string(),
            qualname: "f".to_string(),
            filename: "<test>".to_string(),
            firstlineno: 1,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            argcount: 1,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            stacksize: 1,
            serial: 1,
            constants: vec![Constant::None, Constant::Float(-0.0)],
            names: vec![],
            varnames: vec!["x".to_string()],
            cellvars: vec!["c".to_string()],
            freevars: vec!["a".to_string(), "b".to_string()],
            code: vec![100, 0, 83, 0],
            linetable: vec![
                LineTableEntry { start: 0, end: 2, line: 1 },
                LineTableEntry { start: 2, end: 4, line: 2 },
            ],
        }
    }

    #[test]
    fn test_line_for_offset() {
        let code = sample();
        assert_eq!(code.line_for_offset(0), Some(1));
        assert_eq!(code.line_for_offset(3), Some(2));
        assert_eq!(code.line_for_offset(4), None);
    }

    #[test]
    fn test_deref_slots_follow_cells() {
        let code = sample();
        assert_eq!(code.deref_slot("c"), Some(0));
        assert_eq!(code.deref_slot("b"), Some(2));
        assert_eq!(code.deref_name(1), Some("a"));
        assert_eq!(code.deref_name(3), None);
    }

    #[test]
    fn test_postcard_roundtrip() {
        let code = sample();
        let bytes = code.to_bytes().unwrap();
        let back = CodeObject::from_bytes(&bytes).unwrap();
        assert_eq!(back, code);
        assert!(back.flags.contains(CodeFlags::NEWLOCALS));
    }
}
