use crate::bytecode::CodeObject;
use serde::{Deserialize, Serialize};

/// Compile-time constant value.
///
/// Constants appear both in the AST (literals handed over by the front end)
/// and in the constant table of a finished [`CodeObject`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,

    Ellipsis,

    Bool(bool),

    /// 64-bit signed integer.
    Int(i64),

    /// 64-bit floating-point number.
    Float(f64),

    Complex { real: f64, imag: f64 },

    /// UTF-8 string.
    Str(String),

    Bytes(Vec<u8>),

    /// Tuple of constants (keyword-name tuples, from-import lists).
    Tuple(Vec<Constant>),

    /// A nested, already assembled scope.
    Code(Box<CodeObject>),
}

/// Canonical deduplication key for a [`Constant`].
///
/// Keys are type-tagged, so `1`, `1.0` and `True` never merge. Floats are
/// compared by bit pattern, which keeps `0.0` and `-0.0` apart and lets a
/// NaN literal deduplicate with itself. Code objects are keyed by serial.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantKey {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(u64),
    Complex(u64, u64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<ConstantKey>),
    Code(u32),
}

impl Constant {
    pub fn key(&self) -> ConstantKey {
        match self {
            Constant::None => ConstantKey::None,
            Constant::Ellipsis => ConstantKey::Ellipsis,
            Constant::Bool(b) => ConstantKey::Bool(*b),
            Constant::Int(n) => ConstantKey::Int(*n),
            Constant::Float(f) => ConstantKey::Float(f.to_bits()),
            Constant::Complex { real, imag } => ConstantKey::Complex(real.to_bits(), imag.to_bits()),
            Constant::Str(s) => ConstantKey::Str(s.clone()),
            Constant::Bytes(b) => ConstantKey::Bytes(b.clone()),
            Constant::Tuple(items) => ConstantKey::Tuple(items.iter().map(Constant::key).collect()),
            Constant::Code(code) => ConstantKey::Code(code.serial),
        }
    }

    pub fn str(s: impl Into<String>) -> Self {
        Constant::Str(s.into())
    }

    pub fn as_code(&self) -> Option<&CodeObject> {
        match self {
            Constant::Code(code) => Some(code),
            _ => None,
        }
    }
}

impl std::fmt::Display for Constant {
    /// Format a constant using Python literal syntax.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::None => write!(f, "None"),
            Constant::Ellipsis => write!(f, "Ellipsis"),
            Constant::Bool(true) => write!(f, "True"),
            Constant::Bool(false) => write!(f, "False"),
            Constant::Int(n) => write!(f, "{}", n),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::Complex { real, imag } => {
                if *real == 0.0 {
                    write!(f, "{:?}j", imag)
                } else {
                    write!(f, "({:?}{:+?}j)", real, imag)
                }
            }
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Constant::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Constant::Code(code) => write!(f, "<code object {}>", code.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_type_tagged() {
        assert_ne!(Constant::Int(1).key(), Constant::Float(1.0).key());
        assert_ne!(Constant::Int(1).key(), Constant::Bool(true).key());
        assert_eq!(Constant::Int(7).key(), Constant::Int(7).key());
    }

    #[test]
    fn test_signed_zero_stays_distinct() {
        assert_ne!(Constant::Float(0.0).key(), Constant::Float(-0.0).key());
    }

    #[test]
    fn test_nan_deduplicates_with_itself() {
        let nan = Constant::Float(f64::NAN);
        assert_eq!(nan.key(), nan.clone().key());
    }

    #[test]
    fn test_tuple_key_is_structural() {
        let a = Constant::Tuple(vec![Constant::str("x"), Constant::Int(1)]);
        let b = Constant::Tuple(vec![Constant::str("x"), Constant::Int(1)]);
        let c = Constant::Tuple(vec![Constant::str("x"), Constant::Float(1.0)]);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_display_literals() {
        assert_eq!(Constant::None.to_string(), "None");
        assert_eq!(Constant::Bool(true).to_string(), "True");
        assert_eq!(Constant::str("hi").to_string(), "\"hi\"");
        assert_eq!(Constant::Tuple(vec![Constant::Int(1)]).to_string(), "(1,)");
        assert_eq!(Constant::Float(2.5).to_string(), "2.5");
    }
}
