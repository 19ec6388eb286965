use serde::{Deserialize, Serialize};

// =============================================================================
// OPCODE - Wordcode operation numbers
// =============================================================================

/// Opcodes at or above this value carry an operand.
pub const HAVE_ARGUMENT: u8 = 90;

macro_rules! opcodes {
    ($($name:ident = $value:literal,)*) => {
        /// Operation code, numbered for the downstream wordcode VM.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            /// Mnemonic as printed by the disassembler.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }

        impl TryFrom<u8> for Opcode {
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, Self::Error> {
                match byte {
                    $($value => Ok(Opcode::$name),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    // no operand
    POP_TOP = 1,
    ROT_TWO = 2,
    ROT_THREE = 3,
    DUP_TOP = 4,
    DUP_TOP_TWO = 5,
    ROT_FOUR = 6,
    NOP = 9,
    UNARY_POSITIVE = 10,
    UNARY_NEGATIVE = 11,
    UNARY_NOT = 12,
    UNARY_INVERT = 15,
    BINARY_MATRIX_MULTIPLY = 16,
    INPLACE_MATRIX_MULTIPLY = 17,
    BINARY_POWER = 19,
    BINARY_MULTIPLY = 20,
    BINARY_MODULO = 22,
    BINARY_ADD = 23,
    BINARY_SUBTRACT = 24,
    BINARY_SUBSCR = 25,
    BINARY_FLOOR_DIVIDE = 26,
    BINARY_TRUE_DIVIDE = 27,
    INPLACE_FLOOR_DIVIDE = 28,
    INPLACE_TRUE_DIVIDE = 29,
    RERAISE = 48,
    WITH_EXCEPT_START = 49,
    GET_AITER = 50,
    GET_ANEXT = 51,
    BEFORE_ASYNC_WITH = 52,
    END_ASYNC_FOR = 54,
    INPLACE_ADD = 55,
    INPLACE_SUBTRACT = 56,
    INPLACE_MULTIPLY = 57,
    INPLACE_MODULO = 59,
    STORE_SUBSCR = 60,
    DELETE_SUBSCR = 61,
    BINARY_LSHIFT = 62,
    BINARY_RSHIFT = 63,
    BINARY_AND = 64,
    BINARY_XOR = 65,
    BINARY_OR = 66,
    INPLACE_POWER = 67,
    GET_ITER = 68,
    GET_YIELD_FROM_ITER = 69,
    PRINT_EXPR = 70,
    LOAD_BUILD_CLASS = 71,
    YIELD_FROM = 72,
    GET_AWAITABLE = 73,
    LOAD_ASSERTION_ERROR = 74,
    INPLACE_LSHIFT = 75,
    INPLACE_RSHIFT = 76,
    INPLACE_AND = 77,
    INPLACE_XOR = 78,
    INPLACE_OR = 79,
    LIST_TO_TUPLE = 82,
    RETURN_VALUE = 83,
    IMPORT_STAR = 84,
    SETUP_ANNOTATIONS = 85,
    YIELD_VALUE = 86,
    POP_BLOCK = 87,
    POP_EXCEPT = 89,

    // operand
    STORE_NAME = 90,
    DELETE_NAME = 91,
    UNPACK_SEQUENCE = 92,
    FOR_ITER = 93,
    UNPACK_EX = 94,
    STORE_ATTR = 95,
    DELETE_ATTR = 96,
    STORE_GLOBAL = 97,
    DELETE_GLOBAL = 98,
    LOAD_CONST = 100,
    LOAD_NAME = 101,
    BUILD_TUPLE = 102,
    BUILD_LIST = 103,
    BUILD_SET = 104,
    BUILD_MAP = 105,
    LOAD_ATTR = 106,
    COMPARE_OP = 107,
    IMPORT_NAME = 108,
    IMPORT_FROM = 109,
    JUMP_FORWARD = 110,
    JUMP_IF_FALSE_OR_POP = 111,
    JUMP_IF_TRUE_OR_POP = 112,
    JUMP_ABSOLUTE = 113,
    POP_JUMP_IF_FALSE = 114,
    POP_JUMP_IF_TRUE = 115,
    LOAD_GLOBAL = 116,
    IS_OP = 117,
    CONTAINS_OP = 118,
    JUMP_IF_NOT_EXC_MATCH = 121,
    SETUP_FINALLY = 122,
    LOAD_FAST = 124,
    STORE_FAST = 125,
    DELETE_FAST = 126,
    RAISE_VARARGS = 130,
    CALL_FUNCTION = 131,
    MAKE_FUNCTION = 132,
    BUILD_SLICE = 133,
    LOAD_CLOSURE = 135,
    LOAD_DEREF = 136,
    STORE_DEREF = 137,
    DELETE_DEREF = 138,
    CALL_FUNCTION_KW = 141,
    CALL_FUNCTION_EX = 142,
    SETUP_WITH = 143,
    EXTENDED_ARG = 144,
    LIST_APPEND = 145,
    SET_ADD = 146,
    MAP_ADD = 147,
    LOAD_CLASSDEREF = 148,
    SETUP_ASYNC_WITH = 154,
    FORMAT_VALUE = 155,
    BUILD_CONST_KEY_MAP = 156,
    BUILD_STRING = 157,
    LOAD_METHOD = 160,
    CALL_METHOD = 161,
    LIST_EXTEND = 162,
    SET_UPDATE = 163,
    DICT_MERGE = 164,
    DICT_UPDATE = 165,
}

/// `MAKE_FUNCTION` operand bits.
pub mod make_function {
    pub const DEFAULTS: u32 = 0x01;
    pub const KW_DEFAULTS: u32 = 0x02;
    pub const ANNOTATIONS: u32 = 0x04;
    pub const CLOSURE: u32 = 0x08;
}

/// `COMPARE_OP` operands.
pub const COMPARE_OPS: [&str; 6] = ["<", "<=", "==", "!=", ">", ">="];

impl Opcode {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn has_arg(self) -> bool {
        self.byte() >= HAVE_ARGUMENT
    }

    /// Operand names a block until assembly resolves it to an offset.
    pub fn is_jump(self) -> bool {
        self.is_relative_jump() || self.is_absolute_jump()
    }

    pub fn is_absolute_jump(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            JUMP_ABSOLUTE
                | POP_JUMP_IF_FALSE
                | POP_JUMP_IF_TRUE
                | JUMP_IF_FALSE_OR_POP
                | JUMP_IF_TRUE_OR_POP
                | JUMP_IF_NOT_EXC_MATCH
        )
    }

    /// Operand is a forward distance from the end of the instruction.
    pub fn is_relative_jump(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            JUMP_FORWARD | FOR_ITER | SETUP_FINALLY | SETUP_WITH | SETUP_ASYNC_WITH
        )
    }

    pub fn is_unconditional_jump(self) -> bool {
        matches!(self, Opcode::JUMP_ABSOLUTE | Opcode::JUMP_FORWARD)
    }

    /// Leaves the frame (or unwinds) without falling through.
    pub fn is_scope_exit(self) -> bool {
        matches!(
            self,
            Opcode::RETURN_VALUE | Opcode::RAISE_VARARGS | Opcode::RERAISE
        )
    }

    /// Nothing can follow this instruction in the same block.
    pub fn is_terminal(self) -> bool {
        self.is_scope_exit() || self.is_unconditional_jump()
    }

    /// Net stack effect; `jump` selects the branch-taken edge.
    pub fn stack_effect(self, arg: u32, jump: bool) -> i32 {
        use Opcode::*;
        let n = arg as i32;
        match self {
            NOP | EXTENDED_ARG => 0,
            POP_TOP => -1,
            ROT_TWO | ROT_THREE | ROT_FOUR => 0,
            DUP_TOP => 1,
            DUP_TOP_TWO => 2,

            UNARY_POSITIVE | UNARY_NEGATIVE | UNARY_NOT | UNARY_INVERT => 0,

            BINARY_MATRIX_MULTIPLY | INPLACE_MATRIX_MULTIPLY | BINARY_POWER
            | BINARY_MULTIPLY | BINARY_MODULO | BINARY_ADD | BINARY_SUBTRACT
            | BINARY_SUBSCR | BINARY_FLOOR_DIVIDE | BINARY_TRUE_DIVIDE
            | INPLACE_FLOOR_DIVIDE | INPLACE_TRUE_DIVIDE | INPLACE_ADD
            | INPLACE_SUBTRACT | INPLACE_MULTIPLY | INPLACE_MODULO | BINARY_LSHIFT
            | BINARY_RSHIFT | BINARY_AND | BINARY_XOR | BINARY_OR | INPLACE_POWER
            | INPLACE_LSHIFT | INPLACE_RSHIFT | INPLACE_AND | INPLACE_XOR
            | INPLACE_OR => -1,

            STORE_SUBSCR => -3,
            DELETE_SUBSCR => -2,

            GET_ITER | GET_YIELD_FROM_ITER | GET_AWAITABLE | GET_AITER => 0,
            GET_ANEXT | BEFORE_ASYNC_WITH => 1,
            END_ASYNC_FOR => -7,
            PRINT_EXPR => -1,
            LOAD_BUILD_CLASS | LOAD_ASSERTION_ERROR => 1,
            RETURN_VALUE | IMPORT_STAR => -1,
            SETUP_ANNOTATIONS => 0,
            YIELD_VALUE => 0,
            YIELD_FROM => -1,
            POP_BLOCK => 0,
            POP_EXCEPT => -3,
            RERAISE => -3,
            WITH_EXCEPT_START => 1,
            LIST_TO_TUPLE => 0,

            STORE_NAME | STORE_GLOBAL | STORE_FAST | STORE_DEREF => -1,
            DELETE_NAME | DELETE_GLOBAL | DELETE_FAST | DELETE_DEREF => 0,
            LOAD_CONST | LOAD_NAME | LOAD_GLOBAL | LOAD_FAST | LOAD_CLOSURE
            | LOAD_DEREF | LOAD_CLASSDEREF | LOAD_METHOD => 1,

            UNPACK_SEQUENCE => n - 1,
            UNPACK_EX => (n & 0xFF) + (n >> 8),
            FOR_ITER => {
                if jump {
                    -1
                } else {
                    1
                }
            }

            STORE_ATTR => -2,
            DELETE_ATTR => -1,
            LOAD_ATTR => 0,

            BUILD_TUPLE | BUILD_LIST | BUILD_SET | BUILD_STRING => 1 - n,
            BUILD_MAP => 1 - 2 * n,
            BUILD_CONST_KEY_MAP => -n,
            LIST_APPEND | SET_ADD => -1,
            MAP_ADD => -2,
            LIST_EXTEND | SET_UPDATE | DICT_MERGE | DICT_UPDATE => -1,

            COMPARE_OP | IS_OP | CONTAINS_OP => -1,
            JUMP_IF_NOT_EXC_MATCH => -2,
            IMPORT_NAME => -1,
            IMPORT_FROM => 1,

            JUMP_FORWARD | JUMP_ABSOLUTE => 0,
            JUMP_IF_TRUE_OR_POP | JUMP_IF_FALSE_OR_POP => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            POP_JUMP_IF_FALSE | POP_JUMP_IF_TRUE => -1,

            SETUP_FINALLY => {
                if jump {
                    6
                } else {
                    0
                }
            }
            SETUP_WITH => {
                if jump {
                    6
                } else {
                    1
                }
            }
            SETUP_ASYNC_WITH => {
                if jump {
                    5
                } else {
                    0
                }
            }

            RAISE_VARARGS => -n,
            CALL_FUNCTION => -n,
            CALL_METHOD => -n - 1,
            CALL_FUNCTION_KW => -n - 1,
            CALL_FUNCTION_EX => -1 - (n & 0x01),
            MAKE_FUNCTION => -1 - (arg & 0x0F).count_ones() as i32,
            BUILD_SLICE => {
                if n == 3 {
                    -2
                } else {
                    -1
                }
            }
            FORMAT_VALUE => {
                if n & 0x04 == 0x04 {
                    -1
                } else {
                    0
                }
            }
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
