use crate::bytecode::{CompileError, CompileResult, Opcode};

/// Index of a block inside its unit's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

impl BlockIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single instruction before assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Operand; replaced by the resolved offset for jumps during assembly.
    pub arg: u32,
    /// Target block of a jump.
    pub target: Option<BlockIdx>,
    /// Source line, 0 when not stamped.
    pub lineno: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, arg: u32) -> CompileResult<Self> {
        if !opcode.has_arg() && arg != 0 {
            return Err(CompileError::internal(format!(
                "{} takes no operand, got {}",
                opcode, arg
            )));
        }
        Ok(Self {
            opcode,
            arg,
            target: None,
            lineno: 0,
        })
    }

    pub fn jump(opcode: Opcode, target: BlockIdx) -> CompileResult<Self> {
        if !opcode.is_jump() {
            return Err(CompileError::internal(format!(
                "{} cannot take a block target",
                opcode
            )));
        }
        Ok(Self {
            opcode,
            arg: 0,
            target: Some(target),
            lineno: 0,
        })
    }

    pub fn is_jump(&self) -> bool {
        self.target.is_some()
    }

    /// Encoded width in bytes, including `EXTENDED_ARG` prefixes.
    pub fn size(&self) -> u32 {
        code_units(self.arg) * 2
    }
}

/// Number of two-byte units needed to carry `arg`.
pub fn code_units(arg: u32) -> u32 {
    match arg {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// A basic block.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub instructions: Vec<Instruction>,
    /// Fall-through successor.
    pub next: Option<BlockIdx>,
    /// Set by the reachability pass.
    pub reachable: bool,
    /// Ends in a return, raise or unconditional jump; closed to new instructions.
    pub terminal: bool,
}

impl Block {
    /// Append `instr`, closing the block if it never falls through.
    pub fn push(&mut self, instr: Instruction) {
        if instr.opcode.is_terminal() {
            self.terminal = true;
        }
        self.instructions.push(instr);
    }

    pub fn size(&self) -> u32 {
        self.instructions.iter().map(Instruction::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_operand_opcode_rejects_operand() {
        let err = Instruction::new(Opcode::POP_TOP, 1).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("POP_TOP"));
    }

    #[test]
    fn test_operand_opcode_accepts_zero() {
        let instr = Instruction::new(Opcode::LOAD_CONST, 0).unwrap();
        assert_eq!(instr.size(), 2);
    }

    #[test]
    fn test_sizes_grow_with_operand() {
        assert_eq!(code_units(0xFF), 1);
        assert_eq!(code_units(0x100), 2);
        assert_eq!(code_units(0xFFFF), 2);
        assert_eq!(code_units(0x1_0000), 3);
        assert_eq!(code_units(0x100_0000), 4);
    }

    #[test]
    fn test_jump_requires_jump_opcode() {
        assert!(Instruction::jump(Opcode::LOAD_NAME, BlockIdx(0)).is_err());
        let instr = Instruction::jump(Opcode::JUMP_ABSOLUTE, BlockIdx(3)).unwrap();
        assert!(instr.is_jump());
    }

    #[test]
    fn test_terminal_instruction_closes_block() {
        let mut block = Block::default();
        block.push(Instruction::new(Opcode::LOAD_CONST, 0).unwrap());
        assert!(!block.terminal);
        block.push(Instruction::new(Opcode::RETURN_VALUE, 0).unwrap());
        assert!(block.terminal);
        assert_eq!(block.size(), 4);
    }
}
