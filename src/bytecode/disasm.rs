use std::{collections::HashSet, fmt};

use crate::bytecode::{CodeObject, DecodeError, Opcode, op::COMPARE_OPS};

/// One instruction re-scanned from wordcode, `EXTENDED_ARG` prefixes folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Byte offset of the first prefix (or of the instruction itself).
    pub offset: u32,
    /// Bytes covered, prefixes included.
    pub size: u32,
    pub opcode: Opcode,
    pub arg: u32,
}

impl DecodedInstruction {
    /// Absolute byte offset this instruction may jump to.
    pub fn jump_target(&self) -> Option<u32> {
        if self.opcode.is_absolute_jump() {
            Some(self.arg)
        } else if self.opcode.is_relative_jump() {
            Some(self.offset + self.size + self.arg)
        } else {
            None
        }
    }
}

/// Split a wordcode buffer back into instructions.
pub fn decode(code: &[u8]) -> Result<Vec<DecodedInstruction>, DecodeError> {
    if code.len() % 2 != 0 {
        return Err(DecodeError::OddLength(code.len()));
    }

    let mut instructions = Vec::with_capacity(code.len() / 2);
    let mut extended: u32 = 0;
    let mut prefix_start: Option<usize> = None;

    for (i, unit) in code.chunks_exact(2).enumerate() {
        let offset = i * 2;
        let opcode =
            Opcode::try_from(unit[0]).map_err(|byte| DecodeError::UnknownOpcode { offset, byte })?;
        let arg = (extended << 8) | u32::from(unit[1]);
        let start = *prefix_start.get_or_insert(offset);

        if opcode == Opcode::EXTENDED_ARG {
            extended = arg;
            continue;
        }

        instructions.push(DecodedInstruction {
            offset: start as u32,
            size: (offset + 2 - start) as u32,
            opcode,
            arg,
        });
        extended = 0;
        prefix_start = None;
    }

    if let Some(start) = prefix_start {
        return Err(DecodeError::DanglingExtendedArg(start));
    }
    Ok(instructions)
}

/// Human-readable listing of a code object and everything nested in it.
pub struct Disassembly<'a>(pub &'a CodeObject);

impl fmt::Display for Disassembly<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_code(f, self.0, 0)
    }
}

pub fn disassemble(code: &CodeObject) -> String {
    Disassembly(code).to_string()
}

/// Print the disassembly of a code object to stdout.
pub fn print(code: &CodeObject) {
    println!("{}", Disassembly(code));
}

fn write_code(f: &mut fmt::Formatter<'_>, code: &CodeObject, indent: usize) -> fmt::Result {
    let prefix = "  ".repeat(indent);

    writeln!(f, "{}════════════════════════════════════════", prefix)?;
    writeln!(f, "{} {} ({}:{})", prefix, code.qualname, code.filename, code.firstlineno)?;
    writeln!(
        f,
        "{} args: {} posonly: {} kwonly: {}  stack: {}  flags: {:?}",
        prefix, code.argcount, code.posonlyargcount, code.kwonlyargcount, code.stacksize, code.flags
    )?;
    writeln!(f, "{}════════════════════════════════════════", prefix)?;

    let instructions = match decode(&code.code) {
        Ok(instructions) => instructions,
        Err(e) => return writeln!(f, "{}<{}>", prefix, e),
    };
    let targets: HashSet<u32> = instructions
        .iter()
        .filter_map(DecodedInstruction::jump_target)
        .collect();

    let mut last_line = None;
    for instr in &instructions {
        let line = code.line_for_offset(instr.offset);
        let line_col = match line {
            Some(l) if line != last_line => format!("{:>4}", l),
            _ => "    ".to_string(),
        };
        last_line = line;

        let marker = if targets.contains(&instr.offset) { "►" } else { " " };
        writeln!(
            f,
            "{}{} {:04} {} {:<22}{}",
            prefix,
            line_col,
            instr.offset,
            marker,
            instr.opcode.name(),
            operand(code, instr)
        )?;
    }
    writeln!(f)?;

    for nested in code.nested() {
        write_code(f, nested, indent + 1)?;
    }
    Ok(())
}

fn operand(code: &CodeObject, instr: &DecodedInstruction) -> String {
    use Opcode::*;

    if !instr.opcode.has_arg() {
        return String::new();
    }
    let slot = instr.arg as usize;
    let detail = match instr.opcode {
        LOAD_CONST => code.constants.get(slot).map(|c| c.to_string()),
        LOAD_NAME | STORE_NAME | DELETE_NAME | LOAD_GLOBAL | STORE_GLOBAL | DELETE_GLOBAL
        | LOAD_ATTR | STORE_ATTR | DELETE_ATTR | LOAD_METHOD | IMPORT_NAME | IMPORT_FROM => {
            code.names.get(slot).cloned()
        }
        LOAD_FAST | STORE_FAST | DELETE_FAST => code.varnames.get(slot).cloned(),
        LOAD_DEREF | STORE_DEREF | DELETE_DEREF | LOAD_CLOSURE | LOAD_CLASSDEREF => {
            code.deref_name(slot).map(str::to_string)
        }
        COMPARE_OP => COMPARE_OPS.get(slot).map(|s| s.to_string()),
        IS_OP => Some(if slot == 0 { "is" } else { "is not" }.to_string()),
        CONTAINS_OP => Some(if slot == 0 { "in" } else { "not in" }.to_string()),
        _ => instr.jump_target().map(|t| format!("to {}", t)),
    };

    match detail {
        Some(detail) => format!("{} ({})", instr.arg, detail),
        None => instr.arg.to_string(),
    }
}
