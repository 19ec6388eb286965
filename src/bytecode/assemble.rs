use tracing::{debug, trace};

use crate::{
    bytecode::{
        BlockIdx, CodeObject, CompilationUnit, CompileError, CompileResult, LineTableEntry,
        Opcode, ir::code_units, stack_depth::max_stack_depth,
    },
    lang::constant::Constant,
};

// =============================================================================
// ASSEMBLER - Block graph to wordcode
// =============================================================================

/// Freeze `unit` into a code object.
///
/// A unit whose current block can still fall through gets an implicit
/// `return None` (or a bare `RETURN_VALUE` when `add_none` is false, for
/// expression input whose value is already on the stack).
pub fn assemble(mut unit: CompilationUnit, add_none: bool, filename: &str) -> CompileResult<CodeObject> {
    if !unit.current_block().terminal {
        unit.use_next_block(None);
        if add_none {
            unit.load_const(Constant::None)?;
        }
        unit.emit(Opcode::RETURN_VALUE, 0)?;
    }

    if unit.firstlineno == 0 {
        unit.firstlineno = unit
            .block(unit.entry)
            .instructions
            .first()
            .map(|i| i.lineno)
            .filter(|&l| l > 0)
            .unwrap_or(1);
    }

    mark_reachable(&mut unit);
    let order = layout(&unit)?;
    let offsets = resolve_jumps(&mut unit, &order)?;
    let stacksize = max_stack_depth(&unit.blocks, unit.entry)?;
    let (code, linetable) = emit(&unit, &order, &offsets)?;

    debug!(
        scope = %unit.qualname,
        blocks = order.len(),
        bytes = code.len(),
        stacksize,
        "assembled code object"
    );

    let flags = unit.flags();
    Ok(CodeObject {
        name: unit.name,
        qualname: unit.qualname,
        filename: filename.to_string(),
        firstlineno: unit.firstlineno,
        flags,
        argcount: unit.argcount,
        posonlyargcount: unit.posonlyargcount,
        kwonlyargcount: unit.kwonlyargcount,
        stacksize,
        serial: unit.serial,
        constants: unit.constants.into_values().collect(),
        names: unit.names.into_iter().collect(),
        varnames: unit.varnames.into_iter().collect(),
        cellvars: unit.cellvars.into_iter().collect(),
        freevars: unit.freevars.into_iter().collect(),
        code,
        linetable,
    })
}

// =============================================================================
// Reachability
// =============================================================================

/// Depth-first walk from the entry block. Fall-through is followed only out
/// of blocks that can fall through; every jump target is followed.
fn mark_reachable(unit: &mut CompilationUnit) {
    let mut stack = vec![unit.entry];
    while let Some(idx) = stack.pop() {
        let block = &mut unit.blocks[idx.index()];
        if block.reachable {
            continue;
        }
        block.reachable = true;

        for instr in block.instructions.iter().rev() {
            if let Some(target) = instr.target {
                stack.push(target);
            }
        }
        if !block.terminal {
            if let Some(next) = block.next {
                stack.push(next);
            }
        }
    }
}

// =============================================================================
// Layout
// =============================================================================

/// Emission order: the fall-through chain from the entry block, then the
/// chains of any reachable blocks left over, in creation order.
fn layout(unit: &CompilationUnit) -> CompileResult<Vec<BlockIdx>> {
    let mut placed = vec![false; unit.blocks.len()];
    let mut order = Vec::new();

    place_chain(unit, unit.entry, &mut placed, &mut order);
    for i in 0..unit.blocks.len() {
        if unit.blocks[i].reachable && !placed[i] {
            place_chain(unit, BlockIdx(i as u32), &mut placed, &mut order);
        }
    }

    for (i, block) in unit.blocks.iter().enumerate() {
        if !block.reachable && !block.instructions.is_empty() {
            trace!(scope = %unit.name, block = i, "excluding unreachable block");
        }
    }

    // Every block that can fall through must be followed by its successor.
    for (pos, &idx) in order.iter().enumerate() {
        let block = unit.block(idx);
        if block.terminal {
            continue;
        }
        if let Some(next) = block.next {
            if order.get(pos + 1) != Some(&next) {
                return Err(CompileError::internal(format!(
                    "block {} falls through to block {} which is not laid out after it",
                    idx.0, next.0
                )));
            }
        }
    }

    Ok(order)
}

fn place_chain(unit: &CompilationUnit, start: BlockIdx, placed: &mut [bool], order: &mut Vec<BlockIdx>) {
    let mut cursor = Some(start);
    while let Some(idx) = cursor {
        if placed[idx.index()] {
            break;
        }
        placed[idx.index()] = true;
        let block = unit.block(idx);
        if block.reachable {
            order.push(idx);
        }
        cursor = block.next;
    }
}

// =============================================================================
// Offsets and jump patching
// =============================================================================

/// Assign byte offsets and patch jump operands, repeating until no operand
/// changes width. Returns the start offset of every block (indexed by block).
fn resolve_jumps(unit: &mut CompilationUnit, order: &[BlockIdx]) -> CompileResult<Vec<Option<u32>>> {
    loop {
        let mut offsets = vec![None; unit.blocks.len()];
        let mut total = 0;
        for &idx in order {
            offsets[idx.index()] = Some(total);
            total += unit.block(idx).size();
        }

        let mut widened = false;
        for &idx in order {
            let mut pos = offsets[idx.index()].unwrap_or(0);
            for instr in &mut unit.blocks[idx.index()].instructions {
                let size = instr.size();
                pos += size;
                let Some(target) = instr.target else {
                    continue;
                };
                let target_offset = offsets[target.index()].ok_or_else(|| {
                    CompileError::internal(format!(
                        "{} targets block {} which was never laid out",
                        instr.opcode, target.0
                    ))
                })?;

                instr.arg = if instr.opcode.is_relative_jump() {
                    target_offset.checked_sub(pos).ok_or_else(|| {
                        CompileError::internal(format!(
                            "{} at offset {} jumps backwards to {}",
                            instr.opcode,
                            pos - size,
                            target_offset
                        ))
                    })?
                } else {
                    target_offset
                };

                if instr.size() != size {
                    widened = true;
                }
            }
        }

        if !widened {
            return Ok(offsets);
        }
    }
}

// =============================================================================
// Emission
// =============================================================================

fn emit(
    unit: &CompilationUnit,
    order: &[BlockIdx],
    offsets: &[Option<u32>],
) -> CompileResult<(Vec<u8>, Vec<LineTableEntry>)> {
    let mut code = Vec::new();
    let mut lines = LineTableBuilder::new(unit.firstlineno);

    for &idx in order {
        let expected = offsets[idx.index()].unwrap_or(0) as usize;
        if code.len() != expected {
            return Err(CompileError::internal(format!(
                "block {} starts at {} but was assigned offset {}",
                idx.0,
                code.len(),
                expected
            )));
        }

        for instr in &unit.block(idx).instructions {
            let start = code.len() as u32;
            let units = code_units(instr.arg);
            for shift in (1..units).rev() {
                code.push(Opcode::EXTENDED_ARG.byte());
                code.push((instr.arg >> (8 * shift)) as u8);
            }
            code.push(instr.opcode.byte());
            code.push(instr.arg as u8);
            lines.add(start, code.len() as u32, instr.lineno);
        }
    }

    Ok((code, lines.finish()))
}

/// Builds `[start, end)` line ranges. An unstamped instruction extends the
/// range before it; leading unstamped instructions belong to `firstlineno`.
struct LineTableBuilder {
    entries: Vec<LineTableEntry>,
    firstlineno: u32,
}

impl LineTableBuilder {
    fn new(firstlineno: u32) -> Self {
        Self {
            entries: Vec::new(),
            firstlineno,
        }
    }

    fn add(&mut self, start: u32, end: u32, lineno: u32) {
        let line = match (lineno, self.entries.last()) {
            (0, Some(last)) => last.line,
            (0, None) => self.firstlineno,
            (l, _) => l,
        };
        match self.entries.last_mut() {
            Some(last) if last.line == line && last.end == start => last.end = end,
            _ => self.entries.push(LineTableEntry { start, end, line }),
        }
    }

    fn finish(self) -> Vec<LineTableEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::symtable::SymbolTable;

    fn unit() -> CompilationUnit {
        CompilationUnit::new("<module>", "<module>", SymbolTable::module(), 0, 1, false)
    }

    fn offset_of(code: &CodeObject, op: Opcode) -> Vec<usize> {
        code.code
            .chunks(2)
            .enumerate()
            .filter(|(_, c)| c[0] == op.byte())
            .map(|(i, _)| i * 2)
            .collect()
    }

    #[test]
    fn test_implicit_return_none() {
        let code = assemble(unit(), true, "<test>").unwrap();
        assert_eq!(code.code, vec![100, 0, 83, 0]);
        assert_eq!(code.constants, vec![Constant::None]);
        assert_eq!(code.stacksize, 1);
    }

    #[test]
    fn test_expression_mode_returns_value() {
        let mut u = unit();
        u.load_const(Constant::Int(5)).unwrap();
        let code = assemble(u, false, "<test>").unwrap();
        assert_eq!(code.code, vec![100, 0, 83, 0]);
        assert_eq!(code.constants, vec![Constant::Int(5)]);
    }

    #[test]
    fn test_unlinked_block_is_excluded() {
        let mut u = unit();
        let orphan = u.new_block();
        u.use_block(orphan);
        u.set_lineno(9);
        u.emit(Opcode::NOP, 0).unwrap();
        u.emit(Opcode::NOP, 0).unwrap();
        u.use_block(u.entry);
        let code = assemble(u, true, "<test>").unwrap();
        assert_eq!(code.code.len(), 4);
        assert!(code.linetable.iter().all(|e| e.line != 9));
    }

    #[test]
    fn test_extended_arg_prefix() {
        let mut u = unit();
        for i in 0..300 {
            u.load_const(Constant::Int(i)).unwrap();
            u.emit(Opcode::POP_TOP, 0).unwrap();
        }
        let code = assemble(u, true, "<test>").unwrap();
        // LOAD_CONST 299 -> EXTENDED_ARG 1, LOAD_CONST 43
        let tail = &code.code[code.code.len() - 12..];
        assert_eq!(tail[..6], [144, 1, 100, 43, 1, 0]);
        // implicit None is constant 300
        assert_eq!(tail[6..], [144, 1, 100, 44, 83, 0]);
    }

    #[test]
    fn test_forward_jump_over_wide_code_widens() {
        let mut u = unit();
        let end = u.new_block();
        u.load_const(Constant::Bool(true)).unwrap();
        u.emit_jump(Opcode::POP_JUMP_IF_FALSE, end).unwrap();
        u.use_next_block(None);
        for _ in 0..200 {
            u.emit(Opcode::NOP, 0).unwrap();
        }
        u.use_next_block(Some(end));
        let code = assemble(u, true, "<test>").unwrap();

        // LOAD_CONST, EXTENDED_ARG, POP_JUMP_IF_FALSE, 200 NOPs -> end at 406
        assert_eq!(code.code[2..6], [144, 1, 114, 150]);
        let target = (1u32 << 8) | 150;
        assert_eq!(target, 406);
        assert_eq!(offset_of(&code, Opcode::LOAD_CONST).last(), Some(&406));
    }

    #[test]
    fn test_relative_jump_is_distance_from_next() {
        let mut u = unit();
        let end = u.new_block();
        u.emit_jump(Opcode::JUMP_FORWARD, end).unwrap();
        u.use_next_block(None);
        u.emit(Opcode::NOP, 0).unwrap();
        u.use_next_block(Some(end));
        let code = assemble(u, true, "<test>").unwrap();
        // the NOP block is unreachable, so the jump lands right after itself
        assert_eq!(code.code[..2], [110, 0]);
        assert_eq!(code.code.len(), 6);
    }

    #[test]
    fn test_backward_relative_jump_is_internal_error() {
        let mut u = unit();
        let head = u.use_next_block(None);
        u.emit(Opcode::NOP, 0).unwrap();
        u.emit_jump(Opcode::JUMP_FORWARD, head).unwrap();
        let err = assemble(u, true, "<test>").unwrap_err();
        assert!(err.to_string().contains("backwards"));
    }

    #[test]
    fn test_line_table_merges_and_extends() {
        let mut u = unit();
        u.set_lineno(2);
        u.emit(Opcode::NOP, 0).unwrap();
        u.emit(Opcode::NOP, 0).unwrap();
        u.set_lineno(3);
        u.emit(Opcode::NOP, 0).unwrap();
        u.set_lineno(2);
        u.emit(Opcode::NOP, 0).unwrap();
        let code = assemble(u, true, "<test>").unwrap();
        assert_eq!(
            code.linetable,
            vec![
                LineTableEntry { start: 0, end: 4, line: 2 },
                LineTableEntry { start: 4, end: 6, line: 3 },
                LineTableEntry { start: 6, end: 12, line: 2 },
            ]
        );
    }
}
