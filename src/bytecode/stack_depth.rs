use crate::bytecode::{Block, BlockIdx, CompileError, CompileResult};

/// Maximum operand-stack depth over every path from `entry`.
///
/// Worklist over the block graph: each block is analysed once, with the
/// depth of the first edge that reaches it. A jump contributes its
/// branch-taken effect to the target and its fall-through effect to the
/// next instruction; blocks ending in a terminal instruction have no
/// fall-through edge.
pub fn max_stack_depth(blocks: &[Block], entry: BlockIdx) -> CompileResult<u32> {
    let mut start_depth: Vec<Option<i32>> = vec![None; blocks.len()];
    let mut worklist = Vec::new();
    let mut max_depth = 0;

    push(&mut start_depth, &mut worklist, entry, 0);

    while let Some(idx) = worklist.pop() {
        let block = &blocks[idx.index()];
        let mut depth = start_depth[idx.index()].unwrap_or(0);

        for (i, instr) in block.instructions.iter().enumerate() {
            if let Some(target) = instr.target {
                let target_depth = depth + instr.opcode.stack_effect(instr.arg, true);
                check(target_depth, idx, i, instr.opcode.name())?;
                max_depth = max_depth.max(target_depth);
                push(&mut start_depth, &mut worklist, target, target_depth);
            }

            depth += instr.opcode.stack_effect(instr.arg, false);
            check(depth, idx, i, instr.opcode.name())?;
            max_depth = max_depth.max(depth);
        }

        if !block.terminal {
            if let Some(next) = block.next {
                push(&mut start_depth, &mut worklist, next, depth);
            }
        }
    }

    Ok(max_depth as u32)
}

fn push(start_depth: &mut [Option<i32>], worklist: &mut Vec<BlockIdx>, block: BlockIdx, depth: i32) {
    let slot = &mut start_depth[block.index()];
    if slot.is_none() {
        *slot = Some(depth);
        worklist.push(block);
    }
}

fn check(depth: i32, block: BlockIdx, index: usize, opcode: &str) -> CompileResult<()> {
    if depth < 0 {
        return Err(CompileError::internal(format!(
            "stack underflow in block {} at instruction {} ({})",
            block.0, index, opcode
        )));
    }
    Ok(())
}
