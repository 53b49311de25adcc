//! Peephole optimisation
//!
//! Local rewrites on each basic block before emission:
//!
//! - `mov rN rN` disappears.
//! - `add r r 0` and `sub r r 0` disappear.
//! - `imw r k` followed by an instruction whose last operand is `r` fuses
//!   into an inline immediate when `k` fits a mix-type byte and `r` is
//!   provably dead afterwards.
//! - An `imw` into a scratch register that nothing reads before the next
//!   write is removed.
//!
//! Liveness is judged within a block only; calls are barriers that read
//! and clobber everything.

use crate::block::{Block, Instruction, Opcode, Operand, Reg, RA, RB};
use crate::function::Function;

/// The register an instruction writes, if any.
fn written(insn: &Instruction) -> Option<Reg> {
    use Opcode::*;
    match insn.op {
        Add | Sub | Mul | Divs | Divu | Mods | Modu | Shl | Shrs | Shru | And | Or | Xor
        | Cmps | Cmpu | Not | Mov | Zero | Bool | Isz | Sxb | Sxs | Trb | Trs | Imw | Ldw
        | Lds | Ldb | Pop => match insn.operands.first() {
            Some(Operand::Reg(r)) => Some(*r),
            _ => None,
        },
        _ => None,
    }
}

/// The registers an instruction reads.
fn reads(insn: &Instruction, out: &mut Vec<Reg>) {
    use Opcode::*;
    let operands: &[Operand] = match insn.op {
        // First operand is a destination.
        Add | Sub | Mul | Divs | Divu | Mods | Modu | Shl | Shrs | Shru | And | Or | Xor
        | Cmps | Cmpu | Not | Mov | Bool | Isz | Sxb | Sxs | Trb | Trs | Ldw | Lds | Ldb => {
            &insn.operands[1..]
        }
        // Everything here is a source.
        Stw | Sts | Stb | Push | Jz | Jnz | Call => &insn.operands[..],
        _ => &[],
    };
    for operand in operands {
        if let Operand::Reg(r) = operand {
            out.push(*r);
        }
    }
}

/// A call may read or clobber any register.
fn is_barrier(insn: &Instruction) -> bool {
    matches!(insn.op, Opcode::Call | Opcode::Ret | Opcode::Leave | Opcode::Enter)
}

/// True if `r` is dead at instruction index `start` (not read before the
/// next write within the block). Registers that can stay live across
/// blocks are only dead when rewritten; the scratch registers never
/// survive a block.
fn dead_after(block: &Block, start: usize, r: Reg) -> bool {
    let mut scratch = Vec::new();
    for insn in &block.instructions[start..] {
        if is_barrier(insn) {
            return false;
        }
        scratch.clear();
        reads(insn, &mut scratch);
        if scratch.contains(&r) {
            return false;
        }
        if written(insn) == Some(r) {
            return true;
        }
    }
    // End of block: expression temporaries may flow into the next block,
    // but ra/rb never do.
    r == RA || r == RB
}

fn is_useless_move(insn: &Instruction) -> bool {
    match (insn.op, insn.operands.as_slice()) {
        (Opcode::Mov, [Operand::Reg(a), Operand::Reg(b)]) => a == b,
        (Opcode::Add | Opcode::Sub, [Operand::Reg(a), Operand::Reg(b), Operand::Imm(0)]) => {
            a == b
        }
        _ => false,
    }
}

/// Fits the inline mix-type immediate range.
fn fits_inline(value: i32) -> bool {
    (-0x70..0x80).contains(&value)
}

fn peephole_block(block: &mut Block) {
    let mut changed = true;
    while changed {
        changed = false;

        // Dead moves and additions of zero
        let before = block.instructions.len();
        block.instructions.retain(|insn| !is_useless_move(insn));
        if block.instructions.len() != before {
            changed = true;
        }

        // imw fusion
        for index in 0..block.instructions.len().saturating_sub(1) {
            let (imw_reg, value) = match (
                block.instructions[index].op,
                block.instructions[index].operands.as_slice(),
            ) {
                (Opcode::Imw, [Operand::Reg(r), Operand::Imm(v)]) => (*r, *v),
                _ => continue,
            };
            if !fits_inline(value) {
                continue;
            }
            let next = &block.instructions[index + 1];
            let fusable = matches!(
                next.op,
                Opcode::Add
                    | Opcode::Sub
                    | Opcode::Mul
                    | Opcode::And
                    | Opcode::Or
                    | Opcode::Xor
                    | Opcode::Shl
                    | Opcode::Shrs
                    | Opcode::Shru
                    | Opcode::Cmps
                    | Opcode::Cmpu
            );
            if !fusable {
                continue;
            }
            let uses_last = matches!(
                next.operands.last(),
                Some(Operand::Reg(r)) if *r == imw_reg
            );
            let read_elsewhere = next.operands[..next.operands.len() - 1]
                .iter()
                .skip(1)
                .any(|operand| matches!(operand, Operand::Reg(r) if *r == imw_reg));
            if !uses_last || read_elsewhere {
                continue;
            }
            if !dead_after(block, index + 2, imw_reg)
                && written(next) != Some(imw_reg)
            {
                continue;
            }

            let last = block.instructions[index + 1].operands.len() - 1;
            block.instructions[index + 1].operands[last] = Operand::Imm(value);
            block.instructions.remove(index);
            changed = true;
            break;
        }

        // Dead imw into a scratch register
        for index in 0..block.instructions.len() {
            let imw_reg = match (
                block.instructions[index].op,
                block.instructions[index].operands.as_slice(),
            ) {
                (Opcode::Imw, [Operand::Reg(r), Operand::Imm(_)]) => *r,
                _ => continue,
            };
            if (imw_reg == RA || imw_reg == RB) && dead_after(block, index + 1, imw_reg) {
                block.instructions.remove(index);
                changed = true;
                break;
            }
        }
    }
}

/// Runs the peephole pass over every block of a function.
pub fn optimize(function: &mut Function) {
    for block in &mut function.blocks {
        peephole_block(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{imm, reg, BlockLabel, R0, R1};
    use crate::token::{Token, TokenKind, TokenRef};
    use std::rc::Rc;

    fn tok() -> TokenRef {
        Token::new(TokenKind::Number, Rc::from("0"), Rc::from("test.i"), 1)
    }

    fn block_with(instructions: Vec<(Opcode, Vec<Operand>)>) -> Block {
        let mut block = Block::new(BlockLabel::Jump(0));
        for (op, operands) in instructions {
            block.add(tok(), op, operands);
        }
        block
    }

    #[test]
    fn test_removes_self_move() {
        let mut block = block_with(vec![
            (Opcode::Mov, vec![reg(R0), reg(R0)]),
            (Opcode::Mov, vec![reg(R1), reg(R0)]),
        ]);
        peephole_block(&mut block);
        assert_eq!(block.instructions.len(), 1);
        assert_eq!(block.instructions[0].op, Opcode::Mov);
    }

    #[test]
    fn test_removes_add_zero() {
        let mut block = block_with(vec![(Opcode::Add, vec![reg(R0), reg(R0), imm(0)])]);
        peephole_block(&mut block);
        assert!(block.instructions.is_empty());
    }

    #[test]
    fn test_keeps_add_zero_to_other_register() {
        // add r1 r0 0 is a move, not a no-op.
        let mut block = block_with(vec![(Opcode::Add, vec![reg(R1), reg(R0), imm(0)])]);
        peephole_block(&mut block);
        assert_eq!(block.instructions.len(), 1);
    }

    #[test]
    fn test_fuses_imw_into_add() {
        // imw ra 4 ; add r0 r0 ra => add r0 r0 4
        let mut block = block_with(vec![
            (Opcode::Imw, vec![reg(RA), imm(4)]),
            (Opcode::Add, vec![reg(R0), reg(R0), reg(RA)]),
        ]);
        peephole_block(&mut block);
        assert_eq!(block.instructions.len(), 1);
        assert_eq!(block.instructions[0].op, Opcode::Add);
        assert_eq!(block.instructions[0].operands[2], imm(4));
    }

    #[test]
    fn test_does_not_fuse_large_immediate() {
        let mut block = block_with(vec![
            (Opcode::Imw, vec![reg(RA), imm(1000)]),
            (Opcode::Add, vec![reg(R0), reg(R0), reg(RA)]),
        ]);
        peephole_block(&mut block);
        assert_eq!(block.instructions.len(), 2);
    }

    #[test]
    fn test_does_not_fuse_when_register_still_read() {
        // ra is read again after the add, so the imw must stay.
        let mut block = block_with(vec![
            (Opcode::Imw, vec![reg(RA), imm(4)]),
            (Opcode::Add, vec![reg(R0), reg(R0), reg(RA)]),
            (Opcode::Add, vec![reg(R1), reg(R1), reg(RA)]),
        ]);
        peephole_block(&mut block);
        assert_eq!(block.instructions.len(), 3);
    }

    #[test]
    fn test_removes_dead_scratch_imw() {
        let mut block = block_with(vec![
            (Opcode::Imw, vec![reg(RA), imm(5)]),
            (Opcode::Zero, vec![reg(RA)]),
            (Opcode::Push, vec![reg(RA)]),
        ]);
        peephole_block(&mut block);
        assert_eq!(block.instructions.len(), 2);
        assert_eq!(block.instructions[0].op, Opcode::Zero);
    }

    #[test]
    fn test_call_blocks_dead_code_removal() {
        let mut block = block_with(vec![
            (Opcode::Imw, vec![reg(R0), imm(5)]),
            (
                Opcode::Call,
                vec![crate::block::label(
                    '^',
                    crate::block::LabelName::Sym(Rc::from("f")),
                )],
            ),
        ]);
        peephole_block(&mut block);
        assert_eq!(block.instructions.len(), 2);
    }
}
