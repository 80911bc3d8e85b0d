//! Pattern-Directed Instruction Selection
//!
//! The selector table is data: each [`Pattern`] pairs a matcher (an
//! opcode plus operand kind/size predicates) with a replacement that
//! emits the architecture sequence. The walker below is target-neutral;
//! a target supplies its table and a context with whatever state its
//! replacements need (fresh virtual registers, calling conventions,
//! helper symbols).
//!
//! Patterns are tried in declared order and the first match fires. A
//! replacement reads the matched instruction's destination register and
//! writes its results there, so later uses of the defined virtual
//! register keep reading the right value.

use crate::backend::mir::{MInst, MOperand};

/// Operand predicate of a matcher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// Matches anything
    Any,
    Reg,
    Imm,
    /// An immediate that fits in a sign-extended 32-bit field
    Imm32,
    Local,
    Global,
    Block,
    Function,
}

impl OperandKind {
    pub fn matches(self, operand: &MOperand) -> bool {
        match (self, operand) {
            (OperandKind::Any, _) => true,
            (OperandKind::Reg, MOperand::Register(_)) => true,
            (OperandKind::Imm, MOperand::Immediate(_)) => true,
            (OperandKind::Imm32, MOperand::Immediate(v)) => {
                i32::try_from(*v as i64).is_ok()
            }
            (OperandKind::Local, MOperand::Local(_)) => true,
            (OperandKind::Global, MOperand::Global(_)) => true,
            (OperandKind::Block, MOperand::Block(_)) => true,
            (OperandKind::Function, MOperand::Function(_)) => true,
            _ => false,
        }
    }
}

/// One row of a selector table
pub struct Pattern<C> {
    /// Generic opcode this row matches
    pub opcode: u32,
    /// Predicates over the leading operands
    pub operands: &'static [OperandKind],
    /// Whether the operand count must equal the predicate count
    /// (`false` allows trailing operands, e.g. call arguments)
    pub exact: bool,
    /// Emits the replacement sequence for a matched instruction
    pub replace: fn(&MInst, &mut C) -> Vec<MInst>,
}

impl<C> Pattern<C> {
    pub fn matches(&self, inst: &MInst) -> bool {
        if inst.opcode != self.opcode {
            return false;
        }
        if self.exact && inst.operands.len() != self.operands.len() {
            return false;
        }
        if inst.operands.len() < self.operands.len() {
            return false;
        }
        self.operands
            .iter()
            .zip(inst.operands.iter())
            .all(|(kind, op)| kind.matches(op))
    }
}

/// Rewrite a block's instructions through the table. Instructions no
/// row matches pass through unchanged.
pub fn rewrite_block<C>(insts: Vec<MInst>, patterns: &[Pattern<C>], ctx: &mut C) -> Vec<MInst> {
    let mut out = Vec::with_capacity(insts.len());
    for inst in insts {
        match patterns.iter().find(|p| p.matches(&inst)) {
            Some(pattern) => out.extend((pattern.replace)(&inst, ctx)),
            None => out.push(inst),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mir::{GenericOpcode, Reg, VREG_BASE};

    fn reg(n: u32) -> MOperand {
        MOperand::Register(Reg::new(VREG_BASE + n, 64))
    }

    #[test]
    fn test_operand_predicates() {
        assert!(OperandKind::Reg.matches(&reg(0)));
        assert!(!OperandKind::Reg.matches(&MOperand::Immediate(1)));
        assert!(OperandKind::Imm32.matches(&MOperand::Immediate(100)));
        assert!(OperandKind::Imm32.matches(&MOperand::Immediate((-5i64) as u64)));
        assert!(!OperandKind::Imm32.matches(&MOperand::Immediate(1 << 40)));
        assert!(OperandKind::Any.matches(&MOperand::Local(0)));
    }

    #[test]
    fn test_first_match_fires() {
        fn tag_one(_: &MInst, _: &mut u32) -> Vec<MInst> {
            vec![MInst::new(GenericOpcode::Poison, None, vec![])]
        }
        fn tag_two(_: &MInst, _: &mut u32) -> Vec<MInst> {
            vec![
                MInst::new(GenericOpcode::Poison, None, vec![]),
                MInst::new(GenericOpcode::Poison, None, vec![]),
            ]
        }
        let patterns: [Pattern<u32>; 2] = [
            Pattern {
                opcode: GenericOpcode::Add as u32,
                operands: &[OperandKind::Reg, OperandKind::Imm],
                exact: true,
                replace: tag_one,
            },
            Pattern {
                opcode: GenericOpcode::Add as u32,
                operands: &[OperandKind::Any, OperandKind::Any],
                exact: true,
                replace: tag_two,
            },
        ];

        let mut ctx = 0u32;
        // Reg+Imm takes the first row.
        let picked = rewrite_block(
            vec![MInst::new(
                GenericOpcode::Add,
                None,
                vec![reg(0), MOperand::Immediate(1)],
            )],
            &patterns,
            &mut ctx,
        );
        assert_eq!(picked.len(), 1);

        // Reg+Reg falls through to the general row.
        let general = rewrite_block(
            vec![MInst::new(GenericOpcode::Add, None, vec![reg(0), reg(1)])],
            &patterns,
            &mut ctx,
        );
        assert_eq!(general.len(), 2);
    }

    #[test]
    fn test_unmatched_pass_through() {
        let patterns: [Pattern<u32>; 0] = [];
        let mut ctx = 0u32;
        let out = rewrite_block(
            vec![MInst::new(GenericOpcode::Return, None, vec![])],
            &patterns,
            &mut ctx,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].generic(), Some(GenericOpcode::Return));
    }
}
