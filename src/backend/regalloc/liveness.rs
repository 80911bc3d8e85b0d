//! Liveness Analysis over Machine IR
//!
//! Backward dataflow over virtual registers:
//!
//! - live_in[B] = USE[B] ∪ (live_out[B] - DEF[B])
//! - live_out[B] = ∪ live_in[S] for all successors S of B
//!
//! Block successors are read straight off the jump instructions' Block
//! operands, so the analysis works on both generic and post-selection
//! MIR.

use crate::backend::mir::{ARCH_START, GenericOpcode, MFunction, MInst, MOperand};
use crate::backend::x86_64::Opcode;
use std::collections::{HashMap, HashSet};

/// Per-block liveness sets over virtual register ids
#[derive(Clone, Debug, Default)]
pub struct BlockLiveness {
    pub live_in: HashSet<u32>,
    pub live_out: HashSet<u32>,
    pub defs: HashSet<u32>,
    pub uses: HashSet<u32>,
}

/// Liveness information for one machine function
#[derive(Clone, Debug)]
pub struct LivenessInfo {
    /// Indexed like `func.blocks`
    pub blocks: Vec<BlockLiveness>,
    pub successors: Vec<Vec<usize>>,
}

/// Operand indices an instruction reads and writes.
///
/// Post-selection convention: the last operand is the destination for
/// def-style instructions; two-operand arithmetic reads its destination
/// too.
pub fn def_use(inst: &MInst) -> (Option<usize>, Vec<usize>) {
    if inst.opcode < ARCH_START {
        return generic_def_use(inst);
    }
    let last = inst.operands.len().wrapping_sub(1);
    match Opcode::from_u32(inst.opcode) {
        Some(
            Opcode::Move
            | Opcode::MoveDereferenceRhs
            | Opcode::MoveSignExtended
            | Opcode::LoadEffectiveAddress,
        ) => (Some(last), vec![0]),
        // The destination is an address, so both operands are read.
        Some(Opcode::MoveDereferenceLhs) => (None, vec![0, 1]),
        Some(Opcode::Add | Opcode::Sub | Opcode::Multiply) => (Some(last), vec![0, last]),
        Some(Opcode::Test | Opcode::Compare) => (None, vec![0, 1]),
        Some(Opcode::Push) => (None, vec![0]),
        Some(Opcode::Pop) => (Some(0), vec![]),
        Some(Opcode::Jump | Opcode::JumpIfZeroFlag | Opcode::Call) => {
            // Indirect targets read a register.
            match inst.operands.first() {
                Some(MOperand::Register(_)) => (None, vec![0]),
                _ => (None, vec![]),
            }
        }
        Some(
            Opcode::SetByteIfEqual
            | Opcode::SetByteIfLessUnsigned
            | Opcode::SetByteIfLessSigned
            | Opcode::SetByteIfGreaterUnsigned
            | Opcode::SetByteIfGreaterSigned
            | Opcode::SetByteIfEqualOrLessUnsigned
            | Opcode::SetByteIfEqualOrLessSigned
            | Opcode::SetByteIfEqualOrGreaterUnsigned
            | Opcode::SetByteIfEqualOrGreaterSigned,
        ) => (Some(0), vec![]),
        Some(Opcode::Return | Opcode::Poison) | None => (None, vec![]),
    }
}

/// Generic opcodes that survive selection are already in final operand
/// form: two-operand read-modify-write, one-operand RMW, or a bare
/// one-register read (the division family).
fn generic_def_use(inst: &MInst) -> (Option<usize>, Vec<usize>) {
    let last = inst.operands.len().wrapping_sub(1);
    match inst.generic() {
        Some(
            GenericOpcode::Shl
            | GenericOpcode::Shr
            | GenericOpcode::Sar
            | GenericOpcode::And
            | GenericOpcode::Or
            | GenericOpcode::Xor,
        ) => (Some(last), vec![0, last]),
        Some(GenericOpcode::Neg | GenericOpcode::Compl) => (Some(0), vec![0]),
        Some(
            GenericOpcode::SDiv
            | GenericOpcode::UDiv
            | GenericOpcode::SRem
            | GenericOpcode::URem,
        ) => (None, vec![0]),
        _ => {
            // Pre-selection def-style instruction: the `reg` field is
            // the def and every register operand is a use.
            let uses = inst
                .operands
                .iter()
                .enumerate()
                .filter(|(_, op)| matches!(op, MOperand::Register(_)))
                .map(|(i, _)| i)
                .collect();
            (None, uses)
        }
    }
}

fn vreg_at(inst: &MInst, index: usize) -> Option<u32> {
    match inst.operands.get(index) {
        Some(MOperand::Register(reg)) if reg.is_virtual() => Some(reg.id),
        _ => None,
    }
}

/// Successor block indices, read from jump operands
pub fn block_successors(func: &MFunction) -> Vec<Vec<usize>> {
    func.blocks
        .iter()
        .map(|block| {
            let mut succs = Vec::new();
            for inst in &block.insts {
                let is_jump = inst.opcode == Opcode::Jump as u32
                    || inst.opcode == Opcode::JumpIfZeroFlag as u32
                    || inst.generic() == Some(GenericOpcode::Branch)
                    || inst.generic() == Some(GenericOpcode::CondBranch);
                if !is_jump {
                    continue;
                }
                for op in &inst.operands {
                    if let MOperand::Block(target) = op {
                        succs.push(*target as usize);
                    }
                }
            }
            succs
        })
        .collect()
}

/// Compute per-block liveness for `func`
pub fn analyse(func: &MFunction) -> LivenessInfo {
    let successors = block_successors(func);

    let mut blocks: Vec<BlockLiveness> = func
        .blocks
        .iter()
        .map(|block| {
            let mut uses = HashSet::new();
            let mut defs = HashSet::new();
            for inst in &block.insts {
                let (def, use_indices) = def_use(inst);
                for index in use_indices {
                    if let Some(vreg) = vreg_at(inst, index)
                        && !defs.contains(&vreg)
                    {
                        uses.insert(vreg);
                    }
                }
                if let Some(index) = def
                    && let Some(vreg) = vreg_at(inst, index)
                {
                    defs.insert(vreg);
                }
            }
            BlockLiveness {
                live_in: HashSet::new(),
                live_out: HashSet::new(),
                defs,
                uses,
            }
        })
        .collect();

    // Fixed point, iterating blocks in reverse.
    let mut changed = true;
    while changed {
        changed = false;
        for index in (0..blocks.len()).rev() {
            let mut new_live_out = HashSet::new();
            for succ in &successors[index] {
                new_live_out.extend(blocks[*succ].live_in.iter().copied());
            }

            let block = &blocks[index];
            let mut new_live_in = block.uses.clone();
            for vreg in &new_live_out {
                if !block.defs.contains(vreg) {
                    new_live_in.insert(*vreg);
                }
            }

            let block = &mut blocks[index];
            if new_live_in != block.live_in || new_live_out != block.live_out {
                block.live_in = new_live_in;
                block.live_out = new_live_out;
                changed = true;
            }
        }
    }

    LivenessInfo { blocks, successors }
}

/// A live interval over linearised instruction positions
#[derive(Clone, Debug)]
pub struct LiveInterval {
    pub vreg: u32,
    pub start: usize,
    pub end: usize,
}

/// Build live intervals from block liveness, walking the function in
/// layout order with one position per instruction
pub fn live_intervals(func: &MFunction, liveness: &LivenessInfo) -> Vec<LiveInterval> {
    let mut intervals: HashMap<u32, LiveInterval> = HashMap::new();
    let mut position = 0usize;

    for (index, block) in func.blocks.iter().enumerate() {
        let info = &liveness.blocks[index];
        let block_start = position;

        for vreg in &info.live_in {
            intervals
                .entry(*vreg)
                .and_modify(|i| i.end = i.end.max(block_start))
                .or_insert(LiveInterval {
                    vreg: *vreg,
                    start: block_start,
                    end: block_start,
                });
        }

        for inst in &block.insts {
            let (def, use_indices) = def_use(inst);
            for index in use_indices {
                if let Some(vreg) = vreg_at(inst, index) {
                    intervals
                        .entry(vreg)
                        .and_modify(|i| i.end = i.end.max(position))
                        .or_insert(LiveInterval {
                            vreg,
                            start: position,
                            end: position,
                        });
                }
            }
            if let Some(index) = def
                && let Some(vreg) = vreg_at(inst, index)
            {
                intervals
                    .entry(vreg)
                    .and_modify(|i| {
                        i.start = i.start.min(position);
                        i.end = i.end.max(position);
                    })
                    .or_insert(LiveInterval {
                        vreg,
                        start: position,
                        end: position,
                    });
            }
            position += 1;
        }

        let block_end = position.saturating_sub(1);
        for vreg in &info.live_out {
            if let Some(interval) = intervals.get_mut(vreg) {
                interval.end = interval.end.max(block_end);
            }
        }
    }

    let mut intervals: Vec<LiveInterval> = intervals.into_values().collect();
    intervals.sort_by_key(|i| (i.start, i.vreg));
    intervals
}
