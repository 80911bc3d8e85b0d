//! Register Allocation
//!
//! Linear scan over live intervals of virtual registers, driven by a
//! [`MachineDescription`] naming the allocatable physical registers and
//! the ABI return register. Every occurrence of the synthetic RETURN
//! placeholder is replaced by the real return register first.
//!
//! Only volatile registers are allocatable (callee-saved registers are
//! never handed out), so nothing can survive a call in a register: any
//! interval that crosses an instruction touching physical state (a
//! call, a jump to a function, or an operand pinned to a physical
//! register) is spilled to a stack slot instead. R10 and R11 are held
//! back from the pool as the spill/reload scratch registers.

pub mod liveness;

use crate::backend::mir::{MFunction, MInst, MLocal, MOperand, Reg};
use crate::backend::x86_64::{Opcode, RegisterId};
use crate::common::target::Target;
use liveness::{LiveInterval, def_use};
use std::collections::HashMap;

/// What the allocator needs to know about the target
#[derive(Clone, Debug)]
pub struct MachineDescription {
    pub return_register: u32,
    pub return_register_to_replace: u32,
    /// Allocatable registers, all volatile under the ABI
    pub registers: Vec<u32>,
}

impl MachineDescription {
    /// The x86-64 description for the given operating system
    pub fn x86_64(target: &Target) -> MachineDescription {
        let mut registers = vec![
            RegisterId::Rax as u32,
            RegisterId::Rcx as u32,
            RegisterId::Rdx as u32,
        ];
        if target.is_linux() {
            registers.push(RegisterId::Rsi as u32);
            registers.push(RegisterId::Rdi as u32);
        }
        registers.extend([
            RegisterId::R8 as u32,
            RegisterId::R9 as u32,
            RegisterId::R10 as u32,
            RegisterId::R11 as u32,
        ]);
        MachineDescription {
            return_register: RegisterId::Rax as u32,
            return_register_to_replace: RegisterId::Return as u32,
            registers,
        }
    }
}

/// Where a virtual register ended up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Location {
    Reg(u32),
    /// Frame slot index
    Spill(u32),
}

const SCRATCH: [RegisterId; 2] = [RegisterId::R11, RegisterId::R10];

/// Allocate registers for one function, rewriting it in place
pub fn allocate_registers(desc: &MachineDescription, func: &mut MFunction) {
    if !func.is_definition() {
        return;
    }

    // The RETURN placeholder becomes the ABI return register.
    for block in &mut func.blocks {
        for inst in &mut block.insts {
            for op in &mut inst.operands {
                if let MOperand::Register(reg) = op
                    && reg.id == desc.return_register_to_replace
                {
                    reg.id = desc.return_register;
                }
            }
        }
    }

    let live = liveness::analyse(func);
    let intervals = liveness::live_intervals(func, &live);
    let hazards = hazard_positions(func);

    let assignment = run_linear_scan(desc, func, intervals, &hazards);
    rewrite(func, &assignment);
}

/// Positions whose instruction touches physical registers or transfers
/// control out of the function; nothing may live across them in a
/// volatile register.
fn hazard_positions(func: &MFunction) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut position = 0usize;
    for block in &func.blocks {
        for inst in &block.insts {
            let pinned = inst.operands.iter().any(|op| {
                matches!(op, MOperand::Register(reg) if reg.is_physical()
                    && reg.id != RegisterId::Rbp as u32
                    && reg.id != RegisterId::Rsp as u32
                    && reg.id != RegisterId::Rip as u32)
            });
            let transfers = inst.opcode == Opcode::Call as u32
                || (inst.opcode == Opcode::Jump as u32
                    && matches!(
                        inst.operands.first(),
                        Some(MOperand::Function(_) | MOperand::Global(_))
                    ));
            if pinned || transfers {
                positions.push(position);
            }
            position += 1;
        }
    }
    positions
}

fn run_linear_scan(
    desc: &MachineDescription,
    func: &mut MFunction,
    intervals: Vec<LiveInterval>,
    hazards: &[usize],
) -> HashMap<u32, Location> {
    let pool: Vec<u32> = desc
        .registers
        .iter()
        .copied()
        .filter(|r| !SCRATCH.iter().any(|s| *s as u32 == *r))
        .collect();

    let mut assignment: HashMap<u32, Location> = HashMap::new();
    let mut active: Vec<(LiveInterval, u32)> = Vec::new();
    let mut free: Vec<u32> = pool.clone();
    let mut spill = |func: &mut MFunction, assignment: &mut HashMap<u32, Location>, vreg: u32| {
        let slot = func.frame.len() as u32;
        func.frame.push(MLocal { bytes: 8, align: 8 });
        assignment.insert(vreg, Location::Spill(slot));
    };

    for interval in intervals {
        // Whatever crosses a hazard cannot stay in a volatile register.
        if hazards
            .iter()
            .any(|p| interval.start < *p && *p < interval.end)
        {
            spill(func, &mut assignment, interval.vreg);
            continue;
        }

        // Expire intervals that ended before this one starts.
        let (expired, still_active): (Vec<_>, Vec<_>) = active
            .drain(..)
            .partition(|(i, _)| i.end < interval.start);
        for (_, reg) in expired {
            free.push(reg);
        }
        active = still_active;

        if let Some(reg) = free.pop() {
            assignment.insert(interval.vreg, Location::Reg(reg));
            active.push((interval, reg));
            active.sort_by_key(|(i, _)| i.end);
        } else {
            // Spill the active interval that ends furthest away if it
            // outlives this one; otherwise spill the newcomer.
            match active.iter().position(|(i, _)| i.end > interval.end) {
                Some(pos) => {
                    let (victim, reg) = active.remove(pos);
                    spill(func, &mut assignment, victim.vreg);
                    assignment.insert(interval.vreg, Location::Reg(reg));
                    active.push((interval, reg));
                    active.sort_by_key(|(i, _)| i.end);
                }
                None => spill(func, &mut assignment, interval.vreg),
            }
        }
    }

    assignment
}

/// Apply the assignment: registers substitute in place; spilled values
/// reload into a scratch register before each use and store back after
/// a def.
fn rewrite(func: &mut MFunction, assignment: &HashMap<u32, Location>) {
    for block_index in 0..func.blocks.len() {
        let insts = std::mem::take(&mut func.blocks[block_index].insts);
        let mut out: Vec<MInst> = Vec::with_capacity(insts.len());

        for mut inst in insts {
            let (def, use_indices) = def_use(&inst);
            let mut scratch_of: HashMap<u32, RegisterId> = HashMap::new();
            let mut next_scratch = 0usize;
            let mut stores: Vec<MInst> = Vec::new();

            let operand_vregs: Vec<(usize, u32, u16)> = inst
                .operands
                .iter()
                .enumerate()
                .filter_map(|(i, op)| match op {
                    MOperand::Register(reg) if reg.is_virtual() => Some((i, reg.id, reg.bits)),
                    _ => None,
                })
                .collect();

            for (index, vreg, bits) in operand_vregs {
                match assignment.get(&vreg) {
                    Some(Location::Reg(phys)) => {
                        inst.operands[index] = MOperand::Register(Reg::new(*phys, bits));
                    }
                    Some(Location::Spill(slot)) => {
                        let scratch = *scratch_of.entry(vreg).or_insert_with(|| {
                            let reg = SCRATCH[next_scratch.min(SCRATCH.len() - 1)];
                            next_scratch += 1;
                            reg
                        });
                        let scratch_op = MOperand::Register(Reg::new(scratch as u32, bits));
                        if use_indices.contains(&index) {
                            out.push(MInst::arch(
                                Opcode::Move as u32,
                                vec![
                                    MOperand::Local(*slot),
                                    MOperand::Register(Reg::new(scratch as u32, 64)),
                                ],
                            ));
                        }
                        if def == Some(index) {
                            stores.push(MInst::arch(
                                Opcode::Move as u32,
                                vec![
                                    MOperand::Register(Reg::new(scratch as u32, 64)),
                                    MOperand::Local(*slot),
                                ],
                            ));
                        }
                        inst.operands[index] = scratch_op;
                    }
                    None => {
                        // Never live: a write whose value is unused.
                        inst.operands[index] =
                            MOperand::Register(Reg::new(SCRATCH[0] as u32, bits));
                    }
                }
            }

            out.push(inst);
            out.extend(stores);
        }

        func.blocks[block_index].insts = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mir::{MBlock, VREG_BASE};
    use crate::common::types::CallConv;
    use crate::ir::Linkage;

    fn vreg(n: u32) -> MOperand {
        MOperand::Register(Reg::new(VREG_BASE + n, 64))
    }

    fn mov(src: MOperand, dst: MOperand) -> MInst {
        MInst::arch(Opcode::Move as u32, vec![src, dst])
    }

    fn desc() -> MachineDescription {
        MachineDescription::x86_64(&Target::X86_64_LINUX)
    }

    #[test]
    fn test_description_register_sets() {
        let linux = MachineDescription::x86_64(&Target::X86_64_LINUX);
        assert!(linux.registers.contains(&(RegisterId::Rsi as u32)));
        assert!(linux.registers.contains(&(RegisterId::Rdi as u32)));
        assert_eq!(linux.registers.len(), 9);

        let windows = MachineDescription::x86_64(&Target::X86_64_WINDOWS);
        assert!(!windows.registers.contains(&(RegisterId::Rsi as u32)));
        assert_eq!(windows.registers.len(), 7);

        assert_eq!(linux.return_register, RegisterId::Rax as u32);
        assert_eq!(
            linux.return_register_to_replace,
            RegisterId::Return as u32
        );
    }

    #[test]
    fn test_return_placeholder_replaced() {
        let mut func = MFunction::new("f", Linkage::Internal, CallConv::C);
        func.blocks.push(MBlock {
            name: "entry".to_string(),
            insts: vec![
                mov(
                    MOperand::Immediate(42),
                    MOperand::Register(Reg::new(RegisterId::Return as u32, 64)),
                ),
                MInst::arch(Opcode::Return as u32, vec![]),
            ],
        });

        allocate_registers(&desc(), &mut func);

        let insts = &func.blocks[0].insts;
        assert_eq!(
            insts[0].operands[1],
            MOperand::Register(Reg::new(RegisterId::Rax as u32, 64))
        );
    }

    #[test]
    fn test_virtual_registers_get_physical_homes() {
        let mut func = MFunction::new("f", Linkage::Internal, CallConv::C);
        func.blocks.push(MBlock {
            name: "entry".to_string(),
            insts: vec![
                mov(MOperand::Immediate(1), vreg(0)),
                mov(MOperand::Immediate(2), vreg(1)),
                MInst::arch(Opcode::Add as u32, vec![vreg(0), vreg(1)]),
                MInst::arch(Opcode::Return as u32, vec![]),
            ],
        });

        allocate_registers(&desc(), &mut func);

        for block in &func.blocks {
            for inst in &block.insts {
                for op in &inst.operands {
                    if let MOperand::Register(reg) = op {
                        assert!(reg.is_physical(), "vreg survived allocation: {:?}", inst);
                    }
                }
            }
        }
    }

    #[test]
    fn test_interval_across_call_is_spilled() {
        let mut func = MFunction::new("f", Linkage::Internal, CallConv::C);
        func.blocks.push(MBlock {
            name: "entry".to_string(),
            insts: vec![
                mov(MOperand::Immediate(7), vreg(0)),
                MInst::arch(Opcode::Call as u32, vec![MOperand::Function(0)]),
                mov(vreg(0), vreg(1)),
                MInst::arch(Opcode::Return as u32, vec![]),
            ],
        });

        allocate_registers(&desc(), &mut func);

        // v0 lives across the call, so it got a frame slot plus a
        // reload through the scratch register.
        assert!(!func.frame.is_empty());
        let insts = &func.blocks[0].insts;
        assert!(insts.iter().any(|i| {
            i.opcode == Opcode::Move as u32
                && matches!(i.operands[1], MOperand::Local(_))
        }));
    }

    #[test]
    fn test_high_pressure_spills() {
        let mut func = MFunction::new("f", Linkage::Internal, CallConv::C);
        let mut insts = Vec::new();
        for i in 0..12 {
            insts.push(mov(MOperand::Immediate(i as u64), vreg(i)));
        }
        // One instruction keeps them all live at once.
        for i in 0..12 {
            insts.push(MInst::arch(Opcode::Add as u32, vec![vreg(i), vreg(12)]));
        }
        insts.push(MInst::arch(Opcode::Return as u32, vec![]));
        func.blocks.push(MBlock {
            name: "entry".to_string(),
            insts,
        });

        allocate_registers(&desc(), &mut func);

        // More values than allocatable registers: something spilled.
        assert!(!func.frame.is_empty());
        // And no virtual register survived.
        for block in &func.blocks {
            for inst in &block.insts {
                for op in &inst.operands {
                    if let MOperand::Register(reg) = op {
                        assert!(reg.is_physical());
                    }
                }
            }
        }
    }
}
