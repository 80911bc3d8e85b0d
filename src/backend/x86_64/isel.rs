//! x86-64 Instruction Selection
//!
//! Rewrites generic machine IR into x86-64 machine IR through the
//! pattern table at the bottom of this file. Patterns are tried in
//! declared order; the first row whose matcher accepts the instruction
//! fires, and its replacement writes the architecture sequence.
//!
//! Post-selection operand convention is AT&T order: source first,
//! destination last. Two-operand constraints are established here (the
//! destination doubles as the left source), fixed-register operands are
//! pinned here (shift counts in CL, division through RAX/RDX), and the
//! synthetic RETURN placeholder marks values the allocator must put in
//! the ABI return register.
//!
//! Generic opcodes with no architecture row (the shift/bitwise/division
//! family) survive selection in final two-operand form; the emitters
//! spell them directly.
//!
//! Before the table runs, two prepasses normalise the function: phis
//! become copies at the end of each predecessor, and incoming
//! parameters are copied out of their ABI argument registers.

use crate::backend::isel::{OperandKind, Pattern, rewrite_block};
use crate::backend::mir::{GenericOpcode, MInst, MOperand, MirModule, Reg};
use crate::backend::x86_64::regs::RegisterId;
use crate::backend::x86_64::Opcode;
use crate::common::context::Context;
use crate::common::diag::Loc;
use crate::common::types::CallConv;
use crate::common::target::Target;

/// State shared by the replacement functions of one function's walk
pub struct SelCtx {
    next_vreg: u32,
    target: Target,
    /// Calling convention of each function in the module, by index
    callee_convs: Vec<CallConv>,
    /// Symbol index of the memcpy helper
    memcpy: u32,
    /// Problems found mid-walk, reported when the function finishes
    errors: Vec<String>,
}

impl SelCtx {
    fn fresh(&mut self, bits: u16) -> Reg {
        let reg = Reg::new(self.next_vreg, bits);
        self.next_vreg += 1;
        reg
    }

    fn arg_regs(&self, conv: CallConv) -> &'static [RegisterId] {
        // Only the C convention follows the host OS; the internal
        // conventions use the sysv order everywhere.
        if conv == CallConv::C && self.target.is_windows() {
            RegisterId::WIN64_ARGS
        } else {
            RegisterId::SYSV_ARGS
        }
    }
}

/// Select instructions for every function in the module
pub fn select_instructions(ctx: &Context, mir: &mut MirModule) {
    let memcpy = mir.extern_symbol("memcpy");
    let callee_convs: Vec<CallConv> = mir.funcs.iter().map(|f| f.conv).collect();

    for index in 0..mir.funcs.len() {
        if !mir.funcs[index].is_definition() {
            continue;
        }

        lower_phis(&mut mir.funcs[index]);
        insert_param_moves(ctx, mir, index);

        let func = &mut mir.funcs[index];
        let mut sel = SelCtx {
            next_vreg: func.vreg_watermark(),
            target: *ctx.target(),
            callee_convs: callee_convs.clone(),
            memcpy,
            errors: Vec::new(),
        };

        let blocks = std::mem::take(&mut func.blocks);
        func.blocks = blocks
            .into_iter()
            .map(|mut block| {
                block.insts = rewrite_block(block.insts, patterns(), &mut sel);
                block
            })
            .collect();
        func.reserve_vregs(sel.next_vreg);

        for error in sel.errors {
            ctx.diags.error(Loc::none(), error);
        }
    }
}

/// Replace phis by copies at the end of each predecessor block
fn lower_phis(func: &mut crate::backend::mir::MFunction) {
    let mut copies: Vec<(usize, MInst)> = Vec::new();

    for block in &mut func.blocks {
        block.insts.retain(|inst| {
            if inst.generic() != Some(GenericOpcode::Phi) {
                return true;
            }
            let dst = inst.reg.unwrap_or_else(|| {
                crate::ice!("phi without a destination register")
            });
            for pair in inst.operands.chunks(2) {
                let [MOperand::Block(pred), value] = pair else {
                    crate::ice!("malformed phi operands");
                };
                copies.push((
                    *pred as usize,
                    MInst::new(GenericOpcode::Copy, Some(dst), vec![value.clone()]),
                ));
            }
            false
        });
    }

    for (pred, copy) in copies {
        let block = &mut func.blocks[pred];
        // The copy lands just before the terminator.
        let at = block.insts.len().saturating_sub(1);
        block.insts.insert(at, copy);
    }
}

/// Copy incoming parameters out of the ABI argument registers
fn insert_param_moves(ctx: &Context, mir: &mut MirModule, index: usize) {
    let func = &mut mir.funcs[index];
    let arg_regs = if func.conv == CallConv::C && ctx.target().is_windows() {
        RegisterId::WIN64_ARGS
    } else {
        RegisterId::SYSV_ARGS
    };

    if func.params.len() > arg_regs.len() {
        ctx.diags.error(
            Loc::none(),
            format!(
                "{}: stack-passed arguments are not implemented ({} parameters, {} argument registers)",
                func.name,
                func.params.len(),
                arg_regs.len()
            ),
        );
        return;
    }

    let mut moves: Vec<MInst> = Vec::new();
    for (param, arg) in func.params.clone().iter().zip(arg_regs.iter()) {
        moves.push(MInst::new(
            GenericOpcode::Copy,
            Some(*param),
            vec![MOperand::Register(Reg::new(*arg as u32, param.bits))],
        ));
    }
    if let Some(entry) = func.blocks.first_mut() {
        moves.append(&mut entry.insts);
        entry.insts = moves;
    }
}

// === Replacement helpers ===

fn phys(reg: RegisterId, bits: u16) -> MOperand {
    MOperand::Register(Reg::new(reg as u32, bits))
}

fn mov(src: MOperand, dst: MOperand) -> MInst {
    MInst::arch(Opcode::Move as u32, vec![src, dst])
}

fn operand_bits(op: &MOperand) -> u16 {
    match op {
        MOperand::Register(reg) => reg.bits,
        _ => 64,
    }
}

/// Bring an operand into a register, spending a scratch vreg when the
/// operand is not one. Global and Function operands materialise as
/// addresses (lea).
fn to_reg(op: &MOperand, sel: &mut SelCtx, out: &mut Vec<MInst>) -> Reg {
    match op {
        MOperand::Register(reg) => *reg,
        MOperand::Immediate(_) => {
            let tmp = sel.fresh(64);
            out.push(mov(op.clone(), MOperand::Register(tmp)));
            tmp
        }
        MOperand::Global(_) | MOperand::Function(_) | MOperand::Local(_) => {
            let tmp = sel.fresh(64);
            out.push(MInst::arch(
                Opcode::LoadEffectiveAddress as u32,
                vec![op.clone(), MOperand::Register(tmp)],
            ));
            tmp
        }
        MOperand::Block(_) => crate::ice!("block reference used as a value"),
    }
}

/// Copy an arbitrary operand into a physical register
fn move_to_phys(op: &MOperand, reg: RegisterId, sel: &mut SelCtx, out: &mut Vec<MInst>) {
    match op {
        MOperand::Global(_) | MOperand::Function(_) | MOperand::Local(_) => {
            out.push(MInst::arch(
                Opcode::LoadEffectiveAddress as u32,
                vec![op.clone(), phys(reg, 64)],
            ));
        }
        _ => {
            let bits = operand_bits(op);
            out.push(mov(op.clone(), phys(reg, bits)));
        }
    }
    let _ = sel;
}

/// Widen an operand to a full 64-bit register
fn extend_to_64(op: &MOperand, signed: bool, sel: &mut SelCtx, out: &mut Vec<MInst>) -> Reg {
    let reg = to_reg(op, sel, out);
    if reg.bits >= 64 {
        return reg;
    }
    let wide = sel.fresh(64);
    if signed {
        out.push(MInst::arch(
            Opcode::MoveSignExtended as u32,
            vec![MOperand::Register(reg), MOperand::Register(wide)],
        ));
    } else if reg.bits == 32 {
        // A 32-bit move clears the upper half by itself.
        out.push(mov(
            MOperand::Register(Reg::new(reg.id, 32)),
            MOperand::Register(Reg::new(wide.id, 32)),
        ));
    } else {
        out.push(mov(
            MOperand::Register(Reg::new(reg.id, 64)),
            MOperand::Register(wide),
        ));
        out.push(MInst::new(
            GenericOpcode::And,
            None,
            vec![
                MOperand::Immediate((1u64 << reg.bits) - 1),
                MOperand::Register(wide),
            ],
        ));
    }
    wide
}

fn dst_of(inst: &MInst) -> MOperand {
    match inst.reg {
        Some(reg) => MOperand::Register(reg),
        None => crate::ice!("selected instruction is missing its destination"),
    }
}

// === Replacements ===

fn replace_poison(_inst: &MInst, _sel: &mut SelCtx) -> Vec<MInst> {
    vec![MInst::arch(Opcode::Poison as u32, vec![])]
}

fn replace_copy(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    match &inst.operands[0] {
        // A copy of a global or function is its address.
        op @ (MOperand::Global(_) | MOperand::Function(_) | MOperand::Local(_)) => {
            out.push(MInst::arch(
                Opcode::LoadEffectiveAddress as u32,
                vec![op.clone(), dst_of(inst)],
            ));
        }
        op => out.push(mov(op.clone(), dst_of(inst))),
    }
    let _ = sel;
    out
}

fn replace_alloca(inst: &MInst, _sel: &mut SelCtx) -> Vec<MInst> {
    vec![MInst::arch(
        Opcode::LoadEffectiveAddress as u32,
        vec![inst.operands[0].clone(), dst_of(inst)],
    )]
}

fn replace_load(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    match &inst.operands[0] {
        MOperand::Register(addr) => {
            out.push(MInst::arch(
                Opcode::MoveDereferenceRhs as u32,
                vec![MOperand::Register(*addr), dst_of(inst)],
            ));
        }
        op @ MOperand::Global(_) => {
            out.push(MInst::arch(
                Opcode::MoveDereferenceRhs as u32,
                vec![op.clone(), dst_of(inst)],
            ));
        }
        op => {
            let addr = to_reg(op, sel, &mut out);
            out.push(MInst::arch(
                Opcode::MoveDereferenceRhs as u32,
                vec![MOperand::Register(addr), dst_of(inst)],
            ));
        }
    }
    out
}

fn replace_store(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let value = match &inst.operands[0] {
        imm @ MOperand::Immediate(v) if i32::try_from(*v as i64).is_ok() => imm.clone(),
        reg @ MOperand::Register(_) => reg.clone(),
        other => MOperand::Register(to_reg(other, sel, &mut out)),
    };
    let addr = match &inst.operands[1] {
        global @ MOperand::Global(_) => global.clone(),
        other => MOperand::Register(to_reg(other, sel, &mut out)),
    };
    out.push(MInst::arch(
        Opcode::MoveDereferenceLhs as u32,
        vec![value, addr],
    ));
    out
}

/// dst = lhs; dst op= rhs, with the destination doubling as the left
/// source
fn two_operand(opcode: u32, inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dst = dst_of(inst);
    out.push(mov_or_lea(&inst.operands[0], dst.clone()));
    let rhs = match &inst.operands[1] {
        imm @ MOperand::Immediate(v) if i32::try_from(*v as i64).is_ok() => imm.clone(),
        reg @ MOperand::Register(_) => reg.clone(),
        other => MOperand::Register(to_reg(other, sel, &mut out)),
    };
    out.push(MInst {
        opcode,
        reg: None,
        operands: vec![rhs, dst],
    });
    out
}

fn mov_or_lea(src: &MOperand, dst: MOperand) -> MInst {
    match src {
        MOperand::Global(_) | MOperand::Function(_) | MOperand::Local(_) => MInst::arch(
            Opcode::LoadEffectiveAddress as u32,
            vec![src.clone(), dst],
        ),
        _ => mov(src.clone(), dst),
    }
}

fn replace_add(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    two_operand(Opcode::Add as u32, inst, sel)
}

fn replace_sub(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    two_operand(Opcode::Sub as u32, inst, sel)
}

fn replace_mul(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    // imul has no immediate two-operand form we use; force a register.
    let mut out = Vec::new();
    let dst = dst_of(inst);
    out.push(mov_or_lea(&inst.operands[0], dst.clone()));
    let rhs = MOperand::Register(to_reg(&inst.operands[1], sel, &mut out));
    out.push(MInst::arch(Opcode::Multiply as u32, vec![rhs, dst]));
    out
}

fn replace_and(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    two_operand(GenericOpcode::And as u32, inst, sel)
}

fn replace_or(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    two_operand(GenericOpcode::Or as u32, inst, sel)
}

fn replace_xor(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    two_operand(GenericOpcode::Xor as u32, inst, sel)
}

/// Shifts count from an immediate or from CL
fn shift(opcode: GenericOpcode, inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dst = dst_of(inst);
    out.push(mov_or_lea(&inst.operands[0], dst.clone()));
    let count = match &inst.operands[1] {
        imm @ MOperand::Immediate(_) => imm.clone(),
        other => {
            let bits = operand_bits(other);
            out.push(mov(other.clone(), phys(RegisterId::Rcx, bits)));
            phys(RegisterId::Rcx, 8)
        }
    };
    out.push(MInst {
        opcode: opcode as u32,
        reg: None,
        operands: vec![count, dst],
    });
    out
}

fn replace_shl(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    shift(GenericOpcode::Shl, inst, sel)
}

fn replace_shr(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    shift(GenericOpcode::Shr, inst, sel)
}

fn replace_sar(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    shift(GenericOpcode::Sar, inst, sel)
}

/// Division and remainder through RAX/RDX. Inputs are widened to 64
/// bits so one sequence serves every width.
fn divide(opcode: GenericOpcode, signed: bool, want_rem: bool, inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dividend = extend_to_64(&inst.operands[0], signed, sel, &mut out);
    let divisor = extend_to_64(&inst.operands[1], signed, sel, &mut out);

    out.push(mov(MOperand::Register(dividend), phys(RegisterId::Rax, 64)));
    if signed {
        // Sign-extend RAX into RDX with an arithmetic shift of the sign
        // bit (cqo without a cqo opcode).
        out.push(mov(phys(RegisterId::Rax, 64), phys(RegisterId::Rdx, 64)));
        out.push(MInst::new(
            GenericOpcode::Sar,
            None,
            vec![MOperand::Immediate(63), phys(RegisterId::Rdx, 64)],
        ));
    } else {
        out.push(mov(MOperand::Immediate(0), phys(RegisterId::Rdx, 64)));
    }
    // mov the divisor away from RAX/RDX.
    out.push(mov(MOperand::Register(divisor), phys(RegisterId::R10, 64)));
    out.push(MInst::new(
        opcode,
        None,
        vec![phys(RegisterId::R10, 64)],
    ));

    let result = if want_rem {
        RegisterId::Rdx
    } else {
        RegisterId::Rax
    };
    let dst = dst_of(inst);
    out.push(mov(phys(result, operand_bits(&dst)), dst));
    out
}

fn replace_sdiv(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    divide(GenericOpcode::SDiv, true, false, inst, sel)
}

fn replace_udiv(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    divide(GenericOpcode::UDiv, false, false, inst, sel)
}

fn replace_srem(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    divide(GenericOpcode::SRem, true, true, inst, sel)
}

fn replace_urem(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    divide(GenericOpcode::URem, false, true, inst, sel)
}

fn replace_neg(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dst = dst_of(inst);
    out.push(mov_or_lea(&inst.operands[0], dst.clone()));
    out.push(MInst::new(GenericOpcode::Neg, None, vec![dst]));
    let _ = sel;
    out
}

fn replace_compl(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dst = dst_of(inst);
    out.push(mov_or_lea(&inst.operands[0], dst.clone()));
    out.push(MInst::new(GenericOpcode::Compl, None, vec![dst]));
    let _ = sel;
    out
}

/// Logical not: dst = (src == 0)
fn replace_not(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dst = dst_of(inst);
    let src = to_reg(&inst.operands[0], sel, &mut out);
    out.push(mov(MOperand::Immediate(0), dst.clone()));
    out.push(MInst::arch(
        Opcode::Test as u32,
        vec![MOperand::Register(src), MOperand::Register(src)],
    ));
    let byte = match &dst {
        MOperand::Register(reg) => MOperand::Register(Reg::new(reg.id, 8)),
        _ => dst.clone(),
    };
    out.push(MInst::arch(Opcode::SetByteIfEqual as u32, vec![byte]));
    out
}

/// Comparison via cmp + setcc into a zeroed destination
fn compare(setcc: Opcode, negate: bool, inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dst = dst_of(inst);
    let lhs = to_reg(&inst.operands[0], sel, &mut out);
    let rhs = match &inst.operands[1] {
        imm @ MOperand::Immediate(v) if i32::try_from(*v as i64).is_ok() => imm.clone(),
        other => MOperand::Register(to_reg(other, sel, &mut out)),
    };

    out.push(mov(MOperand::Immediate(0), dst.clone()));
    // AT&T: cmp rhs, lhs sets flags for lhs ? rhs.
    out.push(MInst::arch(
        Opcode::Compare as u32,
        vec![rhs, MOperand::Register(lhs)],
    ));
    let byte = match &dst {
        MOperand::Register(reg) => MOperand::Register(Reg::new(reg.id, 8)),
        _ => dst.clone(),
    };
    out.push(MInst::arch(setcc as u32, vec![byte]));
    if negate {
        // There is no setne; invert the bit instead.
        out.push(MInst::new(
            GenericOpcode::Xor,
            None,
            vec![MOperand::Immediate(1), dst],
        ));
    }
    out
}

fn replace_eq(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfEqual, false, inst, sel)
}

fn replace_ne(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfEqual, true, inst, sel)
}

fn replace_slt(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfLessSigned, false, inst, sel)
}

fn replace_sle(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfEqualOrLessSigned, false, inst, sel)
}

fn replace_sgt(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfGreaterSigned, false, inst, sel)
}

fn replace_sge(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfEqualOrGreaterSigned, false, inst, sel)
}

fn replace_ult(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfLessUnsigned, false, inst, sel)
}

fn replace_ule(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfEqualOrLessUnsigned, false, inst, sel)
}

fn replace_ugt(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfGreaterUnsigned, false, inst, sel)
}

fn replace_uge(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    compare(Opcode::SetByteIfEqualOrGreaterUnsigned, false, inst, sel)
}

fn replace_zext(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dst = dst_of(inst);
    match &inst.operands[0] {
        imm @ MOperand::Immediate(_) => out.push(mov(imm.clone(), dst)),
        op => {
            let src = to_reg(op, sel, &mut out);
            if src.bits >= 32 {
                // A 32-bit move clears the upper half by itself.
                let (src, dst_narrow) = match &dst {
                    MOperand::Register(d) => (
                        MOperand::Register(Reg::new(src.id, src.bits)),
                        MOperand::Register(Reg::new(d.id, src.bits)),
                    ),
                    _ => (MOperand::Register(src), dst.clone()),
                };
                out.push(mov(src, dst_narrow));
            } else {
                out.push(mov(
                    MOperand::Register(Reg::new(src.id, 64)),
                    dst.clone(),
                ));
                out.push(MInst::new(
                    GenericOpcode::And,
                    None,
                    vec![MOperand::Immediate((1u64 << src.bits) - 1), dst],
                ));
            }
        }
    }
    out
}

fn replace_sext(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let src = to_reg(&inst.operands[0], sel, &mut out);
    out.push(MInst::arch(
        Opcode::MoveSignExtended as u32,
        vec![MOperand::Register(src), dst_of(inst)],
    ));
    out
}

fn replace_trunc(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let dst = dst_of(inst);
    match (&inst.operands[0], &dst) {
        (MOperand::Register(src), MOperand::Register(d)) => {
            // A register alias at the narrower width.
            out.push(mov(
                MOperand::Register(Reg::new(src.id, d.bits)),
                dst.clone(),
            ));
        }
        (op, _) => {
            let src = to_reg(op, sel, &mut out);
            out.push(mov(MOperand::Register(src), dst));
        }
    }
    out
}

fn replace_bitcast(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    out.push(mov_or_lea(&inst.operands[0], dst_of(inst)));
    let _ = sel;
    out
}

fn replace_branch(inst: &MInst, _sel: &mut SelCtx) -> Vec<MInst> {
    vec![MInst::arch(
        Opcode::Jump as u32,
        vec![inst.operands[0].clone()],
    )]
}

fn replace_cond_branch(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let cond = to_reg(&inst.operands[0], sel, &mut out);
    out.push(MInst::arch(
        Opcode::Test as u32,
        vec![MOperand::Register(cond), MOperand::Register(cond)],
    ));
    out.push(MInst::arch(
        Opcode::JumpIfZeroFlag as u32,
        vec![inst.operands[2].clone()],
    ));
    out.push(MInst::arch(
        Opcode::Jump as u32,
        vec![inst.operands[1].clone()],
    ));
    out
}

fn replace_return(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    if let Some(value) = inst.operands.first() {
        let bits = operand_bits(value);
        match value {
            MOperand::Global(_) | MOperand::Function(_) | MOperand::Local(_) => {
                out.push(MInst::arch(
                    Opcode::LoadEffectiveAddress as u32,
                    vec![value.clone(), phys(RegisterId::Return, 64)],
                ));
            }
            _ => out.push(mov(value.clone(), phys(RegisterId::Return, bits))),
        }
    }
    out.push(MInst::arch(Opcode::Return as u32, vec![]));
    let _ = sel;
    out
}

fn replace_unreachable(_inst: &MInst, _sel: &mut SelCtx) -> Vec<MInst> {
    // Nothing is emitted; control never gets here.
    vec![]
}

fn replace_call(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let callee = inst.operands[0].clone();
    let tail = matches!(inst.operands.last(), Some(MOperand::Immediate(1)));
    let args = &inst.operands[1..inst.operands.len() - 1];

    let conv = match callee {
        MOperand::Function(index) => sel.callee_convs[index as usize],
        _ => CallConv::C,
    };
    let arg_regs = sel.arg_regs(conv);
    if args.len() > arg_regs.len() {
        sel.errors.push(format!(
            "call with {} arguments needs stack-passed arguments, which are not implemented",
            args.len()
        ));
        return vec![inst.clone()];
    }

    for (arg, reg) in args.iter().zip(arg_regs.iter()) {
        move_to_phys(arg, *reg, sel, &mut out);
    }

    if tail {
        // The frame is reused: jump straight into the callee, which
        // returns to our caller.
        out.push(MInst::arch(Opcode::Jump as u32, vec![callee]));
    } else {
        out.push(MInst::arch(Opcode::Call as u32, vec![callee]));
        if let Some(dst) = inst.reg {
            out.push(mov(
                phys(RegisterId::Return, dst.bits),
                MOperand::Register(dst),
            ));
        }
    }
    out
}

fn replace_memcopy(inst: &MInst, sel: &mut SelCtx) -> Vec<MInst> {
    let mut out = Vec::new();
    let arg_regs = sel.arg_regs(CallConv::C);
    for (op, reg) in inst.operands.iter().zip(arg_regs.iter()) {
        move_to_phys(op, *reg, sel, &mut out);
    }
    out.push(MInst::arch(
        Opcode::Call as u32,
        vec![MOperand::Global(sel.memcpy)],
    ));
    out
}

/// The x86-64 selector table. Order matters: rows are tried first to
/// last and the first match fires.
pub fn patterns() -> &'static [Pattern<SelCtx>] {
    use GenericOpcode as G;
    use OperandKind::*;

    macro_rules! row {
        ($opcode:expr, [$($kind:ident),*], exact, $replace:ident) => {
            Pattern {
                opcode: $opcode as u32,
                operands: &[$($kind),*],
                exact: true,
                replace: $replace,
            }
        };
        ($opcode:expr, [$($kind:ident),*], prefix, $replace:ident) => {
            Pattern {
                opcode: $opcode as u32,
                operands: &[$($kind),*],
                exact: false,
                replace: $replace,
            }
        };
    }

    static PATTERNS: &[Pattern<SelCtx>] = &[
        row!(G::Poison, [], exact, replace_poison),
        row!(G::Copy, [Any], exact, replace_copy),
        row!(G::Alloca, [Local], exact, replace_alloca),
        row!(G::Load, [Any], exact, replace_load),
        row!(G::Store, [Any, Any], exact, replace_store),
        row!(G::Add, [Any, Any], exact, replace_add),
        row!(G::Sub, [Any, Any], exact, replace_sub),
        row!(G::Mul, [Any, Any], exact, replace_mul),
        row!(G::SDiv, [Any, Any], exact, replace_sdiv),
        row!(G::UDiv, [Any, Any], exact, replace_udiv),
        row!(G::SRem, [Any, Any], exact, replace_srem),
        row!(G::URem, [Any, Any], exact, replace_urem),
        row!(G::Shl, [Any, Any], exact, replace_shl),
        row!(G::Shr, [Any, Any], exact, replace_shr),
        row!(G::Sar, [Any, Any], exact, replace_sar),
        row!(G::And, [Any, Any], exact, replace_and),
        row!(G::Or, [Any, Any], exact, replace_or),
        row!(G::Xor, [Any, Any], exact, replace_xor),
        row!(G::Neg, [Any], exact, replace_neg),
        row!(G::Compl, [Any], exact, replace_compl),
        row!(G::Not, [Any], exact, replace_not),
        row!(G::ZExt, [Any], exact, replace_zext),
        row!(G::SExt, [Reg], exact, replace_sext),
        row!(G::SExt, [Any], exact, replace_zext),
        row!(G::Trunc, [Any], exact, replace_trunc),
        row!(G::Bitcast, [Any], exact, replace_bitcast),
        row!(G::Eq, [Any, Any], exact, replace_eq),
        row!(G::Ne, [Any, Any], exact, replace_ne),
        row!(G::SLt, [Any, Any], exact, replace_slt),
        row!(G::SLe, [Any, Any], exact, replace_sle),
        row!(G::SGt, [Any, Any], exact, replace_sgt),
        row!(G::SGe, [Any, Any], exact, replace_sge),
        row!(G::ULt, [Any, Any], exact, replace_ult),
        row!(G::ULe, [Any, Any], exact, replace_ule),
        row!(G::UGt, [Any, Any], exact, replace_ugt),
        row!(G::UGe, [Any, Any], exact, replace_uge),
        row!(G::Branch, [Block], exact, replace_branch),
        row!(G::CondBranch, [Any, Block, Block], exact, replace_cond_branch),
        row!(G::Return, [], prefix, replace_return),
        row!(G::Unreachable, [], exact, replace_unreachable),
        row!(G::Call, [Any], prefix, replace_call),
        row!(G::MemCopy, [Any, Any, Any], exact, replace_memcopy),
    ];
    PATTERNS
}
