//! GNU AT&T Assembly Emission
//!
//! Serialises post-allocation machine IR as GNU-as-compatible text:
//! %-prefixed registers, $-prefixed immediates, source before
//! destination, and size-suffixed mnemonics picked from the operand
//! widths. Every function gets a conventional rbp frame; tail calls
//! restore it before jumping.

use crate::backend::mir::{GenericOpcode, MFunction, MirModule, MOperand, Reg};
use crate::backend::x86_64::regs::RegisterId;
use crate::backend::x86_64::Opcode;
use crate::common::context::Context;
use crate::ir::Linkage;
use std::fmt::Write;

/// Emit the whole module as assembly text
pub fn emit_gnu_att_assembly(ctx: &Context, mir: &MirModule) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}: {}", mir.name, ctx.target());

    emit_data(mir, &mut out);

    let _ = writeln!(out, ".text");
    for func in &mir.funcs {
        if func.is_definition() {
            emit_function(mir, func, &mut out);
        }
    }
    out
}

fn emit_data(mir: &MirModule, out: &mut String) {
    let mut in_section = "";
    for global in &mir.globals {
        // Imported symbols have no storage here.
        if global.linkage.is_extern() && global.init.is_none() && global.bytes == 0 {
            continue;
        }
        let section = match &global.init {
            Some(_) if global.name.starts_with(".L") => ".section .rodata",
            Some(_) => ".data",
            None => ".bss",
        };
        if section != in_section {
            let _ = writeln!(out, "{}", section);
            in_section = section;
        }
        if global.linkage.is_exported() {
            let _ = writeln!(out, ".globl {}", global.name);
        }
        if global.align > 1 {
            let _ = writeln!(out, ".balign {}", global.align);
        }
        let _ = writeln!(out, "{}:", global.name);
        match &global.init {
            Some(bytes) => {
                for chunk in bytes.chunks(16) {
                    let line = chunk
                        .iter()
                        .map(|b| format!("{:#04x}", b))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let _ = writeln!(out, "    .byte {}", line);
                }
                let reserved = global.bytes.saturating_sub(bytes.len() as u64);
                if reserved > 0 {
                    let _ = writeln!(out, "    .zero {}", reserved);
                }
            }
            None => {
                let _ = writeln!(out, "    .zero {}", global.bytes.max(1));
            }
        }
    }
}

fn emit_function(mir: &MirModule, func: &MFunction, out: &mut String) {
    let (frame_size, offsets) = func.frame_layout();

    if func.linkage == Linkage::Exported {
        let _ = writeln!(out, ".globl {}", func.name);
    }
    let _ = writeln!(out, "{}:", func.name);
    let _ = writeln!(out, "    pushq %rbp");
    let _ = writeln!(out, "    movq %rsp, %rbp");
    if frame_size > 0 {
        let _ = writeln!(out, "    subq ${}, %rsp", frame_size);
    }

    for block in &func.blocks {
        let _ = writeln!(out, "{}:", block.name);
        for inst in &block.insts {
            emit_inst(mir, func, inst, &offsets, out);
        }
    }
}

fn suffix(bits: u16) -> &'static str {
    match bits {
        8 => "b",
        16 => "w",
        32 => "l",
        _ => "q",
    }
}

fn reg_name(reg: &Reg) -> String {
    match RegisterId::from_u32(reg.id) {
        Some(id) => format!("%{}", id.name(reg.bits)),
        None => crate::ice!("virtual register {} survived allocation", reg.id),
    }
}

/// Spell an operand; `deref` wraps a register address in parentheses
fn operand(
    mir: &MirModule,
    func: &MFunction,
    op: &MOperand,
    offsets: &[u64],
    deref: bool,
) -> String {
    match op {
        MOperand::Register(reg) if deref => format!("({})", reg_name(&Reg::new(reg.id, 64))),
        MOperand::Register(reg) => reg_name(reg),
        MOperand::Immediate(v) => format!("${}", *v as i64),
        MOperand::Local(index) => format!("-{}(%rbp)", offsets[*index as usize]),
        MOperand::Global(index) => format!("{}(%rip)", mir.globals[*index as usize].name),
        MOperand::Block(index) => func.blocks[*index as usize].name.clone(),
        MOperand::Function(index) => mir.funcs[*index as usize].name.clone(),
    }
}

/// Pick the operation width from the register operands
fn inst_bits(inst_operands: &[MOperand]) -> u16 {
    inst_operands
        .iter()
        .rev()
        .find_map(|op| match op {
            MOperand::Register(reg) => Some(reg.bits),
            _ => None,
        })
        .unwrap_or(64)
}

fn emit_inst(
    mir: &MirModule,
    func: &MFunction,
    inst: &crate::backend::mir::MInst,
    offsets: &[u64],
    out: &mut String,
) {
    let op = |index: usize| operand(mir, func, &inst.operands[index], offsets, false);

    match Opcode::from_u32(inst.opcode) {
        Some(Opcode::Poison) => {
            let _ = writeln!(out, "    ud2");
        }
        Some(Opcode::Return) => {
            let _ = writeln!(out, "    leave");
            let _ = writeln!(out, "    ret");
        }
        Some(Opcode::Jump) => match &inst.operands[0] {
            MOperand::Block(_) => {
                let _ = writeln!(out, "    jmp {}", op(0));
            }
            // A tail call: restore the frame, then hand over.
            _ => {
                let _ = writeln!(out, "    leave");
                let target = match &inst.operands[0] {
                    MOperand::Global(index) => mir.globals[*index as usize].name.clone(),
                    MOperand::Function(index) => mir.funcs[*index as usize].name.clone(),
                    MOperand::Register(reg) => format!("*{}", reg_name(reg)),
                    other => crate::ice!("bad jump target {:?}", other),
                };
                let _ = writeln!(out, "    jmp {}", target);
            }
        },
        Some(Opcode::JumpIfZeroFlag) => {
            let _ = writeln!(out, "    jz {}", op(0));
        }
        Some(Opcode::Call) => {
            let target = match &inst.operands[0] {
                MOperand::Function(index) => mir.funcs[*index as usize].name.clone(),
                MOperand::Global(index) => mir.globals[*index as usize].name.clone(),
                MOperand::Register(reg) => format!("*{}", reg_name(reg)),
                other => crate::ice!("bad call target {:?}", other),
            };
            let _ = writeln!(out, "    call {}", target);
        }
        Some(Opcode::Move) => {
            let bits = inst_bits(&inst.operands);
            let _ = writeln!(out, "    mov{} {}, {}", suffix(bits), op(0), op(1));
        }
        Some(Opcode::MoveDereferenceLhs) => {
            let bits = match &inst.operands[0] {
                MOperand::Register(reg) => reg.bits,
                _ => 64,
            };
            let dst = operand(mir, func, &inst.operands[1], offsets, true);
            let _ = writeln!(out, "    mov{} {}, {}", suffix(bits), op(0), dst);
        }
        Some(Opcode::MoveDereferenceRhs) => {
            let bits = match &inst.operands[1] {
                MOperand::Register(reg) => reg.bits,
                _ => 64,
            };
            let src = operand(mir, func, &inst.operands[0], offsets, true);
            let _ = writeln!(out, "    mov{} {}, {}", suffix(bits), src, op(1));
        }
        Some(Opcode::MoveSignExtended) => {
            let src_bits = match &inst.operands[0] {
                MOperand::Register(reg) => reg.bits,
                _ => 32,
            };
            let dst_bits = inst_bits(&inst.operands[1..]);
            let mnemonic = if src_bits == 32 { "movsl" } else if src_bits == 16 { "movsw" } else { "movsb" };
            let _ = writeln!(
                out,
                "    {}{} {}, {}",
                mnemonic,
                suffix(dst_bits),
                op(0),
                op(1)
            );
        }
        Some(Opcode::LoadEffectiveAddress) => {
            let _ = writeln!(out, "    leaq {}, {}", op(0), op(1));
        }
        Some(Opcode::Add) => emit_two_operand(mir, func, "add", inst, offsets, out),
        Some(Opcode::Sub) => emit_two_operand(mir, func, "sub", inst, offsets, out),
        Some(Opcode::Multiply) => emit_two_operand(mir, func, "imul", inst, offsets, out),
        Some(Opcode::Push) => {
            let _ = writeln!(out, "    pushq {}", op(0));
        }
        Some(Opcode::Pop) => {
            let _ = writeln!(out, "    popq {}", op(0));
        }
        Some(Opcode::Test) => emit_two_operand(mir, func, "test", inst, offsets, out),
        Some(Opcode::Compare) => emit_two_operand(mir, func, "cmp", inst, offsets, out),
        Some(setcc) => {
            // The remaining architecture opcodes are the setcc family.
            let _ = writeln!(out, "    {} {}", setcc.mnemonic(), op(0));
        }
        None => emit_generic(mir, func, inst, offsets, out),
    }
}

fn emit_two_operand(
    mir: &MirModule,
    func: &MFunction,
    mnemonic: &str,
    inst: &crate::backend::mir::MInst,
    offsets: &[u64],
    out: &mut String,
) {
    let bits = inst_bits(&inst.operands);
    let _ = writeln!(
        out,
        "    {}{} {}, {}",
        mnemonic,
        suffix(bits),
        operand(mir, func, &inst.operands[0], offsets, false),
        operand(mir, func, &inst.operands[1], offsets, false)
    );
}

/// Generic opcodes that survive selection in final two-operand form
fn emit_generic(
    mir: &MirModule,
    func: &MFunction,
    inst: &crate::backend::mir::MInst,
    offsets: &[u64],
    out: &mut String,
) {
    let mnemonic = match inst.generic() {
        Some(GenericOpcode::Shl) => "shl",
        Some(GenericOpcode::Shr) => "shr",
        Some(GenericOpcode::Sar) => "sar",
        Some(GenericOpcode::And) => "and",
        Some(GenericOpcode::Or) => "or",
        Some(GenericOpcode::Xor) => "xor",
        Some(GenericOpcode::Neg) => "neg",
        Some(GenericOpcode::Compl) => "not",
        Some(GenericOpcode::SDiv | GenericOpcode::SRem) => "idiv",
        Some(GenericOpcode::UDiv | GenericOpcode::URem) => "div",
        other => crate::ice!("cannot emit generic opcode {:?}", other),
    };
    match inst.operands.len() {
        1 => {
            let bits = inst_bits(&inst.operands);
            let _ = writeln!(
                out,
                "    {}{} {}",
                mnemonic,
                suffix(bits),
                operand(mir, func, &inst.operands[0], offsets, false)
            );
        }
        _ => {
            let bits = inst_bits(&inst.operands[1..]);
            let _ = writeln!(
                out,
                "    {}{} {}, {}",
                mnemonic,
                suffix(bits),
                operand(mir, func, &inst.operands[0], offsets, false),
                operand(mir, func, &inst.operands[1], offsets, false)
            );
        }
    }
}
