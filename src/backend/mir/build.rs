//! Machine-IR Construction
//!
//! Walks Module → Functions → Blocks → Instructions and emits one
//! generic machine instruction per IR instruction. Every IR value gets a
//! fresh virtual register; constants are materialised as Immediate
//! operands, block references as Block operands and function references
//! as Function operands, so no instruction is emitted for them.
//!
//! The only departure from one-for-one is GetElementPtr, which is
//! flattened into explicit address arithmetic here so that instruction
//! selection only ever sees scalar operations.

use crate::backend::mir::{
    GenericOpcode, MBlock, MFunction, MGlobal, MInst, MirModule, MLocal, MOperand, Reg,
};
use crate::common::context::Context;
use crate::common::types::{TypeId, TypeKind};
use crate::ir::inst::InstKind;
use crate::ir::{BlockId, FuncId, Linkage, Module, ValueId};
use std::collections::HashMap;

/// Lower the whole module to generic machine IR
pub fn build_mir(ctx: &Context, module: &Module) -> MirModule {
    let mut mir = MirModule {
        name: module.name.clone(),
        ..Default::default()
    };

    // Function and global tables first, so operands can refer to them
    // regardless of ordering.
    let mut func_index: HashMap<FuncId, u32> = HashMap::new();
    for func in module.funcs() {
        let data = module.func(func);
        let conv = match ctx.types.kind(data.ty) {
            TypeKind::Function { conv, .. } => conv,
            _ => crate::common::types::CallConv::C,
        };
        func_index.insert(func, mir.funcs.len() as u32);
        mir.funcs
            .push(MFunction::new(data.name.clone(), data.linkage, conv));
    }

    let mut global_index: HashMap<ValueId, u32> = HashMap::new();
    for global in module.globals() {
        let InstKind::GlobalVariable { name, ty, init } = module.kind(*global) else {
            continue;
        };
        let init_bytes = init.and_then(|init| global_init_bytes(ctx, module, init, *ty));
        global_index.insert(*global, mir.globals.len() as u32);
        mir.globals.push(MGlobal {
            name: name.clone(),
            bytes: ctx.types.bytes(*ty, ctx.target()),
            align: ctx.types.align(*ty, ctx.target()),
            init: init_bytes,
            linkage: Linkage::Exported,
        });
    }

    for func in module.funcs() {
        if !module.func(func).is_definition() {
            continue;
        }
        let index = func_index[&func] as usize;
        let mut lowering = FuncLowering {
            ctx,
            module,
            mir: &mut mir,
            mfunc: MFunction::new("", Linkage::Internal, crate::common::types::CallConv::C),
            func_index: &func_index,
            global_index: &global_index,
            vmap: HashMap::new(),
            slots: HashMap::new(),
            block_index: HashMap::new(),
        };
        std::mem::swap(&mut lowering.mfunc, &mut lowering.mir.funcs[index]);
        lowering.lower_function(func);
        let mfunc = lowering.mfunc;
        mir.funcs[index] = mfunc;
    }

    mir
}

/// Encode a constant initialiser into raw bytes, little endian
fn global_init_bytes(
    ctx: &Context,
    module: &Module,
    init: ValueId,
    ty: TypeId,
) -> Option<Vec<u8>> {
    match module.kind(init) {
        InstKind::IntegerConstant(v) | InstKind::LitInteger(v) => {
            let size = ctx.types.bytes(ty, ctx.target()).min(8) as usize;
            Some(v.to_le_bytes()[..size].to_vec())
        }
        InstKind::ArrayConstant(data) => Some(data.clone()),
        InstKind::LitString(s) => {
            let mut bytes = s.clone().into_bytes();
            bytes.push(0);
            Some(bytes)
        }
        _ => None,
    }
}

struct FuncLowering<'a> {
    ctx: &'a Context,
    module: &'a Module,
    mir: &'a mut MirModule,
    mfunc: MFunction,
    func_index: &'a HashMap<FuncId, u32>,
    global_index: &'a HashMap<ValueId, u32>,
    vmap: HashMap<ValueId, Reg>,
    slots: HashMap<ValueId, u32>,
    block_index: HashMap<BlockId, u32>,
}

impl<'a> FuncLowering<'a> {
    fn lower_function(&mut self, func: FuncId) {
        let blocks = self.module.func(func).blocks.clone();
        for (index, block) in blocks.iter().enumerate() {
            self.block_index.insert(*block, index as u32);
            self.mfunc.blocks.push(MBlock {
                name: format!(".L{}_bb{}", self.module.func(func).name, index),
                insts: Vec::new(),
            });
        }

        let params = self.module.func(func).params.clone();
        self.mfunc.params = params.iter().map(|p| self.reg_of(*p)).collect();

        for (index, block) in blocks.iter().enumerate() {
            let mut insts = Vec::new();
            for inst in self.module.block_insts(*block) {
                self.lower_inst(*inst, &mut insts);
            }
            self.mfunc.blocks[index].insts = insts;
        }
    }

    /// Width of a value when held in a register
    fn bits_of(&self, value: ValueId) -> u16 {
        let bits = self
            .ctx
            .types
            .bits(self.module.ty(value), self.ctx.target())
            .clamp(8, 64) as u16;
        bits.next_power_of_two().max(8)
    }

    /// The virtual register bound to an IR value, created on first sight
    /// (phis may refer to values that lower later)
    fn reg_of(&mut self, value: ValueId) -> Reg {
        if let Some(reg) = self.vmap.get(&value) {
            return *reg;
        }
        let reg = self.mfunc.fresh_vreg(self.bits_of(value));
        self.vmap.insert(value, reg);
        reg
    }

    /// Materialise an IR value as a machine operand
    fn operand_of(&mut self, value: ValueId) -> MOperand {
        match self.module.kind(value) {
            InstKind::IntegerConstant(v) | InstKind::LitInteger(v) => MOperand::Immediate(*v),
            InstKind::Poison => MOperand::Immediate(0),
            InstKind::FuncRef(func) => MOperand::Function(self.func_index[func]),
            InstKind::GlobalVariable { .. } => MOperand::Global(self.global_index[&value]),
            InstKind::LitString(s) => {
                let mut bytes = s.clone().into_bytes();
                bytes.push(0);
                let index = self.intern_data(bytes);
                MOperand::Global(index)
            }
            InstKind::ArrayConstant(data) => {
                let index = self.intern_data(data.clone());
                MOperand::Global(index)
            }
            _ => MOperand::Register(self.reg_of(value)),
        }
    }

    /// Anonymous read-only data gets a synthetic private symbol
    fn intern_data(&mut self, data: Vec<u8>) -> u32 {
        let index = self.mir.globals.len() as u32;
        self.mir.globals.push(MGlobal {
            name: format!(".Lrodata{}", index),
            bytes: data.len() as u64,
            align: 1,
            init: Some(data),
            linkage: Linkage::Internal,
        });
        index
    }

    fn block_operand(&self, block: BlockId) -> MOperand {
        MOperand::Block(self.block_index[&block])
    }

    fn lower_inst(&mut self, inst: ValueId, out: &mut Vec<MInst>) {
        match self.module.kind(inst).clone() {
            // Constants and references become operands at their uses.
            InstKind::IntegerConstant(_)
            | InstKind::ArrayConstant(_)
            | InstKind::Poison
            | InstKind::GlobalVariable { .. }
            | InstKind::FuncRef(_)
            | InstKind::LitInteger(_)
            | InstKind::LitString(_)
            | InstKind::Parameter { .. }
            | InstKind::Removed => {}

            InstKind::Alloca { allocated } => {
                let slot = self.mfunc.frame.len() as u32;
                self.mfunc.frame.push(MLocal {
                    bytes: self.ctx.types.bytes(allocated, self.ctx.target()).max(1),
                    align: self.ctx.types.align(allocated, self.ctx.target()).max(1),
                });
                self.slots.insert(inst, slot);
                let reg = self.reg_of(inst);
                out.push(MInst::new(
                    GenericOpcode::Alloca,
                    Some(reg),
                    vec![MOperand::Local(slot)],
                ));
            }

            InstKind::Load { ptr } => {
                let src = self.operand_of(ptr);
                let reg = self.reg_of(inst);
                out.push(MInst::new(GenericOpcode::Load, Some(reg), vec![src]));
            }

            InstKind::Store { value, ptr } => {
                let value = self.operand_of(value);
                let addr = self.operand_of(ptr);
                out.push(MInst::new(GenericOpcode::Store, None, vec![value, addr]));
            }

            InstKind::GetElementPtr {
                elem,
                base,
                indices,
            } => self.lower_gep(inst, elem, base, &indices, out),

            InstKind::Copy { value } => {
                let src = self.operand_of(value);
                let reg = self.reg_of(inst);
                out.push(MInst::new(GenericOpcode::Copy, Some(reg), vec![src]));
            }

            InstKind::Binary { op, lhs, rhs } => {
                use crate::ir::inst::BinaryOp;
                let opcode = match op {
                    BinaryOp::Add => GenericOpcode::Add,
                    BinaryOp::Sub => GenericOpcode::Sub,
                    BinaryOp::Mul => GenericOpcode::Mul,
                    BinaryOp::SDiv => GenericOpcode::SDiv,
                    BinaryOp::UDiv => GenericOpcode::UDiv,
                    BinaryOp::SRem => GenericOpcode::SRem,
                    BinaryOp::URem => GenericOpcode::URem,
                    BinaryOp::Shl => GenericOpcode::Shl,
                    BinaryOp::Shr => GenericOpcode::Shr,
                    BinaryOp::Sar => GenericOpcode::Sar,
                    BinaryOp::And => GenericOpcode::And,
                    BinaryOp::Or => GenericOpcode::Or,
                    BinaryOp::Xor => GenericOpcode::Xor,
                };
                let lhs = self.operand_of(lhs);
                let rhs = self.operand_of(rhs);
                let reg = self.reg_of(inst);
                out.push(MInst::new(opcode, Some(reg), vec![lhs, rhs]));
            }

            InstKind::Unary { op, operand } => {
                use crate::ir::inst::UnaryOp;
                let opcode = match op {
                    UnaryOp::Neg => GenericOpcode::Neg,
                    UnaryOp::Compl => GenericOpcode::Compl,
                    UnaryOp::Not => GenericOpcode::Not,
                };
                let operand = self.operand_of(operand);
                let reg = self.reg_of(inst);
                out.push(MInst::new(opcode, Some(reg), vec![operand]));
            }

            InstKind::Cast { op, operand } => {
                use crate::ir::inst::CastOp;
                let opcode = match op {
                    CastOp::ZExt => GenericOpcode::ZExt,
                    CastOp::SExt => GenericOpcode::SExt,
                    CastOp::Trunc => GenericOpcode::Trunc,
                    CastOp::Bitcast => GenericOpcode::Bitcast,
                };
                let operand = self.operand_of(operand);
                let reg = self.reg_of(inst);
                out.push(MInst::new(opcode, Some(reg), vec![operand]));
            }

            InstKind::Compare { op, lhs, rhs } => {
                use crate::ir::inst::CompareOp;
                let opcode = match op {
                    CompareOp::Eq => GenericOpcode::Eq,
                    CompareOp::Ne => GenericOpcode::Ne,
                    CompareOp::SLt => GenericOpcode::SLt,
                    CompareOp::SLe => GenericOpcode::SLe,
                    CompareOp::SGt => GenericOpcode::SGt,
                    CompareOp::SGe => GenericOpcode::SGe,
                    CompareOp::ULt => GenericOpcode::ULt,
                    CompareOp::ULe => GenericOpcode::ULe,
                    CompareOp::UGt => GenericOpcode::UGt,
                    CompareOp::UGe => GenericOpcode::UGe,
                };
                let lhs = self.operand_of(lhs);
                let rhs = self.operand_of(rhs);
                let reg = self.reg_of(inst);
                out.push(MInst::new(opcode, Some(reg), vec![lhs, rhs]));
            }

            InstKind::Branch { target } => {
                let target = self.block_operand(target);
                out.push(MInst::new(GenericOpcode::Branch, None, vec![target]));
            }

            InstKind::CondBranch {
                cond,
                then_block,
                else_block,
            } => {
                let cond = self.operand_of(cond);
                let then_block = self.block_operand(then_block);
                let else_block = self.block_operand(else_block);
                out.push(MInst::new(
                    GenericOpcode::CondBranch,
                    None,
                    vec![cond, then_block, else_block],
                ));
            }

            InstKind::Return { value } => {
                let operands = match value {
                    Some(value) => vec![self.operand_of(value)],
                    None => vec![],
                };
                out.push(MInst::new(GenericOpcode::Return, None, operands));
            }

            InstKind::Unreachable => {
                out.push(MInst::new(GenericOpcode::Unreachable, None, vec![]));
            }

            InstKind::Phi { incoming } => {
                let reg = self.reg_of(inst);
                let mut operands = Vec::with_capacity(incoming.len() * 2);
                for (block, value) in incoming {
                    operands.push(self.block_operand(block));
                    operands.push(self.operand_of(value));
                }
                out.push(MInst::new(GenericOpcode::Phi, Some(reg), operands));
            }

            InstKind::Call {
                callee,
                args,
                is_indirect,
                tail_call,
                callee_func,
            } => {
                let callee = match (is_indirect, callee_func) {
                    (false, Some(func)) => MOperand::Function(self.func_index[&func]),
                    _ => self.operand_of(callee),
                };
                let mut operands = vec![callee];
                for arg in args {
                    let arg = self.operand_of(arg);
                    operands.push(arg);
                }
                operands.push(MOperand::Immediate(u64::from(tail_call)));
                let reg = (!self.ctx.types.is_void(self.module.ty(inst))
                    && !self.module.uses(inst).is_empty())
                .then(|| self.reg_of(inst));
                out.push(MInst::new(GenericOpcode::Call, reg, operands));
            }

            InstKind::MemCopy { dest, src, bytes } => {
                let dest = self.operand_of(dest);
                let src = self.operand_of(src);
                let bytes = self.operand_of(bytes);
                out.push(MInst::new(
                    GenericOpcode::MemCopy,
                    None,
                    vec![dest, src, bytes],
                ));
            }
        }
    }

    /// Flatten pointer arithmetic into Copy/Mul/Add over the element
    /// size
    fn lower_gep(
        &mut self,
        inst: ValueId,
        elem: TypeId,
        base: ValueId,
        indices: &[ValueId],
        out: &mut Vec<MInst>,
    ) {
        let addr = self.reg_of(inst);
        let base = self.operand_of(base);
        out.push(MInst::new(GenericOpcode::Copy, Some(addr), vec![base]));

        let mut elem = elem;
        let mut constant_offset = 0i64;
        for (depth, index) in indices.iter().enumerate() {
            let scale = self.ctx.types.bytes(elem, self.ctx.target()) as i64;
            if let Some(c) = self.module.as_int_constant(*index) {
                constant_offset += c as i64 * scale;
            } else {
                let scaled = self.mfunc.fresh_vreg(64);
                let index = self.operand_of(*index);
                out.push(MInst::new(
                    GenericOpcode::Mul,
                    Some(scaled),
                    vec![index, MOperand::Immediate(scale as u64)],
                ));
                out.push(MInst::new(
                    GenericOpcode::Add,
                    Some(addr),
                    vec![MOperand::Register(addr), MOperand::Register(scaled)],
                ));
            }
            // Deeper indices step over the nested element type.
            if depth + 1 < indices.len() {
                elem = match self.ctx.types.kind(elem) {
                    TypeKind::Array { elem, .. } => elem,
                    _ => elem,
                };
            }
        }
        if constant_offset != 0 {
            out.push(MInst::new(
                GenericOpcode::Add,
                Some(addr),
                vec![
                    MOperand::Register(addr),
                    MOperand::Immediate(constant_offset as u64),
                ],
            ));
        }
    }
}
