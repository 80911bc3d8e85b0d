//! Instruction Combination
//!
//! Everything that merges instructions or performs strength reduction or
//! constant folding goes here. At most one rewrite fires per instruction
//! per pass; the driver re-runs the pass until nothing changes.
//!
//! Folded payload overwrites go through [`Module::mutate_kind`], which
//! unregisters the old operands' uses before the payload is replaced.

use crate::common::context::Context;
use crate::ir::inst::{BinaryOp, CastOp, InstKind, UnaryOp};
use crate::ir::{FuncId, Module, ValueId};

/// Run instruction combination over `func`. Returns whether anything
/// changed.
pub fn run(ctx: &Context, module: &mut Module, func: FuncId) -> bool {
    let mut changed = false;
    for block in module.func(func).blocks.clone() {
        for inst in module.block_insts(block).to_vec() {
            changed |= combine(ctx, module, inst);
        }
    }
    changed
}

fn combine(ctx: &Context, module: &mut Module, inst: ValueId) -> bool {
    match module.kind(inst).clone() {
        InstKind::Binary { op, lhs, rhs } => combine_binary(ctx, module, inst, op, lhs, rhs),

        InstKind::Unary {
            op: UnaryOp::Compl,
            operand,
        } => {
            let Some(value) = module.as_int_constant(operand) else {
                return false;
            };
            let bits = ctx.types.int_bits(module.ty(inst)).unwrap_or(64);
            let folded = truncate(!value, bits);
            module.mutate_kind(inst, |k| *k = InstKind::IntegerConstant(folded));
            true
        }

        InstKind::CondBranch {
            cond,
            then_block,
            else_block,
        } => {
            let Some(value) = module.as_int_constant(cond) else {
                return false;
            };
            let target = if value != 0 { then_block } else { else_block };
            module.mutate_kind(inst, |k| *k = InstKind::Branch { target });
            true
        }

        InstKind::Phi { incoming } => {
            if incoming.len() != 1 {
                return false;
            }
            let value = incoming[0].1;
            module.replace_all_uses(inst, value);
            module.erase_inst(inst);
            true
        }

        InstKind::Call {
            callee,
            is_indirect: true,
            ..
        } => combine_indirect_call(module, inst, callee),

        _ => false,
    }
}

fn combine_binary(
    ctx: &Context,
    module: &mut Module,
    inst: ValueId,
    op: BinaryOp,
    lhs: ValueId,
    rhs: ValueId,
) -> bool {
    let bits = ctx.types.int_bits(module.ty(inst)).unwrap_or(64);
    let lconst = module.as_int_constant(lhs);
    let rconst = module.as_int_constant(rhs);

    // Constant folding first.
    if let (Some(a), Some(b)) = (lconst, rconst)
        && let Some(folded) = fold(op, a, b, bits)
    {
        module.mutate_kind(inst, |k| *k = InstKind::IntegerConstant(folded));
        return true;
    }

    // Identities.
    match op {
        BinaryOp::Add => {
            if lconst == Some(0) {
                return replace_with_operand(module, inst, rhs);
            }
            if rconst == Some(0) {
                return replace_with_operand(module, inst, lhs);
            }
        }
        BinaryOp::Sub => {
            if rconst == Some(0) {
                return replace_with_operand(module, inst, lhs);
            }
        }
        BinaryOp::Mul => {
            if lconst == Some(0) || rconst == Some(0) {
                module.mutate_kind(inst, |k| *k = InstKind::IntegerConstant(0));
                return true;
            }
            if lconst == Some(1) {
                return replace_with_operand(module, inst, rhs);
            }
            if rconst == Some(1) {
                return replace_with_operand(module, inst, lhs);
            }
        }
        BinaryOp::SDiv | BinaryOp::UDiv => {
            if rconst == Some(1) {
                return replace_with_operand(module, inst, lhs);
            }
            // Division by a positive power of two becomes a shift.
            if let Some(divisor) = rconst
                && divisor > 0
                && sign_extend(divisor, bits) > 0
                && divisor.is_power_of_two()
            {
                let shift_op = if op == BinaryOp::SDiv {
                    BinaryOp::Sar
                } else {
                    BinaryOp::Shr
                };
                let amount = module.new_inst(
                    InstKind::IntegerConstant(u64::from(divisor.trailing_zeros())),
                    module.ty(inst),
                    module.loc(inst),
                );
                module.insert_inst_before(module.parent_block(inst).unwrap(), amount, inst);
                module.mutate_kind(inst, |k| {
                    *k = InstKind::Binary {
                        op: shift_op,
                        lhs,
                        rhs: amount,
                    }
                });
                return true;
            }
        }
        _ => {}
    }
    false
}

fn combine_indirect_call(module: &mut Module, inst: ValueId, callee: ValueId) -> bool {
    // Resolve the callee through a FuncRef, directly or via a Bitcast.
    let resolved = match module.kind(callee) {
        InstKind::FuncRef(func) => Some((callee, *func)),
        InstKind::Cast {
            op: CastOp::Bitcast,
            operand,
        } => match module.kind(*operand) {
            InstKind::FuncRef(func) => Some((*operand, *func)),
            _ => None,
        },
        _ => None,
    };
    let Some((func_ref, func)) = resolved else {
        return false;
    };

    module.mutate_kind(inst, |k| {
        if let InstKind::Call {
            callee,
            is_indirect,
            callee_func,
            ..
        } = k
        {
            *callee = func_ref;
            *is_indirect = false;
            *callee_func = Some(func);
        }
    });
    true
}

fn replace_with_operand(module: &mut Module, inst: ValueId, keep: ValueId) -> bool {
    // The instruction itself stays behind with no users; DCE collects it.
    module.replace_all_uses(inst, keep);
    true
}

fn truncate(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

/// Evaluate `a op b` at the given width with two's-complement
/// semantics. Division by zero does not fold.
fn fold(op: BinaryOp, a: u64, b: u64, bits: u32) -> Option<u64> {
    let sa = sign_extend(a, bits);
    let sb = sign_extend(b, bits);
    let value = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::SDiv => {
            if sb == 0 {
                return None;
            }
            sa.wrapping_div(sb) as u64
        }
        BinaryOp::UDiv => {
            if b == 0 {
                return None;
            }
            truncate(a, bits) / truncate(b, bits)
        }
        BinaryOp::SRem => {
            if sb == 0 {
                return None;
            }
            sa.wrapping_rem(sb) as u64
        }
        BinaryOp::URem => {
            if b == 0 {
                return None;
            }
            truncate(a, bits) % truncate(b, bits)
        }
        BinaryOp::Shl => a.wrapping_shl(b as u32),
        BinaryOp::Shr => truncate(a, bits).wrapping_shr(b as u32),
        BinaryOp::Sar => (sa >> (b as u32).min(63)) as u64,
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
    };
    Some(truncate(value, bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;
    use crate::common::types::CallConv;
    use crate::ir::{Builder, Linkage};

    fn one_block_func(ctx: &Context, module: &mut Module) -> (FuncId, crate::ir::BlockId) {
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
        let func = module.add_function(ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);
        (func, block)
    }

    #[test]
    fn test_fold_add() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let mut module = Module::new("test");
        let (func, block) = one_block_func(&ctx, &mut module);
        let i64t = ctx.types.int(64);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let three = b.int_const(i64t, 3).unwrap();
        let four = b.int_const(i64t, 4).unwrap();
        let sum = b.binary(BinaryOp::Add, three, four).unwrap();
        b.ret(Some(sum)).unwrap();

        assert!(run(&ctx, &mut module, func));
        assert_eq!(*module.kind(sum), InstKind::IntegerConstant(7));
        // The fold transfers the Add's use-list to the new constant:
        // the return still refers to the same value id.
        assert_eq!(module.uses(sum).len(), 1);
        assert!(module.uses(three).is_empty());
        assert!(module.uses(four).is_empty());
    }

    #[test]
    fn test_fold_signed_wraps() {
        // i64 folding is closed modulo 2^64.
        assert_eq!(fold(BinaryOp::Add, u64::MAX, 1, 64), Some(0));
        assert_eq!(
            fold(BinaryOp::Mul, 0x8000_0000_0000_0000, 2, 64),
            Some(0)
        );
        assert_eq!(fold(BinaryOp::SDiv, (-8i64) as u64, 2, 64), Some((-4i64) as u64));
        assert_eq!(fold(BinaryOp::Sar, (-8i64) as u64, 1, 64), Some((-4i64) as u64));
        assert_eq!(fold(BinaryOp::Shr, (-8i64) as u64, 1, 64), Some(0x7FFF_FFFF_FFFF_FFFC));
        // Division by zero never folds.
        assert_eq!(fold(BinaryOp::SDiv, 1, 0, 64), None);
    }

    #[test]
    fn test_add_zero_identity() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let mut module = Module::new("test");
        let (func, block) = one_block_func(&ctx, &mut module);
        let i64t = ctx.types.int(64);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let zero = b.int_const(i64t, 0).unwrap();
        let sum = b.binary(BinaryOp::Add, param, zero).unwrap();
        b.ret(Some(sum)).unwrap();

        assert!(run(&ctx, &mut module, func));
        // The return now uses the parameter directly.
        assert!(module.uses(sum).is_empty());
        assert!(module.uses(param).iter().count() >= 1);
    }

    #[test]
    fn test_sdiv_power_of_two_becomes_sar() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let mut module = Module::new("test");
        let (func, block) = one_block_func(&ctx, &mut module);
        let i64t = ctx.types.int(64);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let eight = b.int_const(i64t, 8).unwrap();
        let div = b.binary(BinaryOp::SDiv, param, eight).unwrap();
        b.ret(Some(div)).unwrap();

        assert!(run(&ctx, &mut module, func));
        match module.kind(div) {
            InstKind::Binary { op, lhs, rhs } => {
                assert_eq!(*op, BinaryOp::Sar);
                assert_eq!(*lhs, param);
                assert_eq!(module.as_int_constant(*rhs), Some(3));
            }
            other => panic!("expected a shift, found {:?}", other),
        }
    }

    #[test]
    fn test_constant_condbranch_becomes_branch() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let mut module = Module::new("test");
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let entry = module.add_block(func);
        let then_block = module.add_block(func);
        let else_block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(entry);
        let cond = b.int_const(ctx.types.int(1), 1).unwrap();
        let br = b.cond_branch(cond, then_block, else_block).unwrap();
        b.position_at_end(then_block);
        let one = b.int_const(i64t, 1).unwrap();
        b.ret(Some(one)).unwrap();
        b.position_at_end(else_block);
        let zero = b.int_const(i64t, 0).unwrap();
        b.ret(Some(zero)).unwrap();

        assert!(run(&ctx, &mut module, func));
        assert_eq!(
            *module.kind(br),
            InstKind::Branch { target: then_block }
        );
        assert!(module.uses(cond).is_empty());
    }

    #[test]
    fn test_single_phi_collapses() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let mut module = Module::new("test");
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let entry = module.add_block(func);
        let next = module.add_block(func);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(entry);
        b.branch(next).unwrap();
        b.position_at_end(next);
        let phi = b.phi(i64t, vec![(entry, param)]).unwrap();
        b.ret(Some(phi)).unwrap();

        assert!(run(&ctx, &mut module, func));
        assert_eq!(*module.kind(phi), InstKind::Removed);
    }

    #[test]
    fn test_indirect_call_through_funcref_becomes_direct() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let mut module = Module::new("test");
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![], false, CallConv::C);
        let callee = module.add_function(&ctx, "callee", fty, Linkage::Internal);
        let caller = module.add_function(&ctx, "caller", fty, Linkage::Internal);
        let cb = module.add_block(callee);
        let rb = module.add_block(caller);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(cb);
        let zero = b.int_const(i64t, 0).unwrap();
        b.ret(Some(zero)).unwrap();

        b.position_at_end(rb);
        let fptr = b.func_ref(callee).unwrap();
        let result = b.call_indirect(fty, fptr, vec![]).unwrap();
        b.ret(Some(result)).unwrap();

        assert!(run(&ctx, &mut module, caller));
        match module.kind(result) {
            InstKind::Call {
                is_indirect,
                callee_func,
                ..
            } => {
                assert!(!is_indirect);
                assert_eq!(*callee_func, Some(callee));
            }
            other => panic!("expected call, found {:?}", other),
        }
    }
}
