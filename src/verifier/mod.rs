//! IR Verifier
//!
//! Independent checking of the structural invariants every module must
//! satisfy after construction and after every pass:
//!
//! 1. Every instruction is owned by exactly one block.
//! 2. A block's terminator is its final instruction and nothing follows
//!    it; every block of a definition ends in a terminator.
//! 3. Use-lists are symmetric: `u` references `v` as an operand exactly
//!    as often as `u` appears in `uses(v)`.
//! 4. Operand types satisfy the per-kind constraints.
//! 5. Phis carry exactly one incoming value per predecessor.
//! 6. Return operands match the enclosing function's return type.
//!
//! The verifier never mutates; it is run at pipeline boundaries in
//! debug builds and throughout the test suite.

use crate::common::context::Context;
use crate::common::types::TypeKind;
use crate::ir::inst::InstKind;
use crate::ir::{BlockId, Module, ValueId};
use std::collections::HashMap;
use std::fmt;

/// A violated invariant
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyError {
    /// Instruction's recorded parent disagrees with the block that lists it
    WrongParent { inst: ValueId, block: BlockId },
    /// Instruction appears in more than one block list
    MultipleParents { inst: ValueId },
    /// Non-terminator in terminator position, or block without one
    MissingTerminator { block: BlockId },
    /// Instruction placed after the terminator
    InstructionAfterTerminator { block: BlockId, inst: ValueId },
    /// `user` references `value` but is missing from its use-list (or
    /// the counts disagree)
    BrokenUseList { value: ValueId, user: ValueId },
    /// Use-list names a user that does not reference the value
    StaleUse { value: ValueId, user: ValueId },
    /// Operand types violate the instruction's constraints
    TypeMismatch { inst: ValueId, detail: String },
    /// Phi incoming list disagrees with the block's predecessors
    MalformedPhi { inst: ValueId, detail: String },
    /// Return operand type does not match the function's return type
    BadReturn { inst: ValueId, detail: String },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::WrongParent { inst, block } => {
                write!(f, "{} is listed in {} but records another parent", inst, block)
            }
            VerifyError::MultipleParents { inst } => {
                write!(f, "{} appears in more than one block", inst)
            }
            VerifyError::MissingTerminator { block } => {
                write!(f, "{} does not end in a terminator", block)
            }
            VerifyError::InstructionAfterTerminator { block, inst } => {
                write!(f, "{} follows the terminator of {}", inst, block)
            }
            VerifyError::BrokenUseList { value, user } => {
                write!(f, "use-list of {} is missing user {}", value, user)
            }
            VerifyError::StaleUse { value, user } => {
                write!(f, "use-list of {} names {} which does not use it", value, user)
            }
            VerifyError::TypeMismatch { inst, detail } => {
                write!(f, "type constraint violated at {}: {}", inst, detail)
            }
            VerifyError::MalformedPhi { inst, detail } => {
                write!(f, "malformed phi {}: {}", inst, detail)
            }
            VerifyError::BadReturn { inst, detail } => {
                write!(f, "bad return {}: {}", inst, detail)
            }
        }
    }
}

/// Verify every invariant over the whole module
pub fn verify_module(ctx: &Context, module: &Module) -> Result<(), Vec<VerifyError>> {
    let mut errors = Vec::new();

    check_ownership(module, &mut errors);
    check_use_lists(module, &mut errors);

    for func in module.funcs() {
        for block in module.func(func).blocks.clone() {
            check_terminator(module, block, &mut errors);
            for inst in module.block_insts(block) {
                check_types(ctx, module, *inst, &mut errors);
                check_phi(module, block, *inst, &mut errors);
                check_return(ctx, module, func, *inst, &mut errors);
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_ownership(module: &Module, errors: &mut Vec<VerifyError>) {
    let mut seen: HashMap<ValueId, BlockId> = HashMap::new();
    for func in module.funcs() {
        for block in &module.func(func).blocks {
            for inst in module.block_insts(*block) {
                if module.parent_block(*inst) != Some(*block) {
                    errors.push(VerifyError::WrongParent {
                        inst: *inst,
                        block: *block,
                    });
                }
                if seen.insert(*inst, *block).is_some() {
                    errors.push(VerifyError::MultipleParents { inst: *inst });
                }
            }
        }
    }
}

fn check_terminator(module: &Module, block: BlockId, errors: &mut Vec<VerifyError>) {
    let insts = module.block_insts(block);
    match insts.last() {
        Some(last) if module.kind(*last).is_terminator() => {}
        _ => errors.push(VerifyError::MissingTerminator { block }),
    }
    for inst in insts.iter().take(insts.len().saturating_sub(1)) {
        if module.kind(*inst).is_terminator() {
            errors.push(VerifyError::InstructionAfterTerminator {
                block,
                inst: *inst,
            });
        }
    }
}

fn check_use_lists(module: &Module, errors: &mut Vec<VerifyError>) {
    // Forward: every operand occurrence has a matching use entry.
    let mut expected: HashMap<(ValueId, ValueId), usize> = HashMap::new();
    let mut visit = |user: ValueId, module: &Module| {
        module.kind(user).for_each_operand(|op| {
            *expected.entry((op, user)).or_insert(0) += 1;
        });
    };
    for func in module.funcs() {
        for block in &module.func(func).blocks {
            for inst in module.block_insts(*block) {
                visit(*inst, module);
            }
        }
    }
    for global in module.globals() {
        visit(*global, module);
    }

    for ((value, user), count) in &expected {
        let actual = module.uses(*value).iter().filter(|u| *u == user).count();
        if actual != *count {
            errors.push(VerifyError::BrokenUseList {
                value: *value,
                user: *user,
            });
        }
    }

    // Backward: every use entry corresponds to a real operand occurrence.
    for func in module.funcs() {
        for block in &module.func(func).blocks {
            for inst in module.block_insts(*block) {
                for user in module.uses(*inst) {
                    let occurrences = module
                        .kind(*user)
                        .operands()
                        .iter()
                        .filter(|op| *op == inst)
                        .count();
                    if occurrences == 0 {
                        errors.push(VerifyError::StaleUse {
                            value: *inst,
                            user: *user,
                        });
                    }
                }
            }
        }
    }
}

fn check_types(ctx: &Context, module: &Module, inst: ValueId, errors: &mut Vec<VerifyError>) {
    let mut mismatch = |detail: String| {
        errors.push(VerifyError::TypeMismatch { inst, detail });
    };
    match module.kind(inst) {
        InstKind::Binary { lhs, rhs, .. } => {
            let lty = module.ty(*lhs);
            let rty = module.ty(*rhs);
            if !ctx.types.is_integer(lty) {
                mismatch(format!("operand type {} is not integer", ctx.types.display(lty)));
            } else if lty != rty {
                mismatch(format!(
                    "operand types {} and {} differ",
                    ctx.types.display(lty),
                    ctx.types.display(rty)
                ));
            } else if module.ty(inst) != lty {
                mismatch("result type differs from operand type".to_string());
            }
        }
        InstKind::Compare { lhs, rhs, .. } => {
            if module.ty(*lhs) != module.ty(*rhs) {
                mismatch("compared types differ".to_string());
            }
            if ctx.types.int_bits(module.ty(inst)) != Some(1) {
                mismatch("compare result is not i1".to_string());
            }
        }
        InstKind::Load { ptr } | InstKind::Store { ptr, .. } => {
            if !ctx.types.is_pointer(module.ty(*ptr)) {
                mismatch("address operand is not a pointer".to_string());
            }
        }
        InstKind::GetElementPtr { base, indices, .. } => {
            if !ctx.types.is_pointer(module.ty(*base)) {
                mismatch("gep base is not a pointer".to_string());
            }
            for index in indices {
                if !ctx.types.is_integer(module.ty(*index)) {
                    mismatch("gep index is not an integer".to_string());
                }
            }
        }
        InstKind::MemCopy { dest, src, bytes } => {
            if !ctx.types.is_pointer(module.ty(*dest)) || !ctx.types.is_pointer(module.ty(*src)) {
                mismatch("memcopy endpoints must be pointers".to_string());
            }
            if !ctx.types.is_integer(module.ty(*bytes)) {
                mismatch("memcopy length must be an integer".to_string());
            }
        }
        InstKind::CondBranch { cond, .. } => {
            if !ctx.types.is_integer(module.ty(*cond)) {
                mismatch("branch condition is not an integer".to_string());
            }
        }
        _ => {}
    }
}

fn check_phi(module: &Module, block: BlockId, inst: ValueId, errors: &mut Vec<VerifyError>) {
    let InstKind::Phi { incoming } = module.kind(inst) else {
        return;
    };
    let preds = module.predecessors(block);
    for pred in &preds {
        let count = incoming.iter().filter(|(b, _)| b == pred).count();
        if count != 1 {
            errors.push(VerifyError::MalformedPhi {
                inst,
                detail: format!("{} incoming value(s) for predecessor {}", count, pred),
            });
        }
    }
    for (b, _) in incoming {
        if !preds.contains(b) {
            errors.push(VerifyError::MalformedPhi {
                inst,
                detail: format!("incoming block {} is not a predecessor", b),
            });
        }
    }
}

fn check_return(
    ctx: &Context,
    module: &Module,
    func: crate::ir::FuncId,
    inst: ValueId,
    errors: &mut Vec<VerifyError>,
) {
    let InstKind::Return { value } = module.kind(inst) else {
        return;
    };
    let ret_ty = match ctx.types.kind(module.func(func).ty) {
        TypeKind::Function { ret, .. } => ret,
        _ => return,
    };
    match value {
        Some(v) if module.ty(*v) != ret_ty => {
            errors.push(VerifyError::BadReturn {
                inst,
                detail: format!(
                    "returns {} from a function of return type {}",
                    ctx.types.display(module.ty(*v)),
                    ctx.types.display(ret_ty)
                ),
            });
        }
        None if !ctx.types.is_void(ret_ty) => {
            errors.push(VerifyError::BadReturn {
                inst,
                detail: "missing return value".to_string(),
            });
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;
    use crate::common::types::CallConv;
    use crate::ir::inst::BinaryOp;
    use crate::ir::{Builder, Linkage};

    fn setup() -> (Context, Module) {
        (Context::new(Target::X86_64_LINUX), Module::new("test"))
    }

    #[test]
    fn test_well_formed_module_passes() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(i32t, vec![i32t], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let doubled = b.binary(BinaryOp::Add, param, param).unwrap();
        b.ret(Some(doubled)).unwrap();

        assert!(verify_module(&ctx, &module).is_ok());
    }

    #[test]
    fn test_missing_terminator_detected() {
        let (ctx, mut module) = setup();
        let fty = ctx
            .types
            .function(ctx.types.void(), vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        b.int_const(ctx.types.int(32), 1).unwrap();

        let errors = verify_module(&ctx, &module).unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, VerifyError::MissingTerminator { .. }))
        );
    }

    #[test]
    fn test_phi_per_predecessor() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(i32t, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let entry = module.add_block(func);
        let merge = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(entry);
        let one = b.int_const(i32t, 1).unwrap();
        b.branch(merge).unwrap();

        b.position_at_end(merge);
        // Phi names a block that is not a predecessor of `merge`.
        let phi = b.phi(i32t, vec![(merge, one)]).unwrap();
        b.ret(Some(phi)).unwrap();

        let errors = verify_module(&ctx, &module).unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, VerifyError::MalformedPhi { .. }))
        );
    }
}
