//! Tail-Call Elimination
//!
//! A call is a tail call iff, walking from the call to every reachable
//! Return, the only intervening instructions are branches and phis whose
//! reaching definition is the call (transitively through earlier phis on
//! the same path), and each such Return returns the call's value. The
//! call is then flagged and its block's terminator becomes Unreachable;
//! the actual frame reuse happens in the backend, which emits `jmp`
//! instead of `call`/`ret`.
//!
//! At most one call per block is converted.

use crate::common::context::Context;
use crate::ir::inst::InstKind;
use crate::ir::{BlockId, FuncId, Module, ValueId};

/// Run tail-call elimination over `func`. Returns whether any call was
/// newly converted.
pub fn run(ctx: &Context, module: &mut Module, func: FuncId) -> bool {
    let mut changed = false;
    for block in module.func(func).blocks.clone() {
        for inst in module.block_insts(block).to_vec() {
            let InstKind::Call { tail_call, .. } = module.kind(inst) else {
                continue;
            };
            if *tail_call {
                continue;
            }
            if tail_call_possible(module, inst, block) {
                module.mutate_kind(inst, |k| {
                    if let InstKind::Call { tail_call, .. } = k {
                        *tail_call = true;
                    }
                });
                module.mark_unreachable(ctx, block);
                changed = true;
                // One conversion per block.
                break;
            }
        }
    }
    changed
}

fn tail_call_possible(module: &Module, call: ValueId, call_block: BlockId) -> bool {
    let mut phis: Vec<ValueId> = Vec::new();
    let mut visited: Vec<BlockId> = Vec::new();
    walk(module, call, call_block, true, &mut phis, &mut visited)
}

/// Walk forward from the call (or from the top of a successor block)
/// and decide whether every path reaches a Return of the call's value
/// through nothing but branches and call-fed phis.
fn walk(
    module: &Module,
    call: ValueId,
    block: BlockId,
    from_call: bool,
    phis: &mut Vec<ValueId>,
    visited: &mut Vec<BlockId>,
) -> bool {
    if !from_call {
        if visited.contains(&block) {
            // A cycle without an intervening Return cannot retire the
            // call's value.
            return false;
        }
        visited.push(block);
    }

    let insts = module.block_insts(block);
    let start = if from_call {
        insts.iter().position(|i| *i == call).map(|p| p + 1).unwrap_or(0)
    } else {
        0
    };

    for inst in &insts[start..] {
        match module.kind(*inst) {
            InstKind::Phi { incoming } => {
                // The phi must be fed by the call or by a phi already on
                // this path.
                let fed = incoming
                    .iter()
                    .any(|(_, v)| *v == call || phis.contains(v));
                if !fed {
                    return false;
                }
                phis.push(*inst);
            }

            InstKind::Return { value } => {
                return match value {
                    Some(v) => *v == call || phis.contains(v),
                    None => false,
                };
            }

            InstKind::Branch { target } => {
                return walk(module, call, *target, false, phis, visited);
            }

            InstKind::CondBranch {
                then_block,
                else_block,
                ..
            } => {
                return walk(module, call, *then_block, false, phis, visited)
                    && walk(module, call, *else_block, false, phis, visited);
            }

            // Anything else between the call and the return disqualifies
            // it.
            _ => return false,
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;
    use crate::common::types::CallConv;
    use crate::ir::{Builder, Linkage};

    fn setup() -> (Context, Module) {
        (Context::new(Target::X86_64_LINUX), Module::new("test"))
    }

    #[test]
    fn test_call_then_return_is_tail() {
        let (ctx, mut module) = setup();
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
        let callee = module.add_function(&ctx, "g", fty, Linkage::Imported);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let result = b.call(callee, vec![param]).unwrap();
        b.ret(Some(result)).unwrap();

        assert!(run(&ctx, &mut module, func));
        assert!(matches!(
            module.kind(result),
            InstKind::Call {
                tail_call: true,
                ..
            }
        ));
        // The block is dead for code generation past the call.
        assert!(matches!(
            module.kind(module.terminator(block).unwrap()),
            InstKind::Unreachable
        ));
    }

    #[test]
    fn test_intervening_arithmetic_blocks_tail() {
        let (ctx, mut module) = setup();
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
        let callee = module.add_function(&ctx, "g", fty, Linkage::Imported);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let result = b.call(callee, vec![param]).unwrap();
        let bumped = b
            .binary(crate::ir::inst::BinaryOp::Add, result, param)
            .unwrap();
        b.ret(Some(bumped)).unwrap();

        assert!(!run(&ctx, &mut module, func));
    }

    #[test]
    fn test_tail_through_branch_and_phi() {
        let (ctx, mut module) = setup();
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
        let callee = module.add_function(&ctx, "g", fty, Linkage::Imported);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let entry = module.add_block(func);
        let exit = module.add_block(func);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(entry);
        let result = b.call(callee, vec![param]).unwrap();
        b.branch(exit).unwrap();
        b.position_at_end(exit);
        let phi = b.phi(i64t, vec![(entry, result)]).unwrap();
        b.ret(Some(phi)).unwrap();

        assert!(run(&ctx, &mut module, func));
        assert!(matches!(
            module.kind(result),
            InstKind::Call {
                tail_call: true,
                ..
            }
        ));
    }

    #[test]
    fn test_return_of_other_value_blocks_tail() {
        let (ctx, mut module) = setup();
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
        let callee = module.add_function(&ctx, "g", fty, Linkage::Imported);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        b.call(callee, vec![param]).unwrap();
        b.ret(Some(param)).unwrap();

        assert!(!run(&ctx, &mut module, func));
    }

    #[test]
    fn test_second_run_reports_no_change() {
        let (ctx, mut module) = setup();
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
        let callee = module.add_function(&ctx, "g", fty, Linkage::Imported);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);
        let param = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let result = b.call(callee, vec![param]).unwrap();
        b.ret(Some(result)).unwrap();

        assert!(run(&ctx, &mut module, func));
        assert!(!run(&ctx, &mut module, func));
    }
}
