//! Function Inlining
//!
//! Replaces direct calls to small functions with a copy of their body.
//! The cost model is a static instruction count against a fixed budget;
//! the cross-function driver runs inlining and attribute analysis to a
//! fixed point.
//!
//! An ordinary call site is inlined by splitting the calling block after
//! the call, cloning the callee's blocks into the caller with parameters
//! bound to the arguments, turning each Return into a branch to the
//! continuation and merging multiple return values through a phi.
//!
//! A call that tail-call elimination already converted sits at the end
//! of its function, so its inlined body keeps its Returns: whatever the
//! callee returned is what the caller returns.

use crate::common::context::Context;
use crate::common::types::TypeKind;
use crate::ir::inst::InstKind;
use crate::ir::{BlockId, FuncId, Module, ValueId};
use std::collections::HashMap;

/// Inline eligible call sites whose callee cost is at or below
/// `threshold`. Returns whether any call was inlined.
pub fn run(ctx: &Context, module: &mut Module, threshold: usize) -> bool {
    let mut changed = false;
    for func in module.funcs() {
        loop {
            let Some(call) = find_candidate(module, func, threshold) else {
                break;
            };
            inline_call(ctx, module, func, call);
            changed = true;
        }
    }
    changed
}

fn find_candidate(module: &Module, func: FuncId, threshold: usize) -> Option<ValueId> {
    for block in &module.func(func).blocks {
        for inst in module.block_insts(*block) {
            let InstKind::Call {
                is_indirect: false,
                tail_call,
                callee_func: Some(callee),
                ..
            } = module.kind(*inst)
            else {
                continue;
            };
            if *callee == func {
                continue;
            }
            if !eligible(module, *callee, threshold, *tail_call) {
                continue;
            }
            return Some(*inst);
        }
    }
    None
}

fn eligible(module: &Module, callee: FuncId, threshold: usize, site_is_tail: bool) -> bool {
    let data = module.func(callee);
    if !data.is_definition() {
        return false;
    }
    let mut cost = 0usize;
    for block in &data.blocks {
        for inst in module.block_insts(*block) {
            // A callee that tail-calls returns someone else's value
            // without ever reaching a Return; its body only composes at
            // a site that is itself in tail position.
            if matches!(module.kind(*inst), InstKind::Call { tail_call: true, .. })
                && !site_is_tail
            {
                return false;
            }
            cost += 1;
        }
    }
    cost <= threshold
}

fn inline_call(ctx: &Context, module: &mut Module, caller: FuncId, call: ValueId) {
    let (callee, args, site_is_tail) = match module.kind(call) {
        InstKind::Call {
            callee_func: Some(callee),
            args,
            tail_call,
            ..
        } => (*callee, args.clone(), *tail_call),
        _ => return,
    };
    let call_block = module.parent_block(call).unwrap();

    // For an ordinary site, split the calling block: everything after
    // the call moves into the continuation. A tail site keeps nothing
    // after the call (only the Unreachable marker, which goes away).
    let continuation = if site_is_tail {
        for inst in module.block_insts(call_block).to_vec().into_iter().rev() {
            if inst == call {
                break;
            }
            module.erase_inst(inst);
        }
        None
    } else {
        let continuation = module.add_block(caller);
        module.transfer_insts_after(call_block, call, continuation);
        Some(continuation)
    };

    // Clone the callee's CFG.
    let callee_blocks = module.func(callee).blocks.clone();
    let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
    for block in &callee_blocks {
        block_map.insert(*block, module.add_block(caller));
    }

    // Parameters bind to the call arguments.
    let mut value_map: HashMap<ValueId, ValueId> = HashMap::new();
    for (param, arg) in module.func(callee).params.clone().iter().zip(args.iter()) {
        value_map.insert(*param, *arg);
    }

    // Returns become branches to the continuation, collecting the
    // returned values for the merge phi. At a tail site they stay
    // Returns.
    let mut returns: Vec<(BlockId, Option<ValueId>)> = Vec::new();

    for block in &callee_blocks {
        let clone_block = block_map[block];
        for inst in module.block_insts(*block).to_vec() {
            let mut kind = module.kind(inst).clone();
            remap(&mut kind, &value_map, &block_map);

            match kind {
                InstKind::Return { value } if continuation.is_some() => {
                    let continuation = continuation.unwrap();
                    returns.push((clone_block, value));
                    let branch = module.new_inst(
                        InstKind::Branch {
                            target: continuation,
                        },
                        ctx.types.void(),
                        module.loc(inst),
                    );
                    module.push_inst(clone_block, branch);
                }
                kind => {
                    let clone = module.new_inst(kind, module.ty(inst), module.loc(inst));
                    module.push_inst(clone_block, clone);
                    value_map.insert(inst, clone);
                }
            }
        }
    }

    // Merge the returned values for the call's users.
    let ret_ty = match ctx.types.kind(module.func(callee).ty) {
        TypeKind::Function { ret, .. } => ret,
        _ => ctx.types.void(),
    };
    if let Some(continuation) = continuation
        && !ctx.types.is_void(ret_ty)
        && !module.uses(call).is_empty()
    {
        let result = match &returns[..] {
            [(_, Some(single))] => *single,
            _ => {
                let incoming = returns
                    .iter()
                    .filter_map(|(b, v)| v.map(|v| (*b, v)))
                    .collect::<Vec<_>>();
                let phi = module.new_inst(InstKind::Phi { incoming }, ret_ty, module.loc(call));
                // The phi leads the continuation block.
                match module.block_insts(continuation).first().copied() {
                    Some(first) => module.insert_inst_before(continuation, phi, first),
                    None => module.push_inst(continuation, phi),
                }
                phi
            }
        };
        module.replace_all_uses(call, result);
    }

    // The call itself becomes a branch into the inlined entry.
    let entry_clone = block_map[&callee_blocks[0]];
    module.mutate_kind(call, |k| {
        *k = InstKind::Branch {
            target: entry_clone,
        }
    });
    module.set_ty(call, ctx.types.void());
}

/// Rewrite a cloned instruction's edges through the value and block maps
fn remap(
    kind: &mut InstKind,
    value_map: &HashMap<ValueId, ValueId>,
    block_map: &HashMap<BlockId, BlockId>,
) {
    // Values first.
    let operands: Vec<ValueId> = kind.operands();
    for op in operands {
        if let Some(mapped) = value_map.get(&op) {
            kind.replace_operand(op, *mapped);
        }
    }
    // Then block references.
    match kind {
        InstKind::Branch { target } => {
            if let Some(mapped) = block_map.get(target) {
                *target = *mapped;
            }
        }
        InstKind::CondBranch {
            then_block,
            else_block,
            ..
        } => {
            if let Some(mapped) = block_map.get(then_block) {
                *then_block = *mapped;
            }
            if let Some(mapped) = block_map.get(else_block) {
                *else_block = *mapped;
            }
        }
        InstKind::Phi { incoming } => {
            for (block, _) in incoming {
                if let Some(mapped) = block_map.get(block) {
                    *block = *mapped;
                }
            }
        }
        _ => {}
    }
}
