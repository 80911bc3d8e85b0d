//! Block Reordering and Jump Threading
//!
//! Reordering lays a function's blocks out along a preorder walk of the
//! dominator tree, biased so that a Branch target (or the then-target of
//! a CondBranch) lands immediately after its predecessor. Blocks the
//! dominator tree never reaches are unreachable and are dropped, with
//! any phi edges from them pruned first. The CFG edge set among the
//! surviving blocks is untouched.
//!
//! Jump threading removes blocks that consist of a single unconditional
//! Branch, retargeting every predecessor past them, and collapses
//! conditional branches whose arms agree.

use crate::analysis::DomTree;
use crate::common::context::Context;
use crate::ir::inst::InstKind;
use crate::ir::{BlockId, FuncId, Module};

/// Reorder `func`'s blocks along the dominator tree, dropping
/// unreachable blocks.
pub fn reorder_blocks(module: &mut Module, func: FuncId, doms: &DomTree) {
    let mut order: Vec<BlockId> = Vec::new();
    let mut stack = vec![doms.root];
    let mut visited = vec![doms.root];

    while let Some(block) = stack.pop() {
        order.push(block);

        // The fall-through target goes on top of the stack so it is
        // emitted right after this block.
        let next = match module.terminator(block).map(|t| module.kind(t)) {
            Some(InstKind::Branch { target }) => Some(*target),
            Some(InstKind::CondBranch { then_block, .. }) => Some(*then_block),
            _ => None,
        };

        let mut deferred = None;
        for child in doms.children(block) {
            if Some(*child) == next {
                deferred = Some(*child);
                continue;
            }
            if !visited.contains(child) {
                visited.push(*child);
                stack.push(*child);
            }
        }
        if let Some(next_child) = deferred
            && !visited.contains(&next_child)
        {
            visited.push(next_child);
            stack.push(next_child);
        }
    }

    // Anything the dominator tree never reached is unreachable code.
    let dropped: Vec<BlockId> = module
        .func(func)
        .blocks
        .iter()
        .copied()
        .filter(|b| !order.contains(b))
        .collect();
    for dead in &dropped {
        prune_phi_edges_from(module, func, *dead);
    }
    for dead in dropped {
        module.remove_block(dead);
    }

    module.func_mut(func).blocks = order;
}

/// Remove phi incoming entries that name `pred` in every surviving block
fn prune_phi_edges_from(module: &mut Module, func: FuncId, pred: BlockId) {
    for block in module.func(func).blocks.clone() {
        if block == pred {
            continue;
        }
        for inst in module.block_insts(block).to_vec() {
            if matches!(module.kind(inst), InstKind::Phi { .. }) {
                module.mutate_kind(inst, |k| {
                    if let InstKind::Phi { incoming } = k {
                        incoming.retain(|(b, _)| *b != pred);
                    }
                });
            }
        }
    }
}

/// Run jump threading over `func`. Returns whether anything changed.
pub fn run(_ctx: &Context, module: &mut Module, func: FuncId) -> bool {
    let mut changed = false;

    // Collapse conditional branches with identical arms first; it can
    // expose single-branch blocks below.
    for block in module.func(func).blocks.clone() {
        if let Some(term) = module.terminator(block)
            && let InstKind::CondBranch {
                then_block,
                else_block,
                ..
            } = module.kind(term)
            && then_block == else_block
        {
            let target = *then_block;
            module.mutate_kind(term, |k| *k = InstKind::Branch { target });
            changed = true;
        }
    }

    // Remove blocks that are a single unconditional branch.
    for block in module.func(func).blocks.clone() {
        // The entry block stays put: removing it would re-root the CFG.
        if block == module.func(func).blocks[0] {
            continue;
        }
        let insts = module.block_insts(block);
        if insts.len() != 1 {
            continue;
        }
        let InstKind::Branch { target } = *module.kind(insts[0]) else {
            continue;
        };
        if target == block {
            continue;
        }

        let preds = module.predecessors(block);

        // If a predecessor also reaches the target directly, threading
        // would give the target's phis two entries for the same block.
        // Leave that shape alone.
        let target_preds = module.predecessors(target);
        let target_has_phis = module
            .block_insts(target)
            .iter()
            .any(|i| matches!(module.kind(*i), InstKind::Phi { .. }));
        if target_has_phis && preds.iter().any(|p| target_preds.contains(p)) {
            continue;
        }

        // Phi edges from the vanishing block now arrive from each of its
        // predecessors instead.
        for succ_block in module.func(func).blocks.clone() {
            if succ_block == block {
                continue;
            }
            for inst in module.block_insts(succ_block).to_vec() {
                let InstKind::Phi { incoming } = module.kind(inst) else {
                    continue;
                };
                if incoming.iter().any(|(b, _)| *b == block) {
                    let preds = preds.clone();
                    module.mutate_kind(inst, |k| {
                        if let InstKind::Phi { incoming } = k {
                            let mut rerouted = Vec::new();
                            incoming.retain(|(b, v)| {
                                if *b == block {
                                    rerouted.extend(preds.iter().map(|p| (*p, *v)));
                                    false
                                } else {
                                    true
                                }
                            });
                            incoming.extend(rerouted);
                        }
                    });
                }
            }
        }

        // Retarget every incoming edge straight to the branch target.
        for pred in preds {
            if let Some(term) = module.terminator(pred) {
                module.mutate_kind(term, |k| match k {
                    InstKind::Branch { target: t } => {
                        if *t == block {
                            *t = target;
                        }
                    }
                    InstKind::CondBranch {
                        then_block,
                        else_block,
                        ..
                    } => {
                        if *then_block == block {
                            *then_block = target;
                        }
                        if *else_block == block {
                            *else_block = target;
                        }
                    }
                    _ => {}
                });
            }
        }

        module.remove_block(block);
        changed = true;
    }

    changed
}
