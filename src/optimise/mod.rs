//! Optimisation Passes
//!
//! The per-function driver lays blocks out along the dominator tree and
//! then runs the scalar passes to a fixed point: instruction
//! combination, dead-code elimination, mem2reg, jump threading, store
//! forwarding and tail-call elimination. Passes are composed with a
//! short-circuiting OR inside one iteration, and the loop only stops
//! once every pass reports no change.
//!
//! After per-function convergence the cross-function driver alternates
//! the inliner and attribute analysis until neither changes anything.

pub mod dce;
pub mod inline;
pub mod instcombine;
pub mod jump_thread;
pub mod mem2reg;
pub mod store_forward;
pub mod tail_call;

#[cfg(test)]
mod tests;

use crate::analysis::{DomTree, analyse_functions};
use crate::common::context::Context;
use crate::ir::{FuncId, Module};

/// Static cost budget for the inliner
const INLINE_THRESHOLD: usize = 20;

impl Module {
    /// Run the full optimisation pipeline over the module
    pub fn optimise(&mut self, ctx: &Context) {
        optimise(ctx, self);
    }
}

/// Optimise every function in the module, then iterate the
/// cross-function inliner and attribute analysis to a fixed point.
pub fn optimise(ctx: &Context, module: &mut Module) {
    analyse_functions(ctx, module);

    loop {
        for func in module.funcs() {
            optimise_function(ctx, module, func);
        }

        // Cross-function optimisations.
        if !(inline::run(ctx, module, INLINE_THRESHOLD) || analyse_functions(ctx, module)) {
            break;
        }
    }
}

fn optimise_function(ctx: &Context, module: &mut Module, func: FuncId) {
    if !module.func(func).is_definition() || module.func(func).linkage.is_extern() {
        return;
    }
    loop {
        let doms = DomTree::build(module, func, true);
        jump_thread::reorder_blocks(module, func, &doms);

        let changed = instcombine::run(ctx, module, func)
            || dce::run(ctx, module, func)
            || mem2reg::run(ctx, module, func)
            || jump_thread::run(ctx, module, func)
            || store_forward::run(ctx, module, func)
            || tail_call::run(ctx, module, func);
        if !changed {
            break;
        }
    }
}

/// Block-level cleanup only: reordering plus jump threading. The
/// backend runs this once more before machine-IR construction.
pub fn optimise_blocks(ctx: &Context, module: &mut Module) {
    for func in module.funcs() {
        if !module.func(func).is_definition() {
            continue;
        }
        loop {
            let doms = DomTree::build(module, func, true);
            jump_thread::reorder_blocks(module, func, &doms);
            if !jump_thread::run(ctx, module, func) {
                break;
            }
        }
    }
}
