//! Function Attribute Analysis
//!
//! Three monotone per-function analyses (pure, leaf, noreturn) iterated
//! to a fixed point across the whole module, followed by reference
//! marking that deletes functions nothing can reach. Each check returns
//! whether the *attribute changed*, not the attribute itself; the driver
//! keeps iterating until every check reports no change.

use crate::common::context::Context;
use crate::ir::inst::InstKind;
use crate::ir::{FuncId, Module, ValueId};

/// Re-infer the pure attribute of `func`. Returns whether it changed.
///
/// A function is pure iff it contains no side-effecting instruction,
/// except stores into local Allocas and direct calls to pure callees.
/// Terminators and comparisons never count as side effects.
pub fn check_pure(module: &mut Module, func: FuncId) -> bool {
    let mut pure = true;
    'scan: for block in &module.func(func).blocks {
        for inst in module.block_insts(*block) {
            if !module.has_side_effects(*inst) {
                continue;
            }
            if module.kind(*inst).is_terminator() {
                continue;
            }
            match module.kind(*inst) {
                // A store into a stack slot is invisible outside.
                InstKind::Store { ptr, .. }
                    if matches!(module.kind(*ptr), InstKind::Alloca { .. }) => {}
                InstKind::Call {
                    is_indirect: false,
                    callee_func: Some(callee),
                    ..
                } if module.func(*callee).attrs.pure => {}
                _ => {
                    pure = false;
                    break 'scan;
                }
            }
        }
    }

    let attrs = &mut module.func_mut(func).attrs;
    let changed = attrs.pure != pure;
    attrs.pure = pure;
    changed
}

/// Re-infer the leaf attribute of `func`. Returns whether it changed.
///
/// A leaf function contains no calls except direct tail calls to itself
/// or to other leaf functions.
pub fn check_leaf(module: &mut Module, func: FuncId) -> bool {
    let mut leaf = true;
    'scan: for block in &module.func(func).blocks {
        for inst in module.block_insts(*block) {
            let InstKind::Call {
                is_indirect,
                tail_call,
                callee_func,
                ..
            } = module.kind(*inst)
            else {
                continue;
            };
            if !is_indirect
                && *tail_call
                && let Some(callee) = callee_func
                && (*callee == func || module.func(*callee).attrs.leaf)
            {
                continue;
            }
            leaf = false;
            break 'scan;
        }
    }

    let attrs = &mut module.func_mut(func).attrs;
    let changed = attrs.leaf != leaf;
    attrs.leaf = leaf;
    changed
}

/// Re-infer the noreturn attribute of `func`. Returns whether it
/// changed.
///
/// A noreturn function never returns: it contains no Return, and every
/// tail call it makes targets a direct noreturn callee (a tail call is a
/// return in disguise; an indirect one must be assumed to return).
pub fn check_noreturn(module: &mut Module, func: FuncId) -> bool {
    let mut noreturn = true;
    'scan: for block in &module.func(func).blocks {
        for inst in module.block_insts(*block) {
            match module.kind(*inst) {
                InstKind::Return { .. } => {
                    noreturn = false;
                    break 'scan;
                }
                InstKind::Call {
                    tail_call: true,
                    is_indirect,
                    callee_func,
                    ..
                } => {
                    let callee_noreturn = !is_indirect
                        && callee_func
                            .map(|c| module.func(c).attrs.noreturn)
                            .unwrap_or(false);
                    if !callee_noreturn {
                        noreturn = false;
                        break 'scan;
                    }
                }
                _ => {}
            }
        }
    }

    let attrs = &mut module.func_mut(func).attrs;
    let changed = attrs.noreturn != noreturn;
    attrs.noreturn = noreturn;
    changed
}

fn mark_function_references(module: &mut Module, inst: ValueId) {
    match module.kind(inst) {
        InstKind::FuncRef(func) => {
            let func = *func;
            module.func_mut(func).attrs.ever_referenced = true;
        }
        InstKind::Call {
            is_indirect: false,
            callee_func: Some(callee),
            ..
        } => {
            let callee = *callee;
            module.func_mut(callee).attrs.ever_referenced = true;
        }
        _ => {}
    }
}

/// Run the attribute analyses and reachability over the whole module to
/// a fixed point, deleting functions that are never referenced. Returns
/// whether anything at all changed.
pub fn analyse_functions(_ctx: &Context, module: &mut Module) -> bool {
    let mut ever_changed = false;
    loop {
        let mut changed = false;

        for func in module.funcs() {
            if module.func(func).linkage.is_extern() {
                continue;
            }
            module.func_mut(func).attrs.ever_referenced = false;
            changed |= check_pure(module, func);
            changed |= check_leaf(module, func);
            changed |= check_noreturn(module, func);
        }

        // The entry point and externally visible functions are roots.
        if let Some(entry) = module.entry() {
            module.func_mut(entry).attrs.ever_referenced = true;
        }
        for func in module.funcs() {
            let linkage = module.func(func).linkage;
            if linkage.is_exported() || linkage.is_extern() {
                module.func_mut(func).attrs.ever_referenced = true;
            }
        }

        // Every FuncRef and direct Call marks its referent, including
        // those in global initialisers.
        for func in module.funcs() {
            for block in module.func(func).blocks.clone() {
                for inst in module.block_insts(block).to_vec() {
                    mark_function_references(module, inst);
                }
            }
        }
        for global in module.globals().to_vec() {
            let init = match module.kind(global) {
                InstKind::GlobalVariable {
                    init: Some(init), ..
                } => Some(*init),
                _ => None,
            };
            if let Some(init) = init {
                mark_function_references(module, init);
            }
        }

        // Drop what nothing reaches.
        for func in module.funcs() {
            if !module.func(func).attrs.ever_referenced {
                module.remove_function(func);
                changed = true;
            }
        }

        if !changed {
            break;
        }
        ever_changed = true;
    }
    ever_changed
}
