//! Dead-Code Elimination
//!
//! Deletes every instruction whose use-list is empty and which has no
//! side effects. Deleting one instruction may strand its operands;
//! erasing in reverse program order catches whole chains in a single
//! pass, and the driver iterates anyway.

use crate::common::context::Context;
use crate::ir::{FuncId, Module};

/// Run dead-code elimination over `func`. Returns whether anything was
/// removed.
pub fn run(_ctx: &Context, module: &mut Module, func: FuncId) -> bool {
    let mut changed = false;
    for block in module.func(func).blocks.clone() {
        for inst in module.block_insts(block).to_vec().into_iter().rev() {
            if module.uses(inst).is_empty() && !module.has_side_effects(inst) {
                module.erase_inst(inst);
                changed = true;
            }
        }
    }
    changed
}
