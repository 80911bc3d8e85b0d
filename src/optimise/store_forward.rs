//! Store Forwarding
//!
//! Within a single block, a Load from a stack slot repeats whatever the
//! most recent Store put there, so the Load is replaced by the stored
//! value. A second Store to the same slot supersedes the first; the
//! first is deleted only when no instruction between the two uses the
//! slot's address, otherwise it stays.

use crate::common::context::Context;
use crate::ir::inst::InstKind;
use crate::ir::{BlockId, FuncId, Module, ValueId};

/// Run per-block store forwarding over `func`. Returns whether anything
/// changed.
pub fn run(_ctx: &Context, module: &mut Module, func: FuncId) -> bool {
    let mut changed = false;
    for block in module.func(func).blocks.clone() {
        changed |= forward_in_block(module, block);
    }
    changed
}

fn forward_in_block(module: &mut Module, block: BlockId) -> bool {
    let mut changed = false;
    // Latest store per alloca address within this block.
    let mut latest: Vec<(ValueId, ValueId)> = Vec::new();

    for inst in module.block_insts(block).to_vec() {
        match module.kind(inst).clone() {
            InstKind::Store { ptr, .. }
                if matches!(module.kind(ptr), InstKind::Alloca { .. }) =>
            {
                if let Some(entry) = latest.iter_mut().find(|(addr, _)| *addr == ptr) {
                    let superseded = entry.1;
                    entry.1 = inst;
                    if !address_used_between(module, block, ptr, superseded, inst) {
                        module.erase_inst(superseded);
                        changed = true;
                    }
                } else {
                    latest.push((ptr, inst));
                }
            }

            InstKind::Load { ptr } => {
                if let Some((_, store)) = latest.iter().find(|(addr, _)| *addr == ptr) {
                    let stored = match module.kind(*store) {
                        InstKind::Store { value, .. } => *value,
                        _ => continue,
                    };
                    module.replace_all_uses(inst, stored);
                    module.erase_inst(inst);
                    changed = true;
                }
            }

            _ => {}
        }
    }

    changed
}

/// Whether any instruction strictly between `from` and `to` uses `addr`
fn address_used_between(
    module: &Module,
    block: BlockId,
    addr: ValueId,
    from: ValueId,
    to: ValueId,
) -> bool {
    let insts = module.block_insts(block);
    let start = insts.iter().position(|i| *i == from);
    let end = insts.iter().position(|i| *i == to);
    let (Some(start), Some(end)) = (start, end) else {
        return true;
    };
    insts[start + 1..end]
        .iter()
        .any(|inst| module.kind(*inst).operands().contains(&addr))
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
    fn test_load_forwards_last_store() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(i32t, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let slot = b.alloca(i32t).unwrap();
        let five = b.int_const(i32t, 5).unwrap();
        b.store(five, slot).unwrap();
        let loaded = b.load(i32t, slot).unwrap();
        let ret = b.ret(Some(loaded)).unwrap();

        assert!(run(&ctx, &mut module, func));
        assert_eq!(
            *module.kind(ret),
            InstKind::Return { value: Some(five) }
        );
        assert_eq!(*module.kind(loaded), InstKind::Removed);
    }

    #[test]
    fn test_superseded_store_deleted_when_address_unused() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(ctx.types.void(), vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let slot = b.alloca(i32t).unwrap();
        let one = b.int_const(i32t, 1).unwrap();
        let two = b.int_const(i32t, 2).unwrap();
        let first = b.store(one, slot).unwrap();
        b.store(two, slot).unwrap();
        b.ret(None).unwrap();

        assert!(run(&ctx, &mut module, func));
        assert_eq!(*module.kind(first), InstKind::Removed);
    }

    #[test]
    fn test_superseded_store_kept_when_address_escapes_between() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(ctx.types.void(), vec![], false, CallConv::C);
        let sink_ty = ctx
            .types
            .function(ctx.types.void(), vec![ctx.types.ptr()], false, CallConv::C);
        let sink = module.add_function(&ctx, "sink", sink_ty, Linkage::Imported);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let slot = b.alloca(i32t).unwrap();
        let one = b.int_const(i32t, 1).unwrap();
        let two = b.int_const(i32t, 2).unwrap();
        let first = b.store(one, slot).unwrap();
        // The callee may read the slot through the escaped address.
        b.call(sink, vec![slot]).unwrap();
        b.store(two, slot).unwrap();
        b.ret(None).unwrap();

        run(&ctx, &mut module, func);
        assert_ne!(*module.kind(first), InstKind::Removed);
    }

    #[test]
    fn test_forwarded_load_observes_intervening_store() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(i32t, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let slot = b.alloca(i32t).unwrap();
        let one = b.int_const(i32t, 1).unwrap();
        let two = b.int_const(i32t, 2).unwrap();
        b.store(one, slot).unwrap();
        let mid = b.load(i32t, slot).unwrap();
        b.store(two, slot).unwrap();
        let late = b.load(i32t, slot).unwrap();
        let sum = b.binary(crate::ir::inst::BinaryOp::Add, mid, late).unwrap();
        b.ret(Some(sum)).unwrap();

        assert!(run(&ctx, &mut module, func));
        // Each load forwards the store that was latest at its position.
        assert_eq!(
            *module.kind(sum),
            InstKind::Binary {
                op: crate::ir::inst::BinaryOp::Add,
                lhs: one,
                rhs: two,
            }
        );
    }
}
