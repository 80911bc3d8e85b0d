//! Mem2Reg
//!
//! Promotes stack slots to SSA values. A slot is promotable iff it is
//! written by exactly one Store, every other use is a Load, and the user
//! count proves the address never escapes (`users == loads + 1`). Loads
//! then forward the stored value and the slot disappears.
//!
//! A Load that appears before the single Store (in program order) reads
//! uninitialised memory; the slot is left alone and a warning is issued.

use crate::common::context::Context;
use crate::ir::inst::InstKind;
use crate::ir::{FuncId, Module, ValueId};

#[derive(Debug, Default)]
struct StackVar {
    alloca: Option<ValueId>,
    store: Option<ValueId>,
    loads: Vec<ValueId>,
    unoptimisable: bool,
}

/// Run stack-slot promotion over `func`. Returns whether anything was
/// promoted.
pub fn run(ctx: &Context, module: &mut Module, func: FuncId) -> bool {
    let mut changed = false;
    let mut vars: Vec<StackVar> = Vec::new();

    // Collect the slots written exactly once, in program order so that
    // a load-before-store is visible.
    for block in module.func(func).blocks.clone() {
        for inst in module.block_insts(block).to_vec() {
            match module.kind(inst) {
                InstKind::Alloca { .. } => {
                    vars.push(StackVar {
                        alloca: Some(inst),
                        ..Default::default()
                    });
                }
                InstKind::Store { ptr, .. } => {
                    if let Some(var) = vars
                        .iter_mut()
                        .find(|v| !v.unoptimisable && v.alloca == Some(*ptr))
                    {
                        if var.store.is_some() {
                            var.unoptimisable = true;
                        } else {
                            var.store = Some(inst);
                        }
                    }
                }
                InstKind::Load { ptr } => {
                    let ptr = *ptr;
                    if let Some(var) = vars
                        .iter_mut()
                        .find(|v| !v.unoptimisable && v.alloca == Some(ptr))
                    {
                        if var.store.is_none() {
                            var.unoptimisable = true;
                            let loc = module.loc(inst);
                            let name = &module.func(func).name;
                            ctx.diags.warn(
                                loc,
                                format!("load of uninitialised variable in function {}", name),
                            );
                        } else {
                            var.loads.push(inst);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    for var in vars {
        let (Some(alloca), Some(store)) = (var.alloca, var.store) else {
            continue;
        };
        // Any use besides the loads and the single store means the
        // address escaped.
        if var.unoptimisable || module.uses(alloca).len() != var.loads.len() + 1 {
            continue;
        }

        let stored = match module.kind(store) {
            InstKind::Store { value, .. } => *value,
            _ => continue,
        };

        changed = true;
        for load in var.loads {
            module.replace_all_uses(load, stored);
            module.erase_inst(load);
        }
        module.erase_inst(store);
        module.erase_inst(alloca);
    }

    changed
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
    fn test_promotes_single_store_slot() {
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

        // The return now yields the constant; slot, store and load are
        // gone.
        assert_eq!(
            *module.kind(ret),
            InstKind::Return { value: Some(five) }
        );
        assert_eq!(*module.kind(slot), InstKind::Removed);
        assert_eq!(module.block_insts(block).len(), 2);
    }

    #[test]
    fn test_load_before_store_blocks_promotion() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(i32t, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let slot = b.alloca(i32t).unwrap();
        let early = b.load(i32t, slot).unwrap();
        b.store(early, slot).unwrap();
        let loaded = b.load(i32t, slot).unwrap();
        b.ret(Some(loaded)).unwrap();

        assert!(!run(&ctx, &mut module, func));
        assert!(!ctx.diags.is_empty());
    }

    #[test]
    fn test_escaping_address_blocks_promotion() {
        let (ctx, mut module) = setup();
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(ctx.types.void(), vec![], false, CallConv::C);
        let sink_ty = ctx
            .types
            .function(ctx.types.void(), vec![ctx.types.ptr()], false, CallConv::C);
        let sink = module.add_function(&ctx, "sink", sink_ty, Linkage::Imported);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let slot = b.alloca(i64t).unwrap();
        let one = b.int_const(i64t, 1).unwrap();
        b.store(one, slot).unwrap();
        // The address escapes into a call; users != loads + 1.
        b.call(sink, vec![slot]).unwrap();
        b.ret(None).unwrap();

        assert!(!run(&ctx, &mut module, func));
    }

    #[test]
    fn test_two_stores_block_promotion() {
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
        b.store(two, slot).unwrap();
        let loaded = b.load(i32t, slot).unwrap();
        b.ret(Some(loaded)).unwrap();

        assert!(!run(&ctx, &mut module, func));
    }
}
