//! Whole-pipeline optimiser scenarios
//!
//! Each test drives `Module::optimise` end to end over a hand-built
//! module and checks the shape that must come out, plus the structural
//! invariants that must hold afterwards.

use crate::common::context::Context;
use crate::common::target::Target;
use crate::common::types::CallConv;
use crate::ir::inst::{BinaryOp, InstKind};
use crate::ir::{Builder, Linkage, Module};
use crate::verifier::verify_module;

fn setup() -> (Context, Module) {
    (Context::new(Target::X86_64_LINUX), Module::new("test"))
}

#[test]
fn test_constant_fold_to_return() {
    let (ctx, mut module) = setup();
    let i64t = ctx.types.int(64);
    let fty = ctx.types.function(i64t, vec![], false, CallConv::C);
    let func = module.add_function(&ctx, "seven", fty, Linkage::Exported);
    let block = module.add_block(func);

    let mut b = Builder::new(&ctx, &mut module);
    b.position_at_end(block);
    let three = b.int_const(i64t, 3).unwrap();
    let four = b.int_const(i64t, 4).unwrap();
    let sum = b.binary(BinaryOp::Add, three, four).unwrap();
    let ret = b.ret(Some(sum)).unwrap();

    module.set_entry(func);
    module.optimise(&ctx);

    // The Add became the constant 7 in place, keeping its use-list: the
    // return still refers to the same value.
    assert_eq!(*module.kind(sum), InstKind::IntegerConstant(7));
    assert_eq!(*module.kind(ret), InstKind::Return { value: Some(sum) });
    // The original constants are gone.
    assert_eq!(*module.kind(three), InstKind::Removed);
    assert_eq!(*module.kind(four), InstKind::Removed);

    verify_module(&ctx, &module).expect("optimised module is well-formed");
}

#[test]
fn test_mem2reg_scenario() {
    // a = alloca i32; store 5, a; x = load a; ret x  ==>  ret 5
    let (ctx, mut module) = setup();
    let i32t = ctx.types.int(32);
    let fty = ctx.types.function(i32t, vec![], false, CallConv::C);
    let func = module.add_function(&ctx, "f", fty, Linkage::Exported);
    let block = module.add_block(func);

    let mut b = Builder::new(&ctx, &mut module);
    b.position_at_end(block);
    let slot = b.alloca(i32t).unwrap();
    let five = b.int_const(i32t, 5).unwrap();
    b.store(five, slot).unwrap();
    let loaded = b.load(i32t, slot).unwrap();
    b.ret(Some(loaded)).unwrap();

    module.set_entry(func);
    module.optimise(&ctx);

    let insts = module.block_insts(block).to_vec();
    assert_eq!(insts.len(), 2, "only the constant and the return remain");
    assert_eq!(*module.kind(insts[0]), InstKind::IntegerConstant(5));
    assert_eq!(
        *module.kind(insts[1]),
        InstKind::Return {
            value: Some(insts[0])
        }
    );
    verify_module(&ctx, &module).expect("optimised module is well-formed");
}

#[test]
fn test_dead_branch_scenario() {
    // CondBranch(1, T, F) becomes Branch(T); F is unreachable and is
    // dropped from the function.
    let (ctx, mut module) = setup();
    let i64t = ctx.types.int(64);
    let fty = ctx.types.function(i64t, vec![], false, CallConv::C);
    let func = module.add_function(&ctx, "f", fty, Linkage::Exported);
    let entry = module.add_block(func);
    let then_block = module.add_block(func);
    let else_block = module.add_block(func);

    let mut b = Builder::new(&ctx, &mut module);
    b.position_at_end(entry);
    let cond = b.int_const(ctx.types.int(1), 1).unwrap();
    b.cond_branch(cond, then_block, else_block).unwrap();
    b.position_at_end(then_block);
    let one = b.int_const(i64t, 1).unwrap();
    b.ret(Some(one)).unwrap();
    b.position_at_end(else_block);
    let zero = b.int_const(i64t, 0).unwrap();
    b.ret(Some(zero)).unwrap();

    module.set_entry(func);
    module.optimise(&ctx);

    let blocks = &module.func(func).blocks;
    assert!(!blocks.contains(&else_block), "dead arm is eliminated");
    verify_module(&ctx, &module).expect("optimised module is well-formed");
}

#[test]
fn test_sdiv_by_eight_becomes_sar_by_three() {
    let (ctx, mut module) = setup();
    let i64t = ctx.types.int(64);
    let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
    let func = module.add_function(&ctx, "f", fty, Linkage::Exported);
    let block = module.add_block(func);
    let param = module.func(func).params[0];

    let mut b = Builder::new(&ctx, &mut module);
    b.position_at_end(block);
    let eight = b.int_const(i64t, 8).unwrap();
    let div = b.binary(BinaryOp::SDiv, param, eight).unwrap();
    b.ret(Some(div)).unwrap();

    module.set_entry(func);
    module.optimise(&ctx);

    match module.kind(div) {
        InstKind::Binary { op, lhs, rhs } => {
            assert_eq!(*op, BinaryOp::Sar);
            assert_eq!(*lhs, param);
            assert_eq!(module.as_int_constant(*rhs), Some(3));
        }
        other => panic!("expected a shift, found {:?}", other),
    }
    verify_module(&ctx, &module).expect("optimised module is well-formed");
}

#[test]
fn test_tail_call_scenario() {
    let (ctx, mut module) = setup();
    let i64t = ctx.types.int(64);
    let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
    let callee = module.add_function(&ctx, "g", fty, Linkage::Imported);
    let func = module.add_function(&ctx, "f", fty, Linkage::Exported);
    let block = module.add_block(func);
    let param = module.func(func).params[0];

    let mut b = Builder::new(&ctx, &mut module);
    b.position_at_end(block);
    let result = b.call(callee, vec![param]).unwrap();
    b.ret(Some(result)).unwrap();

    module.set_entry(func);
    module.optimise(&ctx);

    assert!(matches!(
        module.kind(result),
        InstKind::Call {
            tail_call: true,
            ..
        }
    ));
    assert!(matches!(
        module.kind(module.terminator(block).unwrap()),
        InstKind::Unreachable
    ));
}

#[test]
fn test_optimise_is_idempotent() {
    let (ctx, mut module) = setup();
    let i64t = ctx.types.int(64);
    let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
    let func = module.add_function(&ctx, "f", fty, Linkage::Exported);
    let entry = module.add_block(func);
    let then_block = module.add_block(func);
    let else_block = module.add_block(func);
    let merge = module.add_block(func);
    let param = module.func(func).params[0];

    let mut b = Builder::new(&ctx, &mut module);
    b.position_at_end(entry);
    let slot = b.alloca(i64t).unwrap();
    let ten = b.int_const(i64t, 10).unwrap();
    b.store(ten, slot).unwrap();
    let limit = b.load(i64t, slot).unwrap();
    let cond = b
        .compare(crate::ir::inst::CompareOp::SLt, param, limit)
        .unwrap();
    b.cond_branch(cond, then_block, else_block).unwrap();
    b.position_at_end(then_block);
    let doubled = b.binary(BinaryOp::Add, param, param).unwrap();
    b.branch(merge).unwrap();
    b.position_at_end(else_block);
    let halved = b.binary(BinaryOp::SDiv, param, ten).unwrap();
    b.branch(merge).unwrap();
    b.position_at_end(merge);
    let phi = b
        .phi(i64t, vec![(then_block, doubled), (else_block, halved)])
        .unwrap();
    b.ret(Some(phi)).unwrap();

    module.set_entry(func);
    module.optimise(&ctx);
    let first = module.print_ir(&ctx);
    module.optimise(&ctx);
    let second = module.print_ir(&ctx);

    assert_eq!(first, second, "second optimisation run is a no-op");
    verify_module(&ctx, &module).expect("optimised module is well-formed");
}

#[test]
fn test_inliner_folds_through() {
    // Inlining a constant-returning helper lets the caller fold to a
    // constant return.
    let (ctx, mut module) = setup();
    let i64t = ctx.types.int(64);
    let helper_ty = ctx.types.function(i64t, vec![], false, CallConv::C);

    let helper = module.add_function(&ctx, "helper", helper_ty, Linkage::Internal);
    let hb = module.add_block(helper);
    let main = module.add_function(&ctx, "main", helper_ty, Linkage::Exported);
    let mb = module.add_block(main);

    let mut b = Builder::new(&ctx, &mut module);
    b.position_at_end(hb);
    let forty_two = b.int_const(i64t, 42).unwrap();
    b.ret(Some(forty_two)).unwrap();

    b.position_at_end(mb);
    let result = b.call(helper, vec![]).unwrap();
    b.ret(Some(result)).unwrap();

    module.set_entry(main);
    module.optimise(&ctx);

    // The helper was inlined and, being unreferenced, removed.
    assert!(module.func_by_name("helper").is_none());

    // main reduces to a single return of 42.
    let main = module.func_by_name("main").unwrap();
    let blocks = module.func(main).blocks.clone();
    let mut constant_return = false;
    for block in &blocks {
        for inst in module.block_insts(*block) {
            if let InstKind::Return { value: Some(v) } = module.kind(*inst) {
                constant_return = module.as_int_constant(*v) == Some(42);
            }
        }
    }
    assert!(constant_return, "main returns the folded constant");
    verify_module(&ctx, &module).expect("optimised module is well-formed");
}
