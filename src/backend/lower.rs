//! ABI Lowering
//!
//! Runs once, after optimisation and before machine-IR construction.
//! Rewrites the shapes the x86-64 calling conventions cannot express
//! directly:
//!
//! - Return values too large for registers (more than 16 bytes under
//!   sysv, more than 8 under win64) travel through a hidden pointer
//!   parameter prepended to the signature and to every call site. Every
//!   Return becomes a MemCopy into that pointer followed by a bare
//!   Return. SysV returns of 9..=16 bytes use two registers and pass
//!   through unchanged.
//! - Loads wider than 64 bits pair with a single Store into a MemCopy;
//!   otherwise the Load degrades to a Copy of its address and users
//!   treat the value as a pointer to the in-memory object. Stores wider
//!   than 64 bits whose value is a Load are expanded the same way.

use crate::common::context::Context;
use crate::common::diag::Loc;
use crate::common::types::{TypeId, TypeKind};
use crate::ir::inst::InstKind;
use crate::ir::{FuncId, Module, ValueId};

impl Module {
    /// Rewrite the module for the target ABI
    pub fn lower(&mut self, ctx: &Context) {
        lower(ctx, self);
    }
}

pub fn lower(ctx: &Context, module: &mut Module) {
    if !ctx.target().is_x64() {
        crate::ice!("ABI lowering for this architecture is not supported");
    }

    // Function signatures first so call-site rewriting can consult the
    // rewritten set.
    let mut rewritten: Vec<(FuncId, TypeId)> = Vec::new();
    for func in module.funcs() {
        if let Some(original_ret) = lower_large_return(ctx, module, func) {
            rewritten.push((func, original_ret));
        }
    }

    for func in module.funcs() {
        lower_call_sites(ctx, module, func, &rewritten);
        lower_wide_memory(ctx, module, func);
    }
}

/// If `func` returns a value too large for registers, prepend the hidden
/// pointer parameter and rewrite the returns. Returns the original
/// return type when a rewrite happened.
fn lower_large_return(ctx: &Context, module: &mut Module, func: FuncId) -> Option<TypeId> {
    let (ret, params, varargs, conv) = match ctx.types.kind(module.func(func).ty) {
        TypeKind::Function {
            ret,
            params,
            varargs,
            conv,
        } => (ret, params, varargs, conv),
        _ => return None,
    };

    let ret_bytes = ctx.types.bytes(ret, ctx.target());
    if ret_bytes <= ctx.target().max_register_return_bytes() {
        return None;
    }

    // Signature: void f(ptr out, ...original params).
    let mut new_params = vec![ctx.types.ptr()];
    new_params.extend(params);
    let new_ty = ctx
        .types
        .function(ctx.types.void(), new_params, varargs, conv);
    module.func_mut(func).ty = new_ty;

    // Displace the existing parameters and materialise the hidden one.
    for param in module.func(func).params.clone() {
        module.mutate_kind(param, |k| {
            if let InstKind::Parameter { index } = k {
                *index += 1;
            }
        });
    }
    let hidden = module.new_inst(
        InstKind::Parameter { index: 0 },
        ctx.types.ptr(),
        Loc::none(),
    );
    module.func_mut(func).params.insert(0, hidden);

    // Rewrite every Return into a MemCopy through the hidden pointer.
    for block in module.func(func).blocks.clone() {
        let Some(term) = module.terminator(block) else {
            continue;
        };
        let InstKind::Return { value: Some(value) } = *module.kind(term) else {
            continue;
        };
        if !ctx.types.is_pointer(module.ty(value)) {
            ctx.diags.error(
                module.loc(term),
                format!(
                    "function {} returns a {}-byte value whose source is not in memory",
                    module.func(func).name,
                    ret_bytes
                ),
            );
            continue;
        }

        let bytes = module.new_inst(
            InstKind::IntegerConstant(ret_bytes),
            ctx.types.int(64),
            module.loc(term),
        );
        module.insert_inst_before(block, bytes, term);
        let memcpy = module.new_inst(
            InstKind::MemCopy {
                dest: hidden,
                src: value,
                bytes,
            },
            ctx.types.void(),
            module.loc(term),
        );
        module.insert_inst_before(block, memcpy, term);
        module.mutate_kind(term, |k| *k = InstKind::Return { value: None });
    }

    Some(ret)
}

/// Rewrite direct calls to functions whose signature gained a hidden
/// return pointer: allocate the destination in the caller and pass its
/// address as the first argument.
fn lower_call_sites(
    ctx: &Context,
    module: &mut Module,
    func: FuncId,
    rewritten: &[(FuncId, TypeId)],
) {
    for block in module.func(func).blocks.clone() {
        for inst in module.block_insts(block).to_vec() {
            let InstKind::Call {
                is_indirect: false,
                callee_func: Some(callee),
                ..
            } = module.kind(inst)
            else {
                continue;
            };
            let Some((_, original_ret)) = rewritten.iter().find(|(f, _)| f == callee) else {
                continue;
            };

            let slot = module.new_inst(
                InstKind::Alloca {
                    allocated: *original_ret,
                },
                ctx.types.ptr(),
                module.loc(inst),
            );
            module.insert_inst_before(block, slot, inst);

            module.mutate_kind(inst, |k| {
                if let InstKind::Call { args, .. } = k {
                    args.insert(0, slot);
                }
            });
            module.set_ty(inst, ctx.types.void());

            // Users of the old aggregate value now see a pointer to it.
            if !module.uses(inst).is_empty() {
                let copy = module.new_inst(
                    InstKind::Copy { value: slot },
                    ctx.types.ptr(),
                    module.loc(inst),
                );
                module.insert_inst_after(block, copy, inst);
                module.replace_all_uses(inst, copy);
            }
        }
    }
}

/// Expand loads and stores wider than a machine word
fn lower_wide_memory(ctx: &Context, module: &mut Module, func: FuncId) {
    for block in module.func(func).blocks.clone() {
        for inst in module.block_insts(block).to_vec() {
            if matches!(module.kind(inst), InstKind::Removed) {
                continue;
            }
            match module.kind(inst).clone() {
                InstKind::Load { ptr } => {
                    if ctx.types.bits(module.ty(inst), ctx.target()) <= 64 {
                        continue;
                    }
                    let byte_count = ctx.types.bytes(module.ty(inst), ctx.target());

                    // A load feeding exactly one store is a block copy.
                    let users = module.uses(inst).to_vec();
                    if users.len() == 1
                        && let InstKind::Store { value, ptr: dest } = *module.kind(users[0])
                        && value == inst
                    {
                        let store = users[0];
                        let store_block = module.parent_block(store).unwrap();
                        let bytes = module.new_inst(
                            InstKind::IntegerConstant(byte_count),
                            ctx.types.int(64),
                            module.loc(inst),
                        );
                        module.insert_inst_before(store_block, bytes, store);
                        let memcpy = module.new_inst(
                            InstKind::MemCopy {
                                dest,
                                src: ptr,
                                bytes,
                            },
                            ctx.types.void(),
                            module.loc(inst),
                        );
                        module.insert_inst_before(store_block, memcpy, store);
                        module.erase_inst(store);
                        module.erase_inst(inst);
                    } else {
                        // Everyone else gets the address and treats the
                        // value as in-memory.
                        let copy = module.new_inst(
                            InstKind::Copy { value: ptr },
                            ctx.types.ptr(),
                            module.loc(inst),
                        );
                        module.insert_inst_before(block, copy, inst);
                        module.replace_all_uses(inst, copy);
                        module.erase_inst(inst);
                    }
                }

                InstKind::Store { value, ptr } => {
                    if matches!(module.kind(inst), InstKind::Removed) {
                        continue;
                    }
                    let value_bits = ctx.types.bits(module.ty(value), ctx.target());
                    if value_bits <= 64 {
                        continue;
                    }
                    // The paired-load case was rewritten above; what
                    // remains must still carry an address we can copy
                    // from.
                    if let InstKind::Load { ptr: src } = *module.kind(value) {
                        let byte_count = ctx.types.bytes(module.ty(value), ctx.target());
                        let bytes = module.new_inst(
                            InstKind::IntegerConstant(byte_count),
                            ctx.types.int(64),
                            module.loc(inst),
                        );
                        module.insert_inst_before(block, bytes, inst);
                        let memcpy = module.new_inst(
                            InstKind::MemCopy {
                                dest: ptr,
                                src,
                                bytes,
                            },
                            ctx.types.void(),
                            module.loc(inst),
                        );
                        module.insert_inst_before(block, memcpy, inst);
                        module.erase_inst(inst);
                    } else {
                        ctx.diags.error(
                            module.loc(inst),
                            format!(
                                "cannot lower a {}-bit store whose value has no address",
                                value_bits
                            ),
                        );
                    }
                }

                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;
    use crate::common::types::CallConv;
    use crate::ir::{Builder, Linkage};
    use crate::verifier::verify_module;

    fn setup() -> (Context, Module) {
        (Context::new(Target::X86_64_LINUX), Module::new("test"))
    }

    /// Scenario: a function returning a 32-byte struct gets the hidden
    /// pointer parameter and a memcopy-then-bare-return body.
    #[test]
    fn test_large_return_rewritten_on_linux() {
        let (ctx, mut module) = setup();
        let big = ctx.types.strukt(vec![ctx.types.int(64); 4], false);
        assert_eq!(ctx.types.bytes(big, ctx.target()), 32);

        let fty = ctx.types.function(big, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "make_big", fty, Linkage::Exported);
        let block = module.add_block(func);

        // The frontend returns the object through a stack slot, so the
        // return operand is already a pointer.
        let slot = module.new_inst(
            InstKind::Alloca { allocated: big },
            ctx.types.ptr(),
            Loc::none(),
        );
        module.push_inst(block, slot);
        let ret = module.new_inst(
            InstKind::Return { value: Some(slot) },
            ctx.types.void(),
            Loc::none(),
        );
        module.push_inst(block, ret);

        module.lower(&ctx);
        assert!(!ctx.has_error());

        // The signature gained a leading pointer and lost its return
        // value.
        match ctx.types.kind(module.func(func).ty) {
            TypeKind::Function { ret, params, .. } => {
                assert!(ctx.types.is_void(ret));
                assert_eq!(params.len(), 1);
                assert!(ctx.types.is_pointer(params[0]));
            }
            other => panic!("expected function type, found {:?}", other),
        }
        assert_eq!(module.func(func).params.len(), 1);

        // The body ends in memcopy(hidden, slot, 32); ret.
        let insts = module.block_insts(block);
        let memcpy = insts[insts.len() - 2];
        match module.kind(memcpy) {
            InstKind::MemCopy { dest, src, bytes } => {
                assert_eq!(*dest, module.func(func).params[0]);
                assert_eq!(*src, slot);
                assert_eq!(module.as_int_constant(*bytes), Some(32));
            }
            other => panic!("expected memcopy, found {:?}", other),
        }
        assert_eq!(
            *module.kind(insts[insts.len() - 1]),
            InstKind::Return { value: None }
        );
        verify_module(&ctx, &module).expect("lowered module is well-formed");
    }

    #[test]
    fn test_two_register_return_untouched_on_linux() {
        let (ctx, mut module) = setup();
        let pair = ctx.types.strukt(vec![ctx.types.int(64); 2], false);
        assert_eq!(ctx.types.bytes(pair, ctx.target()), 16);

        let fty = ctx.types.function(pair, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "make_pair", fty, Linkage::Exported);
        let block = module.add_block(func);
        let slot = module.new_inst(
            InstKind::Alloca { allocated: pair },
            ctx.types.ptr(),
            Loc::none(),
        );
        module.push_inst(block, slot);
        let ret = module.new_inst(
            InstKind::Return { value: Some(slot) },
            ctx.types.void(),
            Loc::none(),
        );
        module.push_inst(block, ret);

        module.lower(&ctx);

        // 16 bytes fit in two sysv registers; nothing changes.
        assert_eq!(module.func(func).ty, fty);
        assert_eq!(*module.kind(ret), InstKind::Return { value: Some(slot) });
    }

    #[test]
    fn test_windows_eight_byte_threshold() {
        let ctx = Context::new(Target::X86_64_WINDOWS);
        let mut module = Module::new("test");
        let pair = ctx.types.strukt(vec![ctx.types.int(64); 2], false);

        let fty = ctx.types.function(pair, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "make_pair", fty, Linkage::Exported);
        let block = module.add_block(func);
        let slot = module.new_inst(
            InstKind::Alloca { allocated: pair },
            ctx.types.ptr(),
            Loc::none(),
        );
        module.push_inst(block, slot);
        let ret = module.new_inst(
            InstKind::Return { value: Some(slot) },
            ctx.types.void(),
            Loc::none(),
        );
        module.push_inst(block, ret);

        module.lower(&ctx);

        // 16 bytes exceed the single win64 return register.
        assert_eq!(module.func(func).params.len(), 1);
    }

    #[test]
    fn test_wide_load_store_pair_becomes_memcopy() {
        let (ctx, mut module) = setup();
        let big = ctx.types.array(ctx.types.int(64), 4);
        let fty = ctx
            .types
            .function(ctx.types.void(), vec![ctx.types.ptr(), ctx.types.ptr()], false, CallConv::C);
        let func = module.add_function(&ctx, "blit", fty, Linkage::Exported);
        let block = module.add_block(func);
        let src = module.func(func).params[0];
        let dst = module.func(func).params[1];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let loaded = b.load(big, src).unwrap();
        let store = b.store(loaded, dst).unwrap();
        b.ret(None).unwrap();

        module.lower(&ctx);
        assert!(!ctx.has_error());

        assert_eq!(*module.kind(loaded), InstKind::Removed);
        assert_eq!(*module.kind(store), InstKind::Removed);
        let has_memcpy = module
            .block_insts(block)
            .iter()
            .any(|i| matches!(module.kind(*i), InstKind::MemCopy { .. }));
        assert!(has_memcpy);
        verify_module(&ctx, &module).expect("lowered module is well-formed");
    }

    #[test]
    fn test_wide_load_without_store_degrades_to_copy() {
        let (ctx, mut module) = setup();
        let big = ctx.types.array(ctx.types.int(64), 4);
        let fty = ctx.types.function(
            ctx.types.void(),
            vec![ctx.types.ptr()],
            false,
            CallConv::C,
        );
        let sink_ty = ctx.types.function(
            ctx.types.void(),
            vec![ctx.types.ptr()],
            false,
            CallConv::C,
        );
        let sink = module.add_function(&ctx, "sink", sink_ty, Linkage::Imported);
        let func = module.add_function(&ctx, "f", fty, Linkage::Exported);
        let block = module.add_block(func);
        let src = module.func(func).params[0];

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let loaded = b.load(big, src).unwrap();
        b.call(sink, vec![src]).unwrap();
        b.ret(None).unwrap();

        module.lower(&ctx);
        // The load had no single store user, so it was replaced by a
        // Copy of its pointer.
        assert_eq!(*module.kind(loaded), InstKind::Removed);
        let has_copy = module
            .block_insts(block)
            .iter()
            .any(|i| matches!(module.kind(*i), InstKind::Copy { .. }));
        assert!(has_copy);
    }
}
