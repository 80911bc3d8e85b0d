//! IR Printing
//!
//! Two serialisations share this module: a native dump that shows every
//! instruction kind exactly as the IR stores it, and an LLVM-compatible
//! dump for external tooling, which maps each kind onto an equivalent
//! LLVM construct (constants are inlined into operand position, Neg
//! becomes `sub 0, x`, and so on).

use crate::common::context::Context;
use crate::ir::inst::{CompareOp, InstKind, UnaryOp};
use crate::ir::{FuncId, Linkage, Module, ValueId};
use crate::common::types::TypeKind;
use std::fmt::Write;

impl Module {
    /// Native IR dump
    pub fn print_ir(&self, ctx: &Context) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; module {}", self.name);
        for global in self.globals() {
            let (ty, init) = match self.kind(*global) {
                InstKind::GlobalVariable { ty, init, .. } => (
                    *ty,
                    init.map(|init| format!(" = {}", self.operand(ctx, init)))
                        .unwrap_or_default(),
                ),
                _ => continue,
            };
            let _ = writeln!(
                out,
                "global {} {}{}",
                ctx.types.display(ty),
                self.operand_name(*global),
                init
            );
        }
        for func in self.funcs() {
            let data = self.func(func);
            let params = data
                .params
                .iter()
                .map(|p| format!("{}: {}", p, ctx.types.display(self.ty(*p))))
                .collect::<Vec<_>>()
                .join(", ");
            let ret = match ctx.types.kind(data.ty) {
                TypeKind::Function { ret, .. } => ctx.types.display(ret),
                _ => "void".to_string(),
            };
            if !data.is_definition() {
                let _ = writeln!(out, "declare {}({}) -> {}", data.name, params, ret);
                continue;
            }
            let _ = writeln!(out, "{}({}) -> {} {{", data.name, params, ret);
            for block in &data.blocks {
                let _ = writeln!(out, "{}:", block);
                for inst in self.block_insts(*block) {
                    let _ = writeln!(out, "    {}", self.print_inst(ctx, *inst));
                }
            }
            let _ = writeln!(out, "}}");
        }
        out
    }

    fn print_inst(&self, ctx: &Context, id: ValueId) -> String {
        let ty = ctx.types.display(self.ty(id));
        match self.kind(id) {
            InstKind::IntegerConstant(v) => format!("{} = {} {}", id, ty, *v as i64),
            InstKind::ArrayConstant(data) => format!("{} = {} {:?}", id, ty, data),
            InstKind::Poison => format!("{} = poison {}", id, ty),
            InstKind::GlobalVariable { name, .. } => format!("{} = global @{}", id, name),
            InstKind::FuncRef(func) => format!("{} = funcref {}", id, self.func(*func).name),
            InstKind::LitInteger(v) => format!("{} = lit {}", id, v),
            InstKind::LitString(s) => format!("{} = lit {:?}", id, s),
            InstKind::Parameter { index } => format!("{} = parameter {}", id, index),
            InstKind::Alloca { allocated } => {
                format!("{} = alloca {}", id, ctx.types.display(*allocated))
            }
            InstKind::Load { ptr } => format!("{} = load {}, {}", id, ty, ptr),
            InstKind::Store { value, ptr } => format!("store {}, {}", value, ptr),
            InstKind::GetElementPtr {
                elem,
                base,
                indices,
            } => {
                let idx = indices
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "{} = gep {}, {} [{}]",
                    id,
                    ctx.types.display(*elem),
                    base,
                    idx
                )
            }
            InstKind::Copy { value } => format!("{} = copy {}", id, value),
            InstKind::Binary { op, lhs, rhs } => {
                format!("{} = {} {} {}, {}", id, op, ty, lhs, rhs)
            }
            InstKind::Unary { op, operand } => format!("{} = {} {} {}", id, op, ty, operand),
            InstKind::Cast { op, operand } => format!("{} = {} {} to {}", id, op, operand, ty),
            InstKind::Compare { op, lhs, rhs } => {
                format!("{} = cmp {} {}, {}", id, op, lhs, rhs)
            }
            InstKind::Branch { target } => format!("branch {}", target),
            InstKind::CondBranch {
                cond,
                then_block,
                else_block,
            } => format!("cond-branch {}, {}, {}", cond, then_block, else_block),
            InstKind::Return { value: Some(v) } => format!("return {}", v),
            InstKind::Return { value: None } => "return".to_string(),
            InstKind::Unreachable => "unreachable".to_string(),
            InstKind::Phi { incoming } => {
                let args = incoming
                    .iter()
                    .map(|(b, v)| format!("[{}, {}]", b, v))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{} = phi {} {}", id, ty, args)
            }
            InstKind::Call {
                callee,
                args,
                is_indirect,
                tail_call,
                callee_func,
            } => {
                let target = match (is_indirect, callee_func) {
                    (false, Some(f)) => self.func(*f).name.clone(),
                    _ => callee.to_string(),
                };
                let args = args
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let tail = if *tail_call { "tail " } else { "" };
                format!("{} = {}call {}({})", id, tail, target, args)
            }
            InstKind::MemCopy { dest, src, bytes } => {
                format!("memcopy {}, {}, {}", dest, src, bytes)
            }
            InstKind::Removed => "<removed>".to_string(),
        }
    }

    // === LLVM-compatible dump ===

    /// Serialise the module as LLVM textual IR
    pub fn llvm(&self, ctx: &Context) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; ModuleID = '{}'", self.name);

        for global in self.globals() {
            let InstKind::GlobalVariable { ty, init, .. } = self.kind(*global) else {
                continue;
            };
            let init = match init {
                Some(init) => self.operand(ctx, *init),
                None => "zeroinitializer".to_string(),
            };
            let _ = writeln!(
                out,
                "{} = global {} {}",
                self.operand_name(*global),
                ctx.types.display(*ty),
                init
            );
        }

        let mut uses_memcpy = false;
        for func in self.funcs() {
            self.llvm_function(ctx, func, &mut out, &mut uses_memcpy);
        }
        if uses_memcpy {
            let _ = writeln!(
                out,
                "declare void @llvm.memcpy.p0.p0.i64(ptr, ptr, i64, i1)"
            );
        }
        out
    }

    fn llvm_function(&self, ctx: &Context, func: FuncId, out: &mut String, uses_memcpy: &mut bool) {
        let data = self.func(func);
        let (ret, param_tys) = match ctx.types.kind(data.ty) {
            TypeKind::Function { ret, params, .. } => (ret, params),
            _ => return,
        };
        let params = data
            .params
            .iter()
            .zip(param_tys.iter())
            .map(|(p, ty)| format!("{} %v{}", ctx.types.display(*ty), p.index()))
            .collect::<Vec<_>>()
            .join(", ");

        if !data.is_definition() {
            let _ = writeln!(
                out,
                "declare {} @{}({})",
                ctx.types.display(ret),
                data.name,
                params
            );
            return;
        }

        let linkage = match data.linkage {
            Linkage::Internal => "internal ",
            Linkage::Exported => "",
            Linkage::Imported => "external ",
        };
        let _ = writeln!(
            out,
            "define {}{} @{}({}) {{",
            linkage,
            ctx.types.display(ret),
            data.name,
            params
        );
        for block in &data.blocks {
            let _ = writeln!(out, "{}:", block);
            for inst in self.block_insts(*block) {
                if let Some(line) = self.llvm_inst(ctx, *inst, uses_memcpy) {
                    let _ = writeln!(out, "  {}", line);
                }
            }
        }
        let _ = writeln!(out, "}}");
    }

    /// Operand spelling: constants are inlined, everything else is named
    fn operand(&self, _ctx: &Context, id: ValueId) -> String {
        match self.kind(id) {
            InstKind::IntegerConstant(v) | InstKind::LitInteger(v) => format!("{}", *v as i64),
            InstKind::Poison => "poison".to_string(),
            InstKind::ArrayConstant(data) => {
                let bytes = data
                    .iter()
                    .map(|b| format!("\\{:02X}", b))
                    .collect::<String>();
                format!("c\"{}\"", bytes)
            }
            InstKind::LitString(s) => format!("c{:?}", s),
            _ => self.operand_name(id),
        }
    }

    fn operand_name(&self, id: ValueId) -> String {
        match self.kind(id) {
            InstKind::GlobalVariable { name, .. } => format!("@{}", name),
            InstKind::FuncRef(func) => format!("@{}", self.func(*func).name),
            _ => format!("%v{}", id.index()),
        }
    }

    fn typed_operand(&self, ctx: &Context, id: ValueId) -> String {
        format!("{} {}", ctx.types.display(self.ty(id)), self.operand(ctx, id))
    }

    fn llvm_inst(&self, ctx: &Context, id: ValueId, uses_memcpy: &mut bool) -> Option<String> {
        let name = format!("%v{}", id.index());
        let ty = ctx.types.display(self.ty(id));
        let line = match self.kind(id) {
            // Constants and references render inline at their uses.
            InstKind::IntegerConstant(_)
            | InstKind::ArrayConstant(_)
            | InstKind::Poison
            | InstKind::GlobalVariable { .. }
            | InstKind::FuncRef(_)
            | InstKind::LitInteger(_)
            | InstKind::LitString(_)
            | InstKind::Parameter { .. }
            | InstKind::Removed => return None,

            InstKind::Alloca { allocated } => {
                format!("{} = alloca {}", name, ctx.types.display(*allocated))
            }
            InstKind::Load { ptr } => {
                format!("{} = load {}, ptr {}", name, ty, self.operand(ctx, *ptr))
            }
            InstKind::Store { value, ptr } => format!(
                "store {}, ptr {}",
                self.typed_operand(ctx, *value),
                self.operand(ctx, *ptr)
            ),
            InstKind::GetElementPtr {
                elem,
                base,
                indices,
            } => {
                let mut s = format!(
                    "{} = getelementptr {}, ptr {}",
                    name,
                    ctx.types.display(*elem),
                    self.operand(ctx, *base)
                );
                for index in indices {
                    s.push_str(", ");
                    s.push_str(&self.typed_operand(ctx, *index));
                }
                s
            }
            // A copy reinterprets nothing; bitcast to the same type.
            InstKind::Copy { value } => format!(
                "{} = bitcast {} to {}",
                name,
                self.typed_operand(ctx, *value),
                ty
            ),
            InstKind::Binary { op, lhs, rhs } => format!(
                "{} = {} {}, {}",
                name,
                op,
                self.typed_operand(ctx, *lhs),
                self.operand(ctx, *rhs)
            ),
            InstKind::Unary { op, operand } => match op {
                UnaryOp::Neg => format!(
                    "{} = sub {} 0, {}",
                    name,
                    ty,
                    self.operand(ctx, *operand)
                ),
                UnaryOp::Compl => format!(
                    "{} = xor {}, -1",
                    name,
                    self.typed_operand(ctx, *operand)
                ),
                UnaryOp::Not => format!(
                    "{} = icmp eq {}, 0",
                    name,
                    self.typed_operand(ctx, *operand)
                ),
            },
            InstKind::Cast { op, operand } => format!(
                "{} = {} {} to {}",
                name,
                op,
                self.typed_operand(ctx, *operand),
                ty
            ),
            InstKind::Compare { op, lhs, rhs } => {
                let cond = match op {
                    CompareOp::Eq => "eq",
                    CompareOp::Ne => "ne",
                    CompareOp::SLt => "slt",
                    CompareOp::SLe => "sle",
                    CompareOp::SGt => "sgt",
                    CompareOp::SGe => "sge",
                    CompareOp::ULt => "ult",
                    CompareOp::ULe => "ule",
                    CompareOp::UGt => "ugt",
                    CompareOp::UGe => "uge",
                };
                format!(
                    "{} = icmp {} {}, {}",
                    name,
                    cond,
                    self.typed_operand(ctx, *lhs),
                    self.operand(ctx, *rhs)
                )
            }
            InstKind::Branch { target } => format!("br label %{}", target),
            InstKind::CondBranch {
                cond,
                then_block,
                else_block,
            } => format!(
                "br i1 {}, label %{}, label %{}",
                self.operand(ctx, *cond),
                then_block,
                else_block
            ),
            InstKind::Return { value: Some(v) } => {
                format!("ret {}", self.typed_operand(ctx, *v))
            }
            InstKind::Return { value: None } => "ret void".to_string(),
            InstKind::Unreachable => "unreachable".to_string(),
            InstKind::Phi { incoming } => {
                let args = incoming
                    .iter()
                    .map(|(b, v)| format!("[ {}, %{} ]", self.operand(ctx, *v), b))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{} = phi {} {}", name, ty, args)
            }
            InstKind::Call {
                callee,
                args,
                tail_call,
                callee_func,
                ..
            } => {
                let target = match callee_func {
                    Some(f) => format!("@{}", self.func(*f).name),
                    None => self.operand(ctx, *callee),
                };
                let args = args
                    .iter()
                    .map(|a| self.typed_operand(ctx, *a))
                    .collect::<Vec<_>>()
                    .join(", ");
                let tail = if *tail_call { "tail " } else { "" };
                if ctx.types.is_void(self.ty(id)) {
                    format!("{}call void {}({})", tail, target, args)
                } else {
                    format!("{} = {}call {} {}({})", name, tail, ty, target, args)
                }
            }
            InstKind::MemCopy { dest, src, bytes } => {
                *uses_memcpy = true;
                format!(
                    "call void @llvm.memcpy.p0.p0.i64(ptr {}, ptr {}, i64 {}, i1 false)",
                    self.operand(ctx, *dest),
                    self.operand(ctx, *src),
                    self.operand(ctx, *bytes)
                )
            }
        };
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;
    use crate::common::types::CallConv;
    use crate::ir::inst::BinaryOp;
    use crate::ir::Builder;

    #[test]
    fn test_llvm_dump_inlines_constants() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let mut module = Module::new("demo");
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(i32t, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "seven", fty, Linkage::Exported);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let three = b.int_const(i32t, 3).unwrap();
        let four = b.int_const(i32t, 4).unwrap();
        let sum = b.binary(BinaryOp::Add, three, four).unwrap();
        b.ret(Some(sum)).unwrap();

        let text = module.llvm(&ctx);
        assert!(text.contains("define i32 @seven()"));
        assert!(text.contains("add i32 3, 4"));
        assert!(text.contains("ret i32"));
        // Constant instructions themselves produce no lines.
        assert!(!text.contains("= i32 3"));
    }

    #[test]
    fn test_native_dump_shows_all_kinds() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let mut module = Module::new("demo");
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
        b.ret(Some(loaded)).unwrap();

        let text = module.print_ir(&ctx);
        assert!(text.contains("alloca i32"));
        assert!(text.contains("store"));
        assert!(text.contains("load"));
        assert!(text.contains("return"));
    }
}
