//! IR Builder
//!
//! The validated construction API frontends use to materialise IR. Each
//! constructor checks the operand-type constraints of its instruction
//! kind and either inserts the instruction at the end of the current
//! block or reports why it cannot.
//!
//! Passes inside the crate construct instructions directly through
//! [`Module::new_inst`]; the builder is the boundary where foreign input
//! is still untrusted.

use crate::common::context::Context;
use crate::common::diag::Loc;
use crate::common::types::{TypeId, TypeKind};
use crate::ir::inst::{BinaryOp, CastOp, CompareOp, InstKind, UnaryOp};
use crate::ir::{BlockId, FuncId, Module, ValueId};
use thiserror::Error;

/// A rejected instruction construction
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no insertion block is set")]
    NoBlock,
    #[error("block already has a terminator")]
    BlockTerminated,
    #[error("operand types `{0}` and `{1}` differ")]
    OperandMismatch(String, String),
    #[error("expected an integer type, found `{0}`")]
    NotInteger(String),
    #[error("expected a pointer operand, found `{0}`")]
    NotPointer(String),
    #[error("call expects {expected} argument(s), found {found}")]
    BadArity { expected: usize, found: usize },
    #[error("argument {index} has type `{found}`, expected `{expected}`")]
    BadArgument {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("return value type `{found}` does not match function return type `{expected}`")]
    BadReturn { expected: String, found: String },
    #[error("cast from `{0}` to `{1}` is not valid")]
    BadCast(String, String),
    #[error("callee is not callable: `{0}`")]
    NotCallable(String),
}

type Result<T> = std::result::Result<T, BuildError>;

/// Instruction builder positioned at the end of one block
pub struct Builder<'a> {
    ctx: &'a Context,
    module: &'a mut Module,
    block: Option<BlockId>,
    loc: Loc,
}

impl<'a> Builder<'a> {
    pub fn new(ctx: &'a Context, module: &'a mut Module) -> Self {
        Self {
            ctx,
            module,
            block: None,
            loc: Loc::none(),
        }
    }

    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    /// Set the source location attached to subsequent instructions
    pub fn set_loc(&mut self, loc: Loc) {
        self.loc = loc;
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.block = Some(block);
    }

    fn insert(&mut self, kind: InstKind, ty: TypeId) -> Result<ValueId> {
        let block = self.block.ok_or(BuildError::NoBlock)?;
        if kind.is_terminator() && self.module.terminator(block).is_some() {
            return Err(BuildError::BlockTerminated);
        }
        let inst = self.module.new_inst(kind, ty, self.loc);
        self.module.push_inst(block, inst);
        Ok(inst)
    }

    fn display(&self, ty: TypeId) -> String {
        self.ctx.types.display(ty)
    }

    fn expect_integer(&self, v: ValueId) -> Result<TypeId> {
        let ty = self.module.ty(v);
        if self.ctx.types.is_integer(ty) {
            Ok(ty)
        } else {
            Err(BuildError::NotInteger(self.display(ty)))
        }
    }

    fn expect_pointer(&self, v: ValueId) -> Result<()> {
        let ty = self.module.ty(v);
        if self.ctx.types.is_pointer(ty) {
            Ok(())
        } else {
            Err(BuildError::NotPointer(self.display(ty)))
        }
    }

    // === Constants and references ===

    pub fn int_const(&mut self, ty: TypeId, value: u64) -> Result<ValueId> {
        if !self.ctx.types.is_integer(ty) {
            return Err(BuildError::NotInteger(self.display(ty)));
        }
        self.insert(InstKind::IntegerConstant(value), ty)
    }

    pub fn array_const(&mut self, elem: TypeId, data: Vec<u8>) -> Result<ValueId> {
        let ty = self.ctx.types.array(elem, data.len() as u64);
        self.insert(InstKind::ArrayConstant(data), ty)
    }

    pub fn poison(&mut self, ty: TypeId) -> Result<ValueId> {
        self.insert(InstKind::Poison, ty)
    }

    /// Reference to a function; typed as an opaque pointer
    pub fn func_ref(&mut self, func: FuncId) -> Result<ValueId> {
        self.insert(InstKind::FuncRef(func), self.ctx.types.ptr())
    }

    pub fn lit_integer(&mut self, value: u64) -> Result<ValueId> {
        self.insert(InstKind::LitInteger(value), self.ctx.types.int(64))
    }

    pub fn lit_string(&mut self, value: impl Into<String>) -> Result<ValueId> {
        self.insert(InstKind::LitString(value.into()), self.ctx.types.ptr())
    }

    // === Memory ===

    /// Reserve a stack slot for a value of `allocated`; yields its address
    pub fn alloca(&mut self, allocated: TypeId) -> Result<ValueId> {
        self.insert(InstKind::Alloca { allocated }, self.ctx.types.ptr())
    }

    pub fn load(&mut self, ty: TypeId, ptr: ValueId) -> Result<ValueId> {
        self.expect_pointer(ptr)?;
        self.insert(InstKind::Load { ptr }, ty)
    }

    pub fn store(&mut self, value: ValueId, ptr: ValueId) -> Result<ValueId> {
        self.expect_pointer(ptr)?;
        self.insert(InstKind::Store { value, ptr }, self.ctx.types.void())
    }

    pub fn gep(&mut self, elem: TypeId, base: ValueId, indices: Vec<ValueId>) -> Result<ValueId> {
        self.expect_pointer(base)?;
        for index in &indices {
            self.expect_integer(*index)?;
        }
        self.insert(
            InstKind::GetElementPtr {
                elem,
                base,
                indices,
            },
            self.ctx.types.ptr(),
        )
    }

    pub fn copy(&mut self, value: ValueId) -> Result<ValueId> {
        let ty = self.module.ty(value);
        self.insert(InstKind::Copy { value }, ty)
    }

    // === Arithmetic ===

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let lty = self.expect_integer(lhs)?;
        let rty = self.expect_integer(rhs)?;
        if lty != rty {
            return Err(BuildError::OperandMismatch(
                self.display(lty),
                self.display(rty),
            ));
        }
        self.insert(InstKind::Binary { op, lhs, rhs }, lty)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: ValueId) -> Result<ValueId> {
        let ty = self.expect_integer(operand)?;
        self.insert(InstKind::Unary { op, operand }, ty)
    }

    pub fn cast(&mut self, op: CastOp, operand: ValueId, to: TypeId) -> Result<ValueId> {
        let from = self.module.ty(operand);
        let valid = match op {
            CastOp::ZExt | CastOp::SExt => {
                match (self.ctx.types.int_bits(from), self.ctx.types.int_bits(to)) {
                    (Some(a), Some(b)) => a <= b,
                    _ => false,
                }
            }
            CastOp::Trunc => {
                match (self.ctx.types.int_bits(from), self.ctx.types.int_bits(to)) {
                    (Some(a), Some(b)) => a >= b,
                    _ => false,
                }
            }
            // Bitcast reinterprets same-sized storage.
            CastOp::Bitcast => {
                self.ctx.types.bytes(from, self.ctx.target())
                    == self.ctx.types.bytes(to, self.ctx.target())
            }
        };
        if !valid {
            return Err(BuildError::BadCast(self.display(from), self.display(to)));
        }
        self.insert(InstKind::Cast { op, operand }, to)
    }

    pub fn compare(&mut self, op: CompareOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let lty = self.module.ty(lhs);
        let rty = self.module.ty(rhs);
        if lty != rty {
            return Err(BuildError::OperandMismatch(
                self.display(lty),
                self.display(rty),
            ));
        }
        self.insert(InstKind::Compare { op, lhs, rhs }, self.ctx.types.int(1))
    }

    // === Control flow ===

    pub fn branch(&mut self, target: BlockId) -> Result<ValueId> {
        self.insert(InstKind::Branch { target }, self.ctx.types.void())
    }

    pub fn cond_branch(
        &mut self,
        cond: ValueId,
        then_block: BlockId,
        else_block: BlockId,
    ) -> Result<ValueId> {
        self.expect_integer(cond)?;
        self.insert(
            InstKind::CondBranch {
                cond,
                then_block,
                else_block,
            },
            self.ctx.types.void(),
        )
    }

    pub fn ret(&mut self, value: Option<ValueId>) -> Result<ValueId> {
        let block = self.block.ok_or(BuildError::NoBlock)?;
        let func = self.module.block_func(block);
        let ret_ty = match self.ctx.types.kind(self.module.func(func).ty) {
            TypeKind::Function { ret, .. } => ret,
            _ => self.ctx.types.void(),
        };
        match value {
            Some(v) => {
                let vty = self.module.ty(v);
                if vty != ret_ty {
                    return Err(BuildError::BadReturn {
                        expected: self.display(ret_ty),
                        found: self.display(vty),
                    });
                }
            }
            None => {
                if !self.ctx.types.is_void(ret_ty) {
                    return Err(BuildError::BadReturn {
                        expected: self.display(ret_ty),
                        found: "void".to_string(),
                    });
                }
            }
        }
        self.insert(InstKind::Return { value }, self.ctx.types.void())
    }

    pub fn unreachable(&mut self) -> Result<ValueId> {
        self.insert(InstKind::Unreachable, self.ctx.types.void())
    }

    pub fn phi(&mut self, ty: TypeId, incoming: Vec<(BlockId, ValueId)>) -> Result<ValueId> {
        for (_, value) in &incoming {
            let vty = self.module.ty(*value);
            if vty != ty {
                return Err(BuildError::OperandMismatch(
                    self.display(ty),
                    self.display(vty),
                ));
            }
        }
        self.insert(InstKind::Phi { incoming }, ty)
    }

    // === Calls ===

    /// Direct call to a known function
    pub fn call(&mut self, func: FuncId, args: Vec<ValueId>) -> Result<ValueId> {
        let fty = self.module.func(func).ty;
        self.check_call_args(fty, &args)?;
        let callee = self.func_ref(func)?;
        let ret = self.function_return(fty);
        self.insert(
            InstKind::Call {
                callee,
                args,
                is_indirect: false,
                tail_call: false,
                callee_func: Some(func),
            },
            ret,
        )
    }

    /// Indirect call through a pointer with an explicit function type
    pub fn call_indirect(
        &mut self,
        fty: TypeId,
        callee: ValueId,
        args: Vec<ValueId>,
    ) -> Result<ValueId> {
        self.expect_pointer(callee)?;
        if !self.ctx.types.is_function(fty) {
            return Err(BuildError::NotCallable(self.display(fty)));
        }
        self.check_call_args(fty, &args)?;
        let ret = self.function_return(fty);
        self.insert(
            InstKind::Call {
                callee,
                args,
                is_indirect: true,
                tail_call: false,
                callee_func: None,
            },
            ret,
        )
    }

    pub fn memcopy(&mut self, dest: ValueId, src: ValueId, bytes: ValueId) -> Result<ValueId> {
        self.expect_pointer(dest)?;
        self.expect_pointer(src)?;
        self.expect_integer(bytes)?;
        self.insert(
            InstKind::MemCopy { dest, src, bytes },
            self.ctx.types.void(),
        )
    }

    fn function_return(&self, fty: TypeId) -> TypeId {
        match self.ctx.types.kind(fty) {
            TypeKind::Function { ret, .. } => ret,
            _ => self.ctx.types.void(),
        }
    }

    fn check_call_args(&self, fty: TypeId, args: &[ValueId]) -> Result<()> {
        let (params, varargs) = match self.ctx.types.kind(fty) {
            TypeKind::Function {
                params, varargs, ..
            } => (params, varargs),
            other => {
                return Err(BuildError::NotCallable(format!("{:?}", other)));
            }
        };
        if args.len() < params.len() || (!varargs && args.len() != params.len()) {
            return Err(BuildError::BadArity {
                expected: params.len(),
                found: args.len(),
            });
        }
        for (index, (arg, pty)) in args.iter().zip(params.iter()).enumerate() {
            let aty = self.module.ty(*arg);
            if aty != *pty {
                return Err(BuildError::BadArgument {
                    index,
                    expected: self.display(*pty),
                    found: self.display(aty),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;
    use crate::common::types::CallConv;
    use crate::ir::Linkage;

    fn setup() -> (Context, Module) {
        (Context::new(Target::X86_64_LINUX), Module::new("test"))
    }

    #[test]
    fn test_binary_requires_matching_widths() {
        let (ctx, mut module) = setup();
        let fty = ctx
            .types
            .function(ctx.types.void(), vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let x = b.int_const(ctx.types.int(32), 1).unwrap();
        let y = b.int_const(ctx.types.int(64), 2).unwrap();
        assert!(matches!(
            b.binary(BinaryOp::Add, x, y),
            Err(BuildError::OperandMismatch(..))
        ));
    }

    #[test]
    fn test_load_requires_pointer() {
        let (ctx, mut module) = setup();
        let fty = ctx
            .types
            .function(ctx.types.void(), vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        let x = b.int_const(ctx.types.int(32), 1).unwrap();
        assert!(matches!(
            b.load(ctx.types.int(32), x),
            Err(BuildError::NotPointer(_))
        ));
    }

    #[test]
    fn test_no_instruction_after_terminator() {
        let (ctx, mut module) = setup();
        let fty = ctx
            .types
            .function(ctx.types.void(), vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        b.ret(None).unwrap();
        assert_eq!(b.ret(None), Err(BuildError::BlockTerminated));
    }

    #[test]
    fn test_return_type_checked() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let fty = ctx.types.function(i32t, vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "f", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        assert!(matches!(b.ret(None), Err(BuildError::BadReturn { .. })));
        let v = b.int_const(i32t, 5).unwrap();
        assert!(b.ret(Some(v)).is_ok());
    }

    #[test]
    fn test_direct_call_checks_arity() {
        let (ctx, mut module) = setup();
        let i32t = ctx.types.int(32);
        let callee_ty = ctx.types.function(i32t, vec![i32t], false, CallConv::C);
        let callee = module.add_function(&ctx, "callee", callee_ty, Linkage::Internal);

        let fty = ctx
            .types
            .function(ctx.types.void(), vec![], false, CallConv::C);
        let func = module.add_function(&ctx, "caller", fty, Linkage::Internal);
        let block = module.add_block(func);

        let mut b = Builder::new(&ctx, &mut module);
        b.position_at_end(block);
        assert!(matches!(
            b.call(callee, vec![]),
            Err(BuildError::BadArity {
                expected: 1,
                found: 0
            })
        ));
    }
}
