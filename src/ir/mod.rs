//! SSA Intermediate Representation
//!
//! A [`Module`] owns everything: functions, blocks, instructions and
//! global values all live in arenas indexed by small id handles, so every
//! cross-edge (operand references, branch targets, phi predecessors) is a
//! non-owning handle and nothing is reference-counted or cyclic.
//!
//! Every value keeps a use-list: the instructions referencing it as an
//! operand, one entry per occurrence. The use-lists are maintained
//! exclusively by the mutation entry points on [`Module`]
//! ([`Module::new_inst`], [`Module::mutate_kind`],
//! [`Module::replace_all_uses`], [`Module::erase_inst`]); passes never
//! touch them directly.

pub mod builder;
pub mod inst;
pub mod print;

pub use builder::Builder;
pub use inst::{BinaryOp, CastOp, CompareOp, InstKind, UnaryOp};

use crate::common::context::Context;
use crate::common::diag::Loc;
use crate::common::types::{TypeId, TypeKind};
use std::fmt;

/// Handle to a value (instruction, parameter or global) in a module
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

/// Handle to a basic block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

/// Handle to a function
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);

macro_rules! impl_id {
    ($name:ident, $prefix:literal) => {
        impl $name {
            pub fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

impl_id!(ValueId, "%");
impl_id!(BlockId, "bb");
impl_id!(FuncId, "@");

/// Symbol visibility of a function or global
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    /// Visible only within the module
    Internal,
    /// Defined here and visible to the linker
    Exported,
    /// Declared here, defined elsewhere
    Imported,
}

impl Linkage {
    pub fn is_extern(self) -> bool {
        matches!(self, Linkage::Imported)
    }

    /// Whether the symbol is visible outside the object
    pub fn is_exported(self) -> bool {
        matches!(self, Linkage::Exported)
    }
}

/// Attributes inferred (or reset) by the function analyses
#[derive(Clone, Copy, Debug, Default)]
pub struct FunctionAttrs {
    pub pure: bool,
    pub leaf: bool,
    pub noreturn: bool,
    pub ever_referenced: bool,
}

/// A function definition or declaration
#[derive(Clone, Debug)]
pub struct FunctionData {
    pub name: String,
    /// Interned function type
    pub ty: TypeId,
    pub linkage: Linkage,
    /// Parameter values, index-numbered in signature order
    pub params: Vec<ValueId>,
    /// Blocks in layout order; the first is the entry block
    pub blocks: Vec<BlockId>,
    pub attrs: FunctionAttrs,
    pub loc: Loc,
    removed: bool,
}

impl FunctionData {
    pub fn is_definition(&self) -> bool {
        !self.blocks.is_empty()
    }
}

/// A basic block
#[derive(Clone, Debug)]
pub struct BlockData {
    pub func: FuncId,
    insts: Vec<ValueId>,
}

/// A value in the arena
#[derive(Clone, Debug)]
pub struct ValueData {
    pub kind: InstKind,
    pub ty: TypeId,
    pub loc: Loc,
    /// Instructions using this value as an operand, one entry per
    /// occurrence
    uses: Vec<ValueId>,
    /// The owning block, if this value is an instruction placed in one
    block: Option<BlockId>,
}

/// An LCC IR module
#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    funcs: Vec<FunctionData>,
    globals: Vec<ValueId>,
    entry: Option<FuncId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            ..Default::default()
        }
    }

    // === Functions ===

    /// Create a function of interned function type `ty`, materialising
    /// one Parameter value per signature parameter.
    pub fn add_function(
        &mut self,
        ctx: &Context,
        name: impl Into<String>,
        ty: TypeId,
        linkage: Linkage,
    ) -> FuncId {
        let param_types = match ctx.types.kind(ty) {
            TypeKind::Function { params, .. } => params,
            other => crate::ice!("function created with non-function type {:?}", other),
        };

        let id = FuncId(self.funcs.len() as u32);
        let params = param_types
            .iter()
            .enumerate()
            .map(|(index, pty)| {
                self.alloc_value(
                    InstKind::Parameter {
                        index: index as u32,
                    },
                    *pty,
                    Loc::none(),
                )
            })
            .collect();

        self.funcs.push(FunctionData {
            name: name.into(),
            ty,
            linkage,
            params,
            blocks: Vec::new(),
            attrs: FunctionAttrs::default(),
            loc: Loc::none(),
            removed: false,
        });
        id
    }

    pub fn func(&self, id: FuncId) -> &FunctionData {
        &self.funcs[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut FunctionData {
        &mut self.funcs[id.index()]
    }

    /// Live function ids in creation order
    pub fn funcs(&self) -> impl Iterator<Item = FuncId> + use<> {
        let live: Vec<FuncId> = self
            .funcs
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.removed)
            .map(|(i, _)| FuncId(i as u32))
            .collect();
        live.into_iter()
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.funcs
            .iter()
            .position(|f| !f.removed && f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// Designate the program entry point (always treated as referenced)
    pub fn set_entry(&mut self, func: FuncId) {
        self.entry = Some(func);
    }

    pub fn entry(&self) -> Option<FuncId> {
        self.entry
    }

    /// Drop a function from the module. The caller guarantees nothing
    /// references it any more.
    pub fn remove_function(&mut self, id: FuncId) {
        let blocks = std::mem::take(&mut self.funcs[id.index()].blocks);
        for block in blocks {
            for inst in std::mem::take(&mut self.blocks[block.index()].insts) {
                let operands = self.values[inst.index()].kind.operands();
                for op in operands {
                    self.remove_use(op, inst);
                }
                self.values[inst.index()].kind = InstKind::Removed;
                self.values[inst.index()].uses.clear();
            }
        }
        self.funcs[id.index()].removed = true;
    }

    // === Blocks ===

    /// Append a fresh, empty block to `func`
    pub fn add_block(&mut self, func: FuncId) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            func,
            insts: Vec::new(),
        });
        self.funcs[func.index()].blocks.push(id);
        id
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    pub fn block_func(&self, id: BlockId) -> FuncId {
        self.blocks[id.index()].func
    }

    pub fn block_insts(&self, id: BlockId) -> &[ValueId] {
        &self.blocks[id.index()].insts
    }

    /// The block's terminator, if it has one
    pub fn terminator(&self, id: BlockId) -> Option<ValueId> {
        self.blocks[id.index()]
            .insts
            .last()
            .copied()
            .filter(|v| self.values[v.index()].kind.is_terminator())
    }

    /// Successor blocks, in terminator operand order
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        match self.terminator(id).map(|t| &self.values[t.index()].kind) {
            Some(InstKind::Branch { target }) => vec![*target],
            Some(InstKind::CondBranch {
                then_block,
                else_block,
                ..
            }) => vec![*then_block, *else_block],
            _ => vec![],
        }
    }

    /// Predecessor blocks of `id` within its function, in block order
    pub fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        let func = self.block_func(id);
        self.funcs[func.index()]
            .blocks
            .iter()
            .copied()
            .filter(|b| self.successors(*b).contains(&id))
            .collect()
    }

    /// Detach a block from its function's layout. The caller has already
    /// redirected all incoming edges.
    pub fn remove_block(&mut self, id: BlockId) {
        for inst in std::mem::take(&mut self.blocks[id.index()].insts) {
            let operands = self.values[inst.index()].kind.operands();
            for op in operands {
                self.remove_use(op, inst);
            }
            self.values[inst.index()].kind = InstKind::Removed;
            self.values[inst.index()].uses.clear();
        }
        let func = self.blocks[id.index()].func;
        self.funcs[func.index()].blocks.retain(|b| *b != id);
    }

    // === Values ===

    fn alloc_value(&mut self, kind: InstKind, ty: TypeId, loc: Loc) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData {
            kind,
            ty,
            loc,
            uses: Vec::new(),
            block: None,
        });
        let operands = self.values[id.index()].kind.operands();
        for op in operands {
            self.add_use(op, id);
        }
        id
    }

    /// Create an instruction value without placing it in a block.
    /// Operand use-lists are updated here.
    pub fn new_inst(&mut self, kind: InstKind, ty: TypeId, loc: Loc) -> ValueId {
        self.alloc_value(kind, ty, loc)
    }

    /// Create a module-level global variable reserving storage of `ty`.
    /// The value itself is the symbol's address.
    pub fn add_global(
        &mut self,
        ctx: &Context,
        name: impl Into<String>,
        ty: TypeId,
        init: Option<ValueId>,
    ) -> ValueId {
        let id = self.alloc_value(
            InstKind::GlobalVariable {
                name: name.into(),
                ty,
                init,
            },
            ctx.types.ptr(),
            Loc::none(),
        );
        self.globals.push(id);
        id
    }

    pub fn globals(&self) -> &[ValueId] {
        &self.globals
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn kind(&self, id: ValueId) -> &InstKind {
        &self.values[id.index()].kind
    }

    pub fn ty(&self, id: ValueId) -> TypeId {
        self.values[id.index()].ty
    }

    pub fn loc(&self, id: ValueId) -> Loc {
        self.values[id.index()].loc
    }

    pub fn parent_block(&self, id: ValueId) -> Option<BlockId> {
        self.values[id.index()].block
    }

    /// Reassign a value's result type (used when a pass rewrites an
    /// instruction into one of a different shape)
    pub fn set_ty(&mut self, id: ValueId, ty: TypeId) {
        self.values[id.index()].ty = ty;
    }

    /// The instructions using `id` as an operand, one entry per
    /// occurrence
    pub fn uses(&self, id: ValueId) -> &[ValueId] {
        &self.values[id.index()].uses
    }

    // === Placement ===

    /// Append `inst` to `block`
    pub fn push_inst(&mut self, block: BlockId, inst: ValueId) {
        debug_assert!(self.values[inst.index()].block.is_none());
        self.values[inst.index()].block = Some(block);
        self.blocks[block.index()].insts.push(inst);
    }

    /// Insert `inst` into `block` before the instruction `before`
    pub fn insert_inst_before(&mut self, block: BlockId, inst: ValueId, before: ValueId) {
        debug_assert!(self.values[inst.index()].block.is_none());
        let pos = self.blocks[block.index()]
            .insts
            .iter()
            .position(|v| *v == before)
            .unwrap_or_else(|| crate::ice!("insert_inst_before: anchor not in block"));
        self.values[inst.index()].block = Some(block);
        self.blocks[block.index()].insts.insert(pos, inst);
    }

    /// Insert `inst` into `block` immediately after `after`
    pub fn insert_inst_after(&mut self, block: BlockId, inst: ValueId, after: ValueId) {
        debug_assert!(self.values[inst.index()].block.is_none());
        let pos = self.blocks[block.index()]
            .insts
            .iter()
            .position(|v| *v == after)
            .unwrap_or_else(|| crate::ice!("insert_inst_after: anchor not in block"));
        self.values[inst.index()].block = Some(block);
        self.blocks[block.index()].insts.insert(pos + 1, inst);
    }

    /// Move every instruction after `anchor` from `from` into `to`,
    /// preserving order. Used to split a block around a call site.
    pub fn transfer_insts_after(&mut self, from: BlockId, anchor: ValueId, to: BlockId) {
        let pos = self.blocks[from.index()]
            .insts
            .iter()
            .position(|v| *v == anchor)
            .unwrap_or_else(|| crate::ice!("transfer_insts_after: anchor not in block"));
        let moved: Vec<ValueId> = self.blocks[from.index()].insts.split_off(pos + 1);
        for inst in &moved {
            self.values[inst.index()].block = Some(to);
        }
        self.blocks[to.index()].insts.extend(moved);
    }

    // === Mutation (use-list preserving) ===

    fn add_use(&mut self, value: ValueId, user: ValueId) {
        self.values[value.index()].uses.push(user);
    }

    fn remove_use(&mut self, value: ValueId, user: ValueId) {
        let uses = &mut self.values[value.index()].uses;
        if let Some(pos) = uses.iter().position(|u| *u == user) {
            uses.swap_remove(pos);
        }
    }

    /// Edit an instruction's kind in place. Operand use-lists are
    /// rebuilt from the before/after operand sets, so the closure may
    /// freely rewrite the payload (e.g. fold a Binary into an
    /// IntegerConstant).
    pub fn mutate_kind(&mut self, id: ValueId, f: impl FnOnce(&mut InstKind)) {
        let before = self.values[id.index()].kind.operands();
        f(&mut self.values[id.index()].kind);
        let after = self.values[id.index()].kind.operands();
        for op in before {
            self.remove_use(op, id);
        }
        for op in after {
            self.add_use(op, id);
        }
    }

    /// Rewire every use of `old` to refer to `new`; afterwards `old` has
    /// an empty use-list.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let users = std::mem::take(&mut self.values[old.index()].uses);
        for user in users {
            let n = self.values[user.index()].kind.replace_operand(old, new);
            for _ in 0..n {
                self.add_use(new, user);
            }
        }
        // Duplicate occurrences in the taken list produced duplicate
        // rewrites reporting 0 replacements after the first; the arena
        // list for `new` now has exactly one entry per occurrence.
        self.values[old.index()].uses.clear();
    }

    /// Delete an instruction with no remaining users: unregister it from
    /// its operands' use-lists, unlink it from its block and tombstone
    /// the slot.
    pub fn erase_inst(&mut self, id: ValueId) {
        if !self.values[id.index()].uses.is_empty() {
            crate::ice!("erasing instruction {} which still has users", id);
        }
        let operands = self.values[id.index()].kind.operands();
        for op in operands {
            self.remove_use(op, id);
        }
        if let Some(block) = self.values[id.index()].block.take() {
            self.blocks[block.index()].insts.retain(|v| *v != id);
        }
        self.values[id.index()].kind = InstKind::Removed;
    }

    /// Replace the block's terminator with Unreachable (used when a tail
    /// call makes the rest of the block dead for code generation).
    pub fn mark_unreachable(&mut self, ctx: &Context, block: BlockId) {
        if let Some(term) = self.terminator(block) {
            self.mutate_kind(term, |k| *k = InstKind::Unreachable);
            self.values[term.index()].ty = ctx.types.void();
        } else {
            let unreachable = self.new_inst(InstKind::Unreachable, ctx.types.void(), Loc::none());
            self.push_inst(block, unreachable);
        }
    }

    // === Queries used across passes ===

    /// Whether `id` has side effects, resolving callee purity through
    /// the module's function attributes
    pub fn has_side_effects(&self, id: ValueId) -> bool {
        self.values[id.index()]
            .kind
            .has_side_effects(|f| self.funcs[f.index()].attrs.pure)
    }

    /// Integer constant payload, if the value is one
    pub fn as_int_constant(&self, id: ValueId) -> Option<u64> {
        match self.kind(id) {
            InstKind::IntegerConstant(v) | InstKind::LitInteger(v) => Some(*v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;
    use crate::common::types::CallConv;

    fn test_ctx() -> Context {
        Context::new(Target::X86_64_LINUX)
    }

    fn int_fn_type(ctx: &Context) -> TypeId {
        let i32t = ctx.types.int(32);
        ctx.types.function(i32t, vec![i32t], false, CallConv::C)
    }

    #[test]
    fn test_use_lists_track_operands() {
        let ctx = test_ctx();
        let mut module = Module::new("test");
        let func = module.add_function(&ctx, "f", int_fn_type(&ctx), Linkage::Internal);
        let block = module.add_block(func);

        let i32t = ctx.types.int(32);
        let a = module.new_inst(InstKind::IntegerConstant(3), i32t, Loc::none());
        let b = module.new_inst(InstKind::IntegerConstant(4), i32t, Loc::none());
        let add = module.new_inst(
            InstKind::Binary {
                op: BinaryOp::Add,
                lhs: a,
                rhs: b,
            },
            i32t,
            Loc::none(),
        );
        module.push_inst(block, a);
        module.push_inst(block, b);
        module.push_inst(block, add);

        assert_eq!(module.uses(a), &[add]);
        assert_eq!(module.uses(b), &[add]);
        assert!(module.uses(add).is_empty());
    }

    #[test]
    fn test_replace_all_uses() {
        let ctx = test_ctx();
        let mut module = Module::new("test");
        let func = module.add_function(&ctx, "f", int_fn_type(&ctx), Linkage::Internal);
        let block = module.add_block(func);

        let i32t = ctx.types.int(32);
        let a = module.new_inst(InstKind::IntegerConstant(1), i32t, Loc::none());
        let b = module.new_inst(InstKind::IntegerConstant(2), i32t, Loc::none());
        // mul uses a twice; both occurrences must be rewritten.
        let mul = module.new_inst(
            InstKind::Binary {
                op: BinaryOp::Mul,
                lhs: a,
                rhs: a,
            },
            i32t,
            Loc::none(),
        );
        module.push_inst(block, a);
        module.push_inst(block, b);
        module.push_inst(block, mul);

        module.replace_all_uses(a, b);
        assert!(module.uses(a).is_empty());
        assert_eq!(module.uses(b).len(), 2);
        assert_eq!(module.kind(mul).operands(), vec![b, b]);
    }

    #[test]
    fn test_erase_inst_cleans_up() {
        let ctx = test_ctx();
        let mut module = Module::new("test");
        let func = module.add_function(&ctx, "f", int_fn_type(&ctx), Linkage::Internal);
        let block = module.add_block(func);

        let i32t = ctx.types.int(32);
        let a = module.new_inst(InstKind::IntegerConstant(1), i32t, Loc::none());
        let copy = module.new_inst(InstKind::Copy { value: a }, i32t, Loc::none());
        module.push_inst(block, a);
        module.push_inst(block, copy);

        module.erase_inst(copy);
        assert!(module.uses(a).is_empty());
        assert_eq!(module.block_insts(block), &[a]);
        assert_eq!(*module.kind(copy), InstKind::Removed);
    }

    #[test]
    fn test_cfg_edges() {
        let ctx = test_ctx();
        let mut module = Module::new("test");
        let func = module.add_function(&ctx, "f", int_fn_type(&ctx), Linkage::Internal);
        let entry = module.add_block(func);
        let then_block = module.add_block(func);
        let else_block = module.add_block(func);

        let i1 = ctx.types.int(1);
        let cond = module.new_inst(InstKind::IntegerConstant(1), i1, Loc::none());
        let br = module.new_inst(
            InstKind::CondBranch {
                cond,
                then_block,
                else_block,
            },
            ctx.types.void(),
            Loc::none(),
        );
        module.push_inst(entry, cond);
        module.push_inst(entry, br);

        assert_eq!(module.successors(entry), vec![then_block, else_block]);
        assert_eq!(module.predecessors(then_block), vec![entry]);
        assert_eq!(module.predecessors(else_block), vec![entry]);
    }
}
