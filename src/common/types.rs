//! Interned Type Universe
//!
//! Every type the IR mentions lives in a per-context [`TypeStore`]. Types
//! are structurally interned: building the same descriptor twice yields
//! the same [`TypeId`], so type equality is handle equality. The store is
//! append-only for the lifetime of a compilation.
//!
//! Sizes and alignments are a pure function of the descriptor and the
//! target.

use crate::common::target::Target;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// Handle to an interned type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

/// Calling convention of a function type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// The C convention of the target (sysv or win64)
    C,
    Laye,
    Intercept,
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallConv::C => write!(f, "ccc"),
            CallConv::Laye => write!(f, "layecc"),
            CallConv::Intercept => write!(f, "intcc"),
        }
    }
}

/// Structural descriptor of a type
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    /// An integer of 1..=64 bits
    Integer(u32),
    /// An opaque pointer, sized to the target word
    Pointer,
    Array {
        elem: TypeId,
        len: u64,
    },
    Struct {
        fields: Vec<TypeId>,
        packed: bool,
    },
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        varargs: bool,
        conv: CallConv,
    },
}

/// The interner
///
/// Interior mutability lets IR builders create types through a shared
/// `&Context`; the table only ever grows.
#[derive(Debug, Default)]
pub struct TypeStore {
    kinds: RefCell<Vec<TypeKind>>,
    interned: RefCell<HashMap<TypeKind, TypeId>>,
}

impl TypeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&self, kind: TypeKind) -> TypeId {
        if let Some(id) = self.interned.borrow().get(&kind) {
            return *id;
        }
        let mut kinds = self.kinds.borrow_mut();
        let id = TypeId(kinds.len() as u32);
        kinds.push(kind.clone());
        self.interned.borrow_mut().insert(kind, id);
        id
    }

    pub fn void(&self) -> TypeId {
        self.intern(TypeKind::Void)
    }

    /// Intern an integer type; `bits` must be in 1..=64
    pub fn int(&self, bits: u32) -> TypeId {
        assert!(
            (1..=64).contains(&bits),
            "integer width {} out of range 1..=64",
            bits
        );
        self.intern(TypeKind::Integer(bits))
    }

    pub fn ptr(&self) -> TypeId {
        self.intern(TypeKind::Pointer)
    }

    pub fn array(&self, elem: TypeId, len: u64) -> TypeId {
        self.intern(TypeKind::Array { elem, len })
    }

    pub fn strukt(&self, fields: Vec<TypeId>, packed: bool) -> TypeId {
        self.intern(TypeKind::Struct { fields, packed })
    }

    pub fn function(
        &self,
        ret: TypeId,
        params: Vec<TypeId>,
        varargs: bool,
        conv: CallConv,
    ) -> TypeId {
        self.intern(TypeKind::Function {
            ret,
            params,
            varargs,
            conv,
        })
    }

    /// The descriptor behind a handle
    pub fn kind(&self, id: TypeId) -> TypeKind {
        self.kinds.borrow()[id.0 as usize].clone()
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Void)
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Integer(_))
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Pointer)
    }

    pub fn is_function(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Function { .. })
    }

    /// Integer width in bits, if `id` is an integer type
    pub fn int_bits(&self, id: TypeId) -> Option<u32> {
        match self.kind(id) {
            TypeKind::Integer(bits) => Some(bits),
            _ => None,
        }
    }

    /// Size of a value of this type in bits
    pub fn bits(&self, id: TypeId, target: &Target) -> u64 {
        self.bytes(id, target) * 8
    }

    /// Size of a value of this type in bytes
    pub fn bytes(&self, id: TypeId, target: &Target) -> u64 {
        match self.kind(id) {
            TypeKind::Void => 0,
            TypeKind::Integer(bits) => u64::from(bits.div_ceil(8)),
            TypeKind::Pointer | TypeKind::Function { .. } => u64::from(target.word_bits() / 8),
            TypeKind::Array { elem, len } => self.bytes(elem, target) * len,
            TypeKind::Struct { fields, packed } => {
                let mut size = 0u64;
                let mut max_align = 1u64;
                for field in &fields {
                    let align = if packed { 1 } else { self.align(*field, target) };
                    max_align = max_align.max(align);
                    size = size.next_multiple_of(align) + self.bytes(*field, target);
                }
                size.next_multiple_of(max_align)
            }
        }
    }

    /// Alignment of a value of this type in bytes
    pub fn align(&self, id: TypeId, target: &Target) -> u64 {
        match self.kind(id) {
            TypeKind::Void => 1,
            TypeKind::Integer(bits) => u64::from(bits.div_ceil(8).next_power_of_two().min(8)),
            TypeKind::Pointer | TypeKind::Function { .. } => u64::from(target.word_bits() / 8),
            TypeKind::Array { elem, .. } => self.align(elem, target),
            TypeKind::Struct { fields, packed } => {
                if packed {
                    1
                } else {
                    fields
                        .iter()
                        .map(|f| self.align(*f, target))
                        .max()
                        .unwrap_or(1)
                }
            }
        }
    }

    /// Render a type for IR dumps (LLVM-compatible spelling)
    pub fn display(&self, id: TypeId) -> String {
        match self.kind(id) {
            TypeKind::Void => "void".to_string(),
            TypeKind::Integer(bits) => format!("i{}", bits),
            TypeKind::Pointer => "ptr".to_string(),
            TypeKind::Array { elem, len } => format!("[{} x {}]", len, self.display(elem)),
            TypeKind::Struct { fields, packed } => {
                let inner = fields
                    .iter()
                    .map(|f| self.display(*f))
                    .collect::<Vec<_>>()
                    .join(", ");
                if packed {
                    format!("<{{ {} }}>", inner)
                } else {
                    format!("{{ {} }}", inner)
                }
            }
            TypeKind::Function {
                ret,
                params,
                varargs,
                ..
            } => {
                let mut inner = params.iter().map(|p| self.display(*p)).collect::<Vec<_>>();
                if varargs {
                    inner.push("...".to_string());
                }
                format!("{} ({})", self.display(ret), inner.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_interning() {
        let types = TypeStore::new();
        assert_eq!(types.int(32), types.int(32));
        assert_ne!(types.int(32), types.int(64));
        assert_eq!(types.ptr(), types.ptr());

        let a = types.array(types.int(8), 4);
        let b = types.array(types.int(8), 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sizes() {
        let types = TypeStore::new();
        let target = Target::X86_64_LINUX;

        assert_eq!(types.bytes(types.int(1), &target), 1);
        assert_eq!(types.bytes(types.int(32), &target), 4);
        assert_eq!(types.bytes(types.ptr(), &target), 8);
        assert_eq!(types.bytes(types.array(types.int(64), 4), &target), 32);
    }

    #[test]
    fn test_struct_layout() {
        let types = TypeStore::new();
        let target = Target::X86_64_LINUX;

        // { i8, i64 } pads the first field out to 8 bytes.
        let s = types.strukt(vec![types.int(8), types.int(64)], false);
        assert_eq!(types.bytes(s, &target), 16);
        assert_eq!(types.align(s, &target), 8);

        // The packed variant does not.
        let p = types.strukt(vec![types.int(8), types.int(64)], true);
        assert_eq!(types.bytes(p, &target), 9);
        assert_eq!(types.align(p, &target), 1);
    }

    #[test]
    fn test_display() {
        let types = TypeStore::new();
        let f = types.function(types.int(32), vec![types.ptr()], false, CallConv::C);
        assert_eq!(types.display(f), "i32 (ptr)");
    }

    #[test]
    #[should_panic]
    fn test_zero_width_integer_rejected() {
        let types = TypeStore::new();
        types.int(0);
    }
}
