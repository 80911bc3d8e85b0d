//! Shared Compilation State
//!
//! Everything the whole pipeline needs: the compilation context, the
//! target descriptor, the diagnostic sink and the interned type universe.

pub mod context;
pub mod diag;
pub mod target;
pub mod types;

pub use context::Context;
pub use diag::{DiagEngine, FileId, Loc, Severity};
pub use target::{Arch, ObjectFormat, Os, Target};
pub use types::{CallConv, TypeId, TypeKind, TypeStore};
