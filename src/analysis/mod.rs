//! IR Analyses
//!
//! Dominator trees over function CFGs and the interprocedural attribute
//! analyses (pure, leaf, noreturn, reachability) that feed the optimiser.

pub mod attrs;
pub mod doms;

pub use attrs::analyse_functions;
pub use doms::DomTree;
