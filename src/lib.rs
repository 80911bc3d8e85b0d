//! LCC Compiler Core
//!
//! The shared middle and back end of the lcc frontends: a typed SSA IR
//! with use-lists, an optimisation pipeline, ABI lowering, machine-IR
//! construction, x86-64 instruction selection, register allocation and
//! assembly/object emission.
//!
//! Frontends construct IR through [`ir::Builder`] against a
//! [`common::Context`] and hand the module to
//! [`pipeline::compile_module`]; everything else in this crate is the
//! machinery behind that call.
//!
//! ```no_run
//! use lcc::backend::OutputFormat;
//! use lcc::common::{Context, Target};
//! use lcc::common::types::CallConv;
//! use lcc::ir::{Builder, Linkage, Module};
//! use lcc::pipeline::{self, CompileOptions};
//!
//! let ctx = Context::new(Target::X86_64_LINUX);
//! let mut module = Module::new("demo");
//!
//! let i64t = ctx.types.int(64);
//! let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
//! let func = module.add_function(&ctx, "double_it", fty, Linkage::Exported);
//! let entry = module.add_block(func);
//! let param = module.func(func).params[0];
//!
//! let mut b = Builder::new(&ctx, &mut module);
//! b.position_at_end(entry);
//! let sum = b.binary(lcc::ir::BinaryOp::Add, param, param).unwrap();
//! b.ret(Some(sum)).unwrap();
//!
//! let options = CompileOptions { optimise: true, ..Default::default() };
//! let artifact = pipeline::compile_module(&ctx, &mut module, &options).unwrap();
//! ```

pub mod analysis;
pub mod backend;
pub mod cli;
pub mod common;
pub mod frontend;
pub mod ir;
pub mod optimise;
pub mod pipeline;
pub mod verifier;
