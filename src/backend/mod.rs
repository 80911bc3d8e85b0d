//! Backend
//!
//! Everything after the optimiser: ABI lowering, machine-IR
//! construction, instruction selection, register allocation and the
//! assembly/object emitters.
//!
//! ```text
//! Module (IR)
//!     │ lower            ABI shapes (hidden return pointers, wide
//!     ▼                  loads/stores)
//! Module (IR)
//!     │ build_mir
//!     ▼
//! MirModule (generic opcodes)
//!     │ select_instructions
//!     ▼
//! MirModule (x86-64 opcodes)
//!     │ allocate_registers
//!     ▼
//! MirModule (physical registers)
//!     │ emit
//!     ▼
//! AT&T assembly text │ ELF object │ COFF object
//! ```

pub mod isel;
pub mod lower;
pub mod mir;
pub mod object;
pub mod regalloc;
pub mod x86_64;

use crate::backend::mir::{build_mir, print_mfunction};
use crate::backend::regalloc::{MachineDescription, allocate_registers};
use crate::common::context::Context;
use crate::common::target::ObjectFormat;
use crate::ir::Module;
use thiserror::Error;

/// What the pipeline should produce
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// GNU-AT&T assembly text
    Assembly,
    /// Relocatable object (ELF on Linux, COFF on Windows)
    Object,
    /// LLVM-compatible textual IR
    LlvmIr,
    /// Native IR dump
    Ir,
}

/// Knobs for [`Module::emit`]
#[derive(Clone, Copy, Debug)]
pub struct EmitOptions {
    pub format: OutputFormat,
    /// Print the machine IR before selection, after selection and
    /// after register allocation
    pub print_mir: bool,
    /// Stop after register allocation (debugging aid)
    pub stopat_mir: bool,
    /// Print the generic-object summary when emitting objects
    pub verbose: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        EmitOptions {
            format: OutputFormat::Assembly,
            print_mir: false,
            stopat_mir: false,
            verbose: false,
        }
    }
}

/// Why emission stopped
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("compilation stopped: errors were reported")]
    Diagnostics,
    #[error("stopped after register allocation")]
    StoppedAtMir,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Module {
    /// Run the backend over the (already lowered) module and produce
    /// the requested artifact as bytes. The context's diagnostic sink
    /// is checked at every stage boundary.
    pub fn emit(&self, ctx: &Context, options: &EmitOptions) -> Result<Vec<u8>, EmitError> {
        if ctx.has_error() {
            return Err(EmitError::Diagnostics);
        }

        match options.format {
            OutputFormat::LlvmIr => return Ok(self.llvm(ctx).into_bytes()),
            OutputFormat::Ir => return Ok(self.print_ir(ctx).into_bytes()),
            OutputFormat::Assembly | OutputFormat::Object => {}
        }

        let mut mir = build_mir(ctx, self);
        if options.print_mir {
            for func in &mir.funcs {
                print!("{}", print_mfunction(func, &mir::generic_opcode_name));
            }
        }

        x86_64::isel::select_instructions(ctx, &mut mir);
        if ctx.has_error() {
            return Err(EmitError::Diagnostics);
        }
        if options.print_mir {
            println!("\nAfter ISel");
            for func in &mir.funcs {
                print!(
                    "{}",
                    print_mfunction(func, &|op| x86_64::opcode_to_string(op))
                );
            }
        }

        let desc = MachineDescription::x86_64(ctx.target());
        for func in &mut mir.funcs {
            allocate_registers(&desc, func);
        }
        if ctx.has_error() {
            return Err(EmitError::Diagnostics);
        }
        if options.print_mir {
            println!("\nAfter RA");
            for func in &mir.funcs {
                print!(
                    "{}",
                    print_mfunction(func, &|op| x86_64::opcode_to_string(op))
                );
            }
        }
        if options.stopat_mir {
            return Err(EmitError::StoppedAtMir);
        }

        match options.format {
            OutputFormat::Assembly => {
                Ok(x86_64::assembly::emit_gnu_att_assembly(ctx, &mir).into_bytes())
            }
            OutputFormat::Object => {
                let gobj = x86_64::encode::emit_mcode_object(ctx, &mir);
                if options.verbose {
                    println!("{}", gobj.print());
                }
                let mut bytes = Vec::new();
                match ctx.target().object_format() {
                    ObjectFormat::Elf => gobj.as_elf(&mut bytes)?,
                    ObjectFormat::Coff => gobj.as_coff(&mut bytes)?,
                }
                Ok(bytes)
            }
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;
    use crate::common::types::CallConv;
    use crate::ir::inst::BinaryOp;
    use crate::ir::{Builder, Linkage};

    fn demo_module(ctx: &Context) -> Module {
        let mut module = Module::new("demo");
        let i64t = ctx.types.int(64);
        let fty = ctx.types.function(i64t, vec![i64t], false, CallConv::C);
        let func = module.add_function(ctx, "double_it", fty, Linkage::Exported);
        let block = module.add_block(func);
        let param = module.func(func).params[0];

        let mut b = Builder::new(ctx, &mut module);
        b.position_at_end(block);
        let sum = b.binary(BinaryOp::Add, param, param).unwrap();
        b.ret(Some(sum)).unwrap();
        module.set_entry(func);
        module
    }

    #[test]
    fn test_emit_assembly() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let module = demo_module(&ctx);
        let bytes = module
            .emit(&ctx, &EmitOptions::default())
            .expect("assembly emission succeeds");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("double_it:"));
    }

    #[test]
    fn test_emit_elf_object() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let module = demo_module(&ctx);
        let bytes = module
            .emit(
                &ctx,
                &EmitOptions {
                    format: OutputFormat::Object,
                    ..Default::default()
                },
            )
            .expect("object emission succeeds");
        assert_eq!(&bytes[0..4], &[0x7F, b'E', b'L', b'F']);
    }

    #[test]
    fn test_emit_coff_object_on_windows() {
        let ctx = Context::new(Target::X86_64_WINDOWS);
        let module = demo_module(&ctx);
        let bytes = module
            .emit(
                &ctx,
                &EmitOptions {
                    format: OutputFormat::Object,
                    ..Default::default()
                },
            )
            .expect("object emission succeeds");
        let machine = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(machine, 0x8664);
    }

    #[test]
    fn test_emit_llvm_text() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let module = demo_module(&ctx);
        let bytes = module
            .emit(
                &ctx,
                &EmitOptions {
                    format: OutputFormat::LlvmIr,
                    ..Default::default()
                },
            )
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("define i64 @double_it"));
    }

    #[test]
    fn test_emit_aborts_on_existing_errors() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let module = demo_module(&ctx);
        ctx.diags
            .error(crate::common::diag::Loc::none(), "frontend said no");
        assert!(matches!(
            module.emit(&ctx, &EmitOptions::default()),
            Err(EmitError::Diagnostics)
        ));
    }
}
