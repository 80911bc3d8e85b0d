//! Compiler Pipeline
//!
//! The end-to-end driver from a source file to the requested artifact.
//!
//! ```text
//! Source file
//!     │ frontend (registered per language)
//!     ▼
//! IR Module
//!     │ optimise (-O)
//!     ▼
//! IR Module
//!     │ lower (ABI shapes) + block cleanup
//!     ▼
//! Backend (MIR → ISel → RA → emit)
//!     ▼
//! Assembly text │ ELF/COFF object │ IR dumps
//! ```
//!
//! The context's diagnostic sink is checked at every stage boundary;
//! the first boundary with errors stops the pipeline and nothing is
//! written.

use crate::backend::{EmitError, EmitOptions, OutputFormat};
use crate::common::context::Context;
use crate::frontend::{FrontendOptions, FrontendRegistry, SourceLanguage};
use crate::ir::Module;
use crate::optimise::optimise_blocks;
use std::path::Path;
use thiserror::Error;

/// Pipeline failure surfaced to the driver
#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("unrecognised input file type: {0}")]
    UnknownLanguage(String),
    #[error("no frontend registered for {0}")]
    NoFrontend(&'static str),
    #[error("compilation failed: errors were reported")]
    Diagnostics,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything the driver decides before compilation starts
#[derive(Clone, Copy, Debug)]
pub struct CompileOptions {
    /// Run the optimiser (`-O`)
    pub optimise: bool,
    pub format: OutputFormat,
    /// Print the IR after the frontend and after each transformation
    pub print_ir: bool,
    pub print_mir: bool,
    pub stopat_mir: bool,
    pub verbose: bool,
    pub frontend: FrontendOptions,
    /// Language override (`-x LANG`); detected from the extension
    /// otherwise
    pub language: Option<SourceLanguage>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            optimise: false,
            format: OutputFormat::Assembly,
            print_ir: false,
            print_mir: false,
            stopat_mir: false,
            verbose: false,
            frontend: FrontendOptions::default(),
            language: None,
        }
    }
}

/// Outcome of a compilation
pub enum CompileOutput {
    /// The produced artifact
    Artifact(Vec<u8>),
    /// The pipeline stopped early on purpose (`--syntax-only`,
    /// `--stopat-mir`)
    Stopped,
}

/// Compile one source file through a registered frontend
pub fn compile_path(
    ctx: &Context,
    registry: &FrontendRegistry,
    path: &Path,
    options: &CompileOptions,
) -> Result<CompileOutput, CompilerError> {
    let language = options
        .language
        .or_else(|| SourceLanguage::from_path(path))
        .ok_or_else(|| CompilerError::UnknownLanguage(path.display().to_string()))?;

    let frontend = registry
        .find(language)
        .ok_or(CompilerError::NoFrontend(language.name()))?;

    let contents = std::fs::read_to_string(path)?;
    let file = ctx.create_file(path.display().to_string(), contents);

    let Some(mut module) = frontend.parse(ctx, file, &options.frontend) else {
        return if ctx.has_error() {
            Err(CompilerError::Diagnostics)
        } else {
            Ok(CompileOutput::Stopped)
        };
    };
    if ctx.has_error() {
        return Err(CompilerError::Diagnostics);
    }

    compile_module(ctx, &mut module, options)
}

/// Drive an already-constructed module through the middle and back end.
/// This is the boundary frontends integrate against.
pub fn compile_module(
    ctx: &Context,
    module: &mut Module,
    options: &CompileOptions,
) -> Result<CompileOutput, CompilerError> {
    if options.print_ir {
        print!("{}", module.print_ir(ctx));
    }

    if options.optimise {
        module.optimise(ctx);
        if ctx.has_error() {
            return Err(CompilerError::Diagnostics);
        }
        if options.print_ir {
            println!("\nAfter optimisation");
            print!("{}", module.print_ir(ctx));
        }
    }

    module.lower(ctx);
    if ctx.has_error() {
        return Err(CompilerError::Diagnostics);
    }
    // The backend prefers clean block layout going into MIR.
    optimise_blocks(ctx, module);
    if options.print_ir {
        println!("\nAfter lowering");
        print!("{}", module.print_ir(ctx));
    }

    let emit = EmitOptions {
        format: options.format,
        print_mir: options.print_mir,
        stopat_mir: options.stopat_mir,
        verbose: options.verbose,
    };
    match module.emit(ctx, &emit) {
        Ok(bytes) => Ok(CompileOutput::Artifact(bytes)),
        Err(EmitError::StoppedAtMir) => Ok(CompileOutput::Stopped),
        Err(EmitError::Diagnostics) => Err(CompilerError::Diagnostics),
        Err(EmitError::Io(e)) => Err(CompilerError::Io(e)),
    }
}
