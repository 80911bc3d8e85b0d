//! Command-Line Interface
//!
//! `lcc [options] <file>`. The driver accepts exactly one input file,
//! picks the frontend by extension (or `-x`), and writes the requested
//! artifact to `-o` (stdout for textual outputs when `-o` is absent).

use crate::backend::OutputFormat;
use crate::frontend::{FrontendOptions, SourceLanguage};
use crate::pipeline::CompileOptions;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EmitKind {
    /// GNU-AT&T assembly text
    Asm,
    /// Relocatable object
    Obj,
    /// LLVM-compatible textual IR
    Llvm,
    /// Native IR dump
    Ir,
}

impl EmitKind {
    pub fn format(self) -> OutputFormat {
        match self {
            EmitKind::Asm => OutputFormat::Assembly,
            EmitKind::Obj => OutputFormat::Object,
            EmitKind::Llvm => OutputFormat::LlvmIr,
            EmitKind::Ir => OutputFormat::Ir,
        }
    }

    pub fn is_textual(self) -> bool {
        self != EmitKind::Obj
    }
}

#[derive(Debug, Parser)]
#[command(name = "lcc", about = "LCC compiler driver")]
pub struct Options {
    /// Path to the file that should be compiled
    pub files: Vec<PathBuf>,

    /// Output file path (stdout for textual outputs when omitted)
    #[arg(short = 'o')]
    pub output: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Print the AST and exit without generating code
    #[arg(long)]
    pub ast: bool,

    /// Do not perform semantic analysis
    #[arg(long)]
    pub syntax_only: bool,

    /// Override source-language detection
    #[arg(short = 'x', value_name = "LANG")]
    pub language: Option<String>,

    /// Run the optimiser
    #[arg(short = 'O')]
    pub optimise: bool,

    /// What to emit
    #[arg(long, value_enum, default_value = "asm")]
    pub emit: EmitKind,

    /// Print the IR after each pipeline stage
    #[arg(long)]
    pub print_ir: bool,

    /// Print the machine IR before ISel, after ISel and after RA
    #[arg(long)]
    pub print_mir: bool,

    /// Stop after register allocation
    #[arg(long)]
    pub stopat_mir: bool,

    /// That special something to spice up your compilation
    #[arg(long)]
    pub aluminium: bool,
}

impl Options {
    /// Resolve the `-x` override to a language, if given
    pub fn language_override(&self) -> Result<Option<SourceLanguage>, String> {
        match &self.language {
            None => Ok(None),
            Some(name) => SourceLanguage::from_name(name)
                .map(Some)
                .ok_or_else(|| format!("unknown source language `{}`", name)),
        }
    }

    pub fn compile_options(&self) -> Result<CompileOptions, String> {
        Ok(CompileOptions {
            optimise: self.optimise,
            format: self.emit.format(),
            print_ir: self.print_ir,
            print_mir: self.print_mir,
            stopat_mir: self.stopat_mir,
            verbose: self.verbose,
            frontend: FrontendOptions {
                syntax_only: self.syntax_only,
                print_ast: self.ast,
            },
            language: self.language_override()?,
        })
    }
}

/// The easter egg. Important.
pub fn aluminium_handler() {
    let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
    let opener = if cfg!(windows) {
        "start"
    } else if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    let _ = std::process::Command::new(opener).arg(url).status();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::parse_from(["lcc", "main.int"]);
        assert_eq!(options.files, vec![PathBuf::from("main.int")]);
        assert_eq!(options.emit, EmitKind::Asm);
        assert!(!options.optimise);
        assert!(options.output.is_none());
    }

    #[test]
    fn test_flags_parse() {
        let options = Options::parse_from([
            "lcc",
            "-O",
            "-o",
            "out.o",
            "--emit",
            "obj",
            "-x",
            "laye",
            "main.txt",
        ]);
        assert!(options.optimise);
        assert_eq!(options.output, Some(PathBuf::from("out.o")));
        assert_eq!(options.emit, EmitKind::Obj);
        assert_eq!(
            options.language_override().unwrap(),
            Some(SourceLanguage::Laye)
        );
    }

    #[test]
    fn test_bad_language_override() {
        let options = Options::parse_from(["lcc", "-x", "cobol", "main.c"]);
        assert!(options.language_override().is_err());
    }

    #[test]
    fn test_textual_formats() {
        assert!(EmitKind::Asm.is_textual());
        assert!(EmitKind::Llvm.is_textual());
        assert!(!EmitKind::Obj.is_textual());
    }
}
