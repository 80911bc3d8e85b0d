use clap::Parser;
use lcc::cli::{self, Options};
use lcc::common::context::Context;
use lcc::common::target::Target;
use lcc::frontend::FrontendRegistry;
use lcc::pipeline::{self, CompileOutput, CompilerError};
use std::io::Write;
use std::process::ExitCode;

/// Debug exit code for --stopat-mir
const EXIT_STOPPED: u8 = 2;

fn main() -> ExitCode {
    let options = Options::parse();

    if options.aluminium {
        cli::aluminium_handler();
    }

    if options.verbose {
        println!("Input files:");
        for file in &options.files {
            println!("- {}", file.display());
        }
    }

    if options.files.len() != 1 {
        eprintln!("error: expected exactly one input file");
        return ExitCode::FAILURE;
    }
    let input = &options.files[0];

    let compile_options = match options.compile_options() {
        Ok(compile_options) => compile_options,
        Err(message) => {
            eprintln!("error: {}", message);
            return ExitCode::FAILURE;
        }
    };

    // Objects cannot go to stdout.
    if options.output.is_none() && !options.emit.is_textual() {
        eprintln!("error: -o is required when emitting an object file");
        return ExitCode::FAILURE;
    }

    let ctx = Context::new(Target::host());

    // Frontends are external collaborators; none ship with the core.
    let registry = FrontendRegistry::new();

    let result = pipeline::compile_path(&ctx, &registry, input, &compile_options);
    ctx.print_diagnostics();

    match result {
        Ok(CompileOutput::Artifact(bytes)) => match &options.output {
            Some(path) => {
                if let Err(e) = std::fs::write(path, &bytes) {
                    eprintln!("error: cannot write {}: {}", path.display(), e);
                    return ExitCode::FAILURE;
                }
                ExitCode::SUCCESS
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                if stdout.write_all(&bytes).is_err() {
                    return ExitCode::FAILURE;
                }
                ExitCode::SUCCESS
            }
        },
        Ok(CompileOutput::Stopped) => {
            if compile_options.stopat_mir {
                ExitCode::from(EXIT_STOPPED)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(CompilerError::Diagnostics) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
