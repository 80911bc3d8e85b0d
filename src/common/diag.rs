//! Diagnostics
//!
//! All user-facing errors flow through the [`DiagEngine`] sink owned by
//! the [`Context`](crate::common::context::Context). Passes report into
//! the sink and keep going where they can; the pipeline checks
//! `has_error()` at each stage boundary and stops if anything was
//! reported. Internal compiler errors bypass the sink entirely and
//! abort.
//!
//! Rendering uses ariadne when a diagnostic carries a source span and a
//! plain severity-prefixed line otherwise.

use ariadne::{Color, Label, Report, ReportKind, Source};
use std::cell::{Cell, RefCell};
use std::fmt;

/// Identifies a file registered in the context's file table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

/// A half-open byte range into a registered source file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Loc {
    pub file: FileId,
    pub start: u32,
    pub end: u32,
}

impl Default for FileId {
    fn default() -> Self {
        FileId(u32::MAX)
    }
}

impl Loc {
    /// A location pointing nowhere, for values without a source position
    pub fn none() -> Loc {
        Loc::default()
    }

    pub fn is_none(&self) -> bool {
        self.file == FileId::default()
    }
}

/// Diagnostic severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Note => write!(f, "note"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A single reported diagnostic
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub loc: Loc,
}

/// Accumulating diagnostic sink
///
/// Interior mutability lets every pipeline stage report through a shared
/// `&Context` without threading `&mut` everywhere.
#[derive(Debug, Default)]
pub struct DiagEngine {
    diags: RefCell<Vec<Diagnostic>>,
    error: Cell<bool>,
}

impl DiagEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, severity: Severity, loc: Loc, message: impl Into<String>) {
        if severity == Severity::Error {
            self.error.set(true);
        }
        self.diags.borrow_mut().push(Diagnostic {
            severity,
            message: message.into(),
            loc,
        });
    }

    pub fn note(&self, loc: Loc, message: impl Into<String>) {
        self.report(Severity::Note, loc, message);
    }

    pub fn warn(&self, loc: Loc, message: impl Into<String>) {
        self.report(Severity::Warning, loc, message);
    }

    pub fn error(&self, loc: Loc, message: impl Into<String>) {
        self.report(Severity::Error, loc, message);
    }

    /// Whether any error-severity diagnostic has been reported
    pub fn has_error(&self) -> bool {
        self.error.get()
    }

    pub fn len(&self) -> usize {
        self.diags.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.diags.borrow().is_empty()
    }

    /// Take all accumulated diagnostics, leaving the sink empty
    /// (the error flag is retained)
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diags.borrow_mut())
    }

    /// Render every accumulated diagnostic to stderr
    ///
    /// `lookup` maps a [`FileId`] to the file's name and contents so that
    /// located diagnostics can be rendered with source highlighting.
    pub fn print_all<'a>(&self, lookup: impl Fn(FileId) -> Option<(&'a str, &'a str)>) {
        for diag in self.diags.borrow().iter() {
            print_diagnostic(diag, &lookup);
        }
    }
}

fn print_diagnostic<'a>(diag: &Diagnostic, lookup: &impl Fn(FileId) -> Option<(&'a str, &'a str)>) {
    if !diag.loc.is_none()
        && let Some((name, source)) = lookup(diag.loc.file)
    {
        let (kind, color) = match diag.severity {
            Severity::Note => (ReportKind::Advice, Color::Blue),
            Severity::Warning => (ReportKind::Warning, Color::Yellow),
            Severity::Error => (ReportKind::Error, Color::Red),
        };
        let span = diag.loc.start as usize..diag.loc.end as usize;
        Report::build(kind, span.clone())
            .with_message(&diag.message)
            .with_label(Label::new(span).with_color(color))
            .finish()
            .eprint(Source::from(source))
            .expect("Failed to print diagnostic");
        eprintln!("  --> {}", name);
    } else {
        eprintln!("{}: {}", diag.severity, diag.message);
    }
}

/// Abort compilation with an internal compiler error.
///
/// ICEs signal violated invariants, never user mistakes; they identify
/// the condition and kill the process.
#[macro_export]
macro_rules! ice {
    ($($arg:tt)*) => {{
        eprintln!("internal compiler error: {}", format_args!($($arg)*));
        std::process::abort();
    }};
}
