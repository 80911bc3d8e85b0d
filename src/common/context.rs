//! Compilation Context
//!
//! The [`Context`] carries the global state of one compilation: the
//! target descriptor, the source-file table, the diagnostic sink and the
//! interned type universe. It is passed explicitly through the pipeline;
//! nothing in the crate reaches for globals or thread-locals.

use crate::common::diag::{DiagEngine, FileId, Loc};
use crate::common::target::Target;
use crate::common::types::TypeStore;
use std::cell::RefCell;

/// A registered source file
#[derive(Clone, Debug)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

/// Global compilation state
#[derive(Debug)]
pub struct Context {
    target: Target,
    files: RefCell<Vec<SourceFile>>,
    pub diags: DiagEngine,
    pub types: TypeStore,
}

impl Context {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            files: RefCell::new(Vec::new()),
            diags: DiagEngine::new(),
            types: TypeStore::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Register a source file and get its id
    pub fn create_file(&self, name: impl Into<String>, contents: impl Into<String>) -> FileId {
        let mut files = self.files.borrow_mut();
        let id = FileId(files.len() as u32);
        files.push(SourceFile {
            name: name.into(),
            contents: contents.into(),
        });
        id
    }

    pub fn file_name(&self, id: FileId) -> Option<String> {
        self.files
            .borrow()
            .get(id.0 as usize)
            .map(|f| f.name.clone())
    }

    /// Whether any error diagnostic has been reported so far.
    /// The pipeline checks this at every stage boundary.
    pub fn has_error(&self) -> bool {
        self.diags.has_error()
    }

    /// Render all accumulated diagnostics to stderr
    pub fn print_diagnostics(&self) {
        let files = self.files.borrow();
        self.diags.print_all(|id: FileId| {
            files
                .get(id.0 as usize)
                .map(|f| (f.name.as_str(), f.contents.as_str()))
        });
    }

    /// Convenience for building a located span into a registered file
    pub fn loc(&self, file: FileId, start: u32, end: u32) -> Loc {
        Loc { file, start, end }
    }
}
