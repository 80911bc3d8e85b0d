//! Frontend Registry
//!
//! The core does not parse anything itself: surface languages plug in
//! through the [`Frontend`] trait and deliver fully-constructed IR
//! modules satisfying the invariants the verifier checks. The registry
//! picks a frontend by the detected source language.

use crate::common::context::Context;
use crate::common::diag::FileId;
use crate::ir::Module;
use std::path::Path;

/// Surface languages the driver recognises
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceLanguage {
    Intercept,
    Laye,
    C,
}

impl SourceLanguage {
    /// Detect the language from a file extension
    pub fn from_path(path: &Path) -> Option<SourceLanguage> {
        match path.extension()?.to_str()? {
            "int" => Some(SourceLanguage::Intercept),
            "laye" => Some(SourceLanguage::Laye),
            "c" => Some(SourceLanguage::C),
            _ => None,
        }
    }

    /// Parse an explicit `-x LANG` override
    pub fn from_name(name: &str) -> Option<SourceLanguage> {
        match name {
            "intercept" | "int" => Some(SourceLanguage::Intercept),
            "laye" => Some(SourceLanguage::Laye),
            "c" => Some(SourceLanguage::C),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SourceLanguage::Intercept => "intercept",
            SourceLanguage::Laye => "laye",
            SourceLanguage::C => "c",
        }
    }
}

/// Flags a frontend must honour
#[derive(Clone, Copy, Debug, Default)]
pub struct FrontendOptions {
    /// Stop after parsing; no semantic analysis, no IR
    pub syntax_only: bool,
    /// Print the AST
    pub print_ast: bool,
}

/// A surface-language implementation
pub trait Frontend {
    fn language(&self) -> SourceLanguage;

    /// Parse and analyse `file`, delivering an IR module. `None` means
    /// compilation should stop without output: either `syntax_only` was
    /// requested or diagnostics were reported into the context.
    fn parse(&self, ctx: &Context, file: FileId, options: &FrontendOptions) -> Option<Module>;
}

/// Registered frontends, looked up by language
#[derive(Default)]
pub struct FrontendRegistry {
    frontends: Vec<Box<dyn Frontend>>,
}

impl FrontendRegistry {
    pub fn new() -> FrontendRegistry {
        FrontendRegistry::default()
    }

    pub fn register(&mut self, frontend: Box<dyn Frontend>) {
        self.frontends.push(frontend);
    }

    pub fn find(&self, language: SourceLanguage) -> Option<&dyn Frontend> {
        self.frontends
            .iter()
            .find(|f| f.language() == language)
            .map(|f| f.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::target::Target;

    #[test]
    fn test_language_detection() {
        assert_eq!(
            SourceLanguage::from_path(Path::new("main.int")),
            Some(SourceLanguage::Intercept)
        );
        assert_eq!(
            SourceLanguage::from_path(Path::new("lib.laye")),
            Some(SourceLanguage::Laye)
        );
        assert_eq!(
            SourceLanguage::from_path(Path::new("foo.c")),
            Some(SourceLanguage::C)
        );
        assert_eq!(SourceLanguage::from_path(Path::new("foo.rs")), None);
        assert_eq!(SourceLanguage::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_language_override() {
        assert_eq!(
            SourceLanguage::from_name("laye"),
            Some(SourceLanguage::Laye)
        );
        assert_eq!(
            SourceLanguage::from_name("int"),
            Some(SourceLanguage::Intercept)
        );
        assert_eq!(SourceLanguage::from_name("fortran"), None);
    }

    /// A frontend that ignores its input and produces an empty module.
    struct NullFrontend;

    impl Frontend for NullFrontend {
        fn language(&self) -> SourceLanguage {
            SourceLanguage::Intercept
        }

        fn parse(
            &self,
            _ctx: &Context,
            _file: FileId,
            options: &FrontendOptions,
        ) -> Option<Module> {
            if options.syntax_only {
                return None;
            }
            Some(Module::new("null"))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = FrontendRegistry::new();
        assert!(registry.find(SourceLanguage::Intercept).is_none());
        registry.register(Box::new(NullFrontend));
        assert!(registry.find(SourceLanguage::Intercept).is_some());
        assert!(registry.find(SourceLanguage::C).is_none());
    }

    #[test]
    fn test_syntax_only_short_circuits() {
        let ctx = Context::new(Target::X86_64_LINUX);
        let file = ctx.create_file("t.int", "");
        let registry = {
            let mut r = FrontendRegistry::new();
            r.register(Box::new(NullFrontend));
            r
        };
        let frontend = registry.find(SourceLanguage::Intercept).unwrap();
        let options = FrontendOptions {
            syntax_only: true,
            ..Default::default()
        };
        assert!(frontend.parse(&ctx, file, &options).is_none());
    }
}
