//! Generic Object
//!
//! Container-format-neutral object representation: a list of sections,
//! each carrying a byte buffer, the symbols defined inside it and the
//! relocations that patch it. The ELF and COFF writers serialise this
//! structure; the encoder fills it in.

pub mod coff;
pub mod elf;

use std::fmt::Write;

/// Relocation kinds the backend emits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit PC-relative (R_X86_64_PC32 / IMAGE_REL_AMD64_REL32)
    Pc32,
}

/// A symbol defined in a section
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    /// Offset into the owning section
    pub offset: u64,
    /// Visible to the linker (vs. local)
    pub global: bool,
    pub is_function: bool,
}

/// A patch site inside a section
#[derive(Clone, Debug)]
pub struct Relocation {
    pub offset: u64,
    /// Target symbol name (defined here or external)
    pub symbol: String,
    pub kind: RelocKind,
    pub addend: i64,
}

/// One object section
#[derive(Clone, Debug, Default)]
pub struct Section {
    pub name: String,
    pub data: Vec<u8>,
    /// Size to reserve for uninitialised sections (.bss)
    pub reserve: u64,
    pub symbols: Vec<Symbol>,
    pub relocations: Vec<Relocation>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Section {
        Section {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A relocatable object, independent of container format
#[derive(Clone, Debug, Default)]
pub struct GenericObject {
    pub sections: Vec<Section>,
    /// Symbols referenced but defined nowhere in this object
    pub undefined: Vec<String>,
}

impl GenericObject {
    /// The section with the given name, created on first use
    pub fn section(&mut self, name: &str) -> &mut Section {
        if let Some(pos) = self.sections.iter().position(|s| s.name == name) {
            return &mut self.sections[pos];
        }
        self.sections.push(Section::new(name));
        self.sections.last_mut().unwrap()
    }

    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Record an external reference
    pub fn reference(&mut self, symbol: &str) {
        let defined = self
            .sections
            .iter()
            .any(|s| s.symbols.iter().any(|sym| sym.name == symbol));
        if !defined && !self.undefined.iter().any(|u| u == symbol) {
            self.undefined.push(symbol.to_string());
        }
    }

    /// Drop undefined entries that later turned out to be defined
    pub fn resolve_undefined(&mut self) {
        let defined: Vec<String> = self
            .sections
            .iter()
            .flat_map(|s| s.symbols.iter().map(|sym| sym.name.clone()))
            .collect();
        self.undefined.retain(|u| !defined.contains(u));
    }

    /// Human-readable summary of sections, symbols and relocations
    pub fn print(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            let _ = writeln!(
                out,
                "section {} ({} byte(s), {} reserved)",
                section.name,
                section.data.len(),
                section.reserve
            );
            for symbol in &section.symbols {
                let _ = writeln!(
                    out,
                    "  symbol {} @ {:#x} [{}{}]",
                    symbol.name,
                    symbol.offset,
                    if symbol.global { "global" } else { "local" },
                    if symbol.is_function { ", function" } else { "" }
                );
            }
            for reloc in &section.relocations {
                let _ = writeln!(
                    out,
                    "  reloc {:?} @ {:#x} -> {} {:+}",
                    reloc.kind, reloc.offset, reloc.symbol, reloc.addend
                );
            }
        }
        for undefined in &self.undefined {
            let _ = writeln!(out, "undefined {}", undefined);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_created_once() {
        let mut obj = GenericObject::default();
        obj.section(".text").data.push(0xC3);
        obj.section(".text").data.push(0x90);
        assert_eq!(obj.sections.len(), 1);
        assert_eq!(obj.find_section(".text").unwrap().data, vec![0xC3, 0x90]);
    }

    #[test]
    fn test_undefined_tracking() {
        let mut obj = GenericObject::default();
        obj.section(".text").symbols.push(Symbol {
            name: "main".to_string(),
            offset: 0,
            global: true,
            is_function: true,
        });
        obj.reference("memcpy");
        obj.reference("main");
        obj.reference("memcpy");
        assert_eq!(obj.undefined, vec!["memcpy".to_string()]);
    }

    #[test]
    fn test_print_summary() {
        let mut obj = GenericObject::default();
        obj.section(".text").symbols.push(Symbol {
            name: "f".to_string(),
            offset: 8,
            global: false,
            is_function: true,
        });
        let summary = obj.print();
        assert!(summary.contains("section .text"));
        assert!(summary.contains("symbol f @ 0x8"));
    }
}
