//! ELF Relocatable Object Emission
//!
//! Serialises a [`GenericObject`] as an ELF64 relocatable (`ET_REL`)
//! for Linux x86-64: progbits sections for `.text`/`.data`/`.rodata`,
//! nobits for `.bss`, a symbol table with local symbols before global
//! ones, and one `.rela` section per section that carries relocations
//! (`R_X86_64_PC32`).

use crate::backend::object::{GenericObject, RelocKind};
use std::io::{self, Write};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

/// Relocatable file
const ET_REL: u16 = 1;
const EM_X86_64: u16 = 62;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

const SHN_UNDEF: u16 = 0;

const R_X86_64_PC32: u32 = 2;

const EHDR_SIZE: u64 = 64;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;

/// Deduplicating string table builder
#[derive(Default)]
struct StrTab {
    data: Vec<u8>,
}

impl StrTab {
    fn new() -> StrTab {
        StrTab { data: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        offset
    }
}

struct SectionHeader {
    name: u32,
    kind: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

struct SymbolEntry {
    name: u32,
    info: u8,
    shndx: u16,
    value: u64,
}

impl GenericObject {
    /// Write this object as an ELF64 relocatable file
    pub fn as_elf<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut shstrtab = StrTab::new();
        let mut strtab = StrTab::new();
        let mut headers: Vec<SectionHeader> = Vec::new();
        let mut payloads: Vec<Vec<u8>> = Vec::new();

        // Null section first.
        headers.push(SectionHeader {
            name: 0,
            kind: 0,
            flags: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            align: 0,
            entsize: 0,
        });
        payloads.push(Vec::new());

        // One section per generic-object section, remembering where
        // each landed so symbols and relocations can refer to it.
        let mut section_index: Vec<(String, u16)> = Vec::new();
        for section in &self.sections {
            let index = headers.len() as u16;
            section_index.push((section.name.clone(), index));

            let (kind, flags, align) = match section.name.as_str() {
                ".text" => (SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, 16),
                ".rodata" => (SHT_PROGBITS, SHF_ALLOC, 8),
                ".bss" => (SHT_NOBITS, SHF_ALLOC | SHF_WRITE, 8),
                _ => (SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, 8),
            };
            let size = if kind == SHT_NOBITS {
                section.reserve
            } else {
                section.data.len() as u64 + section.reserve
            };
            headers.push(SectionHeader {
                name: shstrtab.add(&section.name),
                kind,
                flags,
                offset: 0,
                size,
                link: 0,
                info: 0,
                align,
                entsize: 0,
            });
            let mut data = section.data.clone();
            if kind != SHT_NOBITS {
                data.extend(std::iter::repeat_n(0u8, section.reserve as usize));
            } else {
                data.clear();
            }
            payloads.push(data);
        }

        // Symbol table: null, then locals, then globals and undefined.
        let mut symbols: Vec<SymbolEntry> = vec![SymbolEntry {
            name: 0,
            info: 0,
            shndx: SHN_UNDEF,
            value: 0,
        }];
        let mut symbol_index: Vec<(String, u32)> = Vec::new();

        let mut push_symbols = |globals: bool,
                                symbols: &mut Vec<SymbolEntry>,
                                symbol_index: &mut Vec<(String, u32)>,
                                strtab: &mut StrTab| {
            for (section, (_, shndx)) in self.sections.iter().zip(section_index.iter()) {
                for sym in &section.symbols {
                    if sym.global != globals {
                        continue;
                    }
                    let kind = if sym.is_function { STT_FUNC } else { STT_OBJECT };
                    let bind = if sym.global { STB_GLOBAL } else { STB_LOCAL };
                    symbol_index.push((sym.name.clone(), symbols.len() as u32));
                    symbols.push(SymbolEntry {
                        name: strtab.add(&sym.name),
                        info: (bind << 4) | kind,
                        shndx: *shndx,
                        value: sym.offset,
                    });
                }
            }
        };

        push_symbols(false, &mut symbols, &mut symbol_index, &mut strtab);
        let first_global = symbols.len() as u32;
        push_symbols(true, &mut symbols, &mut symbol_index, &mut strtab);
        for undefined in &self.undefined {
            symbol_index.push((undefined.clone(), symbols.len() as u32));
            symbols.push(SymbolEntry {
                name: strtab.add(undefined),
                info: STB_GLOBAL << 4,
                shndx: SHN_UNDEF,
                value: 0,
            });
        }

        // Relocation sections.
        let symtab_index = (headers.len() + self.sections.iter().filter(|s| !s.relocations.is_empty()).count()) as u32;
        for (section, (_, shndx)) in self.sections.iter().zip(section_index.iter()) {
            if section.relocations.is_empty() {
                continue;
            }
            let mut data = Vec::new();
            for reloc in &section.relocations {
                let sym = symbol_index
                    .iter()
                    .find(|(name, _)| *name == reloc.symbol)
                    .map(|(_, index)| *index)
                    .unwrap_or(0);
                let kind = match reloc.kind {
                    RelocKind::Pc32 => R_X86_64_PC32,
                };
                data.extend_from_slice(&reloc.offset.to_le_bytes());
                data.extend_from_slice(&(((sym as u64) << 32) | kind as u64).to_le_bytes());
                data.extend_from_slice(&reloc.addend.to_le_bytes());
            }
            headers.push(SectionHeader {
                name: shstrtab.add(&format!(".rela{}", section.name)),
                kind: SHT_RELA,
                flags: 0,
                offset: 0,
                size: data.len() as u64,
                link: symtab_index,
                info: *shndx as u32,
                align: 8,
                entsize: RELA_SIZE,
            });
            payloads.push(data);
        }

        // .symtab, .strtab, .shstrtab.
        let strtab_index = (headers.len() + 1) as u32;
        let mut symtab_data = Vec::new();
        for sym in &symbols {
            symtab_data.extend_from_slice(&sym.name.to_le_bytes());
            symtab_data.push(sym.info);
            symtab_data.push(0); // st_other
            symtab_data.extend_from_slice(&sym.shndx.to_le_bytes());
            symtab_data.extend_from_slice(&sym.value.to_le_bytes());
            symtab_data.extend_from_slice(&0u64.to_le_bytes()); // st_size
        }
        headers.push(SectionHeader {
            name: shstrtab.add(".symtab"),
            kind: SHT_SYMTAB,
            flags: 0,
            offset: 0,
            size: symtab_data.len() as u64,
            link: strtab_index,
            info: first_global,
            align: 8,
            entsize: SYM_SIZE,
        });
        payloads.push(symtab_data);

        headers.push(SectionHeader {
            name: shstrtab.add(".strtab"),
            kind: SHT_STRTAB,
            flags: 0,
            offset: 0,
            size: strtab.data.len() as u64,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        });
        payloads.push(std::mem::take(&mut strtab.data));

        let shstrndx = headers.len() as u16;
        let shstrtab_name = shstrtab.add(".shstrtab");
        let shstrtab_data = std::mem::take(&mut shstrtab.data);
        headers.push(SectionHeader {
            name: shstrtab_name,
            kind: SHT_STRTAB,
            flags: 0,
            offset: 0,
            size: shstrtab_data.len() as u64,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
        });
        payloads.push(shstrtab_data);

        // Lay the payloads out after the header, 8-byte aligned.
        let mut cursor = EHDR_SIZE;
        for (header, payload) in headers.iter_mut().zip(payloads.iter()) {
            cursor = cursor.next_multiple_of(8);
            header.offset = cursor;
            if header.kind != SHT_NOBITS {
                cursor += payload.len() as u64;
            }
        }
        let shoff = cursor.next_multiple_of(8);

        // ELF header.
        out.write_all(&ELF_MAGIC)?;
        out.write_all(&[ELFCLASS64, ELFDATA2LSB, EV_CURRENT, 0])?;
        out.write_all(&[0; 8])?;
        out.write_all(&ET_REL.to_le_bytes())?;
        out.write_all(&EM_X86_64.to_le_bytes())?;
        out.write_all(&1u32.to_le_bytes())?;
        out.write_all(&0u64.to_le_bytes())?; // e_entry
        out.write_all(&0u64.to_le_bytes())?; // e_phoff
        out.write_all(&shoff.to_le_bytes())?;
        out.write_all(&0u32.to_le_bytes())?; // e_flags
        out.write_all(&(EHDR_SIZE as u16).to_le_bytes())?;
        out.write_all(&0u16.to_le_bytes())?; // e_phentsize
        out.write_all(&0u16.to_le_bytes())?; // e_phnum
        out.write_all(&(SHDR_SIZE as u16).to_le_bytes())?;
        out.write_all(&(headers.len() as u16).to_le_bytes())?;
        out.write_all(&shstrndx.to_le_bytes())?;

        // Section payloads.
        let mut written = EHDR_SIZE;
        for (header, payload) in headers.iter().zip(payloads.iter()) {
            let padded = header.offset;
            while written < padded {
                out.write_all(&[0])?;
                written += 1;
            }
            if header.kind != SHT_NOBITS {
                out.write_all(payload)?;
                written += payload.len() as u64;
            }
        }
        while written < shoff {
            out.write_all(&[0])?;
            written += 1;
        }

        // Section header table.
        for header in &headers {
            out.write_all(&header.name.to_le_bytes())?;
            out.write_all(&header.kind.to_le_bytes())?;
            out.write_all(&header.flags.to_le_bytes())?;
            out.write_all(&0u64.to_le_bytes())?; // sh_addr
            out.write_all(&header.offset.to_le_bytes())?;
            out.write_all(&header.size.to_le_bytes())?;
            out.write_all(&header.link.to_le_bytes())?;
            out.write_all(&header.info.to_le_bytes())?;
            out.write_all(&header.align.to_le_bytes())?;
            out.write_all(&header.entsize.to_le_bytes())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::object::{Relocation, Section, Symbol};

    fn sample_object() -> GenericObject {
        let mut obj = GenericObject::default();
        let mut text = Section::new(".text");
        text.data = vec![0x55, 0x48, 0x89, 0xE5, 0xC9, 0xC3];
        text.symbols.push(Symbol {
            name: "main".to_string(),
            offset: 0,
            global: true,
            is_function: true,
        });
        text.relocations.push(Relocation {
            offset: 2,
            symbol: "memcpy".to_string(),
            kind: RelocKind::Pc32,
            addend: -4,
        });
        obj.sections.push(text);
        obj.undefined.push("memcpy".to_string());
        obj
    }

    #[test]
    fn test_elf_header_shape() {
        let obj = sample_object();
        let mut bytes = Vec::new();
        obj.as_elf(&mut bytes).unwrap();

        assert_eq!(&bytes[0..4], &ELF_MAGIC);
        assert_eq!(bytes[4], ELFCLASS64);
        assert_eq!(bytes[5], ELFDATA2LSB);
        let e_type = u16::from_le_bytes([bytes[16], bytes[17]]);
        assert_eq!(e_type, ET_REL);
        let e_machine = u16::from_le_bytes([bytes[18], bytes[19]]);
        assert_eq!(e_machine, EM_X86_64);
        // A relocatable object has no program headers.
        let e_phnum = u16::from_le_bytes([bytes[56], bytes[57]]);
        assert_eq!(e_phnum, 0);
    }

    #[test]
    fn test_section_count() {
        let obj = sample_object();
        let mut bytes = Vec::new();
        obj.as_elf(&mut bytes).unwrap();

        // null + .text + .rela.text + .symtab + .strtab + .shstrtab
        let e_shnum = u16::from_le_bytes([bytes[60], bytes[61]]);
        assert_eq!(e_shnum, 6);
    }

    #[test]
    fn test_text_bytes_present() {
        let obj = sample_object();
        let mut bytes = Vec::new();
        obj.as_elf(&mut bytes).unwrap();
        let code = &obj.find_section(".text").unwrap().data;
        assert!(
            bytes
                .windows(code.len())
                .any(|w| w == code.as_slice())
        );
    }

    #[test]
    fn test_strtab_contains_names() {
        let obj = sample_object();
        let mut bytes = Vec::new();
        obj.as_elf(&mut bytes).unwrap();
        let needle = b"memcpy\0";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
        let needle = b".rela.text\0";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }
}
