//! COFF Relocatable Object Emission
//!
//! Serialises a [`GenericObject`] as a COFF object for Windows x86-64:
//! `.text` and `.data` sections, IMAGE_REL_AMD64_REL32 relocations and
//! a symbol table with a trailing string table for long names.
//!
//! COFF stores relocation addends inline in the section bytes, so the
//! patch sites are rewritten from the generic addends before the data
//! is written out.

use crate::backend::object::{GenericObject, RelocKind};
use std::collections::HashMap;
use std::io::{self, Write};

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_REL_AMD64_REL32: u16 = 0x0004;

const IMAGE_SCN_CNT_CODE: u32 = 0x20;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x40;
const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x80;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;
const IMAGE_SYM_CLASS_STATIC: u8 = 3;
const IMAGE_SYM_TYPE_FUNCTION: u16 = 0x20;

const FILE_HEADER_SIZE: u32 = 20;
const SECTION_HEADER_SIZE: u32 = 40;
const RELOC_SIZE: u32 = 10;
const SYMBOL_SIZE: u32 = 18;

impl GenericObject {
    /// Write this object as a COFF relocatable file
    pub fn as_coff<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut strings: Vec<u8> = Vec::new();
        let mut name8 = |name: &str, strings: &mut Vec<u8>| -> [u8; 8] {
            let mut bytes = [0u8; 8];
            if name.len() <= 8 {
                bytes[..name.len()].copy_from_slice(name.as_bytes());
            } else {
                // Long names live in the string table; the header
                // carries "/offset".
                let offset = strings.len() as u32 + 4;
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);
                let tag = format!("/{}", offset);
                bytes[..tag.len()].copy_from_slice(tag.as_bytes());
            }
            bytes
        };

        // Symbol table: section symbols first, then the defined and
        // undefined symbols.
        let mut symbol_index: HashMap<String, u32> = HashMap::new();
        struct Sym {
            name: [u8; 8],
            value: u32,
            section: i16,
            kind: u16,
            class: u8,
        }
        let mut symbols: Vec<Sym> = Vec::new();

        for (number, section) in self.sections.iter().enumerate() {
            for symbol in &section.symbols {
                symbol_index.insert(symbol.name.clone(), symbols.len() as u32);
                symbols.push(Sym {
                    name: name8(&symbol.name, &mut strings),
                    value: symbol.offset as u32,
                    section: number as i16 + 1,
                    kind: if symbol.is_function {
                        IMAGE_SYM_TYPE_FUNCTION
                    } else {
                        0
                    },
                    class: if symbol.global {
                        IMAGE_SYM_CLASS_EXTERNAL
                    } else {
                        IMAGE_SYM_CLASS_STATIC
                    },
                });
            }
        }
        for undefined in &self.undefined {
            symbol_index.insert(undefined.clone(), symbols.len() as u32);
            symbols.push(Sym {
                name: name8(undefined, &mut strings),
                value: 0,
                section: 0,
                kind: IMAGE_SYM_TYPE_FUNCTION,
                class: IMAGE_SYM_CLASS_EXTERNAL,
            });
        }

        // Section payloads with relocation addends folded in.
        let mut payloads: Vec<Vec<u8>> = Vec::new();
        for section in &self.sections {
            let mut data = section.data.clone();
            data.extend(std::iter::repeat_n(0u8, section.reserve as usize));
            for reloc in &section.relocations {
                let at = reloc.offset as usize;
                if at + 4 <= data.len() {
                    let inline = (reloc.addend + 4) as i32;
                    data[at..at + 4].copy_from_slice(&inline.to_le_bytes());
                }
            }
            payloads.push(data);
        }

        // Lay everything out: headers, then data + relocations per
        // section, then the symbol table and string table.
        let mut cursor = FILE_HEADER_SIZE + SECTION_HEADER_SIZE * self.sections.len() as u32;
        struct Placement {
            data_offset: u32,
            reloc_offset: u32,
        }
        let mut placements: Vec<Placement> = Vec::new();
        for (section, payload) in self.sections.iter().zip(payloads.iter()) {
            let data_offset = if payload.is_empty() { 0 } else { cursor };
            cursor += payload.len() as u32;
            let reloc_offset = if section.relocations.is_empty() {
                0
            } else {
                cursor
            };
            cursor += RELOC_SIZE * section.relocations.len() as u32;
            placements.push(Placement {
                data_offset,
                reloc_offset,
            });
        }
        let symtab_offset = cursor;

        // IMAGE_FILE_HEADER.
        out.write_all(&IMAGE_FILE_MACHINE_AMD64.to_le_bytes())?;
        out.write_all(&(self.sections.len() as u16).to_le_bytes())?;
        out.write_all(&0u32.to_le_bytes())?; // timestamp
        out.write_all(&symtab_offset.to_le_bytes())?;
        out.write_all(&(symbols.len() as u32).to_le_bytes())?;
        out.write_all(&0u16.to_le_bytes())?; // optional header
        out.write_all(&0u16.to_le_bytes())?; // characteristics

        // Section headers.
        for ((section, payload), placement) in self
            .sections
            .iter()
            .zip(payloads.iter())
            .zip(placements.iter())
        {
            let characteristics = match section.name.as_str() {
                ".text" => IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
                ".bss" => {
                    IMAGE_SCN_CNT_UNINITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE
                }
                ".rodata" => IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
                _ => IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
            };
            out.write_all(&name8(&section.name, &mut strings))?;
            out.write_all(&0u32.to_le_bytes())?; // virtual size
            out.write_all(&0u32.to_le_bytes())?; // virtual address
            out.write_all(&(payload.len() as u32).to_le_bytes())?;
            out.write_all(&placement.data_offset.to_le_bytes())?;
            out.write_all(&placement.reloc_offset.to_le_bytes())?;
            out.write_all(&0u32.to_le_bytes())?; // line numbers
            out.write_all(&(section.relocations.len() as u16).to_le_bytes())?;
            out.write_all(&0u16.to_le_bytes())?;
            out.write_all(&characteristics.to_le_bytes())?;
        }

        // Data and relocations.
        for (section, payload) in self.sections.iter().zip(payloads.iter()) {
            out.write_all(payload)?;
            for reloc in &section.relocations {
                let kind = match reloc.kind {
                    RelocKind::Pc32 => IMAGE_REL_AMD64_REL32,
                };
                let index = symbol_index.get(&reloc.symbol).copied().unwrap_or(0);
                out.write_all(&(reloc.offset as u32).to_le_bytes())?;
                out.write_all(&index.to_le_bytes())?;
                out.write_all(&kind.to_le_bytes())?;
            }
        }

        // Symbol table.
        for sym in &symbols {
            out.write_all(&sym.name)?;
            out.write_all(&sym.value.to_le_bytes())?;
            out.write_all(&sym.section.to_le_bytes())?;
            out.write_all(&sym.kind.to_le_bytes())?;
            out.write_all(&[sym.class, 0])?;
        }

        // String table, prefixed with its own length.
        out.write_all(&(strings.len() as u32 + 4).to_le_bytes())?;
        out.write_all(&strings)?;

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
        text.data = vec![0x55, 0xE8, 0, 0, 0, 0, 0xC3];
        text.symbols.push(Symbol {
            name: "main".to_string(),
            offset: 0,
            global: true,
            is_function: true,
        });
        text.relocations.push(Relocation {
            offset: 2,
            symbol: "helper_with_a_rather_long_name".to_string(),
            kind: RelocKind::Pc32,
            addend: -4,
        });
        obj.sections.push(text);
        obj.undefined
            .push("helper_with_a_rather_long_name".to_string());
        obj
    }

    #[test]
    fn test_coff_header_shape() {
        let obj = sample_object();
        let mut bytes = Vec::new();
        obj.as_coff(&mut bytes).unwrap();

        let machine = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(machine, IMAGE_FILE_MACHINE_AMD64);
        let nsections = u16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(nsections, 1);
        let nsymbols = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(nsymbols, 2);
    }

    #[test]
    fn test_relocation_encoded() {
        let obj = sample_object();
        let mut bytes = Vec::new();
        obj.as_coff(&mut bytes).unwrap();

        // The REL32 relocation type appears after the section data.
        let needle = IMAGE_REL_AMD64_REL32.to_le_bytes();
        assert!(bytes.windows(2).any(|w| w == needle));
    }

    #[test]
    fn test_long_names_go_to_string_table() {
        let obj = sample_object();
        let mut bytes = Vec::new();
        obj.as_coff(&mut bytes).unwrap();
        let needle = b"helper_with_a_rather_long_name\0";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }
}
