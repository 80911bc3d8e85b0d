//! x86-64 Machine-Code Encoding
//!
//! Encodes post-allocation machine IR into a generic object: raw bytes
//! in `.text`, globals in `.data`/`.rodata`/`.bss`, symbols for every
//! function and global, and PC-relative relocations for whatever this
//! object cannot resolve itself.
//!
//! Branches to blocks backpatch within the function; calls between
//! functions of the same object patch once every function has been
//! placed; calls and data references that leave the object become
//! relocations.
//!
//! ```text
//! [REX] [Opcode] [ModR/M] [SIB] [Displacement] [Immediate]
//! ```

use crate::backend::mir::{GenericOpcode, MFunction, MInst, MirModule, MOperand, Reg};
use crate::backend::object::{GenericObject, RelocKind, Relocation, Symbol};
use crate::backend::x86_64::regs::RegisterId;
use crate::backend::x86_64::Opcode;
use crate::common::context::Context;
use crate::ir::Linkage;
use std::collections::HashMap;

/// Encode the module into a relocatable generic object
pub fn emit_mcode_object(ctx: &Context, mir: &MirModule) -> GenericObject {
    let mut obj = GenericObject::default();

    encode_globals(mir, &mut obj);

    let mut enc = Encoder {
        code: Vec::new(),
        symbol_fixups: Vec::new(),
        block_fixups: Vec::new(),
        block_offsets: Vec::new(),
        symbols: Vec::new(),
    };

    for func in &mir.funcs {
        if func.is_definition() {
            enc.encode_function(mir, func);
        }
    }

    // Calls between functions of this object resolve now; the rest
    // become relocations.
    let local: HashMap<&str, u64> = enc
        .symbols
        .iter()
        .map(|s| (s.name.as_str(), s.offset))
        .collect();
    let mut relocations = Vec::new();
    for fixup in &enc.symbol_fixups {
        match local.get(fixup.symbol.as_str()) {
            Some(target) if fixup.same_section => {
                let rel = *target as i64 - (fixup.offset as i64 + 4) + fixup.addend + 4;
                enc.code[fixup.offset as usize..fixup.offset as usize + 4]
                    .copy_from_slice(&(rel as i32).to_le_bytes());
            }
            _ => {
                relocations.push(Relocation {
                    offset: fixup.offset,
                    symbol: fixup.symbol.clone(),
                    kind: RelocKind::Pc32,
                    addend: fixup.addend,
                });
            }
        }
    }

    let text = obj.section(".text");
    text.data = enc.code;
    text.symbols = enc.symbols;
    text.relocations = relocations;

    for reloc in obj.sections.iter().flat_map(|s| s.relocations.clone()).collect::<Vec<_>>() {
        obj.reference(&reloc.symbol);
    }
    obj.resolve_undefined();
    let _ = ctx;
    obj
}

fn encode_globals(mir: &MirModule, obj: &mut GenericObject) {
    for global in &mir.globals {
        if global.linkage.is_extern() && global.init.is_none() && global.bytes == 0 {
            continue;
        }
        let section_name = match &global.init {
            Some(_) if global.name.starts_with(".L") => ".rodata",
            Some(_) => ".data",
            None => ".bss",
        };
        let section = obj.section(section_name);
        let offset = section.data.len() as u64 + section.reserve;
        section.symbols.push(Symbol {
            name: global.name.clone(),
            offset,
            global: global.linkage.is_exported(),
            is_function: false,
        });
        match &global.init {
            Some(bytes) => {
                section.data.extend_from_slice(bytes);
                let tail = global.bytes.saturating_sub(bytes.len() as u64);
                section.data.extend(std::iter::repeat_n(0u8, tail as usize));
            }
            None => section.reserve += global.bytes.max(1),
        }
    }
}

/// A pending 32-bit PC-relative patch against a named symbol
struct SymbolFixup {
    offset: u64,
    symbol: String,
    /// Extra displacement to the end of the instruction (negative when
    /// immediates follow the disp32 field)
    addend: i64,
    /// Whether the target may be resolved within .text
    same_section: bool,
}

struct Encoder {
    code: Vec<u8>,
    symbol_fixups: Vec<SymbolFixup>,
    /// (patch offset, block index) within the current function
    block_fixups: Vec<(usize, usize)>,
    block_offsets: Vec<usize>,
    symbols: Vec<Symbol>,
}

impl Encoder {
    fn byte(&mut self, b: u8) {
        self.code.push(b);
    }

    fn bytes(&mut self, bs: &[u8]) {
        self.code.extend_from_slice(bs);
    }

    fn i32_at(&mut self, offset: usize, value: i32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn rex(&mut self, w: bool, reg: Option<RegisterId>, rm: Option<RegisterId>) {
        let mut rex = 0x40u8;
        if w {
            rex |= 0x08;
        }
        if reg.is_some_and(|r| r.needs_rex()) {
            rex |= 0x04;
        }
        if rm.is_some_and(|r| r.needs_rex()) {
            rex |= 0x01;
        }
        if rex != 0x40 || w {
            self.byte(rex);
        }
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.byte((md << 6) | (reg << 3) | rm);
    }

    /// reg-to-reg operation: opcode with ModRM reg=src field, rm=dst
    fn rr(&mut self, opcode: &[u8], reg: RegisterId, rm: RegisterId, bits: u16) {
        self.rex(bits == 64, Some(reg), Some(rm));
        self.bytes(opcode);
        self.modrm(0b11, reg.reg3(), rm.reg3());
    }

    /// ModRM memory form addressing [base + disp]
    fn mem(&mut self, opcode: &[u8], reg: u8, reg_rex: bool, base: RegisterId, disp: i32, bits: u16) {
        let mut rex = 0x40u8;
        if bits == 64 {
            rex |= 0x08;
        }
        if reg_rex {
            rex |= 0x04;
        }
        if base.needs_rex() {
            rex |= 0x01;
        }
        if rex != 0x40 || bits == 64 {
            self.byte(rex);
        }
        self.bytes(opcode);

        let need_sib = matches!(base, RegisterId::Rsp | RegisterId::R12);
        let force_disp = matches!(base, RegisterId::Rbp | RegisterId::R13);
        let small = (-128..=127).contains(&disp);
        let md = if disp == 0 && !force_disp {
            0b00
        } else if small {
            0b01
        } else {
            0b10
        };
        self.modrm(md, reg, base.reg3());
        if need_sib {
            self.byte(0x24);
        }
        if md == 0b01 {
            self.byte(disp as u8);
        } else if md == 0b10 {
            self.bytes(&disp.to_le_bytes());
        }
    }

    /// RIP-relative memory form against a named symbol
    fn rip(&mut self, opcode: &[u8], reg: u8, reg_rex: bool, symbol: &str, trailing: i64, bits: u16) {
        let mut rex = 0x40u8;
        if bits == 64 {
            rex |= 0x08;
        }
        if reg_rex {
            rex |= 0x04;
        }
        if rex != 0x40 || bits == 64 {
            self.byte(rex);
        }
        self.bytes(opcode);
        self.modrm(0b00, reg, 0b101);
        let offset = self.code.len() as u64;
        self.bytes(&[0, 0, 0, 0]);
        self.symbol_fixups.push(SymbolFixup {
            offset,
            symbol: symbol.to_string(),
            addend: -4 - trailing,
            same_section: false,
        });
    }

    /// Opcode byte of a mov to or from memory at the given width
    fn mov_opcode(bits: u16, store: bool) -> &'static [u8] {
        match (bits, store) {
            (8, true) => &[0x88],
            (8, false) => &[0x8A],
            (_, true) => &[0x89],
            (_, false) => &[0x8B],
        }
    }

    /// Prefixes some widths need: the operand-size override for 16-bit
    /// accesses, and a bare REX to reach the low bytes of rsp/rbp/rsi/
    /// rdi when nothing else in the instruction will emit one
    fn width_prefix(&mut self, bits: u16, reg: RegisterId, base: Option<RegisterId>) {
        if bits == 16 {
            self.byte(0x66);
        }
        if bits == 8
            && !reg.needs_rex()
            && base.is_none_or(|b| !b.needs_rex())
            && matches!(
                reg,
                RegisterId::Rsp | RegisterId::Rbp | RegisterId::Rsi | RegisterId::Rdi
            )
        {
            self.byte(0x40);
        }
    }

    fn encode_function(&mut self, mir: &MirModule, func: &MFunction) {
        self.symbols.push(Symbol {
            name: func.name.clone(),
            offset: self.code.len() as u64,
            global: func.linkage.is_exported(),
            is_function: true,
        });

        let (frame_size, offsets) = func.frame_layout();

        // push rbp; mov rsp, rbp; sub $frame, rsp
        self.byte(0x55);
        self.bytes(&[0x48, 0x89, 0xE5]);
        if frame_size > 0 {
            self.bytes(&[0x48, 0x81, 0xEC]);
            self.bytes(&(frame_size as u32).to_le_bytes());
        }

        self.block_fixups.clear();
        self.block_offsets = vec![0; func.blocks.len()];

        for (index, block) in func.blocks.iter().enumerate() {
            self.block_offsets[index] = self.code.len();
            for inst in &block.insts {
                self.encode_inst(mir, inst, &offsets);
            }
        }

        // Branch targets within the function are known now.
        for (patch, block) in std::mem::take(&mut self.block_fixups) {
            let rel = self.block_offsets[block] as i64 - (patch as i64 + 4);
            self.i32_at(patch, rel as i32);
        }
    }

    fn reg_of(op: &MOperand) -> RegisterId {
        match op {
            MOperand::Register(reg) => RegisterId::from_u32(reg.id)
                .unwrap_or_else(|| crate::ice!("bad physical register id {}", reg.id)),
            other => crate::ice!("expected a register operand, found {:?}", other),
        }
    }

    fn bits_of(op: &MOperand) -> u16 {
        match op {
            MOperand::Register(reg) => reg.bits,
            _ => 64,
        }
    }

    fn block_jump(&mut self, opcode: &[u8], target: usize) {
        self.bytes(opcode);
        let patch = self.code.len();
        self.bytes(&[0, 0, 0, 0]);
        self.block_fixups.push((patch, target));
    }

    fn symbol_call(&mut self, opcode: &[u8], symbol: &str) {
        self.bytes(opcode);
        let offset = self.code.len() as u64;
        self.bytes(&[0, 0, 0, 0]);
        self.symbol_fixups.push(SymbolFixup {
            offset,
            symbol: symbol.to_string(),
            addend: -4,
            same_section: true,
        });
    }

    fn symbol_name(mir: &MirModule, op: &MOperand) -> String {
        match op {
            MOperand::Function(index) => mir.funcs[*index as usize].name.clone(),
            MOperand::Global(index) => mir.globals[*index as usize].name.clone(),
            other => crate::ice!("operand {:?} names no symbol", other),
        }
    }

    fn encode_inst(&mut self, mir: &MirModule, inst: &MInst, offsets: &[u64]) {
        match Opcode::from_u32(inst.opcode) {
            Some(Opcode::Poison) => self.bytes(&[0x0F, 0x0B]),

            Some(Opcode::Return) => {
                self.byte(0xC9); // leave
                self.byte(0xC3); // ret
            }

            Some(Opcode::Jump) => match &inst.operands[0] {
                MOperand::Block(target) => self.block_jump(&[0xE9], *target as usize),
                MOperand::Register(_) => {
                    // leave; jmp *reg
                    let reg = Self::reg_of(&inst.operands[0]);
                    self.byte(0xC9);
                    self.rex(false, None, Some(reg));
                    self.byte(0xFF);
                    self.modrm(0b11, 4, reg.reg3());
                }
                op => {
                    // Tail call: restore the frame, then jump out.
                    self.byte(0xC9);
                    let name = Self::symbol_name(mir, op);
                    self.symbol_call(&[0xE9], &name);
                }
            },

            Some(Opcode::JumpIfZeroFlag) => match &inst.operands[0] {
                MOperand::Block(target) => self.block_jump(&[0x0F, 0x84], *target as usize),
                op => crate::ice!("jz target {:?}", op),
            },

            Some(Opcode::Call) => match &inst.operands[0] {
                MOperand::Register(_) => {
                    let reg = Self::reg_of(&inst.operands[0]);
                    self.rex(false, None, Some(reg));
                    self.byte(0xFF);
                    self.modrm(0b11, 2, reg.reg3());
                }
                op => {
                    let name = Self::symbol_name(mir, op);
                    self.symbol_call(&[0xE8], &name);
                }
            },

            Some(Opcode::Move) => self.encode_move(mir, inst, offsets),

            Some(Opcode::MoveDereferenceLhs) => {
                let value = &inst.operands[0];
                let addr = &inst.operands[1];
                let bits = Self::bits_of(value);
                match (value, addr) {
                    (MOperand::Register(_), MOperand::Register(_)) => {
                        let src = Self::reg_of(value);
                        let base = Self::reg_of(addr);
                        self.width_prefix(bits, src, Some(base));
                        self.mem(Self::mov_opcode(bits, true), src.reg3(), src.needs_rex(), base, 0, bits);
                    }
                    (MOperand::Register(_), MOperand::Global(_)) => {
                        let src = Self::reg_of(value);
                        let name = Self::symbol_name(mir, addr);
                        self.width_prefix(bits, src, None);
                        self.rip(Self::mov_opcode(bits, true), src.reg3(), src.needs_rex(), &name, 0, bits);
                    }
                    (MOperand::Immediate(v), MOperand::Register(_)) => {
                        let base = Self::reg_of(addr);
                        self.mem(&[0xC7], 0, false, base, 0, 64);
                        self.bytes(&(*v as i32).to_le_bytes());
                    }
                    (MOperand::Immediate(v), MOperand::Global(_)) => {
                        let name = Self::symbol_name(mir, addr);
                        self.rip(&[0xC7], 0, false, &name, 4, 64);
                        self.bytes(&(*v as i32).to_le_bytes());
                    }
                    other => crate::ice!("cannot encode store {:?}", other),
                }
            }

            Some(Opcode::MoveDereferenceRhs) => {
                let addr = &inst.operands[0];
                let dst = &inst.operands[1];
                let reg = Self::reg_of(dst);
                let bits = Self::bits_of(dst);
                match addr {
                    MOperand::Register(_) => {
                        let base = Self::reg_of(addr);
                        self.width_prefix(bits, reg, Some(base));
                        self.mem(Self::mov_opcode(bits, false), reg.reg3(), reg.needs_rex(), base, 0, bits);
                    }
                    MOperand::Global(_) => {
                        let name = Self::symbol_name(mir, addr);
                        self.width_prefix(bits, reg, None);
                        self.rip(Self::mov_opcode(bits, false), reg.reg3(), reg.needs_rex(), &name, 0, bits);
                    }
                    other => crate::ice!("cannot encode load from {:?}", other),
                }
            }

            Some(Opcode::MoveSignExtended) => {
                let src = Self::reg_of(&inst.operands[0]);
                let src_bits = Self::bits_of(&inst.operands[0]);
                let dst = Self::reg_of(&inst.operands[1]);
                // movsx / movsxd, ModRM reg=dst, rm=src.
                let opcode: &[u8] = match src_bits {
                    8 => &[0x0F, 0xBE],
                    16 => &[0x0F, 0xBF],
                    _ => &[0x63],
                };
                self.rex(true, Some(dst), Some(src));
                self.bytes(opcode);
                self.modrm(0b11, dst.reg3(), src.reg3());
            }

            Some(Opcode::LoadEffectiveAddress) => {
                let dst = Self::reg_of(&inst.operands[1]);
                match &inst.operands[0] {
                    MOperand::Local(index) => {
                        let disp = -(offsets[*index as usize] as i32);
                        self.mem(&[0x8D], dst.reg3(), dst.needs_rex(), RegisterId::Rbp, disp, 64);
                    }
                    op @ (MOperand::Global(_) | MOperand::Function(_)) => {
                        let name = Self::symbol_name(mir, op);
                        self.rip(&[0x8D], dst.reg3(), dst.needs_rex(), &name, 0, 64);
                    }
                    other => crate::ice!("cannot take the address of {:?}", other),
                }
            }

            Some(Opcode::Add) => self.alu(inst, &[0x01], 0),
            Some(Opcode::Sub) => self.alu(inst, &[0x29], 5),

            Some(Opcode::Multiply) => {
                // imul reads ModRM the other way round: reg=dst, rm=src.
                let src = Self::reg_of(&inst.operands[0]);
                let dst = Self::reg_of(&inst.operands[1]);
                self.rex(true, Some(dst), Some(src));
                self.bytes(&[0x0F, 0xAF]);
                self.modrm(0b11, dst.reg3(), src.reg3());
            }

            Some(Opcode::Push) => {
                let reg = Self::reg_of(&inst.operands[0]);
                self.rex(false, None, Some(reg));
                self.byte(0x50 + reg.reg3());
            }

            Some(Opcode::Pop) => {
                let reg = Self::reg_of(&inst.operands[0]);
                self.rex(false, None, Some(reg));
                self.byte(0x58 + reg.reg3());
            }

            Some(Opcode::Test) => {
                let a = Self::reg_of(&inst.operands[0]);
                let b = Self::reg_of(&inst.operands[1]);
                self.rr(&[0x85], a, b, 64);
            }

            Some(Opcode::Compare) => self.alu(inst, &[0x39], 7),

            Some(setcc) => {
                let cc: u8 = match setcc {
                    Opcode::SetByteIfEqual => 0x94,
                    Opcode::SetByteIfLessUnsigned => 0x92,
                    Opcode::SetByteIfLessSigned => 0x9C,
                    Opcode::SetByteIfGreaterUnsigned => 0x97,
                    Opcode::SetByteIfGreaterSigned => 0x9F,
                    Opcode::SetByteIfEqualOrLessUnsigned => 0x96,
                    Opcode::SetByteIfEqualOrLessSigned => 0x9E,
                    Opcode::SetByteIfEqualOrGreaterUnsigned => 0x93,
                    Opcode::SetByteIfEqualOrGreaterSigned => 0x9D,
                    other => crate::ice!("unhandled opcode {:?}", other),
                };
                let reg = Self::reg_of(&inst.operands[0]);
                // A REX prefix selects the low byte of rsp/rbp/rsi/rdi
                // and the extended registers.
                if reg.needs_rex() {
                    self.byte(0x41);
                } else if matches!(
                    reg,
                    RegisterId::Rsp | RegisterId::Rbp | RegisterId::Rsi | RegisterId::Rdi
                ) {
                    self.byte(0x40);
                }
                self.bytes(&[0x0F, cc]);
                self.modrm(0b11, 0, reg.reg3());
            }

            None => self.encode_generic(inst),
        }
    }

    /// mov in its register/immediate/spill-slot forms
    fn encode_move(&mut self, mir: &MirModule, inst: &MInst, offsets: &[u64]) {
        let src = &inst.operands[0];
        let dst = &inst.operands[1];
        match (src, dst) {
            (MOperand::Register(_), MOperand::Register(_)) => {
                let s = Self::reg_of(src);
                let d = Self::reg_of(dst);
                // A 32-bit move zero-extends; everything else moves the
                // full register.
                let bits = if Self::bits_of(src) == 32 || Self::bits_of(dst) == 32 {
                    32
                } else {
                    64
                };
                self.rr(&[0x89], s, d, bits);
            }
            (MOperand::Immediate(v), MOperand::Register(_)) => {
                let d = Self::reg_of(dst);
                // movabs imm64, reg
                self.rex(true, None, Some(d));
                self.byte(0xB8 + d.reg3());
                self.bytes(&v.to_le_bytes());
            }
            (MOperand::Local(index), MOperand::Register(_)) => {
                let d = Self::reg_of(dst);
                let disp = -(offsets[*index as usize] as i32);
                self.mem(&[0x8B], d.reg3(), d.needs_rex(), RegisterId::Rbp, disp, 64);
            }
            (MOperand::Register(_), MOperand::Local(index)) => {
                let s = Self::reg_of(src);
                let disp = -(offsets[*index as usize] as i32);
                self.mem(&[0x89], s.reg3(), s.needs_rex(), RegisterId::Rbp, disp, 64);
            }
            (MOperand::Immediate(v), MOperand::Local(index)) => {
                let disp = -(offsets[*index as usize] as i32);
                self.mem(&[0xC7], 0, false, RegisterId::Rbp, disp, 64);
                self.bytes(&(*v as i32).to_le_bytes());
            }
            (MOperand::Global(_), MOperand::Register(_)) => {
                let d = Self::reg_of(dst);
                let name = Self::symbol_name(mir, src);
                self.rip(&[0x8B], d.reg3(), d.needs_rex(), &name, 0, 64);
            }
            other => crate::ice!("cannot encode mov {:?}", other),
        }
    }

    /// Two-operand ALU op: register form or sign-extended imm32 form
    fn alu(&mut self, inst: &MInst, rr_opcode: &[u8], imm_ext: u8) {
        let src = &inst.operands[0];
        let dst = &inst.operands[1];
        let d = Self::reg_of(dst);
        match src {
            MOperand::Register(_) => {
                let s = Self::reg_of(src);
                self.rr(rr_opcode, s, d, 64);
            }
            MOperand::Immediate(v) => {
                self.rex(true, None, Some(d));
                self.byte(0x81);
                self.modrm(0b11, imm_ext, d.reg3());
                self.bytes(&(*v as i32).to_le_bytes());
            }
            other => crate::ice!("cannot encode ALU operand {:?}", other),
        }
    }

    /// The generic two-operand leftovers: shifts, bitwise ops, unary
    /// ops, division
    fn encode_generic(&mut self, inst: &MInst) {
        match inst.generic() {
            Some(GenericOpcode::And) => self.alu(inst, &[0x21], 4),
            Some(GenericOpcode::Or) => self.alu(inst, &[0x09], 1),
            Some(GenericOpcode::Xor) => self.alu(inst, &[0x31], 6),

            Some(op @ (GenericOpcode::Shl | GenericOpcode::Shr | GenericOpcode::Sar)) => {
                let ext = match op {
                    GenericOpcode::Shl => 4,
                    GenericOpcode::Shr => 5,
                    _ => 7,
                };
                let dst = Self::reg_of(&inst.operands[1]);
                match &inst.operands[0] {
                    MOperand::Immediate(v) => {
                        self.rex(true, None, Some(dst));
                        self.byte(0xC1);
                        self.modrm(0b11, ext, dst.reg3());
                        self.byte(*v as u8);
                    }
                    // Count in CL.
                    _ => {
                        self.rex(true, None, Some(dst));
                        self.byte(0xD3);
                        self.modrm(0b11, ext, dst.reg3());
                    }
                }
            }

            Some(GenericOpcode::Neg) => self.unary_f7(inst, 3),
            Some(GenericOpcode::Compl) => self.unary_f7(inst, 2),
            Some(GenericOpcode::SDiv | GenericOpcode::SRem) => self.unary_f7(inst, 7),
            Some(GenericOpcode::UDiv | GenericOpcode::URem) => self.unary_f7(inst, 6),

            other => crate::ice!("cannot encode generic opcode {:?}", other),
        }
    }

    fn unary_f7(&mut self, inst: &MInst, ext: u8) {
        let reg = Self::reg_of(&inst.operands[0]);
        self.rex(true, None, Some(reg));
        self.byte(0xF7);
        self.modrm(0b11, ext, reg.reg3());
    }
}
