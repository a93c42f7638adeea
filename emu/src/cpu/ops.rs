//! Instruction execution
//!
//! The decode tables live in the big `execute` match: one-byte opcodes, the
//! 0x0F map, and the shared groups (ALU, shift, unary, INC/DEC/CALL/JMP).
//! Flag computation follows the Intel manuals: arithmetic is widened one bit
//! for carry-out, overflow is the XOR of the top two carries, parity covers
//! the low result byte only.

use super::{CpuFault, Eflags, Event, Operand, Prefixes, Rep, Width};
use super::{reg, Cpu};
use crate::mm::VirtualMemory;

/// ALU group index order baked into the opcode map
const ALU_ADD: u8 = 0;
const ALU_OR: u8 = 1;
const ALU_ADC: u8 = 2;
const ALU_SBB: u8 = 3;
const ALU_AND: u8 = 4;
const ALU_SUB: u8 = 5;
const ALU_XOR: u8 = 6;
const ALU_CMP: u8 = 7;

#[inline]
fn parity_even(b: u8) -> bool {
    b.count_ones() % 2 == 0
}

impl Cpu {
    #[inline]
    fn opw(&self, pfx: Prefixes) -> Width {
        if pfx.operand_size {
            Width::Word
        } else {
            Width::Dword
        }
    }

    // ========================================================================
    // Flag helpers
    // ========================================================================

    fn set_szp(&mut self, res: u32, w: Width) {
        let res = res & w.mask();
        self.eflags.set(Eflags::ZF, res == 0);
        self.eflags.set(Eflags::SF, res & w.sign_bit() != 0);
        self.eflags.set(Eflags::PF, parity_even(res as u8));
    }

    /// a + b + carry_in with full flag update
    fn flag_add(&mut self, a: u32, b: u32, carry_in: u32, w: Width) -> u32 {
        let mask = w.mask();
        let (a, b) = (a & mask, b & mask);
        let wide = a as u64 + b as u64 + carry_in as u64;
        let res = (wide as u32) & mask;
        self.eflags.set(Eflags::CF, wide > mask as u64);
        self.eflags
            .set(Eflags::OF, (!(a ^ b) & (a ^ res)) & w.sign_bit() != 0);
        self.eflags.set(Eflags::AF, (a ^ b ^ res) & 0x10 != 0);
        self.set_szp(res, w);
        res
    }

    /// a - b - borrow_in with full flag update
    fn flag_sub(&mut self, a: u32, b: u32, borrow_in: u32, w: Width) -> u32 {
        let mask = w.mask();
        let (a, b) = (a & mask, b & mask);
        let res = a.wrapping_sub(b).wrapping_sub(borrow_in) & mask;
        self.eflags
            .set(Eflags::CF, (b as u64 + borrow_in as u64) > a as u64);
        self.eflags
            .set(Eflags::OF, ((a ^ b) & (a ^ res)) & w.sign_bit() != 0);
        self.eflags.set(Eflags::AF, (a ^ b ^ res) & 0x10 != 0);
        self.set_szp(res, w);
        res
    }

    /// Logical result: CF/OF/AF cleared, SZP from the result
    fn flag_logic(&mut self, res: u32, w: Width) -> u32 {
        self.eflags
            .remove(Eflags::CF | Eflags::OF | Eflags::AF);
        self.set_szp(res, w);
        res & w.mask()
    }

    /// Apply one of the eight ALU group operations, updating flags
    fn alu_op(&mut self, idx: u8, a: u32, b: u32, w: Width) -> u32 {
        let cf = self.eflags.contains(Eflags::CF) as u32;
        match idx {
            ALU_ADD => self.flag_add(a, b, 0, w),
            ALU_OR => self.flag_logic(a | b, w),
            ALU_ADC => self.flag_add(a, b, cf, w),
            ALU_SBB => self.flag_sub(a, b, cf, w),
            ALU_AND => self.flag_logic(a & b, w),
            ALU_SUB => self.flag_sub(a, b, 0, w),
            ALU_XOR => self.flag_logic(a ^ b, w),
            _ => {
                // CMP: subtract for flags, result discarded by the caller
                self.flag_sub(a, b, 0, w)
            }
        }
    }

    /// Evaluate a condition code (the low nibble of Jcc/SETcc opcodes)
    fn test_cc(&self, cc: u8) -> bool {
        let f = self.eflags;
        let (cf, zf, sf, of, pf) = (
            f.contains(Eflags::CF),
            f.contains(Eflags::ZF),
            f.contains(Eflags::SF),
            f.contains(Eflags::OF),
            f.contains(Eflags::PF),
        );
        match cc & 0xF {
            0x0 => of,
            0x1 => !of,
            0x2 => cf,
            0x3 => !cf,
            0x4 => zf,
            0x5 => !zf,
            0x6 => cf || zf,
            0x7 => !cf && !zf,
            0x8 => sf,
            0x9 => !sf,
            0xA => pf,
            0xB => !pf,
            0xC => sf != of,
            0xD => sf == of,
            0xE => zf || (sf != of),
            _ => !zf && (sf == of),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    pub(super) fn execute(
        &mut self,
        mem: &mut VirtualMemory,
        op: u8,
        pfx: Prefixes,
        start_eip: u32,
    ) -> Result<Event, CpuFault> {
        match op {
            // ALU family: idx = op >> 3, form = op & 7
            0x00..=0x05 | 0x08..=0x0D | 0x10..=0x15 | 0x18..=0x1D | 0x20..=0x25
            | 0x28..=0x2D | 0x30..=0x35 | 0x38..=0x3D => {
                self.exec_alu_family(mem, op, pfx)?;
            }

            // Two-byte map
            0x0F => return self.execute_0f(mem, pfx, start_eip),

            // INC/DEC r32 preserve CF
            0x40..=0x47 => {
                let r = (op & 7) as usize;
                let w = self.opw(pfx);
                let cf = self.eflags.contains(Eflags::CF);
                let v = self.flag_add(self.read_reg(r, w), 1, 0, w);
                self.eflags.set(Eflags::CF, cf);
                self.write_reg(r, w, v);
            }
            0x48..=0x4F => {
                let r = (op & 7) as usize;
                let w = self.opw(pfx);
                let cf = self.eflags.contains(Eflags::CF);
                let v = self.flag_sub(self.read_reg(r, w), 1, 0, w);
                self.eflags.set(Eflags::CF, cf);
                self.write_reg(r, w, v);
            }

            0x50..=0x57 => {
                let v = self.regs[(op & 7) as usize];
                self.push32(mem, v)?;
            }
            0x58..=0x5F => {
                let v = self.pop32(mem)?;
                self.regs[(op & 7) as usize] = v;
            }

            0x68 => {
                let imm = self.fetch32(mem)?;
                self.push32(mem, imm)?;
            }
            0x6A => {
                let imm = self.fetch8(mem)? as i8 as i32 as u32;
                self.push32(mem, imm)?;
            }

            // IMUL r, r/m, imm
            0x69 | 0x6B => {
                let w = self.opw(pfx);
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let a = self.read_op(mem, rm, w)?;
                let imm = if op == 0x69 {
                    self.fetch_imm(mem, w)?
                } else {
                    self.fetch8(mem)? as i8 as i32 as u32
                };
                let v = self.imul_flags(a, imm, w);
                self.write_reg(r, w, v);
            }

            // Jcc rel8
            0x70..=0x7F => {
                let disp = self.fetch8(mem)? as i8 as i32 as u32;
                if self.test_cc(op & 0xF) {
                    self.eip = self.eip.wrapping_add(disp);
                }
            }

            // Group 1: ALU r/m, imm
            0x80 | 0x82 => self.exec_group1(mem, pfx, Width::Byte, false)?,
            0x81 => {
                let w = self.opw(pfx);
                self.exec_group1(mem, pfx, w, false)?;
            }
            0x83 => {
                let w = self.opw(pfx);
                self.exec_group1(mem, pfx, w, true)?;
            }

            // TEST r/m, r
            0x84 | 0x85 => {
                let w = if op == 0x84 { Width::Byte } else { self.opw(pfx) };
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let a = self.read_op(mem, rm, w)?;
                self.flag_logic(a & self.read_reg(r, w), w);
            }

            // XCHG r/m, r
            0x86 | 0x87 => {
                let w = if op == 0x86 { Width::Byte } else { self.opw(pfx) };
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let a = self.read_op(mem, rm, w)?;
                let b = self.read_reg(r, w);
                self.write_op(mem, rm, w, b)?;
                self.write_reg(r, w, a);
            }

            // MOV family
            0x88 | 0x89 => {
                let w = if op == 0x88 { Width::Byte } else { self.opw(pfx) };
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let v = self.read_reg(r, w);
                self.write_op(mem, rm, w, v)?;
            }
            0x8A | 0x8B => {
                let w = if op == 0x8A { Width::Byte } else { self.opw(pfx) };
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let v = self.read_op(mem, rm, w)?;
                self.write_reg(r, w, v);
            }

            // LEA: address computation, no segment base, no memory access
            0x8D => {
                let (r, rm) = self.decode_modrm(mem, 0)?;
                match rm {
                    Operand::Mem(a) => self.write_reg(r, self.opw(pfx), a),
                    Operand::Reg(_) => {
                        return Err(CpuFault::UnknownOpcode {
                            opcode: 0x8D,
                            eip: start_eip,
                        })
                    }
                }
            }

            // POP r/m32
            0x8F => {
                let v = self.pop32(mem)?;
                let (_, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                self.write_op(mem, rm, Width::Dword, v)?;
            }

            0x90 => {} // NOP
            0x91..=0x97 => {
                let r = (op & 7) as usize;
                self.regs.swap(reg::EAX, r);
            }

            // CWDE / CBW
            0x98 => {
                if pfx.operand_size {
                    let al = self.read_reg(reg::EAX, Width::Byte);
                    self.write_reg(reg::EAX, Width::Word, Width::Byte.sign_extend(al));
                } else {
                    let ax = self.read_reg(reg::EAX, Width::Word);
                    self.regs[reg::EAX] = Width::Word.sign_extend(ax);
                }
            }
            // CDQ / CWD
            0x99 => {
                if pfx.operand_size {
                    let sign = self.regs[reg::EAX] & 0x8000 != 0;
                    self.write_reg(reg::EDX, Width::Word, if sign { 0xFFFF } else { 0 });
                } else {
                    let sign = self.regs[reg::EAX] & 0x8000_0000 != 0;
                    self.regs[reg::EDX] = if sign { 0xFFFF_FFFF } else { 0 };
                }
            }

            0x9B => {} // FWAIT

            0x9C => {
                let v = self.eflags.bits() | 0x2;
                self.push32(mem, v)?;
            }
            0x9D => {
                let v = self.pop32(mem)?;
                self.eflags = Eflags::from_bits_truncate(v);
            }
            // SAHF / LAHF
            0x9E => {
                let ah = self.read_reg(4, Width::Byte);
                let keep = self.eflags.bits() & !0xD5;
                self.eflags = Eflags::from_bits_truncate(keep | (ah & 0xD5));
            }
            0x9F => {
                let v = (self.eflags.bits() & 0xD5) as u32 | 0x02;
                self.write_reg(4, Width::Byte, v);
            }

            // MOV accumulator <-> moffs
            0xA0 => {
                let addr = self.fetch32(mem)?.wrapping_add(self.seg_base(pfx));
                let v = mem.read8(addr)? as u32;
                self.write_reg(reg::EAX, Width::Byte, v);
            }
            0xA1 => {
                let w = self.opw(pfx);
                let addr = self.fetch32(mem)?.wrapping_add(self.seg_base(pfx));
                let v = self.read_op(mem, Operand::Mem(addr), w)?;
                self.write_reg(reg::EAX, w, v);
            }
            0xA2 => {
                let addr = self.fetch32(mem)?.wrapping_add(self.seg_base(pfx));
                mem.write8(addr, self.regs[reg::EAX] as u8)?;
            }
            0xA3 => {
                let w = self.opw(pfx);
                let addr = self.fetch32(mem)?.wrapping_add(self.seg_base(pfx));
                let v = self.read_reg(reg::EAX, w);
                self.write_op(mem, Operand::Mem(addr), w, v)?;
            }

            // String operations
            0xA4 => self.exec_movs(mem, Width::Byte, pfx)?,
            0xA5 => self.exec_movs(mem, self.opw(pfx), pfx)?,
            0xA6 => self.exec_cmps(mem, Width::Byte, pfx)?,
            0xA7 => self.exec_cmps(mem, self.opw(pfx), pfx)?,
            0xAA => self.exec_stos(mem, Width::Byte, pfx)?,
            0xAB => self.exec_stos(mem, self.opw(pfx), pfx)?,
            0xAC => self.exec_lods(mem, Width::Byte, pfx)?,
            0xAD => self.exec_lods(mem, self.opw(pfx), pfx)?,
            0xAE => self.exec_scas(mem, Width::Byte, pfx)?,
            0xAF => self.exec_scas(mem, self.opw(pfx), pfx)?,

            // TEST accumulator, imm
            0xA8 => {
                let imm = self.fetch8(mem)? as u32;
                let al = self.read_reg(reg::EAX, Width::Byte);
                self.flag_logic(al & imm, Width::Byte);
            }
            0xA9 => {
                let w = self.opw(pfx);
                let imm = self.fetch_imm(mem, w)?;
                let a = self.read_reg(reg::EAX, w);
                self.flag_logic(a & imm, w);
            }

            // MOV r, imm
            0xB0..=0xB7 => {
                let imm = self.fetch8(mem)? as u32;
                self.write_reg((op & 7) as usize, Width::Byte, imm);
            }
            0xB8..=0xBF => {
                let w = self.opw(pfx);
                let imm = self.fetch_imm(mem, w)?;
                self.write_reg((op & 7) as usize, w, imm);
            }

            // Shift group
            0xC0 | 0xC1 => {
                let w = if op == 0xC0 { Width::Byte } else { self.opw(pfx) };
                let (ext, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let count = self.fetch8(mem)?;
                self.exec_shift(mem, ext as u8, rm, count, w, start_eip)?;
            }
            0xD0 | 0xD1 => {
                let w = if op == 0xD0 { Width::Byte } else { self.opw(pfx) };
                let (ext, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                self.exec_shift(mem, ext as u8, rm, 1, w, start_eip)?;
            }
            0xD2 | 0xD3 => {
                let w = if op == 0xD2 { Width::Byte } else { self.opw(pfx) };
                let (ext, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let count = self.read_reg(reg::ECX, Width::Byte) as u8;
                self.exec_shift(mem, ext as u8, rm, count, w, start_eip)?;
            }

            // RET imm16 / RET
            0xC2 => {
                let imm = self.fetch16(mem)? as u32;
                let ret = self.pop32(mem)?;
                self.regs[reg::ESP] = self.regs[reg::ESP].wrapping_add(imm);
                self.eip = ret;
            }
            0xC3 => {
                self.eip = self.pop32(mem)?;
            }

            // MOV r/m, imm
            0xC6 => {
                let (_, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let imm = self.fetch8(mem)? as u32;
                self.write_op(mem, rm, Width::Byte, imm)?;
            }
            0xC7 => {
                let w = self.opw(pfx);
                let (_, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let imm = self.fetch_imm(mem, w)?;
                self.write_op(mem, rm, w, imm)?;
            }

            0xC9 => {
                // LEAVE
                self.regs[reg::ESP] = self.regs[reg::EBP];
                self.regs[reg::EBP] = self.pop32(mem)?;
            }

            0xCC => return Ok(Event::Interrupt(3)),
            0xCD => {
                let vector = self.fetch8(mem)?;
                return Ok(Event::Interrupt(vector));
            }

            // x87 escape
            0xD8..=0xDF => self.exec_fpu(mem, op, pfx)?,

            0xE8 => {
                let disp = self.fetch32(mem)?;
                let ret = self.eip;
                self.push32(mem, ret)?;
                self.eip = self.eip.wrapping_add(disp);
            }
            0xE9 => {
                let disp = self.fetch32(mem)?;
                self.eip = self.eip.wrapping_add(disp);
            }
            0xEB => {
                let disp = self.fetch8(mem)? as i8 as i32 as u32;
                self.eip = self.eip.wrapping_add(disp);
            }

            0xF5 => self.eflags.toggle(Eflags::CF),

            // Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV
            0xF6 => self.exec_group3(mem, pfx, Width::Byte, start_eip)?,
            0xF7 => {
                let w = self.opw(pfx);
                self.exec_group3(mem, pfx, w, start_eip)?;
            }

            0xF8 => self.eflags.remove(Eflags::CF),
            0xF9 => self.eflags.insert(Eflags::CF),
            0xFA => self.eflags.remove(Eflags::IF),
            0xFB => self.eflags.insert(Eflags::IF),
            0xFC => self.eflags.remove(Eflags::DF),
            0xFD => self.eflags.insert(Eflags::DF),

            // Group 4: INC/DEC r/m8
            0xFE => {
                let (ext, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let a = self.read_op(mem, rm, Width::Byte)?;
                let cf = self.eflags.contains(Eflags::CF);
                let v = match ext {
                    0 => self.flag_add(a, 1, 0, Width::Byte),
                    1 => self.flag_sub(a, 1, 0, Width::Byte),
                    _ => {
                        return Err(CpuFault::UnknownOpcode {
                            opcode: 0xFE,
                            eip: start_eip,
                        })
                    }
                };
                self.eflags.set(Eflags::CF, cf);
                self.write_op(mem, rm, Width::Byte, v)?;
            }

            // Group 5: INC/DEC/CALL/JMP/PUSH r/m
            0xFF => {
                let w = self.opw(pfx);
                let (ext, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                match ext {
                    0 | 1 => {
                        let a = self.read_op(mem, rm, w)?;
                        let cf = self.eflags.contains(Eflags::CF);
                        let v = if ext == 0 {
                            self.flag_add(a, 1, 0, w)
                        } else {
                            self.flag_sub(a, 1, 0, w)
                        };
                        self.eflags.set(Eflags::CF, cf);
                        self.write_op(mem, rm, w, v)?;
                    }
                    2 => {
                        let target = self.read_op(mem, rm, Width::Dword)?;
                        let ret = self.eip;
                        self.push32(mem, ret)?;
                        self.eip = target;
                    }
                    4 => {
                        self.eip = self.read_op(mem, rm, Width::Dword)?;
                    }
                    6 => {
                        let v = self.read_op(mem, rm, Width::Dword)?;
                        self.push32(mem, v)?;
                    }
                    _ => {
                        return Err(CpuFault::UnknownOpcode {
                            opcode: 0xFF00 | ext as u16,
                            eip: start_eip,
                        })
                    }
                }
            }

            other => {
                return Err(CpuFault::UnknownOpcode {
                    opcode: other as u16,
                    eip: start_eip,
                })
            }
        }
        Ok(Event::None)
    }

    /// Two-byte (0x0F-prefixed) opcode map
    fn execute_0f(
        &mut self,
        mem: &mut VirtualMemory,
        pfx: Prefixes,
        start_eip: u32,
    ) -> Result<Event, CpuFault> {
        let op = self.fetch8(mem)?;
        match op {
            // RDTSC: deterministic, fed by the retired-instruction counter
            0x31 => {
                self.regs[reg::EAX] = self.tsc as u32;
                self.regs[reg::EDX] = (self.tsc >> 32) as u32;
            }

            // CPUID: a fixed Pentium-class identity consistent with the
            // SSE/SSE2 claims of IsProcessorFeaturePresent
            0xA2 => match self.regs[reg::EAX] {
                0 => {
                    self.regs[reg::EAX] = 2;
                    self.regs[reg::EBX] = u32::from_le_bytes(*b"Genu");
                    self.regs[reg::EDX] = u32::from_le_bytes(*b"ineI");
                    self.regs[reg::ECX] = u32::from_le_bytes(*b"ntel");
                }
                1 => {
                    self.regs[reg::EAX] = 0x0000_0F12;
                    self.regs[reg::EBX] = 0;
                    self.regs[reg::ECX] = 0;
                    // FPU, TSC, CMOV, MMX, SSE, SSE2
                    self.regs[reg::EDX] = 0x0780_8011;
                }
                _ => {
                    self.regs[reg::EAX] = 0;
                    self.regs[reg::EBX] = 0;
                    self.regs[reg::ECX] = 0;
                    self.regs[reg::EDX] = 0;
                }
            },

            // CMOVcc
            0x40..=0x4F => {
                let w = self.opw(pfx);
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let v = self.read_op(mem, rm, w)?;
                if self.test_cc(op & 0xF) {
                    self.write_reg(r, w, v);
                }
            }

            // Jcc rel32
            0x80..=0x8F => {
                let disp = self.fetch32(mem)?;
                if self.test_cc(op & 0xF) {
                    self.eip = self.eip.wrapping_add(disp);
                }
            }

            // SETcc r/m8
            0x90..=0x9F => {
                let (_, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let v = self.test_cc(op & 0xF) as u32;
                self.write_op(mem, rm, Width::Byte, v)?;
            }

            // SHLD/SHRD
            0xA4 | 0xAC => {
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let count = self.fetch8(mem)?;
                self.exec_shiftd(mem, rm, r, count, op == 0xAC)?;
            }
            0xA5 | 0xAD => {
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let count = self.read_reg(reg::ECX, Width::Byte) as u8;
                self.exec_shiftd(mem, rm, r, count, op == 0xAD)?;
            }

            // IMUL r, r/m
            0xAF => {
                let w = self.opw(pfx);
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let a = self.read_reg(r, w);
                let b = self.read_op(mem, rm, w)?;
                let v = self.imul_flags(a, b, w);
                self.write_reg(r, w, v);
            }

            // MOVZX / MOVSX
            0xB6 | 0xB7 | 0xBE | 0xBF => {
                let src_w = if op & 1 == 0 { Width::Byte } else { Width::Word };
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let v = self.read_op(mem, rm, src_w)?;
                let v = if op >= 0xBE { src_w.sign_extend(v) } else { v };
                self.write_reg(r, self.opw(pfx), v);
            }

            // BSWAP r32
            0xC8..=0xCF => {
                let r = (op & 7) as usize;
                self.regs[r] = self.regs[r].swap_bytes();
            }

            other => {
                return Err(CpuFault::UnknownOpcode {
                    opcode: 0x0F00 | other as u16,
                    eip: start_eip,
                })
            }
        }
        Ok(Event::None)
    }

    // ========================================================================
    // Shared instruction bodies
    // ========================================================================

    /// The 0x00..0x3D ALU block: idx = op >> 3, form = op & 7
    fn exec_alu_family(
        &mut self,
        mem: &mut VirtualMemory,
        op: u8,
        pfx: Prefixes,
    ) -> Result<(), CpuFault> {
        let idx = op >> 3;
        let form = op & 7;
        let w = if form & 1 == 0 {
            Width::Byte
        } else {
            self.opw(pfx)
        };
        match form {
            // r/m (dst) op= r
            0 | 1 => {
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let a = self.read_op(mem, rm, w)?;
                let b = self.read_reg(r, w);
                let v = self.alu_op(idx, a, b, w);
                if idx != ALU_CMP {
                    self.write_op(mem, rm, w, v)?;
                }
            }
            // r (dst) op= r/m
            2 | 3 => {
                let (r, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
                let a = self.read_reg(r, w);
                let b = self.read_op(mem, rm, w)?;
                let v = self.alu_op(idx, a, b, w);
                if idx != ALU_CMP {
                    self.write_reg(r, w, v);
                }
            }
            // accumulator op= imm
            _ => {
                let a = self.read_reg(reg::EAX, w);
                let b = self.fetch_imm(mem, w)?;
                let v = self.alu_op(idx, a, b, w);
                if idx != ALU_CMP {
                    self.write_reg(reg::EAX, w, v);
                }
            }
        }
        Ok(())
    }

    /// Group 1: ALU r/m, imm (optionally sign-extended imm8)
    fn exec_group1(
        &mut self,
        mem: &mut VirtualMemory,
        pfx: Prefixes,
        w: Width,
        imm8_sx: bool,
    ) -> Result<(), CpuFault> {
        let (ext, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
        let imm = if imm8_sx {
            self.fetch8(mem)? as i8 as i32 as u32
        } else {
            self.fetch_imm(mem, w)?
        };
        let a = self.read_op(mem, rm, w)?;
        let v = self.alu_op(ext as u8, a, imm, w);
        if ext as u8 != ALU_CMP {
            self.write_op(mem, rm, w, v)?;
        }
        Ok(())
    }

    /// Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV
    fn exec_group3(
        &mut self,
        mem: &mut VirtualMemory,
        pfx: Prefixes,
        w: Width,
        start_eip: u32,
    ) -> Result<(), CpuFault> {
        let (ext, rm) = self.decode_modrm(mem, self.seg_base(pfx))?;
        match ext {
            0 | 1 => {
                let imm = self.fetch_imm(mem, w)?;
                let a = self.read_op(mem, rm, w)?;
                self.flag_logic(a & imm, w);
            }
            2 => {
                let a = self.read_op(mem, rm, w)?;
                self.write_op(mem, rm, w, !a)?;
            }
            3 => {
                let a = self.read_op(mem, rm, w)?;
                let v = self.flag_sub(0, a, 0, w);
                self.eflags.set(Eflags::CF, a & w.mask() != 0);
                self.write_op(mem, rm, w, v)?;
            }
            4 => {
                // MUL: unsigned widening multiply into the accumulator pair
                let a = self.read_acc_wide_lo(w);
                let b = self.read_op(mem, rm, w)? as u64;
                let prod = a as u64 * b;
                let hi = self.write_acc_wide(prod, w);
                self.eflags.set(Eflags::CF, hi != 0);
                self.eflags.set(Eflags::OF, hi != 0);
            }
            5 => {
                // One-operand IMUL
                let a = w.sign_extend(self.read_acc_wide_lo(w)) as i32 as i64;
                let b = w.sign_extend(self.read_op(mem, rm, w)?) as i32 as i64;
                let prod = a * b;
                self.write_acc_wide(prod as u64, w);
                let lost = prod != (w.sign_extend(prod as u32) as i32 as i64);
                self.eflags.set(Eflags::CF, lost);
                self.eflags.set(Eflags::OF, lost);
            }
            6 => {
                let divisor = self.read_op(mem, rm, w)? as u64;
                let dividend = self.read_div_pair(w);
                if divisor == 0 {
                    return Err(CpuFault::DivideError { eip: start_eip });
                }
                let q = dividend / divisor;
                let r = dividend % divisor;
                if q > w.mask() as u64 {
                    return Err(CpuFault::DivideError { eip: start_eip });
                }
                self.write_div_pair(q as u32, r as u32, w);
            }
            7 => {
                let divisor = w.sign_extend(self.read_op(mem, rm, w)?) as i32 as i64;
                let dividend = self.read_div_pair(w) as i64;
                // Word/byte dividends need their own sign interpretation
                let dividend = match w {
                    Width::Dword => dividend,
                    Width::Word => dividend as u64 as u32 as i32 as i64,
                    Width::Byte => dividend as u64 as u16 as i16 as i64,
                };
                if divisor == 0 {
                    return Err(CpuFault::DivideError { eip: start_eip });
                }
                let q = dividend.wrapping_div(divisor);
                let r = dividend.wrapping_rem(divisor);
                let min = -((w.sign_bit() as i64).wrapping_abs());
                let max = (w.sign_bit() - 1) as i64;
                if q < min || q > max {
                    return Err(CpuFault::DivideError { eip: start_eip });
                }
                self.write_div_pair(q as u32, r as u32, w);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Low half of the widening-multiply accumulator (AL/AX/EAX)
    fn read_acc_wide_lo(&self, w: Width) -> u32 {
        self.read_reg(reg::EAX, w)
    }

    /// Store a widening-multiply product; returns the high half
    fn write_acc_wide(&mut self, prod: u64, w: Width) -> u32 {
        match w {
            Width::Byte => {
                self.write_reg(reg::EAX, Width::Word, prod as u32 & 0xFFFF);
                (prod as u32 >> 8) & 0xFF
            }
            Width::Word => {
                self.write_reg(reg::EAX, Width::Word, prod as u32);
                let hi = (prod >> 16) as u32 & 0xFFFF;
                self.write_reg(reg::EDX, Width::Word, hi);
                hi
            }
            Width::Dword => {
                self.regs[reg::EAX] = prod as u32;
                self.regs[reg::EDX] = (prod >> 32) as u32;
                self.regs[reg::EDX]
            }
        }
    }

    /// DIV/IDIV dividend: AX, DX:AX, or EDX:EAX
    fn read_div_pair(&self, w: Width) -> u64 {
        match w {
            Width::Byte => (self.regs[reg::EAX] & 0xFFFF) as u64,
            Width::Word => {
                ((self.regs[reg::EDX] as u64 & 0xFFFF) << 16) | (self.regs[reg::EAX] as u64 & 0xFFFF)
            }
            Width::Dword => ((self.regs[reg::EDX] as u64) << 32) | self.regs[reg::EAX] as u64,
        }
    }

    /// DIV/IDIV result: quotient in the accumulator, remainder beside it
    fn write_div_pair(&mut self, q: u32, r: u32, w: Width) {
        match w {
            Width::Byte => {
                self.write_reg(reg::EAX, Width::Byte, q);
                self.write_reg(4, Width::Byte, r); // AH
            }
            Width::Word => {
                self.write_reg(reg::EAX, Width::Word, q);
                self.write_reg(reg::EDX, Width::Word, r);
            }
            Width::Dword => {
                self.regs[reg::EAX] = q;
                self.regs[reg::EDX] = r;
            }
        }
    }

    /// Two-operand signed multiply; sets CF/OF on precision loss
    fn imul_flags(&mut self, a: u32, b: u32, w: Width) -> u32 {
        let a = w.sign_extend(a) as i32 as i64;
        let b = w.sign_extend(b) as i32 as i64;
        let prod = a * b;
        let lost = prod != (w.sign_extend(prod as u32) as i32 as i64);
        self.eflags.set(Eflags::CF, lost);
        self.eflags.set(Eflags::OF, lost);
        prod as u32 & w.mask()
    }

    /// Group 2 shifts and rotates
    fn exec_shift(
        &mut self,
        mem: &mut VirtualMemory,
        ext: u8,
        rm: Operand,
        count: u8,
        w: Width,
        start_eip: u32,
    ) -> Result<(), CpuFault> {
        let count = (count & 0x1F) as u32;
        let a = self.read_op(mem, rm, w)? & w.mask();
        if count == 0 {
            return Ok(());
        }
        let bits = w.bits();
        let res = match ext {
            // ROL
            0 => {
                let c = count % bits;
                let res = if c == 0 {
                    a
                } else {
                    ((a << c) | (a >> (bits - c))) & w.mask()
                };
                self.eflags.set(Eflags::CF, res & 1 != 0);
                if count == 1 {
                    let cf = res & 1 != 0;
                    self.eflags
                        .set(Eflags::OF, cf != (res & w.sign_bit() != 0));
                }
                res
            }
            // ROR
            1 => {
                let c = count % bits;
                let res = if c == 0 {
                    a
                } else {
                    ((a >> c) | (a << (bits - c))) & w.mask()
                };
                self.eflags.set(Eflags::CF, res & w.sign_bit() != 0);
                if count == 1 {
                    let top = res & w.sign_bit() != 0;
                    let next = res & (w.sign_bit() >> 1) != 0;
                    self.eflags.set(Eflags::OF, top != next);
                }
                res
            }
            // SHL (4 and its undocumented alias 6)
            4 | 6 => {
                let res = if count >= bits { 0 } else { (a << count) & w.mask() };
                let cf = if count <= bits {
                    (a >> (bits - count)) & 1 != 0
                } else {
                    false
                };
                self.eflags.set(Eflags::CF, cf);
                if count == 1 {
                    self.eflags
                        .set(Eflags::OF, cf != (res & w.sign_bit() != 0));
                }
                self.set_szp(res, w);
                res
            }
            // SHR
            5 => {
                let res = if count >= bits { 0 } else { a >> count };
                let cf = if count <= bits {
                    (a >> (count - 1)) & 1 != 0
                } else {
                    false
                };
                self.eflags.set(Eflags::CF, cf);
                if count == 1 {
                    self.eflags.set(Eflags::OF, a & w.sign_bit() != 0);
                }
                self.set_szp(res, w);
                res
            }
            // SAR
            7 => {
                let signed = w.sign_extend(a) as i32;
                let shift = count.min(31);
                let res = (signed >> shift) as u32 & w.mask();
                self.eflags
                    .set(Eflags::CF, (signed >> (shift - 1).min(31)) & 1 != 0);
                if count == 1 {
                    self.eflags.remove(Eflags::OF);
                }
                self.set_szp(res, w);
                res
            }
            // RCL/RCR are not generated by the compilers this emulator targets
            _ => {
                return Err(CpuFault::UnknownOpcode {
                    opcode: 0xC000 | ext as u16,
                    eip: start_eip,
                })
            }
        };
        self.write_op(mem, rm, w, res)
    }

    /// SHLD/SHRD (double-precision shifts, 32-bit only)
    fn exec_shiftd(
        &mut self,
        mem: &mut VirtualMemory,
        rm: Operand,
        r: usize,
        count: u8,
        right: bool,
    ) -> Result<(), CpuFault> {
        let count = (count & 0x1F) as u32;
        if count == 0 {
            return Ok(());
        }
        let a = self.read_op(mem, rm, Width::Dword)?;
        let b = self.regs[r];
        let (res, cf) = if right {
            (
                (a >> count) | (b << (32 - count)),
                (a >> (count - 1)) & 1 != 0,
            )
        } else {
            (
                (a << count) | (b >> (32 - count)),
                (a >> (32 - count)) & 1 != 0,
            )
        };
        self.eflags.set(Eflags::CF, cf);
        self.set_szp(res, Width::Dword);
        self.write_op(mem, rm, Width::Dword, res)
    }

    // ========================================================================
    // String operations
    // ========================================================================

    #[inline]
    fn string_delta(&self, w: Width) -> u32 {
        if self.eflags.contains(Eflags::DF) {
            (w.bytes() as i32).wrapping_neg() as u32
        } else {
            w.bytes()
        }
    }

    fn exec_movs(
        &mut self,
        mem: &mut VirtualMemory,
        w: Width,
        pfx: Prefixes,
    ) -> Result<(), CpuFault> {
        let d = self.string_delta(w);
        let once = |cpu: &mut Cpu, mem: &mut VirtualMemory| -> Result<(), CpuFault> {
            let v = cpu.read_op(mem, Operand::Mem(cpu.regs[reg::ESI]), w)?;
            cpu.write_op(mem, Operand::Mem(cpu.regs[reg::EDI]), w, v)?;
            cpu.regs[reg::ESI] = cpu.regs[reg::ESI].wrapping_add(d);
            cpu.regs[reg::EDI] = cpu.regs[reg::EDI].wrapping_add(d);
            Ok(())
        };
        if pfx.rep.is_some() {
            while self.regs[reg::ECX] != 0 {
                once(self, mem)?;
                self.regs[reg::ECX] = self.regs[reg::ECX].wrapping_sub(1);
            }
        } else {
            once(self, mem)?;
        }
        Ok(())
    }

    fn exec_stos(
        &mut self,
        mem: &mut VirtualMemory,
        w: Width,
        pfx: Prefixes,
    ) -> Result<(), CpuFault> {
        let d = self.string_delta(w);
        let v = self.read_reg(reg::EAX, w);
        let once = |cpu: &mut Cpu, mem: &mut VirtualMemory| -> Result<(), CpuFault> {
            cpu.write_op(mem, Operand::Mem(cpu.regs[reg::EDI]), w, v)?;
            cpu.regs[reg::EDI] = cpu.regs[reg::EDI].wrapping_add(d);
            Ok(())
        };
        if pfx.rep.is_some() {
            while self.regs[reg::ECX] != 0 {
                once(self, mem)?;
                self.regs[reg::ECX] = self.regs[reg::ECX].wrapping_sub(1);
            }
        } else {
            once(self, mem)?;
        }
        Ok(())
    }

    fn exec_lods(
        &mut self,
        mem: &mut VirtualMemory,
        w: Width,
        pfx: Prefixes,
    ) -> Result<(), CpuFault> {
        let d = self.string_delta(w);
        // REP LODS is legal but degenerate; run the iterations anyway
        let count = if pfx.rep.is_some() {
            core::mem::replace(&mut self.regs[reg::ECX], 0)
        } else {
            1
        };
        for _ in 0..count {
            let v = self.read_op(mem, Operand::Mem(self.regs[reg::ESI]), w)?;
            self.write_reg(reg::EAX, w, v);
            self.regs[reg::ESI] = self.regs[reg::ESI].wrapping_add(d);
        }
        Ok(())
    }

    fn exec_scas(
        &mut self,
        mem: &mut VirtualMemory,
        w: Width,
        pfx: Prefixes,
    ) -> Result<(), CpuFault> {
        let d = self.string_delta(w);
        let a = self.read_reg(reg::EAX, w);
        let once = |cpu: &mut Cpu, mem: &mut VirtualMemory| -> Result<(), CpuFault> {
            let b = cpu.read_op(mem, Operand::Mem(cpu.regs[reg::EDI]), w)?;
            cpu.flag_sub(a, b, 0, w);
            cpu.regs[reg::EDI] = cpu.regs[reg::EDI].wrapping_add(d);
            Ok(())
        };
        match pfx.rep {
            None => once(self, mem)?,
            Some(rep) => {
                while self.regs[reg::ECX] != 0 {
                    once(self, mem)?;
                    self.regs[reg::ECX] = self.regs[reg::ECX].wrapping_sub(1);
                    let zf = self.eflags.contains(Eflags::ZF);
                    match rep {
                        Rep::Rep if !zf => break,
                        Rep::RepNe if zf => break,
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn exec_cmps(
        &mut self,
        mem: &mut VirtualMemory,
        w: Width,
        pfx: Prefixes,
    ) -> Result<(), CpuFault> {
        let d = self.string_delta(w);
        let once = |cpu: &mut Cpu, mem: &mut VirtualMemory| -> Result<(), CpuFault> {
            let a = cpu.read_op(mem, Operand::Mem(cpu.regs[reg::ESI]), w)?;
            let b = cpu.read_op(mem, Operand::Mem(cpu.regs[reg::EDI]), w)?;
            cpu.flag_sub(a, b, 0, w);
            cpu.regs[reg::ESI] = cpu.regs[reg::ESI].wrapping_add(d);
            cpu.regs[reg::EDI] = cpu.regs[reg::EDI].wrapping_add(d);
            Ok(())
        };
        match pfx.rep {
            None => once(self, mem)?,
            Some(rep) => {
                while self.regs[reg::ECX] != 0 {
                    once(self, mem)?;
                    self.regs[reg::ECX] = self.regs[reg::ECX].wrapping_sub(1);
                    let zf = self.eflags.contains(Eflags::ZF);
                    match rep {
                        Rep::Rep if !zf => break,
                        Rep::RepNe if zf => break,
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::VirtualMemory;

    fn run(code: &[u8], setup: impl FnOnce(&mut Cpu, &mut VirtualMemory)) -> (Cpu, VirtualMemory) {
        let mut mem = VirtualMemory::new(0x2_0000);
        mem.load(0x1000, code).unwrap();
        let mut cpu = Cpu::new();
        cpu.eip = 0x1000;
        cpu.regs[reg::ESP] = 0x1_0000;
        setup(&mut cpu, &mut mem);
        loop {
            cpu.step(&mut mem).unwrap();
            if cpu.eip >= 0x1000 + code.len() as u32 || cpu.eip < 0x1000 {
                break;
            }
        }
        (cpu, mem)
    }

    #[test]
    fn test_add_carry_and_overflow() {
        // add eax, ebx
        let (cpu, _) = run(&[0x01, 0xD8], |c, _| {
            c.regs[reg::EAX] = 0xFFFF_FFFF;
            c.regs[reg::EBX] = 1;
        });
        assert_eq!(cpu.regs[reg::EAX], 0);
        assert!(cpu.eflags.contains(Eflags::CF));
        assert!(cpu.eflags.contains(Eflags::ZF));
        assert!(!cpu.eflags.contains(Eflags::OF));

        let (cpu, _) = run(&[0x01, 0xD8], |c, _| {
            c.regs[reg::EAX] = 0x7FFF_FFFF;
            c.regs[reg::EBX] = 1;
        });
        assert!(cpu.eflags.contains(Eflags::OF));
        assert!(cpu.eflags.contains(Eflags::SF));
        assert!(!cpu.eflags.contains(Eflags::CF));
    }

    #[test]
    fn test_sub_borrow() {
        // sub eax, ebx
        let (cpu, _) = run(&[0x29, 0xD8], |c, _| {
            c.regs[reg::EAX] = 0;
            c.regs[reg::EBX] = 1;
        });
        assert_eq!(cpu.regs[reg::EAX], 0xFFFF_FFFF);
        assert!(cpu.eflags.contains(Eflags::CF));
        assert!(cpu.eflags.contains(Eflags::SF));
    }

    #[test]
    fn test_parity_low_byte_only() {
        // xor eax, eax; add eax, 0x103 (low byte 0x03: two bits, even parity)
        let (cpu, _) = run(&[0x31, 0xC0, 0x05, 0x03, 0x01, 0x00, 0x00], |_, _| {});
        assert!(cpu.eflags.contains(Eflags::PF));
    }

    #[test]
    fn test_inc_preserves_carry() {
        // stc; inc eax
        let (cpu, _) = run(&[0xF9, 0x40], |c, _| {
            c.regs[reg::EAX] = 5;
        });
        assert_eq!(cpu.regs[reg::EAX], 6);
        assert!(cpu.eflags.contains(Eflags::CF));
    }

    #[test]
    fn test_neg_sets_carry_for_nonzero() {
        // neg eax
        let (cpu, _) = run(&[0xF7, 0xD8], |c, _| {
            c.regs[reg::EAX] = 2;
        });
        assert_eq!(cpu.regs[reg::EAX], 0xFFFF_FFFE);
        assert!(cpu.eflags.contains(Eflags::CF));
    }

    #[test]
    fn test_mul_div_round_trip() {
        // mul ecx (EDX:EAX = EAX * ECX), then div ecx
        let (cpu, _) = run(&[0xF7, 0xE1, 0xF7, 0xF1], |c, _| {
            c.regs[reg::EAX] = 0x1234_5678;
            c.regs[reg::ECX] = 0x9ABC;
        });
        assert_eq!(cpu.regs[reg::EAX], 0x1234_5678);
        assert_eq!(cpu.regs[reg::EDX], 0);
    }

    #[test]
    fn test_idiv_signed() {
        // cdq; idiv ecx: -7 / 2 = -3 rem -1
        let (cpu, _) = run(&[0x99, 0xF7, 0xF9], |c, _| {
            c.regs[reg::EAX] = (-7i32) as u32;
            c.regs[reg::ECX] = 2;
        });
        assert_eq!(cpu.regs[reg::EAX] as i32, -3);
        assert_eq!(cpu.regs[reg::EDX] as i32, -1);
    }

    #[test]
    fn test_divide_by_zero_faults() {
        let mut mem = VirtualMemory::new(0x2000);
        mem.load(0x100, &[0xF7, 0xF1]).unwrap(); // div ecx
        let mut cpu = Cpu::new();
        cpu.eip = 0x100;
        assert_eq!(
            cpu.step(&mut mem),
            Err(CpuFault::DivideError { eip: 0x100 })
        );
    }

    #[test]
    fn test_shl_shr_sar() {
        // shl eax, 4 ; shr ebx, 1 ; sar ecx, 2
        let (cpu, _) = run(
            &[0xC1, 0xE0, 0x04, 0xD1, 0xEB, 0xC1, 0xF9, 0x02],
            |c, _| {
                c.regs[reg::EAX] = 0x1234_5678;
                c.regs[reg::EBX] = 0x3;
                c.regs[reg::ECX] = (-6i32) as u32;
            },
        );
        assert_eq!(cpu.regs[reg::EAX], 0x2345_6780);
        assert_eq!(cpu.regs[reg::EBX], 1);
        assert!(cpu.eflags.contains(Eflags::CF)); // SAR shifted a 1 out last
        assert_eq!(cpu.regs[reg::ECX] as i32, -2);
    }

    #[test]
    fn test_rol_ror() {
        // rol eax, 8 ; ror ebx, 4
        let (cpu, _) = run(&[0xC1, 0xC0, 0x08, 0xC1, 0xCB, 0x04], |c, _| {
            c.regs[reg::EAX] = 0x1234_5678;
            c.regs[reg::EBX] = 0x0000_000F;
        });
        assert_eq!(cpu.regs[reg::EAX], 0x3456_7812);
        assert_eq!(cpu.regs[reg::EBX], 0xF000_0000);
    }

    #[test]
    fn test_signed_jumps() {
        // cmp eax, ebx; jl +2; mov cl, 1; (target) mov dl, 1
        let code = [0x39, 0xD8, 0x7C, 0x02, 0xB1, 0x01, 0xB2, 0x01];
        let (cpu, _) = run(&code, |c, _| {
            c.regs[reg::EAX] = (-5i32) as u32;
            c.regs[reg::EBX] = 3;
        });
        // JL taken: CL untouched, DL written
        assert_eq!(cpu.regs[reg::ECX] & 0xFF, 0);
        assert_eq!(cpu.regs[reg::EDX] & 0xFF, 1);
    }

    #[test]
    fn test_rep_movsd() {
        let (_, mem) = run(&[0xF3, 0xA5], |c, m| {
            c.regs[reg::ESI] = 0x4000;
            c.regs[reg::EDI] = 0x5000;
            c.regs[reg::ECX] = 3;
            m.write32(0x4000, 0x11).unwrap();
            m.write32(0x4004, 0x22).unwrap();
            m.write32(0x4008, 0x33).unwrap();
        });
        assert_eq!(mem.read32(0x5000).unwrap(), 0x11);
        assert_eq!(mem.read32(0x5008).unwrap(), 0x33);
    }

    #[test]
    fn test_rep_stosb_and_repne_scasb() {
        // rep stosb fills; repne scasb finds the terminator
        let (cpu, mem) = run(&[0xF3, 0xAA], |c, _| {
            c.regs[reg::EAX] = 0x41;
            c.regs[reg::EDI] = 0x4000;
            c.regs[reg::ECX] = 8;
        });
        assert_eq!(mem.read8(0x4007).unwrap(), 0x41);
        assert_eq!(cpu.regs[reg::EDI], 0x4008);

        // strlen-style scan: AL=0, string "AB\0"
        let (cpu, _) = run(&[0xF2, 0xAE], |c, m| {
            c.regs[reg::EAX] = 0;
            c.regs[reg::EDI] = 0x4100;
            c.regs[reg::ECX] = 0xFFFF_FFFF;
            m.load(0x4100, b"AB\0").unwrap();
        });
        // EDI one past the NUL, ECX decremented 3 times
        assert_eq!(cpu.regs[reg::EDI], 0x4103);
        assert_eq!(cpu.regs[reg::ECX], 0xFFFF_FFFC);
    }

    #[test]
    fn test_movzx_movsx() {
        // movzx eax, bl ; movsx edx, cl
        let (cpu, _) = run(&[0x0F, 0xB6, 0xC3, 0x0F, 0xBE, 0xD1], |c, _| {
            c.regs[reg::EBX] = 0xFF;
            c.regs[reg::ECX] = 0x80;
        });
        assert_eq!(cpu.regs[reg::EAX], 0xFF);
        assert_eq!(cpu.regs[reg::EDX], 0xFFFF_FF80);
    }

    #[test]
    fn test_setcc() {
        // cmp eax, ebx; setl al
        let (cpu, _) = run(&[0x39, 0xD8, 0x0F, 0x9C, 0xC0], |c, _| {
            c.regs[reg::EAX] = (-1i32) as u32;
            c.regs[reg::EBX] = 0;
        });
        assert_eq!(cpu.regs[reg::EAX] & 0xFF, 1);
    }

    #[test]
    fn test_pushfd_popfd_round_trip() {
        let (cpu, _) = run(&[0xF9, 0x9C, 0xF8, 0x9D], |_, _| {});
        assert!(cpu.eflags.contains(Eflags::CF));
    }

    #[test]
    fn test_operand_size_prefix_mov() {
        // 66 B8 34 12  mov ax, 0x1234
        let (cpu, _) = run(&[0x66, 0xB8, 0x34, 0x12], |c, _| {
            c.regs[reg::EAX] = 0xAABB_0000;
        });
        assert_eq!(cpu.regs[reg::EAX], 0xAABB_1234);
    }

    #[test]
    fn test_leave() {
        let (cpu, _) = run(&[0xC9], |c, m| {
            c.regs[reg::EBP] = 0x9000;
            m.write32(0x9000, 0x1234).unwrap();
        });
        assert_eq!(cpu.regs[reg::ESP], 0x9004);
        assert_eq!(cpu.regs[reg::EBP], 0x1234);
    }

    #[test]
    fn test_xchg_and_bswap() {
        // xchg eax, ecx ; bswap eax
        let (cpu, _) = run(&[0x91, 0x0F, 0xC8], |c, _| {
            c.regs[reg::EAX] = 1;
            c.regs[reg::ECX] = 0x1122_3344;
        });
        assert_eq!(cpu.regs[reg::EAX], 0x4433_2211);
        assert_eq!(cpu.regs[reg::ECX], 1);
    }

    proptest::proptest! {
        /// ADD then SUB round-trips, and flags after each op follow the
        /// mathematical definitions.
        #[test]
        fn prop_add_sub_round_trip(a: u32, b: u32) {
            let mut cpu = Cpu::new();
            let sum = cpu.flag_add(a, b, 0, Width::Dword);
            proptest::prop_assert_eq!(sum, a.wrapping_add(b));
            proptest::prop_assert_eq!(
                cpu.eflags.contains(Eflags::CF),
                (a as u64 + b as u64) > u32::MAX as u64
            );
            proptest::prop_assert_eq!(cpu.eflags.contains(Eflags::ZF), sum == 0);
            proptest::prop_assert_eq!(cpu.eflags.contains(Eflags::SF), sum & 0x8000_0000 != 0);
            proptest::prop_assert_eq!(
                cpu.eflags.contains(Eflags::PF),
                (sum as u8).count_ones() % 2 == 0
            );
            let of = (!(a ^ b) & (a ^ sum)) & 0x8000_0000 != 0;
            proptest::prop_assert_eq!(cpu.eflags.contains(Eflags::OF), of);

            let back = cpu.flag_sub(sum, b, 0, Width::Dword);
            proptest::prop_assert_eq!(back, a);
        }
    }
}
