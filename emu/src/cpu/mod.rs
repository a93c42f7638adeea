//! IA-32 interpreter (cpu)
//!
//! A straight-line decode-and-execute interpreter for the i386 user-mode
//! subset an MSVC-compiled program exercises: the integer ALU, the MOV
//! family, control flow, stack operations, segment-prefixed access through
//! FS/GS, string instructions, and the x87 FPU.
//!
//! One call to [`Cpu::step`] fetches, decodes, and retires exactly one
//! instruction. Faults never unwind through the host: they come back as
//! [`CpuFault`] values carrying the faulting EIP, and software interrupts
//! come back as [`Event::Interrupt`] for the embedder to dispatch. The
//! interpreter has three observable states:
//!
//! ```text
//! Running ──ExitProcess/sentinel──► Halted
//!    │
//!    └──fault surfaced to embedder──► Faulted
//! ```
//!
//! Both transitions are one-way unless the embedder resets the state, which
//! the cooperative scheduler does when it swaps thread contexts in and out.

mod fpu;
mod ops;

pub use fpu::Fpu;

use crate::mm::{OutOfRange, VirtualMemory};
use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// EFLAGS register
    ///
    /// Only the arithmetic and control bits the interpreter models; bit 1
    /// is architecturally always set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eflags: u32 {
        /// Carry
        const CF = 1 << 0;
        /// Parity (low byte even)
        const PF = 1 << 2;
        /// Auxiliary carry (BCD nibble)
        const AF = 1 << 4;
        /// Zero
        const ZF = 1 << 6;
        /// Sign
        const SF = 1 << 7;
        /// Trap
        const TF = 1 << 8;
        /// Interrupt enable
        const IF = 1 << 9;
        /// Direction (string ops decrement)
        const DF = 1 << 10;
        /// Overflow
        const OF = 1 << 11;
    }
}

/// General register indices in Intel encoding order
pub mod reg {
    /// Accumulator
    pub const EAX: usize = 0;
    /// Counter
    pub const ECX: usize = 1;
    /// Data
    pub const EDX: usize = 2;
    /// Base
    pub const EBX: usize = 3;
    /// Stack pointer
    pub const ESP: usize = 4;
    /// Frame pointer
    pub const EBP: usize = 5;
    /// Source index
    pub const ESI: usize = 6;
    /// Destination index
    pub const EDI: usize = 7;
}

/// Register file names for diagnostics, encoding order
pub const REG_NAMES: [&str; 8] = ["EAX", "ECX", "EDX", "EBX", "ESP", "EBP", "ESI", "EDI"];

/// What a successfully retired instruction produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Ordinary instruction, nothing for the embedder
    None,
    /// `INT imm8` (or `INT3`) was executed; EIP points at the next byte
    Interrupt(u8),
}

/// A fault the guest raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuFault {
    /// Memory access outside guest bounds
    OutOfRange {
        /// Offending guest address
        addr: u32,
    },
    /// Byte pattern the decoder does not implement
    UnknownOpcode {
        /// Opcode (two-byte opcodes as 0x0Fxx)
        opcode: u16,
        /// EIP of the instruction start
        eip: u32,
    },
    /// DIV/IDIV by zero or quotient overflow
    DivideError {
        /// EIP of the instruction start
        eip: u32,
    },
}

impl fmt::Display for CpuFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuFault::OutOfRange { addr } => {
                write!(f, "memory access out of range at {addr:#010x}")
            }
            CpuFault::UnknownOpcode { opcode, eip } => {
                write!(f, "unknown opcode {opcode:#06x} at EIP {eip:#010x}")
            }
            CpuFault::DivideError { eip } => write!(f, "divide error at EIP {eip:#010x}"),
        }
    }
}

impl From<OutOfRange> for CpuFault {
    fn from(e: OutOfRange) -> Self {
        CpuFault::OutOfRange { addr: e.addr }
    }
}

/// Segment override carried by a prefix byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Seg {
    Fs,
    Gs,
}

/// REP/REPNE prefix state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rep {
    Rep,
    RepNe,
}

/// Decoded instruction prefixes
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Prefixes {
    pub seg: Option<Seg>,
    pub operand_size: bool,
    pub rep: Option<Rep>,
}

/// Operand widths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    #[inline]
    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }

    #[inline]
    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extend a value of this width to 32 bits
    #[inline]
    pub fn sign_extend(self, v: u32) -> u32 {
        match self {
            Width::Byte => v as u8 as i8 as i32 as u32,
            Width::Word => v as u16 as i16 as i32 as u32,
            Width::Dword => v,
        }
    }
}

/// A decoded ModR/M operand
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operand {
    /// Register by encoding index
    Reg(usize),
    /// Guest memory at an effective address (segment base applied)
    Mem(u32),
}

/// The interpreter state
#[derive(Debug, Clone)]
pub struct Cpu {
    /// General registers, Intel encoding order
    pub regs: [u32; 8],
    /// Instruction pointer
    pub eip: u32,
    /// Flags
    pub eflags: Eflags,
    /// FS segment base (points at the TEB)
    pub fs_base: u32,
    /// GS segment base (equals FS base unless retargeted)
    pub gs_base: u32,
    /// x87 state
    pub fpu: Fpu,
    /// Set by ExitProcess/ExitThread/fatal faults; stops the run loop
    pub halted: bool,
    /// Retired instruction counter (feeds RDTSC)
    pub tsc: u64,
}

impl Cpu {
    /// Power-on state: everything zero, IF set
    pub fn new() -> Self {
        Self {
            regs: [0; 8],
            eip: 0,
            eflags: Eflags::IF,
            fs_base: 0,
            gs_base: 0,
            fpu: Fpu::default(),
            halted: false,
            tsc: 0,
        }
    }

    /// Fetch, execute, and retire one instruction
    pub fn step(&mut self, mem: &mut VirtualMemory) -> Result<Event, CpuFault> {
        if self.halted {
            return Ok(Event::None);
        }
        let start_eip = self.eip;
        let mut pfx = Prefixes::default();
        let mut prefix_count = 0;
        let opcode = loop {
            let b = self.fetch8(mem)?;
            match b {
                0x66 => pfx.operand_size = true,
                0x64 => pfx.seg = Some(Seg::Fs),
                0x65 => pfx.seg = Some(Seg::Gs),
                0xF2 => pfx.rep = Some(Rep::RepNe),
                0xF3 => pfx.rep = Some(Rep::Rep),
                // CS/SS/DS/ES overrides are meaningless in a flat space
                0x2E | 0x36 | 0x3E | 0x26 => {}
                _ => break b,
            }
            prefix_count += 1;
            if prefix_count > 14 {
                return Err(CpuFault::UnknownOpcode {
                    opcode: b as u16,
                    eip: start_eip,
                });
            }
        };
        let event = self.execute(mem, opcode, pfx, start_eip)?;
        self.tsc = self.tsc.wrapping_add(1);
        Ok(event)
    }

    // ========================================================================
    // Fetch
    // ========================================================================

    #[inline]
    pub(crate) fn fetch8(&mut self, mem: &VirtualMemory) -> Result<u8, CpuFault> {
        let b = mem.read8(self.eip)?;
        self.eip = self.eip.wrapping_add(1);
        Ok(b)
    }

    #[inline]
    pub(crate) fn fetch16(&mut self, mem: &VirtualMemory) -> Result<u16, CpuFault> {
        let v = mem.read16(self.eip)?;
        self.eip = self.eip.wrapping_add(2);
        Ok(v)
    }

    #[inline]
    pub(crate) fn fetch32(&mut self, mem: &VirtualMemory) -> Result<u32, CpuFault> {
        let v = mem.read32(self.eip)?;
        self.eip = self.eip.wrapping_add(4);
        Ok(v)
    }

    /// Fetch an immediate of the given width, zero-extended
    pub(crate) fn fetch_imm(&mut self, mem: &VirtualMemory, w: Width) -> Result<u32, CpuFault> {
        Ok(match w {
            Width::Byte => self.fetch8(mem)? as u32,
            Width::Word => self.fetch16(mem)? as u32,
            Width::Dword => self.fetch32(mem)?,
        })
    }

    // ========================================================================
    // ModR/M + SIB decode
    // ========================================================================

    /// Base address contributed by a segment override
    pub(crate) fn seg_base(&self, pfx: Prefixes) -> u32 {
        match pfx.seg {
            Some(Seg::Fs) => self.fs_base,
            Some(Seg::Gs) => self.gs_base,
            None => 0,
        }
    }

    /// Decode a ModR/M byte (and any SIB/displacement that follows)
    ///
    /// Returns `(reg_field, operand)`. The effective address already
    /// includes the segment base; pass `seg_base = 0` for LEA.
    pub(crate) fn decode_modrm(
        &mut self,
        mem: &VirtualMemory,
        seg_base: u32,
    ) -> Result<(usize, Operand), CpuFault> {
        let modrm = self.fetch8(mem)?;
        let md = modrm >> 6;
        let reg = ((modrm >> 3) & 7) as usize;
        let rm = (modrm & 7) as usize;

        if md == 3 {
            return Ok((reg, Operand::Reg(rm)));
        }

        let mut addr: u32;
        if rm == 4 {
            // SIB byte
            let sib = self.fetch8(mem)?;
            let scale = sib >> 6;
            let index = ((sib >> 3) & 7) as usize;
            let base = (sib & 7) as usize;
            // base == 101 with mod == 00 means disp32 with no base register
            addr = if base == 5 && md == 0 {
                self.fetch32(mem)?
            } else {
                self.regs[base]
            };
            if index != 4 {
                addr = addr.wrapping_add(self.regs[index] << scale);
            }
        } else if rm == 5 && md == 0 {
            // disp32 absolute, no base register
            addr = self.fetch32(mem)?;
        } else {
            addr = self.regs[rm];
        }

        match md {
            1 => {
                let d = self.fetch8(mem)? as i8 as i32 as u32;
                addr = addr.wrapping_add(d);
            }
            2 => {
                let d = self.fetch32(mem)?;
                addr = addr.wrapping_add(d);
            }
            _ => {}
        }

        Ok((reg, Operand::Mem(addr.wrapping_add(seg_base))))
    }

    // ========================================================================
    // Operand access
    // ========================================================================

    /// Read a register at a width; byte indices 4..7 address AH/CH/DH/BH
    pub(crate) fn read_reg(&self, r: usize, w: Width) -> u32 {
        match w {
            Width::Dword => self.regs[r],
            Width::Word => self.regs[r] & 0xFFFF,
            Width::Byte => {
                if r < 4 {
                    self.regs[r] & 0xFF
                } else {
                    (self.regs[r - 4] >> 8) & 0xFF
                }
            }
        }
    }

    /// Write a register at a width, preserving untouched bits
    pub(crate) fn write_reg(&mut self, r: usize, w: Width, v: u32) {
        match w {
            Width::Dword => self.regs[r] = v,
            Width::Word => self.regs[r] = (self.regs[r] & 0xFFFF_0000) | (v & 0xFFFF),
            Width::Byte => {
                if r < 4 {
                    self.regs[r] = (self.regs[r] & !0xFF) | (v & 0xFF);
                } else {
                    self.regs[r - 4] = (self.regs[r - 4] & !0xFF00) | ((v & 0xFF) << 8);
                }
            }
        }
    }

    pub(crate) fn read_op(
        &self,
        mem: &VirtualMemory,
        op: Operand,
        w: Width,
    ) -> Result<u32, CpuFault> {
        match op {
            Operand::Reg(r) => Ok(self.read_reg(r, w)),
            Operand::Mem(a) => Ok(match w {
                Width::Byte => mem.read8(a)? as u32,
                Width::Word => mem.read16(a)? as u32,
                Width::Dword => mem.read32(a)?,
            }),
        }
    }

    pub(crate) fn write_op(
        &mut self,
        mem: &mut VirtualMemory,
        op: Operand,
        w: Width,
        v: u32,
    ) -> Result<(), CpuFault> {
        match op {
            Operand::Reg(r) => {
                self.write_reg(r, w, v);
                Ok(())
            }
            Operand::Mem(a) => Ok(match w {
                Width::Byte => mem.write8(a, v as u8)?,
                Width::Word => mem.write16(a, v as u16)?,
                Width::Dword => mem.write32(a, v)?,
            }),
        }
    }

    // ========================================================================
    // Stack
    // ========================================================================

    pub(crate) fn push32(&mut self, mem: &mut VirtualMemory, v: u32) -> Result<(), CpuFault> {
        self.regs[reg::ESP] = self.regs[reg::ESP].wrapping_sub(4);
        mem.write32(self.regs[reg::ESP], v)?;
        Ok(())
    }

    pub(crate) fn pop32(&mut self, mem: &VirtualMemory) -> Result<u32, CpuFault> {
        let v = mem.read32(self.regs[reg::ESP])?;
        self.regs[reg::ESP] = self.regs[reg::ESP].wrapping_add(4);
        Ok(v)
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_with(code: &[u8]) -> (Cpu, VirtualMemory) {
        let mut mem = VirtualMemory::new(0x1_0000);
        mem.load(0, code).unwrap();
        (Cpu::new(), mem)
    }

    #[test]
    fn test_mov_imm32_scenario() {
        // S1: B8 78 56 34 12 -> EAX = 0x12345678, EIP = 5
        let (mut cpu, mut mem) = cpu_with(&[0xB8, 0x78, 0x56, 0x34, 0x12]);
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.regs[reg::EAX], 0x1234_5678);
        assert_eq!(cpu.eip, 5);
    }

    #[test]
    fn test_call_ret_scenario() {
        // S2: CALL +0x1FB at 0x1000, RET at 0x1200
        let mut mem = VirtualMemory::new(0x1_0000);
        mem.load(0x1000, &[0xE8, 0xFB, 0x01, 0x00, 0x00]).unwrap();
        mem.load(0x1200, &[0xC3]).unwrap();
        let mut cpu = Cpu::new();
        cpu.eip = 0x1000;
        cpu.regs[reg::ESP] = 0x8000;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.eip, 0x1200);
        assert_eq!(cpu.regs[reg::ESP], 0x7FFC);
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.eip, 0x1005);
        assert_eq!(cpu.regs[reg::ESP], 0x8000);
    }

    #[test]
    fn test_je_taken_and_not_taken() {
        // S3/S4: 74 20 at 0x1000
        for (zf, expected) in [(true, 0x1022u32), (false, 0x1002u32)] {
            let mut mem = VirtualMemory::new(0x1_0000);
            mem.load(0x1000, &[0x74, 0x20]).unwrap();
            let mut cpu = Cpu::new();
            cpu.eip = 0x1000;
            cpu.eflags.set(Eflags::ZF, zf);
            cpu.step(&mut mem).unwrap();
            assert_eq!(cpu.eip, expected);
        }
    }

    #[test]
    fn test_int_surfaces_event() {
        let (mut cpu, mut mem) = cpu_with(&[0xCD, 0xFE, 0xC3]);
        let ev = cpu.step(&mut mem).unwrap();
        assert_eq!(ev, Event::Interrupt(0xFE));
        // EIP rests on the RET byte, per the trampoline contract.
        assert_eq!(cpu.eip, 2);
    }

    #[test]
    fn test_unknown_opcode_reports_eip() {
        let mut mem = VirtualMemory::new(0x1_0000);
        mem.load(0x500, &[0x0F, 0x05]).unwrap(); // SYSCALL, not implemented
        let mut cpu = Cpu::new();
        cpu.eip = 0x500;
        match cpu.step(&mut mem) {
            Err(CpuFault::UnknownOpcode { opcode, eip }) => {
                assert_eq!(opcode, 0x0F05);
                assert_eq!(eip, 0x500);
            }
            other => panic!("expected unknown opcode, got {other:?}"),
        }
    }

    #[test]
    fn test_fs_prefix_uses_teb_base() {
        // 64 A1 18 00 00 00  mov eax, fs:[0x18]
        let (mut cpu, mut mem) = cpu_with(&[0x64, 0xA1, 0x18, 0x00, 0x00, 0x00]);
        cpu.fs_base = 0x3000;
        mem.write32(0x3018, 0xDEAD_BEEF).unwrap();
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.regs[reg::EAX], 0xDEAD_BEEF);
    }

    #[test]
    fn test_disp32_absolute_modrm() {
        // 8B 0D 44 33 22 00  mov ecx, [0x223344]
        let (mut cpu, mut mem) = cpu_with(&[0x8B, 0x0D, 0x44, 0x33, 0x22, 0x00]);
        mem.write32(0x0022_3344, 77).unwrap();
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.regs[reg::ECX], 77);
    }

    #[test]
    fn test_sib_disp32_only() {
        // 8B 04 25 10 20 00 00  mov eax, [0x2010] (SIB base=101, mod=00, no index)
        let (mut cpu, mut mem) = cpu_with(&[0x8B, 0x04, 0x25, 0x10, 0x20, 0x00, 0x00]);
        mem.write32(0x2010, 0x55).unwrap();
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.regs[reg::EAX], 0x55);
    }

    #[test]
    fn test_high_byte_registers() {
        let mut cpu = Cpu::new();
        cpu.regs[reg::EAX] = 0x1122_3344;
        assert_eq!(cpu.read_reg(0, Width::Byte), 0x44); // AL
        assert_eq!(cpu.read_reg(4, Width::Byte), 0x33); // AH
        cpu.write_reg(4, Width::Byte, 0xAB);
        assert_eq!(cpu.regs[reg::EAX], 0x1122_AB44);
    }
}
