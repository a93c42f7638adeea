//! Trampoline ("shim") table
//!
//! Every imported symbol gets a fixed-size slot in a reserved guest code
//! region. A slot holds `CD FE C3` (INT 0xFE; RET) padded with INT3. An
//! indirect call through a patched IAT slot lands on the INT, the
//! interpreter surfaces interrupt 0xFE with EIP resting on the RET, the host
//! looks up `EIP - 2` here, runs the handler, and the RET then returns to
//! the guest caller.
//!
//! The same three bytes can also be patched over arbitrary in-image code
//! (the CRT small-block-heap intercepts); those live in a separate map.

use crate::cpu::{reg, Cpu};
use crate::ldr::layout;
use crate::mm::{OutOfRange, VirtualMemory};
use crate::win32::ApiHandler;
use std::collections::HashMap;

/// The trampoline body: INT 0xFE; RET
pub const SHIM_CODE: [u8; 3] = [0xCD, 0xFE, 0xC3];

/// Slot padding byte
const INT3: u8 = 0xCC;

/// One registered intercept
#[derive(Clone)]
pub struct Shim {
    /// Owning DLL ("kernel32.dll"), or a pseudo module for patches
    pub dll: String,
    /// Symbol or patch label
    pub name: String,
    /// Host implementation
    pub handler: ApiHandler,
}

/// Slot table plus the in-image patch map
pub struct ShimTable {
    base: u32,
    stride: u32,
    capacity: u32,
    slots: Vec<Shim>,
    by_addr: HashMap<u32, usize>,
    patches: HashMap<u32, Shim>,
}

impl ShimTable {
    /// Table over the conventional shim region
    pub fn new() -> Self {
        Self {
            base: layout::SHIM_BASE,
            stride: layout::SHIM_STRIDE,
            capacity: layout::SHIM_CAPACITY,
            slots: Vec::new(),
            by_addr: HashMap::new(),
            patches: HashMap::new(),
        }
    }

    /// Guest address of slot `index`
    pub fn slot_addr(&self, index: usize) -> u32 {
        self.base + index as u32 * self.stride
    }

    /// Reserve a slot, emit its code, and map it to `handler`
    pub fn register(
        &mut self,
        mem: &mut VirtualMemory,
        dll: &str,
        name: &str,
        handler: ApiHandler,
    ) -> Result<u32, OutOfRange> {
        assert!(
            (self.slots.len() as u32) < self.capacity,
            "shim region exhausted"
        );
        let addr = self.slot_addr(self.slots.len());
        mem.load(addr, &SHIM_CODE)?;
        for pad in SHIM_CODE.len() as u32..self.stride {
            mem.write8(addr + pad, INT3)?;
        }
        self.by_addr.insert(addr, self.slots.len());
        self.slots.push(Shim {
            dll: dll.to_string(),
            name: name.to_string(),
            handler,
        });
        log::trace!("[W32] shim {addr:#010x} -> {dll}!{name}");
        Ok(addr)
    }

    /// Overwrite guest code at `addr` with the trampoline sequence
    ///
    /// Used for intercepting routines inside the loaded image itself; the
    /// address is specific to one binary and comes from configuration.
    pub fn patch(
        &mut self,
        mem: &mut VirtualMemory,
        addr: u32,
        name: &str,
        handler: ApiHandler,
    ) -> Result<(), OutOfRange> {
        mem.load(addr, &SHIM_CODE)?;
        self.patches.insert(
            addr,
            Shim {
                dll: "<patch>".to_string(),
                name: name.to_string(),
                handler,
            },
        );
        log::debug!("[W32] patched {addr:#010x} -> {name}");
        Ok(())
    }

    /// Find the intercept at a trampoline address
    pub fn lookup(&self, addr: u32) -> Option<&Shim> {
        if let Some(&index) = self.by_addr.get(&addr) {
            return Some(&self.slots[index]);
        }
        self.patches.get(&addr)
    }

    /// Address of an already-registered import, if any
    pub fn find_registered(&self, dll: &str, name: &str) -> Option<u32> {
        self.slots
            .iter()
            .position(|s| s.name == name && s.dll.eq_ignore_ascii_case(dll))
            .map(|i| self.slot_addr(i))
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slots are registered
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for ShimTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Read stdcall/cdecl argument `i` (zero-based) at `[ESP + 4 + 4*i]`
pub fn read_arg(cpu: &Cpu, mem: &VirtualMemory, i: u32) -> u32 {
    mem.read32(cpu.regs[reg::ESP].wrapping_add(4 + 4 * i))
        .unwrap_or_else(|err| {
            log::warn!("[W32] argument read failed: {err}");
            0
        })
}

/// stdcall epilogue: consume `arg_bytes` of caller-pushed arguments
///
/// The stack holds `[return_addr][args...]`; the return address moves up by
/// `arg_bytes` and ESP follows, so the trampoline's RET lands on the caller
/// with the arguments gone.
pub fn ret_stdcall(cpu: &mut Cpu, mem: &mut VirtualMemory, arg_bytes: u32) {
    let esp = cpu.regs[reg::ESP];
    let ret = match mem.read32(esp) {
        Ok(ret) => ret,
        Err(err) => {
            log::warn!("[W32] stdcall cleanup failed: {err}");
            return;
        }
    };
    let new_esp = esp.wrapping_add(arg_bytes);
    if let Err(err) = mem.write32(new_esp, ret) {
        log::warn!("[W32] stdcall cleanup failed: {err}");
        return;
    }
    cpu.regs[reg::ESP] = new_esp;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use crate::mm::VirtualMemory;

    fn nop_handler(_emu: &mut crate::Emulator) {}

    #[test]
    fn test_register_emits_trampoline_bytes() {
        let mut mem = VirtualMemory::new(0x40_0000);
        let mut shims = ShimTable::new();
        let a = shims
            .register(&mut mem, "kernel32.dll", "GetVersion", nop_handler)
            .unwrap();
        let b = shims
            .register(&mut mem, "kernel32.dll", "ExitProcess", nop_handler)
            .unwrap();
        assert_eq!(a, layout::SHIM_BASE);
        assert_eq!(b, layout::SHIM_BASE + layout::SHIM_STRIDE);
        assert_eq!(mem.slice(a, 3).unwrap(), &SHIM_CODE);
        assert_eq!(mem.read8(a + 3).unwrap(), 0xCC);
        assert_eq!(shims.lookup(a).unwrap().name, "GetVersion");
        assert_eq!(shims.lookup(b).unwrap().name, "ExitProcess");
        assert!(shims.lookup(a + 1).is_none());
        assert_eq!(
            shims.find_registered("KERNEL32.DLL", "ExitProcess"),
            Some(b)
        );
    }

    #[test]
    fn test_patch_arbitrary_address() {
        let mut mem = VirtualMemory::new(0x0100_0000);
        let mut shims = ShimTable::new();
        shims
            .patch(&mut mem, 0x0040_1234, "__sbh_heap_init", nop_handler)
            .unwrap();
        assert_eq!(mem.slice(0x0040_1234, 3).unwrap(), &SHIM_CODE);
        assert_eq!(shims.lookup(0x0040_1234).unwrap().name, "__sbh_heap_init");
    }

    #[test]
    fn test_stdcall_cleanup_property() {
        // [ret][arg1][arg2] with 8 bytes of args
        let mut mem = VirtualMemory::new(0x1_0000);
        let mut cpu = Cpu::new();
        cpu.regs[reg::ESP] = 0x8000;
        mem.write32(0x8000, 0x0040_1000).unwrap(); // return address
        mem.write32(0x8004, 111).unwrap();
        mem.write32(0x8008, 222).unwrap();

        assert_eq!(read_arg(&cpu, &mem, 0), 111);
        assert_eq!(read_arg(&cpu, &mem, 1), 222);

        ret_stdcall(&mut cpu, &mut mem, 8);
        assert_eq!(cpu.regs[reg::ESP], 0x8008);
        assert_eq!(mem.read32(cpu.regs[reg::ESP]).unwrap(), 0x0040_1000);
    }
}
