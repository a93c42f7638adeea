//! Image materialization
//!
//! Placing a parsed image into guest memory: section copy with zero-filled
//! virtual tails, base relocation fixup when the preferred base is taken,
//! DLL base address allocation, and the address -> module map the fault
//! reporter consults.

use super::pe::relocation_type;
use super::PeImage;
use crate::mm::{OutOfRange, VirtualMemory};

/// Fixed guest address space conventions
pub mod layout {
    /// Trampoline (shim) region base
    pub const SHIM_BASE: u32 = 0x0020_0000;
    /// Bytes per shim slot (3 bytes of code, INT3 padded)
    pub const SHIM_STRIDE: u32 = 8;
    /// Shim slots available
    pub const SHIM_CAPACITY: u32 = 0x8000;
    /// TEB address; the FS segment base points here
    pub const TEB_BASE: u32 = 0x0030_0000;
    /// PEB address
    pub const PEB_BASE: u32 = 0x0030_1000;
    /// Command line / argv / environment block
    pub const ARGS_BASE: u32 = 0x0031_0000;
    /// Process heap bump region
    pub const HEAP_BASE: u32 = 0x0400_0000;
    /// Process heap region end
    pub const HEAP_LIMIT: u32 = 0x0500_0000;
    /// VirtualAlloc bump region (64 KiB granularity)
    pub const VALLOC_BASE: u32 = 0x0500_0000;
    /// First DLL base address handed out
    pub const DLL_BASE_START: u32 = 0x1000_0000;
    /// Initial ESP of the main thread
    pub const STACK_TOP: u32 = 0x3FFF_0000;
    /// Main thread stack reserve
    pub const STACK_SIZE: u32 = 0x0010_0000;
    /// Per-worker-thread stack reserve
    pub const THREAD_STACK_SIZE: u32 = 0x0004_0000;
}

/// Address range occupied by a module
#[derive(Debug, Clone)]
pub struct ModuleRange {
    /// Load address
    pub base: u32,
    /// Mapped size
    pub size: u32,
    /// Module name ("MCITY.EXE", "kernel32.dll", ...)
    pub name: String,
}

/// Address -> module map for diagnostics and module-handle lookups
#[derive(Debug, Default)]
pub struct ModuleMap {
    entries: Vec<ModuleRange>,
}

impl ModuleMap {
    /// Record a mapped module
    pub fn insert(&mut self, base: u32, size: u32, name: &str) {
        self.entries.push(ModuleRange {
            base,
            size,
            name: name.to_string(),
        });
    }

    /// Module containing `addr`, if any
    pub fn find(&self, addr: u32) -> Option<&ModuleRange> {
        self.entries
            .iter()
            .find(|m| addr >= m.base && addr - m.base < m.size)
    }

    /// Module registered under `name` (case-insensitive)
    pub fn find_by_name(&self, name: &str) -> Option<&ModuleRange> {
        self.entries
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// All recorded modules
    pub fn iter(&self) -> impl Iterator<Item = &ModuleRange> {
        self.entries.iter()
    }
}

/// Hands out non-overlapping load ranges for imported DLLs
#[derive(Debug)]
pub struct DllBaseAllocator {
    next: u32,
}

impl DllBaseAllocator {
    /// Start allocating at the conventional DLL region
    pub fn new() -> Self {
        Self {
            next: layout::DLL_BASE_START,
        }
    }

    /// Reserve `size` bytes, 64 KiB aligned
    pub fn alloc(&mut self, size: u32) -> u32 {
        let base = self.next;
        self.next = (self.next + size + 0xFFFF) & !0xFFFF;
        base
    }
}

impl Default for DllBaseAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy every section of `image` to `base + VirtualAddress`
///
/// Raw bytes come from the file; when `VirtualSize` exceeds `SizeOfRawData`
/// the tail is zero-filled (.bss style). Headers are mapped 1:1 at `base`.
pub fn map_image(
    mem: &mut VirtualMemory,
    image: &PeImage,
    base: u32,
) -> Result<(), OutOfRange> {
    let headers = image.optional_header.size_of_headers as usize;
    let header_bytes = &image.data()[..headers.min(image.data().len())];
    mem.load(base, header_bytes)?;

    for sec in &image.sections {
        let data = image.section_data(sec);
        let dst = base.wrapping_add(sec.virtual_address);
        if !data.is_empty() {
            mem.load(dst, data)?;
        }
        if sec.virtual_size > sec.size_of_raw_data {
            let tail = dst.wrapping_add(sec.size_of_raw_data);
            mem.fill(tail, sec.virtual_size - sec.size_of_raw_data, 0)?;
        }
        log::debug!(
            "[LDR] mapped {:8} {:#010x}..{:#010x}",
            sec.name_str(),
            dst,
            dst.wrapping_add(sec.effective_size()),
        );
    }
    Ok(())
}

/// Apply HIGHLOW base relocations for a load at `base`
///
/// No-op when the image landed at its preferred address or carries no
/// relocation directory.
pub fn apply_relocations(
    mem: &mut VirtualMemory,
    image: &PeImage,
    base: u32,
) -> Result<(), OutOfRange> {
    let delta = base.wrapping_sub(image.image_base());
    if delta == 0 {
        return Ok(());
    }
    let blocks = image.relocations();
    if blocks.is_empty() && image.file_header.relocs_stripped() {
        log::warn!(
            "[LDR] image rebased to {:#010x} but relocations are stripped",
            base
        );
        return Ok(());
    }
    let mut applied = 0u32;
    for block in &blocks {
        for entry in &block.entries {
            let va = base
                .wrapping_add(block.page_rva)
                .wrapping_add(entry.offset as u32);
            match entry.kind {
                relocation_type::IMAGE_REL_BASED_HIGHLOW => {
                    let old = mem.read32(va)?;
                    mem.write32(va, old.wrapping_add(delta))?;
                    applied += 1;
                }
                other => {
                    log::warn!("[LDR] unsupported relocation type {other} at {va:#010x}");
                }
            }
        }
    }
    log::debug!("[LDR] applied {applied} relocations (delta {delta:#x})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::PeBuilder;

    #[test]
    fn test_map_copies_sections_and_zero_fills() {
        let bytes = PeBuilder::new()
            .text(&[0xB8, 0x78, 0x56, 0x34, 0x12])
            .build();
        let image = PeImage::parse(bytes).unwrap();
        let mut mem = VirtualMemory::new(0x0100_0000);
        map_image(&mut mem, &image, 0x0040_0000).unwrap();
        // Code landed at ImageBase + .text RVA.
        assert_eq!(mem.read8(0x0040_1000).unwrap(), 0xB8);
        assert_eq!(mem.read32(0x0040_1001).unwrap(), 0x1234_5678);
        // Headers mapped at base.
        assert_eq!(mem.read16(0x0040_0000).unwrap(), 0x5A4D);
    }

    #[test]
    fn test_relocation_applies_delta() {
        let bytes = PeBuilder::new()
            .text(&[0x78, 0x56, 0x34, 0x12])
            .reloc_block(0x1000, &[(3, 0)])
            .build();
        let image = PeImage::parse(bytes).unwrap();
        let mut mem = VirtualMemory::new(0x0100_0000);
        let new_base = 0x0050_0000;
        map_image(&mut mem, &image, new_base).unwrap();
        apply_relocations(&mut mem, &image, new_base).unwrap();
        let delta = new_base - 0x0040_0000;
        assert_eq!(
            mem.read32(new_base + 0x1000).unwrap(),
            0x1234_5678u32.wrapping_add(delta)
        );
    }

    #[test]
    fn test_dll_base_allocator_non_overlapping() {
        let mut alloc = DllBaseAllocator::new();
        let a = alloc.alloc(0x2_3456);
        let b = alloc.alloc(0x1000);
        assert_eq!(a, layout::DLL_BASE_START);
        assert!(b >= a + 0x2_3456);
        assert_eq!(b & 0xFFFF, 0);
    }

    #[test]
    fn test_module_map_lookup() {
        let mut map = ModuleMap::default();
        map.insert(0x0040_0000, 0x1_0000, "MCITY.EXE");
        map.insert(0x1000_0000, 0x1000, "kernel32.dll");
        assert_eq!(map.find(0x0040_8000).unwrap().name, "MCITY.EXE");
        assert!(map.find(0x0300_0000).is_none());
        assert!(map.find_by_name("KERNEL32.DLL").is_some());
    }
}
