//! Synthetic PE32 images for tests
//!
//! Builds a minimal but structurally honest PE32 i386 image in memory:
//! DOS header, COFF header, full optional header, four fixed sections
//! (.text/.data/.idata/.reloc), and optionally an import directory and a
//! base relocation block. Every offset is byte-assembled the way the on-disk
//! format demands, so the parser under test sees real field layouts.

use crate::ldr::pe::machine_type::IMAGE_FILE_MACHINE_I386;

/// RVA of .text
pub const TEXT_RVA: u32 = 0x1000;
/// RVA of .idata
pub const IDATA_RVA: u32 = 0x3000;
/// RVA of .reloc
pub const RELOC_RVA: u32 = 0x4000;
/// RVA of the import address table inside .idata
pub const IAT_RVA: u32 = IDATA_RVA + 0x60;

const FILE_ALIGN: u32 = 0x200;
const SECTION_RAW: u32 = 0x200;
const HEADERS_SIZE: u32 = 0x400;
const IMAGE_BASE: u32 = 0x0040_0000;

/// Builder for a four-section PE32 test image
pub struct PeBuilder {
    machine: u16,
    text: Vec<u8>,
    import: Option<(String, Vec<String>)>,
    export: Option<(String, Vec<(String, u32)>)>,
    relocs: Vec<(u32, Vec<(u16, u16)>)>,
}

impl PeBuilder {
    /// Empty i386 image with a NOP-filled .text
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            machine: IMAGE_FILE_MACHINE_I386,
            text: Vec::new(),
            import: None,
            export: None,
            relocs: Vec::new(),
        }
    }

    /// Override the COFF machine type
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Set the .text content (entry point is its first byte)
    pub fn text(mut self, code: &[u8]) -> Self {
        assert!(code.len() <= SECTION_RAW as usize, "test .text too large");
        self.text = code.to_vec();
        self
    }

    /// Import `names` from one DLL (at most 8, short names)
    pub fn import(mut self, dll: &str, names: &[&str]) -> Self {
        assert!(names.len() <= 8, "test import table supports 8 entries");
        self.import = Some((dll.to_string(), names.iter().map(|s| s.to_string()).collect()));
        self
    }

    /// Export `(name, rva)` pairs under `dll_name` (at most 6, short names)
    pub fn export(mut self, dll_name: &str, entries: &[(&str, u32)]) -> Self {
        assert!(entries.len() <= 6, "test export table supports 6 entries");
        self.export = Some((
            dll_name.to_string(),
            entries
                .iter()
                .map(|(n, rva)| (n.to_string(), *rva))
                .collect(),
        ));
        self
    }

    /// Add one base relocation block of raw `(type, offset)` entries
    pub fn reloc_block(mut self, page_rva: u32, entries: &[(u16, u16)]) -> Self {
        self.relocs.push((page_rva, entries.to_vec()));
        self
    }

    /// Assemble the image bytes
    pub fn build(self) -> Vec<u8> {
        let mut out = vec![0u8; (HEADERS_SIZE + 4 * SECTION_RAW) as usize];

        // DOS header: "MZ" and e_lfanew = 0x40
        out[0] = b'M';
        out[1] = b'Z';
        out[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());

        // PE signature
        out[0x40..0x44].copy_from_slice(b"PE\0\0");

        // COFF file header
        let coff = 0x44;
        out[coff..coff + 2].copy_from_slice(&self.machine.to_le_bytes());
        out[coff + 2..coff + 4].copy_from_slice(&4u16.to_le_bytes()); // sections
        out[coff + 16..coff + 18].copy_from_slice(&0xE0u16.to_le_bytes()); // opt size
        out[coff + 18..coff + 20].copy_from_slice(&0x0102u16.to_le_bytes()); // EXE, 32-bit

        // Optional header (PE32)
        let opt = 0x58;
        out[opt..opt + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
        put32(&mut out, opt + 16, TEXT_RVA); // AddressOfEntryPoint
        put32(&mut out, opt + 20, TEXT_RVA); // BaseOfCode
        put32(&mut out, opt + 28, IMAGE_BASE);
        put32(&mut out, opt + 32, 0x1000); // SectionAlignment
        put32(&mut out, opt + 36, FILE_ALIGN);
        put32(&mut out, opt + 56, 0x5000); // SizeOfImage
        put32(&mut out, opt + 60, HEADERS_SIZE);
        out[opt + 68..opt + 70].copy_from_slice(&3u16.to_le_bytes()); // CUI
        put32(&mut out, opt + 72, 0x0010_0000); // stack reserve
        put32(&mut out, opt + 76, 0x1000); // stack commit
        put32(&mut out, opt + 80, 0x0010_0000); // heap reserve
        put32(&mut out, opt + 84, 0x1000); // heap commit
        put32(&mut out, opt + 92, 16); // NumberOfRvaAndSizes

        // Section table
        let sections: [(&[u8; 8], u32, u32); 4] = [
            (b".text\0\0\0", TEXT_RVA, HEADERS_SIZE),
            (b".data\0\0\0", 0x2000, HEADERS_SIZE + SECTION_RAW),
            (b".idata\0\0", IDATA_RVA, HEADERS_SIZE + 2 * SECTION_RAW),
            (b".reloc\0\0", RELOC_RVA, HEADERS_SIZE + 3 * SECTION_RAW),
        ];
        for (i, (name, rva, raw_ptr)) in sections.iter().enumerate() {
            let h = 0x138 + i * 40;
            out[h..h + 8].copy_from_slice(&name[..]);
            put32(&mut out, h + 8, SECTION_RAW); // VirtualSize
            put32(&mut out, h + 12, *rva);
            put32(&mut out, h + 16, SECTION_RAW); // SizeOfRawData
            put32(&mut out, h + 20, *raw_ptr);
            put32(&mut out, h + 36, 0xE000_0020); // code|r|w|x
        }

        // .text content
        let text_at = HEADERS_SIZE as usize;
        out[text_at..text_at + self.text.len()].copy_from_slice(&self.text);

        // Import directory
        if let Some((dll, names)) = &self.import {
            // Directory slot 1
            put32(&mut out, opt + 104, IDATA_RVA);
            put32(&mut out, opt + 108, 40);

            let sec = (HEADERS_SIZE + 2 * SECTION_RAW) as usize;
            let ilt_rva = IDATA_RVA + 0x28;
            let name_rva = IDATA_RVA + 0x98;

            // One descriptor plus the null terminator
            put32(&mut out, sec, ilt_rva); // OriginalFirstThunk
            put32(&mut out, sec + 12, name_rva); // Name
            put32(&mut out, sec + 16, IAT_RVA); // FirstThunk

            let dll_at = sec + 0x98;
            out[dll_at..dll_at + dll.len()].copy_from_slice(dll.as_bytes());

            for (i, name) in names.iter().enumerate() {
                let hint_rva = IDATA_RVA + 0xB0 + i as u32 * 32;
                put32(&mut out, sec + 0x28 + i * 4, hint_rva); // ILT
                put32(&mut out, sec + 0x60 + i * 4, hint_rva); // IAT (unbound)
                let hn = sec + 0xB0 + i * 32;
                out[hn..hn + 2].copy_from_slice(&(i as u16).to_le_bytes());
                assert!(name.len() < 29, "test import name too long");
                out[hn + 2..hn + 2 + name.len()].copy_from_slice(name.as_bytes());
            }
        }

        // Export directory, laid out inside .data (rva 0x2000)
        if let Some((dll_name, entries)) = &self.export {
            put32(&mut out, opt + 96, 0x2000); // directory slot 0
            put32(&mut out, opt + 100, 0x200);

            let sec = (HEADERS_SIZE + SECTION_RAW) as usize;
            let n = entries.len() as u32;
            put32(&mut out, sec + 12, 0x2080); // Name
            put32(&mut out, sec + 16, 1); // Base
            put32(&mut out, sec + 20, n); // NumberOfFunctions
            put32(&mut out, sec + 24, n); // NumberOfNames
            put32(&mut out, sec + 28, 0x2028); // AddressOfFunctions
            put32(&mut out, sec + 32, 0x2040); // AddressOfNames
            put32(&mut out, sec + 36, 0x2058); // AddressOfNameOrdinals

            let dll_at = sec + 0x80;
            out[dll_at..dll_at + dll_name.len()].copy_from_slice(dll_name.as_bytes());

            for (i, (name, rva)) in entries.iter().enumerate() {
                put32(&mut out, sec + 0x28 + i * 4, *rva);
                put32(&mut out, sec + 0x40 + i * 4, 0x2090 + i as u32 * 16);
                out[sec + 0x58 + i * 2..sec + 0x5A + i * 2]
                    .copy_from_slice(&(i as u16).to_le_bytes());
                let at = sec + 0x90 + i * 16;
                assert!(name.len() < 16, "test export name too long");
                out[at..at + name.len()].copy_from_slice(name.as_bytes());
            }
        }

        // Base relocation blocks
        if !self.relocs.is_empty() {
            let sec = (HEADERS_SIZE + 3 * SECTION_RAW) as usize;
            let mut at = sec;
            for (page_rva, entries) in &self.relocs {
                let mut items = entries.clone();
                if items.len() % 2 == 1 {
                    items.push((0, 0)); // ABS pad keeps blocks dword-aligned
                }
                let size = 8 + items.len() * 2;
                put32(&mut out, at, *page_rva);
                put32(&mut out, at + 4, size as u32);
                for (i, (kind, offset)) in items.iter().copied().enumerate() {
                    let raw = (kind << 12) | (offset & 0x0FFF);
                    out[at + 8 + i * 2..at + 10 + i * 2].copy_from_slice(&raw.to_le_bytes());
                }
                at += size;
            }
            put32(&mut out, opt + 136, RELOC_RVA); // directory slot 5
            put32(&mut out, opt + 140, (at - sec) as u32);
        }

        out
    }
}

fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}
