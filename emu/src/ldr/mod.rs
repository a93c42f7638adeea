//! Loader (ldr)
//!
//! The loader parses PE/COFF images and materializes them in the guest
//! address space:
//!
//! - Parsing headers, the section table, and every data directory
//! - RVA <-> file offset translation
//! - Copying sections to `ImageBase + VirtualAddress`
//! - Applying base relocations when the preferred base is unavailable
//! - Handing out non-overlapping base addresses for imported DLLs
//! - Keeping the address -> module map used by fault diagnostics
//!
//! Directory parsing is deliberately tolerant: a truncated buffer or an
//! unresolvable RVA makes the directory parse as *empty* rather than fail,
//! so a damaged image can still be inspected. Header parsing is strict.

pub mod directories;
pub mod loader;
pub mod pe;

pub use directories::{
    BoundImport, ExportEntry, ExportTable, ImportDescriptor, ImportEntry, ImportTarget,
    RelocationBlock, RelocationEntry, TlsInfo,
};
pub use loader::{layout, DllBaseAllocator, ModuleMap};
pub use pe::*;

use bytemuck::AnyBitPattern;
use core::fmt;

/// PE parsing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeError {
    /// Missing or damaged "MZ" header
    InvalidDosHeader,
    /// Missing "PE\0\0" signature
    InvalidPeSignature,
    /// Optional header absent or wrong magic
    InvalidOptionalHeader,
    /// Machine type other than i386
    UnsupportedMachine(u16),
    /// File ends before the headers do
    Truncated,
}

impl fmt::Display for PeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeError::InvalidDosHeader => write!(f, "invalid DOS header"),
            PeError::InvalidPeSignature => write!(f, "invalid PE signature"),
            PeError::InvalidOptionalHeader => write!(f, "invalid optional header"),
            PeError::UnsupportedMachine(m) => {
                write!(f, "unsupported machine type {m:#06x} (need i386)")
            }
            PeError::Truncated => write!(f, "file truncated inside headers"),
        }
    }
}

/// A parsed PE32 image
///
/// Owns the file bytes; every header is decoded once at parse time and the
/// directory walkers read the raw data on demand.
#[derive(Debug)]
pub struct PeImage {
    data: Vec<u8>,
    /// DOS header
    pub dos: ImageDosHeader,
    /// COFF file header
    pub file_header: ImageFileHeader,
    /// PE32 optional header
    pub optional_header: ImageOptionalHeader32,
    /// Section table in file order
    pub sections: Vec<ImageSectionHeader>,
}

impl PeImage {
    /// Parse a PE32 i386 image from a byte buffer
    pub fn parse(data: Vec<u8>) -> Result<Self, PeError> {
        let dos: ImageDosHeader =
            read_struct(&data, 0).ok_or(PeError::InvalidDosHeader)?;
        if !dos.is_valid() {
            return Err(PeError::InvalidDosHeader);
        }

        let pe_off = dos.e_lfanew as usize;
        let signature: u32 = read_struct(&data, pe_off).ok_or(PeError::InvalidPeSignature)?;
        if signature != IMAGE_NT_SIGNATURE {
            return Err(PeError::InvalidPeSignature);
        }

        let file_header: ImageFileHeader =
            read_struct(&data, pe_off + 4).ok_or(PeError::Truncated)?;
        if file_header.machine != machine_type::IMAGE_FILE_MACHINE_I386 {
            return Err(PeError::UnsupportedMachine(file_header.machine));
        }

        // The optional header can legally carry fewer than 16 directory
        // slots; widen it into a zeroed full-size buffer before decoding.
        let opt_off = pe_off + 4 + core::mem::size_of::<ImageFileHeader>();
        let opt_len = file_header.size_of_optional_header as usize;
        if opt_len < 2 {
            return Err(PeError::InvalidOptionalHeader);
        }
        let avail = data
            .get(opt_off..opt_off + opt_len)
            .ok_or(PeError::Truncated)?;
        let mut widened = [0u8; core::mem::size_of::<ImageOptionalHeader32>()];
        let n = avail.len().min(widened.len());
        widened[..n].copy_from_slice(&avail[..n]);
        let optional_header: ImageOptionalHeader32 = bytemuck::pod_read_unaligned(&widened);
        if optional_header.magic != IMAGE_NT_OPTIONAL_HDR32_MAGIC {
            return Err(PeError::InvalidOptionalHeader);
        }

        let mut sections = Vec::with_capacity(file_header.number_of_sections as usize);
        let mut sec_off = opt_off + opt_len;
        for _ in 0..file_header.number_of_sections {
            let sec: ImageSectionHeader =
                read_struct(&data, sec_off).ok_or(PeError::Truncated)?;
            sections.push(sec);
            sec_off += core::mem::size_of::<ImageSectionHeader>();
        }

        Ok(Self {
            data,
            dos,
            file_header,
            optional_header,
            sections,
        })
    }

    /// The raw file bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Preferred load address
    pub fn image_base(&self) -> u32 {
        self.optional_header.image_base
    }

    /// Entry point RVA
    pub fn entry_point(&self) -> u32 {
        self.optional_header.address_of_entry_point
    }

    /// Translate an RVA to a file offset
    ///
    /// The addressable extent of a section is
    /// `max(VirtualSize, SizeOfRawData)`; RVAs below `SizeOfHeaders` map to
    /// themselves (headers are mapped 1:1).
    pub fn rva_to_offset(&self, rva: u32) -> Option<u32> {
        for sec in &self.sections {
            let start = sec.virtual_address;
            let end = start.checked_add(sec.effective_size())?;
            if rva >= start && rva < end {
                return Some(sec.pointer_to_raw_data + (rva - start));
            }
        }
        if rva < self.optional_header.size_of_headers {
            return Some(rva);
        }
        None
    }

    /// Translate a file offset back to an RVA (inverse of [`rva_to_offset`])
    ///
    /// [`rva_to_offset`]: PeImage::rva_to_offset
    pub fn offset_to_rva(&self, offset: u32) -> Option<u32> {
        for sec in &self.sections {
            let start = sec.pointer_to_raw_data;
            let end = start.checked_add(sec.effective_size())?;
            if offset >= start && offset < end {
                return Some(sec.virtual_address + (offset - start));
            }
        }
        if offset < self.optional_header.size_of_headers {
            return Some(offset);
        }
        None
    }

    /// Fetch a data directory by index
    ///
    /// Slots past `NumberOfRvaAndSizes` and zero RVA/size slots are absent.
    /// Index 4 (certificate table) holds a file offset, not an RVA; callers
    /// of that slot must not translate it.
    pub fn directory(&self, index: usize) -> Option<ImageDataDirectory> {
        if index >= IMAGE_NUMBEROF_DIRECTORY_ENTRIES
            || index >= self.optional_header.number_of_rva_and_sizes as usize
        {
            return None;
        }
        let dir = self.optional_header.data_directory[index];
        dir.is_present().then_some(dir)
    }

    /// Raw data of a section, clamped to what the file actually holds
    pub fn section_data(&self, sec: &ImageSectionHeader) -> &[u8] {
        let start = sec.pointer_to_raw_data as usize;
        let len = sec.size_of_raw_data as usize;
        let end = (start + len).min(self.data.len());
        self.data.get(start.min(end)..end).unwrap_or(&[])
    }

    /// Decode a POD structure at an RVA
    pub(crate) fn struct_at_rva<T: AnyBitPattern>(&self, rva: u32) -> Option<T> {
        let off = self.rva_to_offset(rva)? as usize;
        read_struct(&self.data, off)
    }

    /// Read a u32 at an RVA
    pub(crate) fn u32_at_rva(&self, rva: u32) -> Option<u32> {
        self.struct_at_rva::<u32>(rva)
    }

    /// Read a u16 at an RVA
    pub(crate) fn u16_at_rva(&self, rva: u32) -> Option<u16> {
        self.struct_at_rva::<u16>(rva)
    }

    /// Read a zero-terminated ASCII string at an RVA
    pub(crate) fn cstr_at_rva(&self, rva: u32) -> Option<String> {
        let off = self.rva_to_offset(rva)? as usize;
        let tail = self.data.get(off..)?;
        let len = tail.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&tail[..len]).into_owned())
    }
}

/// Decode a POD structure from a byte buffer at `offset`
fn read_struct<T: AnyBitPattern>(buf: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(core::mem::size_of::<T>())?;
    let slice = buf.get(offset..end)?;
    Some(bytemuck::pod_read_unaligned(slice))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::PeBuilder;

    #[test]
    fn test_reject_non_mz() {
        let err = PeImage::parse(vec![0u8; 0x100]).unwrap_err();
        assert_eq!(err, PeError::InvalidDosHeader);
    }

    #[test]
    fn test_reject_amd64() {
        let bytes = PeBuilder::new()
            .machine(machine_type::IMAGE_FILE_MACHINE_AMD64)
            .build();
        let err = PeImage::parse(bytes).unwrap_err();
        assert_eq!(err, PeError::UnsupportedMachine(0x8664));
    }

    #[test]
    fn test_parse_minimal_image() {
        let bytes = PeBuilder::new().build();
        let image = PeImage::parse(bytes).unwrap();
        assert_eq!(image.image_base(), 0x0040_0000);
        assert_eq!(image.sections.len(), 2);
        assert_eq!(image.sections[0].name_str(), ".text");
    }

    #[test]
    fn test_rva_to_offset_round_trip() {
        let bytes = PeBuilder::new().build();
        let image = PeImage::parse(bytes).unwrap();
        // Inside .text
        let off = image.rva_to_offset(0x1010).unwrap();
        assert_eq!(image.offset_to_rva(off).unwrap(), 0x1010);
        // Headers map 1:1
        assert_eq!(image.rva_to_offset(0x40).unwrap(), 0x40);
        // Far outside everything
        assert_eq!(image.rva_to_offset(0x00F0_0000), None);
    }

    #[test]
    fn test_absent_directory_is_none() {
        let bytes = PeBuilder::new().build();
        let image = PeImage::parse(bytes).unwrap();
        assert!(image
            .directory(pe::directory_entry::IMAGE_DIRECTORY_ENTRY_EXPORT)
            .is_none());
    }

    proptest::proptest! {
        #[test]
        fn prop_rva_offset_bijection(delta in 0u32..0x180) {
            let bytes = PeBuilder::new().build();
            let image = PeImage::parse(bytes).unwrap();
            // Any RVA within .text's effective range survives the round trip.
            let rva = 0x1000 + delta;
            if let Some(off) = image.rva_to_offset(rva) {
                proptest::prop_assert_eq!(image.offset_to_rva(off), Some(rva));
            }
        }
    }
}
