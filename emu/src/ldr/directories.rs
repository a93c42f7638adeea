//! Data directory walkers
//!
//! Each walker turns one PE data directory into an ordered list of parsed
//! records, stopping at the all-zero terminator record where the format has
//! one. All walkers share the loader's tolerance rule: anything unresolvable
//! yields an empty (or shorter) result, never an error.

use super::pe::*;
use super::PeImage;

/// One exported symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    /// Biased ordinal (ordinal base already applied)
    pub ordinal: u32,
    /// RVA of the exported code/data
    pub rva: u32,
    /// Export name, if the symbol is named
    pub name: Option<String>,
    /// Forwarder string ("DLL.Symbol"), if the RVA points into the export directory
    pub forwarder: Option<String>,
}

/// Parsed export directory
#[derive(Debug, Clone)]
pub struct ExportTable {
    /// Name the DLL exports itself under
    pub dll_name: String,
    /// First ordinal
    pub ordinal_base: u32,
    /// Exports in address-table order
    pub entries: Vec<ExportEntry>,
}

/// Import by ordinal or by hint/name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    /// Top thunk bit set: low 16 bits are the ordinal
    Ordinal(u16),
    /// Thunk is an RVA to a hint/name record
    Named {
        /// Export-name-table hint
        hint: u16,
        /// Symbol name
        name: String,
    },
}

impl ImportTarget {
    /// Displayable symbol label ("name" or "#ordinal")
    pub fn label(&self) -> String {
        match self {
            ImportTarget::Ordinal(ord) => format!("#{ord}"),
            ImportTarget::Named { name, .. } => name.clone(),
        }
    }
}

/// One imported symbol slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    /// RVA of the IAT slot to patch
    pub iat_rva: u32,
    /// Value the file carries in that slot
    pub iat_value: u32,
    /// What the slot binds to
    pub target: ImportTarget,
}

/// One DLL's worth of imports
#[derive(Debug, Clone)]
pub struct ImportDescriptor {
    /// DLL name as written in the image
    pub dll: String,
    /// RVA of the import lookup table (0 if absent)
    pub original_first_thunk: u32,
    /// RVA of the IAT
    pub first_thunk: u32,
    /// Slots in table order
    pub entries: Vec<ImportEntry>,
}

/// Base relocation entry with the ABS padding already dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Relocation type (high nibble of the raw entry)
    pub kind: u16,
    /// Offset within the block's page
    pub offset: u16,
}

/// One base relocation block
#[derive(Debug, Clone)]
pub struct RelocationBlock {
    /// RVA of the 4 KiB page
    pub page_rva: u32,
    /// Non-ABS entries in block order
    pub entries: Vec<RelocationEntry>,
}

/// Parsed TLS directory
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Raw directory record
    pub directory: ImageTlsDirectory32,
    /// Callback VAs, zero terminator removed
    pub callbacks: Vec<u32>,
}

/// Bound import record
#[derive(Debug, Clone)]
pub struct BoundImport {
    /// DLL the binding was computed against
    pub dll: String,
    /// Timestamp of that DLL
    pub time_date_stamp: u32,
}

impl PeImage {
    /// Parse the export directory
    pub fn exports(&self) -> Option<ExportTable> {
        let dir = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_EXPORT)?;
        let exp: ImageExportDirectory = self.struct_at_rva(dir.virtual_address)?;
        let dll_name = self.cstr_at_rva(exp.name).unwrap_or_default();

        // Name pointer table index -> ordinal index, inverted so each
        // address-table entry can look up its name.
        let mut names_by_index = vec![None; exp.number_of_functions as usize];
        for i in 0..exp.number_of_names {
            let name_rva = self.u32_at_rva(exp.address_of_names + i * 4)?;
            let ord_index = self.u16_at_rva(exp.address_of_name_ordinals + i * 2)? as usize;
            if let Some(slot) = names_by_index.get_mut(ord_index) {
                *slot = self.cstr_at_rva(name_rva);
            }
        }

        let dir_start = dir.virtual_address;
        let dir_end = dir_start.wrapping_add(dir.size);
        let mut entries = Vec::new();
        for i in 0..exp.number_of_functions {
            let rva = self.u32_at_rva(exp.address_of_functions + i * 4)?;
            if rva == 0 {
                continue;
            }
            // An RVA inside the export directory is a forwarder string.
            let forwarder = (rva >= dir_start && rva < dir_end)
                .then(|| self.cstr_at_rva(rva))
                .flatten();
            entries.push(ExportEntry {
                ordinal: exp.base + i,
                rva,
                name: names_by_index[i as usize].clone(),
                forwarder,
            });
        }

        Some(ExportTable {
            dll_name,
            ordinal_base: exp.base,
            entries,
        })
    }

    /// Parse the import directory
    pub fn imports(&self) -> Vec<ImportDescriptor> {
        let Some(dir) = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_IMPORT) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut rva = dir.virtual_address;
        loop {
            let Some(desc) = self.struct_at_rva::<ImageImportDescriptor>(rva) else {
                break;
            };
            if desc.is_null() {
                break;
            }
            let Some(dll) = self.cstr_at_rva(desc.name) else {
                break;
            };
            // The lookup table names the imports; fall back to the IAT when
            // the linker left OriginalFirstThunk zero (old Borland images).
            let name_table = if desc.original_first_thunk != 0 {
                desc.original_first_thunk
            } else {
                desc.first_thunk
            };
            let entries = self.walk_thunks(name_table, desc.first_thunk);
            out.push(ImportDescriptor {
                dll,
                original_first_thunk: desc.original_first_thunk,
                first_thunk: desc.first_thunk,
                entries,
            });
            rva += core::mem::size_of::<ImageImportDescriptor>() as u32;
        }
        out
    }

    /// Parse the delay import directory (same record shape as imports)
    pub fn delay_imports(&self) -> Vec<ImportDescriptor> {
        let Some(dir) = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT)
        else {
            return Vec::new();
        };
        let base = self.image_base();
        let mut out = Vec::new();
        let mut rva = dir.virtual_address;
        loop {
            let Some(desc) = self.struct_at_rva::<ImageDelayImportDescriptor>(rva) else {
                break;
            };
            if desc.is_null() {
                break;
            }
            // Attribute bit 0 set means fields are RVAs; clear means VAs.
            let fix = |v: u32| -> u32 {
                if desc.attributes & 1 != 0 || v == 0 {
                    v
                } else {
                    v.wrapping_sub(base)
                }
            };
            let Some(dll) = self.cstr_at_rva(fix(desc.dll_name_rva)) else {
                break;
            };
            let name_table = fix(desc.import_name_table_rva);
            let iat = fix(desc.import_address_table_rva);
            let entries = self.walk_thunks(name_table, iat);
            out.push(ImportDescriptor {
                dll,
                original_first_thunk: name_table,
                first_thunk: iat,
                entries,
            });
            rva += core::mem::size_of::<ImageDelayImportDescriptor>() as u32;
        }
        out
    }

    /// Walk a 32-bit thunk list, pairing each name-table entry with its IAT slot
    fn walk_thunks(&self, name_table: u32, iat: u32) -> Vec<ImportEntry> {
        let mut entries = Vec::new();
        let mut i = 0u32;
        loop {
            let Some(thunk) = self.u32_at_rva(name_table + i * 4) else {
                break;
            };
            if thunk == 0 {
                break;
            }
            let target = if thunk & IMAGE_ORDINAL_FLAG32 != 0 {
                ImportTarget::Ordinal(thunk as u16)
            } else {
                let hint = self.u16_at_rva(thunk).unwrap_or(0);
                let Some(name) = self.cstr_at_rva(thunk + 2) else {
                    break;
                };
                ImportTarget::Named { hint, name }
            };
            let iat_rva = iat + i * 4;
            entries.push(ImportEntry {
                iat_rva,
                iat_value: self.u32_at_rva(iat_rva).unwrap_or(0),
                target,
            });
            i += 1;
        }
        entries
    }

    /// Parse the base relocation table
    pub fn relocations(&self) -> Vec<RelocationBlock> {
        let Some(dir) = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC)
        else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut pos = 0u32;
        while pos + 8 <= dir.size {
            let rva = dir.virtual_address + pos;
            let Some(block) = self.struct_at_rva::<ImageBaseRelocation>(rva) else {
                break;
            };
            if block.size_of_block < 8 {
                break;
            }
            let mut entries = Vec::new();
            for i in 0..block.entry_count() {
                let Some(raw) = self.u16_at_rva(rva + 8 + i as u32 * 2) else {
                    break;
                };
                let kind = reloc_type(raw);
                if kind == relocation_type::IMAGE_REL_BASED_ABSOLUTE {
                    continue; // block padding
                }
                entries.push(RelocationEntry {
                    kind,
                    offset: reloc_offset(raw),
                });
            }
            out.push(RelocationBlock {
                page_rva: block.virtual_address,
                entries,
            });
            pos += block.size_of_block;
        }
        out
    }

    /// Parse the TLS directory and its callback array
    pub fn tls(&self) -> Option<TlsInfo> {
        let dir = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_TLS)?;
        let directory: ImageTlsDirectory32 = self.struct_at_rva(dir.virtual_address)?;
        let base = self.image_base();
        let mut callbacks = Vec::new();
        if directory.address_of_callbacks != 0 {
            let mut rva = directory.address_of_callbacks.wrapping_sub(base);
            while let Some(cb) = self.u32_at_rva(rva) {
                if cb == 0 {
                    break;
                }
                callbacks.push(cb);
                rva += 4;
            }
        }
        Some(TlsInfo {
            directory,
            callbacks,
        })
    }

    /// Parse the debug directory
    pub fn debug_entries(&self) -> Vec<ImageDebugDirectory> {
        let Some(dir) = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_DEBUG) else {
            return Vec::new();
        };
        let count = dir.size as usize / core::mem::size_of::<ImageDebugDirectory>();
        (0..count)
            .filter_map(|i| {
                self.struct_at_rva(
                    dir.virtual_address + (i * core::mem::size_of::<ImageDebugDirectory>()) as u32,
                )
            })
            .collect()
    }

    /// Parse the exception table
    pub fn exception_table(&self) -> Vec<RuntimeFunction> {
        let Some(dir) = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_EXCEPTION) else {
            return Vec::new();
        };
        let count = dir.size as usize / core::mem::size_of::<RuntimeFunction>();
        (0..count)
            .filter_map(|i| {
                self.struct_at_rva(
                    dir.virtual_address + (i * core::mem::size_of::<RuntimeFunction>()) as u32,
                )
            })
            .collect()
    }

    /// Parse the bound import directory
    ///
    /// Name offsets here are relative to the start of the bound import
    /// table, not RVAs.
    pub fn bound_imports(&self) -> Vec<BoundImport> {
        let Some(dir) = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_BOUND_IMPORT)
        else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut rva = dir.virtual_address;
        loop {
            let Some(desc) = self.struct_at_rva::<ImageBoundImportDescriptor>(rva) else {
                break;
            };
            if desc.is_null() {
                break;
            }
            let name_rva = dir.virtual_address + desc.offset_module_name as u32;
            let Some(dll) = self.cstr_at_rva(name_rva) else {
                break;
            };
            out.push(BoundImport {
                dll,
                time_date_stamp: desc.time_date_stamp,
            });
            // Skip the descriptor plus its forwarder refs (same record size).
            rva += (1 + desc.number_of_module_forwarder_refs as u32)
                * core::mem::size_of::<ImageBoundImportDescriptor>() as u32;
        }
        out
    }

    /// Parse the load configuration directory
    pub fn load_config(&self) -> Option<ImageLoadConfigDirectory32> {
        let dir = self.directory(directory_entry::IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG)?;
        self.struct_at_rva(dir.virtual_address)
    }
}

/// Split a 64-bit thunk (PE32+ import format)
///
/// Not used for i386 images, but the walker semantics are the same: top bit
/// carries the ordinal flag, otherwise the low 31 bits are a hint/name RVA.
pub fn split_thunk64(thunk: u64) -> Result<u16, u32> {
    if thunk & IMAGE_ORDINAL_FLAG64 != 0 {
        Ok(thunk as u16)
    } else {
        Err(thunk as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::PeBuilder;

    #[test]
    fn test_import_walk_prefers_lookup_table() {
        let bytes = PeBuilder::new()
            .import("KERNEL32.dll", &["ExitProcess", "GetVersion"])
            .build();
        let image = PeImage::parse(bytes).unwrap();
        let imports = image.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].dll, "KERNEL32.dll");
        let names: Vec<_> = imports[0]
            .entries
            .iter()
            .map(|e| e.target.label())
            .collect();
        assert_eq!(names, ["ExitProcess", "GetVersion"]);
        // IAT slots are consecutive dwords at FirstThunk.
        assert_eq!(
            imports[0].entries[1].iat_rva,
            imports[0].entries[0].iat_rva + 4
        );
    }

    #[test]
    fn test_missing_import_directory_is_empty() {
        let image = PeImage::parse(PeBuilder::new().build()).unwrap();
        assert!(image.imports().is_empty());
        assert!(image.relocations().is_empty());
        assert!(image.exports().is_none());
        assert!(image.tls().is_none());
    }

    #[test]
    fn test_relocation_abs_entries_dropped() {
        let bytes = PeBuilder::new()
            .reloc_block(0x1000, &[(3, 0x10), (0, 0), (3, 0x20)])
            .build();
        let image = PeImage::parse(bytes).unwrap();
        let blocks = image.relocations();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].page_rva, 0x1000);
        assert_eq!(blocks[0].entries.len(), 2);
        assert_eq!(blocks[0].entries[1].offset, 0x20);
    }

    #[test]
    fn test_export_walk() {
        let bytes = PeBuilder::new()
            .export(
                "MCITY.dll",
                &[("Startup", 0x1010), ("Shutdown", 0x1020), ("Fwd", 0x2090)],
            )
            .build();
        let image = PeImage::parse(bytes).unwrap();
        let exports = image.exports().unwrap();
        assert_eq!(exports.dll_name, "MCITY.dll");
        assert_eq!(exports.ordinal_base, 1);
        assert_eq!(exports.entries.len(), 3);
        assert_eq!(exports.entries[0].name.as_deref(), Some("Startup"));
        assert_eq!(exports.entries[0].ordinal, 1);
        assert_eq!(exports.entries[1].rva, 0x1020);
        // An RVA inside the export directory is a forwarder string
        assert!(exports.entries[2].forwarder.is_some());
    }

    #[test]
    fn test_thunk64_split() {
        assert_eq!(split_thunk64(0x8000_0000_0000_002A), Ok(42));
        assert_eq!(split_thunk64(0x0000_1234), Err(0x1234));
    }
}
