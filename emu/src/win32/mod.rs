//! Win32 API emulation (win32)
//!
//! The handler library, grouped by owning DLL the way the import table names
//! them. Handlers are plain host functions over the live emulator: they read
//! guest arguments off the stack, mutate registers and guest memory, apply
//! their calling convention, and return. They never suspend and they never
//! error out through Rust; failure is reported to the guest through Win32
//! return conventions (BOOL 0, INVALID_HANDLE_VALUE, HRESULTs).
//!
//! Resolution is static: [`resolve`] maps `(dll, symbol)` to the handler
//! function at load time, and the shim table gives each one a guest-callable
//! address. Imports nobody implements still get a slot wired to
//! [`unimplemented`], so the first call faults with the symbol name instead
//! of jumping into zeroed memory.

pub mod advapi32;
pub mod kernel32;
pub mod msvcrt;
pub mod ole32;
pub mod oleaut32;
pub mod shim;
pub mod user32;

pub use shim::{Shim, ShimTable, SHIM_CODE};

use crate::ldr::ImportTarget;
use crate::Emulator;

/// A host-side API implementation
pub type ApiHandler = fn(&mut Emulator);

/// Resolve an import-table entry to a handler
pub fn resolve(dll: &str, target: &ImportTarget) -> Option<ApiHandler> {
    match target {
        ImportTarget::Named { name, .. } => resolve_name(dll, name),
        // Ordinal-only imports are not cataloged; they get the missing stub
        ImportTarget::Ordinal(_) => None,
    }
}

/// Resolve a `(dll, symbol name)` pair to a handler
pub fn resolve_name(dll: &str, name: &str) -> Option<ApiHandler> {
    match module_key(dll).as_str() {
        "kernel32" => kernel32::resolve(name),
        "user32" | "gdi32" => user32::resolve(name),
        "advapi32" => advapi32::resolve(name),
        "ole32" => ole32::resolve(name),
        "oleaut32" => oleaut32::resolve(name),
        "msvcrt" | "msvcrtd" | "msvcr70" | "msvcr71" => msvcrt::resolve(name),
        _ => None,
    }
}

/// Lowercased module key: path and ".dll" suffix stripped
fn module_key(dll: &str) -> String {
    let file = dll
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(dll)
        .to_lowercase();
    file.strip_suffix(".dll").unwrap_or(&file).to_string()
}

/// Handler wired to every import without an implementation
///
/// Logs the symbol the guest actually reached for, then halts: continuing
/// past a missing API means executing garbage.
pub fn unimplemented(emu: &mut Emulator) {
    let label = emu
        .current_api
        .clone()
        .map(|(dll, name)| format!("{dll}!{name}"))
        .unwrap_or_else(|| "<unknown import>".to_string());
    log::error!("[W32] call into unimplemented API {label}");
    emu.fault = Some(format!("unimplemented API {label}"));
    emu.cpu.halted = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_key_normalization() {
        assert_eq!(module_key("KERNEL32.dll"), "kernel32");
        assert_eq!(module_key("C:\\WINDOWS\\System32\\USER32.DLL"), "user32");
        assert_eq!(module_key("oleaut32"), "oleaut32");
    }

    #[test]
    fn test_resolution_by_group() {
        assert!(resolve_name("kernel32.dll", "GetVersion").is_some());
        assert!(resolve_name("KERNEL32.DLL", "ExitProcess").is_some());
        assert!(resolve_name("user32.dll", "MessageBoxA").is_some());
        assert!(resolve_name("advapi32.dll", "RegOpenKeyExA").is_some());
        assert!(resolve_name("oleaut32.dll", "SysAllocString").is_some());
        assert!(resolve_name("msvcrt.dll", "_initterm").is_some());
        assert!(resolve_name("d3d8.dll", "Direct3DCreate8").is_none());
        assert!(resolve_name("kernel32.dll", "NoSuchApi").is_none());
    }

    #[test]
    fn test_ordinal_imports_unresolved() {
        assert!(resolve("oleaut32.dll", &ImportTarget::Ordinal(2)).is_none());
    }
}
