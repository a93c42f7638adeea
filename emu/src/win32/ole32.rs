//! ole32 handlers
//!
//! COM initialization succeeds; object creation reports that no class is
//! registered, which callers handle as an optional-feature miss.

use crate::Emulator;

use super::ApiHandler;

/// S_OK
pub const S_OK: u32 = 0;
/// REGDB_E_CLASSNOTREG
pub const REGDB_E_CLASSNOTREG: u32 = 0x8004_0154;

/// Handler lookup for ole32 exports
pub fn resolve(name: &str) -> Option<ApiHandler> {
    Some(match name {
        "CoInitialize" => co_initialize,
        "CoInitializeEx" => co_initialize_ex,
        "CoUninitialize" => co_uninitialize,
        "CoCreateInstance" => co_create_instance,
        _ => return None,
    })
}

fn co_initialize(emu: &mut Emulator) {
    emu.set_eax(S_OK);
    emu.stdcall_ret(1);
}

fn co_initialize_ex(emu: &mut Emulator) {
    emu.set_eax(S_OK);
    emu.stdcall_ret(2);
}

fn co_uninitialize(emu: &mut Emulator) {
    emu.set_eax(S_OK);
}

fn co_create_instance(emu: &mut Emulator) {
    let out = emu.arg(4);
    if out != 0 {
        let _ = emu.mem.write32(out, 0);
    }
    log::debug!("[W32] CoCreateInstance -> REGDB_E_CLASSNOTREG");
    emu.set_eax(REGDB_E_CLASSNOTREG);
    emu.stdcall_ret(5);
}
