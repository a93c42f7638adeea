//! advapi32 handlers (registry surface)
//!
//! The registry itself lives in [`crate::cm`]; these handlers translate
//! between the Win32 calling surface and the JSON-backed store. Everything
//! read-only succeeds against the store; writes are acknowledged and
//! dropped; enumeration reports an empty key.

use crate::cm::{reg_type, RegData, ERROR_FILE_NOT_FOUND, ERROR_SUCCESS};
use crate::Emulator;

use super::ApiHandler;

/// ERROR_NO_MORE_ITEMS
const ERROR_NO_MORE_ITEMS: u32 = 259;
/// REG_OPENED_EXISTING_KEY
const REG_OPENED_EXISTING_KEY: u32 = 2;

/// Handler lookup for advapi32 exports
pub fn resolve(name: &str) -> Option<ApiHandler> {
    Some(match name {
        "RegOpenKeyA" => reg_open_key_a,
        "RegOpenKeyExA" => reg_open_key_ex_a,
        "RegCreateKeyA" => reg_create_key_a,
        "RegCreateKeyExA" => reg_create_key_ex_a,
        "RegQueryValueExA" => reg_query_value_ex_a,
        "RegQueryValueExW" => reg_query_value_ex_w,
        "RegSetValueExA" => reg_set_value_ex_a,
        "RegEnumKeyExA" => reg_enum_8,
        "RegEnumValueA" => reg_enum_8,
        "RegCloseKey" => reg_close_key,
        "RegFlushKey" => reg_flush_key,
        _ => return None,
    })
}

/// Open/create body shared by the four entry points
fn open_common(emu: &mut Emulator, parent: u32, sub_ptr: u32, out: u32) -> u32 {
    let sub = if sub_ptr == 0 {
        String::new()
    } else {
        emu.read_cstr_lossy(sub_ptr)
    };
    match emu.registry.open_key(parent, &sub) {
        Some(handle) => {
            if out != 0 {
                let _ = emu.mem.write32(out, handle);
            }
            ERROR_SUCCESS
        }
        None => ERROR_FILE_NOT_FOUND,
    }
}

fn reg_open_key_a(emu: &mut Emulator) {
    let (parent, sub, out) = (emu.arg(0), emu.arg(1), emu.arg(2));
    let status = open_common(emu, parent, sub, out);
    emu.set_eax(status);
    emu.stdcall_ret(3);
}

fn reg_open_key_ex_a(emu: &mut Emulator) {
    let (parent, sub, out) = (emu.arg(0), emu.arg(1), emu.arg(4));
    let status = open_common(emu, parent, sub, out);
    emu.set_eax(status);
    emu.stdcall_ret(5);
}

fn reg_create_key_a(emu: &mut Emulator) {
    let (parent, sub, out) = (emu.arg(0), emu.arg(1), emu.arg(2));
    let status = open_common(emu, parent, sub, out);
    emu.set_eax(status);
    emu.stdcall_ret(3);
}

fn reg_create_key_ex_a(emu: &mut Emulator) {
    let (parent, sub, out, disposition) = (emu.arg(0), emu.arg(1), emu.arg(7), emu.arg(8));
    let status = open_common(emu, parent, sub, out);
    if disposition != 0 {
        let _ = emu.mem.write32(disposition, REG_OPENED_EXISTING_KEY);
    }
    emu.set_eax(status);
    emu.stdcall_ret(9);
}

/// Encode a value for the guest: REG_DWORD as 4 LE bytes, strings
/// zero-terminated (UTF-16 for the W surface)
fn encode_value(data: &RegData, wide: bool) -> Vec<u8> {
    match data {
        RegData::Dword(v) => v.to_le_bytes().to_vec(),
        RegData::Sz(s) => {
            if wide {
                let mut out: Vec<u8> = s
                    .encode_utf16()
                    .flat_map(|u| u.to_le_bytes())
                    .collect();
                out.extend_from_slice(&[0, 0]);
                out
            } else {
                let mut out = s.as_bytes().to_vec();
                out.push(0);
                out
            }
        }
    }
}

fn query_common(emu: &mut Emulator, wide: bool) {
    let (handle, name_ptr) = (emu.arg(0), emu.arg(1));
    let (type_out, data_out, cb_inout) = (emu.arg(3), emu.arg(4), emu.arg(5));
    let name = if wide {
        emu.read_wstr_lossy(name_ptr)
    } else {
        emu.read_cstr_lossy(name_ptr)
    };

    let Some(value) = emu.registry.query(handle, &name) else {
        log::debug!("[W32] RegQueryValueEx({name}) -> not found");
        emu.set_eax(ERROR_FILE_NOT_FOUND);
        emu.stdcall_ret(6);
        return;
    };
    let kind = value.kind;
    let bytes = encode_value(&value.data, wide && kind != reg_type::REG_DWORD);

    if type_out != 0 {
        let _ = emu.mem.write32(type_out, kind);
    }
    let capacity = if cb_inout != 0 {
        emu.mem.read32(cb_inout).unwrap_or(0)
    } else {
        0
    };
    let mut status = ERROR_SUCCESS;
    if data_out != 0 {
        if capacity as usize >= bytes.len() {
            let _ = emu.mem.load(data_out, &bytes);
        } else {
            status = 234; // ERROR_MORE_DATA
        }
    }
    if cb_inout != 0 {
        let _ = emu.mem.write32(cb_inout, bytes.len() as u32);
    }
    log::debug!("[W32] RegQueryValueEx({name}) -> type {kind}, {} bytes", bytes.len());
    emu.set_eax(status);
    emu.stdcall_ret(6);
}

fn reg_query_value_ex_a(emu: &mut Emulator) {
    query_common(emu, false);
}

fn reg_query_value_ex_w(emu: &mut Emulator) {
    query_common(emu, true);
}

fn reg_set_value_ex_a(emu: &mut Emulator) {
    let name = emu.read_cstr_lossy(emu.arg(1));
    log::debug!("[W32] RegSetValueExA({name}) acknowledged, not persisted");
    emu.set_eax(ERROR_SUCCESS);
    emu.stdcall_ret(6);
}

fn reg_enum_8(emu: &mut Emulator) {
    emu.set_eax(ERROR_NO_MORE_ITEMS);
    emu.stdcall_ret(8);
}

fn reg_close_key(emu: &mut Emulator) {
    let handle = emu.arg(0);
    let status = emu.registry.close_key(handle);
    emu.set_eax(status);
    emu.stdcall_ret(1);
}

fn reg_flush_key(emu: &mut Emulator) {
    emu.set_eax(ERROR_SUCCESS);
    emu.stdcall_ret(1);
}
