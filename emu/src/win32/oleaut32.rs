//! oleaut32 handlers (BSTR / VARIANT / SafeArray)
//!
//! A BSTR is a 4-byte byte-length prefix followed by UTF-16LE code units and
//! a terminating zero unit; the pointer handed to the guest addresses the
//! payload, so the length always lives at `bstr - 4`. Allocation comes from
//! the same bump heap as HeapAlloc, and freeing is a no-op like everything
//! else there.

use crate::Emulator;

use super::ApiHandler;

/// S_OK
const S_OK: u32 = 0;
/// DISP_E_TYPEMISMATCH
const DISP_E_TYPEMISMATCH: u32 = 0x8002_0005;

/// Handler lookup for oleaut32 exports
pub fn resolve(name: &str) -> Option<ApiHandler> {
    Some(match name {
        "SysAllocString" => sys_alloc_string,
        "SysAllocStringLen" => sys_alloc_string_len,
        "SysAllocStringByteLen" => sys_alloc_string_byte_len,
        "SysReAllocString" => sys_realloc_string,
        "SysReAllocStringLen" => sys_realloc_string_len,
        "SysFreeString" => sys_free_string,
        "SysStringLen" => sys_string_len,
        "SysStringByteLen" => sys_string_byte_len,
        "VariantInit" => variant_init,
        "VariantClear" => variant_clear,
        "VariantChangeType" => variant_change_type,
        "SafeArrayCreate" => safe_array_create,
        "SafeArrayDestroy" => safe_array_destroy,
        _ => return None,
    })
}

/// Allocate a BSTR of `byte_len` payload bytes; returns the payload address
///
/// The block layout is `[byte_len:u32][payload][u16 zero]`.
pub fn alloc_bstr(emu: &mut Emulator, byte_len: u32) -> u32 {
    let block = emu.kernel32.heap_alloc(4 + byte_len + 2);
    if block == 0 {
        return 0;
    }
    let payload = block + 4;
    let _ = emu.mem.write32(block, byte_len);
    let _ = emu.mem.write16(payload + byte_len, 0);
    payload
}

/// Copy UTF-16 units into a fresh BSTR
fn bstr_from_units(emu: &mut Emulator, units: &[u16]) -> u32 {
    let payload = alloc_bstr(emu, units.len() as u32 * 2);
    if payload != 0 {
        for (i, &u) in units.iter().enumerate() {
            let _ = emu.mem.write16(payload + i as u32 * 2, u);
        }
    }
    payload
}

fn sys_alloc_string(emu: &mut Emulator) {
    let src = emu.arg(0);
    let bstr = if src == 0 {
        0
    } else {
        let units = emu.mem.read_wstr(src).unwrap_or_default();
        bstr_from_units(emu, &units)
    };
    emu.set_eax(bstr);
    emu.stdcall_ret(1);
}

fn sys_alloc_string_len(emu: &mut Emulator) {
    let (src, cch) = (emu.arg(0), emu.arg(1));
    let units: Vec<u16> = if src == 0 {
        vec![0; cch as usize]
    } else {
        (0..cch)
            .map(|i| emu.mem.read16(src + i * 2).unwrap_or(0))
            .collect()
    };
    let bstr = bstr_from_units(emu, &units);
    emu.set_eax(bstr);
    emu.stdcall_ret(2);
}

fn sys_alloc_string_byte_len(emu: &mut Emulator) {
    let (src, bytes) = (emu.arg(0), emu.arg(1));
    let payload = alloc_bstr(emu, bytes);
    if payload != 0 && src != 0 {
        if let Ok(data) = emu.mem.slice(src, bytes).map(<[u8]>::to_vec) {
            let _ = emu.mem.load(payload, &data);
        }
    }
    emu.set_eax(payload);
    emu.stdcall_ret(2);
}

fn sys_realloc_string(emu: &mut Emulator) {
    let (pbstr, src) = (emu.arg(0), emu.arg(1));
    let units = if src == 0 {
        Vec::new()
    } else {
        emu.mem.read_wstr(src).unwrap_or_default()
    };
    let bstr = bstr_from_units(emu, &units);
    if pbstr != 0 {
        let _ = emu.mem.write32(pbstr, bstr);
    }
    emu.set_eax((bstr != 0) as u32);
    emu.stdcall_ret(2);
}

fn sys_realloc_string_len(emu: &mut Emulator) {
    let (pbstr, src, cch) = (emu.arg(0), emu.arg(1), emu.arg(2));
    let units: Vec<u16> = if src == 0 {
        vec![0; cch as usize]
    } else {
        (0..cch)
            .map(|i| emu.mem.read16(src + i * 2).unwrap_or(0))
            .collect()
    };
    let bstr = bstr_from_units(emu, &units);
    if pbstr != 0 {
        let _ = emu.mem.write32(pbstr, bstr);
    }
    emu.set_eax((bstr != 0) as u32);
    emu.stdcall_ret(3);
}

fn sys_free_string(emu: &mut Emulator) {
    // Bump heap: nothing to release
    emu.stdcall_ret(1);
}

fn sys_string_len(emu: &mut Emulator) {
    let bstr = emu.arg(0);
    let len = if bstr == 0 {
        0
    } else {
        emu.mem.read32(bstr.wrapping_sub(4)).unwrap_or(0) / 2
    };
    emu.set_eax(len);
    emu.stdcall_ret(1);
}

fn sys_string_byte_len(emu: &mut Emulator) {
    let bstr = emu.arg(0);
    let len = if bstr == 0 {
        0
    } else {
        emu.mem.read32(bstr.wrapping_sub(4)).unwrap_or(0)
    };
    emu.set_eax(len);
    emu.stdcall_ret(1);
}

fn variant_init(emu: &mut Emulator) {
    let p = emu.arg(0);
    let _ = emu.mem.fill(p, 16, 0);
    emu.stdcall_ret(1);
}

fn variant_clear(emu: &mut Emulator) {
    let p = emu.arg(0);
    let _ = emu.mem.fill(p, 16, 0);
    emu.set_eax(S_OK);
    emu.stdcall_ret(1);
}

fn variant_change_type(emu: &mut Emulator) {
    let (dst, src, vt) = (emu.arg(0), emu.arg(1), emu.arg(3));
    let src_vt = emu.mem.read16(src).unwrap_or(0) as u32;
    if src_vt == vt & 0xFFFF {
        // Same type: plain copy
        if let Ok(bytes) = emu.mem.slice(src, 16).map(<[u8]>::to_vec) {
            let _ = emu.mem.load(dst, &bytes);
        }
        emu.set_eax(S_OK);
    } else {
        emu.set_eax(DISP_E_TYPEMISMATCH);
    }
    emu.stdcall_ret(4);
}

fn safe_array_create(emu: &mut Emulator) {
    emu.set_eax(0); // no array support
    emu.stdcall_ret(3);
}

fn safe_array_destroy(emu: &mut Emulator) {
    emu.set_eax(S_OK);
    emu.stdcall_ret(1);
}
