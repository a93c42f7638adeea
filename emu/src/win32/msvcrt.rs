//! MSVC CRT runtime handlers
//!
//! The startup surface of the VC-era CRT: `_initterm` walks the C/C++
//! initializer tables by actually calling back into guest code, and
//! `__getmainargs` hands out the argc/argv/envp block built by `ps`. All of
//! these are cdecl; the caller cleans its own stack, so handlers only set
//! EAX.
//!
//! Three routines are intercepted inside the image rather than at the import
//! table, at configured addresses specific to the loaded binary: the CRT
//! small-block-heap initializer (told it succeeded), its allocator (told to
//! fall back to HeapAlloc), and `_CrtDbgReport` (told to continue).

use crate::Emulator;

use super::ApiHandler;

/// _controlfp default state for the emulated x87
const CONTROLFP_DEFAULT: u32 = 0x0009_001F;

/// ExceptionContinueSearch for _except_handler3
const EXCEPTION_CONTINUE_SEARCH: u32 = 1;

/// Handler lookup for msvcrt exports
pub fn resolve(name: &str) -> Option<ApiHandler> {
    Some(match name {
        "_initterm" => initterm,
        "_initterm_e" => initterm_e,
        "__set_app_type" => set_app_type,
        "__p__fmode" => p_fmode,
        "__p__commode" => p_commode,
        "_controlfp" => controlfp,
        "_except_handler3" => except_handler3,
        "__getmainargs" => getmainargs,
        "exit" | "_exit" => crt_exit,
        "_cexit" | "_c_exit" => cexit,
        "_amsg_exit" => amsg_exit,
        "_XcptFilter" => xcpt_filter,
        _ => return None,
    })
}

/// Walk a table of optional function pointers, calling each in order
fn initterm_walk(emu: &mut Emulator, stop_on_error: bool) -> u32 {
    let (start, end) = (emu.arg(0), emu.arg(1));
    let mut at = start;
    while at < end {
        let f = emu.mem.read32(at).unwrap_or(0);
        if f != 0 {
            log::trace!("[CRT] initterm calling {f:#010x}");
            let ret = emu.call_guest(f, &[]);
            if stop_on_error && ret != 0 {
                return ret;
            }
        }
        at += 4;
    }
    0
}

fn initterm(emu: &mut Emulator) {
    initterm_walk(emu, false);
    emu.set_eax(0);
}

fn initterm_e(emu: &mut Emulator) {
    let ret = initterm_walk(emu, true);
    emu.set_eax(ret);
}

fn set_app_type(emu: &mut Emulator) {
    let kind = emu.arg(0);
    log::debug!("[CRT] __set_app_type({kind})");
}

fn p_fmode(emu: &mut Emulator) {
    let p = emu.process.fmode_ptr;
    emu.set_eax(p);
}

fn p_commode(emu: &mut Emulator) {
    let p = emu.process.commode_ptr;
    emu.set_eax(p);
}

fn controlfp(emu: &mut Emulator) {
    emu.set_eax(CONTROLFP_DEFAULT);
}

fn except_handler3(emu: &mut Emulator) {
    emu.set_eax(EXCEPTION_CONTINUE_SEARCH);
}

fn getmainargs(emu: &mut Emulator) {
    let (p_argc, p_argv, p_envp) = (emu.arg(0), emu.arg(1), emu.arg(2));
    let _ = emu.mem.write32(p_argc, emu.process.argc);
    let _ = emu.mem.write32(p_argv, emu.process.argv_ptr);
    let _ = emu.mem.write32(p_envp, emu.process.envp_ptr);
    emu.set_eax(0);
}

fn crt_exit(emu: &mut Emulator) {
    let code = emu.arg(0);
    log::info!("[CRT] exit({code})");
    emu.exit_code = Some(code);
    emu.cpu.halted = true;
}

fn cexit(emu: &mut Emulator) {
    emu.set_eax(0);
}

fn amsg_exit(emu: &mut Emulator) {
    let code = emu.arg(0);
    log::warn!("[CRT] _amsg_exit(rterr {code})");
    emu.exit_code = Some(255);
    emu.cpu.halted = true;
}

fn xcpt_filter(emu: &mut Emulator) {
    emu.set_eax(0);
}

// ========================================================================
// In-image patch handlers (addresses come from EmuConfig)
// ========================================================================

/// `__sbh_heap_init` replacement: report success without building the
/// small-block heap, whose bookkeeping the bump allocator cannot satisfy
pub fn sbh_heap_init(emu: &mut Emulator) {
    emu.set_eax(1);
}

/// `__sbh_alloc_block` replacement: always NULL, forcing the CRT onto its
/// plain HeapAlloc fallback path
pub fn sbh_alloc_block(emu: &mut Emulator) {
    emu.set_eax(0);
}

/// `_CrtDbgReport` replacement: report "continue execution"
pub fn crt_dbg_report(emu: &mut Emulator) {
    log::debug!("[CRT] _CrtDbgReport suppressed");
    emu.set_eax(0);
}
