//! user32 / gdi32 handlers
//!
//! No window system exists behind the emulator: registrations succeed with
//! fake atoms, window and DC handles are minted from a counter, and the
//! message loop drains immediately (`GetMessage` delivers WM_QUIT on the
//! first call). `MessageBoxA` is load-bearing for debug builds: the CRT
//! assertion dialog uses MB_ABORTRETRYIGNORE, and answering IDIGNORE lets
//! the program continue past the assert.

use crate::Emulator;

use super::ApiHandler;

/// WM_QUIT
pub const WM_QUIT: u32 = 0x0012;
/// IDOK
pub const IDOK: u32 = 1;
/// IDIGNORE
pub const IDIGNORE: u32 = 5;
/// MB_ABORTRETRYIGNORE
pub const MB_ABORTRETRYIGNORE: u32 = 0x0000_0002;
/// Style mask selecting the button set
const MB_TYPEMASK: u32 = 0x0000_000F;

/// Window-side handle mints
#[derive(Debug)]
pub struct User32State {
    next_hwnd: u32,
    next_hdc: u32,
    /// Exit code passed to PostQuitMessage, if any
    pub quit_code: Option<u32>,
}

impl User32State {
    /// Fresh handle counters
    pub fn new() -> Self {
        Self {
            next_hwnd: 0x0001_0010,
            next_hdc: 0x2301_0000,
            quit_code: None,
        }
    }

    fn mint_hwnd(&mut self) -> u32 {
        let h = self.next_hwnd;
        self.next_hwnd += 4;
        h
    }

    fn mint_hdc(&mut self) -> u32 {
        let h = self.next_hdc;
        self.next_hdc += 4;
        h
    }
}

impl Default for User32State {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler lookup for user32/gdi32 exports
pub fn resolve(name: &str) -> Option<ApiHandler> {
    Some(match name {
        "MessageBoxA" => message_box_a,
        "MessageBoxW" => message_box_w,
        "DialogBoxParamA" | "DialogBoxParamW" => dialog_box_param,
        "RegisterClassA" | "RegisterClassW" => register_class,
        "RegisterClassExA" | "RegisterClassExW" => register_class,
        "CreateWindowExA" | "CreateWindowExW" => create_window_ex,
        "DestroyWindow" => bool_ret_1,
        "ShowWindow" => bool_ret_2,
        "UpdateWindow" => bool_ret_1,
        "DefWindowProcA" | "DefWindowProcW" => def_window_proc,
        "GetDC" => get_dc,
        "ReleaseDC" => release_dc,
        "GetSystemMetrics" => get_system_metrics,
        "PeekMessageA" | "PeekMessageW" => peek_message,
        "GetMessageA" | "GetMessageW" => get_message,
        "TranslateMessage" => zero_ret_1,
        "DispatchMessageA" | "DispatchMessageW" => zero_ret_1,
        "PostQuitMessage" => post_quit_message,
        "LoadIconA" | "LoadIconW" => load_icon,
        "LoadCursorA" | "LoadCursorW" => load_cursor,
        _ => return None,
    })
}

/// Shared MessageBox behavior; `text`/`caption` already decoded
fn message_box(emu: &mut Emulator, text: String, caption: String) {
    let style = emu.arg(3);
    println!("[MSG] {caption}: {text}");
    // Debug-CRT asserts use Abort/Retry/Ignore; Ignore continues execution
    let answer = if style & MB_TYPEMASK == MB_ABORTRETRYIGNORE {
        IDIGNORE
    } else {
        IDOK
    };
    log::info!("[W32] MessageBox(\"{caption}\") -> {answer}");
    emu.set_eax(answer);
    emu.stdcall_ret(4);
}

fn message_box_a(emu: &mut Emulator) {
    let text = emu.read_cstr_lossy(emu.arg(1));
    let caption = emu.read_cstr_lossy(emu.arg(2));
    message_box(emu, text, caption);
}

fn message_box_w(emu: &mut Emulator) {
    let text = emu.read_wstr_lossy(emu.arg(1));
    let caption = emu.read_wstr_lossy(emu.arg(2));
    message_box(emu, text, caption);
}

fn dialog_box_param(emu: &mut Emulator) {
    emu.set_eax(IDOK);
    emu.stdcall_ret(5);
}

fn register_class(emu: &mut Emulator) {
    emu.set_eax(0xC01C); // fake class atom
    emu.stdcall_ret(1);
}

fn create_window_ex(emu: &mut Emulator) {
    let h = emu.user32.mint_hwnd();
    emu.set_eax(h);
    emu.stdcall_ret(12);
}

fn def_window_proc(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(4);
}

fn get_dc(emu: &mut Emulator) {
    let h = emu.user32.mint_hdc();
    emu.set_eax(h);
    emu.stdcall_ret(1);
}

fn release_dc(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

fn get_system_metrics(emu: &mut Emulator) {
    let index = emu.arg(0);
    let v = match index {
        0 => 800, // SM_CXSCREEN
        1 => 600, // SM_CYSCREEN
        _ => 0,
    };
    emu.set_eax(v);
    emu.stdcall_ret(1);
}

fn peek_message(emu: &mut Emulator) {
    emu.set_eax(0); // queue is always empty
    emu.stdcall_ret(5);
}

fn get_message(emu: &mut Emulator) {
    let msg = emu.arg(0);
    // MSG { hwnd, message, wParam, lParam, time, pt.x, pt.y }
    let _ = emu.mem.fill(msg, 28, 0);
    let _ = emu.mem.write32(msg + 4, WM_QUIT);
    emu.set_eax(0); // GetMessage returns 0 for WM_QUIT
    emu.stdcall_ret(4);
}

fn post_quit_message(emu: &mut Emulator) {
    let code = emu.arg(0);
    emu.user32.quit_code = Some(code);
    emu.stdcall_ret(1);
}

fn load_icon(emu: &mut Emulator) {
    emu.set_eax(0x0000_4201);
    emu.stdcall_ret(2);
}

fn load_cursor(emu: &mut Emulator) {
    emu.set_eax(0x0000_4301);
    emu.stdcall_ret(2);
}

fn bool_ret_1(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(1);
}

fn bool_ret_2(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

fn zero_ret_1(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(1);
}
