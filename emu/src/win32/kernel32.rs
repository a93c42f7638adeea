//! kernel32 handlers
//!
//! Process and module introspection, the bump heap, threading and
//! synchronization, TLS, locale and code page conversion, deterministic
//! time, the discarding file layer, string helpers, and error/exception
//! plumbing. The identity presented to the guest is Windows XP SP2
//! (5.1.2600) on a single x86 processor with SSE/SSE2.

use crate::ke;
use crate::ldr::layout;
use crate::ps;
use crate::Emulator;
use std::collections::HashMap;

use super::ApiHandler;

/// INVALID_HANDLE_VALUE
pub const INVALID_HANDLE_VALUE: u32 = 0xFFFF_FFFF;
/// GetVersion packing of 5.1 build 2600
pub const VERSION_XP_SP2: u32 = (2600 << 16) | (1 << 8) | 5;
/// STILL_ACTIVE exit code
pub const STILL_ACTIVE: u32 = 259;
/// HEAP_ZERO_MEMORY
pub const HEAP_ZERO_MEMORY: u32 = 0x8;
/// CREATE_SUSPENDED
pub const CREATE_SUSPENDED: u32 = 0x4;
/// The NT heap signature CRT heap probes look for
pub const HEAP_SIGNATURE: u32 = 0xEEFF_EEFF;

/// Synthetic handles for GetStdHandle
const STD_INPUT: u32 = 0x10;
const STD_OUTPUT: u32 = 0x14;
const STD_ERROR: u32 = 0x18;

/// FORMAT_MESSAGE_ALLOCATE_BUFFER
const FORMAT_MESSAGE_ALLOCATE_BUFFER: u32 = 0x0100;
/// FORMAT_MESSAGE_FROM_STRING
const FORMAT_MESSAGE_FROM_STRING: u32 = 0x0400;

/// Allocator cursors and handle counters behind the kernel32 surface
#[derive(Debug)]
pub struct Kernel32State {
    /// Canonical GetProcessHeap handle
    pub process_heap: u32,
    /// Bump cursor inside the heap region
    heap_cursor: u32,
    /// Allocation sizes for HeapSize/HeapReAlloc
    alloc_sizes: HashMap<u32, u32>,
    /// VirtualAlloc bump cursor (64 KiB granularity)
    valloc_cursor: u32,
    /// Monotonic TLS index
    next_tls: u32,
    /// Monotonic FLS index
    next_fls: u32,
    /// Generic handle mint (files, events, mutexes)
    next_handle: u32,
    /// Deterministic tick counter
    tick: u32,
    /// Deterministic performance counter
    perf_counter: u64,
}

impl Kernel32State {
    /// Fresh state with the canonical process heap carved out
    pub fn new() -> Self {
        Self {
            process_heap: layout::HEAP_BASE,
            // The first page belongs to the process heap header itself
            heap_cursor: layout::HEAP_BASE + 0x1000,
            alloc_sizes: HashMap::new(),
            valloc_cursor: layout::VALLOC_BASE,
            next_tls: 1,
            next_fls: 1,
            next_handle: 0x0000_0204,
            tick: 0,
            perf_counter: 0,
        }
    }

    /// Bump-allocate from the heap region, 8-byte aligned
    pub fn heap_alloc(&mut self, size: u32) -> u32 {
        let size = size.max(1);
        let addr = self.heap_cursor;
        let next = (addr + size + 7) & !7;
        if next >= layout::HEAP_LIMIT {
            log::error!("[W32] guest heap exhausted ({size} byte request)");
            return 0;
        }
        self.heap_cursor = next;
        self.alloc_sizes.insert(addr, size);
        addr
    }

    /// Size recorded for an allocation
    pub fn alloc_size(&self, addr: u32) -> Option<u32> {
        self.alloc_sizes.get(&addr).copied()
    }

    /// Mint an opaque kernel handle
    pub fn mint_handle(&mut self) -> u32 {
        let h = self.next_handle;
        self.next_handle += 4;
        h
    }
}

impl Default for Kernel32State {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler lookup for kernel32 exports
pub fn resolve(name: &str) -> Option<ApiHandler> {
    Some(match name {
        // Process / module introspection
        "GetVersion" => get_version,
        "GetVersionExA" => get_version_ex_a,
        "GetCommandLineA" => get_command_line_a,
        "GetCommandLineW" => get_command_line_w,
        "GetStartupInfoA" | "GetStartupInfoW" => get_startup_info,
        "GetModuleHandleA" => get_module_handle_a,
        "GetModuleHandleW" => get_module_handle_w,
        "GetModuleFileNameA" => get_module_file_name_a,
        "GetModuleFileNameW" => get_module_file_name_w,
        "GetCurrentProcess" => get_current_process,
        "GetCurrentProcessId" => get_current_process_id,
        "GetCurrentThread" => get_current_thread,
        "GetCurrentThreadId" => get_current_thread_id,
        "IsDebuggerPresent" => is_debugger_present,
        "IsProcessorFeaturePresent" => is_processor_feature_present,
        "LoadLibraryA" => load_library_a,
        "FreeLibrary" => free_library,
        "GetProcAddress" => get_proc_address,
        "GetSystemInfo" => get_system_info,
        "GlobalMemoryStatus" => global_memory_status,
        "SetErrorMode" => set_error_mode,
        "ExitProcess" => exit_process,
        "TerminateProcess" => terminate_process,

        // Heap and virtual memory
        "HeapCreate" => heap_create,
        "HeapDestroy" => heap_destroy,
        "GetProcessHeap" => get_process_heap,
        "HeapAlloc" => heap_alloc,
        "HeapReAlloc" => heap_realloc,
        "HeapFree" => heap_free,
        "HeapSize" => heap_size,
        "HeapValidate" => heap_validate,
        "VirtualAlloc" => virtual_alloc,
        "VirtualFree" => virtual_free,
        "VirtualProtect" => virtual_protect,
        "LocalAlloc" => local_alloc,
        "LocalFree" => local_free,
        "GlobalAlloc" => global_alloc,
        "GlobalFree" => global_free,

        // Threading and synchronization
        "CreateThread" => create_thread,
        "ResumeThread" => resume_thread,
        "SuspendThread" => suspend_thread,
        "ExitThread" => exit_thread,
        "GetExitCodeThread" => get_exit_code_thread,
        "WaitForSingleObject" => wait_for_single_object,
        "WaitForMultipleObjects" => wait_for_multiple_objects,
        "Sleep" => sleep,
        "InitializeCriticalSection" => init_critical_section,
        "InitializeCriticalSectionAndSpinCount" => init_critical_section_spin,
        "EnterCriticalSection" | "LeaveCriticalSection" | "DeleteCriticalSection" => {
            critical_section_noop
        }
        "CreateMutexA" => create_kernel_object_3,
        "CreateEventA" => create_event_a,
        "SetEvent" | "ResetEvent" | "ReleaseMutex" => bool_noop_1,
        "InterlockedIncrement" => interlocked_increment,
        "InterlockedDecrement" => interlocked_decrement,
        "InterlockedExchange" => interlocked_exchange,
        "InterlockedCompareExchange" => interlocked_compare_exchange,

        // TLS / FLS
        "TlsAlloc" => tls_alloc,
        "TlsGetValue" => tls_get_value,
        "TlsSetValue" => tls_set_value,
        "TlsFree" => tls_free,
        "FlsAlloc" => fls_alloc,
        "FlsGetValue" => tls_get_value,
        "FlsSetValue" => tls_set_value,
        "FlsFree" => tls_free,

        // Locale / encoding
        "GetACP" => get_acp,
        "GetOEMCP" => get_acp,
        "GetConsoleCP" | "GetConsoleOutputCP" => get_acp,
        "GetUserDefaultLCID" => get_user_default_lcid,
        "GetCPInfo" => get_cp_info,
        "MultiByteToWideChar" => multi_byte_to_wide_char,
        "WideCharToMultiByte" => wide_char_to_multi_byte,
        "LCMapStringA" => lc_map_string_a,
        "LCMapStringW" => lc_map_string_w,
        "CompareStringA" => compare_string_a,
        "CompareStringW" => compare_string_w,
        "GetStringTypeA" => get_string_type_a,
        "GetStringTypeW" => get_string_type_w,

        // Time
        "GetTickCount" => get_tick_count,
        "QueryPerformanceCounter" => query_performance_counter,
        "QueryPerformanceFrequency" => query_performance_frequency,
        "GetLocalTime" | "GetSystemTime" => get_system_time,
        "GetTimeZoneInformation" => get_time_zone_information,
        "FileTimeToSystemTime" => file_time_to_system_time,
        "FileTimeToLocalFileTime" => file_time_to_local_file_time,
        "GetSystemTimeAsFileTime" => get_system_time_as_file_time,

        // Files and directories
        "CreateFileA" => create_file_a,
        "CreateFileW" => create_file_w,
        "ReadFile" => read_file,
        "WriteFile" => write_file,
        "CloseHandle" => bool_noop_1,
        "GetStdHandle" => get_std_handle,
        "GetFileType" => get_file_type,
        "SetHandleCount" => set_handle_count,
        "FindFirstFileA" => find_first_file_a,
        "FindNextFileA" => find_next_file_a,
        "FindClose" => bool_noop_1,
        "GetCurrentDirectoryA" => get_current_directory_a,
        "GetWindowsDirectoryA" => get_windows_directory_a,
        "GetSystemDirectoryA" => get_system_directory_a,
        "GetFileAttributesA" => get_file_attributes_a,
        "GetDiskFreeSpaceA" => get_disk_free_space_a,
        "DeleteFileA" | "DeleteFileW" => bool_noop_1,
        "GetDriveTypeA" => get_drive_type_a,
        "GetFullPathNameA" => get_full_path_name_a,
        "GetShortPathNameA" => get_short_path_name_a,
        "GetConsoleMode" => get_console_mode,
        "SetConsoleCtrlHandler" => bool_noop_2,
        "Beep" => bool_noop_2,

        // Environment
        "GetEnvironmentStrings" | "GetEnvironmentStringsA" => get_environment_strings,
        "GetEnvironmentStringsW" => get_environment_strings_w,
        "FreeEnvironmentStringsA" | "FreeEnvironmentStringsW" => bool_noop_1,
        "GetEnvironmentVariableA" => get_environment_variable_a,

        // String helpers
        "lstrlenA" => lstrlen_a,
        "lstrcpyA" => lstrcpy_a,
        "lstrcatA" => lstrcat_a,
        "lstrcmpA" => lstrcmp_a,
        "lstrcmpiA" => lstrcmpi_a,

        // Error / exception plumbing
        "FormatMessageA" => format_message_a,
        "GetLastError" => get_last_error,
        "SetLastError" => set_last_error,
        "SetUnhandledExceptionFilter" => set_unhandled_exception_filter,
        "UnhandledExceptionFilter" => unhandled_exception_filter,
        "RaiseException" => raise_exception,
        "RtlUnwind" => rtl_unwind,
        "OutputDebugStringA" => output_debug_string_a,
        "DebugBreak" => debug_break,

        _ => return None,
    })
}

// ========================================================================
// Process / module introspection
// ========================================================================

fn get_version(emu: &mut Emulator) {
    emu.set_eax(VERSION_XP_SP2);
}

fn get_version_ex_a(emu: &mut Emulator) {
    let p = emu.arg(0);
    // OSVERSIONINFOA: cb, major, minor, build, platform, szCSDVersion[128]
    let _ = emu.mem.write32(p + 4, 5);
    let _ = emu.mem.write32(p + 8, 1);
    let _ = emu.mem.write32(p + 12, 2600);
    let _ = emu.mem.write32(p + 16, 2); // VER_PLATFORM_WIN32_NT
    emu.write_cstr(p + 20, "Service Pack 2");
    emu.set_eax(1);
    emu.stdcall_ret(1);
}

fn get_command_line_a(emu: &mut Emulator) {
    let ptr = emu.process.command_line_ptr;
    emu.set_eax(ptr);
}

fn get_command_line_w(emu: &mut Emulator) {
    let ptr = emu.process.command_line_w_ptr;
    emu.set_eax(ptr);
}

fn get_startup_info(emu: &mut Emulator) {
    let p = emu.arg(0);
    let _ = emu.mem.fill(p, 68, 0);
    let _ = emu.mem.write32(p, 68); // cb
    emu.stdcall_ret(1);
}

/// Lowercased file name with any .dll/.exe extension stripped
fn module_stem(name: &str) -> String {
    let file = name.rsplit(['\\', '/']).next().unwrap_or(name).to_lowercase();
    file.strip_suffix(".dll")
        .or_else(|| file.strip_suffix(".exe"))
        .unwrap_or(&file)
        .to_string()
}

fn module_handle_for(emu: &Emulator, name: &str) -> u32 {
    if name.is_empty() {
        return emu.process.image_base;
    }
    // The CRT asks for "KERNEL32" as often as "kernel32.dll"
    let want = module_stem(name);
    if want == module_stem(&emu.process.module_name) {
        return emu.process.image_base;
    }
    emu.modules
        .iter()
        .find(|m| module_stem(&m.name) == want)
        .map(|m| m.base)
        .unwrap_or(0)
}

fn get_module_handle_a(emu: &mut Emulator) {
    let p = emu.arg(0);
    let name = if p == 0 {
        String::new()
    } else {
        emu.read_cstr_lossy(p)
    };
    let base = module_handle_for(emu, &name);
    emu.set_eax(base);
    emu.stdcall_ret(1);
}

fn get_module_handle_w(emu: &mut Emulator) {
    let p = emu.arg(0);
    let name = if p == 0 {
        String::new()
    } else {
        emu.read_wstr_lossy(p)
    };
    let base = module_handle_for(emu, &name);
    emu.set_eax(base);
    emu.stdcall_ret(1);
}

fn get_module_file_name_a(emu: &mut Emulator) {
    let (_h, buf, _n) = (emu.arg(0), emu.arg(1), emu.arg(2));
    let path = emu.process.image_path.clone();
    emu.write_cstr(buf, &path);
    emu.set_eax(path.len() as u32);
    emu.stdcall_ret(3);
}

fn get_module_file_name_w(emu: &mut Emulator) {
    let (_h, buf, _n) = (emu.arg(0), emu.arg(1), emu.arg(2));
    let path = emu.process.image_path.clone();
    emu.write_wstr(buf, &path);
    emu.set_eax(path.len() as u32);
    emu.stdcall_ret(3);
}

fn get_current_process(emu: &mut Emulator) {
    emu.set_eax(0xFFFF_FFFF); // pseudo handle
}

fn get_current_process_id(emu: &mut Emulator) {
    emu.set_eax(ps::PROCESS_ID);
}

fn get_current_thread(emu: &mut Emulator) {
    emu.set_eax(0xFFFF_FFFE); // pseudo handle
}

fn get_current_thread_id(emu: &mut Emulator) {
    let tid = match emu.sched.current {
        Some(i) => emu.sched.threads[i].thread_id,
        None => ps::MAIN_THREAD_ID,
    };
    emu.set_eax(tid);
}

fn is_debugger_present(emu: &mut Emulator) {
    emu.set_eax(0);
}

fn is_processor_feature_present(emu: &mut Emulator) {
    let feature = emu.arg(0);
    // MMX (3), SSE (6), SSE2 (10)
    let present = matches!(feature, 3 | 6 | 10);
    emu.set_eax(present as u32);
    emu.stdcall_ret(1);
}

fn load_library_a(emu: &mut Emulator) {
    let name = emu.read_cstr_lossy(emu.arg(0));
    let existing = module_handle_for(emu, &name);
    let base = if existing != 0 {
        existing
    } else {
        let file = name.rsplit(['\\', '/']).next().unwrap_or(&name).to_string();
        let base = emu.dll_bases.alloc(0x1_0000);
        emu.modules.insert(base, 0x1_0000, &file);
        log::debug!("[W32] LoadLibraryA({file}) -> {base:#010x}");
        base
    };
    emu.set_eax(base);
    emu.stdcall_ret(1);
}

fn free_library(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(1);
}

fn get_proc_address(emu: &mut Emulator) {
    let (hmod, name_ptr) = (emu.arg(0), emu.arg(1));
    // Low name pointers are ordinals; not cataloged
    if name_ptr < 0x1_0000 {
        emu.set_eax(0);
        emu.stdcall_ret(2);
        return;
    }
    let name = emu.read_cstr_lossy(name_ptr);
    let dll = emu
        .modules
        .find(hmod)
        .map(|m| m.name.clone())
        .unwrap_or_else(|| "kernel32.dll".to_string());
    let addr = match super::resolve_name(&dll, &name) {
        Some(handler) => emu
            .shims
            .find_registered(&dll, &name)
            .or_else(|| emu.shims.register(&mut emu.mem, &dll, &name, handler).ok())
            .unwrap_or(0),
        None => 0,
    };
    if addr == 0 {
        log::debug!("[W32] GetProcAddress({dll}, {name}) -> NULL");
    }
    emu.set_eax(addr);
    emu.stdcall_ret(2);
}

fn get_system_info(emu: &mut Emulator) {
    let p = emu.arg(0);
    let _ = emu.mem.fill(p, 36, 0);
    let _ = emu.mem.write32(p + 4, 0x1000); // dwPageSize
    let _ = emu.mem.write32(p + 8, 0x0001_0000); // lpMinimumApplicationAddress
    let _ = emu.mem.write32(p + 12, 0x7FFE_FFFF); // lpMaximumApplicationAddress
    let _ = emu.mem.write32(p + 16, 1); // dwActiveProcessorMask
    let _ = emu.mem.write32(p + 20, 1); // dwNumberOfProcessors
    let _ = emu.mem.write32(p + 24, 586); // dwProcessorType
    let _ = emu.mem.write32(p + 28, 0x1_0000); // dwAllocationGranularity
    emu.stdcall_ret(1);
}

fn global_memory_status(emu: &mut Emulator) {
    let p = emu.arg(0);
    let _ = emu.mem.write32(p, 32); // dwLength
    let _ = emu.mem.write32(p + 4, 50); // dwMemoryLoad
    let _ = emu.mem.write32(p + 8, 0x2000_0000); // dwTotalPhys (512 MiB)
    let _ = emu.mem.write32(p + 12, 0x1000_0000); // dwAvailPhys
    let _ = emu.mem.write32(p + 16, 0x4000_0000);
    let _ = emu.mem.write32(p + 20, 0x3000_0000);
    let _ = emu.mem.write32(p + 24, 0x7FFE_0000);
    let _ = emu.mem.write32(p + 28, 0x7000_0000);
    emu.stdcall_ret(1);
}

fn set_error_mode(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(1);
}

fn exit_process(emu: &mut Emulator) {
    let code = emu.arg(0);
    log::info!("[W32] ExitProcess({code})");
    emu.exit_code = Some(code);
    emu.cpu.halted = true;
}

fn terminate_process(emu: &mut Emulator) {
    let code = emu.arg(1);
    log::info!("[W32] TerminateProcess(code {code})");
    emu.exit_code = Some(code);
    emu.cpu.halted = true;
}

// ========================================================================
// Heap and virtual memory
// ========================================================================

fn heap_create(emu: &mut Emulator) {
    // The handle is itself a guest address carrying a valid heap signature,
    // which is what the CRT small-block-heap probe checks before it spins.
    let handle = emu.kernel32.heap_alloc(0x40);
    let _ = emu.mem.write32(handle, HEAP_SIGNATURE);
    emu.set_eax(handle);
    emu.stdcall_ret(3);
}

fn heap_destroy(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(1);
}

fn get_process_heap(emu: &mut Emulator) {
    let h = emu.kernel32.process_heap;
    emu.set_eax(h);
}

fn heap_alloc(emu: &mut Emulator) {
    let (flags, size) = (emu.arg(1), emu.arg(2));
    let addr = emu.kernel32.heap_alloc(size);
    if addr != 0 && flags & HEAP_ZERO_MEMORY != 0 {
        let _ = emu.mem.fill(addr, size, 0);
    }
    emu.set_eax(addr);
    emu.stdcall_ret(3);
}

fn heap_realloc(emu: &mut Emulator) {
    let (flags, old, size) = (emu.arg(1), emu.arg(2), emu.arg(3));
    let new = emu.kernel32.heap_alloc(size);
    if new != 0 {
        let old_size = emu.kernel32.alloc_size(old).unwrap_or(0);
        let n = old_size.min(size);
        if n > 0 {
            if let Ok(bytes) = emu.mem.slice(old, n).map(<[u8]>::to_vec) {
                let _ = emu.mem.load(new, &bytes);
            }
        }
        if flags & HEAP_ZERO_MEMORY != 0 && size > n {
            let _ = emu.mem.fill(new + n, size - n, 0);
        }
    }
    emu.set_eax(new);
    emu.stdcall_ret(4);
}

fn heap_free(emu: &mut Emulator) {
    // Bump allocator: freeing is a no-op
    emu.set_eax(1);
    emu.stdcall_ret(3);
}

fn heap_size(emu: &mut Emulator) {
    let p = emu.arg(2);
    let size = emu.kernel32.alloc_size(p).unwrap_or(0xFFFF_FFFF);
    emu.set_eax(size);
    emu.stdcall_ret(3);
}

fn heap_validate(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(3);
}

fn virtual_alloc(emu: &mut Emulator) {
    let (addr, size) = (emu.arg(0), emu.arg(1));
    let result = if addr != 0 {
        // Committing inside an already-reserved range keeps its address
        addr
    } else {
        let base = emu.kernel32.valloc_cursor;
        emu.kernel32.valloc_cursor = (base + size + 0xFFFF) & !0xFFFF;
        base
    };
    emu.set_eax(result);
    emu.stdcall_ret(4);
}

fn virtual_free(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(3);
}

fn virtual_protect(emu: &mut Emulator) {
    let old_out = emu.arg(3);
    if old_out != 0 {
        let _ = emu.mem.write32(old_out, 0x04); // PAGE_READWRITE
    }
    emu.set_eax(1);
    emu.stdcall_ret(4);
}

fn local_alloc(emu: &mut Emulator) {
    let (flags, size) = (emu.arg(0), emu.arg(1));
    let addr = emu.kernel32.heap_alloc(size);
    if addr != 0 && flags & 0x40 != 0 {
        // LMEM_ZEROINIT
        let _ = emu.mem.fill(addr, size, 0);
    }
    emu.set_eax(addr);
    emu.stdcall_ret(2);
}

fn local_free(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(1);
}

fn global_alloc(emu: &mut Emulator) {
    local_alloc(emu);
}

fn global_free(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(1);
}

// ========================================================================
// Threading and synchronization
// ========================================================================

fn create_thread(emu: &mut Emulator) {
    let (start, param, flags, tid_out) = (emu.arg(2), emu.arg(3), emu.arg(4), emu.arg(5));
    let suspended = flags & CREATE_SUSPENDED != 0;
    let (handle, tid) = emu.sched.create_thread(start, param, suspended);
    if tid_out != 0 {
        let _ = emu.mem.write32(tid_out, tid);
    }
    emu.set_eax(handle);
    emu.stdcall_ret(6);
}

fn resume_thread(emu: &mut Emulator) {
    let handle = emu.arg(0);
    let prev = match emu.sched.by_handle_mut(handle) {
        Some(t) => {
            let prev = t.suspended as u32;
            t.suspended = false;
            prev
        }
        None => 0xFFFF_FFFF,
    };
    emu.set_eax(prev);
    emu.stdcall_ret(1);
}

fn suspend_thread(emu: &mut Emulator) {
    let handle = emu.arg(0);
    let prev = match emu.sched.by_handle_mut(handle) {
        Some(t) => {
            let prev = t.suspended as u32;
            t.suspended = true;
            prev
        }
        None => 0xFFFF_FFFF,
    };
    emu.set_eax(prev);
    emu.stdcall_ret(1);
}

fn exit_thread(emu: &mut Emulator) {
    let code = emu.arg(0);
    match emu.sched.current {
        Some(i) => {
            emu.sched.threads[i].completed = true;
            emu.sched.threads[i].exit_code = code;
            log::debug!(
                "[W32] ExitThread({code}) from thread {:#x}",
                emu.sched.threads[i].thread_id
            );
        }
        // ExitThread on the main thread ends the process
        None => {
            log::info!("[W32] ExitThread({code}) on main thread");
            emu.exit_code = Some(code);
        }
    }
    emu.cpu.halted = true;
}

fn get_exit_code_thread(emu: &mut Emulator) {
    let (handle, out) = (emu.arg(0), emu.arg(1));
    let code = emu
        .sched
        .by_handle_mut(handle)
        .map(|t| if t.completed { t.exit_code } else { STILL_ACTIVE });
    match code {
        Some(code) => {
            if out != 0 {
                let _ = emu.mem.write32(out, code);
            }
            emu.set_eax(1);
        }
        None => emu.set_eax(0),
    }
    emu.stdcall_ret(2);
}

fn wait_for_single_object(emu: &mut Emulator) {
    emu.set_eax(0); // WAIT_OBJECT_0, immediately
    emu.stdcall_ret(2);
}

fn wait_for_multiple_objects(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(4);
}

fn sleep(emu: &mut Emulator) {
    let ms = emu.arg(0);
    // Clean the guest stack first so the captured main-thread state resumes
    // at the caller once the scheduler hands control back.
    emu.stdcall_ret(1);
    log::trace!("[W32] Sleep({ms})");
    ke::sleep_yield(emu);
}

fn init_critical_section(emu: &mut Emulator) {
    emu.stdcall_ret(1);
}

fn init_critical_section_spin(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

fn critical_section_noop(emu: &mut Emulator) {
    emu.stdcall_ret(1);
}

/// Shared body for the 3-argument object creators (CreateMutexA)
fn create_kernel_object_3(emu: &mut Emulator) {
    let h = emu.kernel32.mint_handle();
    emu.set_eax(h);
    emu.stdcall_ret(3);
}

fn create_event_a(emu: &mut Emulator) {
    let h = emu.kernel32.mint_handle();
    emu.set_eax(h);
    emu.stdcall_ret(4);
}

fn bool_noop_1(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(1);
}

fn bool_noop_2(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

// Interlocked operations run atomically from the guest's point of view:
// nothing preempts a handler.

fn interlocked_increment(emu: &mut Emulator) {
    let p = emu.arg(0);
    let v = emu.mem.read32(p).unwrap_or(0).wrapping_add(1);
    let _ = emu.mem.write32(p, v);
    emu.set_eax(v);
    emu.stdcall_ret(1);
}

fn interlocked_decrement(emu: &mut Emulator) {
    let p = emu.arg(0);
    let v = emu.mem.read32(p).unwrap_or(0).wrapping_sub(1);
    let _ = emu.mem.write32(p, v);
    emu.set_eax(v);
    emu.stdcall_ret(1);
}

fn interlocked_exchange(emu: &mut Emulator) {
    let (p, new) = (emu.arg(0), emu.arg(1));
    let old = emu.mem.read32(p).unwrap_or(0);
    let _ = emu.mem.write32(p, new);
    emu.set_eax(old);
    emu.stdcall_ret(2);
}

fn interlocked_compare_exchange(emu: &mut Emulator) {
    let (p, new, cmp) = (emu.arg(0), emu.arg(1), emu.arg(2));
    let old = emu.mem.read32(p).unwrap_or(0);
    if old == cmp {
        let _ = emu.mem.write32(p, new);
    }
    emu.set_eax(old);
    emu.stdcall_ret(3);
}

// ========================================================================
// TLS / FLS
// ========================================================================

fn tls_alloc(emu: &mut Emulator) {
    let idx = emu.kernel32.next_tls;
    emu.kernel32.next_tls += 1;
    emu.set_eax(idx);
}

fn fls_alloc(emu: &mut Emulator) {
    let idx = emu.kernel32.next_fls;
    emu.kernel32.next_fls += 1;
    emu.set_eax(idx);
    emu.stdcall_ret(1);
}

fn tls_get_value(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(1);
}

fn tls_set_value(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

fn tls_free(emu: &mut Emulator) {
    emu.set_eax(1);
    emu.stdcall_ret(1);
}

// ========================================================================
// Locale / encoding (code page 1252 throughout)
// ========================================================================

fn get_acp(emu: &mut Emulator) {
    emu.set_eax(1252);
}

fn get_user_default_lcid(emu: &mut Emulator) {
    emu.set_eax(0x0409);
}

fn get_cp_info(emu: &mut Emulator) {
    let info = emu.arg(1);
    let _ = emu.mem.write32(info, 1); // MaxCharSize
    let _ = emu.mem.write8(info + 4, b'?'); // DefaultChar
    let _ = emu.mem.write8(info + 5, 0);
    let _ = emu.mem.fill(info + 6, 12, 0); // LeadByte
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

fn multi_byte_to_wide_char(emu: &mut Emulator) {
    let (src, cb_src) = (emu.arg(2), emu.arg(3));
    let (dst, cch_dst) = (emu.arg(4), emu.arg(5));
    let bytes = if cb_src == 0xFFFF_FFFF {
        let mut v = emu.mem.read_cstr(src).unwrap_or_default();
        v.push(0); // conversion includes the terminator
        v
    } else {
        emu.mem
            .slice(src, cb_src)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    };
    if cch_dst == 0 {
        emu.set_eax(bytes.len() as u32);
    } else {
        let n = bytes.len().min(cch_dst as usize);
        for (i, &b) in bytes.iter().take(n).enumerate() {
            // CP1252 widens byte-for-byte
            let _ = emu.mem.write16(dst + i as u32 * 2, b as u16);
        }
        emu.set_eax(n as u32);
    }
    emu.stdcall_ret(6);
}

fn wide_char_to_multi_byte(emu: &mut Emulator) {
    let (src, cch_src) = (emu.arg(2), emu.arg(3));
    let (dst, cb_dst) = (emu.arg(4), emu.arg(5));
    let used_default = emu.arg(7);
    let units = if cch_src == 0xFFFF_FFFF {
        let mut v = emu.mem.read_wstr(src).unwrap_or_default();
        v.push(0);
        v
    } else {
        (0..cch_src)
            .map_while(|i| emu.mem.read16(src + i * 2).ok())
            .collect()
    };
    if used_default != 0 {
        let _ = emu.mem.write32(used_default, 0);
    }
    if cb_dst == 0 {
        emu.set_eax(units.len() as u32);
    } else {
        let n = units.len().min(cb_dst as usize);
        for (i, &u) in units.iter().take(n).enumerate() {
            let b = if u <= 0xFF { u as u8 } else { b'?' };
            let _ = emu.mem.write8(dst + i as u32, b);
        }
        emu.set_eax(n as u32);
    }
    emu.stdcall_ret(8);
}

/// LCMAP_LOWERCASE / LCMAP_UPPERCASE
fn lc_map(flags: u32, s: &str) -> String {
    if flags & 0x100 != 0 {
        s.to_lowercase()
    } else if flags & 0x200 != 0 {
        s.to_uppercase()
    } else {
        s.to_string()
    }
}

fn lc_map_string_a(emu: &mut Emulator) {
    let (flags, src, c_src) = (emu.arg(1), emu.arg(2), emu.arg(3));
    let (dst, c_dst) = (emu.arg(4), emu.arg(5));
    let text = if c_src == 0xFFFF_FFFF {
        emu.read_cstr_lossy(src)
    } else {
        String::from_utf8_lossy(emu.mem.slice(src, c_src).unwrap_or(&[])).into_owned()
    };
    let mapped = lc_map(flags, &text);
    if c_dst == 0 {
        emu.set_eax(mapped.len() as u32 + 1);
    } else {
        emu.write_cstr(dst, &mapped);
        emu.set_eax(mapped.len() as u32 + 1);
    }
    emu.stdcall_ret(6);
}

fn lc_map_string_w(emu: &mut Emulator) {
    let (flags, src, c_src) = (emu.arg(1), emu.arg(2), emu.arg(3));
    let (dst, c_dst) = (emu.arg(4), emu.arg(5));
    let text = if c_src == 0xFFFF_FFFF {
        emu.read_wstr_lossy(src)
    } else {
        let units: Vec<u16> = (0..c_src)
            .map_while(|i| emu.mem.read16(src + i * 2).ok())
            .collect();
        String::from_utf16_lossy(&units)
    };
    let mapped = lc_map(flags, &text);
    if c_dst == 0 {
        emu.set_eax(mapped.encode_utf16().count() as u32 + 1);
    } else {
        emu.write_wstr(dst, &mapped);
        emu.set_eax(mapped.encode_utf16().count() as u32 + 1);
    }
    emu.stdcall_ret(6);
}

/// CSTR_LESS_THAN / CSTR_EQUAL / CSTR_GREATER_THAN
fn compare_result(a: &str, b: &str, ignore_case: bool) -> u32 {
    let ord = if ignore_case {
        a.to_lowercase().cmp(&b.to_lowercase())
    } else {
        a.cmp(b)
    };
    match ord {
        core::cmp::Ordering::Less => 1,
        core::cmp::Ordering::Equal => 2,
        core::cmp::Ordering::Greater => 3,
    }
}

fn compare_string_a(emu: &mut Emulator) {
    let flags = emu.arg(1);
    let (s1, c1, s2, c2) = (emu.arg(2), emu.arg(3), emu.arg(4), emu.arg(5));
    let read = |emu: &Emulator, p: u32, c: u32| -> String {
        if c == 0xFFFF_FFFF {
            emu.read_cstr_lossy(p)
        } else {
            String::from_utf8_lossy(emu.mem.slice(p, c).unwrap_or(&[])).into_owned()
        }
    };
    let a = read(emu, s1, c1);
    let b = read(emu, s2, c2);
    emu.set_eax(compare_result(&a, &b, flags & 1 != 0));
    emu.stdcall_ret(6);
}

fn compare_string_w(emu: &mut Emulator) {
    let flags = emu.arg(1);
    let (s1, c1, s2, c2) = (emu.arg(2), emu.arg(3), emu.arg(4), emu.arg(5));
    let read = |emu: &Emulator, p: u32, c: u32| -> String {
        if c == 0xFFFF_FFFF {
            emu.read_wstr_lossy(p)
        } else {
            let units: Vec<u16> = (0..c).map_while(|i| emu.mem.read16(p + i * 2).ok()).collect();
            String::from_utf16_lossy(&units)
        }
    };
    let a = read(emu, s1, c1);
    let b = read(emu, s2, c2);
    emu.set_eax(compare_result(&a, &b, flags & 1 != 0));
    emu.stdcall_ret(6);
}

/// CT_CTYPE1 classification for one CP1252 byte
fn ctype1(b: u8) -> u16 {
    let mut t = 0u16;
    if b.is_ascii_uppercase() {
        t |= 0x0001; // C1_UPPER
    }
    if b.is_ascii_lowercase() {
        t |= 0x0002; // C1_LOWER
    }
    if b.is_ascii_digit() {
        t |= 0x0004; // C1_DIGIT
    }
    if b.is_ascii_whitespace() {
        t |= 0x0008; // C1_SPACE
    }
    if b.is_ascii_punctuation() {
        t |= 0x0010; // C1_PUNCT
    }
    if b.is_ascii_control() {
        t |= 0x0020; // C1_CNTRL
    }
    if b == b' ' || b == b'\t' {
        t |= 0x0040; // C1_BLANK
    }
    if b.is_ascii_hexdigit() {
        t |= 0x0080; // C1_XDIGIT
    }
    if b.is_ascii_alphabetic() {
        t |= 0x0100; // C1_ALPHA
    }
    t
}

fn get_string_type_a(emu: &mut Emulator) {
    // (locale, dwInfoType, lpSrcStr, cchSrc, lpCharType)
    let (src, c, out) = (emu.arg(2), emu.arg(3), emu.arg(4));
    let bytes = if c == 0xFFFF_FFFF {
        emu.mem.read_cstr(src).unwrap_or_default()
    } else {
        emu.mem.slice(src, c).map(<[u8]>::to_vec).unwrap_or_default()
    };
    for (i, &b) in bytes.iter().enumerate() {
        let _ = emu.mem.write16(out + i as u32 * 2, ctype1(b));
    }
    emu.set_eax(1);
    emu.stdcall_ret(5);
}

fn get_string_type_w(emu: &mut Emulator) {
    // (dwInfoType, lpSrcStr, cchSrc, lpCharType) -- one argument fewer than A
    let (src, c, out) = (emu.arg(1), emu.arg(2), emu.arg(3));
    let units: Vec<u16> = if c == 0xFFFF_FFFF {
        emu.mem.read_wstr(src).unwrap_or_default()
    } else {
        (0..c).map_while(|i| emu.mem.read16(src + i * 2).ok()).collect()
    };
    for (i, &u) in units.iter().enumerate() {
        let b = if u <= 0xFF { u as u8 } else { b'?' };
        let _ = emu.mem.write16(out + i as u32 * 2, ctype1(b));
    }
    emu.set_eax(1);
    emu.stdcall_ret(4);
}

// ========================================================================
// Time (deterministic)
// ========================================================================

fn get_tick_count(emu: &mut Emulator) {
    emu.kernel32.tick = emu.kernel32.tick.wrapping_add(10);
    emu.set_eax(0x000A_0000 + emu.kernel32.tick);
}

fn query_performance_counter(emu: &mut Emulator) {
    let p = emu.arg(0);
    emu.kernel32.perf_counter += 1000;
    let v = emu.kernel32.perf_counter;
    let _ = emu.mem.write64(p, v);
    emu.set_eax(1);
    emu.stdcall_ret(1);
}

fn query_performance_frequency(emu: &mut Emulator) {
    let p = emu.arg(0);
    let _ = emu.mem.write64(p, 3_579_545);
    emu.set_eax(1);
    emu.stdcall_ret(1);
}

/// The fixed wall clock: 2003-06-17 12:00:00, a Tuesday
fn write_systemtime(emu: &mut Emulator, p: u32) {
    let fields: [u16; 8] = [2003, 6, 2, 17, 12, 0, 0, 0];
    for (i, f) in fields.iter().enumerate() {
        let _ = emu.mem.write16(p + i as u32 * 2, *f);
    }
}

fn get_system_time(emu: &mut Emulator) {
    let p = emu.arg(0);
    write_systemtime(emu, p);
    emu.stdcall_ret(1);
}

fn get_time_zone_information(emu: &mut Emulator) {
    let p = emu.arg(0);
    let _ = emu.mem.fill(p, 172, 0);
    emu.set_eax(0); // TIME_ZONE_ID_UNKNOWN
    emu.stdcall_ret(1);
}

fn file_time_to_system_time(emu: &mut Emulator) {
    let out = emu.arg(1);
    write_systemtime(emu, out);
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

fn file_time_to_local_file_time(emu: &mut Emulator) {
    let (src, dst) = (emu.arg(0), emu.arg(1));
    if let Ok(v) = emu.mem.read64(src) {
        let _ = emu.mem.write64(dst, v);
    }
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

fn get_system_time_as_file_time(emu: &mut Emulator) {
    let p = emu.arg(0);
    // 2003-06-17 12:00:00 UTC as a FILETIME
    let _ = emu.mem.write64(p, 0x01C3_34C1_2A4C_0000);
    emu.stdcall_ret(1);
}

// ========================================================================
// Files and directories
// ========================================================================

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;

fn create_file_common(emu: &mut Emulator, name: String) {
    let access = emu.arg(1);
    if access & GENERIC_READ != 0 && access & GENERIC_WRITE == 0 {
        // No host file system behind the emulator: reads fail
        log::debug!("[W32] CreateFile({name}) for read -> INVALID_HANDLE_VALUE");
        emu.set_eax(INVALID_HANDLE_VALUE);
    } else {
        let h = emu.kernel32.mint_handle();
        log::debug!("[W32] CreateFile({name}) for write -> {h:#x} (discarding)");
        emu.set_eax(h);
    }
    emu.stdcall_ret(7);
}

fn create_file_a(emu: &mut Emulator) {
    let name = emu.read_cstr_lossy(emu.arg(0));
    create_file_common(emu, name);
}

fn create_file_w(emu: &mut Emulator) {
    let name = emu.read_wstr_lossy(emu.arg(0));
    create_file_common(emu, name);
}

fn read_file(emu: &mut Emulator) {
    let read_out = emu.arg(3);
    if read_out != 0 {
        let _ = emu.mem.write32(read_out, 0);
    }
    emu.set_eax(0);
    emu.stdcall_ret(5);
}

fn write_file(emu: &mut Emulator) {
    let (handle, buf, len, written_out) = (emu.arg(0), emu.arg(1), emu.arg(2), emu.arg(3));
    if handle == STD_OUTPUT || handle == STD_ERROR {
        if let Ok(bytes) = emu.mem.slice(buf, len) {
            print!("{}", String::from_utf8_lossy(bytes));
        }
    }
    if written_out != 0 {
        let _ = emu.mem.write32(written_out, len);
    }
    emu.set_eax(1);
    emu.stdcall_ret(5);
}

fn get_std_handle(emu: &mut Emulator) {
    let which = emu.arg(0) as i32;
    let h = match which {
        -10 => STD_INPUT,
        -11 => STD_OUTPUT,
        -12 => STD_ERROR,
        _ => INVALID_HANDLE_VALUE,
    };
    emu.set_eax(h);
    emu.stdcall_ret(1);
}

fn get_file_type(emu: &mut Emulator) {
    emu.set_eax(2); // FILE_TYPE_CHAR
    emu.stdcall_ret(1);
}

fn set_handle_count(emu: &mut Emulator) {
    let n = emu.arg(0);
    emu.set_eax(n);
    emu.stdcall_ret(1);
}

fn find_first_file_a(emu: &mut Emulator) {
    emu.set_eax(INVALID_HANDLE_VALUE);
    emu.stdcall_ret(2);
}

fn find_next_file_a(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(2);
}

fn get_current_directory_a(emu: &mut Emulator) {
    let buf = emu.arg(1);
    emu.write_cstr(buf, ps::CURRENT_DIRECTORY);
    emu.set_eax(ps::CURRENT_DIRECTORY.len() as u32);
    emu.stdcall_ret(2);
}

fn get_windows_directory_a(emu: &mut Emulator) {
    let buf = emu.arg(0);
    emu.write_cstr(buf, ps::WINDOWS_DIRECTORY);
    emu.set_eax(ps::WINDOWS_DIRECTORY.len() as u32);
    emu.stdcall_ret(2);
}

fn get_system_directory_a(emu: &mut Emulator) {
    let buf = emu.arg(0);
    let dir = "C:\\WINDOWS\\System32";
    emu.write_cstr(buf, dir);
    emu.set_eax(dir.len() as u32);
    emu.stdcall_ret(2);
}

fn get_file_attributes_a(emu: &mut Emulator) {
    emu.set_eax(INVALID_HANDLE_VALUE); // INVALID_FILE_ATTRIBUTES
    emu.stdcall_ret(1);
}

fn get_disk_free_space_a(emu: &mut Emulator) {
    let outs = [emu.arg(1), emu.arg(2), emu.arg(3), emu.arg(4)];
    let values = [8u32, 512, 0x0010_0000, 0x0020_0000];
    for (p, v) in outs.iter().zip(values) {
        if *p != 0 {
            let _ = emu.mem.write32(*p, v);
        }
    }
    emu.set_eax(1);
    emu.stdcall_ret(5);
}

fn get_drive_type_a(emu: &mut Emulator) {
    emu.set_eax(3); // DRIVE_FIXED
    emu.stdcall_ret(1);
}

fn get_full_path_name_a(emu: &mut Emulator) {
    let (name_ptr, buf, part_out) = (emu.arg(0), emu.arg(2), emu.arg(3));
    let name = emu.read_cstr_lossy(name_ptr);
    let full = if name.len() >= 2 && name.as_bytes()[1] == b':' {
        name
    } else {
        format!("{}\\{name}", ps::CURRENT_DIRECTORY)
    };
    emu.write_cstr(buf, &full);
    if part_out != 0 {
        let _ = emu.mem.write32(part_out, 0);
    }
    emu.set_eax(full.len() as u32);
    emu.stdcall_ret(4);
}

fn get_short_path_name_a(emu: &mut Emulator) {
    let (src, dst) = (emu.arg(0), emu.arg(1));
    let name = emu.read_cstr_lossy(src);
    emu.write_cstr(dst, &name);
    emu.set_eax(name.len() as u32);
    emu.stdcall_ret(3);
}

fn get_console_mode(emu: &mut Emulator) {
    let out = emu.arg(1);
    if out != 0 {
        let _ = emu.mem.write32(out, 3);
    }
    emu.set_eax(1);
    emu.stdcall_ret(2);
}

// ========================================================================
// Environment
// ========================================================================

fn get_environment_strings(emu: &mut Emulator) {
    let p = emu.process.env_block_ptr;
    emu.set_eax(p);
}

fn get_environment_strings_w(emu: &mut Emulator) {
    // Returning NULL pushes the CRT onto its ANSI fallback path
    emu.set_eax(0);
}

fn get_environment_variable_a(emu: &mut Emulator) {
    emu.set_eax(0);
    emu.stdcall_ret(3);
}

// ========================================================================
// String helpers
// ========================================================================

fn lstrlen_a(emu: &mut Emulator) {
    let p = emu.arg(0);
    let len = if p == 0 {
        0
    } else {
        emu.mem.read_cstr(p).map(|s| s.len()).unwrap_or(0)
    };
    emu.set_eax(len as u32);
    emu.stdcall_ret(1);
}

fn lstrcpy_a(emu: &mut Emulator) {
    let (dst, src) = (emu.arg(0), emu.arg(1));
    if let Ok(bytes) = emu.mem.read_cstr(src) {
        let _ = emu.mem.load(dst, &bytes);
        let _ = emu.mem.write8(dst + bytes.len() as u32, 0);
    }
    emu.set_eax(dst);
    emu.stdcall_ret(2);
}

fn lstrcat_a(emu: &mut Emulator) {
    let (dst, src) = (emu.arg(0), emu.arg(1));
    if let (Ok(head), Ok(tail)) = (emu.mem.read_cstr(dst), emu.mem.read_cstr(src)) {
        let at = dst + head.len() as u32;
        let _ = emu.mem.load(at, &tail);
        let _ = emu.mem.write8(at + tail.len() as u32, 0);
    }
    emu.set_eax(dst);
    emu.stdcall_ret(2);
}

fn lstrcmp_common(emu: &mut Emulator, ignore_case: bool) {
    let (a, b) = (emu.arg(0), emu.arg(1));
    let mut a = emu.read_cstr_lossy(a);
    let mut b = emu.read_cstr_lossy(b);
    if ignore_case {
        a = a.to_lowercase();
        b = b.to_lowercase();
    }
    let r = match a.cmp(&b) {
        core::cmp::Ordering::Less => -1i32,
        core::cmp::Ordering::Equal => 0,
        core::cmp::Ordering::Greater => 1,
    };
    emu.set_eax(r as u32);
    emu.stdcall_ret(2);
}

fn lstrcmp_a(emu: &mut Emulator) {
    lstrcmp_common(emu, false);
}

fn lstrcmpi_a(emu: &mut Emulator) {
    lstrcmp_common(emu, true);
}

// ========================================================================
// Error / exception plumbing
// ========================================================================

/// Resolve `%1`..`%9` message inserts; `%%` is a literal percent and `%0`
/// terminates the message without a trailing newline
fn expand_inserts(template: &str, insert: impl Fn(u32) -> Option<String>) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('0') => {
                chars.next();
                break;
            }
            Some(d @ '1'..='9') => {
                chars.next();
                let index = d as u32 - '1' as u32;
                match insert(index) {
                    Some(text) => out.push_str(&text),
                    None => {
                        out.push('%');
                        out.push(d);
                    }
                }
            }
            _ => out.push('%'),
        }
    }
    out
}

fn format_message_a(emu: &mut Emulator) {
    let (flags, source, message_id) = (emu.arg(0), emu.arg(1), emu.arg(2));
    let (buffer, size, args_ptr) = (emu.arg(4), emu.arg(5), emu.arg(6));

    let template = if flags & FORMAT_MESSAGE_FROM_STRING != 0 {
        emu.read_cstr_lossy(source)
    } else {
        // No system or module message tables exist behind the emulator
        format!("Unknown error {message_id:#010x}.\r\n")
    };
    // Inserts come from the argument-array form: each slot is a char*
    let text = expand_inserts(&template, |index| {
        if args_ptr == 0 {
            return None;
        }
        let arg = emu.mem.read32(args_ptr + index * 4).ok()?;
        Some(emu.read_cstr_lossy(arg))
    });
    let bytes = text.into_bytes();

    let written = if flags & FORMAT_MESSAGE_ALLOCATE_BUFFER != 0 {
        // lpBuffer receives a pointer to a heap block holding the message
        let block = emu.kernel32.heap_alloc(bytes.len() as u32 + 1);
        if block != 0 {
            let _ = emu.mem.load(block, &bytes);
            let _ = emu.mem.write8(block + bytes.len() as u32, 0);
            let _ = emu.mem.write32(buffer, block);
            bytes.len() as u32
        } else {
            0
        }
    } else if buffer != 0 && size != 0 {
        let n = bytes.len().min(size as usize - 1);
        let _ = emu.mem.load(buffer, &bytes[..n]);
        let _ = emu.mem.write8(buffer + n as u32, 0);
        n as u32
    } else {
        0
    };
    emu.set_eax(written);
    emu.stdcall_ret(7);
}

fn get_last_error(emu: &mut Emulator) {
    // Last-error is untracked
    emu.set_eax(0);
}

fn set_last_error(emu: &mut Emulator) {
    emu.stdcall_ret(1);
}

fn set_unhandled_exception_filter(emu: &mut Emulator) {
    emu.set_eax(0); // no previous filter
    emu.stdcall_ret(1);
}

fn unhandled_exception_filter(emu: &mut Emulator) {
    emu.set_eax(0); // EXCEPTION_CONTINUE_SEARCH
    emu.stdcall_ret(1);
}

fn raise_exception(emu: &mut Emulator) {
    let (code, flags) = (emu.arg(0), emu.arg(1));
    log::warn!("[W32] RaiseException(code {code:#010x}, flags {flags:#x}), continuing");
    emu.stdcall_ret(4);
}

fn rtl_unwind(emu: &mut Emulator) {
    // Unwinding is a no-op in the emulated SEH model
    emu.stdcall_ret(4);
}

fn output_debug_string_a(emu: &mut Emulator) {
    let text = emu.read_cstr_lossy(emu.arg(0));
    println!("[DBG] {}", text.trim_end_matches(['\r', '\n']));
    emu.stdcall_ret(1);
}

fn debug_break(_emu: &mut Emulator) {
    log::warn!("[W32] DebugBreak() ignored (no debugger attached)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_alloc_non_overlapping() {
        let mut state = Kernel32State::new();
        let a = state.heap_alloc(100);
        let b = state.heap_alloc(50);
        assert!(b >= a + 100);
        assert_eq!(b % 8, 0);
        assert_eq!(state.alloc_size(a), Some(100));
        assert_eq!(state.alloc_size(0x1234), None);
    }

    #[test]
    fn test_version_packing() {
        assert_eq!(VERSION_XP_SP2 & 0xFF, 5);
        assert_eq!((VERSION_XP_SP2 >> 8) & 0xFF, 1);
        assert_eq!(VERSION_XP_SP2 >> 16, 2600);
    }

    #[test]
    fn test_ctype1_classification() {
        assert_eq!(ctype1(b'A') & 0x0101, 0x0101); // upper | alpha
        assert_eq!(ctype1(b'7') & 0x0084, 0x0084); // digit | xdigit
        assert_ne!(ctype1(b' ') & 0x0048, 0); // space | blank
        assert_ne!(ctype1(b'!') & 0x0010, 0); // punct
    }

    #[test]
    fn test_expand_inserts() {
        let args = ["disk", "C:"];
        let lookup = |i: u32| args.get(i as usize).map(|s| s.to_string());
        assert_eq!(
            expand_inserts("error on %1 (%2): 100%%", lookup),
            "error on disk (C:): 100%"
        );
        // %0 terminates; missing inserts stay literal
        assert_eq!(expand_inserts("done%0 ignored", lookup), "done");
        assert_eq!(expand_inserts("no %9 here", lookup), "no %9 here");
    }

    #[test]
    fn test_compare_result_order() {
        assert_eq!(compare_result("a", "b", false), 1);
        assert_eq!(compare_result("b", "b", false), 2);
        assert_eq!(compare_result("c", "b", false), 3);
        assert_eq!(compare_result("ABC", "abc", true), 2);
    }
}
