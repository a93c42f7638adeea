//! win32emu
//!
//! A user-mode emulator that runs an unmodified Windows PE32 (i386)
//! executable on a non-Windows host. The image is parsed and materialized in
//! a flat 1 GiB guest address space, the machine code is interpreted
//! instruction by instruction, and every call into an imported DLL is
//! redirected through a trampoline to an in-process handler that synthesizes
//! the Win32 behavior.
//!
//! # Architecture Overview
//!
//! The subsystems follow the NT layering they emulate:
//!
//! - **ldr** - PE/COFF parsing, image materialization, IAT patching
//! - **mm**  - flat guest virtual memory
//! - **cpu** - IA-32 interpreter with x87
//! - **ke**  - guest threads and the cooperative scheduler
//! - **ps**  - TEB/PEB and the process argument block
//! - **cm**  - JSON-backed registry emulation
//! - **win32** - the trampoline table and the per-DLL handler library
//!
//! # Data Flow
//!
//! ```text
//! exe file ──ldr::PeImage──► headers + directories
//!      │
//!      ▼
//! ldr::map_image ──► guest memory at ImageBase
//!      │                    IAT slots ──► win32 shims (CD FE C3)
//!      ▼
//! cpu::step loop ──INT 0xFE──► handler ──mutates──► registers/memory
//!      │                                            │
//!      └── Sleep ──► ke::sleep_yield (worker slices) ┘
//! ```
//!
//! The library entry is [`run`]; the `win32emu` binary is a thin clap
//! wrapper around it.

pub mod cm;
pub mod cpu;
pub mod ke;
pub mod ldr;
pub mod mm;
pub mod ps;
pub mod win32;

#[cfg(test)]
pub mod testutil;

use std::path::{Path, PathBuf};

use cpu::{reg, Cpu, CpuFault, Event, REG_NAMES};
use ke::Scheduler;
use ldr::{layout, DllBaseAllocator, ModuleMap, PeImage};
use mm::VirtualMemory;
use ps::Process;
use win32::kernel32::{Kernel32State, HEAP_SIGNATURE};
use win32::user32::User32State;
use win32::ShimTable;

use core::fmt;

/// Instruction budget for a nested guest call (`_initterm`, TLS callbacks)
const GUEST_CALL_BUDGET: u64 = 100_000_000;

/// Host-side configuration for one emulator run
#[derive(Debug, Clone)]
pub struct EmuConfig {
    /// Guest address space size
    pub memory_size: usize,
    /// Path to registry.json (missing file is non-fatal)
    pub registry_path: Option<PathBuf>,
    /// Directories that would hold real DLLs; informational while imports
    /// are stubbed
    pub dll_search_paths: Vec<PathBuf>,
    /// Scheduler slice budget override
    pub slice_budget: u32,
    /// Scheduler idle-sleep limit override
    pub idle_limit: u32,
    /// Guest address of the CRT small-block-heap initializer to intercept
    pub patch_sbh_init: Option<u32>,
    /// Guest address of the CRT small-block allocator to intercept
    pub patch_sbh_alloc: Option<u32>,
    /// Guest address of _CrtDbgReport to intercept
    pub patch_crtdbg_report: Option<u32>,
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self {
            memory_size: mm::DEFAULT_MEMORY_SIZE,
            registry_path: None,
            dll_search_paths: Vec::new(),
            slice_budget: ke::THREAD_SLICE_BUDGET,
            idle_limit: ke::SCHEDULER_IDLE_LIMIT,
            patch_sbh_init: None,
            patch_sbh_alloc: None,
            patch_crtdbg_report: None,
        }
    }
}

/// Everything that can end a run abnormally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmuError {
    /// Host I/O failure reading the executable
    Io(String),
    /// Malformed PE image
    Parse(ldr::PeError),
    /// Guest fault surfaced by the interpreter
    Cpu(CpuFault),
    /// Software interrupt with no registered handler
    UnhandledInterrupt {
        /// Interrupt vector
        vector: u8,
        /// EIP after the INT instruction
        eip: u32,
    },
    /// Interrupt 0xFE at an address not in the shim or patch tables
    UnknownStub {
        /// The address looked up
        addr: u32,
    },
    /// A handler reported an unrecoverable condition
    HandlerFault(String),
    /// Sleep was called repeatedly with nothing to run
    SchedulerIdle,
}

impl fmt::Display for EmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmuError::Io(msg) => write!(f, "i/o error: {msg}"),
            EmuError::Parse(err) => write!(f, "image parse error: {err}"),
            EmuError::Cpu(fault) => write!(f, "guest fault: {fault}"),
            EmuError::UnhandledInterrupt { vector, eip } => {
                write!(f, "unhandled interrupt {vector:#04x} near EIP {eip:#010x}")
            }
            EmuError::UnknownStub { addr } => {
                write!(f, "interrupt 0xFE at unregistered address {addr:#010x}")
            }
            EmuError::HandlerFault(msg) => write!(f, "handler fault: {msg}"),
            EmuError::SchedulerIdle => write!(f, "scheduler idle: guest sleeps with no work"),
        }
    }
}

impl std::error::Error for EmuError {}

impl From<ldr::PeError> for EmuError {
    fn from(err: ldr::PeError) -> Self {
        EmuError::Parse(err)
    }
}

impl From<CpuFault> for EmuError {
    fn from(err: CpuFault) -> Self {
        EmuError::Cpu(err)
    }
}

impl From<mm::OutOfRange> for EmuError {
    fn from(err: mm::OutOfRange) -> Self {
        EmuError::Cpu(err.into())
    }
}

/// The whole emulated process: guest memory, interpreter, and every piece
/// of host-side OS state, owned in one place and passed to handlers
pub struct Emulator {
    /// Host configuration
    pub config: EmuConfig,
    /// Guest address space
    pub mem: VirtualMemory,
    /// Interpreter state
    pub cpu: Cpu,
    /// Trampoline and patch tables
    pub shims: ShimTable,
    /// Address -> module map
    pub modules: ModuleMap,
    /// DLL base address allocator
    pub dll_bases: DllBaseAllocator,
    /// Cooperative scheduler
    pub sched: Scheduler,
    /// Registry emulation
    pub registry: cm::Registry,
    /// Process-level guest state (TEB/PEB/args)
    pub process: Process,
    /// kernel32 allocators and counters
    pub kernel32: Kernel32State,
    /// user32 handle mints
    pub user32: User32State,
    /// Exit code once the guest terminates
    pub exit_code: Option<u32>,
    /// Set when the scheduler halts for liveness
    pub scheduler_idle: bool,
    /// Set by a handler to abort the run with a message
    pub fault: Option<String>,
    /// The API being dispatched, for diagnostics
    pub current_api: Option<(String, String)>,
    /// Guest address of the nested-call return sentinel
    call_sentinel: u32,
    /// Flag raised by the nested-call sentinel
    guest_call_done: bool,
}

impl Emulator {
    /// Build an emulator with empty guest memory and the configured registry
    pub fn new(config: EmuConfig) -> Self {
        let mut registry = cm::Registry::new();
        if let Some(path) = &config.registry_path {
            registry.load_file(path);
        }
        let mut sched = Scheduler::new();
        sched.slice_budget = config.slice_budget;
        sched.idle_limit = config.idle_limit;
        Self {
            mem: VirtualMemory::new(config.memory_size),
            cpu: Cpu::new(),
            shims: ShimTable::new(),
            modules: ModuleMap::default(),
            dll_bases: DllBaseAllocator::new(),
            sched,
            registry,
            process: Process::new("unknown.exe"),
            kernel32: Kernel32State::new(),
            user32: User32State::new(),
            exit_code: None,
            scheduler_idle: false,
            fault: None,
            current_api: None,
            call_sentinel: 0,
            guest_call_done: false,
            config,
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Materialize `image`, wire its imports, and set up the initial
    /// CPU/TEB/stack state
    pub fn load(&mut self, image: &PeImage, exe_name: &str) -> Result<(), EmuError> {
        let base = image.image_base();
        ldr::loader::map_image(&mut self.mem, image, base)?;
        ldr::loader::apply_relocations(&mut self.mem, image, base)?;

        self.process = Process::new(exe_name);
        self.process.image_base = base;
        self.process.image_size = image.optional_header.size_of_image;
        self.modules
            .insert(base, image.optional_header.size_of_image, &self.process.module_name);

        // Control-transfer sentinels live in the shim region like any API
        self.sched.sentinel =
            self.shims
                .register(&mut self.mem, "<emu>", "thread_return", thread_return)?;
        self.call_sentinel =
            self.shims
                .register(&mut self.mem, "<emu>", "call_return", call_return)?;

        self.wire_imports(image, base)?;

        if let Some(tls) = image.tls() {
            // TLS callbacks are rare in the targeted binaries; surface them
            log::warn!(
                "[LDR] TLS directory present with {} callback(s), not invoked",
                tls.callbacks.len()
            );
        }

        self.process
            .init_kernel_structs(&mut self.mem, self.kernel32.process_heap)?;
        self.mem
            .write32(self.kernel32.process_heap, HEAP_SIGNATURE)?;
        self.process.build_args_block(&mut self.mem)?;

        self.install_crt_patches()?;

        // Initial CPU state: entry point, stack, FS -> TEB. The thread
        // sentinel backs the entry's return address so a plain `ret` from
        // the entry point terminates cleanly.
        self.cpu.regs[reg::ESP] = layout::STACK_TOP;
        self.cpu.push32(&mut self.mem, self.sched.sentinel)?;
        self.cpu.eip = base.wrapping_add(image.entry_point());
        self.cpu.fs_base = self.process.teb_base;
        self.cpu.gs_base = self.process.teb_base;

        log::info!(
            "[LDR] {} mapped at {base:#010x}, entry {:#010x}, {} shims",
            self.process.module_name,
            self.cpu.eip,
            self.shims.len()
        );
        Ok(())
    }

    /// Patch every IAT slot with a shim address
    fn wire_imports(&mut self, image: &PeImage, base: u32) -> Result<(), EmuError> {
        let mut descriptors = image.imports();
        descriptors.extend(image.delay_imports());
        for desc in &descriptors {
            // Give the DLL an address range so GetModuleHandle has
            // something to report
            if self.modules.find_by_name(&desc.dll).is_none() {
                let dll_base = self.dll_bases.alloc(0x1_0000);
                self.modules.insert(dll_base, 0x1_0000, &desc.dll);
            }
            for entry in &desc.entries {
                let name = entry.target.label();
                let handler =
                    win32::resolve(&desc.dll, &entry.target).unwrap_or(win32::unimplemented);
                let addr = match self.shims.find_registered(&desc.dll, &name) {
                    Some(addr) => addr,
                    None => self
                        .shims
                        .register(&mut self.mem, &desc.dll, &name, handler)?,
                };
                self.mem.write32(base.wrapping_add(entry.iat_rva), addr)?;
            }
            log::debug!(
                "[LDR] wired {} imports from {}",
                desc.entries.len(),
                desc.dll
            );
        }
        Ok(())
    }

    /// Install the configured in-image CRT intercepts
    fn install_crt_patches(&mut self) -> Result<(), EmuError> {
        if let Some(addr) = self.config.patch_sbh_init {
            self.shims
                .patch(&mut self.mem, addr, "__sbh_heap_init", win32::msvcrt::sbh_heap_init)?;
        }
        if let Some(addr) = self.config.patch_sbh_alloc {
            self.shims.patch(
                &mut self.mem,
                addr,
                "__sbh_alloc_block",
                win32::msvcrt::sbh_alloc_block,
            )?;
        }
        if let Some(addr) = self.config.patch_crtdbg_report {
            self.shims.patch(
                &mut self.mem,
                addr,
                "_CrtDbgReport",
                win32::msvcrt::crt_dbg_report,
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handle interrupt 0xFE: EIP sits on the trampoline's RET, so the
    /// intercept address is `EIP - 2`
    pub fn dispatch_shim(&mut self) -> Result<(), EmuError> {
        let addr = self.cpu.eip.wrapping_sub(2);
        let shim = match self.shims.lookup(addr) {
            Some(shim) => shim.clone(),
            None => return Err(EmuError::UnknownStub { addr }),
        };
        log::trace!("[W32] {}!{}", shim.dll, shim.name);
        self.current_api = Some((shim.dll, shim.name));
        (shim.handler)(self);
        if let Some(msg) = self.fault.take() {
            return Err(EmuError::HandlerFault(msg));
        }
        Ok(())
    }

    /// Run one guest function to completion and return its EAX
    ///
    /// Used by handlers that must call back into the guest (`_initterm`,
    /// TLS callbacks). The current CPU state is saved around the call; the
    /// guest's own stack carries the frame. A process exit inside the
    /// callee sticks.
    pub fn call_guest(&mut self, entry: u32, args: &[u32]) -> u32 {
        let saved = ke::CpuSnapshot::capture(&self.cpu);
        let saved_done = self.guest_call_done;
        for &a in args.iter().rev() {
            let _ = self.cpu.push32(&mut self.mem, a);
        }
        let _ = self.cpu.push32(&mut self.mem, self.call_sentinel);
        self.cpu.eip = entry;
        self.cpu.halted = false;
        self.guest_call_done = false;

        let mut steps: u64 = 0;
        loop {
            if steps >= GUEST_CALL_BUDGET {
                log::error!("[CRT] nested guest call at {entry:#010x} exceeded its budget");
                break;
            }
            match self.cpu.step(&mut self.mem) {
                Ok(Event::None) => {}
                Ok(Event::Interrupt(0xFE)) => {
                    if let Err(err) = self.dispatch_shim() {
                        log::warn!("[CRT] nested guest call stub fault: {err}");
                        break;
                    }
                    if self.guest_call_done {
                        break;
                    }
                }
                Ok(Event::Interrupt(vector)) => {
                    log::warn!("[CRT] nested guest call raised interrupt {vector:#04x}");
                    break;
                }
                Err(fault) => {
                    log::warn!("[CRT] nested guest call faulted: {fault}");
                    break;
                }
            }
            if self.cpu.halted {
                break;
            }
            steps += 1;
        }

        let ret = self.cpu.regs[reg::EAX];
        saved.restore(&mut self.cpu);
        self.guest_call_done = saved_done;
        if self.exit_code.is_some() {
            self.cpu.halted = true;
        }
        ret
    }

    /// The outer interpreter loop
    pub fn run_loop(&mut self) -> Result<i32, EmuError> {
        loop {
            if self.cpu.halted {
                if let Some(code) = self.exit_code {
                    log::info!("[EMU] guest terminated with exit code {code}");
                    return Ok(code as i32);
                }
                if self.scheduler_idle {
                    return Err(EmuError::SchedulerIdle);
                }
                return Ok(0);
            }
            match self.cpu.step(&mut self.mem) {
                Ok(Event::None) => {}
                Ok(Event::Interrupt(0xFE)) => {
                    if let Err(err) = self.dispatch_shim() {
                        self.report_fault(&err);
                        return Err(err);
                    }
                }
                Ok(Event::Interrupt(vector)) => {
                    let err = EmuError::UnhandledInterrupt {
                        vector,
                        eip: self.cpu.eip,
                    };
                    self.report_fault(&err);
                    return Err(err);
                }
                Err(fault) => {
                    let err = EmuError::Cpu(fault);
                    self.report_fault(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Print the fault diagnostic: bounds, containing module, register file
    /// with per-register address validity
    pub fn report_fault(&mut self, err: &EmuError) {
        self.cpu.halted = true;
        let bounds = self.mem.bounds();
        println!("==== guest fault ====");
        println!("{err}");
        println!("memory bounds: {bounds:#010x}");
        let eip = self.cpu.eip;
        match self.modules.find(eip) {
            Some(m) => println!(
                "EIP {eip:#010x} in {} (base {:#010x} +{:#x})",
                m.name,
                m.base,
                eip - m.base
            ),
            None => println!("EIP {eip:#010x} not inside any mapped module"),
        }
        for (i, name) in REG_NAMES.iter().enumerate() {
            let v = self.cpu.regs[i];
            let validity = if v < bounds { "" } else { "  <out of range>" };
            println!("  {name} = {v:#010x}{validity}");
        }
        let esp = self.cpu.regs[reg::ESP];
        if esp >= bounds || esp < 0x1000 {
            println!("  stack pointer invalid");
        }
        if let Some((dll, name)) = &self.current_api {
            println!("last API dispatched: {dll}!{name}");
        }
    }

    // ========================================================================
    // Handler conveniences
    // ========================================================================

    /// Stack argument `i` (zero-based dwords above the return address)
    pub fn arg(&self, i: u32) -> u32 {
        win32::shim::read_arg(&self.cpu, &self.mem, i)
    }

    /// Win32 return value
    pub fn set_eax(&mut self, v: u32) {
        self.cpu.regs[reg::EAX] = v;
    }

    /// stdcall epilogue for a handler taking `argc` dword arguments
    pub fn stdcall_ret(&mut self, argc: u32) {
        win32::shim::ret_stdcall(&mut self.cpu, &mut self.mem, argc * 4);
    }

    /// Zero-terminated guest string, lossily decoded; empty on any fault
    pub fn read_cstr_lossy(&self, addr: u32) -> String {
        if addr == 0 {
            return String::new();
        }
        self.mem
            .read_cstr(addr)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }

    /// Zero-terminated guest UTF-16 string, lossily decoded
    pub fn read_wstr_lossy(&self, addr: u32) -> String {
        if addr == 0 {
            return String::new();
        }
        self.mem
            .read_wstr(addr)
            .map(|u| String::from_utf16_lossy(&u))
            .unwrap_or_default()
    }

    /// Write a zero-terminated byte string into guest memory
    pub fn write_cstr(&mut self, addr: u32, s: &str) {
        if self.mem.load(addr, s.as_bytes()).is_err()
            || self.mem.write8(addr + s.len() as u32, 0).is_err()
        {
            log::warn!("[W32] string write to {addr:#010x} out of range");
        }
    }

    /// Write a zero-terminated UTF-16 string into guest memory
    pub fn write_wstr(&mut self, addr: u32, s: &str) {
        let mut at = addr;
        for unit in s.encode_utf16() {
            if self.mem.write16(at, unit).is_err() {
                log::warn!("[W32] wide string write to {addr:#010x} out of range");
                return;
            }
            at += 2;
        }
        let _ = self.mem.write16(at, 0);
    }
}

/// Thread-return sentinel: a worker returning from its entry completes it;
/// the main thread returning from the image entry point ends the process
/// with EAX as exit code
fn thread_return(emu: &mut Emulator) {
    match emu.sched.current {
        Some(i) => {
            emu.sched.threads[i].completed = true;
            emu.sched.threads[i].exit_code = emu.cpu.regs[reg::EAX];
        }
        None => {
            emu.exit_code = Some(emu.cpu.regs[reg::EAX]);
        }
    }
    emu.cpu.halted = true;
}

/// Nested-call sentinel used by [`Emulator::call_guest`]
fn call_return(emu: &mut Emulator) {
    emu.guest_call_done = true;
}

/// Run a PE32 executable to completion and return its exit code
pub fn run(
    exe_path: &Path,
    dll_search_paths: &[PathBuf],
    mut config: EmuConfig,
) -> Result<i32, EmuError> {
    config.dll_search_paths = dll_search_paths.to_vec();
    for dir in &config.dll_search_paths {
        log::debug!("[EMU] dll search path: {} (imports are stubbed)", dir.display());
    }

    let data = std::fs::read(exe_path).map_err(|e| EmuError::Io(e.to_string()))?;
    let image = PeImage::parse(data)?;
    let exe_name = exe_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown.exe".to_string());

    let mut emu = Emulator::new(config);
    emu.load(&image, &exe_name)?;
    emu.run_loop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::PeBuilder;

    fn emulator_with(builder: PeBuilder) -> Emulator {
        let image = PeImage::parse(builder.build()).unwrap();
        let mut emu = Emulator::new(EmuConfig::default());
        emu.load(&image, "test.exe").unwrap();
        emu
    }

    #[test]
    fn test_iat_slots_point_at_registered_shims() {
        let image = PeImage::parse(
            PeBuilder::new()
                .import("KERNEL32.dll", &["ExitProcess", "GetVersion", "Sleep"])
                .build(),
        )
        .unwrap();
        let mut emu = Emulator::new(EmuConfig::default());
        emu.load(&image, "test.exe").unwrap();

        for desc in image.imports() {
            for entry in &desc.entries {
                let slot = emu
                    .mem
                    .read32(image.image_base() + entry.iat_rva)
                    .unwrap();
                let expected = emu
                    .shims
                    .find_registered(&desc.dll, &entry.target.label())
                    .unwrap();
                assert_eq!(slot, expected, "IAT slot for {}", entry.target.label());
            }
        }
    }

    #[test]
    fn test_trampoline_dispatch_scenario() {
        // S5: a stub that sets EAX=0xDEADBEEF; two steps land back at the
        // return address with EAX written.
        fn stub(emu: &mut Emulator) {
            emu.set_eax(0xDEAD_BEEF);
        }
        let mut emu = emulator_with(PeBuilder::new());
        let addr = emu
            .shims
            .register(&mut emu.mem, "test.dll", "stub", stub)
            .unwrap();
        emu.cpu.regs[reg::ESP] = 0x0070_0000;
        emu.cpu.push32(&mut emu.mem, 0x0040_1234).unwrap();
        emu.cpu.eip = addr;

        // Step 1: INT 0xFE
        match emu.cpu.step(&mut emu.mem).unwrap() {
            Event::Interrupt(0xFE) => emu.dispatch_shim().unwrap(),
            other => panic!("expected trampoline interrupt, got {other:?}"),
        }
        assert_eq!(emu.cpu.regs[reg::EAX], 0xDEAD_BEEF);
        assert_eq!(emu.cpu.eip, addr + 2); // resting on the RET
        // Step 2: RET
        emu.cpu.step(&mut emu.mem).unwrap();
        assert_eq!(emu.cpu.eip, 0x0040_1234);
        assert_eq!(emu.cpu.regs[reg::ESP], 0x0070_0000);
    }

    #[test]
    fn test_unknown_stub_is_fatal() {
        let mut emu = emulator_with(PeBuilder::new());
        emu.mem.load(0x0060_0000, &[0xCD, 0xFE, 0xC3]).unwrap();
        emu.cpu.eip = 0x0060_0000;
        emu.cpu.regs[reg::ESP] = 0x0070_0000;
        emu.cpu.step(&mut emu.mem).unwrap();
        assert_eq!(
            emu.dispatch_shim(),
            Err(EmuError::UnknownStub { addr: 0x0060_0000 })
        );
    }

    #[test]
    fn test_end_to_end_exit_process() {
        // push 7; call [ExitProcess IAT slot]
        let iat_exit = 0x0040_3060u32;
        let code = [
            0x6A, 0x07, // push 7
            0xFF, 0x15, 0x60, 0x30, 0x40, 0x00, // call [0x403060]
        ];
        let mut emu = emulator_with(
            PeBuilder::new()
                .import("KERNEL32.dll", &["ExitProcess"])
                .text(&code),
        );
        assert!(emu.mem.read32(iat_exit).unwrap() >= layout::SHIM_BASE);
        let exit = emu.run_loop().unwrap();
        assert_eq!(exit, 7);
    }

    #[test]
    fn test_cooperative_switch_scenario() {
        // S6: main creates a thread writing 0x1234 to 0x500000, then
        // sleeps; after Sleep the write is visible and main continues.
        let code = [
            0x6A, 0x00, // push 0        (lpThreadId)
            0x6A, 0x00, // push 0        (dwCreationFlags)
            0x6A, 0x00, // push 0        (lpParameter)
            0x68, 0x40, 0x10, 0x40, 0x00, // push 0x401040 (lpStartAddress)
            0x6A, 0x00, // push 0        (dwStackSize)
            0x6A, 0x00, // push 0        (lpThreadAttributes)
            0xFF, 0x15, 0x60, 0x30, 0x40, 0x00, // call [CreateThread]
            0x6A, 0x00, // push 0
            0xFF, 0x15, 0x64, 0x30, 0x40, 0x00, // call [Sleep]
            // marker the main thread reaches after Sleep returns
            0xC7, 0x05, 0x04, 0x00, 0x50, 0x00, 0x78, 0x56, 0x00, 0x00, // mov [0x500004], 0x5678
            0x6A, 0x00, // push 0
            0xFF, 0x15, 0x68, 0x30, 0x40, 0x00, // call [ExitProcess]
        ];
        let mut thread_fn = vec![0u8; 0x40 - code.len()];
        // Pad main up to rva 0x1040 where the thread entry lives
        let mut text = code.to_vec();
        text.append(&mut thread_fn);
        text.extend_from_slice(&[
            0xC7, 0x05, 0x00, 0x00, 0x50, 0x00, 0x34, 0x12, 0x00, 0x00, // mov [0x500000], 0x1234
            0xC3, // ret
        ]);
        let mut emu = emulator_with(
            PeBuilder::new()
                .import("KERNEL32.dll", &["CreateThread", "Sleep", "ExitProcess"])
                .text(&text),
        );
        let exit = emu.run_loop().unwrap();
        assert_eq!(exit, 0);
        // The worker ran during Sleep
        assert_eq!(emu.mem.read32(0x0050_0000).unwrap(), 0x1234);
        // The main thread resumed after Sleep and reached its marker
        assert_eq!(emu.mem.read32(0x0050_0004).unwrap(), 0x5678);
        assert!(emu.sched.threads[0].completed);
    }

    #[test]
    fn test_scheduler_idle_halts() {
        // Endless Sleep loop with no threads: jmp back to the Sleep call
        let code = [
            0x6A, 0x00, // push 0
            0xFF, 0x15, 0x60, 0x30, 0x40, 0x00, // call [Sleep]
            0xEB, 0xF6, // jmp -10
        ];
        let mut emu = emulator_with(
            PeBuilder::new()
                .import("KERNEL32.dll", &["Sleep"])
                .text(&code),
        );
        assert_eq!(emu.run_loop(), Err(EmuError::SchedulerIdle));
    }

    #[test]
    fn test_unimplemented_import_faults_with_name() {
        let code = [
            0xFF, 0x15, 0x60, 0x30, 0x40, 0x00, // call [Direct3DCreate8]
        ];
        let mut emu = emulator_with(
            PeBuilder::new()
                .import("d3d8.dll", &["Direct3DCreate8"])
                .text(&code),
        );
        match emu.run_loop() {
            Err(EmuError::HandlerFault(msg)) => {
                assert!(msg.contains("Direct3DCreate8"), "message: {msg}");
            }
            other => panic!("expected handler fault, got {other:?}"),
        }
    }

    #[test]
    fn test_bstr_contract() {
        // Property 6: SysStringByteLen(SysAllocString(s)) == 2k and the
        // payload is s widened to UTF-16LE with the length at bstr - 4.
        let mut emu = emulator_with(PeBuilder::new());
        let text = b"Motor City";
        let src = 0x0060_0000;
        for (i, &b) in text.iter().enumerate() {
            emu.mem.write16(src + i as u32 * 2, b as u16).unwrap();
        }
        emu.mem.write16(src + text.len() as u32 * 2, 0).unwrap();

        let units = emu.mem.read_wstr(src).unwrap();
        let bstr = {
            // Exercise the public allocation path directly
            let payload = win32::oleaut32::alloc_bstr(&mut emu, text.len() as u32 * 2);
            for (i, &b) in text.iter().enumerate() {
                emu.mem.write16(payload + i as u32 * 2, b as u16).unwrap();
            }
            payload
        };
        assert_eq!(units.len(), text.len());
        assert_eq!(
            emu.mem.read32(bstr - 4).unwrap(),
            text.len() as u32 * 2,
            "byte length lives at bstr - 4"
        );
        for (i, &b) in text.iter().enumerate() {
            assert_eq!(emu.mem.read16(bstr + i as u32 * 2).unwrap(), b as u16);
        }
        // Terminating zero code unit past the payload
        assert_eq!(
            emu.mem.read16(bstr + text.len() as u32 * 2).unwrap(),
            0
        );
    }

    proptest::proptest! {
        /// Property 5: after stdcall cleanup for N argument bytes, ESP has
        /// advanced by N and the return address sits at the new ESP.
        #[test]
        fn prop_stdcall_cleanup(args in proptest::collection::vec(proptest::prelude::any::<u32>(), 0..8)) {
            let mut mem = VirtualMemory::new(0x1_0000);
            let mut cpu = Cpu::new();
            let esp = 0x8000u32;
            cpu.regs[reg::ESP] = esp;
            mem.write32(esp, 0x0040_AAAA).unwrap();
            for (i, &a) in args.iter().enumerate() {
                mem.write32(esp + 4 + i as u32 * 4, a).unwrap();
            }
            let arg_bytes = args.len() as u32 * 4;
            win32::shim::ret_stdcall(&mut cpu, &mut mem, arg_bytes);
            proptest::prop_assert_eq!(cpu.regs[reg::ESP], esp + arg_bytes);
            proptest::prop_assert_eq!(mem.read32(cpu.regs[reg::ESP]).unwrap(), 0x0040_AAAA);
        }
    }
}
