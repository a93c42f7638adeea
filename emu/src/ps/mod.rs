//! Process Manager (ps)
//!
//! Guest-visible process state: the TEB/PEB pair reachable through FS:, the
//! command line, and the argc/argv/envp block the CRT's `__getmainargs`
//! hands back. All of it lives at fixed low guest addresses.

pub mod peb;
pub mod teb;

pub use teb::resolve_fs_relative;

use crate::ldr::layout;
use crate::mm::{OutOfRange, VirtualMemory};

/// Fixed process id reported to the guest
pub const PROCESS_ID: u32 = 0x0000_0BC4;
/// Fixed main thread id
pub const MAIN_THREAD_ID: u32 = 0x0000_0BC8;

/// Synthetic current directory
pub const CURRENT_DIRECTORY: &str = "C:\\MCity";
/// Synthetic Windows directory
pub const WINDOWS_DIRECTORY: &str = "C:\\WINDOWS";

/// Guest process state
#[derive(Debug)]
pub struct Process {
    /// Load address of the main image
    pub image_base: u32,
    /// SizeOfImage of the main image
    pub image_size: u32,
    /// Full synthetic path ("C:\MCity\GAME.EXE")
    pub image_path: String,
    /// File name portion ("GAME.EXE")
    pub module_name: String,
    /// Command line as GetCommandLineA reports it
    pub command_line: String,
    /// TEB address (FS base)
    pub teb_base: u32,
    /// PEB address
    pub peb_base: u32,
    /// Guest address of the command line string
    pub command_line_ptr: u32,
    /// Guest address of the UTF-16 command line
    pub command_line_w_ptr: u32,
    /// argc for __getmainargs
    pub argc: u32,
    /// Guest address of the argv array
    pub argv_ptr: u32,
    /// Guest address of the envp array
    pub envp_ptr: u32,
    /// Guest address of the environment strings block
    pub env_block_ptr: u32,
    /// Guest dword cell behind __p__fmode
    pub fmode_ptr: u32,
    /// Guest dword cell behind __p__commode
    pub commode_ptr: u32,
}

impl Process {
    /// Describe a process about to run `exe_name`
    pub fn new(exe_name: &str) -> Self {
        let module_name = exe_name.to_uppercase();
        let image_path = format!("{CURRENT_DIRECTORY}\\{module_name}");
        Self {
            image_base: 0,
            image_size: 0,
            command_line: format!("\"{image_path}\""),
            image_path,
            module_name,
            teb_base: layout::TEB_BASE,
            peb_base: layout::PEB_BASE,
            command_line_ptr: 0,
            command_line_w_ptr: 0,
            argc: 0,
            argv_ptr: 0,
            envp_ptr: 0,
            env_block_ptr: 0,
            fmode_ptr: 0,
            commode_ptr: 0,
        }
    }

    /// Materialize TEB and PEB and wire the FS base fields
    pub fn init_kernel_structs(
        &self,
        mem: &mut VirtualMemory,
        process_heap: u32,
    ) -> Result<(), OutOfRange> {
        teb::write_teb(
            mem,
            self.teb_base,
            layout::STACK_TOP,
            layout::STACK_TOP - layout::STACK_SIZE,
            PROCESS_ID,
            MAIN_THREAD_ID,
            self.peb_base,
        )?;
        peb::write_peb(mem, self.peb_base, self.image_base, process_heap)?;
        log::debug!(
            "[PS] TEB at {:#010x}, PEB at {:#010x}",
            self.teb_base,
            self.peb_base
        );
        Ok(())
    }

    /// Build the command line / argv / envp block at [`layout::ARGS_BASE`]
    ///
    /// Layout, in order: ANSI command line, UTF-16 command line, argv
    /// strings, argv pointer array (NULL terminated), environment strings
    /// (double-NUL terminated), envp pointer array, fmode/commode cells.
    pub fn build_args_block(&mut self, mem: &mut VirtualMemory) -> Result<(), OutOfRange> {
        let mut cursor = layout::ARGS_BASE;

        self.command_line_ptr = cursor;
        mem.load(cursor, self.command_line.as_bytes())?;
        cursor += self.command_line.len() as u32 + 1;

        self.command_line_w_ptr = cursor;
        for unit in self.command_line.encode_utf16() {
            mem.write16(cursor, unit)?;
            cursor += 2;
        }
        mem.write16(cursor, 0)?;
        cursor += 2;

        // Single argv entry: the image path
        let arg0 = cursor;
        mem.load(cursor, self.image_path.as_bytes())?;
        cursor += self.image_path.len() as u32 + 1;

        cursor = (cursor + 3) & !3;
        self.argc = 1;
        self.argv_ptr = cursor;
        mem.write32(cursor, arg0)?;
        mem.write32(cursor + 4, 0)?;
        cursor += 8;

        // Environment: a minimal block the CRT can walk
        self.env_block_ptr = cursor;
        for entry in ["SystemRoot=C:\\WINDOWS", "TEMP=C:\\WINDOWS\\TEMP"] {
            mem.load(cursor, entry.as_bytes())?;
            cursor += entry.len() as u32 + 1;
        }
        mem.write8(cursor, 0)?;
        cursor += 1;

        cursor = (cursor + 3) & !3;
        self.envp_ptr = cursor;
        let mut env_str = self.env_block_ptr;
        for entry in ["SystemRoot=C:\\WINDOWS", "TEMP=C:\\WINDOWS\\TEMP"] {
            mem.write32(cursor, env_str)?;
            cursor += 4;
            env_str += entry.len() as u32 + 1;
        }
        mem.write32(cursor, 0)?;
        cursor += 4;

        self.fmode_ptr = cursor;
        mem.write32(cursor, 0)?;
        self.commode_ptr = cursor + 4;
        mem.write32(cursor + 4, 0)?;

        log::debug!(
            "[PS] args block: cmdline {:#010x}, argv {:#010x}, envp {:#010x}",
            self.command_line_ptr,
            self.argv_ptr,
            self.envp_ptr
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_block_layout() {
        let mut mem = VirtualMemory::new(0x40_0000);
        let mut proc = Process::new("game.exe");
        proc.build_args_block(&mut mem).unwrap();

        assert_eq!(proc.argc, 1);
        let cmd = mem.read_cstr(proc.command_line_ptr).unwrap();
        assert_eq!(cmd, b"\"C:\\MCity\\GAME.EXE\"");
        let arg0 = mem.read32(proc.argv_ptr).unwrap();
        assert_eq!(mem.read_cstr(arg0).unwrap(), b"C:\\MCity\\GAME.EXE");
        // argv is NULL terminated
        assert_eq!(mem.read32(proc.argv_ptr + 4).unwrap(), 0);
        // envp entries point at NAME=VALUE strings
        let env0 = mem.read32(proc.envp_ptr).unwrap();
        assert!(mem.read_cstr(env0).unwrap().starts_with(b"SystemRoot="));
    }

    #[test]
    fn test_kernel_structs() {
        let mut mem = VirtualMemory::new(0x40_0000);
        let mut proc = Process::new("game.exe");
        proc.image_base = 0x40_0000;
        proc.init_kernel_structs(&mut mem, 0x65_0000).unwrap();
        // FS:[0x18] self pointer
        assert_eq!(
            mem.read32(resolve_fs_relative(proc.teb_base, 0x18)).unwrap(),
            proc.teb_base
        );
        // FS:[0x30] -> PEB -> image base
        let peb = mem.read32(resolve_fs_relative(proc.teb_base, 0x30)).unwrap();
        assert_eq!(mem.read32(peb + peb::PEB_IMAGE_BASE).unwrap(), 0x40_0000);
    }
}
