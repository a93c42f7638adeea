//! Cooperative scheduler
//!
//! `Sleep` by the main thread is the only suspension point. One runnable
//! worker gets a slice of up to [`THREAD_SLICE_BUDGET`] instructions, then
//! the main thread's state comes back before `Sleep` returns. A worker
//! yields early when it completes (sentinel return, `ExitThread`, process
//! exit) or faults; a fault completes the thread without touching the main
//! thread.
//!
//! A guest that calls `Sleep` forever with no runnable worker is a liveness
//! hazard; after [`SCHEDULER_IDLE_LIMIT`] consecutive idle sleeps the
//! interpreter halts with a diagnostic.

use super::thread::{CpuSnapshot, GuestThread};
use crate::cpu::{reg, Event};
use crate::ldr::layout;
use crate::Emulator;

/// Instructions a worker may retire per Sleep-driven slice
pub const THREAD_SLICE_BUDGET: u32 = 1_000_000;

/// Consecutive idle Sleep calls before the interpreter gives up
pub const SCHEDULER_IDLE_LIMIT: u32 = 50;

/// Scheduler state: the thread table and the liveness counters
#[derive(Debug)]
pub struct Scheduler {
    /// All threads ever created, never reclaimed
    pub threads: Vec<GuestThread>,
    /// Index of the running worker; `None` while the main thread runs
    pub current: Option<usize>,
    /// Consecutive Sleeps that found nothing runnable
    pub idle_sleeps: u32,
    /// Guest address of the thread-return sentinel
    pub sentinel: u32,
    /// Per-slice instruction budget
    pub slice_budget: u32,
    /// Idle-sleep halt threshold
    pub idle_limit: u32,
    next_handle: u32,
    next_thread_id: u32,
}

impl Scheduler {
    /// Empty scheduler with the default budgets
    pub fn new() -> Self {
        Self {
            threads: Vec::new(),
            current: None,
            idle_sleeps: 0,
            sentinel: 0,
            slice_budget: THREAD_SLICE_BUDGET,
            idle_limit: SCHEDULER_IDLE_LIMIT,
            next_handle: 0x0000_0100,
            next_thread_id: 0x0000_1002,
        }
    }

    /// Queue a new thread; no guest code runs until the next Sleep
    pub fn create_thread(&mut self, start: u32, parameter: u32, suspended: bool) -> (u32, u32) {
        let handle = self.next_handle;
        let thread_id = self.next_thread_id;
        self.next_handle += 4;
        self.next_thread_id += 4;
        self.threads.push(GuestThread {
            handle,
            thread_id,
            start_address: start,
            parameter,
            suspended,
            started: false,
            completed: false,
            exit_code: 0,
            context: None,
        });
        log::debug!(
            "[KE] created thread {thread_id:#x} entry {start:#010x} (suspended: {suspended})"
        );
        (handle, thread_id)
    }

    /// Find a thread by its handle
    pub fn by_handle_mut(&mut self, handle: u32) -> Option<&mut GuestThread> {
        self.threads.iter_mut().find(|t| t.handle == handle)
    }

    /// First runnable thread in creation order
    fn next_runnable(&self) -> Option<usize> {
        self.threads.iter().position(|t| t.runnable())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// The `Sleep` suspension point
///
/// Called by the Sleep handler after it has cleaned up the guest stack, so
/// the captured main-thread state resumes correctly. A Sleep from a worker
/// is a no-op; workers cannot nest the scheduler.
pub fn sleep_yield(emu: &mut Emulator) {
    if emu.sched.current.is_some() {
        return;
    }

    let Some(idx) = emu.sched.next_runnable() else {
        emu.sched.idle_sleeps += 1;
        if emu.sched.idle_sleeps >= emu.sched.idle_limit {
            log::warn!(
                "[KE] {} consecutive Sleep calls with no runnable thread, halting",
                emu.sched.idle_sleeps
            );
            emu.scheduler_idle = true;
            emu.cpu.halted = true;
        }
        return;
    };
    emu.sched.idle_sleeps = 0;

    let main_ctx = CpuSnapshot::capture(&emu.cpu);
    switch_in(emu, idx);
    emu.sched.current = Some(idx);
    run_slice(emu, idx);
    emu.sched.current = None;

    main_ctx.restore(&mut emu.cpu);
    // A worker may have requested process exit; keep that halt sticky.
    if emu.exit_code.is_some() {
        emu.cpu.halted = true;
    }
}

/// Restore a worker's saved state, or build its initial frame
fn switch_in(emu: &mut Emulator, idx: usize) {
    let thread = &emu.sched.threads[idx];
    if let Some(ctx) = thread.context {
        ctx.restore(&mut emu.cpu);
        return;
    }

    // First run: fresh registers, a private stack, the parameter at
    // [ESP+4], and the return sentinel as the return address.
    let stack_top =
        layout::STACK_TOP - layout::STACK_SIZE - (idx as u32 + 1) * layout::THREAD_STACK_SIZE;
    let esp = stack_top - 16;
    let (start, param) = (thread.start_address, thread.parameter);
    let sentinel = emu.sched.sentinel;

    emu.cpu.regs = [0; 8];
    emu.cpu.regs[reg::ESP] = esp;
    emu.cpu.eip = start;
    emu.cpu.eflags = crate::cpu::Eflags::IF;
    emu.cpu.fpu = Default::default();
    emu.cpu.halted = false;
    let _ = emu.mem.write32(esp, sentinel);
    let _ = emu.mem.write32(esp + 4, param);
    emu.sched.threads[idx].started = true;
    log::debug!(
        "[KE] thread {:#x} first slice at {start:#010x}",
        emu.sched.threads[idx].thread_id
    );
}

/// Step the worker until its budget elapses, it completes, or it faults
fn run_slice(emu: &mut Emulator, idx: usize) {
    let budget = emu.sched.slice_budget;
    let mut steps = 0u32;
    while steps < budget {
        match emu.cpu.step(&mut emu.mem) {
            Ok(Event::None) => {}
            Ok(Event::Interrupt(0xFE)) => {
                if let Err(err) = emu.dispatch_shim() {
                    log::warn!(
                        "[KE] thread {:#x} stub fault: {err}",
                        emu.sched.threads[idx].thread_id
                    );
                    emu.sched.threads[idx].completed = true;
                    break;
                }
            }
            Ok(Event::Interrupt(vector)) => {
                log::warn!(
                    "[KE] thread {:#x} raised unhandled interrupt {vector:#04x}",
                    emu.sched.threads[idx].thread_id
                );
                emu.sched.threads[idx].completed = true;
                break;
            }
            Err(fault) => {
                log::warn!(
                    "[KE] thread {:#x} faulted: {fault}",
                    emu.sched.threads[idx].thread_id
                );
                emu.sched.threads[idx].completed = true;
                break;
            }
        }
        if emu.cpu.halted {
            // Sentinel return, ExitThread, or process exit inside the slice
            break;
        }
        steps += 1;
    }

    if emu.sched.threads[idx].completed || emu.cpu.halted {
        emu.sched.threads[idx].completed = true;
        log::debug!(
            "[KE] thread {:#x} completed",
            emu.sched.threads[idx].thread_id
        );
    } else {
        // Budget elapsed: save state, stays runnable
        emu.sched.threads[idx].context = Some(CpuSnapshot::capture(&emu.cpu));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_thread_queues_without_running() {
        let mut sched = Scheduler::new();
        let (h1, t1) = sched.create_thread(0x40_1000, 7, false);
        let (h2, t2) = sched.create_thread(0x40_2000, 8, true);
        assert_ne!(h1, h2);
        assert_ne!(t1, t2);
        assert!(sched.threads[0].runnable());
        assert!(!sched.threads[1].runnable()); // CREATE_SUSPENDED
        assert!(!sched.threads[0].started);
    }

    #[test]
    fn test_next_runnable_skips_completed() {
        let mut sched = Scheduler::new();
        sched.create_thread(1, 0, false);
        sched.create_thread(2, 0, false);
        sched.threads[0].completed = true;
        assert_eq!(sched.next_runnable(), Some(1));
    }

    #[test]
    fn test_resume_makes_runnable() {
        let mut sched = Scheduler::new();
        let (h, _) = sched.create_thread(1, 0, true);
        assert_eq!(sched.next_runnable(), None);
        sched.by_handle_mut(h).unwrap().suspended = false;
        assert_eq!(sched.next_runnable(), Some(0));
    }
}
