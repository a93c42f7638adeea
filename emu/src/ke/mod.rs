//! Kernel Executive (ke)
//!
//! Guest thread descriptors and the cooperative scheduler. There is exactly
//! one interpreter; at any instant one logical guest thread is live and its
//! register file *is* the CPU state. Everything else is a saved snapshot.
//!
//! ```text
//!            Sleep (main thread only)
//! main ────────────┐
//!                  ▼
//!          snapshot main state
//!          restore/build worker state
//!          run up to THREAD_SLICE_BUDGET steps
//!          save or complete worker
//!          restore main state
//!                  │
//! main ◄───────────┘ (Sleep returns)
//! ```

pub mod scheduler;
pub mod thread;

pub use scheduler::{sleep_yield, Scheduler, SCHEDULER_IDLE_LIMIT, THREAD_SLICE_BUDGET};
pub use thread::{CpuSnapshot, GuestThread};
