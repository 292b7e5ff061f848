//! hpcmon - per-process hardware performance counter attribution
//!
//! The CPU counters run across every process scheduled on the core. This
//! driver makes them count for exactly one user-mode process by hooking the
//! two places where the answer to "who is running?" changes:
//!
//! - **Thread switch**: an inline detour on the kernel's private switch
//!   routine saves the counters when the target process is switched out and
//!   restores them when it comes back.
//! - **PMI / software trap**: an IDT vector hook snapshots the counters into
//!   a sample, zeroes them and re-arms the overflow threshold.
//!
//! # Layout
//!
//! - **hal** - MSR and IDT access (`RegisterAccess`), vector hooks
//! - **hook** - switch routine detour and its versioned locator data
//! - **ps** - thread to process image name identification
//! - **perf** - counter state machine, sample buffer, CSV export
//! - **monitor** - entry point logic shared by the interrupt and switch paths
//! - **session** - install and teardown orchestration
//! - **device** - the keep-alive device control surface
//! - **dbgprint** - `log` output through the kernel debugger
//! - **arch::x86** - the real machine: naked trampolines, NT glue
//!
//! Everything above `arch` is portable and runs under the host test harness
//! against a simulated machine.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::new_without_default)]
#![allow(clippy::result_unit_err)]
// Kernel-specific: raw pointer operations are ubiquitous and often intentionally unsafe
#![allow(clippy::not_unsafe_ptr_arg_deref)]

extern crate alloc;

pub mod config;
pub mod dbgprint;
pub mod device;
pub mod hal;
pub mod hook;
pub mod monitor;
pub mod ntstatus;
pub mod perf;
pub mod profile;
pub mod ps;
pub mod rtl;
pub mod session;

#[cfg(target_arch = "x86")]
pub mod arch;

#[cfg(test)]
pub(crate) mod sim;

pub use config::{MonitorConfig, TriggerMode};
pub use monitor::Monitor;
pub use session::{InstallError, Session};
