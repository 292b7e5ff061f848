//! Code hooks
//!
//! IDT vector hooks live in [`crate::hal::idt`]; this module holds the
//! inline detour on the thread-switch routine.

pub mod detour;

pub use detour::{DetourError, DetourTargets, PatchWindow, SwitchRoutineHook, PATCH_LEN};
