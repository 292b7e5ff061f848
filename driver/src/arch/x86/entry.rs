//! Hook entry points
//!
//! Two naked trampolines:
//!
//! - **counter_event_entry** sits on the PMI or software-trap vector. It
//!   saves everything, switches to kernel data and PCR selectors, runs the
//!   monitor and jumps on to the handler it replaced.
//! - **swap_context_entry** is where the switch routine's detour lands,
//!   with the outgoing thread in EDI and the incoming one in ESI. After the
//!   monitor has run it replays the overwritten compare-and-branch and
//!   continues inside the switch routine.
//!
//! Both jump through statics filled in by [`X86Entry`] before the hooks go
//! live.

use core::arch::naked_asm;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::hw::X86Machine;
use crate::config;
use crate::hook::detour::DetourTargets;
use crate::monitor;
use crate::session::EntryPoints;

/// Flat data selector the kernel runs with in DS and ES
const KGDT_R3_DATA: u16 = 0x23;
/// Processor control region selector
const KGDT_R0_PCR: u16 = 0x30;

/// Handler the vector hook chains to
static ORIGINAL_HANDLER: AtomicUsize = AtomicUsize::new(0);
/// Incoming-thread field compared by the replayed prologue
static REPLAY_FIELD: AtomicUsize = AtomicUsize::new(0);
/// Switch routine address when the replayed compare finds zero
static REPLAY_TAKEN: AtomicUsize = AtomicUsize::new(0);
/// Switch routine address just past the patch
static RESUME: AtomicUsize = AtomicUsize::new(0);

extern "C" fn counter_event_body() {
    let mut machine = unsafe { X86Machine::new() };
    monitor::dispatch_counter_event(&mut machine, config::BUILD.mode);
}

extern "C" fn swap_context_body(outgoing: *const u8, incoming: *const u8) {
    unsafe {
        let mut machine = X86Machine::new();
        monitor::dispatch_swap_context(&mut machine, outgoing, incoming);
    }
}

/// Counter vector trampoline
///
/// # Safety
/// Only ever entered through the IDT.
#[unsafe(naked)]
pub unsafe extern "C" fn counter_event_entry() {
    naked_asm!(
        "pushfd",
        "pushad",
        "push fs",
        "push ds",
        "push es",

        "mov ax, {data}",
        "mov ds, ax",
        "mov es, ax",
        "mov ax, {pcr}",
        "mov fs, ax",
        "cld",

        "call {body}",

        "pop es",
        "pop ds",
        "pop fs",
        "popad",
        "popfd",

        "jmp dword ptr [{original}]",
        data = const KGDT_R3_DATA,
        pcr = const KGDT_R0_PCR,
        body = sym counter_event_body,
        original = sym ORIGINAL_HANDLER,
    )
}

/// Switch routine detour target
///
/// # Safety
/// Only ever entered from the patched switch routine.
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context_entry() {
    naked_asm!(
        "pushfd",
        "pushad",

        // body(outgoing = edi, incoming = esi)
        "push esi",
        "push edi",
        "call {body}",
        "add esp, 8",

        "popad",
        "popfd",

        // Replay: cmp byte ptr [esi + field], 0 / je taken
        "push eax",
        "mov eax, dword ptr [{field}]",
        "cmp byte ptr [esi + eax], 0",
        "pop eax",
        "je 2f",
        "jmp dword ptr [{resume}]",
        "2:",
        "jmp dword ptr [{taken}]",
        body = sym swap_context_body,
        field = sym REPLAY_FIELD,
        resume = sym RESUME,
        taken = sym REPLAY_TAKEN,
    )
}

/// The trampolines above, as seen by the session
pub struct X86Entry;

impl EntryPoints for X86Entry {
    fn counter_event_entry(&self) -> usize {
        counter_event_entry as usize
    }

    fn swap_context_entry(&self) -> usize {
        swap_context_entry as usize
    }

    fn publish_vector_original(&self, original: usize) {
        ORIGINAL_HANDLER.store(original, Ordering::SeqCst);
    }

    fn publish_detour_targets(&self, targets: DetourTargets) {
        REPLAY_FIELD.store(targets.replay_field, Ordering::SeqCst);
        REPLAY_TAKEN.store(targets.taken, Ordering::SeqCst);
        RESUME.store(targets.resume, Ordering::SeqCst);
    }
}
