//! Hardware Abstraction Layer
//!
//! The only way the rest of the driver touches privileged state:
//!
//! - **RegisterAccess**: model specific registers and IDT vector entries
//! - **PatchAccess**: kernel code bytes, CR0 write protection, IRQL
//!
//! Neither trait returns errors. A failing `rdmsr` or a bad descriptor
//! write leaves the machine in an undefined state, which no caller could
//! recover from anyway.

pub mod idt;
pub mod msreg;

pub use idt::{HookError, IdtGate, VectorHook};
pub use msreg::MsrValue;

/// Interrupt Request Level type
pub type Kirql = u8;

/// IRQL levels (NT compatible)
pub mod irql {
    use super::Kirql;

    /// Passive level - normal thread execution, all interrupts enabled
    pub const PASSIVE_LEVEL: Kirql = 0;
    /// Dispatch level - thread preemption disabled, DPCs run here
    pub const DISPATCH_LEVEL: Kirql = 2;
}

/// Privileged register access
pub trait RegisterAccess {
    /// Read an MSR as its EDX:EAX halves
    fn read_msr(&mut self, msr: u32) -> MsrValue;

    /// Write an MSR from its EDX:EAX halves
    fn write_msr(&mut self, msr: u32, value: MsrValue);

    /// Current handler address of an IDT vector
    fn read_vector_entry(&mut self, vector: u8) -> usize;

    /// Point an IDT vector at a new handler
    ///
    /// Implementations mask interrupts for the duration of the descriptor
    /// edit so the vector is never observed half-written.
    fn write_vector_entry(&mut self, vector: u8, handler: usize);
}

/// Kernel code patching primitives
///
/// Only the detour uses this, always through [`hook::detour::PatchWindow`]
/// so write protection and IRQL are put back on every path.
///
/// [`hook::detour::PatchWindow`]: crate::hook::detour::PatchWindow
pub trait PatchAccess {
    /// Copy bytes out of kernel code
    ///
    /// # Safety
    /// `address..address + buf.len()` must be mapped, readable memory.
    unsafe fn read_code(&mut self, address: usize, buf: &mut [u8]);

    /// Overwrite kernel code
    ///
    /// # Safety
    /// The range must be mapped, write protection must be off, and no
    /// processor may be executing the bytes being replaced.
    unsafe fn write_code(&mut self, address: usize, bytes: &[u8]);

    /// Clear CR0.WP, returning whether it was set before
    fn disable_write_protect(&mut self) -> bool;

    /// Restore CR0.WP to a previously returned state
    fn restore_write_protect(&mut self, was_enabled: bool);

    /// Raise IRQL to DISPATCH_LEVEL, returning the previous level
    fn raise_irql_to_dpc_level(&mut self) -> Kirql;

    /// Lower IRQL back to a level returned by `raise_irql_to_dpc_level`
    fn lower_irql(&mut self, irql: Kirql);
}
