//! Interrupt Descriptor Table (IDT) vector hooks
//!
//! A vector hook redirects one IDT entry to our own entry point and keeps
//! the handler it replaced. The entry point does its work and then jumps to
//! that original handler, so the OS never notices the interception.
//!
//! Vectors used by the driver:
//! - 0xFE: performance monitoring interrupt (threshold mode)
//! - 0x2E: software trap raised by the instrumented program (polling mode)

use core::fmt;

use super::RegisterAccess;

/// Interrupt vector numbers
pub mod vector {
    /// Performance monitoring interrupt as routed by the OS local APIC setup
    pub const PMI: u8 = 0xFE;
    /// Legacy system service trap, raised explicitly by the instrumented program
    pub const SOFTWARE_TRAP: u8 = 0x2E;
}

/// IA-32 interrupt gate descriptor
///
/// The 32-bit handler address is split into two 16-bit halves around the
/// selector and attribute bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdtGate {
    /// Handler bits 0-15
    pub offset_low: u16,
    /// Code segment selector
    pub selector: u16,
    /// Reserved, must be zero
    pub reserved: u8,
    /// Type (bits 0-4), DPL (bits 5-6), present (bit 7)
    pub type_attr: u8,
    /// Handler bits 16-31
    pub offset_high: u16,
}

/// Size of one gate descriptor
pub const IDT_GATE_SIZE: usize = 8;

const _: () = assert!(core::mem::size_of::<IdtGate>() == IDT_GATE_SIZE);

impl IdtGate {
    /// Present, DPL 0, 32-bit interrupt gate
    pub const INTERRUPT_GATE_32: u8 = 0x8E;

    pub const fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            reserved: 0,
            type_attr,
            offset_high: (handler >> 16) as u16,
        }
    }

    /// Handler address assembled from both halves
    #[inline]
    pub const fn handler(&self) -> u32 {
        ((self.offset_high as u32) << 16) | self.offset_low as u32
    }

    /// Replace the handler, leaving selector and attributes untouched
    #[inline]
    pub fn set_handler(&mut self, handler: u32) {
        self.offset_low = handler as u16;
        self.offset_high = (handler >> 16) as u16;
    }

    pub const fn is_present(&self) -> bool {
        self.type_attr & 0x80 != 0
    }
}

/// Vector hook errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
    /// The vector already points at our entry point but we never recorded
    /// the handler it replaced, so there is nothing safe to chain to
    AlreadyHooked { vector: u8 },
    /// The vector has no handler to chain to
    NoOriginalHandler { vector: u8 },
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::AlreadyHooked { vector } => {
                write!(f, "vector {:#x} already hooked by an unknown installer", vector)
            }
            HookError::NoOriginalHandler { vector } => {
                write!(f, "vector {:#x} has no handler to chain to", vector)
            }
        }
    }
}

/// One redirected IDT vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorHook {
    vector: u8,
    hook: usize,
    original: Option<usize>,
}

impl VectorHook {
    pub const fn new(vector: u8, hook: usize) -> Self {
        Self {
            vector,
            hook,
            original: None,
        }
    }

    pub const fn vector(&self) -> u8 {
        self.vector
    }

    pub const fn hook_address(&self) -> usize {
        self.hook
    }

    /// Handler that was replaced, available while installed
    pub const fn original(&self) -> Option<usize> {
        self.original
    }

    pub const fn is_installed(&self) -> bool {
        self.original.is_some()
    }

    /// Redirect the vector to the hook, returning the original handler
    ///
    /// Installing twice is a no-op that returns the same original.
    pub fn install<R: RegisterAccess>(&mut self, regs: &mut R) -> Result<usize, HookError> {
        self.install_chained(regs, |_| {})
    }

    /// Like [`install`](Self::install), handing the original handler to
    /// `publish` before the vector is redirected
    ///
    /// The hook chains through whatever `publish` stores, so it must be in
    /// place by the time the first interrupt arrives on the new entry.
    pub fn install_chained<R, F>(&mut self, regs: &mut R, publish: F) -> Result<usize, HookError>
    where
        R: RegisterAccess,
        F: FnOnce(usize),
    {
        let current = regs.read_vector_entry(self.vector);

        if current == self.hook {
            return self.original.ok_or(HookError::AlreadyHooked {
                vector: self.vector,
            });
        }
        if current == 0 {
            return Err(HookError::NoOriginalHandler {
                vector: self.vector,
            });
        }

        publish(current);
        self.original = Some(current);
        regs.write_vector_entry(self.vector, self.hook);
        Ok(current)
    }

    /// Put the original handler back
    pub fn uninstall<R: RegisterAccess>(&mut self, regs: &mut R) {
        if let Some(original) = self.original.take() {
            regs.write_vector_entry(self.vector, original);
        }
    }
}
