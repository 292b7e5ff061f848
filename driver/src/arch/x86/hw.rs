//! The real machine
//!
//! [`X86Machine`] is a zero-sized handle implementing the privileged
//! traits with the instructions themselves. It is constructed inside each
//! entry point; there is no state to share.

use core::arch::asm;
use core::ptr;

use x86_64::registers::control::Cr0Flags;

use super::nt;
use crate::hal::idt::IdtGate;
use crate::hal::msreg::MsrValue;
use crate::hal::{Kirql, PatchAccess, RegisterAccess};
use crate::perf::csv::{OutputError, OutputSink};
use crate::profile::OsVersion;
use crate::session::Platform;

/// CR0.WP as a 32-bit mask
const CR0_WP: u32 = Cr0Flags::WRITE_PROTECT.bits() as u32;

/// EFLAGS.IF
const EFLAGS_IF: u32 = 1 << 9;

/// IDTR contents as stored by `sidt`
#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u32,
}

pub struct X86Machine;

impl X86Machine {
    /// # Safety
    /// Only meaningful in kernel mode on the processor being measured.
    pub unsafe fn new() -> Self {
        X86Machine
    }

    fn gate(&self, vector: u8) -> *mut IdtGate {
        let mut idtr = Idtr { limit: 0, base: 0 };
        unsafe {
            asm!("sidt [{}]", in(reg) &mut idtr, options(nostack, preserves_flags));
        }
        (idtr.base as usize as *mut IdtGate).wrapping_add(vector as usize)
    }
}

/// Run `f` with maskable interrupts off, restoring IF afterwards
fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    let flags: u32;
    unsafe {
        asm!("pushfd", "pop {}", "cli", out(reg) flags);
    }
    let result = f();
    if flags & EFLAGS_IF != 0 {
        unsafe {
            asm!("sti", options(nostack));
        }
    }
    result
}

impl RegisterAccess for X86Machine {
    fn read_msr(&mut self, msr: u32) -> MsrValue {
        let (low, high): (u32, u32);
        unsafe {
            asm!(
                "rdmsr",
                in("ecx") msr,
                out("eax") low,
                out("edx") high,
                options(nomem, nostack, preserves_flags)
            );
        }
        MsrValue::new(low, high)
    }

    fn write_msr(&mut self, msr: u32, value: MsrValue) {
        unsafe {
            asm!(
                "wrmsr",
                in("ecx") msr,
                in("eax") value.low,
                in("edx") value.high,
                options(nostack, preserves_flags)
            );
        }
    }

    fn read_vector_entry(&mut self, vector: u8) -> usize {
        let gate = self.gate(vector);
        unsafe { ptr::read_volatile(gate).handler() as usize }
    }

    fn write_vector_entry(&mut self, vector: u8, handler: usize) {
        let gate = self.gate(vector);
        without_interrupts(|| unsafe {
            let mut entry = ptr::read_volatile(gate);
            entry.set_handler(handler as u32);
            ptr::write_volatile(gate, entry);
        });
    }
}

impl PatchAccess for X86Machine {
    unsafe fn read_code(&mut self, address: usize, buf: &mut [u8]) {
        ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
    }

    unsafe fn write_code(&mut self, address: usize, bytes: &[u8]) {
        ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }

    fn disable_write_protect(&mut self) -> bool {
        let cr0: u32;
        unsafe {
            asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
            asm!("mov cr0, {}", in(reg) cr0 & !CR0_WP, options(nostack, preserves_flags));
        }
        cr0 & CR0_WP != 0
    }

    fn restore_write_protect(&mut self, was_enabled: bool) {
        if !was_enabled {
            return;
        }
        unsafe {
            let cr0: u32;
            asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
            asm!("mov cr0, {}", in(reg) cr0 | CR0_WP, options(nostack, preserves_flags));
        }
    }

    fn raise_irql_to_dpc_level(&mut self) -> Kirql {
        unsafe { nt::KeRaiseIrqlToDpcLevel() }
    }

    fn lower_irql(&mut self, irql: Kirql) {
        unsafe { nt::KfLowerIrql(irql) }
    }
}

// ============================================================================
// Kernel services
// ============================================================================

impl Platform for X86Machine {
    type Output = NtFile;

    fn kernel_version(&mut self) -> OsVersion {
        let mut info = nt::OsVersionInfo {
            size: core::mem::size_of::<nt::OsVersionInfo>() as u32,
            major: 0,
            minor: 0,
            build: 0,
            platform_id: 0,
            csd_version: [0; 128],
        };
        // RtlGetVersion cannot fail for the base structure
        unsafe { nt::RtlGetVersion(&mut info) };
        OsVersion::new(info.major, info.minor, info.build)
    }

    fn export_address(&mut self, name: &str) -> Option<usize> {
        let mut wide = [0u16; 64];
        let len = nt::widen(name, &mut wide);
        let name = nt::UnicodeString::from_wide(&wide, len);
        let address = unsafe { nt::MmGetSystemRoutineAddress(&name) };
        (!address.is_null()).then_some(address as usize)
    }

    fn current_irql(&mut self) -> Kirql {
        unsafe { nt::KeGetCurrentIrql() }
    }

    fn create_output(&mut self, path: &str) -> Result<NtFile, OutputError> {
        NtFile::create(path)
    }
}

/// Kernel file handle opened for writing
pub struct NtFile {
    handle: *mut core::ffi::c_void,
}

impl NtFile {
    /// Create or truncate `path`
    pub fn create(path: &str) -> Result<Self, OutputError> {
        let mut wide = [0u16; 260];
        let len = nt::widen(path, &mut wide);
        let name = nt::UnicodeString::from_wide(&wide, len);
        let attributes = nt::ObjectAttributes::new(&name, nt::OBJ_CASE_INSENSITIVE | nt::OBJ_KERNEL_HANDLE);

        let mut handle = ptr::null_mut();
        let mut io_status = nt::IoStatusBlock {
            status: 0,
            information: 0,
        };
        let status = unsafe {
            nt::ZwCreateFile(
                &mut handle,
                nt::GENERIC_WRITE,
                &attributes,
                &mut io_status,
                ptr::null(),
                nt::FILE_ATTRIBUTE_NORMAL,
                0,
                nt::FILE_OVERWRITE_IF,
                nt::FILE_SYNCHRONOUS_IO_NONALERT | nt::FILE_NON_DIRECTORY_FILE,
                ptr::null(),
                0,
            )
        };
        if !crate::ntstatus::nt_success(status) {
            return Err(OutputError::Create(status));
        }
        Ok(Self { handle })
    }
}

impl OutputSink for NtFile {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        let mut io_status = nt::IoStatusBlock {
            status: 0,
            information: 0,
        };
        let status = unsafe {
            nt::ZwWriteFile(
                self.handle,
                ptr::null_mut(),
                ptr::null(),
                ptr::null(),
                &mut io_status,
                bytes.as_ptr().cast(),
                bytes.len() as u32,
                ptr::null(),
                ptr::null(),
            )
        };
        if !crate::ntstatus::nt_success(status) {
            return Err(OutputError::Write(status));
        }
        if io_status.information != bytes.len() {
            return Err(OutputError::ShortWrite {
                expected: bytes.len(),
                written: io_status.information,
            });
        }
        Ok(())
    }
}

impl Drop for NtFile {
    fn drop(&mut self) {
        unsafe {
            nt::ZwClose(self.handle);
        }
    }
}
