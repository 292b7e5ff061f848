//! Simulated machine for host-side tests
//!
//! `SimMachine` implements the privileged traits over plain memory: an MSR
//! file, a 256-entry IDT, a slice of kernel code, CR0.WP and IRQL. Every
//! effect that has an ordering requirement is appended to an event log.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};
use std::vec::Vec;

use crate::hal::idt::IdtGate;
use crate::hal::msreg::{MsrValue, COUNTER_HIGH_MASK};
use crate::hal::{irql, Kirql, PatchAccess, RegisterAccess};
use crate::hook::detour::CALL_REL32;
use crate::perf::counters::BANK;
use crate::perf::csv::{OutputError, OutputSink};
use crate::profile::{KernelProfile, OsVersion, StructureLayout};
use crate::session::Platform;

/// Base of the simulated kernel image
pub const CODE_BASE: usize = 0x8280_0000;
const CODE_SIZE: usize = 0x2000;
const LOCATOR_OFFSET: usize = 0x100;
const ROUTINE_OFFSET: usize = 0x1000;

/// Default handler of vector `v`
pub const fn default_handler(v: u8) -> usize {
    0x8283_0000 + (v as usize) * 0x40
}

/// Ordered side effects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    WriteProtect(bool),
    Irql(Kirql),
    CodeWrite { address: usize, len: usize },
}

/// Serializes tests that use the global monitor slot
pub fn global_slot_guard() -> MutexGuard<'static, ()> {
    static GUARD: Mutex<()> = Mutex::new(());
    GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SimMachine {
    msrs: BTreeMap<u32, MsrValue>,
    msr_writes: Vec<(u32, MsrValue)>,
    idt: [IdtGate; 256],
    vector_writes: usize,
    code: Vec<u8>,
    code_writes: Vec<(usize, Vec<u8>)>,
    write_protect: bool,
    irql: Kirql,
    events: Vec<SimEvent>,
    version: OsVersion,
    exports: Vec<(&'static str, usize)>,
    output: Rc<RefCell<Option<Vec<u8>>>>,
    output_failure: Option<OutputError>,
}

impl SimMachine {
    /// Machine with an empty code region and no kernel exports
    pub fn new() -> Self {
        let mut idt = [IdtGate::default(); 256];
        for (v, gate) in idt.iter_mut().enumerate() {
            *gate = IdtGate::new(default_handler(v as u8) as u32, 0x08, IdtGate::INTERRUPT_GATE_32);
        }

        Self {
            msrs: BTreeMap::new(),
            msr_writes: Vec::new(),
            idt,
            vector_writes: 0,
            code: vec![0xCC; CODE_SIZE],
            code_writes: Vec::new(),
            write_protect: true,
            irql: irql::PASSIVE_LEVEL,
            events: Vec::new(),
            version: OsVersion::new(0, 0, 0),
            exports: Vec::new(),
            output: Rc::new(RefCell::new(None)),
            output_failure: None,
        }
    }

    /// Machine running the kernel described by `profile`
    ///
    /// The locator routine calls the switch routine from the profiled
    /// offset, and the switch routine starts with the profiled prologue.
    pub fn with_kernel(profile: &KernelProfile) -> Self {
        let mut machine = Self::new();
        machine.version = profile.version;

        let locator = CODE_BASE + LOCATOR_OFFSET;
        let routine = CODE_BASE + ROUTINE_OFFSET;
        let call_site = locator + profile.switch.call_offset;
        let displacement = (routine as i64 - (call_site + 5) as i64) as i32;

        let mut call = [CALL_REL32, 0, 0, 0, 0];
        call[1..].copy_from_slice(&displacement.to_le_bytes());
        machine.poke_code(call_site, &call);
        machine.poke_code(routine, &profile.switch.prologue);

        machine.exports.push((profile.switch.locator, locator));
        machine
    }

    // ---- MSRs ----

    pub fn msr(&self, msr: u32) -> MsrValue {
        self.msrs.get(&msr).copied().unwrap_or(MsrValue::ZERO)
    }

    /// Set an MSR without logging a write
    pub fn set_msr(&mut self, msr: u32, value: MsrValue) {
        self.msrs.insert(msr, value);
    }

    pub fn msr_writes(&self) -> &[(u32, MsrValue)] {
        &self.msr_writes
    }

    /// Let the bank count: add `deltas[i]` to counter `BANK[i]`
    pub fn count(&mut self, deltas: &[u64]) {
        for (&msr, &delta) in BANK.iter().zip(deltas.iter()) {
            let value = self.msr(msr).counter_value().wrapping_add(delta) & 0xFFFF_FFFF_FFFF;
            let next = MsrValue::new(value as u32, ((value >> 32) as u32) & COUNTER_HIGH_MASK);
            self.set_msr(msr, next);
        }
    }

    // ---- IDT ----

    pub fn gate(&self, vector: u8) -> IdtGate {
        self.idt[vector as usize]
    }

    pub fn vector_writes(&self) -> usize {
        self.vector_writes
    }

    // ---- Code ----

    pub fn locator_address(&self) -> usize {
        CODE_BASE + LOCATOR_OFFSET
    }

    pub fn switch_routine_address(&self) -> usize {
        CODE_BASE + ROUTINE_OFFSET
    }

    fn code_range(&self, address: usize, len: usize) -> core::ops::Range<usize> {
        let start = address - CODE_BASE;
        assert!(start + len <= self.code.len(), "code access outside the image");
        start..start + len
    }

    /// Overwrite code bytes without logging a write
    pub fn poke_code(&mut self, address: usize, bytes: &[u8]) {
        let range = self.code_range(address, bytes.len());
        self.code[range].copy_from_slice(bytes);
    }

    pub fn peek_code(&self, address: usize, len: usize) -> Vec<u8> {
        self.code[self.code_range(address, len)].to_vec()
    }

    pub fn code_writes(&self) -> &[(usize, Vec<u8>)] {
        &self.code_writes
    }

    pub fn write_protect_enabled(&self) -> bool {
        self.write_protect
    }

    pub fn irql(&self) -> Kirql {
        self.irql
    }

    pub fn set_irql(&mut self, level: Kirql) {
        self.irql = level;
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    // ---- Kernel services ----

    pub fn set_version(&mut self, version: OsVersion) {
        self.version = version;
    }

    pub fn remove_exports(&mut self) {
        self.exports.clear();
    }

    /// Make the next output creation fail
    pub fn fail_output(&mut self, error: OutputError) {
        self.output_failure = Some(error);
    }

    /// Everything written to the output file, if one was created
    pub fn output_text(&self) -> Option<String> {
        self.output
            .borrow()
            .as_ref()
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }
}

impl RegisterAccess for SimMachine {
    fn read_msr(&mut self, msr: u32) -> MsrValue {
        self.msr(msr)
    }

    fn write_msr(&mut self, msr: u32, value: MsrValue) {
        self.msr_writes.push((msr, value));
        self.msrs.insert(msr, value);
    }

    fn read_vector_entry(&mut self, vector: u8) -> usize {
        self.idt[vector as usize].handler() as usize
    }

    fn write_vector_entry(&mut self, vector: u8, handler: usize) {
        self.idt[vector as usize].set_handler(handler as u32);
        self.vector_writes += 1;
    }
}

impl PatchAccess for SimMachine {
    unsafe fn read_code(&mut self, address: usize, buf: &mut [u8]) {
        let range = self.code_range(address, buf.len());
        buf.copy_from_slice(&self.code[range]);
    }

    unsafe fn write_code(&mut self, address: usize, bytes: &[u8]) {
        assert!(!self.write_protect, "code write with CR0.WP set");
        self.poke_code(address, bytes);
        self.code_writes.push((address, bytes.to_vec()));
        self.events.push(SimEvent::CodeWrite {
            address,
            len: bytes.len(),
        });
    }

    fn disable_write_protect(&mut self) -> bool {
        let was = self.write_protect;
        self.write_protect = false;
        self.events.push(SimEvent::WriteProtect(false));
        was
    }

    fn restore_write_protect(&mut self, was_enabled: bool) {
        self.write_protect = was_enabled;
        self.events.push(SimEvent::WriteProtect(was_enabled));
    }

    fn raise_irql_to_dpc_level(&mut self) -> Kirql {
        let old = self.irql;
        self.irql = irql::DISPATCH_LEVEL;
        self.events.push(SimEvent::Irql(self.irql));
        old
    }

    fn lower_irql(&mut self, level: Kirql) {
        self.irql = level;
        self.events.push(SimEvent::Irql(level));
    }
}

/// Output file backed by the machine's buffer
pub struct SimOutput(Rc<RefCell<Option<Vec<u8>>>>);

impl OutputSink for SimOutput {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        self.0
            .borrow_mut()
            .get_or_insert_with(Vec::new)
            .extend_from_slice(bytes);
        Ok(())
    }
}

impl Platform for SimMachine {
    type Output = SimOutput;

    fn kernel_version(&mut self) -> OsVersion {
        self.version
    }

    fn export_address(&mut self, name: &str) -> Option<usize> {
        self.exports
            .iter()
            .find(|(export, _)| *export == name)
            .map(|&(_, address)| address)
    }

    fn current_irql(&mut self) -> Kirql {
        self.irql
    }

    fn create_output(&mut self, _path: &str) -> Result<SimOutput, OutputError> {
        if let Some(error) = self.output_failure.take() {
            return Err(error);
        }
        // Overwrite-if semantics
        *self.output.borrow_mut() = Some(Vec::new());
        Ok(SimOutput(self.output.clone()))
    }
}

// ============================================================================
// Fake kernel structures
// ============================================================================

/// Process object with just an image name at the profiled offset
pub struct FakeProcess {
    bytes: Box<[u8]>,
}

impl FakeProcess {
    pub fn new(layout: &StructureLayout, name: &str) -> Self {
        let mut bytes = vec![0u8; layout.image_name + layout.image_name_len + 1].into_boxed_slice();
        let name = name.as_bytes();
        let len = name.len().min(layout.image_name_len);
        bytes[layout.image_name..layout.image_name + len].copy_from_slice(&name[..len]);
        Self { bytes }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

/// Thread object with just the owning process link
pub struct FakeThread {
    bytes: Box<[u8]>,
}

impl FakeThread {
    pub fn new(layout: &StructureLayout, process: &FakeProcess) -> Self {
        Self::linked(layout, process.as_ptr())
    }

    /// Thread whose process link is null
    pub fn orphan(layout: &StructureLayout) -> Self {
        Self::linked(layout, core::ptr::null())
    }

    fn linked(layout: &StructureLayout, process: *const u8) -> Self {
        let mut bytes = vec![0u8; layout.thread_process + core::mem::size_of::<usize>()].into_boxed_slice();
        unsafe {
            let link = bytes.as_mut_ptr().add(layout.thread_process) as *mut *const u8;
            core::ptr::write_unaligned(link, process);
        }
        Self { bytes }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}
