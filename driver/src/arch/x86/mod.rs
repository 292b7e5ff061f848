//! 32-bit x86 NT backend
//!
//! - **nt** - kernel structures and routines
//! - **hw** - `X86Machine`: MSRs, IDT, CR0, IRQL, files
//! - **entry** - naked hook trampolines
//! - **pool** - global allocator
//!
//! This module also holds the driver entry and unload routines and the
//! device dispatch.

pub mod entry;
pub mod hw;
pub mod nt;
#[cfg(not(test))]
mod pool;

use core::ptr;

use log::{error, info};
use spin::Mutex;

use crate::config;
use crate::dbgprint;
use crate::device;
use crate::ntstatus::{self, NtStatus};
use crate::session::Session;
use entry::X86Entry;
use hw::X86Machine;
use nt::{DeviceObject, DriverObject, Irp, UnicodeString};

/// Bug check code raised on a Rust panic ('HPC')
pub const HPCMON_BUGCHECK: u32 = 0x0048_5043;

/// Hooks installed by DriverEntry, removed by DriverUnload
static SESSION: Mutex<Option<Session>> = Mutex::new(None);

/// Run `f` with both device names as counted wide strings
fn with_names<T>(f: impl FnOnce(&UnicodeString, &UnicodeString) -> T) -> T {
    let mut device = [0u16; 32];
    let mut link = [0u16; 32];
    let device_len = nt::widen(device::DEVICE_NAME, &mut device);
    let link_len = nt::widen(device::DOS_DEVICE_NAME, &mut link);
    f(
        &UnicodeString::from_wide(&device, device_len),
        &UnicodeString::from_wide(&link, link_len),
    )
}

unsafe fn create_device(driver: *mut DriverObject) -> Result<(), NtStatus> {
    with_names(|device_name, link_name| {
        let mut device_object: *mut DeviceObject = ptr::null_mut();
        let status = nt::IoCreateDevice(
            driver,
            0,
            device_name,
            device::DEVICE_TYPE,
            nt::FILE_DEVICE_SECURE_OPEN,
            0,
            &mut device_object,
        );
        if !ntstatus::nt_success(status) {
            return Err(status);
        }

        let status = nt::IoCreateSymbolicLink(link_name, device_name);
        if !ntstatus::nt_success(status) {
            nt::IoDeleteDevice(device_object);
            return Err(status);
        }
        Ok(())
    })
}

unsafe fn delete_device(driver: *mut DriverObject) {
    with_names(|_, link_name| {
        nt::IoDeleteSymbolicLink(link_name);
    });
    let device_object = (*driver).device_object;
    if !device_object.is_null() {
        nt::IoDeleteDevice(device_object);
    }
}

/// Driver entry point
///
/// # Safety
/// Called once by the I/O manager at PASSIVE_LEVEL.
#[no_mangle]
pub unsafe extern "system" fn DriverEntry(driver: *mut DriverObject, _registry_path: *const UnicodeString) -> NtStatus {
    dbgprint::init();
    info!("[HPC] Loading");

    if let Err(status) = create_device(driver) {
        error!("[HPC] Device creation failed: {:#010x}", status as u32);
        return status;
    }

    let mut machine = X86Machine::new();
    match Session::install(&mut machine, &X86Entry, config::BUILD) {
        Ok(session) => *SESSION.lock() = Some(session),
        Err(e) => {
            error!("[HPC] Install failed: {}", e);
            delete_device(driver);
            return e.status();
        }
    }

    for slot in (*driver).major_function.iter_mut() {
        *slot = Some(dispatch_irp);
    }
    (*driver).driver_unload = Some(driver_unload);

    info!("[HPC] Loaded");
    ntstatus::STATUS_SUCCESS
}

unsafe extern "system" fn driver_unload(driver: *mut DriverObject) {
    let session = SESSION.lock().take();
    if let Some(session) = session {
        let mut machine = X86Machine::new();
        session.teardown(&mut machine);
    }
    delete_device(driver);
    info!("[HPC] Unloaded");
}

unsafe extern "system" fn dispatch_irp(_device: *mut DeviceObject, irp: *mut Irp) -> NtStatus {
    let stack = (*irp).current_stack_location;
    let status = device::dispatch((*stack).major_function, (*stack).io_control_code);

    (*irp).io_status.status = status;
    (*irp).io_status.information = 0;
    nt::IofCompleteRequest(irp, nt::IO_NO_INCREMENT);
    status
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    let mut line = dbgprint::Line::new();
    let _ = writeln!(line, "[HPC] PANIC: {}", info);
    unsafe {
        nt::DbgPrint(b"%s\0".as_ptr(), line.as_c_bytes().as_ptr());
        nt::KeBugCheckEx(HPCMON_BUGCHECK, 0, 0, 0, 0)
    }
}
