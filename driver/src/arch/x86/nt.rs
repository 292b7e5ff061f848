//! NT kernel interface (x86)
//!
//! Only the structures and routines the driver touches. Structures that
//! are opaque to us are declared up to the last field we read, with the
//! 32-bit offsets spelled out.

#![allow(non_snake_case)]

use core::ffi::c_void;

use crate::hal::Kirql;
use crate::ntstatus::NtStatus;

// ============================================================================
// Structures
// ============================================================================

/// UNICODE_STRING
#[repr(C)]
pub struct UnicodeString {
    /// Bytes, not characters, excluding any terminator
    pub length: u16,
    pub maximum_length: u16,
    pub buffer: *const u16,
}

impl UnicodeString {
    /// Borrow a UTF-16 buffer; `len` is in characters
    pub fn from_wide(buffer: &[u16], len: usize) -> Self {
        let bytes = (len.min(buffer.len()) * 2) as u16;
        Self {
            length: bytes,
            maximum_length: bytes,
            buffer: buffer.as_ptr(),
        }
    }
}

/// Convert ASCII into a NUL-terminated wide buffer, returning the length
///
/// Input longer than the buffer is clipped.
pub fn widen<const N: usize>(text: &str, out: &mut [u16; N]) -> usize {
    let mut len = 0;
    for (slot, byte) in out.iter_mut().take(N.saturating_sub(1)).zip(text.bytes()) {
        *slot = byte as u16;
        len += 1;
    }
    if N > 0 {
        out[len] = 0;
    }
    len
}

/// RTL_OSVERSIONINFOW
#[repr(C)]
pub struct OsVersionInfo {
    pub size: u32,
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub platform_id: u32,
    pub csd_version: [u16; 128],
}

/// IO_STATUS_BLOCK
#[repr(C)]
pub struct IoStatusBlock {
    pub status: NtStatus,
    pub information: usize,
}

/// OBJECT_ATTRIBUTES
#[repr(C)]
pub struct ObjectAttributes {
    pub length: u32,
    pub root_directory: *mut c_void,
    pub object_name: *const UnicodeString,
    pub attributes: u32,
    pub security_descriptor: *mut c_void,
    pub security_quality_of_service: *mut c_void,
}

pub const OBJ_CASE_INSENSITIVE: u32 = 0x0000_0040;
pub const OBJ_KERNEL_HANDLE: u32 = 0x0000_0200;

impl ObjectAttributes {
    /// InitializeObjectAttributes
    pub fn new(name: &UnicodeString, attributes: u32) -> Self {
        Self {
            length: core::mem::size_of::<Self>() as u32,
            root_directory: core::ptr::null_mut(),
            object_name: name,
            attributes,
            security_descriptor: core::ptr::null_mut(),
            security_quality_of_service: core::ptr::null_mut(),
        }
    }
}

pub type DriverDispatch = unsafe extern "system" fn(*mut DeviceObject, *mut Irp) -> NtStatus;
pub type DriverUnload = unsafe extern "system" fn(*mut DriverObject);

/// DRIVER_OBJECT, x86
#[repr(C)]
pub struct DriverObject {
    pub type_: i16,
    pub size: i16,
    pub device_object: *mut DeviceObject,
    pub flags: u32,
    pub driver_start: *mut c_void,
    pub driver_size: u32,
    pub driver_section: *mut c_void,
    pub driver_extension: *mut c_void,
    pub driver_name: UnicodeString,
    pub hardware_database: *mut UnicodeString,
    pub fast_io_dispatch: *mut c_void,
    pub driver_init: *mut c_void,
    pub driver_start_io: *mut c_void,
    /// 0x34
    pub driver_unload: Option<DriverUnload>,
    /// 0x38
    pub major_function: [Option<DriverDispatch>; crate::device::major::IRP_MJ_MAXIMUM_FUNCTION + 1],
}

/// DEVICE_OBJECT, never looked into
#[repr(C)]
pub struct DeviceObject {
    _opaque: [u8; 0],
}

/// IRP, x86
#[repr(C)]
pub struct Irp {
    _header: [u8; 0x18],
    /// 0x18
    pub io_status: IoStatusBlock,
    _middle: [u8; 0x60 - 0x20],
    /// 0x60, Tail.Overlay.CurrentStackLocation
    pub current_stack_location: *mut IoStackLocation,
}

/// IO_STACK_LOCATION, x86, with the DeviceIoControl parameters
#[repr(C)]
pub struct IoStackLocation {
    pub major_function: u8,
    pub minor_function: u8,
    pub flags: u8,
    pub control: u8,
    pub output_buffer_length: u32,
    pub input_buffer_length: u32,
    /// 0x0C
    pub io_control_code: u32,
}

const _: () = assert!(core::mem::offset_of!(DriverObject, driver_unload) == 0x34);
const _: () = assert!(core::mem::offset_of!(Irp, current_stack_location) == 0x60);
const _: () = assert!(core::mem::offset_of!(IoStackLocation, io_control_code) == 0x0C);

// ============================================================================
// Constants
// ============================================================================

pub const FILE_DEVICE_SECURE_OPEN: u32 = 0x0000_0100;
pub const IO_NO_INCREMENT: i8 = 0;

pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
pub const FILE_OVERWRITE_IF: u32 = 0x0000_0005;
pub const FILE_SYNCHRONOUS_IO_NONALERT: u32 = 0x0000_0020;
pub const FILE_NON_DIRECTORY_FILE: u32 = 0x0000_0040;

/// Pool type for allocations touched at raised IRQL
pub const NON_PAGED_POOL: u32 = 0;

// ============================================================================
// Routines
// ============================================================================

extern "C" {
    pub fn DbgPrint(format: *const u8, ...) -> u32;
}

extern "system" {
    pub fn RtlGetVersion(info: *mut OsVersionInfo) -> NtStatus;
    pub fn MmGetSystemRoutineAddress(name: *const UnicodeString) -> *mut c_void;
    pub fn KeGetCurrentIrql() -> Kirql;
    pub fn KeRaiseIrqlToDpcLevel() -> Kirql;
    pub fn KeBugCheckEx(code: u32, p1: usize, p2: usize, p3: usize, p4: usize) -> !;

    pub fn ExAllocatePoolWithTag(pool_type: u32, size: usize, tag: u32) -> *mut c_void;
    pub fn ExFreePoolWithTag(p: *mut c_void, tag: u32);

    pub fn IoCreateDevice(
        driver: *mut DriverObject,
        extension_size: u32,
        name: *const UnicodeString,
        device_type: u32,
        characteristics: u32,
        exclusive: u8,
        device: *mut *mut DeviceObject,
    ) -> NtStatus;
    pub fn IoDeleteDevice(device: *mut DeviceObject);
    pub fn IoCreateSymbolicLink(link: *const UnicodeString, target: *const UnicodeString) -> NtStatus;
    pub fn IoDeleteSymbolicLink(link: *const UnicodeString) -> NtStatus;

    pub fn ZwCreateFile(
        handle: *mut *mut c_void,
        access: u32,
        attributes: *const ObjectAttributes,
        io_status: *mut IoStatusBlock,
        allocation_size: *const i64,
        file_attributes: u32,
        share_access: u32,
        disposition: u32,
        options: u32,
        ea_buffer: *const c_void,
        ea_length: u32,
    ) -> NtStatus;
    pub fn ZwWriteFile(
        handle: *mut c_void,
        event: *mut c_void,
        apc_routine: *const c_void,
        apc_context: *const c_void,
        io_status: *mut IoStatusBlock,
        buffer: *const c_void,
        length: u32,
        byte_offset: *const i64,
        key: *const u32,
    ) -> NtStatus;
    pub fn ZwClose(handle: *mut c_void) -> NtStatus;
}

extern "fastcall" {
    pub fn KfLowerIrql(new_irql: Kirql);
    pub fn IofCompleteRequest(irp: *mut Irp, priority_boost: i8);
}
