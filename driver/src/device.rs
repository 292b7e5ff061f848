//! Device control surface
//!
//! The driver exposes one device so user mode can hold a handle to it.
//! It carries no data: the only control code answers success, everything
//! else is refused.

use crate::ntstatus::{self, NtStatus};

/// Kernel name of the device object
pub const DEVICE_NAME: &str = r"\Device\HpcMon";

/// Win32-visible link to the device
pub const DOS_DEVICE_NAME: &str = r"\DosDevices\HpcMon";

/// Device type passed to IoCreateDevice
pub const DEVICE_TYPE: u32 = 40000;

pub const METHOD_BUFFERED: u32 = 0;
pub const FILE_READ_DATA: u32 = 0x0001;
pub const FILE_WRITE_DATA: u32 = 0x0002;

/// CTL_CODE
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// Keep-alive control code
pub const IOCTL_HPCMON_PING: u32 = ctl_code(
    DEVICE_TYPE,
    0x800,
    METHOD_BUFFERED,
    FILE_READ_DATA | FILE_WRITE_DATA,
);

/// IRP major function codes handled by the device
pub mod major {
    pub const IRP_MJ_CREATE: u8 = 0x00;
    pub const IRP_MJ_CLOSE: u8 = 0x02;
    pub const IRP_MJ_DEVICE_CONTROL: u8 = 0x0E;
    /// Highest major function code
    pub const IRP_MJ_MAXIMUM_FUNCTION: usize = 0x1B;
}

/// Status for a request to the device
///
/// `control_code` is only looked at for device control requests.
pub fn dispatch(major_function: u8, control_code: u32) -> NtStatus {
    match major_function {
        major::IRP_MJ_CREATE | major::IRP_MJ_CLOSE => ntstatus::STATUS_SUCCESS,
        major::IRP_MJ_DEVICE_CONTROL => match control_code {
            IOCTL_HPCMON_PING => ntstatus::STATUS_SUCCESS,
            _ => ntstatus::STATUS_INVALID_DEVICE_REQUEST,
        },
        _ => ntstatus::STATUS_NOT_SUPPORTED,
    }
}
