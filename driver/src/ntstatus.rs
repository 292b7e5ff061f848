//! NTSTATUS codes returned to the I/O manager

/// NT status code
pub type NtStatus = i32;

pub const STATUS_SUCCESS: NtStatus = 0;
pub const STATUS_INVALID_PARAMETER: NtStatus = 0xC000000Du32 as i32;
pub const STATUS_PROCEDURE_NOT_FOUND: NtStatus = 0xC000007Au32 as i32;
pub const STATUS_INSUFFICIENT_RESOURCES: NtStatus = 0xC000009Au32 as i32;
pub const STATUS_NOT_SUPPORTED: NtStatus = 0xC00000BBu32 as i32;
pub const STATUS_INVALID_DEVICE_REQUEST: NtStatus = 0xC0000010u32 as i32;
pub const STATUS_REVISION_MISMATCH: NtStatus = 0xC0000059u32 as i32;
pub const STATUS_ALREADY_REGISTERED: NtStatus = 0xC0000718u32 as i32;
pub const STATUS_UNSUCCESSFUL: NtStatus = 0xC0000001u32 as i32;

/// NT_SUCCESS
#[inline]
pub const fn nt_success(status: NtStatus) -> bool {
    status >= 0
}
