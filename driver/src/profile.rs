//! Kernel build profiles
//!
//! Everything the driver knows about undocumented kernel internals lives
//! here, keyed by the kernel version it was taken from:
//!
//! - where the private thread-switch routine is called from an exported
//!   routine, and which instructions the detour overwrites
//! - the thread -> process link and the process image name field
//!
//! None of this survives a kernel rebuild. The profile for the running
//! kernel is selected once at install time; an unknown version refuses to
//! install instead of guessing.

use core::fmt;

use crate::hook::detour::PATCH_LEN;

/// Kernel version as reported by `RtlGetVersion`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self { major, minor, build }
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Where the switch routine is and what the detour overwrites in it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRoutineProfile {
    /// Exported routine that calls the switch routine
    pub locator: &'static str,
    /// Offset of the `call rel32` instruction inside the locator
    pub call_offset: usize,
    /// Bytes expected at the start of the switch routine
    pub prologue: [u8; PATCH_LEN],
    /// Incoming-thread byte field compared against zero by the prologue
    pub replay_field: usize,
    /// Offset, from the routine start, of the prologue's branch target
    pub replay_taken: usize,
}

/// Offsets into the thread and process structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureLayout {
    /// KTHREAD -> owning KPROCESS/EPROCESS pointer
    pub thread_process: usize,
    /// EPROCESS -> ImageFileName
    pub image_name: usize,
    /// Width of the ImageFileName field
    pub image_name_len: usize,
}

/// All build-specific data for one kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelProfile {
    pub name: &'static str,
    pub version: OsVersion,
    pub switch: SwitchRoutineProfile,
    pub layout: StructureLayout,
}

/// Windows 7 SP1, x86
///
/// `nt!SwapContext` starts with
///
/// ```text
/// 80 7E 39 00     cmp  byte ptr [esi+39h], 0
/// 74 04           je   SwapContext+0Ah
/// ```
///
/// and is reached from the `call` at `KiDispatchInterrupt+0xDD`.
pub const WIN7_SP1_X86: KernelProfile = KernelProfile {
    name: "Windows 7 SP1 x86",
    version: OsVersion::new(6, 1, 7601),
    switch: SwitchRoutineProfile {
        locator: "KiDispatchInterrupt",
        call_offset: 0xDD,
        prologue: [0x80, 0x7E, 0x39, 0x00, 0x74, 0x04],
        replay_field: 0x39,
        replay_taken: 0x0A,
    },
    layout: StructureLayout {
        thread_process: 0x50,
        image_name: 0x16C,
        image_name_len: 15,
    },
};

/// Supported kernels
pub static KERNEL_PROFILES: &[KernelProfile] = &[WIN7_SP1_X86];

/// Profile lookup errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileError {
    UnsupportedBuild(OsVersion),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::UnsupportedBuild(version) => {
                write!(f, "no kernel profile for build {}", version)
            }
        }
    }
}

/// Find the profile for a kernel version in the built-in table
pub fn lookup(version: OsVersion) -> Result<&'static KernelProfile, ProfileError> {
    lookup_in(KERNEL_PROFILES, version)
}

/// Find the profile for a kernel version in a given table
pub fn lookup_in(
    table: &'static [KernelProfile],
    version: OsVersion,
) -> Result<&'static KernelProfile, ProfileError> {
    table
        .iter()
        .find(|profile| profile.version == version)
        .ok_or(ProfileError::UnsupportedBuild(version))
}
