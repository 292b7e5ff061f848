//! Inline detour on the kernel's thread-switch routine
//!
//! The switch routine is private, so it is found through an exported
//! routine that calls it: the `call rel32` at a known offset inside the
//! exported routine encodes the distance to it.
//!
//! Installing overwrites the first [`PATCH_LEN`] bytes of the routine with
//!
//! ```text
//! E9 xx xx xx xx    jmp  hook
//! 90                nop
//! ```
//!
//! The hook is a full trampoline. After its own work it replays the
//! instructions that were overwritten (a byte compare on the incoming thread
//! followed by a conditional branch) and jumps to `routine + PATCH_LEN`.
//! [`SwitchRoutineHook::targets`] hands it the addresses it needs for that.
//!
//! Both the located address and the bytes about to be overwritten are
//! checked against the kernel profile before anything is written.

use core::fmt;

use crate::hal::{Kirql, PatchAccess};
use crate::profile::SwitchRoutineProfile;

/// Bytes replaced at the start of the switch routine
pub const PATCH_LEN: usize = 6;

/// `call rel32`
pub const CALL_REL32: u8 = 0xE8;
/// `jmp rel32`
pub const JMP_REL32: u8 = 0xE9;
/// `nop`
pub const NOP: u8 = 0x90;

/// Length of a `call rel32` / `jmp rel32` instruction
pub const REL32_INSN_LEN: usize = 5;

/// Detour errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetourError {
    /// The locator routine has no `call rel32` at the profiled offset
    CallNotFound { address: usize, found: u8 },
    /// The switch routine does not start with the profiled instructions
    PrologueMismatch {
        address: usize,
        found: [u8; PATCH_LEN],
    },
    /// The hook is further than a rel32 branch can reach
    OutOfRange { from: usize, to: usize },
    /// The patch is already in place
    AlreadyInstalled,
}

impl fmt::Display for DetourError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetourError::CallNotFound { address, found } => write!(
                f,
                "expected call rel32 at {:#x}, found opcode {:#04x}",
                address, found
            ),
            DetourError::PrologueMismatch { address, found } => write!(
                f,
                "unexpected switch routine prologue at {:#x}: {:02x?}",
                address, found
            ),
            DetourError::OutOfRange { from, to } => {
                write!(f, "branch from {:#x} to {:#x} exceeds rel32 range", from, to)
            }
            DetourError::AlreadyInstalled => write!(f, "detour already installed"),
        }
    }
}

/// Displacement of a rel32 branch whose next instruction is at `next`
pub fn rel32(next: usize, target: usize) -> Result<i32, DetourError> {
    let delta = target.wrapping_sub(next) as isize;
    i32::try_from(delta).map_err(|_| DetourError::OutOfRange {
        from: next,
        to: target,
    })
}

/// Resolve the target of the `call rel32` at `call_site`
///
/// # Safety
/// `call_site..call_site + 5` must be mapped code.
pub unsafe fn resolve_call<P: PatchAccess>(mem: &mut P, call_site: usize) -> Result<usize, DetourError> {
    let mut insn = [0u8; REL32_INSN_LEN];
    mem.read_code(call_site, &mut insn);

    if insn[0] != CALL_REL32 {
        return Err(DetourError::CallNotFound {
            address: call_site,
            found: insn[0],
        });
    }

    let displacement = i32::from_le_bytes([insn[1], insn[2], insn[3], insn[4]]);
    Ok(call_site
        .wrapping_add(REL32_INSN_LEN)
        .wrapping_add_signed(displacement as isize))
}

/// Branch patch redirecting `routine` to `hook`
pub fn build_patch(routine: usize, hook: usize) -> Result<[u8; PATCH_LEN], DetourError> {
    let displacement = rel32(routine.wrapping_add(REL32_INSN_LEN), hook)?.to_le_bytes();
    Ok([
        JMP_REL32,
        displacement[0],
        displacement[1],
        displacement[2],
        displacement[3],
        NOP,
    ])
}

// ============================================================================
// Patch Window
// ============================================================================

/// Scoped permission to write kernel code
///
/// Opening the window clears CR0.WP and then raises IRQL to DISPATCH_LEVEL
/// so the write cannot be preempted halfway. Dropping it lowers IRQL and
/// restores CR0.WP, in that order, whatever path the caller leaves by.
pub struct PatchWindow<'a, P: PatchAccess> {
    access: &'a mut P,
    write_protect: bool,
    old_irql: Kirql,
}

impl<'a, P: PatchAccess> PatchWindow<'a, P> {
    pub fn open(access: &'a mut P) -> Self {
        let write_protect = access.disable_write_protect();
        let old_irql = access.raise_irql_to_dpc_level();
        Self {
            access,
            write_protect,
            old_irql,
        }
    }

    /// Write bytes through the open window
    ///
    /// # Safety
    /// Same contract as [`PatchAccess::write_code`], minus write protection.
    pub unsafe fn write(&mut self, address: usize, bytes: &[u8]) {
        self.access.write_code(address, bytes);
    }
}

impl<P: PatchAccess> Drop for PatchWindow<'_, P> {
    fn drop(&mut self) {
        self.access.lower_irql(self.old_irql);
        self.access.restore_write_protect(self.write_protect);
    }
}

// ============================================================================
// Switch Routine Hook
// ============================================================================

/// Addresses the trampoline needs to finish the overwritten instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetourTargets {
    /// Incoming-thread byte field the replayed compare tests
    pub replay_field: usize,
    /// Where the replayed branch goes when the field is zero
    pub taken: usize,
    /// First instruction after the patch
    pub resume: usize,
}

/// The detour on the thread-switch routine
#[derive(Debug)]
pub struct SwitchRoutineHook {
    routine: usize,
    profile: SwitchRoutineProfile,
    original: [u8; PATCH_LEN],
    patch: Option<[u8; PATCH_LEN]>,
}

impl SwitchRoutineHook {
    /// Find the switch routine from its exported caller and verify it
    ///
    /// # Safety
    /// `locator` must be the address of `profile.locator` in mapped kernel
    /// code.
    pub unsafe fn locate<P: PatchAccess>(
        mem: &mut P,
        locator: usize,
        profile: &SwitchRoutineProfile,
    ) -> Result<Self, DetourError> {
        let routine = resolve_call(mem, locator.wrapping_add(profile.call_offset))?;

        let mut original = [0u8; PATCH_LEN];
        mem.read_code(routine, &mut original);
        if original != profile.prologue {
            return Err(DetourError::PrologueMismatch {
                address: routine,
                found: original,
            });
        }

        Ok(Self {
            routine,
            profile: *profile,
            original,
            patch: None,
        })
    }

    /// Address of the switch routine
    pub fn routine(&self) -> usize {
        self.routine
    }

    /// The bytes the patch replaces
    pub fn original_bytes(&self) -> [u8; PATCH_LEN] {
        self.original
    }

    pub fn is_installed(&self) -> bool {
        self.patch.is_some()
    }

    /// Continuation data for the trampoline
    ///
    /// Publish these before calling [`install`](Self::install): the hook
    /// can run the moment the patch lands.
    pub fn targets(&self) -> DetourTargets {
        DetourTargets {
            replay_field: self.profile.replay_field,
            taken: self.routine.wrapping_add(self.profile.replay_taken),
            resume: self.routine.wrapping_add(PATCH_LEN),
        }
    }

    /// Redirect the switch routine to `hook`
    ///
    /// # Safety
    /// `hook` must be a trampoline honouring [`targets`](Self::targets).
    pub unsafe fn install<P: PatchAccess>(&mut self, mem: &mut P, hook: usize) -> Result<(), DetourError> {
        if self.patch.is_some() {
            return Err(DetourError::AlreadyInstalled);
        }

        let patch = build_patch(self.routine, hook)?;

        // The routine may have been patched by someone else since locate()
        let mut current = [0u8; PATCH_LEN];
        mem.read_code(self.routine, &mut current);
        if current != self.original {
            return Err(DetourError::PrologueMismatch {
                address: self.routine,
                found: current,
            });
        }

        let mut window = PatchWindow::open(mem);
        window.write(self.routine, &patch);
        drop(window);

        self.patch = Some(patch);
        Ok(())
    }

    /// Put the original bytes back
    ///
    /// # Safety
    /// The trampoline must stay mapped until no thread can be inside it.
    pub unsafe fn uninstall<P: PatchAccess>(&mut self, mem: &mut P) {
        if self.patch.take().is_none() {
            return;
        }

        let mut window = PatchWindow::open(mem);
        window.write(self.routine, &self.original);
    }
}
