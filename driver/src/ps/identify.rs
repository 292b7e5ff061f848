//! Thread -> process identification
//!
//! At every thread switch the kernel hands us the outgoing and incoming
//! KTHREAD. Each one is mapped to its owning process through
//!
//! ```text
//! KTHREAD + layout.thread_process  -> EPROCESS*
//! EPROCESS + layout.image_name     -> UCHAR ImageFileName[image_name_len]
//! ```
//!
//! and the image name is compared, case-sensitively, with the target.
//! The structures are only borrowed for the duration of the switch.

use alloc::vec::Vec;
use core::fmt;
use core::ptr;

use crate::profile::StructureLayout;

/// Longest image name the identifier can hold
pub const MAX_IMAGE_NAME: usize = 16;

/// Identification errors
///
/// All of them abort only the current switch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyError {
    /// The switch routine passed a null thread
    NullThread,
    /// The thread has no owning process
    NoOwningProcess,
    /// The scratch copy of the image name could not be allocated
    OutOfMemory,
}

impl fmt::Display for IdentifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifyError::NullThread => write!(f, "null thread"),
            IdentifyError::NoOwningProcess => write!(f, "thread has no owning process"),
            IdentifyError::OutOfMemory => write!(f, "out of memory copying image name"),
        }
    }
}

/// Source of the image name copy made for each lookup
///
/// Returns an empty vector with room for at least `capacity` bytes, or
/// `None` when memory is short.
pub type ScratchAlloc = fn(capacity: usize) -> Option<Vec<u8>>;

/// Scratch from the global allocator, failing instead of aborting
pub fn heap_scratch(capacity: usize) -> Option<Vec<u8>> {
    let mut scratch = Vec::new();
    scratch.try_reserve_exact(capacity).ok()?;
    Some(scratch)
}

/// Which side of a switch belongs to the target process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchParties {
    pub outgoing: bool,
    pub incoming: bool,
}

/// Decides whether a thread belongs to the target process
#[derive(Clone, Copy)]
pub struct ProcessIdentifier {
    layout: StructureLayout,
    target: [u8; MAX_IMAGE_NAME],
    target_len: usize,
    scratch: ScratchAlloc,
}

impl ProcessIdentifier {
    /// Identifier for `target`, clipped to the image name field width
    pub fn new(layout: StructureLayout, target: &str) -> Self {
        let width = layout.image_name_len.min(MAX_IMAGE_NAME);
        let bytes = target.as_bytes();
        let target_len = bytes.len().min(width);

        let mut name = [0u8; MAX_IMAGE_NAME];
        name[..target_len].copy_from_slice(&bytes[..target_len]);

        Self {
            layout,
            target: name,
            target_len,
            scratch: heap_scratch,
        }
    }

    /// Take image name copies from `scratch` instead of the heap
    pub fn with_scratch(mut self, scratch: ScratchAlloc) -> Self {
        self.scratch = scratch;
        self
    }

    /// Target name as it will be compared
    pub fn target(&self) -> &[u8] {
        &self.target[..self.target_len]
    }

    /// Copy a thread's process image name, up to its terminator
    ///
    /// # Safety
    /// `thread` must be null or point at a live KTHREAD matching the layout.
    pub unsafe fn image_name(&self, thread: *const u8) -> Result<Vec<u8>, IdentifyError> {
        if thread.is_null() {
            return Err(IdentifyError::NullThread);
        }

        let link = thread.add(self.layout.thread_process) as *const *const u8;
        let process = ptr::read_unaligned(link);
        if process.is_null() {
            return Err(IdentifyError::NoOwningProcess);
        }

        let width = self.layout.image_name_len.min(MAX_IMAGE_NAME);
        let mut name = (self.scratch)(width).ok_or(IdentifyError::OutOfMemory)?;
        name.clear();

        let field = process.add(self.layout.image_name);
        for i in 0..width {
            let byte = ptr::read(field.add(i));
            if byte == 0 {
                break;
            }
            name.push(byte);
        }

        Ok(name)
    }

    /// Whether `thread` belongs to the target process
    ///
    /// # Safety
    /// Same contract as [`image_name`](Self::image_name).
    pub unsafe fn identify(&self, thread: *const u8) -> Result<bool, IdentifyError> {
        let name = self.image_name(thread)?;
        Ok(name.as_slice() == self.target())
    }

    /// Identify both sides of a switch before anything acts on either
    ///
    /// # Safety
    /// Same contract as [`image_name`](Self::image_name), for both threads.
    pub unsafe fn classify(
        &self,
        outgoing: *const u8,
        incoming: *const u8,
    ) -> Result<SwitchParties, IdentifyError> {
        Ok(SwitchParties {
            outgoing: self.identify(outgoing)?,
            incoming: self.identify(incoming)?,
        })
    }
}

impl fmt::Debug for ProcessIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIdentifier")
            .field("layout", &self.layout)
            .field("target", &core::str::from_utf8(self.target()).unwrap_or("?"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::WIN7_SP1_X86;
    use crate::sim::{FakeProcess, FakeThread};

    const LAYOUT: StructureLayout = WIN7_SP1_X86.layout;

    #[test]
    fn test_identifies_target() {
        let ident = ProcessIdentifier::new(LAYOUT, "test.exe");
        let target = FakeProcess::new(&LAYOUT, "test.exe");
        let other = FakeProcess::new(&LAYOUT, "explorer.exe");
        let t1 = FakeThread::new(&LAYOUT, &target);
        let t2 = FakeThread::new(&LAYOUT, &other);

        unsafe {
            assert_eq!(ident.image_name(t1.as_ptr()).unwrap(), b"test.exe");
            assert!(ident.identify(t1.as_ptr()).unwrap());
            assert!(!ident.identify(t2.as_ptr()).unwrap());
            assert_eq!(
                ident.classify(t2.as_ptr(), t1.as_ptr()).unwrap(),
                SwitchParties {
                    outgoing: false,
                    incoming: true
                }
            );
        }
    }

    #[test]
    fn test_case_sensitive() {
        let ident = ProcessIdentifier::new(LAYOUT, "test.exe");
        let process = FakeProcess::new(&LAYOUT, "TEST.EXE");
        let thread = FakeThread::new(&LAYOUT, &process);
        assert!(!unsafe { ident.identify(thread.as_ptr()) }.unwrap());
    }

    #[test]
    fn test_name_clipped_to_field_width() {
        // ImageFileName holds 15 characters; longer names are stored clipped
        let ident = ProcessIdentifier::new(LAYOUT, "averyveryverylongname.exe");
        assert_eq!(ident.target(), b"averyveryverylo");

        let process = FakeProcess::new(&LAYOUT, "averyveryverylongname.exe");
        let thread = FakeThread::new(&LAYOUT, &process);
        assert!(unsafe { ident.identify(thread.as_ptr()) }.unwrap());
    }

    #[test]
    fn test_prefix_is_not_a_match() {
        let ident = ProcessIdentifier::new(LAYOUT, "test.exe");
        let process = FakeProcess::new(&LAYOUT, "test.exe2");
        let thread = FakeThread::new(&LAYOUT, &process);
        assert!(!unsafe { ident.identify(thread.as_ptr()) }.unwrap());
    }

    #[test]
    fn test_scratch_exhaustion() {
        fn no_memory(_capacity: usize) -> Option<Vec<u8>> {
            None
        }

        let ident = ProcessIdentifier::new(LAYOUT, "test.exe").with_scratch(no_memory);
        let process = FakeProcess::new(&LAYOUT, "test.exe");
        let thread = FakeThread::new(&LAYOUT, &process);
        unsafe {
            assert_eq!(ident.image_name(thread.as_ptr()), Err(IdentifyError::OutOfMemory));
            assert_eq!(ident.identify(thread.as_ptr()), Err(IdentifyError::OutOfMemory));
        }
    }

    #[test]
    fn test_null_pointers() {
        let ident = ProcessIdentifier::new(LAYOUT, "test.exe");
        let orphan = FakeThread::orphan(&LAYOUT);
        unsafe {
            assert_eq!(ident.identify(core::ptr::null()), Err(IdentifyError::NullThread));
            assert_eq!(ident.identify(orphan.as_ptr()), Err(IdentifyError::NoOwningProcess));
        }
    }
}
