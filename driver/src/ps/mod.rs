//! Process identification for switch events

pub mod identify;

pub use identify::{heap_scratch, IdentifyError, ProcessIdentifier, ScratchAlloc, SwitchParties};
