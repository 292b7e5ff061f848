//! Performance counter attribution
//!
//! - **counters** - the save/restore/sample state machine over the bank
//! - **sample** - the preallocated sample table
//! - **csv** - the sample log written at teardown

pub mod counters;
pub mod csv;
pub mod sample;

pub use counters::{CounterError, CounterState, CounterStateMachine, EventOutcome, BANK, BANK_SIZE};
pub use csv::{export_samples, OutputError, OutputSink};
pub use sample::{BufferAllocError, Sample, SampleBuffer};
