//! Sample storage
//!
//! Samples are appended from interrupt context, where growing an allocation
//! is not an option. The buffer is allocated once at install time with its
//! final capacity and only ever written in place; once full, further
//! samples are dropped and counted.

use alloc::vec::Vec;
use core::fmt;

use super::counters::BANK_SIZE;

/// One measurement window: the seven counters in bank order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample(pub [u64; BANK_SIZE]);

impl Sample {
    pub const fn values(&self) -> &[u64; BANK_SIZE] {
        &self.0
    }
}

/// Sample buffer allocation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAllocError {
    pub capacity: usize,
}

impl fmt::Display for BufferAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot allocate room for {} samples", self.capacity)
    }
}

/// Fixed-capacity, append-only sample table
pub struct SampleBuffer {
    samples: Vec<Sample>,
    capacity: usize,
    dropped: u64,
}

impl SampleBuffer {
    /// Allocate the whole table up front
    pub fn with_capacity(capacity: usize) -> Result<Self, BufferAllocError> {
        let mut samples = Vec::new();
        samples
            .try_reserve_exact(capacity)
            .map_err(|_| BufferAllocError { capacity })?;
        Ok(Self {
            samples,
            capacity,
            dropped: 0,
        })
    }

    /// Append a sample, or drop it if the table is full
    ///
    /// Returns whether the sample was stored. Never reallocates.
    pub fn push(&mut self, sample: Sample) -> bool {
        if self.samples.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.samples.push(sample);
        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples discarded because the table was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Sample> {
        self.samples.iter()
    }
}

impl fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("len", &self.samples.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped)
            .finish()
    }
}
