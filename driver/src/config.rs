//! Static configuration
//!
//! Everything here is fixed when the driver is built. There is no runtime
//! control path: to measure something else, change the constants and
//! rebuild.
//!
//! - Trigger mode: threshold PMIs by default, software-trap polling with
//!   the `polling` feature
//! - Threshold: negative bias loaded into fixed counter 0 so it overflows
//!   after `-PMI_THRESHOLD` retired instructions
//! - Events: the four programmable counter selectors
//! - Target: image name of the process to measure
//! - Capacity and output location of the sample log

use core::fmt;

use crate::hal::idt::vector;
use crate::hal::msreg::{events, EventSelector};

/// Process to measure
pub const TARGET_IMAGE: &str = "test.exe";

/// Instructions between two threshold PMIs, as a negative counter bias
pub const PMI_THRESHOLD: i32 = -50_000;

/// Programmable counter events (PMC0..PMC3)
pub const EVENT_SELECTORS: [EventSelector; 4] = [
    events::BRANCHES_RETIRED,
    events::BRANCH_MISSES_RETIRED,
    events::LLC_REFERENCES,
    events::LLC_MISSES,
];

/// Samples kept in memory until unload
pub const MAX_SAMPLES: usize = 1_000_000;

/// Sample log written at unload
pub const OUTPUT_PATH: &str = r"\DosDevices\C:\hpcoutput.csv";

/// Trigger mode selected at build time
#[cfg(not(feature = "polling"))]
pub const MODE: TriggerMode = TriggerMode::Threshold {
    bias: PMI_THRESHOLD,
};

/// Trigger mode selected at build time
#[cfg(feature = "polling")]
pub const MODE: TriggerMode = TriggerMode::Polling;

/// What produces a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Fixed counter 0 is preloaded with a negative bias and the overflow
    /// PMI takes the sample
    Threshold { bias: i32 },
    /// The instrumented program raises a software trap to take the sample
    Polling,
}

impl TriggerMode {
    /// IDT vector the mode hooks
    pub const fn vector(self) -> u8 {
        match self {
            TriggerMode::Threshold { .. } => vector::PMI,
            TriggerMode::Polling => vector::SOFTWARE_TRAP,
        }
    }

    pub const fn is_polling(self) -> bool {
        matches!(self, TriggerMode::Polling)
    }
}

/// Complete driver configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub mode: TriggerMode,
    pub events: [EventSelector; 4],
    pub target: &'static str,
    pub max_samples: usize,
    pub output_path: &'static str,
    /// In polling mode, let the first trap only open the measurement window
    pub poll_start_marker: bool,
}

/// Configuration compiled into the driver
pub const BUILD: MonitorConfig = MonitorConfig::build();

impl MonitorConfig {
    /// The configuration described by this module's constants
    pub const fn build() -> Self {
        Self {
            mode: MODE,
            events: EVENT_SELECTORS,
            target: TARGET_IMAGE,
            max_samples: MAX_SAMPLES,
            output_path: OUTPUT_PATH,
            poll_start_marker: true,
        }
    }

    /// Check the configuration against a process name field width
    pub fn validate(&self, image_name_len: usize) -> Result<(), ConfigError> {
        if self.target.is_empty() {
            return Err(ConfigError::EmptyTarget);
        }
        if self.target.len() > image_name_len {
            return Err(ConfigError::TargetTooLong {
                len: self.target.len(),
                max: image_name_len,
            });
        }
        if self.max_samples == 0 {
            return Err(ConfigError::NoSampleCapacity);
        }
        if let TriggerMode::Threshold { bias } = self.mode {
            if bias >= 0 {
                return Err(ConfigError::NonNegativeThreshold(bias));
            }
        }
        if let Some(slot) = self.events.iter().position(|sel| !sel.is_enabled()) {
            return Err(ConfigError::DisabledSelector { slot });
        }
        if self.output_path.is_empty() {
            return Err(ConfigError::NoOutputPath);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    EmptyTarget,
    TargetTooLong { len: usize, max: usize },
    NoSampleCapacity,
    NonNegativeThreshold(i32),
    DisabledSelector { slot: usize },
    NoOutputPath,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyTarget => write!(f, "target image name is empty"),
            ConfigError::TargetTooLong { len, max } => {
                write!(f, "target image name is {} bytes, field holds {}", len, max)
            }
            ConfigError::NoSampleCapacity => write!(f, "sample capacity is zero"),
            ConfigError::NonNegativeThreshold(bias) => {
                write!(f, "threshold {} must be negative", bias)
            }
            ConfigError::DisabledSelector { slot } => {
                write!(f, "event selector {} lacks the enable bit", slot)
            }
            ConfigError::NoOutputPath => write!(f, "output path is empty"),
        }
    }
}
